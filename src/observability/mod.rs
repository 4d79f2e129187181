//! Observability: metrics and tracing.
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `bufsurface_surfaces_created` | Counter | Surfaces handed out, by memory kind |
//! | `bufsurface_surfaces_destroyed` | Counter | Surfaces released |
//! | `bufsurface_bytes_allocated` | Counter | Bytes reserved from backends |
//! | `bufsurface_pool_blocks_available` | Gauge | Pool blocks available, by memory kind |
//! | `bufsurface_alloc_failures` | Counter | Refused allocations, by memory kind |
//! | `bufsurface_copies` | Counter | Surface copies, by source/destination kind |
//!
//! Nothing is exported unless the host installs a `metrics` recorder.
//!
//! ## Tracing
//!
//! Pool creation and teardown run inside a [`span_pool`] span; copies and
//! fills inside [`span_surface`].

mod metrics;
mod tracing_support;

pub use metrics::{
    init_metrics, record_alloc_failure, record_bytes_allocated, record_copy,
    record_pool_blocks, record_surface_created, record_surface_destroyed,
};
pub use tracing_support::{span_pool, span_surface};
