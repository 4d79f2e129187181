//! # bufsurface
//!
//! Batched frame-buffer memory for accelerator pipelines.
//!
//! A [`Surface`](surface::Surface) is a batch of equally sized slots, each
//! describing one frame or raw blob: geometry, pixel format, per-plane
//! layout and the address of its bytes. Surfaces come from one of several
//! memory kinds (system heap, pinned host, device, unified, hardware video
//! buffers), either one at a time or from a fixed-capacity
//! [`MemPool`](pool::MemPool).
//!
//! ## Features
//!
//! - **One API for all memory kinds**: allocation, cache maintenance, fills
//!   and copies dispatch on the surface's memory kind
//! - **Fixed-capacity pools**: blocks are preallocated and recycled; pool
//!   teardown waits for outstanding surfaces
//! - **Retrying front end**: [`BufPool`] hands out shared
//!   [`SurfaceWrapper`](wrapper::SurfaceWrapper)s with bounded backoff
//! - **C ABI**: the [`ffi`] module exposes the classic status-code API
//! - **Pluggable platform**: everything device-specific goes through
//!   [`DeviceRuntime`](platform::DeviceRuntime)
//!
//! ## Quick Start
//!
//! ```rust
//! use bufsurface::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let ctx = BufSurfaceContext::new(Arc::new(SimulatedRuntime::new(SimulatedConfig::unified())));
//! let pool = BufPool::new(&ctx);
//! pool.create_pool(&CreateParams::frame(MemType::Default, 640, 480, ColorFormat::Nv12), 4)?;
//!
//! let wrapper = pool.get_surface_wrapper(Duration::from_millis(100))?;
//! wrapper.set_pts(33);
//! drop(wrapper);
//!
//! pool.destroy_pool(Duration::from_millis(100))?;
//! # Ok::<(), bufsurface::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod allocator;
pub mod buf_pool;
pub mod config;
pub mod context;
pub mod error;
pub mod ffi;
pub mod format;
pub mod memory;
pub mod observability;
pub mod params;
pub mod platform;
pub mod pool;
pub mod surface;
pub mod wrapper;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buf_pool::BufPool;
    pub use crate::config::{ContextConfig, RetryConfig};
    pub use crate::context::BufSurfaceContext;
    pub use crate::error::{Error, Result};
    pub use crate::format::{ColorFormat, PlaneInfo, PlaneLayout};
    pub use crate::params::{CreateParams, MemType, Select};
    pub use crate::platform::{DeviceRuntime, SimulatedConfig, SimulatedRuntime};
    pub use crate::pool::{MemPool, PoolStats};
    pub use crate::surface::{SlotParams, Surface, SurfaceView};
    pub use crate::wrapper::{SurfaceWrapper, SurfaceWrapperPtr};
}

pub use buf_pool::BufPool;
pub use context::BufSurfaceContext;
pub use error::{Error, Result};
pub use format::ColorFormat;
pub use params::{CreateParams, MemType};
