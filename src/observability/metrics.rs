//! Metrics collection using metrics-rs.

use crate::params::MemType;
use metrics::{Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const SURFACES_CREATED: &str = "bufsurface_surfaces_created";
const SURFACES_DESTROYED: &str = "bufsurface_surfaces_destroyed";
const BYTES_ALLOCATED: &str = "bufsurface_bytes_allocated";
const POOL_BLOCKS_AVAILABLE: &str = "bufsurface_pool_blocks_available";
const ALLOC_FAILURES: &str = "bufsurface_alloc_failures";
const COPIES: &str = "bufsurface_copies";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        SURFACES_CREATED,
        Unit::Count,
        "Total number of surfaces handed out"
    );
    metrics::describe_counter!(
        SURFACES_DESTROYED,
        Unit::Count,
        "Total number of surfaces released"
    );
    metrics::describe_counter!(
        BYTES_ALLOCATED,
        Unit::Bytes,
        "Bytes reserved from allocator backends"
    );
    metrics::describe_gauge!(
        POOL_BLOCKS_AVAILABLE,
        Unit::Count,
        "Pool blocks available for allocation, by memory kind"
    );
    metrics::describe_counter!(
        ALLOC_FAILURES,
        Unit::Count,
        "Block allocations refused by a backend or pool"
    );
    metrics::describe_counter!(COPIES, Unit::Count, "Surface-to-surface copies");
}

/// Record a surface handed out.
#[inline]
pub fn record_surface_created(mem_type: MemType) {
    counter!(SURFACES_CREATED, "mem_type" => mem_type.label()).increment(1);
}

/// Record a surface released.
#[inline]
pub fn record_surface_destroyed() {
    counter!(SURFACES_DESTROYED).increment(1);
}

/// Record bytes reserved from a backend.
#[inline]
pub fn record_bytes_allocated(bytes: usize) {
    counter!(BYTES_ALLOCATED).increment(bytes as u64);
}

/// Record a refused allocation.
#[inline]
pub fn record_alloc_failure(mem_type: MemType) {
    counter!(ALLOC_FAILURES, "mem_type" => mem_type.label()).increment(1);
}

/// Adjust the available-block gauge of `mem_type` pools by `delta`.
#[inline]
pub fn record_pool_blocks(mem_type: MemType, delta: i64) {
    let available = gauge!(POOL_BLOCKS_AVAILABLE, "mem_type" => mem_type.label());
    if delta >= 0 {
        available.increment(delta as f64);
    } else {
        available.decrement(delta.unsigned_abs() as f64);
    }
}

/// Record one surface copy.
#[inline]
pub fn record_copy(src: MemType, dst: MemType) {
    counter!(COPIES, "src" => src.label(), "dst" => dst.label()).increment(1);
}
