//! Tracing spans for pools and surfaces.

use crate::params::MemType;
use tracing::{Level, Span, span};

/// Create a span covering work on one memory pool.
///
/// # Example
///
/// ```rust
/// use bufsurface::observability::span_pool;
/// use bufsurface::MemType;
///
/// let span = span_pool(1, MemType::Unified, 0);
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_pool(pool_id: u64, mem_type: MemType, device_id: i32) -> Span {
    span!(Level::DEBUG, "pool", pool_id, mem_type = mem_type.label(), device_id)
}

/// Create a span covering an operation on one surface.
#[inline]
pub fn span_surface(op: &'static str, mem_type: MemType, batch_size: u32) -> Span {
    span!(Level::TRACE, "surface", op, mem_type = mem_type.label(), batch_size)
}
