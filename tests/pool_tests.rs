//! Integration tests for pool capacity and teardown.

use bufsurface::prelude::*;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Route crate logs to the test output; `RUST_LOG=bufsurface=debug` shows
/// pool teardown.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn context(config: SimulatedConfig) -> (Arc<SimulatedRuntime>, BufSurfaceContext) {
    init_tracing();
    let sim = Arc::new(SimulatedRuntime::new(config));
    let ctx = BufSurfaceContext::new(sim.clone());
    (sim, ctx)
}

// ============================================================================
// Capacity
// ============================================================================

/// A default NV12 1080p pool on a unified platform holds exactly its
/// block count.
#[test]
fn test_unified_pool_capacity() {
    let (_, ctx) = context(SimulatedConfig::unified());
    let params = CreateParams::frame(MemType::Default, 1920, 1080, ColorFormat::Nv12);
    let pool = ctx.pool_create(&params, 6).unwrap();
    assert_eq!(pool.mem_type(), MemType::Unified);

    let surfaces: Vec<_> = (0..6).map(|_| ctx.create_from_pool(&pool).unwrap()).collect();
    assert!(matches!(
        ctx.create_from_pool(&pool),
        Err(Error::ResourceExhausted(_))
    ));
    assert_eq!(pool.stats().in_flight, 6);
    assert_eq!(pool.stats().failed_allocs, 1);

    for surface in surfaces {
        assert_eq!(surface.mem_type(), MemType::Unified);
        ctx.destroy(surface).unwrap();
    }
    assert_eq!(pool.stats().available, 6);
    ctx.pool_destroy(&pool).unwrap();
}

/// Blocks handed back are reused without touching the backend.
#[test]
fn test_blocks_are_recycled() {
    let (sim, ctx) = context(SimulatedConfig::discrete());
    let params = CreateParams::frame(MemType::Device, 320, 240, ColorFormat::Rgb);
    let pool = ctx.pool_create(&params, 2).unwrap();
    let live = sim.live_allocations();

    for _ in 0..10 {
        let surface = ctx.create_from_pool(&pool).unwrap();
        ctx.destroy(surface).unwrap();
    }
    assert_eq!(sim.live_allocations(), live);
    assert_eq!(pool.stats().total_allocs, 10);

    ctx.pool_destroy(&pool).unwrap();
    assert_eq!(sim.live_allocations(), 0);
    assert_eq!(sim.bytes_in_use(0), 0);
}

/// A pool that cannot be filled fails up front and leaves nothing behind.
#[test]
fn test_pool_larger_than_device_fails() {
    let (sim, ctx) = context(SimulatedConfig::discrete().with_memory_limit(1 << 20));
    let params = CreateParams::frame(MemType::Device, 640, 480, ColorFormat::Rgba);
    assert!(ctx.pool_create(&params, 8).is_err());
    assert_eq!(sim.live_allocations(), 0);
}

// ============================================================================
// Teardown
// ============================================================================

/// Destroy blocks until a surface held on another thread comes back, and
/// a second destroy is a no-op.
#[test]
fn test_destroy_waits_for_other_thread() {
    let (_, ctx) = context(SimulatedConfig::unified());
    let pool = ctx
        .pool_create(&CreateParams::sized(MemType::System, 4096), 2)
        .unwrap();

    let surface = ctx.create_from_pool(&pool).unwrap();
    let (tx, rx) = mpsc::channel();
    let holder = {
        let ctx = ctx.clone();
        thread::spawn(move || {
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
            ctx.destroy(surface).unwrap();
        })
    };

    rx.recv().unwrap();
    let start = Instant::now();
    ctx.pool_destroy(&pool).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(40));
    assert!(!pool.is_created());

    ctx.pool_destroy(&pool).unwrap();
    holder.join().unwrap();
}

/// The front end's timeout bounds busy retries, not the wait for
/// outstanding surfaces: destroy still returns only once they are back.
#[test]
fn test_buf_pool_timeout_does_not_bound_outstanding_wait() {
    let (_, ctx) = context(SimulatedConfig::unified());
    let buf_pool = BufPool::new(&ctx);
    buf_pool
        .create_pool(&CreateParams::sized(MemType::System, 256), 1)
        .unwrap();

    let wrapper = buf_pool.get_surface_wrapper(Duration::ZERO).unwrap();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(60));
        drop(wrapper);
    });

    let start = Instant::now();
    buf_pool.destroy_pool(Duration::from_millis(1)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(buf_pool.pool().is_none());
    releaser.join().unwrap();
}

/// A stopped front end rejects waiters at once.
#[test]
fn test_stop_rejects_waiters() {
    let (_, ctx) = context(SimulatedConfig::unified());
    let buf_pool = Arc::new(BufPool::new(&ctx));
    buf_pool
        .create_pool(&CreateParams::sized(MemType::System, 256), 1)
        .unwrap();
    buf_pool.destroy_pool(Duration::from_millis(100)).unwrap();

    let start = Instant::now();
    assert!(matches!(
        buf_pool.get_surface_wrapper(Duration::from_secs(10)),
        Err(Error::NotCreated)
    ));
    assert!(start.elapsed() < Duration::from_secs(1));
}

// ============================================================================
// Video-buffer pools
// ============================================================================

/// VB frees that the hardware reports busy are retried transparently.
#[test]
fn test_vb_busy_free_retried() {
    let (sim, ctx) = context(SimulatedConfig::unified());
    let params = CreateParams::frame(MemType::Vb, 256, 128, ColorFormat::Nv12);
    let pool = ctx.pool_create(&params, 2).unwrap();
    assert_eq!(sim.vb_pool_count(), 1);

    let surface = ctx.create_from_pool(&pool).unwrap();
    assert!(surface.vb_block().is_some());
    sim.inject_busy_vb_frees(3);
    ctx.destroy(surface).unwrap();
    assert_eq!(pool.stats().in_flight, 0);

    ctx.pool_destroy(&pool).unwrap();
    assert_eq!(sim.vb_pool_count(), 0);
}

/// VB pools are not available on discrete cards.
#[test]
fn test_vb_pool_needs_unified_platform() {
    let (_, ctx) = context(SimulatedConfig::discrete());
    let params = CreateParams::frame(MemType::Vb, 256, 128, ColorFormat::Nv12);
    assert!(ctx.pool_create(&params, 2).is_err());
}
