//! Integration tests for pool-backed surface wrappers.

use bufsurface::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn buf_pool(config: SimulatedConfig, params: &CreateParams, blocks: u32) -> (Arc<SimulatedRuntime>, BufPool) {
    let sim = Arc::new(SimulatedRuntime::new(config));
    let ctx = BufSurfaceContext::new(sim.clone());
    let pool = BufPool::new(&ctx);
    pool.create_pool(params, blocks).unwrap();
    (sim, pool)
}

#[test]
fn test_device_plane_upload() {
    let params = CreateParams::frame(MemType::Device, 64, 32, ColorFormat::Nv12).with_batch_size(2);
    let (sim, pool) = buf_pool(SimulatedConfig::discrete(), &params, 2);
    let wrapper = pool.get_surface_wrapper(Duration::ZERO).unwrap();
    assert_eq!(wrapper.mem_type(), MemType::Device);
    assert!(wrapper.mapped_data(0, 0).is_none());

    wrapper
        .map_host(0, Select::Index(1), |uv| uv.fill(0x42))
        .unwrap();
    wrapper.sync_host_to_device(Select::Index(0)).unwrap();

    let slot = wrapper.surface_params(0).unwrap();
    let uv = *slot.plane_params().plane(1).unwrap();
    let device = sim
        .read_device(slot.data_ptr().offset(uv.offset as usize), uv.psize as usize)
        .unwrap();
    assert!(device.iter().all(|&b| b == 0x42));

    let other = sim
        .read_device(wrapper.surface_params(1).unwrap().data_ptr(), 16)
        .unwrap();
    assert!(other.iter().all(|&b| b == 0));
}

#[test]
fn test_dropped_wrapper_returns_block() {
    let params = CreateParams::sized(MemType::System, 1024);
    let (_, pool) = buf_pool(SimulatedConfig::unified(), &params, 1);

    let wrapper = pool.get_surface_wrapper(Duration::ZERO).unwrap();
    assert_eq!(pool.pool().unwrap().stats().in_flight, 1);
    drop(wrapper);

    let again = pool.get_surface_wrapper(Duration::ZERO).unwrap();
    assert!(again.has_surface());
}

#[test]
fn test_wrapper_shared_across_threads() {
    let params = CreateParams::frame(MemType::Unified, 32, 32, ColorFormat::Gray8).with_batch_size(4);
    let (_, pool) = buf_pool(SimulatedConfig::unified(), &params, 1);
    let wrapper = pool.get_surface_wrapper(Duration::ZERO).unwrap();

    let workers: Vec<_> = (0..4u32)
        .map(|i| {
            let wrapper = Arc::clone(&wrapper);
            thread::spawn(move || {
                wrapper
                    .map_host(i, Select::All, |bytes| bytes.fill(i as u8 + 1))
                    .unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    wrapper.set_num_filled(4).unwrap();
    assert!(wrapper.set_num_filled(5).is_err());
    assert_eq!(wrapper.num_filled(), 4);
    for i in 0..4u32 {
        wrapper
            .map_host(i, Select::All, |bytes| {
                assert!(bytes.iter().all(|&b| b == i as u8 + 1));
            })
            .unwrap();
    }
}

#[test]
fn test_taken_surface_outlives_wrapper() {
    let params = CreateParams::sized(MemType::System, 64);
    let (_, pool) = buf_pool(SimulatedConfig::unified(), &params, 1);
    let wrapper = pool.get_surface_wrapper(Duration::ZERO).unwrap();
    wrapper.set_pts(90);

    let surface = wrapper.take_surface().unwrap();
    drop(wrapper);
    assert_eq!(surface.pts(), 90);
    assert_eq!(pool.pool().unwrap().stats().in_flight, 1);

    drop(surface);
    assert_eq!(pool.pool().unwrap().stats().in_flight, 0);
}
