//! C ABI conformance tests.
//!
//! Drive the exported entry points the way C callers do: out-pointers,
//! status codes and raw struct fields.

use bufsurface::BufSurfaceContext;
use bufsurface::ffi::*;
use bufsurface::{ColorFormat, MemType};
use std::ptr;

struct Ctx(*mut BufSurfaceContext);

impl Ctx {
    fn new(discrete: bool) -> Self {
        let mut ctx = ptr::null_mut();
        assert_eq!(unsafe { bufsurface_context_create(discrete, 1, &mut ctx) }, 0);
        assert!(!ctx.is_null());
        Ctx(ctx)
    }
}

impl Drop for Ctx {
    fn drop(&mut self) {
        assert_eq!(unsafe { bufsurface_context_destroy(self.0) }, 0);
    }
}

fn frame(mem_type: MemType, width: u32, height: u32, format: ColorFormat) -> RawCreateParams {
    RawCreateParams {
        mem_type: mem_type.as_raw(),
        width,
        height,
        color_format: format.as_raw(),
        ..Default::default()
    }
}

// ============================================================================
// Null handling
// ============================================================================

#[test]
fn test_null_arguments_fail() {
    let ctx = Ctx::new(false);
    let params = frame(MemType::System, 16, 16, ColorFormat::Gray8);
    let mut surf = ptr::null_mut();
    let mut pool = ptr::null_mut();

    unsafe {
        assert_eq!(bufsurface_context_create(false, 1, ptr::null_mut()), -1);
        assert_eq!(bufsurface_create(ptr::null(), &mut surf, &params), -1);
        assert_eq!(bufsurface_create(ctx.0, ptr::null_mut(), &params), -1);
        assert_eq!(bufsurface_create(ctx.0, &mut surf, ptr::null()), -1);
        assert_eq!(bufsurface_pool_create(ctx.0, &mut pool, ptr::null(), 2), -1);
        assert_eq!(bufsurface_create_from_pool(ctx.0, &mut surf, ptr::null_mut()), -1);
        assert_eq!(bufsurface_pool_destroy(ctx.0, ptr::null_mut()), -1);
        assert_eq!(bufsurface_destroy(ctx.0, ptr::null_mut()), -1);
        assert_eq!(bufsurface_sync_for_cpu(ctx.0, ptr::null_mut(), -1, -1), -1);
        assert_eq!(bufsurface_memset(ctx.0, ptr::null_mut(), -1, -1, 0), -1);
        assert_eq!(bufsurface_copy(ctx.0, ptr::null_mut(), ptr::null_mut()), -1);
        assert_eq!(bufsurface_context_destroy(ptr::null_mut()), 0);
    }
    assert!(surf.is_null());
    assert!(pool.is_null());
}

#[test]
fn test_invalid_params_fail() {
    let ctx = Ctx::new(false);
    let mut surf = ptr::null_mut();
    let bad_kind = RawCreateParams {
        mem_type: 99,
        size: 64,
        ..Default::default()
    };
    let zero_batch = RawCreateParams {
        batch_size: 0,
        ..frame(MemType::System, 16, 16, ColorFormat::Gray8)
    };
    unsafe {
        assert_eq!(bufsurface_create(ctx.0, &mut surf, &bad_kind), -1);
        assert_eq!(bufsurface_create(ctx.0, &mut surf, &zero_batch), -1);
    }
}

// ============================================================================
// Surfaces
// ============================================================================

#[test]
fn test_create_fills_descriptors() {
    let ctx = Ctx::new(false);
    let params = RawCreateParams {
        batch_size: 2,
        ..frame(MemType::Unified, 64, 32, ColorFormat::Nv12)
    };
    let mut surf = ptr::null_mut();
    unsafe {
        assert_eq!(bufsurface_create(ctx.0, &mut surf, &params), 0);
        let raw = &*surf;
        assert_eq!(raw.mem_type, MemType::Unified.as_raw());
        assert_eq!(raw.batch_size, 2);
        assert_eq!(raw.num_filled, 0);
        assert!(raw.is_contiguous);
        assert!(raw.opaque.is_null());

        let slots = std::slice::from_raw_parts(raw.surface_list, 2);
        assert_eq!(slots[0].width, 64);
        assert_eq!(slots[0].color_format, ColorFormat::Nv12.as_raw());
        assert_eq!(slots[0].plane_params.num_planes, 2);
        assert!(!slots[0].mapped_data_ptr.is_null());
        assert_eq!(
            slots[1].data_ptr as usize - slots[0].data_ptr as usize,
            slots[0].data_size as usize
        );
        assert_eq!(bufsurface_destroy(ctx.0, surf), 0);
    }
}

#[test]
fn test_memset_and_copy() {
    let ctx = Ctx::new(true);
    let params = frame(MemType::System, 32, 8, ColorFormat::Rgb);
    let device = frame(MemType::Device, 32, 8, ColorFormat::Rgb);
    let mut a = ptr::null_mut();
    let mut b = ptr::null_mut();
    let mut c = ptr::null_mut();

    unsafe {
        assert_eq!(bufsurface_create(ctx.0, &mut a, &params), 0);
        assert_eq!(bufsurface_create(ctx.0, &mut b, &device), 0);
        assert_eq!(bufsurface_create(ctx.0, &mut c, &params), 0);

        assert_eq!(bufsurface_memset(ctx.0, a, 0, -1, 0x5a), 0);
        assert_eq!(bufsurface_memset(ctx.0, a, 1, -1, 0x5a), -1);
        assert_eq!(bufsurface_memset(ctx.0, a, 0, 3, 0x5a), -1);

        (*a).pts = 77;
        assert_eq!(bufsurface_copy(ctx.0, a, b), 0);
        assert_eq!((*b).pts, 77);
        assert_eq!(bufsurface_copy(ctx.0, b, c), 0);
        assert_eq!(bufsurface_copy(ctx.0, c, c), 0);

        let slot = &*(*c).surface_list;
        let bytes = std::slice::from_raw_parts(slot.data_ptr.cast::<u8>(), slot.data_size as usize);
        assert!(bytes.iter().all(|&v| v == 0x5a));
        assert_eq!((*c).pts, 77);

        for surf in [a, b, c] {
            assert_eq!(bufsurface_destroy(ctx.0, surf), 0);
        }
    }
}

#[test]
fn test_sync_only_for_cached_memory() {
    let ctx = Ctx::new(false);
    let mut plain = ptr::null_mut();
    let mut cached = ptr::null_mut();
    unsafe {
        assert_eq!(
            bufsurface_create(ctx.0, &mut plain, &frame(MemType::Unified, 16, 16, ColorFormat::Gray8)),
            0
        );
        assert_eq!(
            bufsurface_create(
                ctx.0,
                &mut cached,
                &frame(MemType::UnifiedCached, 16, 16, ColorFormat::Gray8)
            ),
            0
        );
        assert_eq!(bufsurface_sync_for_cpu(ctx.0, plain, -1, -1), -1);
        assert_eq!(bufsurface_sync_for_cpu(ctx.0, cached, -1, -1), 0);
        assert_eq!(bufsurface_sync_for_device(ctx.0, cached, 0, 0), 0);
        assert_eq!(bufsurface_sync_for_device(ctx.0, cached, -2, 0), -1);
        assert_eq!(bufsurface_destroy(ctx.0, plain), 0);
        assert_eq!(bufsurface_destroy(ctx.0, cached), 0);
    }
}

#[test]
fn test_num_filled_written_by_caller() {
    let ctx = Ctx::new(false);
    let params = RawCreateParams {
        batch_size: 2,
        ..frame(MemType::System, 16, 16, ColorFormat::Gray8)
    };
    let mut surf = ptr::null_mut();
    unsafe {
        assert_eq!(bufsurface_create(ctx.0, &mut surf, &params), 0);
        (*surf).num_filled = 3;
        assert_eq!(bufsurface_memset(ctx.0, surf, -1, -1, 1), -1);
        (*surf).num_filled = 2;
        assert_eq!(bufsurface_memset(ctx.0, surf, -1, -1, 1), 0);
        assert_eq!(bufsurface_destroy(ctx.0, surf), 0);
    }
}

// ============================================================================
// Pools
// ============================================================================

#[test]
fn test_pool_lifecycle() {
    let ctx = Ctx::new(false);
    let params = frame(MemType::Default, 1920, 1080, ColorFormat::Nv12);
    let mut pool = ptr::null_mut();
    unsafe {
        assert_eq!(bufsurface_pool_create(ctx.0, &mut pool, &params, 6), 0);
        let mut surfaces = Vec::new();
        for _ in 0..6 {
            let mut surf = ptr::null_mut();
            assert_eq!(bufsurface_create_from_pool(ctx.0, &mut surf, pool), 0);
            assert_eq!((*surf).mem_type, MemType::Unified.as_raw());
            assert_eq!((*surf).opaque, pool);
            surfaces.push(surf);
        }
        let mut extra = ptr::null_mut();
        assert_eq!(bufsurface_create_from_pool(ctx.0, &mut extra, pool), -1);
        assert!(extra.is_null());

        // The back-reference is the pool handle itself.
        let back = (*surfaces[0]).opaque;
        assert_eq!(bufsurface_destroy(ctx.0, surfaces.remove(0)), 0);
        let mut again = ptr::null_mut();
        assert_eq!(bufsurface_create_from_pool(ctx.0, &mut again, back), 0);
        surfaces.push(again);

        for surf in surfaces {
            assert_eq!(bufsurface_destroy(ctx.0, surf), 0);
        }
        assert_eq!(bufsurface_pool_destroy(ctx.0, pool), 0);
    }
}

#[test]
fn test_zero_block_pool_rejected() {
    let ctx = Ctx::new(false);
    let params = frame(MemType::System, 16, 16, ColorFormat::Gray8);
    let mut pool = ptr::null_mut();
    assert_eq!(unsafe { bufsurface_pool_create(ctx.0, &mut pool, &params, 0) }, -1);
    assert!(pool.is_null());
}
