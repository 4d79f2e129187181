//! C ABI.
//!
//! Mirrors the classic buffer-surface C API: every entry point returns `0`
//! on success and `-1` on failure, and the structures carry reserved
//! padding so fields can be added without breaking binary compatibility.
//! Each call takes the context handle explicitly.
//!
//! Surfaces are handed out as `*mut RawSurface`. C code may update
//! `num_filled` and `pts` in place; they are read back on the next call
//! that takes the surface. Every other field is informational.
//!
//! Panics never cross the boundary: they are caught and reported as `-1`.

use crate::context::BufSurfaceContext;
use crate::error::{Error, Result};
use crate::format::{ColorFormat, MAX_PLANES, PlaneLayout};
use crate::params::{CreateParams, MemType, Select};
use crate::platform::{SimulatedConfig, SimulatedRuntime};
use crate::pool::MemPool;
use crate::surface::{SlotParams, Surface};
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::Arc;
use tracing::error;

/// Reserved pointer slots at the end of each structure.
pub const PADDING_LENGTH: usize = 4;

/// Per-plane layout, one array entry per plane.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawPlaneParams {
    /// Number of valid entries.
    pub num_planes: u32,
    /// Plane widths in pixels.
    pub width: [u32; MAX_PLANES],
    /// Plane heights in rows.
    pub height: [u32; MAX_PLANES],
    /// Row strides in bytes.
    pub pitch: [u32; MAX_PLANES],
    /// Byte offsets from the start of the slot.
    pub offset: [u32; MAX_PLANES],
    /// Plane sizes in bytes, padding included.
    pub psize: [u32; MAX_PLANES],
    /// Bytes per pixel.
    pub bytes_per_pix: [u32; MAX_PLANES],
    /// Reserved.
    pub _reserved: [*mut c_void; PADDING_LENGTH * MAX_PLANES],
}

/// Creation parameters.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawCreateParams {
    /// [`MemType`] discriminant.
    pub mem_type: i32,
    /// Device id.
    pub device_id: u32,
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// [`ColorFormat`] discriminant.
    pub color_format: i32,
    /// Explicit bytes per slot; overrides the geometry when non-zero.
    pub size: u32,
    /// Slots per surface.
    pub batch_size: u32,
    /// Disable padding.
    pub force_align_1: bool,
    /// Reserved.
    pub _reserved: [*mut c_void; PADDING_LENGTH],
}

impl Default for RawCreateParams {
    fn default() -> Self {
        Self {
            mem_type: MemType::Default.as_raw(),
            device_id: 0,
            width: 0,
            height: 0,
            color_format: ColorFormat::Invalid.as_raw(),
            size: 0,
            batch_size: 1,
            force_align_1: false,
            _reserved: [ptr::null_mut(); PADDING_LENGTH],
        }
    }
}

/// One slot of a surface.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawSurfaceParams {
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Row stride of the first plane.
    pub pitch: u32,
    /// [`ColorFormat`] discriminant.
    pub color_format: i32,
    /// Bytes in the slot.
    pub data_size: u32,
    /// Native address.
    pub data_ptr: *mut c_void,
    /// Host mapping (unified and VB memory), otherwise null.
    pub mapped_data_ptr: *mut c_void,
    /// Plane layout.
    pub plane_params: RawPlaneParams,
    /// Reserved.
    pub _reserved: [*mut c_void; PADDING_LENGTH],
}

/// A batch of slots.
#[repr(C)]
#[derive(Debug)]
pub struct RawSurface {
    /// [`MemType`] discriminant.
    pub mem_type: i32,
    /// Device id.
    pub device_id: u32,
    /// Slots in `surface_list`.
    pub batch_size: u32,
    /// Slots holding valid data.
    pub num_filled: u32,
    /// Whether the batch is one allocation.
    pub is_contiguous: bool,
    /// `batch_size` slot descriptors.
    pub surface_list: *mut RawSurfaceParams,
    /// Owning pool handle, or null for standalone surfaces.
    pub opaque: *mut c_void,
    /// Presentation timestamp.
    pub pts: u64,
    /// Reserved.
    pub _reserved: [*mut c_void; PADDING_LENGTH],
}

/// Opaque pool handle.
///
/// Surfaces taken from a pool carry the same pointer in
/// [`RawSurface::opaque`], so either can be passed back.
pub type PoolHandle = *mut c_void;

/// Backing allocation behind a `*mut RawSurface`.
#[repr(C)]
struct FfiSurface {
    raw: RawSurface,
    slots: Vec<RawSurfaceParams>,
    surface: Surface,
}

impl FfiSurface {
    fn boxed(surface: Surface) -> *mut RawSurface {
        let slots: Vec<RawSurfaceParams> = surface.slots().iter().map(raw_slot).collect();
        let opaque = surface
            .pool()
            .map_or(ptr::null_mut(), |p| Arc::as_ptr(p).cast_mut().cast::<c_void>());
        let mut boxed = Box::new(FfiSurface {
            raw: RawSurface {
                mem_type: surface.mem_type().as_raw(),
                device_id: surface.device_id() as u32,
                batch_size: surface.batch_size(),
                num_filled: surface.num_filled(),
                is_contiguous: surface.is_contiguous(),
                surface_list: ptr::null_mut(),
                opaque,
                pts: surface.pts(),
                _reserved: [ptr::null_mut(); PADDING_LENGTH],
            },
            slots,
            surface,
        });
        boxed.raw.surface_list = boxed.slots.as_mut_ptr();
        Box::into_raw(boxed).cast::<RawSurface>()
    }

    /// Apply the fields C code may have written.
    fn pull(&mut self) -> Result<()> {
        self.surface.set_num_filled(self.raw.num_filled)?;
        self.surface.set_pts(self.raw.pts);
        Ok(())
    }

    fn push(&mut self) {
        self.raw.num_filled = self.surface.num_filled();
        self.raw.pts = self.surface.pts();
    }
}

fn raw_planes(layout: &PlaneLayout) -> RawPlaneParams {
    let mut raw = RawPlaneParams {
        num_planes: layout.num_planes(),
        width: [0; MAX_PLANES],
        height: [0; MAX_PLANES],
        pitch: [0; MAX_PLANES],
        offset: [0; MAX_PLANES],
        psize: [0; MAX_PLANES],
        bytes_per_pix: [0; MAX_PLANES],
        _reserved: [ptr::null_mut(); PADDING_LENGTH * MAX_PLANES],
    };
    for (i, plane) in layout.planes().iter().enumerate() {
        raw.width[i] = plane.width;
        raw.height[i] = plane.height;
        raw.pitch[i] = plane.pitch;
        raw.offset[i] = plane.offset;
        raw.psize[i] = plane.psize;
        raw.bytes_per_pix[i] = plane.bytes_per_pix;
    }
    raw
}

fn raw_slot(slot: &SlotParams) -> RawSurfaceParams {
    RawSurfaceParams {
        width: slot.width(),
        height: slot.height(),
        pitch: slot.pitch(),
        color_format: slot.color_format().as_raw(),
        data_size: slot.data_size(),
        data_ptr: slot.data_ptr().as_mut_ptr().cast(),
        mapped_data_ptr: slot
            .mapped_ptr()
            .map_or(ptr::null_mut(), |a| a.as_mut_ptr().cast()),
        plane_params: raw_planes(slot.plane_params()),
        _reserved: [ptr::null_mut(); PADDING_LENGTH],
    }
}

impl TryFrom<&RawCreateParams> for CreateParams {
    type Error = Error;

    fn try_from(raw: &RawCreateParams) -> Result<Self> {
        let mem_type = MemType::from_raw(raw.mem_type)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown memory kind {}", raw.mem_type)))?;
        let color_format = ColorFormat::from_raw(raw.color_format).ok_or_else(|| {
            Error::InvalidArgument(format!("unknown color format {}", raw.color_format))
        })?;
        let device_id = i32::try_from(raw.device_id)
            .map_err(|_| Error::InvalidArgument(format!("device id {} is out of range", raw.device_id)))?;
        Ok(CreateParams {
            mem_type,
            device_id,
            width: raw.width,
            height: raw.height,
            color_format,
            size: raw.size,
            batch_size: raw.batch_size,
            force_align_1: raw.force_align_1,
        })
    }
}

/// Run an entry point body, mapping errors and panics to `-1`.
fn ffi_boundary<F>(name: &'static str, f: F) -> i32
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!(entry = name, error = %e, "call failed");
            e.status()
        }
        Err(_) => {
            error!(entry = name, "caught panic at FFI boundary");
            -1
        }
    }
}

fn null_arg(name: &str) -> Error {
    Error::InvalidArgument(format!("{name} is null"))
}

/// # Safety
///
/// `ctx` must be null or a live handle from [`bufsurface_context_create`].
unsafe fn context<'a>(ctx: *const BufSurfaceContext) -> Result<&'a BufSurfaceContext> {
    // SAFETY: guaranteed by the caller.
    unsafe { ctx.as_ref() }.ok_or_else(|| null_arg("context"))
}

/// Borrow the pool behind a handle. The handle keeps its reference unless
/// the result is explicitly unwrapped and dropped.
///
/// # Safety
///
/// `pool` must be null or a live handle from [`bufsurface_pool_create`].
unsafe fn pool_ref(pool: PoolHandle) -> Result<ManuallyDrop<Arc<MemPool>>> {
    if pool.is_null() {
        return Err(null_arg("pool"));
    }
    // SAFETY: handles come from Arc::into_raw; the caller keeps them alive.
    let arc = unsafe { Arc::from_raw(pool.cast_const().cast::<MemPool>()) };
    Ok(ManuallyDrop::new(arc))
}

/// # Safety
///
/// `surf` must be null or a live surface from this module, not aliased for
/// the returned lifetime.
unsafe fn surface_mut<'a>(surf: *mut RawSurface) -> Result<&'a mut FfiSurface> {
    // SAFETY: every `*mut RawSurface` handed out points at the first field
    // of a `#[repr(C)]` FfiSurface.
    unsafe { surf.cast::<FfiSurface>().as_mut() }.ok_or_else(|| null_arg("surface"))
}

/// Create a context over the software runtime.
///
/// `discrete` selects a discrete-card platform (device and pinned memory)
/// instead of a unified-addressing one.
///
/// # Safety
///
/// `out` must be valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bufsurface_context_create(
    discrete: bool,
    device_count: u32,
    out: *mut *mut BufSurfaceContext,
) -> i32 {
    ffi_boundary("context_create", || {
        if out.is_null() {
            return Err(null_arg("out"));
        }
        let config = if discrete {
            SimulatedConfig::discrete()
        } else {
            SimulatedConfig::unified()
        }
        .with_device_count(device_count.max(1) as usize);
        let ctx = BufSurfaceContext::new(Arc::new(SimulatedRuntime::new(config)));
        // SAFETY: checked non-null; validity is the caller's contract.
        unsafe { *out = Box::into_raw(Box::new(ctx)) };
        Ok(())
    })
}

/// Release a context handle. Pools and surfaces created through it stay
/// usable until they are destroyed.
///
/// # Safety
///
/// `ctx` must be null or a handle from [`bufsurface_context_create`] that
/// is not used again.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bufsurface_context_destroy(ctx: *mut BufSurfaceContext) -> i32 {
    ffi_boundary("context_destroy", || {
        if !ctx.is_null() {
            // SAFETY: the handle came from Box::into_raw.
            drop(unsafe { Box::from_raw(ctx) });
        }
        Ok(())
    })
}

/// Create a pool of `block_count` surfaces.
///
/// # Safety
///
/// `ctx` must be a live context, `pool` valid for writes and `params`
/// valid for reads.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bufsurface_pool_create(
    ctx: *const BufSurfaceContext,
    pool: *mut PoolHandle,
    params: *const RawCreateParams,
    block_count: u32,
) -> i32 {
    ffi_boundary("pool_create", || {
        // SAFETY: caller contract.
        let ctx = unsafe { context(ctx) }?;
        if pool.is_null() {
            return Err(null_arg("pool"));
        }
        // SAFETY: caller contract.
        let raw = unsafe { params.as_ref() }.ok_or_else(|| null_arg("params"))?;
        let created = ctx.pool_create(&CreateParams::try_from(raw)?, block_count)?;
        let handle = Arc::into_raw(created).cast_mut().cast::<c_void>();
        // SAFETY: checked non-null.
        unsafe { *pool = handle };
        Ok(())
    })
}

/// Destroy a pool, waiting for its surfaces to be returned.
///
/// On success the handle is freed. On failure it stays valid so the call
/// can be repeated.
///
/// # Safety
///
/// `pool` must be a live handle from [`bufsurface_pool_create`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bufsurface_pool_destroy(
    ctx: *const BufSurfaceContext,
    pool: PoolHandle,
) -> i32 {
    ffi_boundary("pool_destroy", || {
        // SAFETY: caller contract.
        let ctx = unsafe { context(ctx) }?;
        // SAFETY: caller contract.
        let mem_pool = unsafe { pool_ref(pool) }?;
        ctx.pool_destroy(&mem_pool)?;
        // The handle's reference is released only once the pool is gone.
        drop(ManuallyDrop::into_inner(mem_pool));
        Ok(())
    })
}

/// Take one surface from a pool.
///
/// # Safety
///
/// `surf` must be valid for writes and `pool` a live pool handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bufsurface_create_from_pool(
    ctx: *const BufSurfaceContext,
    surf: *mut *mut RawSurface,
    pool: PoolHandle,
) -> i32 {
    ffi_boundary("create_from_pool", || {
        // SAFETY: caller contract.
        let ctx = unsafe { context(ctx) }?;
        if surf.is_null() {
            return Err(null_arg("surf"));
        }
        // SAFETY: caller contract.
        let mem_pool = unsafe { pool_ref(pool) }?;
        let surface = ctx.create_from_pool(&mem_pool)?;
        // SAFETY: checked non-null.
        unsafe { *surf = FfiSurface::boxed(surface) };
        Ok(())
    })
}

/// Create a standalone surface.
///
/// # Safety
///
/// `surf` must be valid for writes and `params` valid for reads.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bufsurface_create(
    ctx: *const BufSurfaceContext,
    surf: *mut *mut RawSurface,
    params: *const RawCreateParams,
) -> i32 {
    ffi_boundary("create", || {
        // SAFETY: caller contract.
        let ctx = unsafe { context(ctx) }?;
        if surf.is_null() {
            return Err(null_arg("surf"));
        }
        // SAFETY: caller contract.
        let raw = unsafe { params.as_ref() }.ok_or_else(|| null_arg("params"))?;
        let surface = ctx.create(&CreateParams::try_from(raw)?)?;
        // SAFETY: checked non-null.
        unsafe { *surf = FfiSurface::boxed(surface) };
        Ok(())
    })
}

/// Release a surface. Must be called exactly once per surface.
///
/// # Safety
///
/// `surf` must be a live surface from this module, not used again.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bufsurface_destroy(
    ctx: *const BufSurfaceContext,
    surf: *mut RawSurface,
) -> i32 {
    ffi_boundary("destroy", || {
        // SAFETY: caller contract.
        let ctx = unsafe { context(ctx) }?;
        if surf.is_null() {
            return Err(null_arg("surface"));
        }
        // SAFETY: surfaces come from Box::into_raw on an FfiSurface.
        let boxed = unsafe { Box::from_raw(surf.cast::<FfiSurface>()) };
        let FfiSurface { surface, .. } = *boxed;
        ctx.destroy(surface)
    })
}

/// Invalidate the CPU cache of cached memory; `-1` selects every slot or
/// plane.
///
/// # Safety
///
/// `surf` must be a live surface from this module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bufsurface_sync_for_cpu(
    ctx: *const BufSurfaceContext,
    surf: *mut RawSurface,
    index: i32,
    plane: i32,
) -> i32 {
    ffi_boundary("sync_for_cpu", || {
        // SAFETY: caller contract.
        let (ctx, ffi) = unsafe { (context(ctx)?, surface_mut(surf)?) };
        ffi.pull()?;
        ctx.sync_for_cpu(&ffi.surface, Select::from_raw(index)?, Select::from_raw(plane)?)
    })
}

/// Flush the CPU cache of cached memory; `-1` selects every slot or plane.
///
/// # Safety
///
/// `surf` must be a live surface from this module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bufsurface_sync_for_device(
    ctx: *const BufSurfaceContext,
    surf: *mut RawSurface,
    index: i32,
    plane: i32,
) -> i32 {
    ffi_boundary("sync_for_device", || {
        // SAFETY: caller contract.
        let (ctx, ffi) = unsafe { (context(ctx)?, surface_mut(surf)?) };
        ffi.pull()?;
        ctx.sync_for_device(&ffi.surface, Select::from_raw(index)?, Select::from_raw(plane)?)
    })
}

/// Copy `src` into `dst`. Copying a surface onto itself does nothing.
///
/// # Safety
///
/// Both must be live surfaces from this module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bufsurface_copy(
    ctx: *const BufSurfaceContext,
    src: *mut RawSurface,
    dst: *mut RawSurface,
) -> i32 {
    ffi_boundary("copy", || {
        // SAFETY: caller contract.
        let ctx = unsafe { context(ctx) }?;
        if src.is_null() || dst.is_null() {
            return Err(null_arg("surface"));
        }
        if ptr::eq(src, dst) {
            return Ok(());
        }
        // SAFETY: distinct live surfaces, so the two borrows do not alias.
        let (src, dst) = unsafe { (surface_mut(src)?, surface_mut(dst)?) };
        src.pull()?;
        dst.pull()?;
        let result = ctx.copy(&src.surface, &mut dst.surface);
        dst.push();
        result
    })
}

/// Fill slots or planes with `value`; `-1` selects every slot or plane.
///
/// # Safety
///
/// `surf` must be a live surface from this module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn bufsurface_memset(
    ctx: *const BufSurfaceContext,
    surf: *mut RawSurface,
    index: i32,
    plane: i32,
    value: u8,
) -> i32 {
    ffi_boundary("memset", || {
        // SAFETY: caller contract.
        let (ctx, ffi) = unsafe { (context(ctx)?, surface_mut(surf)?) };
        ffi.pull()?;
        ctx.memset(
            &mut ffi.surface,
            Select::from_raw(index)?,
            Select::from_raw(plane)?,
            value,
        )
    })
}
