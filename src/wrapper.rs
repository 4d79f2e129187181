//! Shared surface handles.
//!
//! A [`SurfaceWrapper`] owns one [`Surface`] behind a mutex and is shared
//! as a [`SurfaceWrapperPtr`]. Geometry accessors read slot 0, since every
//! slot of a batch has the same layout.
//!
//! Device-only memory has no host mapping. Asking for host data builds a
//! shadow copy on the host (one buffer for a contiguous batch, otherwise
//! one per slot) which is reused until [`SurfaceWrapper::sync_host_to_device`]
//! pushes it back.

use crate::allocator::Block;
use crate::context::{BufSurfaceContext, byte_range};
use crate::error::{Error, Result};
use crate::format::ColorFormat;
use crate::params::{MemType, Select};
use crate::platform::{Addr, CacheOp, CopyDirection, DeviceRuntime};
use crate::surface::{Deleter, Owner, SlotParams, Surface};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, warn};

/// Slots that can carry their own shadow copy.
pub const MAX_SHADOW_SLOTS: u32 = 128;

/// Shared handle to a [`SurfaceWrapper`].
pub type SurfaceWrapperPtr = Arc<SurfaceWrapper>;

/// Host copies standing in for a missing host mapping.
#[derive(Debug, Default)]
enum Shadow {
    #[default]
    None,
    /// One buffer covering the whole contiguous batch.
    Bulk(Vec<u8>),
    /// Buffers for individual slots.
    PerSlot(Vec<Option<Vec<u8>>>),
}

#[derive(Debug)]
struct Inner {
    surface: Option<Surface>,
    shadow: Shadow,
    /// Timestamp once the surface has been taken out.
    pts: u64,
}

/// Mutex-guarded, shareable owner of one surface.
#[derive(Debug)]
pub struct SurfaceWrapper {
    runtime: Arc<dyn DeviceRuntime>,
    inner: Mutex<Inner>,
}

impl SurfaceWrapper {
    /// Wrap `surface`.
    pub fn new(ctx: &BufSurfaceContext, surface: Surface) -> SurfaceWrapperPtr {
        Arc::new(Self {
            runtime: ctx.runtime().clone(),
            inner: Mutex::new(Inner {
                surface: Some(surface),
                shadow: Shadow::None,
                pts: u64::MAX,
            }),
        })
    }

    /// Wrap caller-owned memory as a single-slot tensor surface.
    ///
    /// `deleter` runs when the wrapped surface is released.
    ///
    /// # Safety
    ///
    /// `data` must address `len` bytes of `mem_type` memory on `device_id`
    /// that stay valid until the deleter runs, and that nothing else
    /// accesses while the wrapper hands them out.
    pub unsafe fn from_tensor(
        ctx: &BufSurfaceContext,
        data: Addr,
        len: u32,
        mem_type: MemType,
        device_id: i32,
        deleter: Option<Deleter>,
    ) -> Result<SurfaceWrapperPtr> {
        if data.is_null() || len == 0 {
            return Err(Error::InvalidArgument("tensor memory must be non-empty".into()));
        }
        if mem_type == MemType::Default {
            return Err(Error::InvalidArgument(
                "tensor memory kind must be concrete".into(),
            ));
        }
        let slot = SlotParams::new(
            0,
            0,
            0,
            ColorFormat::Tensor,
            len,
            data,
            None,
            Default::default(),
        );
        let block = Block::external(mem_type, device_id, slot);
        let surface = Surface::from_block(ctx.arena().clone(), block, Owner::External(deleter));
        Ok(Self::new(ctx, surface))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<R: Default>(&self, f: impl FnOnce(&Surface) -> R) -> R {
        self.lock().surface.as_ref().map(f).unwrap_or_default()
    }

    fn first_slot<R: Default>(&self, f: impl FnOnce(&SlotParams) -> R) -> R {
        self.read(|s| s.slot(0).map(f).unwrap_or_default())
    }

    /// Whether the wrapper still owns a surface.
    pub fn has_surface(&self) -> bool {
        self.lock().surface.is_some()
    }

    /// Run `f` on the wrapped surface.
    pub fn with_surface<R>(&self, f: impl FnOnce(&Surface) -> R) -> Option<R> {
        self.lock().surface.as_ref().map(f)
    }

    /// Run `f` on the wrapped surface mutably.
    ///
    /// Any shadow copy is discarded first, since `f` may change the device
    /// contents behind it.
    pub fn with_surface_mut<R>(&self, f: impl FnOnce(&mut Surface) -> R) -> Option<R> {
        let mut inner = self.lock();
        inner.shadow = Shadow::None;
        inner.surface.as_mut().map(f)
    }

    /// Take the surface out; the wrapper keeps only its own timestamp.
    pub fn take_surface(&self) -> Option<Surface> {
        let mut inner = self.lock();
        inner.shadow = Shadow::None;
        inner.surface.take()
    }

    /// Descriptor of one slot.
    pub fn surface_params(&self, slot: u32) -> Option<SlotParams> {
        self.read(|s| s.slot(slot).copied())
    }

    /// Number of filled slots.
    pub fn num_filled(&self) -> u32 {
        self.read(Surface::num_filled)
    }

    /// Record how many slots hold valid data.
    pub fn set_num_filled(&self, num_filled: u32) -> Result<()> {
        match self.lock().surface.as_mut() {
            Some(surface) => surface.set_num_filled(num_filled),
            None => Err(Error::NotCreated),
        }
    }

    /// Number of slots.
    pub fn batch_size(&self) -> u32 {
        self.read(Surface::batch_size)
    }

    /// Pixel format.
    pub fn color_format(&self) -> ColorFormat {
        self.first_slot(SlotParams::color_format)
    }

    /// Frame width.
    pub fn width(&self) -> u32 {
        self.first_slot(SlotParams::width)
    }

    /// Frame height.
    pub fn height(&self) -> u32 {
        self.first_slot(SlotParams::height)
    }

    /// Row stride of `plane`, or 0 if it does not exist.
    pub fn stride(&self, plane: u32) -> u32 {
        self.first_slot(|s| s.plane_params().plane(plane as usize).map_or(0, |p| p.pitch))
    }

    /// Number of planes.
    pub fn plane_count(&self) -> u32 {
        self.first_slot(|s| s.plane_params().num_planes())
    }

    /// Bytes of `plane` including padding, or 0 if it does not exist.
    pub fn plane_bytes(&self, plane: u32) -> u32 {
        self.first_slot(|s| s.plane_params().plane(plane as usize).map_or(0, |p| p.psize))
    }

    /// Owning device.
    pub fn device_id(&self) -> i32 {
        self.read(Surface::device_id)
    }

    /// Memory kind.
    pub fn mem_type(&self) -> MemType {
        self.read(Surface::mem_type)
    }

    /// Presentation timestamp.
    pub fn pts(&self) -> u64 {
        let inner = self.lock();
        inner.surface.as_ref().map_or(inner.pts, Surface::pts)
    }

    /// Set the presentation timestamp.
    pub fn set_pts(&self, pts: u64) {
        let mut inner = self.lock();
        match inner.surface.as_mut() {
            Some(surface) => surface.set_pts(pts),
            None => inner.pts = pts,
        }
    }

    /// Native address of `plane` of `slot`.
    pub fn data(&self, plane: u32, slot: u32) -> Option<Addr> {
        self.read(|s| {
            let params = s.slot(slot)?;
            plane_addr(params, plane, params.data_ptr())
        })
    }

    /// Host mapping of `plane` of `slot`, for unified and VB memory.
    pub fn mapped_data(&self, plane: u32, slot: u32) -> Option<Addr> {
        self.read(|s| {
            let params = s.slot(slot)?;
            plane_addr(params, plane, params.mapped_ptr()?)
        })
    }

    /// Host address of `plane` of `slot`.
    ///
    /// Host kinds and mapped kinds return their own memory. Device memory
    /// returns a shadow copy that lives until the next full
    /// [`sync_host_to_device`](Self::sync_host_to_device), until the
    /// surface is taken or mutated through the wrapper, or until the
    /// wrapper is dropped.
    pub fn host_data(&self, plane: u32, slot: u32) -> Result<Addr> {
        let mut inner = self.lock();
        let base = self.host_slot(&mut inner, slot)?;
        let surface = inner.surface.as_ref().ok_or(Error::NotCreated)?;
        let params = surface
            .slot(slot)
            .ok_or_else(|| Error::InvalidArgument(format!("slot {slot} does not exist")))?;
        let (offset, _) = plane_range(params, plane)?;
        Ok(base.offset(offset))
    }

    /// Run `f` over the host bytes of `plane` of `slot`. `Select::All`
    /// covers the whole slot.
    pub fn map_host<R>(&self, slot: u32, plane: Select, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut inner = self.lock();
        let base = self.host_slot(&mut inner, slot)?;
        let surface = inner.surface.as_ref().ok_or(Error::NotCreated)?;
        let params = surface
            .slot(slot)
            .ok_or_else(|| Error::InvalidArgument(format!("slot {slot} does not exist")))?;
        let (offset, len) = byte_range(params, plane)?;
        // SAFETY: `base` covers data_size bytes owned by the surface or its
        // shadow, both of which live inside `inner`; the lock is held for
        // the duration of `f`, so nothing else reaches this memory through
        // the wrapper.
        let bytes = unsafe { std::slice::from_raw_parts_mut(base.offset(offset).as_mut_ptr(), len) };
        Ok(f(bytes))
    }

    /// Push host-side changes to the device.
    ///
    /// Device memory copies its shadow back (the whole batch in one
    /// transfer for a contiguous shadow). Cached kinds flush the CPU cache.
    /// Other kinds are already coherent and need nothing.
    pub fn sync_host_to_device(&self, slot: Select) -> Result<()> {
        let mut inner = self.lock();
        let Inner {
            surface, shadow, ..
        } = &mut *inner;
        let surface = surface.as_ref().ok_or(Error::NotCreated)?;
        let mem_type = surface.mem_type();
        let slots = slot.range(surface.batch_size())?;

        if mem_type.is_cached() {
            self.runtime.set_device(surface.device_id())?;
            for i in slots {
                let params = slot_params(surface, i)?;
                if let Some(mapped) = params.mapped_ptr() {
                    self.runtime.cache_sync(
                        CacheOp::Flush,
                        params.data_ptr(),
                        mapped,
                        params.data_size() as usize,
                    )?;
                }
            }
            return Ok(());
        }
        if mem_type != MemType::Device {
            return Ok(());
        }

        self.runtime.set_device(surface.device_id())?;
        match shadow {
            Shadow::None => {
                warn!(slot = ?slot, "device surface has no host shadow to push");
                return Ok(());
            }
            Shadow::Bulk(buf) => {
                let first = slot_params(surface, 0)?;
                let size = first.data_size() as usize;
                let (dst, src, len) = match slot {
                    Select::All => (
                        first.data_ptr(),
                        Addr::from_ptr(buf.as_ptr()),
                        size * surface.batch_size() as usize,
                    ),
                    Select::Index(i) => (
                        slot_params(surface, i)?.data_ptr(),
                        Addr::from_ptr(buf.as_ptr()).offset(i as usize * size),
                        size,
                    ),
                };
                // SAFETY: `buf` spans the whole batch and is only read here.
                unsafe { self.runtime.memcpy(dst, src, len, CopyDirection::HostToDevice) }
                    .inspect_err(|e| error!(error = %e, "shadow upload failed"))?;
            }
            Shadow::PerSlot(bufs) => {
                for i in slots {
                    let Some(Some(buf)) = bufs.get(i as usize) else {
                        continue;
                    };
                    let params = slot_params(surface, i)?;
                    // SAFETY: the shadow holds data_size bytes and is only read here.
                    unsafe {
                        self.runtime.memcpy(
                            params.data_ptr(),
                            Addr::from_ptr(buf.as_ptr()),
                            params.data_size() as usize,
                            CopyDirection::HostToDevice,
                        )
                    }
                    .inspect_err(|e| error!(slot = i, error = %e, "shadow upload failed"))?;
                }
            }
        }

        match slot {
            Select::All => *shadow = Shadow::None,
            Select::Index(i) => {
                if let Shadow::PerSlot(bufs) = shadow {
                    if let Some(buf) = bufs.get_mut(i as usize) {
                        *buf = None;
                    }
                }
            }
        }
        Ok(())
    }

    /// Host base address of `slot`, building a shadow for device memory.
    fn host_slot(&self, inner: &mut Inner, slot: u32) -> Result<Addr> {
        let Inner {
            surface, shadow, ..
        } = inner;
        let surface = surface.as_ref().ok_or(Error::NotCreated)?;
        let params = slot_params(surface, slot)?;
        if let Some(addr) = params.host_addr(surface.mem_type()) {
            return Ok(addr);
        }
        if surface.mem_type() != MemType::Device {
            error!(mem_type = ?surface.mem_type(), "memory kind has no host view");
            return Err(Error::UnsupportedOperation(format!(
                "{:?} memory has no host view",
                surface.mem_type()
            )));
        }

        let size = params.data_size() as usize;
        if surface.is_contiguous() {
            if let Shadow::Bulk(buf) = shadow {
                return Ok(Addr::from_ptr(buf.as_ptr()).offset(slot as usize * size));
            }
            let total = size * surface.batch_size() as usize;
            let mut buf = vec![0u8; total.next_multiple_of(64)];
            self.download(surface, 0, &mut buf[..total])?;
            let base = Addr::from_ptr(buf.as_ptr());
            *shadow = Shadow::Bulk(buf);
            return Ok(base.offset(slot as usize * size));
        }

        if slot >= MAX_SHADOW_SLOTS {
            error!(slot, "slot index too large for a shadow copy");
            return Err(Error::InvalidArgument(format!(
                "slot {slot} exceeds the {MAX_SHADOW_SLOTS}-slot shadow limit"
            )));
        }
        if !matches!(shadow, Shadow::PerSlot(_)) {
            *shadow = Shadow::PerSlot(Vec::new());
        }
        let Shadow::PerSlot(bufs) = shadow else {
            return Err(Error::NotCreated);
        };
        if bufs.len() <= slot as usize {
            bufs.resize_with(slot as usize + 1, || None);
        }
        if let Some(buf) = &bufs[slot as usize] {
            return Ok(Addr::from_ptr(buf.as_ptr()));
        }
        let mut buf = vec![0u8; size.next_multiple_of(64)];
        self.download(surface, slot, &mut buf[..size])?;
        let base = Addr::from_ptr(buf.as_ptr());
        bufs[slot as usize] = Some(buf);
        Ok(base)
    }

    fn download(&self, surface: &Surface, slot: u32, into: &mut [u8]) -> Result<()> {
        let params = slot_params(surface, slot)?;
        self.runtime.set_device(surface.device_id())?;
        // SAFETY: `into` is an exclusive borrow of a host buffer of `len` bytes.
        unsafe {
            self.runtime.memcpy(
                Addr::from_ptr(into.as_mut_ptr()),
                params.data_ptr(),
                into.len(),
                CopyDirection::DeviceToHost,
            )
        }
        .inspect_err(|e| error!(slot, error = %e, "shadow download failed"))
    }
}

fn slot_params(surface: &Surface, slot: u32) -> Result<&SlotParams> {
    surface
        .slot(slot)
        .ok_or_else(|| Error::InvalidArgument(format!("slot {slot} does not exist")))
}

/// Offset of `plane`; planeless slots accept plane 0.
fn plane_range(params: &SlotParams, plane: u32) -> Result<(usize, usize)> {
    if params.plane_params().is_empty() && plane == 0 {
        return Ok((0, params.data_size() as usize));
    }
    byte_range(params, Select::Index(plane))
}

fn plane_addr(params: &SlotParams, plane: u32, base: Addr) -> Option<Addr> {
    plane_range(params, plane).ok().map(|(offset, _)| base.offset(offset))
}
