//! Buffer surfaces.
//!
//! A [`Surface`] is a batch of identically laid-out slots in one memory
//! kind. It is a move-only owning handle: dropping it (or calling
//! [`Surface::release`]) returns the block to the pool it came from, or
//! frees it if it was created one-shot, and parks the header in the
//! context's [`HeaderArena`].
//!
//! Borrowing a surface gives a [`SurfaceView`], a read-only observer that
//! cannot outlive it.

mod arena;

pub use arena::{ArenaStats, HeaderArena};

use crate::allocator::{Allocator, Block};
use crate::error::{Error, Result};
use crate::format::{ColorFormat, PlaneLayout};
use crate::observability;
use crate::params::MemType;
use crate::platform::{Addr, VbBlock};
use crate::pool::MemPool;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use tracing::error;

/// Callback run when a surface over caller-owned memory is released.
pub type Deleter = Box<dyn FnOnce() + Send>;

/// Descriptor of one slot of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotParams {
    width: u32,
    height: u32,
    pitch: u32,
    color_format: ColorFormat,
    data_size: u32,
    data_ptr: Addr,
    mapped_ptr: Option<Addr>,
    plane_params: PlaneLayout,
}

impl SlotParams {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        width: u32,
        height: u32,
        pitch: u32,
        color_format: ColorFormat,
        data_size: u32,
        data_ptr: Addr,
        mapped_ptr: Option<Addr>,
        plane_params: PlaneLayout,
    ) -> Self {
        Self {
            width,
            height,
            pitch,
            color_format,
            data_size,
            data_ptr,
            mapped_ptr,
            plane_params,
        }
    }

    /// Frame width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride of the first plane.
    #[inline]
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    /// Pixel format.
    #[inline]
    pub fn color_format(&self) -> ColorFormat {
        self.color_format
    }

    /// Bytes in the slot.
    #[inline]
    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    /// Address of the slot in the memory kind's native address space.
    #[inline]
    pub fn data_ptr(&self) -> Addr {
        self.data_ptr
    }

    /// Host mapping of the slot (unified and VB memory only).
    #[inline]
    pub fn mapped_ptr(&self) -> Option<Addr> {
        self.mapped_ptr
    }

    /// Plane layout.
    #[inline]
    pub fn plane_params(&self) -> &PlaneLayout {
        &self.plane_params
    }

    /// Address the CPU can dereference, if any.
    pub fn host_addr(&self, mem_type: MemType) -> Option<Addr> {
        if mem_type.is_host() {
            Some(self.data_ptr)
        } else {
            self.mapped_ptr
        }
    }

    pub(crate) fn clear_mapping(&mut self) {
        self.mapped_ptr = None;
    }
}

/// Header fields recycled through the [`HeaderArena`].
#[derive(Debug, Default)]
pub(crate) struct SurfaceHeader {
    pub(crate) mem_type: MemType,
    pub(crate) device_id: i32,
    pub(crate) batch_size: u32,
    pub(crate) num_filled: u32,
    pub(crate) is_contiguous: bool,
    pub(crate) pts: u64,
}

/// Who takes the block back on release.
pub(crate) enum Owner {
    Pool(Arc<MemPool>),
    OneShot(Allocator),
    External(Option<Deleter>),
}

impl std::fmt::Debug for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Owner::Pool(pool) => f.debug_tuple("Pool").field(&pool.id()).finish(),
            Owner::OneShot(alloc) => f.debug_tuple("OneShot").field(&alloc.spec().mem_type).finish(),
            Owner::External(deleter) => f
                .debug_tuple("External")
                .field(&deleter.as_ref().map(|_| "deleter"))
                .finish(),
        }
    }
}

/// A batch of buffer slots in one memory kind.
#[derive(Debug)]
pub struct Surface {
    header: ManuallyDrop<Box<SurfaceHeader>>,
    block: Option<Block>,
    owner: Owner,
    arena: Arc<HeaderArena>,
}

impl Surface {
    pub(crate) fn from_block(arena: Arc<HeaderArena>, block: Block, owner: Owner) -> Self {
        let mut header = arena.acquire();
        header.mem_type = block.mem_type();
        header.device_id = block.device_id();
        header.batch_size = block.slots().len() as u32;
        header.is_contiguous = !matches!(owner, Owner::External(_));
        observability::record_surface_created(header.mem_type);
        Self {
            header: ManuallyDrop::new(header),
            block: Some(block),
            owner,
            arena,
        }
    }

    /// Memory kind.
    #[inline]
    pub fn mem_type(&self) -> MemType {
        self.header.mem_type
    }

    /// Owning device.
    #[inline]
    pub fn device_id(&self) -> i32 {
        self.header.device_id
    }

    /// Number of slots.
    #[inline]
    pub fn batch_size(&self) -> u32 {
        self.header.batch_size
    }

    /// Number of slots holding valid data.
    #[inline]
    pub fn num_filled(&self) -> u32 {
        self.header.num_filled
    }

    /// Record how many slots hold valid data.
    ///
    /// # Errors
    ///
    /// Fails if `num_filled` exceeds the batch size.
    pub fn set_num_filled(&mut self, num_filled: u32) -> Result<()> {
        if num_filled > self.header.batch_size {
            return Err(Error::InvalidArgument(format!(
                "num_filled {num_filled} exceeds batch size {}",
                self.header.batch_size
            )));
        }
        self.header.num_filled = num_filled;
        Ok(())
    }

    /// Whether slots are laid out back to back in one allocation.
    #[inline]
    pub fn is_contiguous(&self) -> bool {
        self.header.is_contiguous
    }

    /// Presentation timestamp (meaningful for single-slot surfaces).
    #[inline]
    pub fn pts(&self) -> u64 {
        self.header.pts
    }

    /// Set the presentation timestamp.
    #[inline]
    pub fn set_pts(&mut self, pts: u64) {
        self.header.pts = pts;
    }

    /// Per-slot descriptors.
    #[inline]
    pub fn slots(&self) -> &[SlotParams] {
        self.block.as_ref().map_or(&[], |b| b.slots())
    }

    /// One slot.
    #[inline]
    pub fn slot(&self, index: u32) -> Option<&SlotParams> {
        self.slots().get(index as usize)
    }

    /// The pool this surface returns to, if any.
    pub fn pool(&self) -> Option<&Arc<MemPool>> {
        match &self.owner {
            Owner::Pool(pool) => Some(pool),
            _ => None,
        }
    }

    /// Hardware identity of a VB-backed surface.
    pub fn vb_block(&self) -> Option<&VbBlock> {
        self.block.as_ref().and_then(Block::vb_block)
    }

    /// Host-visible bytes of one slot.
    ///
    /// `None` for device-only memory and for out-of-range slots.
    pub fn host_slot(&self, index: u32) -> Option<&[u8]> {
        let slot = self.slot(index)?;
        let addr = slot.host_addr(self.mem_type())?;
        // SAFETY: the block is owned by this surface and covers data_size
        // bytes at every slot's host address; &self excludes our own writers.
        Some(unsafe { std::slice::from_raw_parts(addr.as_mut_ptr(), slot.data_size as usize) })
    }

    /// Mutable host-visible bytes of one slot.
    pub fn host_slot_mut(&mut self, index: u32) -> Option<&mut [u8]> {
        let slot = *self.slot(index)?;
        let addr = slot.host_addr(self.mem_type())?;
        // SAFETY: as in host_slot; &mut self makes the access exclusive.
        Some(unsafe { std::slice::from_raw_parts_mut(addr.as_mut_ptr(), slot.data_size as usize) })
    }

    /// Borrow a read-only view.
    pub fn view(&self) -> SurfaceView<'_> {
        SurfaceView { surface: self }
    }

    /// Release the surface, reporting failures instead of logging them.
    pub fn release(mut self) -> Result<()> {
        self.release_block()
    }

    fn release_block(&mut self) -> Result<()> {
        let Some(mut block) = self.block.take() else {
            return Ok(());
        };
        match &mut self.owner {
            Owner::Pool(pool) => {
                if block.mem_type() == MemType::Device {
                    block.clear_host_mappings();
                }
                pool.free(block)
            }
            Owner::OneShot(allocator) => allocator.free(block),
            Owner::External(deleter) => {
                if let Some(deleter) = deleter.take() {
                    deleter();
                }
                Ok(())
            }
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if let Err(e) = self.release_block() {
            error!(mem_type = ?self.header.mem_type, error = %e, "failed to release surface memory");
        }
        // SAFETY: the header is never touched again after drop.
        let header = unsafe { ManuallyDrop::take(&mut self.header) };
        self.arena.release(header);
        observability::record_surface_destroyed();
    }
}

/// Read-only, non-owning view of a [`Surface`].
#[derive(Debug, Clone, Copy)]
pub struct SurfaceView<'a> {
    surface: &'a Surface,
}

impl<'a> SurfaceView<'a> {
    /// Memory kind.
    pub fn mem_type(&self) -> MemType {
        self.surface.mem_type()
    }

    /// Number of slots.
    pub fn batch_size(&self) -> u32 {
        self.surface.batch_size()
    }

    /// Number of slots holding valid data.
    pub fn num_filled(&self) -> u32 {
        self.surface.num_filled()
    }

    /// Presentation timestamp.
    pub fn pts(&self) -> u64 {
        self.surface.pts()
    }

    /// One slot descriptor.
    pub fn slot(&self, index: u32) -> Option<&'a SlotParams> {
        self.surface.slot(index)
    }

    /// Host-visible bytes of one plane of one slot.
    ///
    /// For explicit-size slots (no planes) plane 0 is the whole slot.
    pub fn plane(&self, slot: u32, plane: u32) -> Option<&'a [u8]> {
        let bytes = self.surface.host_slot(slot)?;
        let layout = self.surface.slot(slot)?.plane_params();
        if layout.is_empty() {
            return (plane == 0).then_some(bytes);
        }
        let info = layout.plane(plane as usize)?;
        bytes.get(info.offset as usize..(info.offset + info.psize) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::CreateParams;
    use crate::platform::{DeviceRuntime, SimulatedConfig, SimulatedRuntime};

    fn one_shot(params: &CreateParams) -> Surface {
        let rt: Arc<dyn DeviceRuntime> = Arc::new(SimulatedRuntime::new(SimulatedConfig::unified()));
        let arena = Arc::new(HeaderArena::new(4, false));
        let allocator = Allocator::create(rt, params, 1).unwrap();
        let block = allocator.alloc().unwrap();
        Surface::from_block(arena, block, Owner::OneShot(allocator))
    }

    #[test]
    fn test_header_mirrors_block() {
        let params = CreateParams::sized(MemType::System, 256).with_batch_size(4);
        let surf = one_shot(&params);
        assert_eq!(surf.batch_size(), 4);
        assert_eq!(surf.num_filled(), 0);
        assert!(surf.is_contiguous());
        assert!(surf.pool().is_none());
        assert!(surf.vb_block().is_none());
        assert_eq!(surf.slots().len(), 4);
    }

    #[test]
    fn test_num_filled_bounded_by_batch() {
        let mut surf = one_shot(&CreateParams::sized(MemType::System, 16).with_batch_size(2));
        surf.set_num_filled(2).unwrap();
        assert!(surf.set_num_filled(3).is_err());
        assert_eq!(surf.num_filled(), 2);
    }

    #[test]
    fn test_host_slot_access() {
        let mut surf = one_shot(&CreateParams::sized(MemType::System, 32).with_batch_size(2));
        surf.host_slot_mut(1).unwrap().fill(9);
        assert!(surf.host_slot(0).unwrap().iter().all(|&b| b == 0));
        assert!(surf.host_slot(1).unwrap().iter().all(|&b| b == 9));
        assert!(surf.host_slot(2).is_none());
    }

    #[test]
    fn test_device_memory_is_not_host_visible() {
        let surf = one_shot(&CreateParams::sized(MemType::Device, 32));
        assert!(surf.host_slot(0).is_none());
    }

    #[test]
    fn test_view_planes() {
        let params = CreateParams::frame(MemType::Unified, 64, 32, ColorFormat::Nv12);
        let mut surf = one_shot(&params);
        let y_size = surf.slot(0).unwrap().plane_params().plane(0).unwrap().psize as usize;
        surf.host_slot_mut(0).unwrap()[y_size..].fill(0x80);

        let view = surf.view();
        assert!(view.plane(0, 0).unwrap().iter().all(|&b| b == 0));
        assert!(view.plane(0, 1).unwrap().iter().all(|&b| b == 0x80));
        assert!(view.plane(0, 2).is_none());
    }

    #[test]
    fn test_release_returns_header() {
        let rt: Arc<dyn DeviceRuntime> = Arc::new(SimulatedRuntime::new(SimulatedConfig::unified()));
        let arena = Arc::new(HeaderArena::new(4, false));
        let params = CreateParams::sized(MemType::System, 16);
        let allocator = Allocator::create(rt, &params, 1).unwrap();
        let block = allocator.alloc().unwrap();
        let surf = Surface::from_block(arena.clone(), block, Owner::OneShot(allocator));

        surf.release().unwrap();
        assert_eq!(arena.stats().available, 1);
    }

    #[test]
    fn test_external_deleter_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let arena = Arc::new(HeaderArena::new(4, false));
        let slot = SlotParams {
            color_format: ColorFormat::Tensor,
            data_size: 8,
            data_ptr: Addr::new(0x1000),
            ..Default::default()
        };
        let block = Block::external(MemType::Device, 0, slot);
        let surf = Surface::from_block(
            arena,
            block,
            Owner::External(Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))),
        );
        assert!(!surf.is_contiguous());
        surf.release().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
