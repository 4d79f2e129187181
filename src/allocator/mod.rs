//! Memory backends.
//!
//! Each backend knows how to reserve and release one block of one memory
//! kind. A block covers a whole batch: `block_size` bytes per slot, with
//! slot `i` starting at `i * block_size`. The set of backends is closed, so
//! [`Allocator`] is an enum and dispatch is a `match`.
//!
//! | Kind | Backend | `data_ptr` | `mapped_ptr` |
//! |------|---------|------------|--------------|
//! | System | [`SystemAllocator`] | heap | none |
//! | Pinned | [`SystemAllocator`] (pinned mode) | page-locked host | none |
//! | Device | [`DeviceAllocator`] | device | none |
//! | Unified / UnifiedCached | [`UnifiedAllocator`] | device | host mapping |
//! | Vb / VbCached | [`VbAllocator`] | physical | host mapping |
//!
//! Platform mismatches are caught when the backend is created, never at
//! allocation time.

mod device;
mod system;
mod unified;
mod vb;

pub use device::DeviceAllocator;
pub use system::SystemAllocator;
pub use unified::UnifiedAllocator;
pub use vb::VbAllocator;

use crate::error::{Error, Result};
use crate::format::{Alignment, ColorFormat, PlaneLayout, color_format_info};
use crate::memory::HostRegion;
use crate::observability;
use crate::params::{CreateParams, MemType};
use crate::platform::{Addr, DeviceRuntime, UnifiedAlloc, VbBlock};
use crate::surface::SlotParams;
use std::sync::Arc;

/// Layout shared by every block a backend hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSpec {
    /// Memory kind.
    pub mem_type: MemType,
    /// Owning device.
    pub device_id: i32,
    /// Frame width recorded on each slot.
    pub width: u32,
    /// Frame height recorded on each slot.
    pub height: u32,
    /// Color format recorded on each slot.
    pub color_format: ColorFormat,
    /// Slots per block.
    pub batch_size: u32,
    /// Bytes per slot.
    pub block_size: u32,
    /// Plane layout of each slot (empty for explicit-size blocks).
    pub layout: PlaneLayout,
}

impl BlockSpec {
    /// Compute the slot size and layout for `params` under `align`.
    ///
    /// An explicit size is rounded up to the width alignment and yields an
    /// empty layout; an unset color format is then recorded as `Gray8`.
    ///
    /// # Errors
    ///
    /// Fails if the format has no layout or the resulting size is zero or
    /// does not fit.
    pub fn new(params: &CreateParams, align: Alignment) -> Result<Self> {
        let batch_size = params.batch_size.max(1);
        let mut color_format = params.color_format;

        let (block_size, layout) = if params.size > 0 {
            if color_format == ColorFormat::Invalid {
                color_format = ColorFormat::Gray8;
            }
            let rounded = u64::from(params.size).next_multiple_of(u64::from(align.width));
            (rounded, PlaneLayout::empty())
        } else {
            let layout = color_format_info(params.color_format, params.width, params.height, align)?;
            (layout.total_size(), layout)
        };

        if block_size == 0 {
            return Err(Error::InvalidArgument(format!(
                "{}x{} {:?} yields an empty block",
                params.width, params.height, params.color_format
            )));
        }
        let block_size = u32::try_from(block_size)
            .map_err(|_| Error::InvalidArgument(format!("block size {block_size} is too large")))?;
        (block_size as usize)
            .checked_mul(batch_size as usize)
            .ok_or_else(|| Error::InvalidArgument("batch does not fit in memory".into()))?;

        Ok(Self {
            mem_type: params.mem_type,
            device_id: params.device_id,
            width: params.width,
            height: params.height,
            color_format,
            batch_size,
            block_size,
            layout,
        })
    }

    /// Bytes backing a whole batch.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.block_size as usize * self.batch_size as usize
    }

    /// Slot descriptors for a batch starting at `data` (and `mapped`).
    fn slots(&self, data: Addr, mapped: Option<Addr>) -> Vec<SlotParams> {
        let pitch = self.layout.plane(0).map_or(0, |p| p.pitch);
        (0..self.batch_size as usize)
            .map(|i| {
                let offset = i * self.block_size as usize;
                SlotParams::new(
                    self.width,
                    self.height,
                    pitch,
                    self.color_format,
                    self.block_size,
                    data.offset(offset),
                    mapped.map(|m| m.offset(offset)),
                    self.layout,
                )
            })
            .collect()
    }
}

/// What actually holds a block's memory.
#[derive(Debug)]
pub(crate) enum Backing {
    Host(HostRegion),
    Pinned(Addr),
    Device(Addr),
    Unified(UnifiedAlloc),
    Vb(VbBlock),
    /// Caller-owned memory; released by the caller's deleter.
    External,
}

impl Backing {
    fn name(&self) -> &'static str {
        match self {
            Backing::Host(_) => "host",
            Backing::Pinned(_) => "pinned",
            Backing::Device(_) => "device",
            Backing::Unified(_) => "unified",
            Backing::Vb(_) => "video-buffer",
            Backing::External => "external",
        }
    }
}

/// One backing-memory unit sized for a full batch.
#[derive(Debug)]
pub struct Block {
    mem_type: MemType,
    device_id: i32,
    /// Pool currently lending the block out.
    pub(crate) pool_id: Option<u64>,
    pub(crate) backing: Backing,
    pub(crate) slots: Vec<SlotParams>,
}

impl Block {
    fn new(spec: &BlockSpec, backing: Backing, data: Addr, mapped: Option<Addr>) -> Self {
        Self {
            mem_type: spec.mem_type,
            device_id: spec.device_id,
            pool_id: None,
            slots: spec.slots(data, mapped),
            backing,
        }
    }

    /// Block over caller-owned memory.
    pub(crate) fn external(mem_type: MemType, device_id: i32, slot: SlotParams) -> Self {
        Self {
            mem_type,
            device_id,
            pool_id: None,
            backing: Backing::External,
            slots: vec![slot],
        }
    }

    /// Memory kind.
    #[inline]
    pub fn mem_type(&self) -> MemType {
        self.mem_type
    }

    /// Owning device.
    #[inline]
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Per-slot descriptors.
    #[inline]
    pub fn slots(&self) -> &[SlotParams] {
        &self.slots
    }

    /// Hardware identity of a VB block.
    pub fn vb_block(&self) -> Option<&VbBlock> {
        match &self.backing {
            Backing::Vb(block) => Some(block),
            _ => None,
        }
    }

    /// Drop any host mapping recorded on the slots.
    pub(crate) fn clear_host_mappings(&mut self) {
        for slot in &mut self.slots {
            slot.clear_mapping();
        }
    }
}

fn foreign_block(backend: &str, backing: &Backing) -> Error {
    Error::InvalidArgument(format!(
        "{backend} allocator cannot free {} memory",
        backing.name()
    ))
}

/// A backend for one memory kind.
#[derive(Debug)]
pub enum Allocator {
    /// Host memory (system or pinned).
    System(SystemAllocator),
    /// Device-only memory.
    Device(DeviceAllocator),
    /// Unified memory.
    Unified(UnifiedAllocator),
    /// Hardware video buffers.
    Vb(VbAllocator),
}

impl Allocator {
    /// Create the backend matching `params.mem_type`.
    ///
    /// `block_count` sizes the hardware pool of VB backends and is ignored
    /// otherwise.
    ///
    /// # Errors
    ///
    /// [`MemType::Default`] must be resolved first. Layout errors and
    /// driver refusals (e.g. a VB pool on a discrete card) are reported
    /// here.
    pub fn create(
        runtime: Arc<dyn DeviceRuntime>,
        params: &CreateParams,
        block_count: u32,
    ) -> Result<Self> {
        let allocator = match params.mem_type {
            MemType::System | MemType::Pinned => {
                Allocator::System(SystemAllocator::create(runtime, params)?)
            }
            MemType::Device => Allocator::Device(DeviceAllocator::create(runtime, params)?),
            MemType::Unified | MemType::UnifiedCached => {
                Allocator::Unified(UnifiedAllocator::create(runtime, params)?)
            }
            MemType::Vb | MemType::VbCached => {
                Allocator::Vb(VbAllocator::create(runtime, params, block_count)?)
            }
            MemType::Default => {
                return Err(Error::InvalidArgument(
                    "memory kind must be resolved before creating a backend".into(),
                ));
            }
        };
        Ok(allocator)
    }

    /// Shared block layout.
    pub fn spec(&self) -> &BlockSpec {
        match self {
            Allocator::System(a) => a.spec(),
            Allocator::Device(a) => a.spec(),
            Allocator::Unified(a) => a.spec(),
            Allocator::Vb(a) => a.spec(),
        }
    }

    /// Reserve one block.
    pub fn alloc(&self) -> Result<Block> {
        let block = match self {
            Allocator::System(a) => a.alloc(),
            Allocator::Device(a) => a.alloc(),
            Allocator::Unified(a) => a.alloc(),
            Allocator::Vb(a) => a.alloc(),
        };
        match &block {
            Ok(_) => observability::record_bytes_allocated(self.spec().total_size()),
            Err(_) => observability::record_alloc_failure(self.spec().mem_type),
        }
        block
    }

    /// Release one block.
    pub fn free(&self, block: Block) -> Result<()> {
        match self {
            Allocator::System(a) => a.free(block),
            Allocator::Device(a) => a.free(block),
            Allocator::Unified(a) => a.free(block),
            Allocator::Vb(a) => a.free(block),
        }
    }

    /// Release backend-level resources (the hardware pool of VB backends).
    pub fn destroy(&mut self) -> Result<()> {
        match self {
            Allocator::Vb(a) => a.destroy(),
            _ => Ok(()),
        }
    }
}
