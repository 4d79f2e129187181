//! Host memory backend (system and pinned).

use super::{Backing, Block, BlockSpec, foreign_block};
use crate::error::Result;
use crate::format::{Alignment, HOST_ALIGNMENT};
use crate::memory::HostRegion;
use crate::params::{CreateParams, MemType};
use crate::platform::DeviceRuntime;
use std::sync::Arc;
use tracing::error;

/// Start alignment of heap blocks (one cache line).
const HEAP_BLOCK_ALIGN: usize = 64;

/// Plain host memory, or page-locked host memory in pinned mode.
#[derive(Debug)]
pub struct SystemAllocator {
    runtime: Arc<dyn DeviceRuntime>,
    spec: BlockSpec,
    pinned: bool,
}

impl SystemAllocator {
    /// Create a backend for `params`.
    pub fn create(runtime: Arc<dyn DeviceRuntime>, params: &CreateParams) -> Result<Self> {
        let align = if params.force_align_1 {
            Alignment::none()
        } else {
            HOST_ALIGNMENT
        };
        Ok(Self {
            runtime,
            spec: BlockSpec::new(params, align)?,
            pinned: params.mem_type == MemType::Pinned,
        })
    }

    /// Block layout.
    pub fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    /// Reserve one block.
    pub fn alloc(&self) -> Result<Block> {
        let total = self.spec.total_size();
        if self.pinned {
            self.runtime.set_device(self.spec.device_id)?;
            let addr = self.runtime.host_malloc_pinned(total).inspect_err(|e| {
                error!(size = total, error = %e, "pinned allocation failed");
            })?;
            return Ok(Block::new(&self.spec, Backing::Pinned(addr), addr, None));
        }

        let region = HostRegion::heap(total, HEAP_BLOCK_ALIGN).inspect_err(|e| {
            error!(size = total, error = %e, "host allocation failed");
        })?;
        let addr = region.addr();
        Ok(Block::new(&self.spec, Backing::Host(region), addr, None))
    }

    /// Release one block.
    pub fn free(&self, block: Block) -> Result<()> {
        match block.backing {
            Backing::Host(region) => {
                drop(region);
                Ok(())
            }
            Backing::Pinned(addr) => self.runtime.host_free_pinned(addr),
            other => Err(foreign_block("system", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ColorFormat;
    use crate::platform::{SimulatedConfig, SimulatedRuntime};

    fn runtime() -> Arc<SimulatedRuntime> {
        Arc::new(SimulatedRuntime::new(SimulatedConfig::discrete()))
    }

    #[test]
    fn test_system_block_layout() {
        let params = CreateParams::frame(MemType::System, 100, 10, ColorFormat::Rgb).with_batch_size(2);
        let alloc = SystemAllocator::create(runtime(), &params).unwrap();
        let block = alloc.alloc().unwrap();

        let slots = block.slots();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].pitch(), 300);
        assert_eq!(slots[0].data_size(), 300 * 12);
        assert_eq!(
            slots[1].data_ptr().get() - slots[0].data_ptr().get(),
            300 * 12
        );
        assert!(slots[0].mapped_ptr().is_none());
        alloc.free(block).unwrap();
    }

    #[test]
    fn test_force_align_1() {
        let params = CreateParams::frame(MemType::System, 101, 3, ColorFormat::Rgb).with_force_align_1(true);
        let alloc = SystemAllocator::create(runtime(), &params).unwrap();
        assert_eq!(alloc.spec().block_size, 303 * 3);
    }

    #[test]
    fn test_pinned_mode_uses_runtime() {
        let rt = runtime();
        let params = CreateParams::sized(MemType::Pinned, 4096);
        let alloc = SystemAllocator::create(rt.clone(), &params).unwrap();
        let block = alloc.alloc().unwrap();
        assert_eq!(rt.bytes_in_use(0), 4096);
        alloc.free(block).unwrap();
        assert_eq!(rt.bytes_in_use(0), 0);
    }
}
