//! Device-only memory backend.

use super::{Backing, Block, BlockSpec, foreign_block};
use crate::error::Result;
use crate::format::{Alignment, DEVICE_ALIGNMENT};
use crate::params::CreateParams;
use crate::platform::DeviceRuntime;
use std::sync::Arc;
use tracing::error;

/// Memory only the device can address. Slots carry no host mapping.
#[derive(Debug)]
pub struct DeviceAllocator {
    runtime: Arc<dyn DeviceRuntime>,
    spec: BlockSpec,
}

impl DeviceAllocator {
    /// Create a backend for `params`.
    pub fn create(runtime: Arc<dyn DeviceRuntime>, params: &CreateParams) -> Result<Self> {
        let align = if params.force_align_1 {
            Alignment::none()
        } else {
            DEVICE_ALIGNMENT
        };
        Ok(Self {
            runtime,
            spec: BlockSpec::new(params, align)?,
        })
    }

    /// Block layout.
    pub fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    /// Reserve one block.
    pub fn alloc(&self) -> Result<Block> {
        let total = self.spec.total_size();
        self.runtime.set_device(self.spec.device_id)?;
        let addr = self
            .runtime
            .device_malloc(self.spec.device_id, total)
            .inspect_err(|e| {
                error!(device_id = self.spec.device_id, size = total, error = %e, "device allocation failed");
            })?;
        Ok(Block::new(&self.spec, Backing::Device(addr), addr, None))
    }

    /// Release one block.
    pub fn free(&self, block: Block) -> Result<()> {
        match block.backing {
            Backing::Device(addr) => self.runtime.device_free(addr),
            other => Err(foreign_block("device", &other)),
        }
    }
}
