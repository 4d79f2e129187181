//! Unified memory backend.

use super::{Backing, Block, BlockSpec, foreign_block};
use crate::error::Result;
use crate::format::{Alignment, DEVICE_ALIGNMENT};
use crate::params::{CreateParams, MemType};
use crate::platform::DeviceRuntime;
use std::sync::Arc;
use tracing::error;

/// Memory mapped into both address spaces.
///
/// `data_ptr` is the device address, `mapped_ptr` the host mapping of the
/// same bytes. The cached variant maps with CPU caching and relies on
/// explicit flush/invalidate.
#[derive(Debug)]
pub struct UnifiedAllocator {
    runtime: Arc<dyn DeviceRuntime>,
    spec: BlockSpec,
    cached: bool,
}

impl UnifiedAllocator {
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
            cached: params.mem_type == MemType::UnifiedCached,
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
        let alloc = self
            .runtime
            .unified_malloc(self.spec.device_id, total, self.cached)
            .inspect_err(|e| {
                error!(size = total, cached = self.cached, error = %e, "unified allocation failed");
            })?;
        Ok(Block::new(
            &self.spec,
            Backing::Unified(alloc),
            alloc.device,
            Some(alloc.host),
        ))
    }

    /// Release one block.
    pub fn free(&self, block: Block) -> Result<()> {
        match block.backing {
            Backing::Unified(alloc) => self.runtime.unified_free(alloc),
            other => Err(foreign_block("unified", &other)),
        }
    }
}
