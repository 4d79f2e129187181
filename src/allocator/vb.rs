//! Hardware video-buffer backend.

use super::{Backing, Block, BlockSpec, foreign_block};
use crate::error::{Error, Result};
use crate::format::{Alignment, DEVICE_ALIGNMENT, VB_BLOCK_ALIGNMENT};
use crate::params::{CreateParams, MemType};
use crate::platform::{DeviceRuntime, VbPoolConfig, VbPoolId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Attempts at returning a block the hardware still holds.
const FREE_RETRIES: u32 = 1000;

/// Pause between those attempts.
const FREE_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Blocks from a driver-managed video-buffer pool.
///
/// The driver owns the backing store; this backend registers the pool on
/// creation and only borrows blocks from it, so it does not keep a cache
/// of its own.
#[derive(Debug)]
pub struct VbAllocator {
    runtime: Arc<dyn DeviceRuntime>,
    spec: BlockSpec,
    pool: Option<VbPoolId>,
}

impl VbAllocator {
    /// Register a hardware pool of `block_count` blocks for `params`.
    pub fn create(
        runtime: Arc<dyn DeviceRuntime>,
        params: &CreateParams,
        block_count: u32,
    ) -> Result<Self> {
        let align = if params.force_align_1 {
            Alignment::none()
        } else {
            DEVICE_ALIGNMENT
        };
        let spec = BlockSpec::new(params, align)?;

        let mut block_size = spec.total_size();
        if params.force_align_1 {
            block_size = block_size.next_multiple_of(VB_BLOCK_ALIGNMENT as usize);
        }
        let config = VbPoolConfig {
            device_id: spec.device_id,
            block_size,
            block_count,
            cached: params.mem_type == MemType::VbCached,
        };

        runtime.set_device(spec.device_id)?;
        let pool = runtime.vb_pool_create(config).inspect_err(|e| {
            error!(?config, error = %e, "video-buffer pool creation failed");
        })?;
        debug!(pool = pool.0, block_size, block_count, "video-buffer backend ready");

        Ok(Self {
            runtime,
            spec,
            pool: Some(pool),
        })
    }

    /// Block layout.
    pub fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    /// Hardware pool id, while registered.
    pub fn pool_id(&self) -> Option<VbPoolId> {
        self.pool
    }

    /// Take one block from the hardware pool.
    pub fn alloc(&self) -> Result<Block> {
        let pool = self.pool.ok_or(Error::NotCreated)?;
        let block = self.runtime.vb_block_alloc(pool).inspect_err(|e| {
            debug!(pool = pool.0, error = %e, "video-buffer block allocation failed");
        })?;
        Ok(Block::new(
            &self.spec,
            Backing::Vb(block),
            block.phys_addr,
            Some(block.host_addr),
        ))
    }

    /// Return one block, waiting out a busy hardware engine.
    pub fn free(&self, block: Block) -> Result<()> {
        let vb = match block.backing {
            Backing::Vb(vb) => vb,
            other => return Err(foreign_block("video-buffer", &other)),
        };

        let mut attempts = 0;
        loop {
            match self.runtime.vb_block_free(&vb) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempts < FREE_RETRIES => {
                    attempts += 1;
                    std::thread::sleep(FREE_RETRY_DELAY);
                }
                Err(e) => {
                    error!(pool = vb.pool.0, block = vb.block_id, attempts, error = %e, "video-buffer free failed");
                    return Err(e);
                }
            }
        }
    }

    /// Unregister the hardware pool.
    ///
    /// A busy pool stays registered so the call can be retried.
    pub fn destroy(&mut self) -> Result<()> {
        let Some(pool) = self.pool else {
            return Ok(());
        };
        match self.runtime.vb_pool_destroy(pool) {
            Ok(()) => {
                self.pool = None;
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!(pool = pool.0, error = %e, "video-buffer pool still busy");
                Err(e)
            }
            Err(e) => {
                self.pool = None;
                Err(e)
            }
        }
    }
}
