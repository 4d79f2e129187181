//! Fixed-capacity memory pools.
//!
//! A [`MemPool`] owns one backend and, for every kind except VB, a cache of
//! `block_count` blocks reserved up front. Allocation pops a cached block
//! and never grows the pool; the next request after the cache runs dry
//! fails with [`Error::ResourceExhausted`]. VB pools delegate pooling to the
//! hardware pool registered by the backend.
//!
//! # Teardown
//!
//! [`MemPool::destroy`] waits until every outstanding block has been
//! returned. It does not time out: callers that need a bound must stop
//! handing surfaces out and wait for consumers themselves.

use crate::allocator::{Allocator, Block, BlockSpec};
use crate::error::{Error, Result};
use crate::observability;
use crate::params::{CreateParams, MemType, check_params};
use crate::platform::DeviceRuntime;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Statistics about pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks the pool was created with.
    pub capacity: u32,
    /// Blocks that can currently be allocated.
    pub available: u32,
    /// Blocks handed out and not yet returned.
    pub in_flight: u32,
    /// Successful allocations since creation.
    pub total_allocs: u64,
    /// Refused allocations since creation.
    pub failed_allocs: u64,
}

#[derive(Debug)]
struct PoolState {
    allocator: Option<Allocator>,
    cache: Vec<Block>,
    in_flight: u32,
    draining: bool,
    total_allocs: u64,
    failed_allocs: u64,
}

/// A fixed set of blocks of one memory kind.
#[derive(Debug)]
pub struct MemPool {
    runtime: Arc<dyn DeviceRuntime>,
    id: u64,
    mem_type: MemType,
    device_id: i32,
    block_count: u32,
    spec: BlockSpec,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl MemPool {
    /// Create a pool of `block_count` blocks described by `params`.
    ///
    /// [`MemType::Default`] is resolved against the platform first. Every
    /// block of a non-VB pool is reserved here; if any reservation fails
    /// the ones already made are released and the pool is not created.
    pub fn create(
        runtime: Arc<dyn DeviceRuntime>,
        params: &CreateParams,
        block_count: u32,
    ) -> Result<Arc<Self>> {
        if block_count == 0 {
            error!("pool needs at least one block");
            return Err(Error::InvalidArgument("block_count must be > 0".into()));
        }
        check_params(runtime.as_ref(), params)?;

        let mut params = params.clone();
        if params.mem_type != MemType::System {
            runtime.set_device(params.device_id)?;
            let info = runtime.platform_info(params.device_id)?;
            params.mem_type = params.mem_type.resolve(&info);
        }

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let span = observability::span_pool(id, params.mem_type, params.device_id);
        let _guard = span.enter();

        let mut allocator = Allocator::create(runtime.clone(), &params, block_count)?;
        let mut cache = Vec::new();
        if !params.mem_type.is_vb() {
            cache.reserve(block_count as usize);
            for _ in 0..block_count {
                match allocator.alloc() {
                    Ok(block) => cache.push(block),
                    Err(e) => {
                        error!(
                            allocated = cache.len(),
                            block_count,
                            error = %e,
                            "pool prefill failed"
                        );
                        for block in cache.drain(..) {
                            if let Err(e) = allocator.free(block) {
                                warn!(error = %e, "failed to release prefilled block");
                            }
                        }
                        if let Err(teardown) = allocator.destroy() {
                            warn!(error = %teardown, "failed to release pool backend");
                        }
                        return Err(e);
                    }
                }
            }
        }

        debug!(
            block_size = allocator.spec().block_size,
            batch_size = allocator.spec().batch_size,
            block_count,
            "memory pool created"
        );
        observability::record_pool_blocks(params.mem_type, i64::from(block_count));

        Ok(Arc::new(Self {
            runtime,
            id,
            mem_type: params.mem_type,
            device_id: params.device_id,
            block_count,
            spec: allocator.spec().clone(),
            state: Mutex::new(PoolState {
                allocator: Some(allocator),
                cache,
                in_flight: 0,
                draining: false,
                total_allocs: 0,
                failed_allocs: 0,
            }),
            returned: Condvar::new(),
        }))
    }

    /// Process-unique pool id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolved memory kind.
    #[inline]
    pub fn mem_type(&self) -> MemType {
        self.mem_type
    }

    /// Owning device.
    #[inline]
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Blocks the pool was created with.
    #[inline]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Layout shared by the pool's blocks.
    #[inline]
    pub fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    /// Runtime the pool allocates from.
    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    /// Whether the pool still accepts allocations.
    pub fn is_created(&self) -> bool {
        let state = self.lock();
        state.allocator.is_some() && !state.draining
    }

    /// Take one block.
    ///
    /// # Errors
    ///
    /// [`Error::NotCreated`] once teardown has begun,
    /// [`Error::ResourceExhausted`] when no block is free.
    pub(crate) fn alloc(&self) -> Result<Block> {
        let mut state = self.lock();
        if state.draining {
            return Err(Error::NotCreated);
        }
        let Some(allocator) = state.allocator.as_ref() else {
            return Err(Error::NotCreated);
        };

        let block = if self.mem_type.is_vb() {
            allocator.alloc()
        } else {
            state.cache.pop().ok_or_else(|| {
                Error::ResourceExhausted(format!(
                    "pool {} has all {} blocks in use",
                    self.id, self.block_count
                ))
            })
        };

        match block {
            Ok(mut block) => {
                block.pool_id = Some(self.id);
                state.in_flight += 1;
                state.total_allocs += 1;
                observability::record_pool_blocks(self.mem_type, -1);
                Ok(block)
            }
            Err(e) => {
                state.failed_allocs += 1;
                debug!(pool = self.id, error = %e, "pool allocation refused");
                Err(e)
            }
        }
    }

    /// Return a block taken from this pool.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the block is not currently lent out by
    /// this pool; the pool is left untouched.
    pub(crate) fn free(&self, mut block: Block) -> Result<()> {
        let mut state = self.lock();
        if block.pool_id != Some(self.id) || state.in_flight == 0 {
            error!(
                pool = self.id,
                owner = ?block.pool_id,
                in_flight = state.in_flight,
                "refusing block not lent out by this pool"
            );
            return Err(Error::InvalidArgument(format!(
                "block does not belong to pool {}",
                self.id
            )));
        }
        block.pool_id = None;
        if block.mem_type() == MemType::Device {
            block.clear_host_mappings();
        }

        let result = if self.mem_type.is_vb() {
            match state.allocator.as_ref() {
                Some(allocator) => allocator.free(block),
                None => Err(Error::NotCreated),
            }
        } else {
            state.cache.push(block);
            Ok(())
        };
        state.in_flight -= 1;
        observability::record_pool_blocks(self.mem_type, 1);
        drop(state);

        self.returned.notify_all();
        result
    }

    /// Tear the pool down, waiting for outstanding blocks first.
    ///
    /// Destroying a destroyed pool is a no-op. Backend failures are logged
    /// and the pool is cleared anyway, except when the backend reports it
    /// is still busy: then the pool stays registered and the call can be
    /// repeated.
    pub fn destroy(&self) -> Result<()> {
        let span = observability::span_pool(self.id, self.mem_type, self.device_id);
        let _guard = span.enter();

        let mut state = self.lock();
        if state.allocator.is_none() {
            return Ok(());
        }
        state.draining = true;

        if state.in_flight > 0 {
            debug!(in_flight = state.in_flight, "waiting for outstanding blocks");
        }
        while state.in_flight > 0 {
            state = self
                .returned
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let cached = std::mem::take(&mut state.cache);
        let Some(allocator) = state.allocator.as_mut() else {
            return Ok(());
        };
        let mut first_error = None;
        for block in cached {
            if let Err(e) = allocator.free(block) {
                error!(error = %e, "failed to release cached block");
                first_error.get_or_insert(e);
            }
        }

        match allocator.destroy() {
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                error!(error = %e, "backend teardown failed");
                first_error.get_or_insert(e);
            }
            Ok(()) => {}
        }
        state.allocator = None;
        observability::record_pool_blocks(self.mem_type, -i64::from(self.block_count));
        debug!("memory pool destroyed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Current usage statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let available = if self.mem_type.is_vb() {
            self.block_count.saturating_sub(state.in_flight)
        } else {
            state.cache.len() as u32
        };
        PoolStats {
            capacity: self.block_count,
            available: if state.allocator.is_some() { available } else { 0 },
            in_flight: state.in_flight,
            total_allocs: state.total_allocs,
            failed_allocs: state.failed_allocs,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MemPool {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let idle = state.allocator.is_some() && state.in_flight == 0;
        if idle {
            if let Err(e) = self.destroy() {
                warn!(pool = self.id, error = %e, "pool teardown on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ColorFormat;
    use crate::platform::{SimulatedConfig, SimulatedRuntime};
    use std::thread;
    use std::time::Duration;

    fn runtime(config: SimulatedConfig) -> (Arc<SimulatedRuntime>, Arc<dyn DeviceRuntime>) {
        let sim = Arc::new(SimulatedRuntime::new(config));
        let rt: Arc<dyn DeviceRuntime> = sim.clone();
        (sim, rt)
    }

    #[test]
    fn test_capacity_round_trip() {
        let (_, rt) = runtime(SimulatedConfig::unified());
        let params = CreateParams::sized(MemType::System, 1024);
        let pool = MemPool::create(rt, &params, 3).unwrap();

        let blocks: Vec<_> = (0..3).map(|_| pool.alloc().unwrap()).collect();
        assert!(matches!(pool.alloc(), Err(Error::ResourceExhausted(_))));

        let mut blocks = blocks.into_iter();
        pool.free(blocks.next().unwrap()).unwrap();
        let again = pool.alloc().unwrap();
        for block in blocks.chain(std::iter::once(again)) {
            pool.free(block).unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.capacity, 3);
        assert_eq!(stats.available, 3);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.total_allocs, 4);
        assert_eq!(stats.failed_allocs, 1);
        pool.destroy().unwrap();
    }

    #[test]
    fn test_default_resolves_to_unified() {
        let (_, rt) = runtime(SimulatedConfig::unified());
        let params = CreateParams::frame(MemType::Default, 320, 240, ColorFormat::Nv12);
        let pool = MemPool::create(rt, &params, 2).unwrap();
        assert_eq!(pool.mem_type(), MemType::Unified);
        pool.destroy().unwrap();

        let (_, rt) = runtime(SimulatedConfig::discrete());
        let pool = MemPool::create(rt, &params, 2).unwrap();
        assert_eq!(pool.mem_type(), MemType::Device);
    }

    #[test]
    fn test_zero_blocks_rejected() {
        let (_, rt) = runtime(SimulatedConfig::unified());
        let params = CreateParams::sized(MemType::System, 64);
        assert!(MemPool::create(rt, &params, 0).is_err());
    }

    #[test]
    fn test_prefill_failure_releases_everything() {
        let (sim, rt) = runtime(SimulatedConfig::discrete().with_memory_limit(10_000));
        let params = CreateParams::sized(MemType::Device, 4096);
        assert!(MemPool::create(rt, &params, 4).is_err());
        assert_eq!(sim.bytes_in_use(0), 0);
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn test_destroy_releases_backing_memory() {
        let (sim, rt) = runtime(SimulatedConfig::discrete());
        let params = CreateParams::sized(MemType::Device, 4096);
        let pool = MemPool::create(rt, &params, 4).unwrap();
        assert_eq!(sim.live_allocations(), 4);

        pool.destroy().unwrap();
        assert_eq!(sim.live_allocations(), 0);
        assert!(matches!(pool.alloc(), Err(Error::NotCreated)));
        pool.destroy().unwrap();
    }

    #[test]
    fn test_destroy_waits_for_outstanding_block() {
        let (_, rt) = runtime(SimulatedConfig::unified());
        let params = CreateParams::sized(MemType::System, 64);
        let pool = MemPool::create(rt, &params, 2).unwrap();
        let block = pool.alloc().unwrap();

        let returner = {
            let pool = pool.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                pool.free(block).unwrap();
            })
        };

        pool.destroy().unwrap();
        assert_eq!(pool.stats().in_flight, 0);
        returner.join().unwrap();
    }

    #[test]
    fn test_draining_pool_refuses_allocations() {
        let (_, rt) = runtime(SimulatedConfig::unified());
        let params = CreateParams::sized(MemType::System, 64);
        let pool = MemPool::create(rt, &params, 2).unwrap();
        let block = pool.alloc().unwrap();

        let destroyer = {
            let pool = pool.clone();
            thread::spawn(move || pool.destroy())
        };
        while pool.is_created() {
            thread::yield_now();
        }
        assert!(matches!(pool.alloc(), Err(Error::NotCreated)));

        pool.free(block).unwrap();
        destroyer.join().unwrap().unwrap();
    }

    #[test]
    fn test_vb_pool_delegates_to_hardware() {
        let (sim, rt) = runtime(SimulatedConfig::unified());
        let params = CreateParams::sized(MemType::Vb, 4096);
        let pool = MemPool::create(rt, &params, 2).unwrap();
        assert_eq!(sim.vb_pool_count(), 1);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(a.vb_block().is_some());
        assert!(matches!(pool.alloc(), Err(Error::ResourceExhausted(_))));
        assert_eq!(pool.stats().available, 0);

        pool.free(a).unwrap();
        pool.free(b).unwrap();
        pool.destroy().unwrap();
        assert_eq!(sim.vb_pool_count(), 0);
    }

    #[test]
    fn test_device_blocks_lose_mapping_on_return() {
        let (_, rt) = runtime(SimulatedConfig::discrete());
        let params = CreateParams::sized(MemType::Device, 256);
        let pool = MemPool::create(rt, &params, 1).unwrap();
        let block = pool.alloc().unwrap();
        assert!(block.slots()[0].mapped_ptr().is_none());
        pool.free(block).unwrap();
        let block = pool.alloc().unwrap();
        assert!(block.slots()[0].mapped_ptr().is_none());
        pool.free(block).unwrap();
    }

    #[test]
    fn test_foreign_block_rejected() {
        let (_, rt) = runtime(SimulatedConfig::unified());
        let params = CreateParams::sized(MemType::System, 64);
        let a = MemPool::create(rt.clone(), &params, 1).unwrap();
        let b = MemPool::create(rt, &params, 1).unwrap();

        let block = a.alloc().unwrap();
        assert!(matches!(b.free(block), Err(Error::InvalidArgument(_))));
        let stats = b.stats();
        assert_eq!(stats.capacity, 1);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.in_flight, 0);
        b.destroy().unwrap();
    }

    #[test]
    fn test_free_without_outstanding_block_rejected() {
        let (_, rt) = runtime(SimulatedConfig::unified());
        let params = CreateParams::sized(MemType::System, 64);
        let a = MemPool::create(rt.clone(), &params, 1).unwrap();
        let b = MemPool::create(rt, &params, 1).unwrap();

        let own = a.alloc().unwrap();
        a.free(own).unwrap();

        // Tagged as a's, but a has nothing lent out.
        let mut stray = b.alloc().unwrap();
        stray.pool_id = Some(a.id());
        assert!(matches!(a.free(stray), Err(Error::InvalidArgument(_))));
        assert_eq!(a.stats().available, 1);
        assert_eq!(a.stats().in_flight, 0);
        a.destroy().unwrap();
    }
}
