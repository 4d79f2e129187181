//! Software accelerator runtime.
//!
//! `SimulatedRuntime` implements [`DeviceRuntime`] entirely in host memory
//! so the whole surface stack can run on machines without an accelerator.
//! It keeps the properties callers depend on:
//!
//! - device addresses live in a reserved range that is never a valid host
//!   pointer, and are only reachable through [`DeviceRuntime::memcpy`] and
//!   [`DeviceRuntime::memset_device`]
//! - unified and VB memory are one allocation seen through two addresses
//! - each device has a memory budget; running out is an allocation failure
//! - VB pools hand out a fixed number of blocks and refuse to be destroyed
//!   while any is outstanding
//!
//! Counters for cache maintenance and copies let tests observe what the
//! upper layers asked the driver to do.

use super::{
    Addr, CacheOp, CopyDirection, DeviceRuntime, PlatformInfo, UnifiedAlloc, VbBlock,
    VbPoolConfig, VbPoolId,
};
use crate::error::{Error, Result};
use crate::memory::HostRegion;
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

thread_local! {
    static CURRENT_DEVICE: Cell<i32> = const { Cell::new(0) };
}

/// First simulated device address; well above any user-space host mapping.
const DEVICE_VA_BASE: usize = (usize::MAX / 4 * 3) & !0xffff;

/// Gap left between simulated device allocations so overruns do not land
/// in a neighbour.
const DEVICE_VA_GUARD: usize = 0x1_0000;

/// Configuration for [`SimulatedRuntime`].
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// One entry per device, indexed by device id.
    pub devices: Vec<PlatformInfo>,
    /// Per-device byte budget across all memory kinds.
    pub memory_limit: usize,
}

impl SimulatedConfig {
    /// Edge SoC: unified addressing, VB pools available.
    pub fn unified() -> Self {
        Self {
            devices: vec![PlatformInfo {
                name: "sim-soc".into(),
                supports_unified_addr: true,
                can_map_host_memory: true,
            }],
            memory_limit: 1 << 30,
        }
    }

    /// PCIe card: device and pinned memory only.
    pub fn discrete() -> Self {
        Self {
            devices: vec![PlatformInfo {
                name: "sim-card".into(),
                supports_unified_addr: false,
                can_map_host_memory: true,
            }],
            memory_limit: 1 << 30,
        }
    }

    /// Replicate the first device `count` times.
    pub fn with_device_count(mut self, count: usize) -> Self {
        if let Some(first) = self.devices.first().cloned() {
            self.devices = vec![first; count.max(1)];
        }
        self
    }

    /// Set the per-device memory budget.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Report that host memory cannot be mapped into the devices.
    pub fn without_host_mapping(mut self) -> Self {
        for device in &mut self.devices {
            device.can_map_host_memory = false;
        }
        self
    }
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self::unified()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Device,
    Unified,
    VbBlock,
}

#[derive(Debug)]
struct DeviceRegion {
    device_id: i32,
    kind: RegionKind,
    storage: HostRegion,
}

#[derive(Debug)]
struct VbPool {
    config: VbPoolConfig,
    blocks: Vec<VbBlock>,
    free: Vec<usize>,
}

#[derive(Debug)]
struct SimState {
    regions: BTreeMap<usize, DeviceRegion>,
    pinned: HashMap<usize, (i32, HostRegion)>,
    used: HashMap<i32, usize>,
    vb_pools: HashMap<VbPoolId, VbPool>,
    next_va: usize,
    next_pool: u64,
    busy_vb_frees: u32,
}

#[derive(Debug, Default)]
struct Counters {
    flushes: AtomicU64,
    invalidates: AtomicU64,
    copies: AtomicU64,
    device_fills: AtomicU64,
}

/// In-process implementation of [`DeviceRuntime`].
///
/// # Example
///
/// ```rust
/// use bufsurface::platform::{DeviceRuntime, SimulatedConfig, SimulatedRuntime};
///
/// let rt = SimulatedRuntime::new(SimulatedConfig::unified());
/// assert!(rt.platform_info(0).unwrap().supports_unified_addr);
/// assert!(rt.platform_info(1).is_err());
/// ```
#[derive(Debug)]
pub struct SimulatedRuntime {
    config: SimulatedConfig,
    state: Mutex<SimState>,
    counters: Counters,
}

impl SimulatedRuntime {
    /// Create a runtime with the given device set.
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState {
                regions: BTreeMap::new(),
                pinned: HashMap::new(),
                used: HashMap::new(),
                vb_pools: HashMap::new(),
                next_va: DEVICE_VA_BASE,
                next_pool: 1,
                busy_vb_frees: 0,
            }),
            counters: Counters::default(),
        }
    }

    /// Device the calling thread is bound to.
    pub fn current_device() -> i32 {
        CURRENT_DEVICE.with(Cell::get)
    }

    /// Number of cache operations of `op` issued so far.
    pub fn cache_ops(&self, op: CacheOp) -> u64 {
        match op {
            CacheOp::Flush => self.counters.flushes.load(Ordering::Relaxed),
            CacheOp::Invalidate => self.counters.invalidates.load(Ordering::Relaxed),
        }
    }

    /// Number of memcpy calls issued so far.
    pub fn copies(&self) -> u64 {
        self.counters.copies.load(Ordering::Relaxed)
    }

    /// Number of device-side fills issued so far.
    pub fn device_fills(&self) -> u64 {
        self.counters.device_fills.load(Ordering::Relaxed)
    }

    /// Bytes currently allocated against `device_id`'s budget.
    pub fn bytes_in_use(&self, device_id: i32) -> usize {
        self.lock().used.get(&device_id).copied().unwrap_or(0)
    }

    /// Live allocations of every kind (device regions, pinned buffers).
    pub fn live_allocations(&self) -> usize {
        let state = self.lock();
        state.regions.len() + state.pinned.len()
    }

    /// Number of registered VB pools.
    pub fn vb_pool_count(&self) -> usize {
        self.lock().vb_pools.len()
    }

    /// Make the next `count` VB block frees report busy.
    pub fn inject_busy_vb_frees(&self, count: u32) {
        self.lock().busy_vb_frees = count;
    }

    /// Read device memory back (for inspection).
    pub fn read_device(&self, addr: Addr, len: usize) -> Result<Vec<u8>> {
        let state = self.lock();
        let ptr = translate(&state, addr, len)?;
        // SAFETY: translate checked that the range lies inside a live region.
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec())
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self, device_id: i32) -> Result<&PlatformInfo> {
        usize::try_from(device_id)
            .ok()
            .and_then(|i| self.config.devices.get(i))
            .ok_or_else(|| Error::Device(format!("no such device: {device_id}")))
    }

    fn reserve(&self, state: &mut SimState, device_id: i32, len: usize) -> Result<()> {
        let used = state.used.entry(device_id).or_insert(0);
        if used.saturating_add(len) > self.config.memory_limit {
            debug!(device_id, len, used = *used, "simulated device out of memory");
            return Err(Error::AllocationFailed(format!(
                "device {device_id}: {len} bytes requested, {} of {} in use",
                *used, self.config.memory_limit
            )));
        }
        *used += len;
        Ok(())
    }

    fn unreserve(state: &mut SimState, device_id: i32, len: usize) {
        if let Some(used) = state.used.get_mut(&device_id) {
            *used = used.saturating_sub(len);
        }
    }

    fn map_region(
        &self,
        state: &mut SimState,
        device_id: i32,
        kind: RegionKind,
        len: usize,
    ) -> Result<(Addr, Addr)> {
        self.reserve(state, device_id, len)?;
        let storage = match HostRegion::mapped(len) {
            Ok(storage) => storage,
            Err(e) => {
                Self::unreserve(state, device_id, len);
                return Err(e);
            }
        };
        let host = storage.addr();
        let va = state.next_va;
        state.next_va += len.next_multiple_of(DEVICE_VA_GUARD) + DEVICE_VA_GUARD;
        state.regions.insert(
            va,
            DeviceRegion {
                device_id,
                kind,
                storage,
            },
        );
        trace!(device_id, ?kind, len, va, "mapped device region");
        Ok((Addr::new(va), host))
    }

    fn unmap_region(state: &mut SimState, addr: Addr, kind: RegionKind) -> Result<()> {
        match state.regions.get(&addr.get()) {
            Some(region) if region.kind == kind => {}
            Some(region) => {
                return Err(Error::Device(format!(
                    "address {addr:x} is {:?} memory, not {kind:?}",
                    region.kind
                )));
            }
            None => {
                return Err(Error::Device(format!(
                    "address {addr:x} is not the start of an allocation"
                )));
            }
        }
        if let Some(region) = state.regions.remove(&addr.get()) {
            Self::unreserve(state, region.device_id, region.storage.len());
        }
        Ok(())
    }
}

/// Resolve a device address range to host storage.
fn translate(state: &SimState, addr: Addr, len: usize) -> Result<*mut u8> {
    let (base, region) = state
        .regions
        .range(..=addr.get())
        .next_back()
        .ok_or_else(|| Error::Device(format!("unknown device address {addr:x}")))?;
    let offset = addr.get() - base;
    if offset
        .checked_add(len)
        .is_none_or(|end| end > region.storage.len())
    {
        return Err(Error::Device(format!(
            "range {addr:x}+{len} exceeds its allocation"
        )));
    }
    // SAFETY: offset + len is within the region's storage.
    Ok(unsafe { region.storage.as_mut_ptr().add(offset) })
}

impl DeviceRuntime for SimulatedRuntime {
    fn platform_info(&self, device_id: i32) -> Result<PlatformInfo> {
        self.device(device_id).cloned()
    }

    fn set_device(&self, device_id: i32) -> Result<()> {
        self.device(device_id)?;
        CURRENT_DEVICE.with(|d| d.set(device_id));
        Ok(())
    }

    fn device_malloc(&self, device_id: i32, size: usize) -> Result<Addr> {
        self.device(device_id)?;
        let mut state = self.lock();
        let (va, _) = self.map_region(&mut state, device_id, RegionKind::Device, size)?;
        Ok(va)
    }

    fn device_free(&self, addr: Addr) -> Result<()> {
        Self::unmap_region(&mut self.lock(), addr, RegionKind::Device)
    }

    fn host_malloc_pinned(&self, size: usize) -> Result<Addr> {
        let device_id = Self::current_device();
        if !self.device(device_id)?.can_map_host_memory {
            return Err(Error::UnsupportedOperation(format!(
                "device {device_id} cannot map host memory"
            )));
        }
        let mut state = self.lock();
        self.reserve(&mut state, device_id, size)?;
        let region = match HostRegion::mapped(size) {
            Ok(region) => region,
            Err(e) => {
                Self::unreserve(&mut state, device_id, size);
                return Err(e);
            }
        };
        let addr = region.addr();
        state.pinned.insert(addr.get(), (device_id, region));
        Ok(addr)
    }

    fn host_free_pinned(&self, addr: Addr) -> Result<()> {
        let mut state = self.lock();
        let (device_id, region) = state
            .pinned
            .remove(&addr.get())
            .ok_or_else(|| Error::Device(format!("{addr:x} is not pinned memory")))?;
        Self::unreserve(&mut state, device_id, region.len());
        Ok(())
    }

    fn unified_malloc(&self, device_id: i32, size: usize, cached: bool) -> Result<UnifiedAlloc> {
        if !self.device(device_id)?.supports_unified_addr {
            return Err(Error::UnsupportedOperation(format!(
                "device {device_id} has no unified addressing"
            )));
        }
        let mut state = self.lock();
        let (device, host) = self.map_region(&mut state, device_id, RegionKind::Unified, size)?;
        trace!(device_id, size, cached, "unified allocation");
        Ok(UnifiedAlloc {
            device,
            host,
            len: size,
        })
    }

    fn unified_free(&self, alloc: UnifiedAlloc) -> Result<()> {
        Self::unmap_region(&mut self.lock(), alloc.device, RegionKind::Unified)
    }

    fn vb_pool_create(&self, config: VbPoolConfig) -> Result<VbPoolId> {
        if !self.device(config.device_id)?.supports_unified_addr {
            return Err(Error::UnsupportedOperation(format!(
                "device {} has no video-buffer pools",
                config.device_id
            )));
        }
        if config.block_size == 0 || config.block_count == 0 {
            return Err(Error::InvalidArgument(
                "video-buffer pool needs a non-zero block size and count".into(),
            ));
        }

        let mut state = self.lock();
        let id = VbPoolId(state.next_pool);
        state.next_pool += 1;

        let mut blocks = Vec::with_capacity(config.block_count as usize);
        for block_id in 0..u64::from(config.block_count) {
            match self.map_region(&mut state, config.device_id, RegionKind::VbBlock, config.block_size) {
                Ok((phys_addr, host_addr)) => blocks.push(VbBlock {
                    pool: id,
                    block_id,
                    phys_addr,
                    host_addr,
                    len: config.block_size,
                }),
                Err(e) => {
                    for block in &blocks {
                        let _ = Self::unmap_region(&mut state, block.phys_addr, RegionKind::VbBlock);
                    }
                    return Err(e);
                }
            }
        }

        let free = (0..blocks.len()).rev().collect();
        state.vb_pools.insert(
            id,
            VbPool {
                config,
                blocks,
                free,
            },
        );
        debug!(pool = id.0, ?config, "video-buffer pool created");
        Ok(id)
    }

    fn vb_pool_destroy(&self, pool: VbPoolId) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .vb_pools
            .get(&pool)
            .ok_or_else(|| Error::Device(format!("unknown video-buffer pool {}", pool.0)))?;
        let outstanding = entry.blocks.len() - entry.free.len();
        if outstanding > 0 {
            return Err(Error::Busy(format!(
                "video-buffer pool {} has {outstanding} blocks outstanding",
                pool.0
            )));
        }
        if let Some(entry) = state.vb_pools.remove(&pool) {
            for block in &entry.blocks {
                Self::unmap_region(&mut state, block.phys_addr, RegionKind::VbBlock)?;
            }
            debug!(pool = pool.0, cached = entry.config.cached, "video-buffer pool destroyed");
        }
        Ok(())
    }

    fn vb_block_alloc(&self, pool: VbPoolId) -> Result<VbBlock> {
        let mut state = self.lock();
        let entry = state
            .vb_pools
            .get_mut(&pool)
            .ok_or_else(|| Error::Device(format!("unknown video-buffer pool {}", pool.0)))?;
        let index = entry.free.pop().ok_or_else(|| {
            Error::ResourceExhausted(format!("video-buffer pool {} is empty", pool.0))
        })?;
        Ok(entry.blocks[index])
    }

    fn vb_block_free(&self, block: &VbBlock) -> Result<()> {
        let mut state = self.lock();
        if state.busy_vb_frees > 0 {
            state.busy_vb_frees -= 1;
            return Err(Error::Busy(format!("block {} still in use", block.block_id)));
        }
        let entry = state
            .vb_pools
            .get_mut(&block.pool)
            .ok_or_else(|| Error::Device(format!("unknown video-buffer pool {}", block.pool.0)))?;
        let index = entry
            .blocks
            .iter()
            .position(|b| b.block_id == block.block_id)
            .ok_or_else(|| Error::Device(format!("unknown block {}", block.block_id)))?;
        if entry.free.contains(&index) {
            warn!(pool = block.pool.0, block = block.block_id, "double free of video buffer");
            return Err(Error::Device(format!("block {} is already free", block.block_id)));
        }
        entry.free.push(index);
        Ok(())
    }

    fn cache_sync(&self, op: CacheOp, device: Addr, host: Addr, len: usize) -> Result<()> {
        let state = self.lock();
        let storage = translate(&state, device, len)?;
        if Addr::from_ptr(storage) != host {
            return Err(Error::Device(format!(
                "host address {host:x} is not the mapping of {device:x}"
            )));
        }
        let counter = match op {
            CacheOp::Flush => &self.counters.flushes,
            CacheOp::Invalidate => &self.counters.invalidates,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    unsafe fn memcpy(
        &self,
        dst: Addr,
        src: Addr,
        len: usize,
        direction: CopyDirection,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let state = self.lock();
        let (src_ptr, dst_ptr) = match direction {
            CopyDirection::HostToHost => (src.as_mut_ptr(), dst.as_mut_ptr()),
            CopyDirection::HostToDevice => (src.as_mut_ptr(), translate(&state, dst, len)?),
            CopyDirection::DeviceToHost => (translate(&state, src, len)?, dst.as_mut_ptr()),
            CopyDirection::DeviceToDevice => {
                (translate(&state, src, len)?, translate(&state, dst, len)?)
            }
        };
        // SAFETY: device sides were translated into live storage; host sides
        // are covered by the caller's contract. `copy` tolerates overlap.
        unsafe { std::ptr::copy(src_ptr, dst_ptr, len) };
        self.counters.copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    unsafe fn memset_device(&self, dst: Addr, value: u8, len: usize) -> Result<()> {
        let state = self.lock();
        let ptr = translate(&state, dst, len)?;
        // SAFETY: the range lies inside a live region; aliasing is excluded by the caller.
        unsafe { std::ptr::write_bytes(ptr, value, len) };
        self.counters.device_fills.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
