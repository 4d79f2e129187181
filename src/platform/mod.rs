//! Accelerator runtime interface.
//!
//! Everything this crate needs from the device driver goes through the
//! [`DeviceRuntime`] trait: platform capability queries, device binding,
//! the raw allocation primitives for each memory kind, cache maintenance
//! and DMA-style copies. Backends only ever hold an
//! `Arc<dyn DeviceRuntime>`, so one context can be pointed at real
//! hardware or at the in-process [`SimulatedRuntime`].
//!
//! Addresses are carried as [`Addr`] values rather than pointers. A device
//! address is only meaningful to the runtime that produced it; host
//! addresses (system, pinned, or the host mapping of unified/VB memory)
//! can be dereferenced by the CPU.

pub mod simulated;

pub use simulated::{SimulatedConfig, SimulatedRuntime};

use crate::error::Result;
use std::fmt;

/// Capabilities of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Marketing or chip name.
    pub name: String,
    /// Host and device share one address space (edge SoCs).
    pub supports_unified_addr: bool,
    /// Host memory can be mapped into the device (required for pinned memory).
    pub can_map_host_memory: bool,
}

/// An address in host or device address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Addr(usize);

impl Addr {
    /// The null address.
    pub const NULL: Addr = Addr(0);

    /// Wrap a raw address value.
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Take the address of a host pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Raw address value.
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Whether this is the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Reinterpret as a host pointer.
    ///
    /// Only meaningful for host-visible addresses.
    #[inline]
    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

impl fmt::LowerHex for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Transfer direction for [`DeviceRuntime::memcpy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyDirection {
    /// Both sides are host memory.
    HostToHost,
    /// Host source, device destination.
    HostToDevice,
    /// Device source, host destination.
    DeviceToHost,
    /// Both sides are device memory.
    DeviceToDevice,
}

impl CopyDirection {
    /// Pick the direction from whether each side is host memory.
    pub fn between(src_is_host: bool, dst_is_host: bool) -> Self {
        match (src_is_host, dst_is_host) {
            (true, true) => CopyDirection::HostToHost,
            (true, false) => CopyDirection::HostToDevice,
            (false, true) => CopyDirection::DeviceToHost,
            (false, false) => CopyDirection::DeviceToDevice,
        }
    }
}

/// Cache maintenance operation on a cached mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOp {
    /// Write dirty CPU cache lines back so the device sees them.
    Flush,
    /// Drop CPU cache lines so the CPU sees device writes.
    Invalidate,
}

/// Memory that is addressable from both host and device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnifiedAlloc {
    /// Device-side address.
    pub device: Addr,
    /// Host-side mapping of the same memory.
    pub host: Addr,
    /// Length in bytes.
    pub len: usize,
}

/// Identifier of a hardware video-buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VbPoolId(pub u64);

/// Configuration of a hardware video-buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VbPoolConfig {
    /// Device owning the pool.
    pub device_id: i32,
    /// Bytes per block.
    pub block_size: usize,
    /// Number of blocks the driver reserves.
    pub block_count: u32,
    /// Map blocks with CPU caching enabled.
    pub cached: bool,
}

/// A block handed out by a hardware video-buffer pool.
///
/// Codec, ISP and display engines identify buffers by pool and block id,
/// so this is exposed to consumers as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VbBlock {
    /// Pool the block belongs to.
    pub pool: VbPoolId,
    /// Driver handle of the block.
    pub block_id: u64,
    /// Device-visible (physical/IOVA) address.
    pub phys_addr: Addr,
    /// Host mapping of the block.
    pub host_addr: Addr,
    /// Length in bytes.
    pub len: usize,
}

/// Driver primitives consumed by the allocators and the context.
///
/// Implementations must be thread-safe; the context calls into the runtime
/// from whichever thread issues a request.
pub trait DeviceRuntime: Send + Sync + fmt::Debug {
    /// Capabilities of `device_id`.
    ///
    /// Fails for devices that do not exist.
    fn platform_info(&self, device_id: i32) -> Result<PlatformInfo>;

    /// Bind the calling thread to `device_id`.
    fn set_device(&self, device_id: i32) -> Result<()>;

    /// Allocate device-only memory.
    fn device_malloc(&self, device_id: i32, size: usize) -> Result<Addr>;

    /// Release memory from [`device_malloc`](Self::device_malloc).
    fn device_free(&self, addr: Addr) -> Result<()>;

    /// Allocate page-locked host memory mapped into the current device.
    fn host_malloc_pinned(&self, size: usize) -> Result<Addr>;

    /// Release memory from [`host_malloc_pinned`](Self::host_malloc_pinned).
    fn host_free_pinned(&self, addr: Addr) -> Result<()>;

    /// Allocate memory mapped into both address spaces.
    fn unified_malloc(&self, device_id: i32, size: usize, cached: bool) -> Result<UnifiedAlloc>;

    /// Unmap and release unified memory.
    fn unified_free(&self, alloc: UnifiedAlloc) -> Result<()>;

    /// Register a hardware video-buffer pool.
    fn vb_pool_create(&self, config: VbPoolConfig) -> Result<VbPoolId>;

    /// Tear down a video-buffer pool. Fails while blocks are outstanding.
    fn vb_pool_destroy(&self, pool: VbPoolId) -> Result<()>;

    /// Take one block from a video-buffer pool.
    fn vb_block_alloc(&self, pool: VbPoolId) -> Result<VbBlock>;

    /// Return a block. May report [`Error::Busy`](crate::Error::Busy)
    /// while a hardware engine still references it.
    fn vb_block_free(&self, block: &VbBlock) -> Result<()>;

    /// Flush or invalidate the CPU cache for a cached mapping.
    fn cache_sync(&self, op: CacheOp, device: Addr, host: Addr, len: usize) -> Result<()>;

    /// Copy `len` bytes.
    ///
    /// # Safety
    ///
    /// Every host-side address implied by `direction` must be valid for
    /// `len` bytes, and no Rust reference may alias the destination range
    /// for the duration of the call. Device addresses are validated by the
    /// runtime.
    unsafe fn memcpy(&self, dst: Addr, src: Addr, len: usize, direction: CopyDirection)
    -> Result<()>;

    /// Fill `len` bytes of device memory with `value`.
    ///
    /// # Safety
    ///
    /// No Rust reference may alias the host mapping of the range (if any)
    /// for the duration of the call.
    unsafe fn memset_device(&self, dst: Addr, value: u8, len: usize) -> Result<()>;
}
