//! Creation parameters, memory kinds and validation.

use crate::error::{Error, Result};
use crate::format::ColorFormat;
use crate::platform::{DeviceRuntime, PlatformInfo};
use tracing::error;

/// Kind of memory backing a surface.
///
/// Discriminants are stable ABI values.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemType {
    /// Platform-preferred kind: unified where supported, device otherwise.
    #[default]
    Default = 0,
    /// Device-only memory, no host mapping.
    Device = 1,
    /// Page-locked host memory mapped into the device.
    Pinned = 2,
    /// Memory mapped into host and device, coherent.
    Unified = 3,
    /// Unified memory with CPU caching; needs explicit flush/invalidate.
    UnifiedCached = 4,
    /// Block from a hardware video-buffer pool.
    Vb = 5,
    /// Cached video-buffer block.
    VbCached = 6,
    /// Plain host memory.
    System = 7,
}

impl MemType {
    /// Convert a raw ABI value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => MemType::Default,
            1 => MemType::Device,
            2 => MemType::Pinned,
            3 => MemType::Unified,
            4 => MemType::UnifiedCached,
            5 => MemType::Vb,
            6 => MemType::VbCached,
            7 => MemType::System,
            _ => return None,
        })
    }

    /// Raw ABI value.
    #[inline]
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Host memory: the CPU dereferences `data_ptr` directly.
    #[inline]
    pub fn is_host(self) -> bool {
        matches!(self, MemType::System | MemType::Pinned)
    }

    /// Kinds whose CPU view must be flushed/invalidated explicitly.
    #[inline]
    pub fn is_cached(self) -> bool {
        matches!(self, MemType::UnifiedCached | MemType::VbCached)
    }

    /// Hardware video-buffer kinds.
    #[inline]
    pub fn is_vb(self) -> bool {
        matches!(self, MemType::Vb | MemType::VbCached)
    }

    /// Unified kinds.
    #[inline]
    pub fn is_unified(self) -> bool {
        matches!(self, MemType::Unified | MemType::UnifiedCached)
    }

    /// Short lowercase name, used as a metrics label.
    pub fn label(self) -> &'static str {
        match self {
            MemType::Default => "default",
            MemType::Device => "device",
            MemType::Pinned => "pinned",
            MemType::Unified => "unified",
            MemType::UnifiedCached => "unified_cached",
            MemType::Vb => "vb",
            MemType::VbCached => "vb_cached",
            MemType::System => "system",
        }
    }

    /// Resolve [`MemType::Default`] against the platform.
    pub fn resolve(self, info: &PlatformInfo) -> Self {
        match self {
            MemType::Default if info.supports_unified_addr => MemType::Unified,
            MemType::Default => MemType::Device,
            other => other,
        }
    }

    fn accepted_on(self, info: &PlatformInfo) -> bool {
        if info.supports_unified_addr {
            matches!(
                self,
                MemType::Default
                    | MemType::Device
                    | MemType::Unified
                    | MemType::UnifiedCached
                    | MemType::Vb
                    | MemType::VbCached
            )
        } else {
            matches!(self, MemType::Default | MemType::Device | MemType::Pinned)
        }
    }
}

/// Parameters for creating a surface or a pool of surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateParams {
    /// Memory kind.
    pub mem_type: MemType,
    /// Device the memory belongs to.
    pub device_id: i32,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub color_format: ColorFormat,
    /// Explicit bytes per slot. Non-zero overrides geometry and disables
    /// the plane layout.
    pub size: u32,
    /// Number of slots per surface.
    pub batch_size: u32,
    /// Disable row/height padding.
    pub force_align_1: bool,
}

impl Default for CreateParams {
    fn default() -> Self {
        Self {
            mem_type: MemType::Default,
            device_id: 0,
            width: 0,
            height: 0,
            color_format: ColorFormat::Invalid,
            size: 0,
            batch_size: 1,
            force_align_1: false,
        }
    }
}

impl CreateParams {
    /// Parameters for a single frame of `format` at `width` x `height`.
    pub fn frame(mem_type: MemType, width: u32, height: u32, format: ColorFormat) -> Self {
        Self {
            mem_type,
            width,
            height,
            color_format: format,
            ..Default::default()
        }
    }

    /// Parameters for a single untyped block of `size` bytes.
    pub fn sized(mem_type: MemType, size: u32) -> Self {
        Self {
            mem_type,
            size,
            ..Default::default()
        }
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the device.
    pub fn with_device(mut self, device_id: i32) -> Self {
        self.device_id = device_id;
        self
    }

    /// Set an explicit slot size.
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    /// Disable padding.
    pub fn with_force_align_1(mut self, force: bool) -> Self {
        self.force_align_1 = force;
        self
    }
}

/// Validate `params` against the capabilities of its device.
///
/// Host (system) memory skips the platform query and instead checks the
/// color format and that either a geometry or a size was given. Every other
/// kind must be accepted by the platform: unified-addressing platforms take
/// device, unified and VB kinds; discrete platforms take device and pinned,
/// and pinned additionally needs host-memory mapping.
///
/// # Errors
///
/// [`Error::InvalidArgument`] for every rejection, or the runtime's error if
/// the device does not exist.
pub fn check_params(runtime: &dyn DeviceRuntime, params: &CreateParams) -> Result<()> {
    if params.batch_size == 0 {
        error!(batch_size = params.batch_size, "invalid batch size");
        return Err(Error::InvalidArgument("batch_size must be > 0".into()));
    }

    if params.mem_type != MemType::System {
        let info = runtime.platform_info(params.device_id).inspect_err(|e| {
            error!(device_id = params.device_id, error = %e, "platform query failed");
        })?;

        if !params.mem_type.accepted_on(&info) {
            error!(
                mem_type = ?params.mem_type,
                unified = info.supports_unified_addr,
                "memory kind not supported on this platform"
            );
            return Err(Error::InvalidArgument(format!(
                "{:?} is not supported on {}",
                params.mem_type, info.name
            )));
        }
        if params.mem_type == MemType::Pinned && !info.can_map_host_memory {
            error!("pinned memory requires host memory mapping");
            return Err(Error::InvalidArgument(
                "pinned memory requires host memory mapping".into(),
            ));
        }
        return Ok(());
    }

    if !params.color_format.in_range() {
        error!(color_format = ?params.color_format, "unknown color format");
        return Err(Error::InvalidFormat(params.color_format));
    }

    if u64::from(params.width) * u64::from(params.height) == 0 && params.size == 0 {
        error!(
            width = params.width,
            height = params.height,
            size = params.size,
            "invalid geometry"
        );
        return Err(Error::InvalidArgument(
            "either width*height or size must be non-zero".into(),
        ));
    }

    Ok(())
}

/// Slot or plane selector; `All` is the ABI's `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Select {
    /// Every slot or plane.
    All,
    /// One slot or plane.
    Index(u32),
}

impl Select {
    /// Convert an ABI index where `-1` means all.
    ///
    /// # Errors
    ///
    /// Values below `-1` are rejected.
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            -1 => Ok(Select::All),
            i if i >= 0 => Ok(Select::Index(i as u32)),
            i => Err(Error::InvalidArgument(format!("index {i} is out of range"))),
        }
    }

    /// Select within `0..count`, failing if the index is out of range.
    pub fn range(self, count: u32) -> Result<std::ops::Range<u32>> {
        match self {
            Select::All => Ok(0..count),
            Select::Index(i) if i < count => Ok(i..i + 1),
            Select::Index(i) => Err(Error::InvalidArgument(format!(
                "index {i} is out of range 0..{count}"
            ))),
        }
    }
}

impl From<u32> for Select {
    fn from(index: u32) -> Self {
        Select::Index(index)
    }
}
