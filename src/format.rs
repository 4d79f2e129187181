//! Color formats and per-plane memory layout.
//!
//! [`color_format_info`] is the single source of truth for how a frame of a
//! given format and geometry is laid out in memory: how many planes, each
//! plane's pitch (row stride in bytes), its byte offset from the start of
//! the slot, and its total byte size. Every backend computes its block size
//! from the returned [`PlaneLayout`].
//!
//! # Layout Rules
//!
//! - `pitch = roundup(width * bytes_per_pix, align_w)`
//! - `psize = pitch * roundup(height, align_h)`
//! - planes are packed back to back: `offset[i] = offset[i-1] + psize[i-1]`
//!
//! Chroma planes of YUV420 are half width and half height; the interleaved
//! UV plane of NV12/NV21 is full width (two bytes per chroma sample pair)
//! and half height.

use crate::error::{Error, Result};

/// Maximum number of planes a surface slot can describe.
pub const MAX_PLANES: usize = 3;

/// Row alignment used by host (system and pinned) memory.
pub const HOST_ALIGNMENT: Alignment = Alignment::new(4, 4);

/// Row/height alignment required by device-side engines (device, unified, VB).
pub const DEVICE_ALIGNMENT: Alignment = Alignment::new(64, 16);

/// Granularity the video-buffer driver imposes on block sizes.
pub const VB_BLOCK_ALIGNMENT: u32 = 64;

/// Pixel format of a surface slot.
///
/// Discriminants are stable ABI values.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ColorFormat {
    /// Unset format. Only meaningful together with an explicit byte size.
    #[default]
    Invalid = 0,
    /// 8-bit grayscale, single plane.
    Gray8 = 1,
    /// Planar YUV 4:2:0 (three planes).
    Yuv420 = 2,
    /// Semi-planar YUV 4:2:0, UV interleaved.
    Nv12 = 3,
    /// Semi-planar YUV 4:2:0, VU interleaved.
    Nv21 = 4,
    /// Packed 32-bit ARGB.
    Argb = 5,
    /// Packed 32-bit ABGR.
    Abgr = 6,
    /// Packed 24-bit RGB.
    Rgb = 7,
    /// Packed 24-bit BGR.
    Bgr = 8,
    /// Packed 32-bit BGRA.
    Bgra = 9,
    /// Packed 32-bit RGBA.
    Rgba = 10,
    /// Packed 16-bit ARGB with 1-bit alpha.
    Argb1555 = 11,
    /// Opaque tensor data; has no plane layout.
    Tensor = 12,
    /// Sentinel, one past the last real format.
    Last = 13,
}

impl ColorFormat {
    /// Convert a raw ABI value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => ColorFormat::Invalid,
            1 => ColorFormat::Gray8,
            2 => ColorFormat::Yuv420,
            3 => ColorFormat::Nv12,
            4 => ColorFormat::Nv21,
            5 => ColorFormat::Argb,
            6 => ColorFormat::Abgr,
            7 => ColorFormat::Rgb,
            8 => ColorFormat::Bgr,
            9 => ColorFormat::Bgra,
            10 => ColorFormat::Rgba,
            11 => ColorFormat::Argb1555,
            12 => ColorFormat::Tensor,
            13 => ColorFormat::Last,
            _ => return None,
        })
    }

    /// Raw ABI value.
    #[inline]
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Whether the value lies in the accepted range (`Invalid..Last`).
    ///
    /// `Invalid` is in range: it is accepted when an explicit size is given.
    #[inline]
    pub fn in_range(self) -> bool {
        self != ColorFormat::Last
    }

    /// Whether the format has a geometric plane layout.
    pub fn has_layout(self) -> bool {
        !matches!(
            self,
            ColorFormat::Invalid | ColorFormat::Tensor | ColorFormat::Last
        )
    }
}

/// Width and height alignment applied when laying out planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    /// Row stride alignment in bytes.
    pub width: u32,
    /// Row count alignment.
    pub height: u32,
}

impl Alignment {
    /// Create an alignment. Zero values are treated as 1.
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width: if width == 0 { 1 } else { width },
            height: if height == 0 { 1 } else { height },
        }
    }

    /// No padding at all.
    pub const fn none() -> Self {
        Self::new(1, 1)
    }
}

/// Round `value` up to a multiple of `align` (`align` must be non-zero).
#[inline]
pub const fn round_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

/// Geometry of one plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneInfo {
    /// Width in pixels.
    pub width: u32,
    /// Height in rows.
    pub height: u32,
    /// Row stride in bytes.
    pub pitch: u32,
    /// Byte offset of the plane from the start of the slot.
    pub offset: u32,
    /// Total bytes occupied by the plane, including padding.
    pub psize: u32,
    /// Bytes per pixel.
    pub bytes_per_pix: u32,
}

impl PlaneInfo {
    /// Bytes of real pixel data in one row.
    #[inline]
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.bytes_per_pix as usize
    }
}

/// Per-plane layout of one surface slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneLayout {
    num_planes: u32,
    planes: [PlaneInfo; MAX_PLANES],
}

impl PlaneLayout {
    /// A layout with no planes, used for explicit-size blocks.
    pub const fn empty() -> Self {
        Self {
            num_planes: 0,
            planes: [PlaneInfo {
                width: 0,
                height: 0,
                pitch: 0,
                offset: 0,
                psize: 0,
                bytes_per_pix: 0,
            }; MAX_PLANES],
        }
    }

    /// Build a layout from individual planes.
    ///
    /// # Errors
    ///
    /// Fails if more than [`MAX_PLANES`] planes are given.
    pub fn from_planes(planes: &[PlaneInfo]) -> Result<Self> {
        if planes.len() > MAX_PLANES {
            return Err(Error::InvalidArgument(format!(
                "{} planes exceeds the maximum of {MAX_PLANES}",
                planes.len()
            )));
        }
        let mut layout = Self::empty();
        layout.planes[..planes.len()].copy_from_slice(planes);
        layout.num_planes = planes.len() as u32;
        Ok(layout)
    }

    /// Number of planes.
    #[inline]
    pub fn num_planes(&self) -> u32 {
        self.num_planes
    }

    /// Whether the layout describes no planes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_planes == 0
    }

    /// The populated planes.
    #[inline]
    pub fn planes(&self) -> &[PlaneInfo] {
        &self.planes[..self.num_planes as usize]
    }

    /// A single plane, if present.
    #[inline]
    pub fn plane(&self, index: usize) -> Option<&PlaneInfo> {
        self.planes().get(index)
    }

    /// Sum of all plane sizes.
    pub fn total_size(&self) -> u64 {
        self.planes().iter().map(|p| u64::from(p.psize)).sum()
    }
}

/// Compute the plane layout for `format` at `width` x `height`.
///
/// # Errors
///
/// Returns [`Error::InvalidFormat`] for `Invalid`, `Tensor` and `Last`,
/// which have no geometric layout.
pub fn color_format_info(
    format: ColorFormat,
    width: u32,
    height: u32,
    align: Alignment,
) -> Result<PlaneLayout> {
    // Widest case is 4 bytes per pixel; planar formats total at most twice the luma plane.
    let max_pitch = u64::from(width) * 4 + u64::from(align.width);
    let max_rows = u64::from(height) + u64::from(align.height);
    if max_pitch * max_rows * 2 > u64::from(u32::MAX) {
        return Err(Error::InvalidArgument(format!(
            "frame {width}x{height} is too large to lay out"
        )));
    }

    let plane = |w: u32, h: u32, bpp: u32| -> PlaneInfo {
        let pitch = round_up(w * bpp, align.width);
        PlaneInfo {
            width: w,
            height: h,
            pitch,
            offset: 0,
            psize: pitch * round_up(h, align.height),
            bytes_per_pix: bpp,
        }
    };

    let mut planes = match format {
        ColorFormat::Gray8 => vec![plane(width, height, 1)],
        ColorFormat::Yuv420 => vec![
            plane(width, height, 1),
            plane(width / 2, height / 2, 1),
            plane(width / 2, height / 2, 1),
        ],
        ColorFormat::Nv12 | ColorFormat::Nv21 => {
            vec![plane(width, height, 1), plane(width, height / 2, 1)]
        }
        ColorFormat::Argb | ColorFormat::Abgr | ColorFormat::Bgra | ColorFormat::Rgba => {
            vec![plane(width, height, 4)]
        }
        ColorFormat::Rgb | ColorFormat::Bgr => vec![plane(width, height, 3)],
        ColorFormat::Argb1555 => vec![plane(width, height, 2)],
        ColorFormat::Invalid | ColorFormat::Tensor | ColorFormat::Last => {
            tracing::error!(?format, "unsupported color format");
            return Err(Error::InvalidFormat(format));
        }
    };

    let mut offset = 0;
    for p in &mut planes {
        p.offset = offset;
        offset += p.psize;
    }

    PlaneLayout::from_planes(&planes)
}
