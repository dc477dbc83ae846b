//! Pixel formats, usage flags and the capability table describing which combinations a device
//! accepts.
use bitflags::bitflags;
use enumn::N;

use crate::PixelFormat;

/// Fourcc codes of the pixel formats known to this crate, with the same values as
/// `GBM_FORMAT_*` and `DRM_FORMAT_*`.
pub mod fourcc {
    use crate::PixelFormat;

    pub const R8: PixelFormat = PixelFormat::from_fourcc(b"R8  ");
    pub const GR88: PixelFormat = PixelFormat::from_fourcc(b"GR88");
    pub const RGB332: PixelFormat = PixelFormat::from_fourcc(b"RGB8");
    pub const BGR233: PixelFormat = PixelFormat::from_fourcc(b"BGR8");

    pub const XRGB4444: PixelFormat = PixelFormat::from_fourcc(b"XR12");
    pub const XBGR4444: PixelFormat = PixelFormat::from_fourcc(b"XB12");
    pub const RGBX4444: PixelFormat = PixelFormat::from_fourcc(b"RX12");
    pub const BGRX4444: PixelFormat = PixelFormat::from_fourcc(b"BX12");
    pub const ARGB4444: PixelFormat = PixelFormat::from_fourcc(b"AR12");
    pub const ABGR4444: PixelFormat = PixelFormat::from_fourcc(b"AB12");
    pub const RGBA4444: PixelFormat = PixelFormat::from_fourcc(b"RA12");
    pub const BGRA4444: PixelFormat = PixelFormat::from_fourcc(b"BA12");

    pub const XRGB1555: PixelFormat = PixelFormat::from_fourcc(b"XR15");
    pub const XBGR1555: PixelFormat = PixelFormat::from_fourcc(b"XB15");
    pub const RGBX5551: PixelFormat = PixelFormat::from_fourcc(b"RX15");
    pub const BGRX5551: PixelFormat = PixelFormat::from_fourcc(b"BX15");
    pub const ARGB1555: PixelFormat = PixelFormat::from_fourcc(b"AR15");
    pub const ABGR1555: PixelFormat = PixelFormat::from_fourcc(b"AB15");
    pub const RGBA5551: PixelFormat = PixelFormat::from_fourcc(b"RA15");
    pub const BGRA5551: PixelFormat = PixelFormat::from_fourcc(b"BA15");

    pub const RGB565: PixelFormat = PixelFormat::from_fourcc(b"RG16");
    pub const BGR565: PixelFormat = PixelFormat::from_fourcc(b"BG16");

    pub const RGB888: PixelFormat = PixelFormat::from_fourcc(b"RG24");
    pub const BGR888: PixelFormat = PixelFormat::from_fourcc(b"BG24");

    pub const XRGB8888: PixelFormat = PixelFormat::from_fourcc(b"XR24");
    pub const XBGR8888: PixelFormat = PixelFormat::from_fourcc(b"XB24");
    pub const RGBX8888: PixelFormat = PixelFormat::from_fourcc(b"RX24");
    pub const BGRX8888: PixelFormat = PixelFormat::from_fourcc(b"BX24");
    pub const ARGB8888: PixelFormat = PixelFormat::from_fourcc(b"AR24");
    pub const ABGR8888: PixelFormat = PixelFormat::from_fourcc(b"AB24");
    pub const RGBA8888: PixelFormat = PixelFormat::from_fourcc(b"RA24");
    pub const BGRA8888: PixelFormat = PixelFormat::from_fourcc(b"BA24");

    pub const XRGB2101010: PixelFormat = PixelFormat::from_fourcc(b"XR30");
    pub const RGBX1010102: PixelFormat = PixelFormat::from_fourcc(b"RX30");
    pub const BGRX1010102: PixelFormat = PixelFormat::from_fourcc(b"BX30");
    pub const ARGB2101010: PixelFormat = PixelFormat::from_fourcc(b"AR30");
    pub const ABGR2101010: PixelFormat = PixelFormat::from_fourcc(b"AB30");

    pub const YUYV: PixelFormat = PixelFormat::from_fourcc(b"YUYV");
    pub const YVYU: PixelFormat = PixelFormat::from_fourcc(b"YVYU");
    pub const UYVY: PixelFormat = PixelFormat::from_fourcc(b"UYVY");
    pub const VYUY: PixelFormat = PixelFormat::from_fourcc(b"VYUY");

    pub const NV12: PixelFormat = PixelFormat::from_fourcc(b"NV12");
    pub const NV21: PixelFormat = PixelFormat::from_fourcc(b"NV21");
    pub const YUV420: PixelFormat = PixelFormat::from_fourcc(b"YU12");
    pub const YUV422: PixelFormat = PixelFormat::from_fourcc(b"YU16");
}

/// Internal buffer formats, equivalent of `enum gbm_bo_format`.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, N)]
pub enum BoFormat {
    Xrgb8888 = 0,
    Argb8888 = 1,
}

bitflags! {
    /// What a buffer is going to be used for, with the same values as `GBM_BO_USE_*`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct UsageFlags: u32 {
        const SCANOUT = 1 << 0;
        const CURSOR = 1 << 1;
        const RENDERING = 1 << 2;
        const WRITE = 1 << 3;
        const LINEAR = 1 << 4;
        const PROTECTED = 1 << 5;
    }
}

impl UsageFlags {
    /// Returns whether this usage is subject to the capability table, i.e. whether it is
    /// exactly one of `SCANOUT`, `CURSOR` or `RENDERING`.
    ///
    /// Any other non-empty combination is accepted for every format. This mirrors the policy of
    /// the reference GBM backend for this hardware and is kept as-is, although it means that
    /// e.g. `SCANOUT | WRITE` is never checked against the table.
    pub fn is_table_checked(&self) -> bool {
        *self == Self::SCANOUT || *self == Self::CURSOR || *self == Self::RENDERING
    }
}

/// One entry of a device's capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub pixel_format: PixelFormat,
    pub bo_format: BoFormat,
    /// Every usage flag this combination may be used with.
    pub allowed_usage: UsageFlags,
}

impl FormatInfo {
    pub const fn new(
        pixel_format: PixelFormat,
        bo_format: BoFormat,
        allowed_usage: UsageFlags,
    ) -> Self {
        Self {
            pixel_format,
            bo_format,
            allowed_usage,
        }
    }

    /// Returns whether this entry describes `pixel_format` with `bo_format` and allows all of
    /// `usage`.
    pub fn allows(
        &self,
        pixel_format: PixelFormat,
        bo_format: BoFormat,
        usage: UsageFlags,
    ) -> bool {
        self.pixel_format == pixel_format
            && self.bo_format == bo_format
            && self.allowed_usage.contains(usage)
    }
}

const DEFAULT_USAGE: UsageFlags = UsageFlags::SCANOUT
    .union(UsageFlags::CURSOR)
    .union(UsageFlags::RENDERING)
    .union(UsageFlags::WRITE)
    .union(UsageFlags::LINEAR);

/// Capability table used by devices unless configured otherwise.
pub const DEFAULT_FORMATS: [FormatInfo; 4] = [
    FormatInfo::new(fourcc::ARGB8888, BoFormat::Xrgb8888, DEFAULT_USAGE),
    FormatInfo::new(fourcc::ABGR8888, BoFormat::Xrgb8888, DEFAULT_USAGE),
    FormatInfo::new(fourcc::XRGB8888, BoFormat::Xrgb8888, DEFAULT_USAGE),
    FormatInfo::new(fourcc::RGB565, BoFormat::Xrgb8888, DEFAULT_USAGE),
];

/// Returns the number of bits per pixel of `format`, or `None` if the format is unknown.
///
/// For planar YUV formats this is the average over all planes, e.g. 12 for NV12.
pub fn bpp_from_pixel_format(format: PixelFormat) -> Option<u32> {
    use fourcc::*;

    let bpp = match format {
        R8 | RGB332 | BGR233 => 8,

        GR88 => 16,

        XRGB4444 | XBGR4444 | RGBX4444 | BGRX4444 | ARGB4444 | ABGR4444 | RGBA4444 | BGRA4444
        | XRGB1555 | XBGR1555 | RGBX5551 | BGRX5551 | ARGB1555 | ABGR1555 | RGBA5551
        | BGRA5551 | RGB565 | BGR565 => 16,

        RGB888 | BGR888 => 24,

        XRGB8888 | XBGR8888 | RGBX8888 | BGRX8888 | ARGB8888 | ABGR8888 | RGBA8888 | BGRA8888
        | XRGB2101010 | RGBX1010102 | BGRX1010102 | ARGB2101010 | ABGR2101010 => 32,

        // Packed YCbCr.
        YUYV | YVYU | UYVY | VYUY => 16,

        NV12 | NV21 | YUV420 => 12,
        YUV422 => 16,

        _ => return None,
    };

    Some(bpp)
}
