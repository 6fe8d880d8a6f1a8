//! Pixel format ↔ Media Foundation video subtype.
//!
//! Video subtypes are `{code-0000-0010-8000-00AA00389B71}`, where `code` is a
//! FourCC or a D3DFORMAT value. Only the first field differs, so the table is
//! kept as plain `u32` codes.

use vidcap_core::PixelFormat;

pub const fn fourcc(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

/// Trailing fields shared by every video subtype GUID.
pub const SUBTYPE_DATA2: u16 = 0x0000;
pub const SUBTYPE_DATA3: u16 = 0x0010;
pub const SUBTYPE_DATA4: [u8; 8] = [0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71];

// D3DFORMAT values used for uncompressed RGB subtypes.
const D3DFMT_R8G8B8: u32 = 20;
const D3DFMT_A8R8G8B8: u32 = 21;
const D3DFMT_X8R8G8B8: u32 = 22;
const D3DFMT_R5G6B5: u32 = 23;
const D3DFMT_A1R5G5B5: u32 = 25;
const D3DFMT_A4R4G4B4: u32 = 26;
const D3DFMT_A8B8G8R8: u32 = 32;

const TABLE: [(PixelFormat, u32); 15] = [
    (PixelFormat::I420, fourcc(b"I420")),
    (PixelFormat::Iyuv, fourcc(b"IYUV")),
    (PixelFormat::Rgb24, D3DFMT_R8G8B8),
    (PixelFormat::Abgr, D3DFMT_A8B8G8R8),
    (PixelFormat::Argb, D3DFMT_A8R8G8B8),
    (PixelFormat::Argb4444, D3DFMT_A4R4G4B4),
    (PixelFormat::Rgb565, D3DFMT_R5G6B5),
    (PixelFormat::Argb1555, D3DFMT_A1R5G5B5),
    (PixelFormat::Yuy2, fourcc(b"YUY2")),
    (PixelFormat::Yv12, fourcc(b"YV12")),
    (PixelFormat::Uyvy, fourcc(b"UYVY")),
    (PixelFormat::Mjpeg, fourcc(b"MJPG")),
    (PixelFormat::Nv21, fourcc(b"NV21")),
    (PixelFormat::Nv12, fourcc(b"NV12")),
    (PixelFormat::Bgra, D3DFMT_X8R8G8B8),
];

/// First field of the subtype GUID. `Unknown` maps to the base GUID (0),
/// which never matches a real media type.
pub fn code_for(format: PixelFormat) -> u32 {
    TABLE.iter().find(|(f, _)| *f == format).map_or(0, |(_, code)| *code)
}

pub fn format_for(code: u32) -> PixelFormat {
    TABLE
        .iter()
        .find(|(_, c)| *c == code)
        .map_or(PixelFormat::Unknown, |(format, _)| *format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_is_little_endian() {
        assert_eq!(fourcc(b"NV12"), 0x3231_564E);
        assert_eq!(fourcc(b"MJPG"), 0x4750_4A4D);
    }

    #[test]
    fn codes_identify_one_format_each() {
        for format in PixelFormat::ALL {
            let code = code_for(format);
            if format == PixelFormat::Unknown {
                assert_eq!(code, 0);
            } else {
                assert_eq!(format_for(code), format, "{format}");
            }
        }
    }

    #[test]
    fn unmapped_subtype_is_unknown() {
        assert_eq!(format_for(fourcc(b"H264")), PixelFormat::Unknown);
        assert_eq!(format_for(0), PixelFormat::Unknown);
    }
}
