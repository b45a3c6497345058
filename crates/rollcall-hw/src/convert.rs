//! Raw V4L2 buffer to 8-bit grayscale conversion.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConvertError {
    #[error("{format:?} buffer too short: expected {expected} bytes, got {actual}")]
    ShortBuffer {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Pixel layouts the camera can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 4:2:2, `[Y0 U Y1 V]`; luma is every even byte.
    Yuyv,
    /// One byte per pixel.
    Grey,
    /// 16-bit little-endian luma.
    Y16,
}

impl PixelFormat {
    /// Map a V4L2 FourCC code to a supported format.
    pub fn from_fourcc(code: [u8; 4]) -> Option<Self> {
        match &code {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Grey => 1,
            PixelFormat::Yuyv | PixelFormat::Y16 => 2,
        }
    }
}

/// Convert one captured buffer to `width * height` luma bytes.
pub fn to_grayscale(
    format: PixelFormat,
    buf: &[u8],
    width: u32,
    height: u32,
) -> Result<Vec<u8>, ConvertError> {
    let pixels = width as usize * height as usize;
    let expected = pixels * format.bytes_per_pixel();
    if buf.len() < expected {
        return Err(ConvertError::ShortBuffer {
            format,
            expected,
            actual: buf.len(),
        });
    }

    let gray = match format {
        PixelFormat::Grey => buf[..pixels].to_vec(),
        PixelFormat::Yuyv => buf[..expected].iter().step_by(2).copied().collect(),
        // Keep the high byte of each little-endian sample.
        PixelFormat::Y16 => buf[..expected].chunks_exact(2).map(|px| px[1]).collect(),
    };
    Ok(gray)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_takes_luma() {
        // Two pixels: Y0=10, U=99, Y1=20, V=77
        let gray = to_grayscale(PixelFormat::Yuyv, &[10, 99, 20, 77], 2, 1).unwrap();
        assert_eq!(gray, vec![10, 20]);
    }

    #[test]
    fn test_grey_passthrough_ignores_padding() {
        let gray = to_grayscale(PixelFormat::Grey, &[1, 2, 3, 4, 0xff], 2, 2).unwrap();
        assert_eq!(gray, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        // 0x1234 and 0xff00 little-endian
        let gray = to_grayscale(PixelFormat::Y16, &[0x34, 0x12, 0x00, 0xff], 2, 1).unwrap();
        assert_eq!(gray, vec![0x12, 0xff]);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let err = to_grayscale(PixelFormat::Yuyv, &[0; 6], 2, 2).unwrap_err();
        assert_eq!(
            err,
            ConvertError::ShortBuffer {
                format: PixelFormat::Yuyv,
                expected: 8,
                actual: 6
            }
        );
    }

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(*b"YUYV"), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(*b"GREY"), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(*b"Y16 "), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(*b"MJPG"), None);
    }
}
