//! Raw V4L2 buffer conversion into pipeline frames.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConvertError {
    #[error("{format} buffer too short: expected {expected}, got {actual}")]
    ShortBuffer {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), ConvertError> {
    if buf.len() < expected {
        return Err(ConvertError::ShortBuffer {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Copy the first `width * height` bytes of an 8-bit grey buffer.
pub fn grey_to_gray(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = width as usize * height as usize;
    check_len("GREY", buf, pixels)?;
    Ok(buf[..pixels].to_vec())
}

/// Downscale 16-bit little-endian grey to 8 bits by keeping the high byte.
pub fn y16_to_gray(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = width as usize * height as usize;
    check_len("Y16", buf, pixels * 2)?;
    Ok(buf[..pixels * 2]
        .chunks_exact(2)
        .map(|px| px[1])
        .collect())
}

/// Convert packed YUYV (4:2:2) to interleaved RGB using BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U and V.
pub fn yuyv_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = width as usize * height as usize;
    let expected = pixels * 2;
    check_len("YUYV", buf, expected)?;

    let mut rgb = Vec::with_capacity(pixels * 3);
    for quad in buf[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f32::from(y);
    let u = f32::from(u) - 128.0;
    let v = f32::from(v) - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        clamp(y + 1.402 * v),
        clamp(y - 0.344_136 * u - 0.714_136 * v),
        clamp(y + 1.772 * u),
    ]
}

/// Copy a packed RGB24 buffer.
pub fn rgb3_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let bytes = width as usize * height as usize * 3;
    check_len("RGB3", buf, bytes)?;
    Ok(buf[..bytes].to_vec())
}

/// True if more than `threshold_pct` of the intensity samples fall in the
/// darkest eighth (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grey_truncates_padding() {
        let buf = vec![7u8; 10];
        assert_eq!(grey_to_gray(&buf, 4, 2).unwrap(), vec![7u8; 8]);
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        // 2x1: 0x1234, 0xFF00
        let buf = vec![0x34, 0x12, 0x00, 0xFF];
        assert_eq!(y16_to_gray(&buf, 2, 1).unwrap(), vec![0x12, 0xFF]);
    }

    #[test]
    fn test_yuyv_neutral_chroma_is_grey() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let yuyv = vec![100, 128, 200, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
    }

    #[test]
    fn test_yuyv_red_chroma() {
        let yuyv = vec![76, 85, 76, 255];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert!(rgb[0] > 240, "red channel {}", rgb[0]);
        assert!(rgb[1] < 10, "green channel {}", rgb[1]);
        assert!(rgb[2] < 10, "blue channel {}", rgb[2]);
        assert_eq!(&rgb[..3], &rgb[3..]);
    }

    #[test]
    fn test_short_buffers_rejected() {
        assert_eq!(
            yuyv_to_rgb(&[100, 128], 2, 1),
            Err(ConvertError::ShortBuffer {
                format: "YUYV",
                expected: 4,
                actual: 2
            })
        );
        assert!(y16_to_gray(&[0; 3], 2, 1).is_err());
        assert!(grey_to_gray(&[0; 3], 2, 2).is_err());
        assert!(rgb3_to_rgb(&[0; 5], 2, 1).is_err());
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&[0u8; 1000], 0.95));
    }

    #[test]
    fn test_dark_frame_normal() {
        assert!(!is_dark_frame(&[128u8; 1000], 0.95));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&[], 0.95));
    }

    #[test]
    fn test_dark_frame_borderline() {
        // 96% dark → dark; 94% dark → not dark
        let mut gray = vec![10u8; 960];
        gray.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&gray, 0.95));

        let mut gray = vec![10u8; 940];
        gray.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&gray, 0.95));
    }
}
