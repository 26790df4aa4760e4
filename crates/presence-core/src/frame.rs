//! Frame type and single-channel intensity conversion.

use image::{GrayImage, ImageBuffer, Rgb};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pixel layout of a frame's `data` buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit grayscale, 1 byte/pixel.
    Gray8,
    /// Packed RGB, 3 bytes/pixel.
    Rgb8,
    /// Packed BGR, 3 bytes/pixel (OpenCV-style capture order).
    Bgr8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Gray8 => "gray8",
            PixelFormat::Rgb8 => "rgb8",
            PixelFormat::Bgr8 => "bgr8",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// A captured camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Capture sequence number reported by the source.
    pub sequence: u32,
}

impl Frame {
    /// Build a frame, checking that `data` covers `width * height` pixels.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u32,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            format,
            sequence,
        })
    }

    pub fn gray(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        Self::new(data, width, height, PixelFormat::Gray8, 0)
    }

    /// Single-channel intensity map (one byte per pixel).
    pub fn intensity(&self) -> Vec<u8> {
        match self.format {
            PixelFormat::Gray8 => self.data.clone(),
            PixelFormat::Rgb8 => luma_from_rgb(self.data.clone(), self.width, self.height),
            PixelFormat::Bgr8 => {
                let rgb: Vec<u8> = self
                    .data
                    .chunks_exact(3)
                    .flat_map(|px| [px[2], px[1], px[0]])
                    .collect();
                luma_from_rgb(rgb, self.width, self.height)
            }
        }
    }
}

fn luma_from_rgb(rgb: Vec<u8>, width: u32, height: u32) -> Vec<u8> {
    match ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(width, height, rgb) {
        Some(img) => {
            let gray: GrayImage = image::imageops::grayscale(&img);
            gray.into_raw()
        }
        // Length is validated in `Frame::new`; an unchecked literal frame yields no signal.
        None => Vec::new(),
    }
}

/// Mean absolute pixel difference between two intensity maps of equal size.
///
/// Returns `None` when the maps differ in length or are empty.
pub fn mean_abs_diff(a: &[u8], b: &[u8]) -> Option<f32> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let total: u64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| u64::from(x.abs_diff(y)))
        .sum();
    Some(total as f32 / a.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_short_buffer() {
        let err = Frame::new(vec![0u8; 5], 2, 1, PixelFormat::Rgb8, 0).unwrap_err();
        assert_eq!(err, FrameError::InvalidLength { expected: 6, actual: 5 });
    }

    #[test]
    fn test_gray_intensity_is_identity() {
        let frame = Frame::gray(vec![1, 2, 3, 4], 2, 2).unwrap();
        assert_eq!(frame.intensity(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_rgb_and_bgr_agree() {
        let rgb = vec![200, 10, 30, 0, 255, 0];
        let bgr = vec![30, 10, 200, 0, 255, 0];
        let a = Frame::new(rgb, 2, 1, PixelFormat::Rgb8, 0).unwrap();
        let b = Frame::new(bgr, 2, 1, PixelFormat::Bgr8, 0).unwrap();
        assert_eq!(a.intensity(), b.intensity());
        assert_eq!(a.intensity().len(), 2);
    }

    #[test]
    fn test_white_rgb_maps_to_white() {
        let frame = Frame::new(vec![255; 12], 2, 2, PixelFormat::Rgb8, 0).unwrap();
        assert!(frame.intensity().iter().all(|&p| p >= 254));
    }

    #[test]
    fn test_mean_abs_diff() {
        assert_eq!(mean_abs_diff(&[10, 20], &[10, 20]), Some(0.0));
        assert_eq!(mean_abs_diff(&[0, 100], &[10, 90]), Some(10.0));
        assert_eq!(mean_abs_diff(&[0, 100], &[0]), None);
        assert_eq!(mean_abs_diff(&[], &[]), None);
    }
}
