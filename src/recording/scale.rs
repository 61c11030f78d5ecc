// Software resampling of BGRA frames to the encoder's output size

use crate::recording::types::{RawImage, VideoSize};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgba};

// Lanczos resample; None when the pixel buffer does not match its dimensions.
// Channel order is irrelevant to the filter, so BGRA passes through as RGBA.
pub fn resample(image: RawImage, target: VideoSize) -> Option<RawImage> {
    if target.width == 0 || target.height == 0 || image.data.len() != image.expected_len() {
        return None;
    }
    if image.size() == target {
        return Some(image);
    }

    let source: ImageBuffer<Rgba<u8>, Vec<u8>> =
        ImageBuffer::from_raw(image.width, image.height, image.data)?;
    let resized = imageops::resize(&source, target.width, target.height, FilterType::Lanczos3);

    Some(RawImage {
        width: target.width,
        height: target.height,
        data: resized.into_raw(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32) -> RawImage {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&[10, 20, 30, 255]);
        }
        RawImage { width, height, data }
    }

    #[test]
    fn test_resample_to_target_size() {
        let scaled = resample(solid(64, 36), VideoSize::new(32, 18)).unwrap();
        assert_eq!(scaled.size(), VideoSize::new(32, 18));
        assert_eq!(scaled.data.len(), 32 * 18 * 4);
        // A flat image stays flat, give or take rounding
        for (got, want) in scaled.data[0..4].iter().zip([10u8, 20, 30, 255]) {
            assert!((*got as i16 - want as i16).abs() <= 1);
        }
    }

    #[test]
    fn test_resample_rejects_short_buffer() {
        let mut image = solid(16, 16);
        image.data.truncate(100);
        assert!(resample(image, VideoSize::new(8, 8)).is_none());
    }
}
