//! Image preprocessing for the vision encoder.
//!
//! Turns raw photo bytes into the tensor CLIP was trained on:
//! 1. Decode with the `image` crate
//! 2. Center crop to a square on the shortest edge
//! 3. Resize to 224x224
//! 4. Scale to [0, 1] and normalize each channel with the CLIP mean/std
//! 5. Lay out as NCHW

use image::{imageops::FilterType, DynamicImage, GenericImageView};

use crate::semantic::extractor::{ModelInput, IMAGE_SIZE};

/// Per-channel mean of the CLIP training set (RGB)
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];

/// Per-channel standard deviation of the CLIP training set (RGB)
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("image has no pixels ({0}x{1})")]
    Empty(u32, u32),
}

/// Decode photo bytes into an encoder-ready image input.
pub fn preprocess_image(bytes: &[u8]) -> Result<ModelInput, PreprocessError> {
    let image = image::load_from_memory(bytes)?;
    let pixels = image_to_tensor(&image)?;
    Ok(ModelInput::Image { pixels })
}

/// Center crop, resize and normalize an already decoded image.
pub fn image_to_tensor(image: &DynamicImage) -> Result<Vec<f32>, PreprocessError> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Err(PreprocessError::Empty(w, h));
    }

    // cropping the centered square first keeps the resize bounded by the
    // output size, whatever the aspect ratio
    let side = w.min(h);
    let size = IMAGE_SIZE as u32;
    let resized = image
        .crop_imm((w - side) / 2, (h - side) / 2, side, side)
        .resize_exact(size, size, FilterType::Triangle)
        .to_rgb8();

    let plane = IMAGE_SIZE * IMAGE_SIZE;
    let mut pixels = vec![0.0f32; 3 * plane];

    for y in 0..IMAGE_SIZE {
        for x in 0..IMAGE_SIZE {
            let pixel = resized.get_pixel(x as u32, y as u32);
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                pixels[c * plane + y * IMAGE_SIZE + x] = (value - CLIP_MEAN[c]) / CLIP_STD[c];
            }
        }
    }

    Ok(pixels)
}

#[cfg(test)]
pub(crate) fn encode_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    let buffer = ImageBuffer::from_pixel(width, height, Rgb(rgb));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(buffer)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::extractor::IMAGE_TENSOR_LEN;

    #[test]
    fn test_tensor_shape_for_landscape_image() {
        let bytes = encode_png(640, 320, [255, 0, 0]);
        let ModelInput::Image { pixels } = preprocess_image(&bytes).unwrap() else {
            panic!("expected image input");
        };
        assert_eq!(pixels.len(), IMAGE_TENSOR_LEN);
    }

    #[test]
    fn test_channel_normalization() {
        let bytes = encode_png(300, 400, [255, 0, 128]);
        let ModelInput::Image { pixels } = preprocess_image(&bytes).unwrap() else {
            panic!("expected image input");
        };
        let plane = IMAGE_SIZE * IMAGE_SIZE;
        let red = (1.0 - CLIP_MEAN[0]) / CLIP_STD[0];
        let green = (0.0 - CLIP_MEAN[1]) / CLIP_STD[1];
        let blue = (128.0 / 255.0 - CLIP_MEAN[2]) / CLIP_STD[2];

        // solid colour survives resizing, so every pixel of a plane is equal
        assert!((pixels[0] - red).abs() < 1e-4);
        assert!((pixels[plane + 17] - green).abs() < 1e-4);
        assert!((pixels[2 * plane + plane - 1] - blue).abs() < 1e-4);
    }

    #[test]
    fn test_small_image_is_upscaled() {
        let bytes = encode_png(10, 5, [0, 0, 0]);
        assert!(preprocess_image(&bytes).is_ok());
    }

    #[test]
    fn test_extreme_aspect_ratio_stays_small() {
        for (w, h) in [(1, 3000), (4000, 2)] {
            let bytes = encode_png(w, h, [10, 200, 30]);
            let ModelInput::Image { pixels } = preprocess_image(&bytes).unwrap() else {
                panic!("expected image input");
            };
            assert_eq!(pixels.len(), IMAGE_TENSOR_LEN);
            let green = (200.0 / 255.0 - CLIP_MEAN[1]) / CLIP_STD[1];
            assert!((pixels[IMAGE_SIZE * IMAGE_SIZE + 5] - green).abs() < 1e-4);
        }
    }

    #[test]
    fn test_crop_keeps_the_center() {
        // left and right thirds black, middle third white
        let image = image::RgbImage::from_fn(300, 100, |x, _| {
            if (100..200).contains(&x) {
                image::Rgb([255, 255, 255])
            } else {
                image::Rgb([0, 0, 0])
            }
        });
        let pixels = image_to_tensor(&DynamicImage::ImageRgb8(image)).unwrap();
        let white = (1.0 - CLIP_MEAN[0]) / CLIP_STD[0];
        assert!((pixels[0] - white).abs() < 1e-4);
        assert!((pixels[IMAGE_SIZE * IMAGE_SIZE - 1] - white).abs() < 1e-4);
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        let result = preprocess_image(b"definitely not an image");
        assert!(matches!(result, Err(PreprocessError::Decode(_))));
    }
}
