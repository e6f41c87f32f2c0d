//! Image loading and tensor conversion.

use std::path::Path;

use image::{DynamicImage, Rgb, RgbImage};
use ndarray::{Array3, Array4};

use crate::error::{Error, Result};

use super::{ImageTensor, RGB_CHANNELS};

/// Load an image from disk.
///
/// # Errors
///
/// Returns an error if the image cannot be opened or decoded.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path = path.as_ref();

    image::open(path).map_err(|source| Error::ImageLoad {
        path: path.to_path_buf(),
        source,
    })
}

/// Composite any transparency in `img` over a solid `background`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn flatten(img: &DynamicImage, background: Rgb<u8>) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }

    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let pixel = rgba.get_pixel(x, y);
        let alpha = f32::from(pixel[3]) / 255.0;
        let mix = |fg: u8, bg: u8| {
            f32::from(fg).mul_add(alpha, f32::from(bg) * (1.0 - alpha)).round().clamp(0.0, 255.0) as u8
        };
        Rgb([
            mix(pixel[0], background[0]),
            mix(pixel[1], background[1]),
            mix(pixel[2], background[2]),
        ])
    })
}

/// Convert an RGB image to a CHW tensor normalized to [-1, 1].
#[must_use]
pub fn image_to_tensor(img: &RgbImage) -> Array3<f32> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let mut tensor = Array3::<f32>::zeros((RGB_CHANNELS, height, width));

    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..RGB_CHANNELS {
            // Normalize from [0, 255] to [-1, 1]
            tensor[[c, y, x]] = (f32::from(pixel[c]) / 127.5) - 1.0;
        }
    }

    tensor
}

/// Stack equally sized RGB images into one NCHW batch tensor.
///
/// # Errors
///
/// Returns an error if the batch is empty or the images differ in size.
pub fn images_to_tensor(images: &[RgbImage]) -> Result<ImageTensor> {
    let first = images.first().ok_or_else(|| Error::invalid("images", "batch is empty"))?;
    let (width, height) = first.dimensions();

    let mut batch = Array4::<f32>::zeros((images.len(), RGB_CHANNELS, height as usize, width as usize));
    for (i, img) in images.iter().enumerate() {
        if img.dimensions() != (width, height) {
            return Err(Error::ShapeMismatch {
                expected: format!("{width}x{height}"),
                actual: format!("{}x{}", img.width(), img.height()),
            });
        }
        batch
            .index_axis_mut(ndarray::Axis(0), i)
            .assign(&image_to_tensor(img));
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn test_tensor_shape() {
        let img = RgbImage::new(100, 60);
        let tensor = images_to_tensor(&[img.clone(), img]).unwrap();

        assert_eq!(tensor.shape(), &[2, 3, 60, 100]);
    }

    #[test]
    fn test_normalization_range() {
        let img = RgbImage::new(16, 16);
        let tensor = image_to_tensor(&img);

        // Black image should be all -1.0
        assert!(tensor.iter().all(|&v| (v - (-1.0)).abs() < 1e-6));

        let white = RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]));
        assert!(image_to_tensor(&white).iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_mismatched_sizes_rejected() {
        let result = images_to_tensor(&[RgbImage::new(8, 8), RgbImage::new(16, 8)]);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_flatten_over_background() {
        let mut rgba = RgbaImage::new(2, 1);
        rgba.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        rgba.put_pixel(1, 0, Rgba([10, 20, 30, 255]));

        let flat = flatten(&DynamicImage::ImageRgba8(rgba), Rgb([255, 255, 255]));
        assert_eq!(*flat.get_pixel(0, 0), Rgb([255, 255, 255]));
        assert_eq!(*flat.get_pixel(1, 0), Rgb([10, 20, 30]));
    }
}
