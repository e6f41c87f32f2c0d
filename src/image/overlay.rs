//! Compositing generated images back over their sources.

use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, Rgb, RgbImage, Rgba, RgbaImage};

use crate::masking::CropRegion;

use super::resize::{resize_image, ResizeMode};

/// Source pixels restricted to the area outside `mask` (alpha = 255 - mask).
#[must_use]
pub fn masked_overlay(image: &RgbImage, mask: &GrayImage) -> RgbaImage {
    let mask = fit_mask(mask, image.width(), image.height());
    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let Rgb([r, g, b]) = *image.get_pixel(x, y);
        Rgba([r, g, b, 255 - mask.get_pixel(x, y)[0]])
    })
}

/// Paste `image` into `paste` (if any) and composite `overlay` on top.
///
/// Without an overlay the image is returned unchanged.
#[must_use]
pub fn apply_overlay(image: &RgbImage, paste: Option<CropRegion>, overlay: Option<&RgbaImage>) -> RgbImage {
    let Some(overlay) = overlay else {
        return image.clone();
    };

    let mut base = match paste {
        Some(region) => {
            let mut base = RgbaImage::new(overlay.width(), overlay.height());
            let resized = resize_image(
                ResizeMode::CropAndResize,
                &DynamicImage::ImageRgb8(image.clone()),
                region.width(),
                region.height(),
            )
            .to_rgba8();
            imageops::replace(&mut base, &resized, i64::from(region.x1), i64::from(region.y1));
            base
        }
        None => DynamicImage::ImageRgb8(image.clone()).to_rgba8(),
    };

    alpha_composite(&mut base, overlay);
    DynamicImage::ImageRgba8(base).to_rgb8()
}

/// The image with alpha taken from `mask`: visible only where it was regenerated.
#[must_use]
pub fn mask_composite(image: &RgbImage, mask: &GrayImage) -> RgbaImage {
    let mask = resize_image(
        ResizeMode::ResizeAndFill,
        &DynamicImage::ImageLuma8(mask.clone()),
        image.width(),
        image.height(),
    )
    .to_luma8();

    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let Rgb([r, g, b]) = *image.get_pixel(x, y);
        Rgba([r, g, b, mask.get_pixel(x, y)[0]])
    })
}

/// Resize a mask to `width` x `height` if it is not already that size.
pub(crate) fn fit_mask(mask: &GrayImage, width: u32, height: u32) -> GrayImage {
    if mask.dimensions() == (width, height) {
        mask.clone()
    } else {
        imageops::resize(mask, width, height, FilterType::Lanczos3)
    }
}

/// Porter-Duff "over" of `top` onto `base`, in place. Opaque top pixels are copied exactly.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn alpha_composite(base: &mut RgbaImage, top: &RgbaImage) {
    let (width, height) = (base.width().min(top.width()), base.height().min(top.height()));

    for y in 0..height {
        for x in 0..width {
            let fg = *top.get_pixel(x, y);
            match fg[3] {
                0 => continue,
                255 => {
                    base.put_pixel(x, y, fg);
                    continue;
                }
                _ => {}
            }

            let bg = base.get_pixel_mut(x, y);
            let fa = f32::from(fg[3]) / 255.0;
            let ba = f32::from(bg[3]) / 255.0;
            let out_a = fa + ba * (1.0 - fa);
            for c in 0..3 {
                let value = f32::from(fg[c]).mul_add(fa, f32::from(bg[c]) * ba * (1.0 - fa)) / out_a;
                bg[c] = value.round().clamp(0.0, 255.0) as u8;
            }
            bg[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_overlay_restores_unmasked_pixels() {
        let source = RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 30) as u8, (y * 30) as u8, 7]));
        let mask = GrayImage::from_fn(8, 8, |x, _| if x >= 4 { Luma([255]) } else { Luma([0]) });
        let overlay = masked_overlay(&source, &mask);

        let generated = RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]));
        let out = apply_overlay(&generated, None, Some(&overlay));

        assert_eq!(out.get_pixel(1, 1), source.get_pixel(1, 1));
        assert_eq!(*out.get_pixel(6, 6), Rgb([1, 2, 3]));
    }

    #[test]
    fn test_overlay_pastes_into_region() {
        let source = RgbImage::from_pixel(16, 16, Rgb([50, 50, 50]));
        let mask = GrayImage::from_fn(16, 16, |x, y| {
            if (8..12).contains(&x) && (8..12).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        let overlay = masked_overlay(&source, &mask);
        let region = CropRegion { x1: 8, y1: 8, x2: 12, y2: 12 };

        let generated = RgbImage::from_pixel(32, 32, Rgb([200, 0, 0]));
        let out = apply_overlay(&generated, Some(region), Some(&overlay));

        assert_eq!(out.dimensions(), (16, 16));
        assert_eq!(*out.get_pixel(0, 0), Rgb([50, 50, 50]));
        assert_eq!(*out.get_pixel(9, 9), Rgb([200, 0, 0]));
    }

    #[test]
    fn test_mask_composite_alpha_follows_mask() {
        let image = RgbImage::from_pixel(4, 4, Rgb([9, 8, 7]));
        let mask = GrayImage::from_fn(4, 4, |x, _| Luma([if x < 2 { 0 } else { 255 }]));

        let out = mask_composite(&image, &mask);
        assert_eq!(out.get_pixel(0, 0)[3], 0);
        assert_eq!(*out.get_pixel(3, 0), Rgba([9, 8, 7, 255]));
    }

    #[test]
    fn test_no_overlay_is_identity() {
        let image = RgbImage::from_pixel(4, 4, Rgb([1, 1, 1]));
        assert_eq!(apply_overlay(&image, None, None), image);
    }
}
