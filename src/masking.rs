//! Mask geometry and masked-pixel fill strategies.

use image::{imageops, GrayImage, Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::filter::gaussian_blur_f32;
use serde::{Deserialize, Serialize};

use crate::image::alpha_composite;

/// What is placed under the mask before diffusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InpaintingFill {
    /// Pre-fill the masked pixels from their surroundings (see [`MaskFill`]).
    #[default]
    Fill,
    /// Leave the original pixels in place.
    Original,
    /// Pre-fill pixels, then replace the masked latent with fresh seeded noise.
    LatentNoise,
    /// Pre-fill pixels, then zero the masked latent.
    LatentNothing,
}

/// Pixel strategy used when [`InpaintingFill`] asks for a pre-fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskFill {
    /// Layered multi-radius blur of the surrounding pixels.
    #[default]
    Blur,
    /// Mean colour of the unmasked area.
    AverageColor,
    /// Leave the pixels untouched even when a fill is requested.
    Disabled,
}

impl MaskFill {
    /// Apply this strategy to the masked area of `image`.
    #[must_use]
    pub fn apply(self, image: &RgbImage, mask: &GrayImage) -> RgbImage {
        match self {
            Self::Blur => fill(image, mask),
            Self::AverageColor => fill_average(image, mask),
            Self::Disabled => image.clone(),
        }
    }
}

/// Axis-aligned crop rectangle, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRegion {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl CropRegion {
    /// Region covering a whole `width` x `height` frame.
    #[must_use]
    pub const fn full(width: u32, height: u32) -> Self {
        Self {
            x1: 0,
            y1: 0,
            x2: width,
            y2: height,
        }
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    /// `(x, y, width, height)` where a generated crop is pasted back.
    #[must_use]
    pub const fn paste_location(&self) -> (u32, u32, u32, u32) {
        (self.x1, self.y1, self.width(), self.height())
    }
}

/// Bounding box of the non-zero pixels of `mask`, grown by `padding`.
///
/// An all-zero mask yields the full frame.
#[must_use]
pub fn bounding_region(mask: &GrayImage, padding: u32) -> CropRegion {
    let (width, height) = mask.dimensions();
    let mut bounds: Option<(u32, u32, u32, u32)> = None;

    for (x, y, pixel) in mask.enumerate_pixels() {
        if pixel[0] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
        });
    }

    let Some((x1, y1, x2, y2)) = bounds else {
        return CropRegion::full(width, height);
    };

    CropRegion {
        x1: x1.saturating_sub(padding),
        y1: y1.saturating_sub(padding),
        x2: (x2 + 1).saturating_add(padding).min(width),
        y2: (y2 + 1).saturating_add(padding).min(height),
    }
}

/// Grow `region` until its aspect ratio matches `target_w / target_h`.
///
/// Only the short axis grows, split evenly on both sides. When the grown
/// span runs past the frame it is shifted back inside and finally clamped to
/// `[0, mask_w] x [0, mask_h]`.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn expand_region(
    region: CropRegion,
    target_w: u32,
    target_h: u32,
    mask_w: u32,
    mask_h: u32,
) -> CropRegion {
    let (mut x1, mut y1) = (i64::from(region.x1), i64::from(region.y1));
    let (mut x2, mut y2) = (i64::from(region.x2), i64::from(region.y2));
    if x2 <= x1 || y2 <= y1 || target_h == 0 {
        return region;
    }

    let ratio_region = (x2 - x1) as f64 / (y2 - y1) as f64;
    let ratio_target = f64::from(target_w) / f64::from(target_h);

    if ratio_region > ratio_target {
        let desired_height = (x2 - x1) as f64 / ratio_target;
        let diff = (desired_height - (y2 - y1) as f64) as i64;
        (y1, y2) = grow_span(y1, y2, diff, i64::from(mask_h));
    } else {
        let desired_width = (y2 - y1) as f64 * ratio_target;
        let diff = (desired_width - (x2 - x1) as f64) as i64;
        (x1, x2) = grow_span(x1, x2, diff, i64::from(mask_w));
    }

    CropRegion {
        x1: x1.max(0) as u32,
        y1: y1.max(0) as u32,
        x2: x2.max(0) as u32,
        y2: y2.max(0) as u32,
    }
}

fn grow_span(mut lo: i64, mut hi: i64, diff: i64, limit: i64) -> (i64, i64) {
    lo -= diff / 2;
    hi += diff - diff / 2;
    if hi >= limit {
        let over = hi - limit;
        hi -= over;
        lo -= over;
    }
    if lo < 0 {
        hi -= lo;
        lo = 0;
    }
    if hi >= limit {
        hi = limit;
    }
    (lo, hi)
}

/// One mask per source image.
#[derive(Debug, Clone, Default)]
pub struct MaskSet {
    masks: Vec<GrayImage>,
}

impl MaskSet {
    /// Pad with copies of the last mask and truncate to `image_count`.
    #[must_use]
    pub fn normalize(mut masks: Vec<GrayImage>, image_count: usize) -> Self {
        if let Some(last) = masks.last().cloned() {
            if masks.len() < image_count {
                masks.resize(image_count, last);
            }
        }
        masks.truncate(image_count);
        Self { masks }
    }

    /// Re-normalize to `image_count` entries in place.
    pub fn fit_to(&mut self, image_count: usize) {
        *self = Self::normalize(std::mem::take(&mut self.masks), image_count);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[GrayImage] {
        &self.masks
    }
}

/// Invert an 8-bit mask.
#[must_use]
pub fn invert(mask: &GrayImage) -> GrayImage {
    let mut out = mask.clone();
    imageops::invert(&mut out);
    out
}

/// Gaussian blur that treats a zero radius as a no-op.
#[must_use]
pub fn blur_mask(mask: &GrayImage, radius: f32) -> GrayImage {
    if radius > 0.0 {
        gaussian_blur_f32(mask, radius)
    } else {
        mask.clone()
    }
}

/// Blur-fill the masked area of `image` from its surroundings.
///
/// The unmasked pixels are blurred at decreasing radii and layered on top of
/// each other, so wide blurs fill the hole and narrow ones restore detail near
/// its border.
#[must_use]
pub fn fill(image: &RgbImage, mask: &GrayImage) -> RgbImage {
    const CASCADE: [(f32, usize); 6] = [(256.0, 1), (64.0, 1), (16.0, 2), (4.0, 4), (2.0, 2), (0.0, 1)];

    let (width, height) = image.dimensions();
    let premultiplied = RgbaImage::from_fn(width, height, |x, y| {
        let alpha = 255 - mask.get_pixel(x, y)[0];
        let Rgb([r, g, b]) = *image.get_pixel(x, y);
        Rgba([mul_div(r, alpha), mul_div(g, alpha), mul_div(b, alpha), alpha])
    });

    let mut filled = RgbaImage::new(width, height);
    for (radius, repeats) in CASCADE {
        let blurred = if radius > 0.0 {
            gaussian_blur_f32(&premultiplied, radius)
        } else {
            premultiplied.clone()
        };
        let layer = unpremultiply(&blurred);
        for _ in 0..repeats {
            alpha_composite(&mut filled, &layer);
        }
    }

    RgbImage::from_fn(width, height, |x, y| {
        let Rgba([r, g, b, _]) = *filled.get_pixel(x, y);
        Rgb([r, g, b])
    })
}

/// Replace masked pixels with the mean colour of the unmasked area.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn fill_average(image: &RgbImage, mask: &GrayImage) -> RgbImage {
    let mut sum = [0u64; 3];
    let mut count = 0u64;
    for (pixel, m) in image.pixels().zip(mask.pixels()) {
        if m[0] < 128 {
            for (acc, &c) in sum.iter_mut().zip(pixel.0.iter()) {
                *acc += u64::from(c);
            }
            count += 1;
        }
    }
    if count == 0 {
        return image.clone();
    }

    let mean = Rgb(sum.map(|s| (s / count) as u8));
    let mut out = image.clone();
    for (pixel, m) in out.pixels_mut().zip(mask.pixels()) {
        if m[0] >= 128 {
            *pixel = mean;
        }
    }
    out
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
fn mul_div(value: u8, alpha: u8) -> u8 {
    ((u16::from(value) * u16::from(alpha) + 127) / 255) as u8
}

#[allow(clippy::cast_possible_truncation)]
fn unpremultiply(image: &RgbaImage) -> RgbaImage {
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        let alpha = u16::from(pixel[3]);
        if alpha == 0 {
            *pixel = Rgba([0, 0, 0, 0]);
            continue;
        }
        for c in 0..3 {
            pixel[c] = ((u16::from(pixel[c]) * 255 + alpha / 2) / alpha).min(255) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn mask_with_box(width: u32, height: u32, x1: u32, y1: u32, x2: u32, y2: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            if (x1..x2).contains(&x) && (y1..y2).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    #[test]
    fn test_bounding_region_pads_and_clamps() {
        let mask = mask_with_box(100, 80, 40, 30, 50, 40);
        assert_eq!(
            bounding_region(&mask, 5),
            CropRegion { x1: 35, y1: 25, x2: 55, y2: 45 }
        );
        assert_eq!(
            bounding_region(&mask, 64),
            CropRegion { x1: 0, y1: 0, x2: 100, y2: 80 }
        );
    }

    #[test]
    fn test_bounding_region_empty_mask_is_full_frame() {
        let mask = GrayImage::new(32, 16);
        assert_eq!(bounding_region(&mask, 8), CropRegion::full(32, 16));
    }

    #[test]
    fn test_expand_region_grows_width_only() {
        let region = CropRegion { x1: 40, y1: 20, x2: 60, y2: 60 };
        let expanded = expand_region(region, 512, 512, 200, 200);

        assert_eq!(expanded.y1, 20);
        assert_eq!(expanded.y2, 60);
        assert_eq!(expanded.width(), 40);
        assert_eq!(expanded.x1, 30);
    }

    #[test]
    fn test_expand_region_shifts_at_border() {
        let region = CropRegion { x1: 0, y1: 10, x2: 10, y2: 50 };
        let expanded = expand_region(region, 64, 64, 100, 100);

        assert_eq!(expanded, CropRegion { x1: 0, y1: 10, x2: 40, y2: 50 });
    }

    #[test]
    fn test_expand_region_clamps_to_frame() {
        let region = CropRegion { x1: 0, y1: 0, x2: 10, y2: 100 };
        let expanded = expand_region(region, 100, 10, 50, 100);

        assert_eq!(expanded.x1, 0);
        assert_eq!(expanded.x2, 50);
        assert_eq!(expanded.height(), 100);
    }

    #[test]
    fn test_mask_set_replicates_last() {
        let a = GrayImage::new(4, 4);
        let masks = MaskSet::normalize(vec![a.clone()], 3);
        assert_eq!(masks.len(), 3);
        assert!(masks.as_slice().iter().all(|m| *m == a));
    }

    #[test]
    fn test_mask_set_truncates() {
        let masks: Vec<GrayImage> = (0..5u8)
            .map(|i| GrayImage::from_pixel(2, 2, Luma([i])))
            .collect();
        let set = MaskSet::normalize(masks, 3);
        assert_eq!(set.len(), 3);
        assert_eq!(set.as_slice()[2].get_pixel(0, 0)[0], 2);
    }

    #[test]
    fn test_mask_set_fit_to_grows_in_place() {
        let mut set = MaskSet::normalize(vec![GrayImage::from_pixel(2, 2, Luma([7]))], 1);
        set.fit_to(4);
        assert_eq!(set.len(), 4);
        assert_eq!(set.as_slice()[3].get_pixel(1, 1)[0], 7);
    }

    #[test]
    fn test_fill_average_uses_unmasked_mean() {
        let image = RgbImage::from_fn(4, 1, |x, _| if x < 2 { Rgb([100, 50, 0]) } else { Rgb([0, 0, 0]) });
        let mask = mask_with_box(4, 1, 2, 0, 4, 1);

        let filled = fill_average(&image, &mask);
        assert_eq!(*filled.get_pixel(3, 0), Rgb([100, 50, 0]));
        assert_eq!(*filled.get_pixel(0, 0), Rgb([100, 50, 0]));
    }

    #[test]
    fn test_fill_keeps_unmasked_pixels() {
        let image = RgbImage::from_pixel(16, 16, Rgb([10, 200, 30]));
        let mask = mask_with_box(16, 16, 4, 4, 12, 12);

        let filled = fill(&image, &mask);
        assert_eq!(*filled.get_pixel(0, 0), Rgb([10, 200, 30]));
        let centre = filled.get_pixel(8, 8);
        assert!(centre[1] > 150, "hole should take the surrounding colour, got {centre:?}");
    }
}
