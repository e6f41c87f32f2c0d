//! Canvas-fitting resize modes.

use image::{imageops, imageops::FilterType, DynamicImage, GenericImage, GenericImageView};
use serde::{Deserialize, Serialize};

/// How a source image is fitted to the target canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMode {
    /// Stretch to the target size.
    #[default]
    JustResize,
    /// Scale to cover the canvas, then centre-crop.
    CropAndResize,
    /// Scale to fit inside the canvas, then extend the edge pixels.
    ResizeAndFill,
    /// Keep the source size and resample the encoded latent instead.
    LatentUpscale,
}

/// Resize `img` to `width` x `height` according to `mode`.
///
/// [`ResizeMode::LatentUpscale`] behaves like [`ResizeMode::JustResize`] here;
/// callers that want the latent path skip pixel resizing altogether.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn resize_image(mode: ResizeMode, img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    let (src_w, src_h) = img.dimensions();
    if (src_w, src_h) == (width, height) || src_w == 0 || src_h == 0 {
        return img.clone();
    }

    let ratio = f64::from(width) / f64::from(height);
    let src_ratio = f64::from(src_w) / f64::from(src_h);
    let scaled_h = || ((f64::from(src_h) * f64::from(width) / f64::from(src_w)) as u32).max(1);
    let scaled_w = || ((f64::from(src_w) * f64::from(height) / f64::from(src_h)) as u32).max(1);

    match mode {
        ResizeMode::JustResize | ResizeMode::LatentUpscale => {
            img.resize_exact(width, height, FilterType::Lanczos3)
        }
        ResizeMode::CropAndResize => {
            let (fit_w, fit_h) = if ratio > src_ratio {
                (width, scaled_h().max(height))
            } else {
                (scaled_w().max(width), height)
            };
            let resized = img.resize_exact(fit_w, fit_h, FilterType::Lanczos3);
            resized.crop_imm(
                fit_w.saturating_sub(width) / 2,
                fit_h.saturating_sub(height) / 2,
                width,
                height,
            )
        }
        ResizeMode::ResizeAndFill => {
            let (fit_w, fit_h) = if ratio < src_ratio {
                (width, scaled_h().min(height))
            } else {
                (scaled_w().min(width), height)
            };
            let resized = img.resize_exact(fit_w, fit_h, FilterType::Lanczos3);
            let (ox, oy) = ((width - fit_w) / 2, (height - fit_h) / 2);

            let mut canvas = resized.resize_exact(width, height, FilterType::Nearest);
            imageops::replace(&mut canvas, &resized, i64::from(ox), i64::from(oy));

            // Extend the outermost rows/columns into the empty bands.
            for y in 0..height {
                for x in 0..width {
                    let inside_x = (ox..ox + fit_w).contains(&x);
                    let inside_y = (oy..oy + fit_h).contains(&y);
                    if inside_x && inside_y {
                        continue;
                    }
                    let sx = x.clamp(ox, ox + fit_w - 1) - ox;
                    let sy = y.clamp(oy, oy + fit_h - 1) - oy;
                    canvas.put_pixel(x, y, resized.get_pixel(sx, sy));
                }
            }
            canvas
        }
    }
}
