//! Preview grid assembly.

use image::{imageops, DynamicImage, RgbImage};

/// Tile `images` into one RGB grid.
///
/// `rows` follows the options convention: a positive value is used as is,
/// `0` means one row per batch, and a negative value picks a near-square
/// layout. Cells take the size of the first image.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn image_grid(images: &[DynamicImage], batch_size: usize, rows: i32) -> RgbImage {
    let Some(first) = images.first() else {
        return RgbImage::new(0, 0);
    };

    let count = images.len();
    let rows = match rows {
        r if r > 0 => r as usize,
        0 => batch_size.max(1),
        _ => ((count as f64).sqrt().round() as usize).max(1),
    }
    .min(count);
    let cols = count.div_ceil(rows);

    let (w, h) = (first.width(), first.height());
    let mut grid = RgbImage::new(cols as u32 * w, rows as u32 * h);

    for (i, img) in images.iter().enumerate() {
        let x = (i % cols) as u32 * w;
        let y = (i / cols) as u32 * h;
        imageops::replace(&mut grid, &img.to_rgb8(), i64::from(x), i64::from(y));
    }

    grid
}
