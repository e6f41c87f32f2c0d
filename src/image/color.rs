//! Colour correction by LAB histogram matching.
//!
//! A reference histogram is captured from the prepared init image. After
//! generation the output's LAB channels are matched to it, and the result is
//! blended back so only hue and saturation move while the generated image
//! keeps its own luminosity.

use image::{Rgb, RgbImage};
use palette::white_point::D65;
use palette::{FromColor, IntoColor, Lab, LinSrgb, Srgb};

const BINS: usize = 256;

/// Per-channel LAB histograms of a reference image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorReference {
    histograms: [[u64; BINS]; 3],
    total: u64,
}

impl ColorReference {
    /// Record the LAB histograms of `image`.
    #[must_use]
    pub fn capture(image: &RgbImage) -> Self {
        tracing::debug!("Calibrating color correction");

        let mut histograms = [[0u64; BINS]; 3];
        for pixel in image.pixels() {
            let lab = rgb_to_lab(*pixel);
            for (channel, hist) in histograms.iter_mut().enumerate() {
                hist[bin(channel, lab[channel])] += 1;
            }
        }

        Self {
            histograms,
            total: u64::from(image.width()) * u64::from(image.height()),
        }
    }
}

/// Match `image` to `reference` in LAB space, then restore its luminosity.
#[must_use]
pub fn apply_color_correction(reference: &ColorReference, image: &RgbImage) -> RgbImage {
    tracing::debug!("Applying color correction");

    if reference.total == 0 || image.width() == 0 || image.height() == 0 {
        return image.clone();
    }

    let lab: Vec<[f32; 3]> = image.pixels().map(|p| rgb_to_lab(*p)).collect();

    let mut lookups = [[0f64; BINS]; 3];
    for (channel, lookup) in lookups.iter_mut().enumerate() {
        let mut counts = [0u64; BINS];
        for px in &lab {
            counts[bin(channel, px[channel])] += 1;
        }
        *lookup = match_channel(&counts, &reference.histograms[channel], reference.total);
    }

    let mut corrected = image.clone();
    for (pixel, px) in corrected.pixels_mut().zip(&lab) {
        // Each pixel moves by its bin's displacement, keeping sub-bin detail.
        let matched: [f32; 3] = std::array::from_fn(|channel| {
            let from = bin(channel, px[channel]);
            px[channel] + bin_to_lab(channel, lookups[channel][from]) - bin_to_lab(channel, from as f64)
        });
        *pixel = lab_to_rgb(matched);
    }

    for (pixel, original) in corrected.pixels_mut().zip(image.pixels()) {
        *pixel = blend_luminosity(*pixel, *original);
    }

    corrected
}

/// Histogram bin of a LAB component (L spans 0..100, a/b are offset by 128).
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn bin(channel: usize, value: f32) -> usize {
    let scaled = if channel == 0 { value * 255.0 / 100.0 } else { value + 128.0 };
    scaled.round().clamp(0.0, 255.0) as usize
}

#[allow(clippy::cast_possible_truncation)]
fn bin_to_lab(channel: usize, bin: f64) -> f32 {
    if channel == 0 {
        (bin * 100.0 / 255.0) as f32
    } else {
        (bin - 128.0) as f32
    }
}

/// Quantile-map source bins onto the template distribution.
#[allow(clippy::cast_precision_loss)]
fn match_channel(source: &[u64; BINS], template: &[u64; BINS], template_total: u64) -> [f64; BINS] {
    let source_total: u64 = source.iter().sum();

    let mut tmpl_values = Vec::new();
    let mut tmpl_quantiles = Vec::new();
    let mut acc = 0u64;
    for (value, &count) in template.iter().enumerate() {
        if count > 0 {
            acc += count;
            tmpl_values.push(value as f64);
            tmpl_quantiles.push(acc as f64 / template_total as f64);
        }
    }

    let mut lookup = [0f64; BINS];
    let mut acc = 0u64;
    for (value, &count) in source.iter().enumerate() {
        acc += count;
        let quantile = acc as f64 / source_total.max(1) as f64;
        lookup[value] = interp(quantile, &tmpl_quantiles, &tmpl_values).clamp(0.0, 255.0);
    }
    lookup
}

/// Piecewise-linear interpolation clamped to the end points.
fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let (Some(&x0), Some(&x_last)) = (xp.first(), xp.last()) else {
        return 0.0;
    };
    if x <= x0 {
        return fp[0];
    }
    if x >= x_last {
        return fp[fp.len() - 1];
    }
    let idx = xp.partition_point(|&v| v <= x);
    let (xa, xb) = (xp[idx - 1], xp[idx]);
    let (fa, fb) = (fp[idx - 1], fp[idx]);
    if xb == xa {
        return fa;
    }
    fa + (fb - fa) * (x - xa) / (xb - xa)
}

fn rgb_to_lab(pixel: Rgb<u8>) -> [f32; 3] {
    let [r, g, b] = pixel.0.map(|c| f32::from(c) / 255.0);
    let linear: LinSrgb<f32> = Srgb::new(r, g, b).into_linear();
    let lab: Lab = Lab::from_color(linear);
    [lab.l, lab.a, lab.b]
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn lab_to_rgb([l, a, b]: [f32; 3]) -> Rgb<u8> {
    let linear: LinSrgb<f32> = Lab::<D65, f32>::new(l, a, b).into_color();
    let srgb: Srgb<f32> = Srgb::from_linear(linear);
    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([to_u8(srgb.red), to_u8(srgb.green), to_u8(srgb.blue)])
}

fn lum(c: [f64; 3]) -> f64 {
    0.3 * c[0] + 0.59 * c[1] + 0.11 * c[2]
}

/// Colours of `base` with the luminosity of `source`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn blend_luminosity(base: Rgb<u8>, source: Rgb<u8>) -> Rgb<u8> {
    let base = base.0.map(|c| f64::from(c) / 255.0);
    let source = source.0.map(|c| f64::from(c) / 255.0);

    let d = lum(source) - lum(base);
    let mut c = base.map(|v| v + d);

    let l = lum(c);
    let n = c.iter().copied().fold(f64::INFINITY, f64::min);
    let x = c.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if n < 0.0 {
        c = c.map(|v| l + (v - l) * l / (l - n));
    }
    if x > 1.0 {
        c = c.map(|v| l + (v - l) * (1.0 - l) / (x - l));
    }

    Rgb(c.map(|v| (v * 255.0).round().clamp(0.0, 255.0) as u8))
}
