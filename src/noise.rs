//! Seed-deterministic latent noise.
//!
//! Noise is produced on the CPU with the same MT19937 + Box-Muller scheme that
//! `torch.randn` uses, so a seed maps to the same latent on every machine and
//! stays compatible with seeds recorded by other diffusion front-ends.

use ndarray::{s, stack, Array3, Array4, ArrayView3, Axis};
use rand::Rng;
use rand_mt::Mt;

use crate::error::{Error, Result};

/// Largest seed handed out by [`fixed_seed`] (exclusive).
pub const MAX_RANDOM_SEED: u64 = 4_294_967_294;

/// Cosine similarity above which slerp degrades to a linear blend.
const SLERP_PARALLEL_THRESHOLD: f64 = 0.9995;

/// MT19937 + Box-Muller generator matching CPU `torch.randn`.
///
/// Tensors with at least 16 elements go through the vectorised path
/// (24-bit float uniforms, chunks of 16); smaller ones use the scalar path
/// (53-bit double uniforms, second Box-Muller value cached).
#[derive(Debug, Clone)]
pub struct TorchRng {
    rng: Mt,
    cached: Option<f32>,
}

impl TorchRng {
    /// Seed the generator. Only the low 32 bits are used, like `torch.manual_seed`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mt::new(seed as u32),
            cached: None,
        }
    }

    #[inline]
    fn uniform_double(&mut self) -> f64 {
        const MASK_53BIT: u64 = 0x001F_FFFF_FFFF_FFFF;
        const DIVISOR: f64 = 9_007_199_254_740_992.0; // 2^53
        let lo = u64::from(self.rng.next_u32());
        let hi = u64::from(self.rng.next_u32());
        #[allow(clippy::cast_precision_loss)]
        let value = (((lo << 32) | hi) & MASK_53BIT) as f64 / DIVISOR;
        value
    }

    #[inline]
    fn uniform_float(&mut self) -> f32 {
        const MASK_24BIT: u32 = 0x00FF_FFFF;
        const DIVISOR: f32 = 16_777_216.0; // 2^24
        #[allow(clippy::cast_precision_loss)]
        let value = (self.rng.next_u32() & MASK_24BIT) as f32 / DIVISOR;
        value
    }

    /// Draw one value from N(0, 1) using the scalar path.
    #[allow(clippy::cast_possible_truncation)]
    pub fn sample_scalar(&mut self) -> f32 {
        if let Some(cached) = self.cached.take() {
            return cached;
        }

        let u1 = self.uniform_double();
        let u2 = self.uniform_double();

        let r = (-2.0_f64 * (1.0_f64 - u2).ln()).sqrt();
        let theta = 2.0_f64 * std::f64::consts::PI * u1;

        self.cached = Some((r * theta.sin()) as f32);
        (r * theta.cos()) as f32
    }

    /// Transform 16 uniforms in place: `[0..8]` become cosines, `[8..16]` sines.
    fn normal_fill_16(data: &mut [f32]) {
        for j in 0..8 {
            let u1 = 1.0_f32 - data[j];
            let u2 = data[j + 8];
            let radius = (-2.0_f32 * u1.ln()).sqrt();
            let theta = 2.0_f32 * std::f32::consts::PI * u2;
            data[j] = radius * theta.cos();
            data[j + 8] = radius * theta.sin();
        }
    }

    fn fill_vectorized(&mut self, count: usize) -> Vec<f32> {
        let mut data: Vec<f32> = (0..count).map(|_| self.uniform_float()).collect();

        for start in (0..=count - 16).step_by(16) {
            Self::normal_fill_16(&mut data[start..start + 16]);
        }

        // The tail is covered by redrawing the last 16 slots.
        if count % 16 != 0 {
            let tail = count - 16;
            for value in &mut data[tail..] {
                *value = self.uniform_float();
            }
            Self::normal_fill_16(&mut data[tail..]);
        }

        data
    }

    /// Draw a `(c, h, w)` tensor of standard normal values.
    ///
    /// # Errors
    ///
    /// Returns an error if the drawn values do not fill `shape`.
    pub fn randn(&mut self, shape: [usize; 3]) -> Result<Array3<f32>> {
        let count: usize = shape.iter().product();
        let data = if count >= 16 {
            self.fill_vectorized(count)
        } else {
            (0..count).map(|_| self.sample_scalar()).collect()
        };

        Array3::from_shape_vec((shape[0], shape[1], shape[2]), data).map_err(|err| Error::ShapeMismatch {
            expected: format!("{shape:?} noise"),
            actual: err.to_string(),
        })
    }
}

/// Replace the "random" seed marker (`-1` or any negative) with a concrete seed.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn fixed_seed(seed: i64) -> u64 {
    if seed < 0 {
        rand::rng().random_range(0..MAX_RANDOM_SEED)
    } else {
        seed as u64
    }
}

/// Spherical linear interpolation between two noise tensors.
///
/// Both tensors are treated as one flattened row. Near-parallel inputs fall
/// back to a linear blend so the `1 / sin(omega)` term never explodes.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn slerp(val: f32, low: &Array3<f32>, high: &Array3<f32>) -> Array3<f32> {
    let norm = |t: &Array3<f32>| t.iter().map(|&x| f64::from(x) * f64::from(x)).sum::<f64>().sqrt();
    let (low_norm, high_norm) = (norm(low), norm(high));

    let dot = if low_norm > 0.0 && high_norm > 0.0 {
        low.iter()
            .zip(high.iter())
            .map(|(&a, &b)| (f64::from(a) / low_norm) * (f64::from(b) / high_norm))
            .sum::<f64>()
    } else {
        1.0
    };

    if dot > SLERP_PARALLEL_THRESHOLD {
        return low * (1.0 - val) + high * val;
    }

    let omega = dot.clamp(-1.0, 1.0).acos();
    let so = omega.sin();
    let val = f64::from(val);
    let w_low = (((1.0 - val) * omega).sin() / so) as f32;
    let w_high = ((val * omega).sin() / so) as f32;

    low * w_low + high * w_high
}

/// Variation-seed and seed-resize parameters shared by a batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct Variation<'a> {
    /// Secondary seeds, one per batch entry; missing entries use seed 0.
    pub subseeds: Option<&'a [u64]>,
    /// Blend weight of the sub-seed noise in `[0, 1]`.
    pub strength: f32,
    /// Pixel resolution `(width, height)` the seed was originally used at.
    pub resize_from: Option<(u32, u32)>,
}

/// Noise for one batch plus any pre-drawn sampler-internal noise.
#[derive(Debug, Clone)]
pub struct NoiseBatch {
    /// `(batch, c, h, w)` initial noise.
    pub noise: Array4<f32>,
    /// One `(batch, c, h, w)` stack per sampler noise slot.
    pub sampler_noises: Option<Vec<Array4<f32>>>,
}

/// Produces reproducible latent noise from integer seeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoiseGenerator {
    /// Offset added to the seed before drawing sampler noise (0 = disabled).
    pub eta_noise_seed_delta: u64,
    /// Pre-draw sampler noise so batched seeds match single-seed runs.
    pub enable_batch_seeds: bool,
}

impl NoiseGenerator {
    /// Create a generator.
    #[must_use]
    pub const fn new(eta_noise_seed_delta: u64, enable_batch_seeds: bool) -> Self {
        Self {
            eta_noise_seed_delta,
            enable_batch_seeds,
        }
    }

    /// Generate one noise tensor of `shape` per seed and stack them.
    ///
    /// `sampler_slots` is the number of noise tensors the sampler draws
    /// internally per image; pass 0 when no sampler noise is wanted.
    ///
    /// # Errors
    ///
    /// Returns an error if `seeds` is empty.
    pub fn generate(
        &self,
        shape: [usize; 3],
        seeds: &[u64],
        variation: &Variation<'_>,
        sampler_slots: usize,
    ) -> Result<NoiseBatch> {
        if seeds.is_empty() {
            return Err(Error::invalid("seeds", "at least one seed is required"));
        }

        let noise_shape = match variation.resize_from {
            Some((w, h)) if w > 0 && h > 0 => [shape[0], h as usize / 8, w as usize / 8],
            _ => shape,
        };

        let want_sampler_noise = sampler_slots > 0
            && ((seeds.len() > 1 && self.enable_batch_seeds) || self.eta_noise_seed_delta > 0);
        let mut sampler_noises: Vec<Vec<Array3<f32>>> = if want_sampler_noise {
            vec![Vec::with_capacity(seeds.len()); sampler_slots]
        } else {
            Vec::new()
        };

        let mut xs = Vec::with_capacity(seeds.len());
        for (i, &seed) in seeds.iter().enumerate() {
            let subnoise = variation
                .subseeds
                .map(|subseeds| {
                    let subseed = subseeds.get(i).copied().unwrap_or(0);
                    TorchRng::new(subseed).randn(noise_shape)
                })
                .transpose()?;

            let mut rng = TorchRng::new(seed);
            let mut noise = rng.randn(noise_shape)?;

            if let Some(subnoise) = subnoise {
                noise = slerp(variation.strength, &noise, &subnoise);
            }

            if noise_shape != shape {
                rng = TorchRng::new(seed);
                let mut x = rng.randn(shape)?;
                paste_centered(&mut x, &noise);
                noise = x;
            }

            if want_sampler_noise {
                if self.eta_noise_seed_delta > 0 {
                    rng = TorchRng::new(seed.wrapping_add(self.eta_noise_seed_delta));
                }
                for slot in &mut sampler_noises {
                    slot.push(rng.randn(shape)?);
                }
            }

            xs.push(noise);
        }

        let noise = stack_batch(&xs)?;
        let sampler_noises = if want_sampler_noise {
            Some(
                sampler_noises
                    .iter()
                    .map(|slot| stack_batch(slot))
                    .collect::<Result<Vec<_>>>()?,
            )
        } else {
            None
        };

        Ok(NoiseBatch {
            noise,
            sampler_noises,
        })
    }
}

/// Centre `src` on `dst`, cropping whichever one is larger on each axis.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn paste_centered(dst: &mut Array3<f32>, src: &Array3<f32>) {
    let (_, dst_h, dst_w) = dst.dim();
    let (_, src_h, src_w) = src.dim();

    let dx = (dst_w as isize - src_w as isize).div_euclid(2);
    let dy = (dst_h as isize - src_h as isize).div_euclid(2);
    let w = if dx >= 0 { src_w as isize } else { src_w as isize + 2 * dx };
    let h = if dy >= 0 { src_h as isize } else { src_h as isize + 2 * dy };
    let (tx, ty) = (dx.max(0) as usize, dy.max(0) as usize);
    let (sx, sy) = ((-dx).max(0) as usize, (-dy).max(0) as usize);
    let (w, h) = (w.max(0) as usize, h.max(0) as usize);

    dst.slice_mut(s![.., ty..ty + h, tx..tx + w])
        .assign(&src.slice(s![.., sy..sy + h, sx..sx + w]));
}

pub(crate) fn stack_batch(items: &[Array3<f32>]) -> Result<Array4<f32>> {
    let views: Vec<ArrayView3<'_, f32>> = items.iter().map(Array3::view).collect();
    stack(Axis(0), &views).map_err(|err| Error::ShapeMismatch {
        expected: "equally shaped noise tensors".to_string(),
        actual: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPE: [usize; 3] = [4, 8, 8];

    #[test]
    fn test_randn_matches_torch_seed_42() {
        // torch.manual_seed(42); torch.randn(16)[:8]
        let expected = [
            1.926_915_f32,
            1.487_284_2,
            0.900_717_2,
            -2.105_521_4,
            0.678_418_46,
            -1.234_545,
            -0.043_067_48,
            -1.604_667,
        ];

        let values = TorchRng::new(42).randn([1, 1, 16]).unwrap();
        for (got, want) in values.iter().zip(expected) {
            assert!((got - want).abs() < 1e-4, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_randn_tail_is_finite() {
        let values = TorchRng::new(7).randn([1, 3, 7]).unwrap();
        assert_eq!(values.len(), 21);
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_randn_empty_shape() {
        let values = TorchRng::new(7).randn([0, 4, 4]).unwrap();
        assert_eq!(values.dim(), (0, 4, 4));
    }

    #[test]
    fn test_generate_is_deterministic() {
        let generator = NoiseGenerator::default();
        let a = generator.generate(SHAPE, &[1234], &Variation::default(), 0).unwrap();
        let b = generator.generate(SHAPE, &[1234], &Variation::default(), 0).unwrap();

        assert_eq!(a.noise, b.noise);
        assert_eq!(a.noise.dim(), (1, 4, 8, 8));
    }

    #[test]
    fn test_batch_matches_single_seeds() {
        let generator = NoiseGenerator::new(0, true);
        let batch = generator.generate(SHAPE, &[100, 101], &Variation::default(), 2).unwrap();
        let first = generator.generate(SHAPE, &[100], &Variation::default(), 0).unwrap();
        let second = generator.generate(SHAPE, &[101], &Variation::default(), 0).unwrap();

        assert_eq!(batch.noise.index_axis(Axis(0), 0), first.noise.index_axis(Axis(0), 0));
        assert_eq!(batch.noise.index_axis(Axis(0), 1), second.noise.index_axis(Axis(0), 0));
    }

    #[test]
    fn test_sampler_noises_are_batch_independent() {
        let generator = NoiseGenerator::new(31337, true);
        let batch = generator.generate(SHAPE, &[100, 101], &Variation::default(), 2).unwrap();
        let single = generator.generate(SHAPE, &[101], &Variation::default(), 2).unwrap();

        let batch_noises = batch.sampler_noises.unwrap();
        let single_noises = single.sampler_noises.unwrap();
        assert_eq!(batch_noises.len(), 2);
        assert_eq!(batch_noises[0].dim(), (2, 4, 8, 8));
        for (b, s) in batch_noises.iter().zip(&single_noises) {
            assert_eq!(b.index_axis(Axis(0), 1), s.index_axis(Axis(0), 0));
        }
    }

    #[test]
    fn test_no_sampler_noise_for_single_seed_without_delta() {
        let generator = NoiseGenerator::new(0, true);
        let batch = generator.generate(SHAPE, &[5], &Variation::default(), 3).unwrap();
        assert!(batch.sampler_noises.is_none());
    }

    #[test]
    fn test_subseed_strength_zero_keeps_seed_noise() {
        let generator = NoiseGenerator::default();
        let plain = generator.generate(SHAPE, &[9], &Variation::default(), 0).unwrap();
        let subseeds = [77];
        let variation = Variation {
            subseeds: Some(&subseeds),
            strength: 0.0,
            resize_from: None,
        };
        let varied = generator.generate(SHAPE, &[9], &variation, 0).unwrap();

        assert_eq!(plain.noise, varied.noise);
    }

    #[test]
    fn test_resize_from_keeps_target_shape() {
        let generator = NoiseGenerator::default();
        let variation = Variation {
            subseeds: None,
            strength: 0.0,
            resize_from: Some((96, 32)),
        };
        let batch = generator.generate(SHAPE, &[3], &variation, 0).unwrap();
        assert_eq!(batch.noise.dim(), (1, 4, 8, 8));

        // Width 12 is centre-cropped to 8, height 4 is padded into rows 2..6.
        let source = TorchRng::new(3).randn([4, 4, 12]).unwrap();
        assert_eq!(
            batch.noise.slice(s![0, .., 2..6, ..]),
            source.slice(s![.., .., 2..10])
        );
    }

    #[test]
    fn test_empty_seeds_rejected() {
        let generator = NoiseGenerator::default();
        assert!(generator.generate(SHAPE, &[], &Variation::default(), 0).is_err());
    }

    #[test]
    fn test_slerp_endpoints() {
        let low = TorchRng::new(1).randn(SHAPE).unwrap();
        let high = TorchRng::new(2).randn(SHAPE).unwrap();

        assert_eq!(slerp(0.0, &low, &high), low);
        assert_eq!(slerp(1.0, &low, &high), high);
    }

    #[test]
    fn test_slerp_parallel_is_linear() {
        let low = TorchRng::new(1).randn(SHAPE).unwrap();
        let high = &low * 2.0;

        let mid = slerp(0.5, &low, &high);
        assert!(mid.iter().all(|v| v.is_finite()));
        for (m, l) in mid.iter().zip(low.iter()) {
            assert!((m - l * 1.5).abs() < 1e-5);
        }
    }

    #[test]
    fn test_fixed_seed() {
        assert_eq!(fixed_seed(42), 42);
        assert!(fixed_seed(-1) < MAX_RANDOM_SEED);
    }
}
