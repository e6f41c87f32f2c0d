//! Sampling driver: noise scaling, sampler delegation, and mask recomposite.

use ndarray::Array4;

use crate::error::{Error, Result};
use crate::image::{LATENT_CHANNELS, LATENT_FACTOR};
use crate::noise::{NoiseBatch, NoiseGenerator, Variation};
use crate::options::Options;

use super::backend::{Embedding, ImageConditioning, LatentTensor, Sampler, SamplerCall};
use super::request::{BatchSlice, GenerationRequest};

/// Latent-resolution masks of an inpainting batch, broadcast over channels.
#[derive(Debug, Clone)]
pub struct LatentMasks {
    /// 1 where the init latent is kept.
    pub keep: Array4<f32>,
    /// 1 where the sampler's output is used.
    pub edit: Array4<f32>,
}

impl LatentMasks {
    /// Build the pair from a `{0, 1}` edit mask.
    #[must_use]
    pub fn from_edit(edit: Array4<f32>) -> Self {
        let keep = edit.mapv(|v| 1.0 - v);
        Self { keep, edit }
    }
}

/// Scale `noise` in place by `multiplier`.
pub fn scale_noise(noise: &mut LatentTensor, multiplier: f32) {
    if multiplier != 1.0 {
        noise.mapv_inplace(|v| v * multiplier);
    }
}

/// `samples * edit + init * keep`: unmasked latents go back to their encoded values.
///
/// # Errors
///
/// Returns an error if the tensors differ in shape.
pub fn recomposite(samples: &LatentTensor, init_latent: &LatentTensor, masks: &LatentMasks) -> Result<LatentTensor> {
    if samples.dim() != init_latent.dim() || samples.dim() != masks.edit.dim() {
        return Err(Error::ShapeMismatch {
            expected: format!("{:?}", init_latent.dim()),
            actual: format!("{:?}", samples.dim()),
        });
    }
    Ok(samples * &masks.edit + init_latent * &masks.keep)
}

/// Initial noise (and sampler noise) for one batch at the requested canvas size.
///
/// # Errors
///
/// Returns an error if the batch has no seeds.
pub(crate) fn batch_noise(
    request: &GenerationRequest,
    batch: &BatchSlice,
    options: &Options,
    sampler_slots: usize,
) -> Result<NoiseBatch> {
    let shape = [
        LATENT_CHANNELS,
        (request.height / LATENT_FACTOR) as usize,
        (request.width / LATENT_FACTOR) as usize,
    ];
    let variation = Variation {
        subseeds: (request.subseed_strength != 0.0).then_some(batch.subseeds.as_slice()),
        strength: request.subseed_strength,
        resize_from: request.seed_resize_from,
    };

    NoiseGenerator::new(options.eta_noise_seed_delta, options.enable_batch_seeds).generate(
        shape,
        &batch.seeds,
        &variation,
        sampler_slots,
    )
}

/// Runs the sampler over prepared latents.
#[derive(Debug, Clone, Copy)]
pub struct SamplingDriver {
    pub noise_multiplier: f32,
}

impl Default for SamplingDriver {
    fn default() -> Self {
        Self { noise_multiplier: 1.0 }
    }
}

impl SamplingDriver {
    #[must_use]
    pub const fn new(noise_multiplier: f32) -> Self {
        Self { noise_multiplier }
    }

    /// Denoise from `init_latent`, then recomposite the masked area if `masks` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if sampling fails or the sampler returns a differently shaped tensor.
    #[allow(clippy::too_many_arguments)]
    pub fn sample(
        &self,
        sampler: &mut dyn Sampler,
        call: &SamplerCall<'_>,
        init_latent: &LatentTensor,
        mut noise: LatentTensor,
        cond: &Embedding,
        uncond: &Embedding,
        image_conditioning: &ImageConditioning,
        masks: Option<&LatentMasks>,
    ) -> Result<LatentTensor> {
        scale_noise(&mut noise, self.noise_multiplier);

        tracing::debug!(
            "Sampling {} latents with {} at strength {:?}",
            init_latent.dim().0,
            sampler.name(),
            call.denoising_strength
        );
        let samples = sampler.sample_img2img(call, init_latent, &noise, cond, uncond, image_conditioning)?;

        match masks {
            Some(masks) => recomposite(&samples, init_latent, masks),
            None => Ok(samples),
        }
    }
}
