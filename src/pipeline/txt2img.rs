//! Generation from pure noise.

use ndarray::{s, Array4, ArrayD, IxDyn};

use crate::error::Result;
use crate::image::{ImageTensor, RGB_CHANNELS};

use super::backend::{ConditioningKey, Embedding, ImageConditioning, LatentTensor, ModelBackend, SamplerCall};
use super::orchestrator::{Processing, Stage};
use super::request::{BatchSlice, GenerationRequest, SeedPlan};
use super::sampling::batch_noise;

/// Conditioning for models that ignore the extra image input.
///
/// Returns `None` for inpainting models, which need an encoded image.
pub(crate) fn placeholder_conditioning(key: ConditioningKey, batch: usize) -> Option<ImageConditioning> {
    match key {
        ConditioningKey::Hybrid | ConditioningKey::Concat => None,
        ConditioningKey::CrossAttnAdm { embed_dim } => Some(ArrayD::zeros(IxDyn(&[batch, 2 * embed_dim]))),
        ConditioningKey::CrossAttn => Some(ArrayD::zeros(IxDyn(&[batch, 5, 1, 1]))),
    }
}

/// Image conditioning for a text-only batch.
///
/// Inpainting models see a fully masked black image: an all-ones mask
/// channel in front of the encoded zero image.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn txt2img_image_conditioning(
    backend: &mut dyn ModelBackend,
    batch: usize,
    width: u32,
    height: u32,
) -> Result<ImageConditioning> {
    if let Some(conditioning) = placeholder_conditioning(backend.conditioning_key(), batch) {
        return Ok(conditioning);
    }

    let blank = ImageTensor::zeros((batch, RGB_CHANNELS, height as usize, width as usize));
    let latent = backend.encode_first_stage(&blank)?;
    let (b, c, h, w) = latent.dim();

    let mut conditioning = Array4::<f32>::ones((b, c + 1, h, w));
    conditioning.slice_mut(s![.., 1.., .., ..]).assign(&latent);
    Ok(conditioning.into_dyn())
}

/// Text-to-image strategy: no init latent, no masks, no overlays.
#[derive(Debug, Clone, Copy, Default)]
pub struct Txt2Img;

impl Txt2Img {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Processing for Txt2Img {
    fn init(&mut self, _request: &GenerationRequest, _plan: &SeedPlan, _stage: &mut Stage<'_>) -> Result<()> {
        Ok(())
    }

    fn sample(
        &mut self,
        request: &mut GenerationRequest,
        batch: &BatchSlice,
        cond: &Embedding,
        uncond: &Embedding,
        stage: &mut Stage<'_>,
    ) -> Result<LatentTensor> {
        let noise = batch_noise(request, batch, stage.options, stage.sampler.needed_noise_slot_count())?;
        let image_conditioning =
            txt2img_image_conditioning(&mut *stage.backend, batch.len(), request.width, request.height)?;

        let call = SamplerCall {
            steps: request.steps,
            cfg_scale: request.cfg_scale,
            denoising_strength: None,
            seeds: &batch.seeds,
            subseeds: &batch.subseeds,
            prompts: &batch.prompts,
            sampler_noises: noise.sampler_noises.as_deref(),
        };

        stage.sampler.sample(&call, &noise.noise, cond, uncond, &image_conditioning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HalfVae {
        key: ConditioningKey,
    }

    impl ModelBackend for HalfVae {
        fn encode_first_stage(&mut self, images: &ImageTensor) -> Result<LatentTensor> {
            let (b, _, h, w) = images.dim();
            Ok(LatentTensor::from_elem((b, 4, h / 8, w / 8), 0.25))
        }

        fn decode_first_stage(&mut self, latents: &LatentTensor) -> Result<ImageTensor> {
            Ok(latents.clone())
        }

        fn conditioning_key(&self) -> ConditioningKey {
            self.key
        }
    }

    #[test]
    fn test_plain_model_gets_placeholder() {
        let mut vae = HalfVae {
            key: ConditioningKey::CrossAttn,
        };
        let conditioning = txt2img_image_conditioning(&mut vae, 3, 64, 64).unwrap();
        assert_eq!(conditioning.shape(), &[3, 5, 1, 1]);
        assert!(conditioning.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_unclip_model_gets_embedding_zeros() {
        let mut vae = HalfVae {
            key: ConditioningKey::CrossAttnAdm { embed_dim: 16 },
        };
        let conditioning = txt2img_image_conditioning(&mut vae, 2, 64, 64).unwrap();
        assert_eq!(conditioning.shape(), &[2, 32]);
    }

    #[test]
    fn test_inpainting_model_gets_full_mask() {
        let mut vae = HalfVae {
            key: ConditioningKey::Hybrid,
        };
        let conditioning = txt2img_image_conditioning(&mut vae, 1, 64, 32).unwrap();
        assert_eq!(conditioning.shape(), &[1, 5, 4, 8]);
        assert_eq!(conditioning[[0, 0, 2, 2]], 1.0);
        assert_eq!(conditioning[[0, 3, 2, 2]], 0.25);
    }
}
