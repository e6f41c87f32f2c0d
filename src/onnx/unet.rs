//! DDIM sampling over an ONNX `UNet`.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{concatenate, Array1, Array3, ArrayD, Axis, Ix3, Ix4};
use ort::session::Session;
use ort::value::Tensor;

use crate::error::{Error, Result};
use crate::pipeline::{Conditioner, Embedding, ImageConditioning, LatentTensor, Sampler, SamplerCall};

use super::loader::{ModelDir, ModelFile};
use super::vae::output_array4;

/// Number of diffusion timesteps the model was trained with.
const TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.000_85;
const BETA_END: f64 = 0.012;

/// Text encoder sequence length and width of SD 1.x.
pub const TOKENS: usize = 77;
pub const HIDDEN: usize = 768;

/// Scaled-linear beta schedule with DDIM timestep spacing.
#[derive(Debug, Clone)]
pub struct DdimSchedule {
    alphas_cumprod: Vec<f32>,
}

impl Default for DdimSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl DdimSchedule {
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn new() -> Self {
        let (start, end) = (BETA_START.sqrt(), BETA_END.sqrt());
        let last = (TRAIN_TIMESTEPS - 1) as f64;

        let mut product = 1.0_f64;
        let alphas_cumprod = (0..TRAIN_TIMESTEPS)
            .map(|i| {
                let beta = (start + (end - start) * i as f64 / last).powi(2);
                product *= 1.0 - beta;
                product as f32
            })
            .collect();

        Self { alphas_cumprod }
    }

    /// Cumulative alpha at timestep `t`.
    #[must_use]
    pub fn alpha(&self, t: usize) -> f32 {
        self.alphas_cumprod[t.min(TRAIN_TIMESTEPS - 1)]
    }

    /// Descending timesteps for `steps` denoising steps.
    ///
    /// With a denoising strength only the last `strength * steps` of them
    /// are run, starting from a partially noised init latent.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn timesteps(&self, steps: u32, strength: Option<f32>) -> Vec<usize> {
        let steps = steps.max(1) as usize;
        let ratio = TRAIN_TIMESTEPS / steps;
        let all: Vec<usize> = (0..steps).rev().map(|i| i * ratio + 1).collect();

        match strength {
            None => all,
            Some(strength) => {
                let keep = ((strength.clamp(0.0, 1.0) * steps as f32) as usize).min(steps);
                all[steps - keep..].to_vec()
            }
        }
    }

    /// One deterministic DDIM update from `t` to `t_prev` (`None` for the final step).
    #[must_use]
    pub fn step(&self, latents: &LatentTensor, eps: &LatentTensor, t: usize, t_prev: Option<usize>) -> LatentTensor {
        let alpha = self.alpha(t);
        let alpha_prev = t_prev.map_or(self.alphas_cumprod[0], |p| self.alpha(p));

        let x0 = (latents - &(eps * (1.0 - alpha).sqrt())) / alpha.sqrt();
        x0 * alpha_prev.sqrt() + eps * (1.0 - alpha_prev).sqrt()
    }

    /// Noise `init` to timestep `t`.
    #[must_use]
    pub fn add_noise(&self, init: &LatentTensor, noise: &LatentTensor, t: usize) -> LatentTensor {
        let alpha = self.alpha(t);
        init * alpha.sqrt() + noise * (1.0 - alpha).sqrt()
    }
}

/// DDIM sampler running the `UNet` with classifier-free guidance.
pub struct OnnxUnetSampler {
    unet: Session,
    schedule: DdimSchedule,
    show_progress: bool,
}

impl OnnxUnetSampler {
    /// Open the `UNet` of `checkpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be loaded.
    pub fn open(models: &ModelDir, checkpoint: Option<&str>) -> Result<Self> {
        Ok(Self {
            unet: models.load_session(checkpoint, ModelFile::Unet)?,
            schedule: DdimSchedule::new(),
            show_progress: true,
        })
    }

    /// Enable or disable the terminal progress bar.
    #[must_use]
    pub const fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        let style = ProgressStyle::with_template("{spinner:.green} Denoising [{bar:40.cyan/blue}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);
        pb
    }

    fn denoise(
        &mut self,
        call: &SamplerCall<'_>,
        mut latents: LatentTensor,
        timesteps: &[usize],
        cond: &Embedding,
        uncond: &Embedding,
        image_conditioning: &ImageConditioning,
    ) -> Result<LatentTensor> {
        let cond = hidden_states(cond)?;
        let uncond = hidden_states(uncond)?;
        let guided = call.cfg_scale != 1.0 && cond != uncond;
        let concat = concat_conditioning(image_conditioning, &latents)?;

        let pb = self.progress_bar(timesteps.len());
        for (i, &t) in timesteps.iter().enumerate() {
            let input = match &concat {
                Some(extra) => concatenate(Axis(1), &[latents.view(), extra.view()]).map_err(|_| {
                    Error::ShapeMismatch {
                        expected: "image conditioning matching the latent size".to_string(),
                        actual: format!("{:?}", extra.dim()),
                    }
                })?,
                None => latents.clone(),
            };

            let eps_cond = self.predict_noise(&input, t, &cond)?;
            let eps = if guided {
                let eps_uncond = self.predict_noise(&input, t, &uncond)?;
                &eps_uncond + &((&eps_cond - &eps_uncond) * call.cfg_scale)
            } else {
                eps_cond
            };

            // Inpainting UNets take 9 input channels but predict 4.
            if eps.dim() != latents.dim() {
                return Err(Error::ShapeMismatch {
                    expected: format!("{:?}", latents.dim()),
                    actual: format!("{:?}", eps.dim()),
                });
            }
            latents = self.schedule.step(&latents, &eps, t, timesteps.get(i + 1).copied());
            pb.inc(1);
        }
        pb.finish_and_clear();

        Ok(latents)
    }

    /// Predict noise using the `UNet`.
    fn predict_noise(&mut self, sample: &LatentTensor, timestep: usize, hidden: &Array3<f32>) -> Result<LatentTensor> {
        let sample_value = Tensor::from_array(sample.clone()).map_err(|source| Error::Inference { source })?;

        #[allow(clippy::cast_possible_wrap)]
        let timestep_arr = Array1::from_vec(vec![timestep as i64]);
        let timestep_value = Tensor::from_array(timestep_arr).map_err(|source| Error::Inference { source })?;

        let hidden_value = Tensor::from_array(hidden.clone()).map_err(|source| Error::Inference { source })?;

        let outputs = self
            .unet
            .run(ort::inputs![
                "sample" => sample_value,
                "timestep" => timestep_value,
                "encoder_hidden_states" => hidden_value,
            ])
            .map_err(|source| Error::Inference { source })?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| Error::ShapeMismatch {
                expected: "unet noise prediction output".to_string(),
                actual: "no output".to_string(),
            })?;

        output_array4("unet", &output)
    }
}

impl Sampler for OnnxUnetSampler {
    fn name(&self) -> &str {
        "DDIM"
    }

    fn sample(
        &mut self,
        call: &SamplerCall<'_>,
        noise: &LatentTensor,
        cond: &Embedding,
        uncond: &Embedding,
        image_conditioning: &ImageConditioning,
    ) -> Result<LatentTensor> {
        let timesteps = self.schedule.timesteps(call.steps, None);
        self.denoise(call, noise.clone(), &timesteps, cond, uncond, image_conditioning)
    }

    fn sample_img2img(
        &mut self,
        call: &SamplerCall<'_>,
        init_latent: &LatentTensor,
        noise: &LatentTensor,
        cond: &Embedding,
        uncond: &Embedding,
        image_conditioning: &ImageConditioning,
    ) -> Result<LatentTensor> {
        let timesteps = self.schedule.timesteps(call.steps, call.denoising_strength);
        let Some(&first) = timesteps.first() else {
            return Ok(init_latent.clone());
        };

        let latents = self.schedule.add_noise(init_latent, noise, first);
        self.denoise(call, latents, &timesteps, cond, uncond, image_conditioning)
    }
}

fn hidden_states(embedding: &Embedding) -> Result<Array3<f32>> {
    (**embedding)
        .clone()
        .into_dimensionality::<Ix3>()
        .map_err(|_| Error::ShapeMismatch {
            expected: format!("(batch, {TOKENS}, {HIDDEN}) embedding"),
            actual: format!("{:?}", embedding.shape()),
        })
}

/// Image conditioning to concatenate onto the latent input, if it has the latent's spatial size.
fn concat_conditioning(conditioning: &ImageConditioning, latents: &LatentTensor) -> Result<Option<LatentTensor>> {
    if conditioning.ndim() != 4 || conditioning.shape()[2..] != latents.shape()[2..] {
        return Ok(None);
    }
    conditioning
        .clone()
        .into_dimensionality::<Ix4>()
        .map(Some)
        .map_err(|_| Error::ShapeMismatch {
            expected: "4D image conditioning".to_string(),
            actual: format!("{:?}", conditioning.shape()),
        })
}

/// Conditioner for exports without a text encoder: every prompt maps to
/// the zero embedding.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconditionalConditioner;

impl UnconditionalConditioner {
    fn zeros(prompts: &[String]) -> Embedding {
        Arc::new(ArrayD::zeros(ndarray::IxDyn(&[prompts.len().max(1), TOKENS, HIDDEN])))
    }
}

impl Conditioner for UnconditionalConditioner {
    fn conditional(&self, prompts: &[String], _steps: u32) -> Result<Embedding> {
        Ok(Self::zeros(prompts))
    }

    fn unconditional(&self, prompts: &[String], _steps: u32) -> Result<Embedding> {
        Ok(Self::zeros(prompts))
    }

    fn comments(&self) -> Vec<String> {
        vec!["No text encoder loaded; prompts do not steer sampling.".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array4, IxDyn};

    #[test]
    fn test_alphas_decrease() {
        let schedule = DdimSchedule::new();
        assert!(schedule.alpha(0) > 0.99);
        assert!(schedule.alpha(999) < 0.01);
        assert!(schedule.alpha(500) < schedule.alpha(100));
    }

    #[test]
    fn test_timesteps_full_and_strength() {
        let schedule = DdimSchedule::new();
        let all = schedule.timesteps(10, None);
        assert_eq!(all.len(), 10);
        assert_eq!(all[0], 901);
        assert_eq!(all[9], 1);

        let partial = schedule.timesteps(10, Some(0.5));
        assert_eq!(partial, vec![401, 301, 201, 101, 1]);
        assert!(schedule.timesteps(10, Some(0.0)).is_empty());
    }

    #[test]
    fn test_step_with_exact_noise_recovers_clean_latent() {
        let schedule = DdimSchedule::new();
        let clean = Array4::from_elem((1, 4, 2, 2), 0.5);
        let noise = Array4::from_elem((1, 4, 2, 2), -1.0);
        let noisy = schedule.add_noise(&clean, &noise, 501);

        let stepped = schedule.step(&noisy, &noise, 501, None);
        let expected = schedule.add_noise(&clean, &noise, 0);
        assert!(stepped.iter().zip(expected.iter()).all(|(a, b)| (a - b).abs() < 1e-4));
    }

    #[test]
    fn test_concat_conditioning_only_for_matching_size() {
        let latents = Array4::zeros((1, 4, 8, 8));
        let placeholder = ArrayD::zeros(IxDyn(&[1, 5, 1, 1]));
        assert!(concat_conditioning(&placeholder, &latents).unwrap().is_none());

        let inpainting = ArrayD::zeros(IxDyn(&[1, 5, 8, 8]));
        let extra = concat_conditioning(&inpainting, &latents).unwrap().unwrap();
        assert_eq!(extra.dim(), (1, 5, 8, 8));
    }

    #[test]
    fn test_unconditional_embeddings() {
        let conditioner = UnconditionalConditioner;
        let prompts = vec!["a".to_string(), "b".to_string()];
        let cond = conditioner.conditional(&prompts, 20).unwrap();
        assert_eq!(cond.shape(), &[2, TOKENS, HIDDEN]);
        assert_eq!(*cond, *conditioner.unconditional(&prompts, 20).unwrap());
    }
}
