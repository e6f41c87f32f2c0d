//! Interfaces of the external collaborators driven by the orchestrator.
//!
//! The diffusion model, the sampler's step algorithm, prompt encoding, face
//! restoration, persistence, and scripting hooks live outside this crate.
//! The orchestrator only talks to them through these traits.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use image::{DynamicImage, RgbImage};
use ndarray::{Array4, ArrayD};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::image::ImageTensor;

use super::processed::Processed;
use super::request::{BatchSlice, GenerationRequest};

/// Latent tensor in NCHW format (batch, 4, height / 8, width / 8).
pub type LatentTensor = Array4<f32>;

/// Prompt conditioning produced by a [`Conditioner`]; cheap to clone.
pub type Embedding = Arc<ArrayD<f32>>;

/// Extra conditioning input handed to the sampler alongside the prompt.
pub type ImageConditioning = ArrayD<f32>;

/// Which extra conditioning the model expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditioningKey {
    /// Plain cross-attention model.
    #[default]
    CrossAttn,
    /// Inpainting model: mask and masked-image latent concatenated.
    Hybrid,
    /// Like [`ConditioningKey::Hybrid`], concatenation only.
    Concat,
    /// unCLIP model with a noise-augmented image embedding of `embed_dim`.
    CrossAttnAdm { embed_dim: usize },
}

impl ConditioningKey {
    /// Whether the model consumes inpainting (mask + masked image) conditioning.
    #[must_use]
    pub const fn is_inpainting(self) -> bool {
        matches!(self, Self::Hybrid | Self::Concat)
    }
}

/// The diffusion model as seen by the orchestrator.
pub trait ModelBackend {
    /// Encode a batch of [-1, 1] images into scaled latents.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoder fails.
    fn encode_first_stage(&mut self, images: &ImageTensor) -> Result<LatentTensor>;

    /// Decode latents back into [-1, 1] images.
    ///
    /// # Errors
    ///
    /// Returns an error if the decoder fails.
    fn decode_first_stage(&mut self, latents: &LatentTensor) -> Result<ImageTensor>;

    /// Conditioning layout the loaded model expects.
    fn conditioning_key(&self) -> ConditioningKey {
        ConditioningKey::CrossAttn
    }

    /// Short hash identifying the loaded weights.
    fn model_hash(&self) -> Option<String> {
        None
    }

    /// Human-readable name of the loaded checkpoint.
    fn model_name(&self) -> Option<String> {
        None
    }

    /// Whether a checkpoint with this name can be loaded.
    fn has_checkpoint(&self, _name: &str) -> bool {
        false
    }

    /// Swap model weights (`None` means the configured default).
    ///
    /// # Errors
    ///
    /// Returns an error if the weights cannot be loaded.
    fn reload_weights(&mut self, _checkpoint: Option<&str>) -> Result<()> {
        Ok(())
    }

    /// Swap VAE weights (`None` means the one bundled with the checkpoint).
    ///
    /// # Errors
    ///
    /// Returns an error if the weights cannot be loaded.
    fn reload_vae(&mut self, _vae: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// Per-call parameters passed to the sampler.
#[derive(Debug, Clone)]
pub struct SamplerCall<'a> {
    pub steps: u32,
    pub cfg_scale: f32,
    pub denoising_strength: Option<f32>,
    pub seeds: &'a [u64],
    pub subseeds: &'a [u64],
    pub prompts: &'a [String],
    /// Pre-drawn internal noise, one `(batch, c, h, w)` stack per slot.
    pub sampler_noises: Option<&'a [Array4<f32>]>,
}

/// The iterative denoiser, treated as a black box.
pub trait Sampler {
    /// Name recorded in generation metadata.
    fn name(&self) -> &str;

    /// Number of noise tensors the algorithm draws per image while sampling.
    fn needed_noise_slot_count(&self) -> usize {
        0
    }

    /// Whether each step evaluates the model twice (Heun, DPM2, ...).
    fn is_second_order(&self) -> bool {
        false
    }

    /// Denoise pure noise.
    ///
    /// # Errors
    ///
    /// Returns an error if sampling fails.
    fn sample(
        &mut self,
        call: &SamplerCall<'_>,
        noise: &LatentTensor,
        cond: &Embedding,
        uncond: &Embedding,
        image_conditioning: &ImageConditioning,
    ) -> Result<LatentTensor>;

    /// Denoise starting from encoded init latents.
    ///
    /// # Errors
    ///
    /// Returns an error if sampling fails.
    fn sample_img2img(
        &mut self,
        call: &SamplerCall<'_>,
        init_latent: &LatentTensor,
        noise: &LatentTensor,
        cond: &Embedding,
        uncond: &Embedding,
        image_conditioning: &ImageConditioning,
    ) -> Result<LatentTensor>;
}

/// Turns prompts into conditioning.
pub trait Conditioner {
    /// Conditioning for the positive prompts.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    fn conditional(&self, prompts: &[String], steps: u32) -> Result<Embedding>;

    /// Conditioning for the negative prompts.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    fn unconditional(&self, prompts: &[String], steps: u32) -> Result<Embedding>;

    /// Warnings gathered while encoding (e.g. truncated prompts).
    fn comments(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Face restoration model.
pub trait FaceRestorer {
    /// Name recorded in generation metadata.
    fn name(&self) -> &str;

    /// Restore faces in `image`.
    ///
    /// # Errors
    ///
    /// Returns an error if restoration fails.
    fn restore(&self, image: RgbImage) -> Result<RgbImage>;
}

/// Expands prompt styles.
pub trait StyleApplier {
    fn apply(&self, prompt: &str, styles: &[String]) -> String;
    fn apply_negative(&self, prompt: &str, styles: &[String]) -> String;
}

/// Leaves prompts untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStyles;

impl StyleApplier for NoStyles {
    fn apply(&self, prompt: &str, _styles: &[String]) -> String {
        prompt.to_string()
    }

    fn apply_negative(&self, prompt: &str, _styles: &[String]) -> String {
        prompt.to_string()
    }
}

/// A named prompt fragment pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptStyle {
    pub prompt: String,
    pub negative_prompt: String,
}

/// Styles keyed by name.
///
/// A style text containing `{prompt}` has the prompt substituted in;
/// otherwise the style is appended after a comma. Unknown names are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptStyles {
    pub styles: BTreeMap<String, PromptStyle>,
}

impl PromptStyles {
    /// Load styles from a JSON object of `name -> {prompt, negative_prompt}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn merge<'s>(&'s self, prompt: &str, styles: &[String], pick: impl Fn(&'s PromptStyle) -> &'s str) -> String {
        styles
            .iter()
            .filter_map(|name| self.styles.get(name))
            .map(pick)
            .fold(prompt.to_string(), |prompt, style| merge_style(style, &prompt))
    }
}

impl StyleApplier for PromptStyles {
    fn apply(&self, prompt: &str, styles: &[String]) -> String {
        self.merge(prompt, styles, |style| style.prompt.as_str())
    }

    fn apply_negative(&self, prompt: &str, styles: &[String]) -> String {
        self.merge(prompt, styles, |style| style.negative_prompt.as_str())
    }
}

fn merge_style(style: &str, prompt: &str) -> String {
    if style.is_empty() {
        prompt.to_string()
    } else if style.contains("{prompt}") {
        style.replace("{prompt}", prompt)
    } else if prompt.is_empty() {
        style.to_string()
    } else {
        format!("{prompt}, {style}")
    }
}

/// Kind of image being persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Sample,
    Grid,
}

/// Everything a sink needs to name and annotate one image.
#[derive(Debug, Clone)]
pub struct SaveRequest<'a> {
    pub kind: OutputKind,
    pub seed: u64,
    pub prompt: &'a str,
    pub info: &'a str,
    pub suffix: Option<&'a str>,
    /// File extension, e.g. `png`.
    pub format: &'a str,
}

/// Image persistence.
pub trait ImageSink {
    /// Persist one image.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be written.
    fn save(&mut self, image: &DynamicImage, request: &SaveRequest<'_>) -> Result<()>;

    /// Persist the infotext of the first image of a run.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be written.
    fn write_params(&mut self, infotext: &str) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ImageSink for NullSink {
    fn save(&mut self, _image: &DynamicImage, _request: &SaveRequest<'_>) -> Result<()> {
        Ok(())
    }

    fn write_params(&mut self, _infotext: &str) -> Result<()> {
        Ok(())
    }
}

/// Lifecycle hooks. Every method defaults to a no-op.
pub trait Scripts {
    /// Before anything is prepared.
    fn process(&mut self, _request: &mut GenerationRequest) {}

    /// Before a batch is conditioned; the request may still be edited.
    fn before_process_batch(&mut self, _request: &mut GenerationRequest, _batch: &BatchSlice) {}

    /// After conditioning inputs are final, right before sampling.
    fn process_batch(&mut self, _request: &mut GenerationRequest, _batch: &BatchSlice) {}

    /// After a batch is decoded; `samples` are in [0, 1].
    fn postprocess_batch(&mut self, _request: &mut GenerationRequest, _samples: &mut ImageTensor, _batch_number: usize) {}

    /// After one image is restored, before colour correction and overlay.
    fn postprocess_image(&mut self, _request: &mut GenerationRequest, _image: &mut RgbImage) {}

    /// After the full run.
    fn postprocess(&mut self, _request: &mut GenerationRequest, _processed: &Processed) {}
}

/// Runs no hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoScripts;

impl Scripts for NoScripts {}

/// Cooperative interruption flag and progress counter.
#[derive(Debug, Default)]
pub struct JobState {
    interrupted: AtomicBool,
    skipped: AtomicBool,
    job_no: AtomicUsize,
    job_count: AtomicUsize,
}

impl JobState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop at the next iteration boundary.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Request that the current iteration be skipped (cleared at the next boundary).
    pub fn skip(&self) {
        self.skipped.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.skipped.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_skip(&self) {
        self.skipped.store(false, Ordering::SeqCst);
    }

    /// Set the expected number of jobs and reset the counter.
    pub fn begin(&self, job_count: usize) {
        self.job_no.store(0, Ordering::SeqCst);
        self.job_count.store(job_count, Ordering::SeqCst);
    }

    /// Advance the counter after a completed iteration.
    pub fn next_job(&self) {
        self.job_no.fetch_add(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn job_no(&self) -> usize {
        self.job_no.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn job_count(&self) -> usize {
        self.job_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn styles() -> PromptStyles {
        let mut styles = BTreeMap::new();
        styles.insert(
            "oil".to_string(),
            PromptStyle {
                prompt: "oil painting of {prompt}".to_string(),
                negative_prompt: "photo".to_string(),
            },
        );
        styles.insert(
            "hd".to_string(),
            PromptStyle {
                prompt: "highly detailed".to_string(),
                negative_prompt: String::new(),
            },
        );
        PromptStyles { styles }
    }

    #[test]
    fn test_style_placeholder_and_append() {
        let styles = styles();
        let names = vec!["oil".to_string(), "hd".to_string(), "missing".to_string()];
        assert_eq!(styles.apply("a cat", &names), "oil painting of a cat, highly detailed");
        assert_eq!(styles.apply_negative("blurry", &names), "blurry, photo");
        assert_eq!(styles.apply_negative("", &names), "photo");
    }

    #[test]
    fn test_styles_from_json() {
        let styles: PromptStyles =
            serde_json::from_str(r#"{"hd": {"prompt": "highly detailed"}}"#).unwrap();
        assert_eq!(styles.apply("a dog", &["hd".to_string()]), "a dog, highly detailed");
    }

    #[test]
    fn test_job_state_counters() {
        let state = JobState::new();
        state.begin(3);
        state.next_job();
        state.skip();
        assert_eq!((state.job_no(), state.job_count()), (1, 3));
        assert!(state.is_skipped());
        state.clear_skip();
        assert!(!state.is_skipped());
        assert!(!state.is_interrupted());
        state.interrupt();
        assert!(state.is_interrupted());
    }
}
