//! Run-wide settings and scoped per-request overrides.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::masking::MaskFill;
use crate::pipeline::ModelBackend;

/// Settings shared by every run.
///
/// Loaded from JSON with missing keys falling back to [`Options::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Checkpoint to load (`None` keeps whatever the backend has).
    pub sd_model_checkpoint: Option<String>,
    /// VAE to load (`None` uses the checkpoint's own).
    pub sd_vae: Option<String>,

    /// Seed offset for sampler-internal noise (0 = off).
    pub eta_noise_seed_delta: u64,
    /// Pre-draw sampler noise so a batch matches single-image runs.
    pub enable_batch_seeds: bool,
    /// Default scale applied to the initial noise of img2img.
    pub initial_noise_multiplier: f32,

    /// Capture colour histograms from the inputs and match outputs to them.
    pub img2img_color_correction: bool,
    /// Background that transparent inputs are flattened onto.
    pub img2img_background_color: [u8; 3],
    /// How strongly the mask is applied to inpainting-model conditioning.
    pub inpainting_mask_weight: f32,
    /// Pixel pre-fill strategy for masked areas.
    pub mask_fill: MaskFill,

    /// Keep the cache key step count as-is for second-order samplers.
    pub dont_fix_second_order_samplers_schedule: bool,
    /// CLIP layer to stop at (recorded as "Clip skip" when above 1).
    pub clip_stop_at_last_layers: u32,
    /// Name of the face restoration model recorded in metadata.
    pub face_restoration_model: Option<String>,
    pub add_model_hash_to_info: bool,
    pub add_model_name_to_info: bool,

    pub samples_save: bool,
    pub samples_format: String,
    pub grid_format: String,
    pub save_images_before_face_restoration: bool,
    pub save_images_before_color_correction: bool,
    pub save_mask: bool,
    pub save_mask_composite: bool,
    pub return_mask: bool,
    pub return_mask_composite: bool,

    pub return_grid: bool,
    pub grid_save: bool,
    pub grid_only_if_multiple: bool,
    /// Grid rows: positive is fixed, 0 uses the batch size, negative picks a square-ish layout.
    pub n_rows: i32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sd_model_checkpoint: None,
            sd_vae: None,
            eta_noise_seed_delta: 0,
            enable_batch_seeds: true,
            initial_noise_multiplier: 1.0,
            img2img_color_correction: false,
            img2img_background_color: [255, 255, 255],
            inpainting_mask_weight: 1.0,
            mask_fill: MaskFill::Blur,
            dont_fix_second_order_samplers_schedule: false,
            clip_stop_at_last_layers: 1,
            face_restoration_model: None,
            add_model_hash_to_info: true,
            add_model_name_to_info: true,
            samples_save: true,
            samples_format: "png".to_string(),
            grid_format: "png".to_string(),
            save_images_before_face_restoration: false,
            save_images_before_color_correction: false,
            save_mask: false,
            save_mask_composite: false,
            return_mask: false,
            return_mask_composite: false,
            return_grid: true,
            grid_save: true,
            grid_only_if_multiple: true,
            n_rows: -1,
        }
    }
}

impl Options {
    /// Load options from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or holds invalid values.
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let options: Self = serde_json::from_str(&text)?;
        options.validate()?;
        Ok(options)
    }

    /// Validate the options.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        if !self.initial_noise_multiplier.is_finite() || self.initial_noise_multiplier < 0.0 {
            return Err(Error::invalid("initial_noise_multiplier", "must be a non-negative number"));
        }

        if !(0.0..=1.0).contains(&self.inpainting_mask_weight) {
            return Err(Error::invalid("inpainting_mask_weight", "must be between 0.0 and 1.0"));
        }

        if self.clip_stop_at_last_layers == 0 {
            return Err(Error::invalid("clip_stop_at_last_layers", "must be at least 1"));
        }

        if self.samples_format.is_empty() || self.grid_format.is_empty() {
            return Err(Error::invalid("samples_format", "output formats must not be empty"));
        }

        Ok(())
    }
}

const CHECKPOINT_KEY: &str = "sd_model_checkpoint";
const VAE_KEY: &str = "sd_vae";

/// Options and model state patched for the duration of one run.
///
/// Dropping the scope puts the previous options back and reloads any weights
/// that were swapped, on success and on error alike.
pub struct OverrideScope<'a> {
    options: &'a mut Options,
    backend: &'a mut dyn ModelBackend,
    stored: Option<Options>,
}

impl<'a> OverrideScope<'a> {
    /// Patch `overrides` onto `options`, swapping weights where asked.
    ///
    /// A checkpoint override naming an unknown checkpoint is dropped and the
    /// loaded model is kept. With `restore_afterwards` unset the patched
    /// options outlive the scope.
    ///
    /// # Errors
    ///
    /// Returns an error if an override has the wrong type or weights fail to
    /// load. Options are already restored when this returns an error.
    pub fn apply(
        options: &'a mut Options,
        backend: &'a mut dyn ModelBackend,
        overrides: &Map<String, Value>,
        restore_afterwards: bool,
    ) -> Result<Self> {
        let mut overrides = overrides.clone();
        if let Some(name) = overrides.get(CHECKPOINT_KEY) {
            let known = name.as_str().is_some_and(|name| backend.has_checkpoint(name));
            if !known {
                tracing::warn!("Checkpoint {name} not found; keeping the loaded model");
                overrides.remove(CHECKPOINT_KEY);
            }
        }

        let stored = restore_afterwards.then(|| options.clone());
        let mut scope = Self {
            options,
            backend,
            stored,
        };

        if !overrides.is_empty() {
            scope.patch(&overrides)?;
        }
        Ok(scope)
    }

    fn patch(&mut self, overrides: &Map<String, Value>) -> Result<()> {
        let mut value = serde_json::to_value(&*self.options)?;
        if let Value::Object(fields) = &mut value {
            for (key, override_value) in overrides {
                if !fields.contains_key(key) {
                    tracing::warn!("Ignoring unknown option override {key}");
                    continue;
                }
                tracing::debug!("Overriding {key} = {override_value}");
                fields.insert(key.clone(), override_value.clone());
            }
        }

        let patched: Options = serde_json::from_value(value)?;
        patched.validate()?;
        *self.options = patched;

        if overrides.contains_key(CHECKPOINT_KEY) {
            self.backend.reload_weights(self.options.sd_model_checkpoint.as_deref())?;
        }
        if overrides.contains_key(VAE_KEY) {
            self.backend.reload_vae(self.options.sd_vae.as_deref())?;
        }
        Ok(())
    }

    /// The options in effect for this run.
    #[must_use]
    pub fn options(&self) -> &Options {
        self.options
    }

    /// Options and backend, borrowed together for the run.
    pub fn parts(&mut self) -> (&Options, &mut dyn ModelBackend) {
        (&*self.options, &mut *self.backend)
    }
}

impl Drop for OverrideScope<'_> {
    fn drop(&mut self) {
        let Some(stored) = self.stored.take() else {
            return;
        };

        let checkpoint_changed = stored.sd_model_checkpoint != self.options.sd_model_checkpoint;
        let vae_changed = stored.sd_vae != self.options.sd_vae;
        *self.options = stored;

        if checkpoint_changed {
            if let Err(err) = self.backend.reload_weights(self.options.sd_model_checkpoint.as_deref()) {
                tracing::error!("Failed to restore model weights: {err}");
            }
        }
        if vae_changed {
            if let Err(err) = self.backend.reload_vae(self.options.sd_vae.as_deref()) {
                tracing::error!("Failed to restore VAE weights: {err}");
            }
        }
    }
}
