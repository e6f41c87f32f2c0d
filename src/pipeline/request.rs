//! Generation request and the per-run seed and prompt plan derived from it.

use std::collections::BTreeMap;

use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::image::{ResizeMode, LATENT_FACTOR};
use crate::masking::{InpaintingFill, MaskSet};
use crate::noise::fixed_seed;

use super::backend::StyleApplier;

/// One prompt for every image, or one prompt per image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Single(String),
    List(Vec<String>),
}

impl Default for Prompt {
    fn default() -> Self {
        Self::Single(String::new())
    }
}

impl Prompt {
    /// The first prompt, or an empty string for an empty list.
    #[must_use]
    pub fn first(&self) -> &str {
        match self {
            Self::Single(prompt) => prompt,
            Self::List(prompts) => prompts.first().map_or("", String::as_str),
        }
    }

    fn expand(&self, count: usize, apply: impl Fn(&str) -> String) -> Vec<String> {
        match self {
            Self::Single(prompt) => vec![apply(prompt); count],
            Self::List(prompts) => prompts.iter().map(|p| apply(p)).collect(),
        }
    }
}

impl From<&str> for Prompt {
    fn from(prompt: &str) -> Self {
        Self::Single(prompt.to_string())
    }
}

impl From<String> for Prompt {
    fn from(prompt: String) -> Self {
        Self::Single(prompt)
    }
}

impl From<Vec<String>> for Prompt {
    fn from(prompts: Vec<String>) -> Self {
        Self::List(prompts)
    }
}

/// Everything the caller asks of one run.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: Prompt,
    pub negative_prompt: Prompt,
    pub styles: Vec<String>,

    /// Base seed; negative picks a random one.
    pub seed: i64,
    /// Explicit per-image seeds, used instead of `seed + i`.
    pub seeds: Option<Vec<u64>>,
    pub subseed: i64,
    pub subseeds: Option<Vec<u64>>,
    pub subseed_strength: f32,
    /// `(width, height)` the seed was first used at.
    pub seed_resize_from: Option<(u32, u32)>,

    pub steps: u32,
    pub cfg_scale: f32,
    pub image_cfg_scale: Option<f32>,
    pub width: u32,
    pub height: u32,
    pub batch_size: usize,
    pub n_iter: usize,
    pub restore_faces: bool,

    pub init_images: Vec<DynamicImage>,
    pub masks: MaskSet,
    pub resize_mode: ResizeMode,
    pub denoising_strength: f32,
    pub mask_blur: u32,
    pub inpainting_fill: InpaintingFill,
    pub inpaint_full_res: bool,
    pub inpaint_full_res_padding: u32,
    pub inpainting_mask_invert: bool,
    /// Overrides [`crate::Options::initial_noise_multiplier`] for this run.
    pub initial_noise_multiplier: Option<f32>,

    pub do_not_save_samples: bool,
    pub do_not_save_grid: bool,
    /// Extra `key: value` pairs appended to every infotext.
    pub extra_generation_params: BTreeMap<String, String>,
    /// Option overrides applied for the duration of the run.
    pub override_settings: Map<String, Value>,
    pub override_settings_restore_afterwards: bool,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: Prompt::default(),
            negative_prompt: Prompt::default(),
            styles: Vec::new(),
            seed: -1,
            seeds: None,
            subseed: -1,
            subseeds: None,
            subseed_strength: 0.0,
            seed_resize_from: None,
            steps: 50,
            cfg_scale: 7.0,
            image_cfg_scale: None,
            width: 512,
            height: 512,
            batch_size: 1,
            n_iter: 1,
            restore_faces: false,
            init_images: Vec::new(),
            masks: MaskSet::default(),
            resize_mode: ResizeMode::JustResize,
            denoising_strength: 0.75,
            mask_blur: 4,
            inpainting_fill: InpaintingFill::Fill,
            inpaint_full_res: true,
            inpaint_full_res_padding: 0,
            inpainting_mask_invert: false,
            initial_noise_multiplier: None,
            do_not_save_samples: false,
            do_not_save_grid: false,
            extra_generation_params: BTreeMap::new(),
            override_settings: Map::new(),
            override_settings_restore_afterwards: true,
        }
    }
}

impl GenerationRequest {
    /// Set the source images and masks; the batch size becomes the image count.
    #[must_use]
    pub fn with_init_images(mut self, images: Vec<DynamicImage>, masks: Vec<GrayImage>) -> Self {
        self.batch_size = images.len();
        self.masks = MaskSet::normalize(masks, images.len());
        self.init_images = images;
        self
    }

    /// Tie the batch size and mask count to the supplied source images.
    ///
    /// Requests without source images are left alone.
    pub fn fit_batch_to_images(&mut self) {
        if self.init_images.is_empty() {
            return;
        }
        if self.batch_size != self.init_images.len() {
            tracing::debug!("Batch size {} follows {} source images", self.batch_size, self.init_images.len());
            self.batch_size = self.init_images.len();
        }
        self.masks.fit_to(self.init_images.len());
    }

    /// Validate the request.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.width % LATENT_FACTOR != 0 || self.height % LATENT_FACTOR != 0 {
            return Err(Error::invalid("size", format!("{}x{} must be a non-zero multiple of 8", self.width, self.height)));
        }

        if self.steps == 0 {
            return Err(Error::invalid("steps", "must be greater than 0"));
        }

        if self.batch_size == 0 || self.n_iter == 0 {
            return Err(Error::invalid("batch_size", "batch size and iteration count must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.denoising_strength) {
            return Err(Error::invalid("denoising_strength", "must be between 0.0 and 1.0"));
        }

        if !(0.0..=1.0).contains(&self.subseed_strength) {
            return Err(Error::invalid("subseed_strength", "must be between 0.0 and 1.0"));
        }

        if !self.cfg_scale.is_finite() {
            return Err(Error::invalid("cfg_scale", "must be finite"));
        }

        if let Prompt::List(prompts) = &self.prompt {
            if prompts.is_empty() {
                return Err(Error::invalid("prompt", "prompt list must not be empty"));
            }
        }

        if !self.masks.is_empty() && self.masks.len() != self.init_images.len() {
            return Err(Error::invalid(
                "masks",
                format!("{} masks for {} images", self.masks.len(), self.init_images.len()),
            ));
        }

        Ok(())
    }
}

/// Prompts and seeds for every image of a run, styles applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPlan {
    pub all_prompts: Vec<String>,
    pub all_negative_prompts: Vec<String>,
    pub all_seeds: Vec<u64>,
    pub all_subseeds: Vec<u64>,
}

impl SeedPlan {
    /// Expand the request's prompts and seeds to one entry per image.
    ///
    /// Single prompts are repeated `batch_size * n_iter` times; seeds count up
    /// from the base seed unless a variation strength is set, in which case
    /// every image shares the base seed and only the sub-seeds vary.
    ///
    /// # Errors
    ///
    /// Returns an error if the expanded lists differ in length.
    pub fn resolve(request: &GenerationRequest, styles: &dyn StyleApplier) -> Result<Self> {
        let count = request.batch_size * request.n_iter;

        let all_prompts = request.prompt.expand(count, |p| styles.apply(p, &request.styles));
        let count = all_prompts.len();
        let all_negative_prompts = request
            .negative_prompt
            .expand(count, |p| styles.apply_negative(p, &request.styles));

        let all_seeds = match &request.seeds {
            Some(seeds) => seeds.clone(),
            None => {
                let seed = fixed_seed(request.seed);
                let step = u64::from(request.subseed_strength == 0.0);
                (0..count as u64).map(|i| seed.wrapping_add(i * step)).collect()
            }
        };

        let all_subseeds = match &request.subseeds {
            Some(subseeds) => subseeds.clone(),
            None => {
                let subseed = fixed_seed(request.subseed);
                (0..count as u64).map(|i| subseed.wrapping_add(i)).collect()
            }
        };

        for (name, len) in [
            ("negative_prompt", all_negative_prompts.len()),
            ("seeds", all_seeds.len()),
            ("subseeds", all_subseeds.len()),
        ] {
            if len != count {
                return Err(Error::invalid(name, format!("expected {count} entries, got {len}")));
            }
        }

        Ok(Self {
            all_prompts,
            all_negative_prompts,
            all_seeds,
            all_subseeds,
        })
    }
}

/// The prompts and seeds of one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSlice {
    pub iteration: usize,
    pub prompts: Vec<String>,
    pub negative_prompts: Vec<String>,
    pub seeds: Vec<u64>,
    pub subseeds: Vec<u64>,
}

impl BatchSlice {
    /// Entries `iteration * batch_size .. (iteration + 1) * batch_size` of `plan`, clipped to its length.
    #[must_use]
    pub fn new(plan: &SeedPlan, iteration: usize, batch_size: usize) -> Self {
        let start = iteration * batch_size;
        let window = |len: usize| start.min(len)..(start + batch_size).min(len);

        Self {
            iteration,
            prompts: plan.all_prompts[window(plan.all_prompts.len())].to_vec(),
            negative_prompts: plan.all_negative_prompts[window(plan.all_negative_prompts.len())].to_vec(),
            seeds: plan.all_seeds[window(plan.all_seeds.len())].to_vec(),
            subseeds: plan.all_subseeds[window(plan.all_subseeds.len())].to_vec(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    /// An empty slice ends the run early.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}
