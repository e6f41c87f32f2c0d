//! Result record of a run and its human-readable generation parameters.

use std::collections::BTreeMap;

use image::DynamicImage;
use serde::Serialize;

use crate::error::Result;
use crate::options::Options;

use super::request::{GenerationRequest, SeedPlan};

/// Everything `create_infotext` reads besides the request itself.
#[derive(Debug, Clone, Copy)]
pub struct InfotextContext<'a> {
    pub request: &'a GenerationRequest,
    pub plan: &'a SeedPlan,
    pub options: &'a Options,
    pub sampler_name: &'a str,
    pub model_hash: Option<&'a str>,
    pub model_name: Option<&'a str>,
    pub denoising_strength: Option<f32>,
    pub inpainting_conditioning: bool,
}

/// Build the parameter text for image `position_in_batch` of `iteration`.
///
/// The first line is the prompt, followed by an optional
/// `Negative prompt:` line and a comma-separated `key: value` list.
#[must_use]
pub fn create_infotext(ctx: &InfotextContext<'_>, iteration: usize, position_in_batch: usize) -> String {
    let request = ctx.request;
    let options = ctx.options;
    let index = position_in_batch + iteration * request.batch_size;
    let variation = request.subseed_strength != 0.0;

    let mut params: Vec<(&str, Option<String>)> = vec![
        ("Steps", Some(request.steps.to_string())),
        ("Sampler", Some(ctx.sampler_name.to_string())),
        ("CFG scale", Some(format_float(request.cfg_scale))),
        ("Image CFG scale", request.image_cfg_scale.map(format_float)),
        ("Seed", ctx.plan.all_seeds.get(index).map(u64::to_string)),
        (
            "Face restoration",
            options.face_restoration_model.clone().filter(|_| request.restore_faces),
        ),
        ("Size", Some(format!("{}x{}", request.width, request.height))),
        (
            "Model hash",
            ctx.model_hash.filter(|_| options.add_model_hash_to_info).map(str::to_string),
        ),
        (
            "Model",
            ctx.model_name
                .filter(|name| options.add_model_name_to_info && !name.is_empty())
                .map(|name| name.replace([',', ':'], "")),
        ),
        (
            "Variation seed",
            ctx.plan.all_subseeds.get(index).filter(|_| variation).map(u64::to_string),
        ),
        (
            "Variation seed strength",
            variation.then(|| format_float(request.subseed_strength)),
        ),
        (
            "Seed resize from",
            request
                .seed_resize_from
                .filter(|&(w, h)| w > 0 && h > 0)
                .map(|(w, h)| format!("{w}x{h}")),
        ),
        ("Denoising strength", ctx.denoising_strength.map(format_float)),
        (
            "Conditional mask weight",
            ctx.inpainting_conditioning
                .then(|| format_float(options.inpainting_mask_weight)),
        ),
        (
            "Clip skip",
            (options.clip_stop_at_last_layers > 1).then(|| options.clip_stop_at_last_layers.to_string()),
        ),
        (
            "ENSD",
            (options.eta_noise_seed_delta != 0).then(|| options.eta_noise_seed_delta.to_string()),
        ),
    ];
    params.extend(
        request
            .extra_generation_params
            .iter()
            .map(|(k, v)| (k.as_str(), Some(v.clone()))),
    );

    let params_text = params
        .iter()
        .filter_map(|(key, value)| {
            let value = value.as_deref()?;
            Some(if *key == value {
                (*key).to_string()
            } else {
                format!("{key}: {}", quote(value))
            })
        })
        .collect::<Vec<_>>()
        .join(", ");

    let prompt = ctx.plan.all_prompts.get(index).map_or("", String::as_str);
    let negative = ctx
        .plan
        .all_negative_prompts
        .get(index)
        .filter(|n| !n.is_empty())
        .map(|n| format!("\nNegative prompt: {n}"))
        .unwrap_or_default();

    format!("{prompt}{negative}\n{params_text}").trim().to_string()
}

/// JSON-quote `value` if it would break `key: value, ...` parsing.
#[must_use]
pub fn quote(value: &str) -> String {
    if value.contains([',', ':', '\n']) {
        serde_json::Value::from(value).to_string()
    } else {
        value.to_string()
    }
}

/// Float formatting that always keeps a fractional part (`7` becomes `7.0`).
#[must_use]
pub fn format_float(value: f32) -> String {
    let text = value.to_string();
    if value.is_finite() && !text.contains(['.', 'e']) {
        format!("{text}.0")
    } else {
        text
    }
}

/// Output of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct Processed {
    /// Output images, grid first when one was returned.
    #[serde(skip)]
    pub images: Vec<DynamicImage>,
    pub prompt: String,
    pub all_prompts: Vec<String>,
    pub negative_prompt: String,
    pub all_negative_prompts: Vec<String>,
    pub seed: u64,
    pub all_seeds: Vec<u64>,
    pub subseed: u64,
    pub all_subseeds: Vec<u64>,
    pub subseed_strength: f32,
    pub width: u32,
    pub height: u32,
    pub sampler_name: String,
    pub cfg_scale: f32,
    pub image_cfg_scale: Option<f32>,
    pub steps: u32,
    pub batch_size: usize,
    pub restore_faces: bool,
    pub face_restoration_model: Option<String>,
    pub sd_model_hash: Option<String>,
    pub seed_resize_from_w: u32,
    pub seed_resize_from_h: u32,
    pub denoising_strength: Option<f32>,
    pub extra_generation_params: BTreeMap<String, String>,
    pub index_of_first_image: usize,
    pub infotexts: Vec<String>,
    pub styles: Vec<String>,
    pub clip_skip: u32,
    pub is_using_inpainting_conditioning: bool,
    /// Infotext of the first image.
    pub info: String,
    /// Warnings gathered during the run, each preceded by a blank line.
    pub comments: String,
}

impl Processed {
    /// Assemble the record from a finished run.
    #[must_use]
    pub fn new(
        ctx: &InfotextContext<'_>,
        images: Vec<DynamicImage>,
        infotexts: Vec<String>,
        comments: &[String],
        index_of_first_image: usize,
    ) -> Self {
        let request = ctx.request;
        let plan = ctx.plan;
        let info = create_infotext(ctx, 0, 0);
        let infotexts = if infotexts.is_empty() { vec![info.clone()] } else { infotexts };
        let (seed_resize_from_w, seed_resize_from_h) = request.seed_resize_from.unwrap_or((0, 0));

        Self {
            images,
            prompt: plan.all_prompts.first().cloned().unwrap_or_default(),
            all_prompts: plan.all_prompts.clone(),
            negative_prompt: plan.all_negative_prompts.first().cloned().unwrap_or_default(),
            all_negative_prompts: plan.all_negative_prompts.clone(),
            seed: plan.all_seeds.first().copied().unwrap_or_default(),
            all_seeds: plan.all_seeds.clone(),
            subseed: plan.all_subseeds.first().copied().unwrap_or_default(),
            all_subseeds: plan.all_subseeds.clone(),
            subseed_strength: request.subseed_strength,
            width: request.width,
            height: request.height,
            sampler_name: ctx.sampler_name.to_string(),
            cfg_scale: request.cfg_scale,
            image_cfg_scale: request.image_cfg_scale,
            steps: request.steps,
            batch_size: request.batch_size,
            restore_faces: request.restore_faces,
            face_restoration_model: ctx
                .options
                .face_restoration_model
                .clone()
                .filter(|_| request.restore_faces),
            sd_model_hash: ctx.model_hash.map(str::to_string),
            seed_resize_from_w,
            seed_resize_from_h,
            denoising_strength: ctx.denoising_strength,
            extra_generation_params: request.extra_generation_params.clone(),
            index_of_first_image,
            infotexts,
            styles: request.styles.clone(),
            clip_skip: ctx.options.clip_stop_at_last_layers,
            is_using_inpainting_conditioning: ctx.inpainting_conditioning,
            info,
            comments: comments.iter().map(|c| format!("\n\n{c}")).collect(),
        }
    }

    /// Serialise everything but the images as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn js(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Output images after the grid, if any.
    #[must_use]
    pub fn samples(&self) -> &[DynamicImage] {
        &self.images[self.index_of_first_image.min(self.images.len())..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> SeedPlan {
        SeedPlan {
            all_prompts: vec!["a cat".to_string(), "a dog".to_string()],
            all_negative_prompts: vec!["blurry".to_string(), String::new()],
            all_seeds: vec![100, 101],
            all_subseeds: vec![7, 8],
        }
    }

    fn ctx<'a>(request: &'a GenerationRequest, plan: &'a SeedPlan, options: &'a Options) -> InfotextContext<'a> {
        InfotextContext {
            request,
            plan,
            options,
            sampler_name: "Euler a",
            model_hash: Some("abc123"),
            model_name: Some("model, v1: final"),
            denoising_strength: Some(0.75),
            inpainting_conditioning: false,
        }
    }

    #[test]
    fn test_infotext_layout() {
        let request = GenerationRequest {
            steps: 20,
            batch_size: 2,
            ..GenerationRequest::default()
        };
        let plan = plan();
        let options = Options::default();

        let text = create_infotext(&ctx(&request, &plan, &options), 0, 0);
        assert_eq!(
            text,
            "a cat\nNegative prompt: blurry\nSteps: 20, Sampler: Euler a, CFG scale: 7.0, Seed: 100, \
             Size: 512x512, Model hash: abc123, Model: model v1 final, Denoising strength: 0.75"
        );

        let second = create_infotext(&ctx(&request, &plan, &options), 0, 1);
        assert!(second.starts_with("a dog\nSteps: 20"));
        assert!(second.contains("Seed: 101"));
    }

    #[test]
    fn test_infotext_optional_keys() {
        let mut request = GenerationRequest {
            batch_size: 2,
            subseed_strength: 0.25,
            seed_resize_from: Some((640, 480)),
            ..GenerationRequest::default()
        };
        request
            .extra_generation_params
            .insert("Noise multiplier".to_string(), "0.9".to_string());
        request
            .extra_generation_params
            .insert("Hires".to_string(), "Hires".to_string());
        let plan = plan();
        let options = Options {
            eta_noise_seed_delta: 31337,
            clip_stop_at_last_layers: 2,
            add_model_hash_to_info: false,
            ..Options::default()
        };

        let text = create_infotext(&ctx(&request, &plan, &options), 0, 1);
        assert!(text.contains("Variation seed: 8, Variation seed strength: 0.25, Seed resize from: 640x480"));
        assert!(text.contains("Clip skip: 2, ENSD: 31337"));
        assert!(text.ends_with("Hires, Noise multiplier: 0.9"));
        assert!(!text.contains("Model hash"));
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("a, b"), "\"a, b\"");
        assert_eq!(quote("line\nbreak"), "\"line\\nbreak\"");
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(7.0), "7.0");
        assert_eq!(format_float(0.75), "0.75");
    }

    #[test]
    fn test_js_serializes_fields() {
        let request = GenerationRequest {
            batch_size: 2,
            ..GenerationRequest::default()
        };
        let plan = plan();
        let options = Options::default();
        let processed = Processed::new(&ctx(&request, &plan, &options), Vec::new(), Vec::new(), &["truncated".to_string()], 0);

        let value: serde_json::Value = serde_json::from_str(&processed.js().unwrap()).unwrap();
        assert_eq!(value["all_seeds"], serde_json::json!([100, 101]));
        assert_eq!(value["sampler_name"], "Euler a");
        assert_eq!(value["comments"], "\n\ntruncated");
        assert_eq!(processed.infotexts.len(), 1);
    }
}
