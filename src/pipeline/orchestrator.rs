//! The batch loop: conditioning, sampling, decoding, and per-image post-processing.

use image::{DynamicImage, RgbImage};
use ndarray::{concatenate, s, Axis};

use crate::error::{Error, Result};
use crate::image::{apply_color_correction, apply_overlay, image_grid, mask_composite, ImageTensor};
use crate::options::{Options, OverrideScope};

use super::backend::{
    Conditioner, Embedding, FaceRestorer, ImageSink, JobState, LatentTensor, ModelBackend, OutputKind, Sampler,
    SaveRequest, Scripts, StyleApplier,
};
use super::cache::{ConditioningCache, Polarity};
use super::preprocess::PostprocessInputs;
use super::processed::{create_infotext, InfotextContext, Processed};
use super::request::{BatchSlice, GenerationRequest, SeedPlan};

/// What a processing strategy may touch while preparing or sampling.
pub struct Stage<'s> {
    pub options: &'s Options,
    pub backend: &'s mut dyn ModelBackend,
    pub sampler: &'s mut dyn Sampler,
}

/// A generation mode plugged into the batch loop.
pub trait Processing {
    /// Prepare shared state once, before the first iteration.
    ///
    /// # Errors
    ///
    /// Returns an error if preparation fails.
    fn init(&mut self, request: &GenerationRequest, plan: &SeedPlan, stage: &mut Stage<'_>) -> Result<()>;

    /// Produce the latents of one batch.
    ///
    /// # Errors
    ///
    /// Returns an error if sampling fails.
    fn sample(
        &mut self,
        request: &mut GenerationRequest,
        batch: &BatchSlice,
        cond: &Embedding,
        uncond: &Embedding,
        stage: &mut Stage<'_>,
    ) -> Result<LatentTensor>;

    /// Overlays, paste regions, and colour references for post-processing.
    fn postprocess_inputs(&self) -> Option<&PostprocessInputs> {
        None
    }

    /// Denoising strength reported in the infotext.
    fn denoising_strength(&self, _request: &GenerationRequest) -> Option<f32> {
        None
    }

    fn is_using_inpainting_conditioning(&self) -> bool {
        false
    }

    /// Called after the last iteration.
    fn finish(&mut self) {}
}

/// External services a run is driven through.
pub struct Collaborators<'c> {
    pub backend: &'c mut dyn ModelBackend,
    pub sampler: &'c mut dyn Sampler,
    pub conditioner: &'c dyn Conditioner,
    pub face_restorer: Option<&'c dyn FaceRestorer>,
    pub styles: &'c dyn StyleApplier,
    pub sink: &'c mut dyn ImageSink,
    pub scripts: &'c mut dyn Scripts,
    pub state: &'c JobState,
}

/// Run `request` with its option overrides applied for the duration of the run.
///
/// Overridden options and swapped weights are restored before this returns,
/// whether the run succeeded or not.
///
/// # Errors
///
/// Returns an error if the request is invalid, a collaborator fails, or a
/// decoded image contains NaN values.
pub fn process_images(
    request: &mut GenerationRequest,
    processing: &mut dyn Processing,
    options: &mut Options,
    collaborators: Collaborators<'_>,
) -> Result<Processed> {
    let Collaborators {
        backend,
        sampler,
        conditioner,
        face_restorer,
        styles,
        sink,
        scripts,
        state,
    } = collaborators;

    let overrides = request.override_settings.clone();
    let mut scope = OverrideScope::apply(options, backend, &overrides, request.override_settings_restore_afterwards)?;
    let (options, backend) = scope.parts();

    let processed = process_images_inner(
        request,
        processing,
        options,
        Collaborators {
            backend,
            sampler,
            conditioner,
            face_restorer,
            styles,
            sink,
            scripts,
            state,
        },
    )?;
    Ok(processed)
}

/// The batch loop itself, with `options` taken as-is.
///
/// # Errors
///
/// See [`process_images`].
pub fn process_images_inner<'a>(
    request: &mut GenerationRequest,
    processing: &mut dyn Processing,
    options: &'a Options,
    collaborators: Collaborators<'a>,
) -> Result<Processed> {
    request.fit_batch_to_images();
    request.validate()?;

    let mut run = Run {
        options,
        info: RunInfo {
            sampler_name: collaborators.sampler.name().to_string(),
            model_hash: collaborators.backend.model_hash(),
            model_name: collaborators.backend.model_name(),
        },
        c: collaborators,
        images: Vec::new(),
        infotexts: Vec::new(),
        comments: Vec::new(),
    };
    run.process(request, processing)
}

/// Per-run facts recorded in every infotext.
struct RunInfo {
    sampler_name: String,
    model_hash: Option<String>,
    model_name: Option<String>,
}

impl RunInfo {
    fn context<'a>(
        &'a self,
        request: &'a GenerationRequest,
        plan: &'a SeedPlan,
        options: &'a Options,
        processing: &dyn Processing,
    ) -> InfotextContext<'a> {
        InfotextContext {
            request,
            plan,
            options,
            sampler_name: &self.sampler_name,
            model_hash: self.model_hash.as_deref(),
            model_name: self.model_name.as_deref(),
            denoising_strength: processing.denoising_strength(request),
            inpainting_conditioning: processing.is_using_inpainting_conditioning(),
        }
    }
}

struct Run<'r> {
    options: &'r Options,
    info: RunInfo,
    c: Collaborators<'r>,
    images: Vec<DynamicImage>,
    infotexts: Vec<String>,
    comments: Vec<String>,
}

impl Run<'_> {
    fn stage(&mut self) -> Stage<'_> {
        Stage {
            options: self.options,
            backend: &mut *self.c.backend,
            sampler: &mut *self.c.sampler,
        }
    }

    fn infotext(
        &self,
        request: &GenerationRequest,
        plan: &SeedPlan,
        processing: &dyn Processing,
        iteration: usize,
        position: usize,
    ) -> String {
        create_infotext(
            &self.info.context(request, plan, self.options, processing),
            iteration,
            position,
        )
    }

    fn save(&mut self, image: &DynamicImage, request: &SaveRequest<'_>) -> Result<()> {
        self.c.sink.save(image, request)
    }

    fn process(&mut self, request: &mut GenerationRequest, processing: &mut dyn Processing) -> Result<Processed> {
        let plan = SeedPlan::resolve(request, self.c.styles)?;
        tracing::info!(
            "Generating {} images in {} iterations of {}",
            plan.all_prompts.len(),
            request.n_iter,
            request.batch_size
        );

        self.c.scripts.process(request);

        processing.init(request, &plan, &mut self.stage())?;

        if self.c.state.job_count() == 0 {
            self.c.state.begin(request.n_iter);
        }

        let mut cache = ConditioningCache::<Embedding>::new();
        for n in 0..request.n_iter {
            self.c.state.clear_skip();
            if self.c.state.is_interrupted() {
                tracing::info!("Interrupted before iteration {}", n + 1);
                break;
            }

            let batch = BatchSlice::new(&plan, n, request.batch_size);
            self.c.scripts.before_process_batch(request, &batch);
            if batch.is_empty() {
                break;
            }
            self.c.scripts.process_batch(request, &batch);

            if n == 0 {
                let params = self.infotext(request, &plan, processing, 0, 0);
                self.c.sink.write_params(&params)?;
            }

            let step_multiplier =
                if self.c.sampler.is_second_order() && !self.options.dont_fix_second_order_samplers_schedule {
                    2
                } else {
                    1
                };
            let steps = request.steps * step_multiplier;

            let conditioner = self.c.conditioner;
            let uncond = cache.get_or_compute(Polarity::Unconditional, &batch.negative_prompts, steps, |p, s| {
                conditioner.unconditional(p, s)
            })?;
            let cond = cache.get_or_compute(Polarity::Conditional, &batch.prompts, steps, |p, s| {
                conditioner.conditional(p, s)
            })?;
            for comment in conditioner.comments() {
                if !self.comments.contains(&comment) {
                    self.comments.push(comment);
                }
            }

            if request.n_iter > 1 {
                tracing::info!("Batch {} out of {}", n + 1, request.n_iter);
            }

            let samples = processing.sample(request, &batch, &cond, &uncond, &mut self.stage())?;
            if self.c.state.is_skipped() {
                tracing::info!("Skipped batch {}", n + 1);
                self.c.state.next_job();
                continue;
            }
            let mut decoded = self.decode(&samples)?;
            drop(samples);
            decoded.mapv_inplace(|v| ((v + 1.0) / 2.0).clamp(0.0, 1.0));

            self.c.scripts.postprocess_batch(request, &mut decoded, n);

            for i in 0..decoded.dim().0.min(batch.len()) {
                let image = sample_to_image(&decoded, i);
                self.postprocess_image(request, &plan, &batch, processing, image, i)?;
            }

            self.c.state.next_job();
        }

        processing.finish();

        let index_of_first_image = self.assemble_grid(request, &plan, processing)?;

        let ctx = self.info.context(request, &plan, self.options, processing);
        let processed = Processed::new(
            &ctx,
            std::mem::take(&mut self.images),
            std::mem::take(&mut self.infotexts),
            &self.comments,
            index_of_first_image,
        );

        self.c.scripts.postprocess(request, &processed);
        Ok(processed)
    }

    /// Decode one latent at a time and reject NaN output.
    fn decode(&mut self, samples: &LatentTensor) -> Result<ImageTensor> {
        let mut decoded = Vec::with_capacity(samples.dim().0);
        for i in 0..samples.dim().0 {
            let single = samples.slice(s![i..=i, .., .., ..]).to_owned();
            let image = self.c.backend.decode_first_stage(&single)?;
            if image.iter().any(|v| v.is_nan()) {
                return Err(Error::NanDetected { stage: "vae" });
            }
            decoded.push(image);
        }

        let views: Vec<_> = decoded.iter().map(ImageTensor::view).collect();
        concatenate(Axis(0), &views).map_err(|err| Error::ShapeMismatch {
            expected: "equally sized decoded images".to_string(),
            actual: err.to_string(),
        })
    }

    #[allow(clippy::too_many_lines)]
    fn postprocess_image(
        &mut self,
        request: &mut GenerationRequest,
        plan: &SeedPlan,
        batch: &BatchSlice,
        processing: &dyn Processing,
        mut image: RgbImage,
        i: usize,
    ) -> Result<()> {
        let options = self.options;
        let n = batch.iteration;
        let seed = batch.seeds[i];
        let prompt = batch.prompts[i].clone();
        let save_allowed = !request.do_not_save_samples;

        if request.restore_faces {
            if save_allowed && options.save_images_before_face_restoration {
                let info = self.infotext(request, plan, processing, n, i);
                self.save(
                    &DynamicImage::ImageRgb8(image.clone()),
                    &SaveRequest {
                        kind: OutputKind::Sample,
                        seed,
                        prompt: &prompt,
                        info: &info,
                        suffix: Some("-before-face-restoration"),
                        format: &options.samples_format,
                    },
                )?;
            }

            match self.c.face_restorer {
                Some(restorer) => {
                    tracing::debug!("Restoring faces with {}", restorer.name());
                    image = restorer.restore(image)?;
                }
                None => tracing::warn!("Face restoration requested but no restorer is configured"),
            }
        }

        self.c.scripts.postprocess_image(request, &mut image);

        let info = self.infotext(request, plan, processing, n, i);
        let post = processing.postprocess_inputs();
        let paste = post.and_then(|p| p.paste_region(i));
        let overlay = post.and_then(|p| p.overlay(i));

        if let Some(reference) = post.and_then(|p| p.color_reference(i)) {
            if save_allowed && options.save_images_before_color_correction {
                let uncorrected = apply_overlay(&image, paste, overlay);
                self.save(
                    &DynamicImage::ImageRgb8(uncorrected),
                    &SaveRequest {
                        kind: OutputKind::Sample,
                        seed,
                        prompt: &prompt,
                        info: &info,
                        suffix: Some("-before-color-correction"),
                        format: &options.samples_format,
                    },
                )?;
            }
            image = apply_color_correction(reference, &image);
        }

        let image = apply_overlay(&image, paste, overlay);
        let sample_save = SaveRequest {
            kind: OutputKind::Sample,
            seed,
            prompt: &prompt,
            info: &info,
            suffix: None,
            format: &options.samples_format,
        };

        if options.samples_save && save_allowed {
            self.save(&DynamicImage::ImageRgb8(image.clone()), &sample_save)?;
        }

        let wants_mask =
            options.save_mask || options.save_mask_composite || options.return_mask || options.return_mask_composite;
        let mut extra_outputs = Vec::new();
        if let Some(mask) = post.and_then(|p| p.overlay_mask(i)).filter(|_| wants_mask) {
            let mask_image = DynamicImage::ImageRgb8(DynamicImage::ImageLuma8(mask.clone()).to_rgb8());
            let composite = DynamicImage::ImageRgba8(mask_composite(&image, mask));

            if options.save_mask {
                let request = SaveRequest {
                    suffix: Some("-mask"),
                    ..sample_save.clone()
                };
                self.save(&mask_image, &request)?;
            }
            if options.save_mask_composite {
                let request = SaveRequest {
                    suffix: Some("-mask-composite"),
                    ..sample_save.clone()
                };
                self.save(&composite, &request)?;
            }

            if options.return_mask {
                extra_outputs.push(mask_image);
            }
            if options.return_mask_composite {
                extra_outputs.push(composite);
            }
        }

        self.infotexts.push(info.clone());
        self.images.push(DynamicImage::ImageRgb8(image));
        self.images.extend(extra_outputs);

        Ok(())
    }

    /// Build, save, and prepend the grid as configured; returns the index of the first sample.
    fn assemble_grid(&mut self, request: &GenerationRequest, plan: &SeedPlan, processing: &dyn Processing) -> Result<usize> {
        let options = self.options;
        let unwanted_for_count = self.images.len() < 2 && options.grid_only_if_multiple;
        if !(options.return_grid || options.grid_save) || request.do_not_save_grid || unwanted_for_count {
            return Ok(0);
        }

        let grid = DynamicImage::ImageRgb8(image_grid(&self.images, request.batch_size, options.n_rows));
        let text = self.infotext(request, plan, processing, 0, 0);

        if options.grid_save {
            let prompt = plan.all_prompts.first().map_or("", String::as_str);
            self.save(
                &grid,
                &SaveRequest {
                    kind: OutputKind::Grid,
                    seed: plan.all_seeds.first().copied().unwrap_or_default(),
                    prompt,
                    info: &text,
                    suffix: None,
                    format: &options.grid_format,
                },
            )?;
        }

        if options.return_grid {
            self.infotexts.insert(0, text);
            self.images.insert(0, grid);
            Ok(1)
        } else {
            Ok(0)
        }
    }
}

/// Image `index` of a `[0, 1]` NCHW batch, truncated to 8 bits.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn sample_to_image(samples: &ImageTensor, index: usize) -> RgbImage {
    let (_, _, height, width) = samples.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        image::Rgb([
            (255.0 * samples[[index, 0, y, x]]) as u8,
            (255.0 * samples[[index, 1, y, x]]) as u8,
            (255.0 * samples[[index, 2, y, x]]) as u8,
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_image_truncates() {
        let mut samples = ImageTensor::zeros((1, 3, 2, 2));
        samples[[0, 0, 0, 0]] = 1.0;
        samples[[0, 1, 1, 1]] = 0.999;

        let image = sample_to_image(&samples, 0);
        assert_eq!(image.get_pixel(0, 0)[0], 255);
        assert_eq!(image.get_pixel(1, 1)[1], 254);
    }
}
