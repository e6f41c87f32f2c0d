//! Image-to-image strategy: source images and masks into an init latent.

use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, Rgb, RgbImage, RgbaImage};
use ndarray::{concatenate, s, Array4, Axis};

use crate::error::{Error, Result};
use crate::image::{
    fit_mask, flatten, images_to_tensor, masked_overlay, resize_image, ColorReference, ImageTensor, ResizeMode,
    LATENT_FACTOR,
};
use crate::masking::{self, CropRegion, InpaintingFill};
use crate::noise::{NoiseGenerator, Variation};
use crate::options::Options;

use super::backend::{Embedding, ImageConditioning, LatentTensor, ModelBackend, SamplerCall};
use super::orchestrator::{Processing, Stage};
use super::request::{BatchSlice, GenerationRequest, SeedPlan};
use super::sampling::{batch_noise, LatentMasks, SamplingDriver};
use super::txt2img::placeholder_conditioning;

/// Per-image inputs of the post-sampling compositing steps.
#[derive(Debug, Clone, Default)]
pub struct PostprocessInputs {
    /// Source pixels outside the mask, composited over each output.
    pub overlays: Vec<RgbaImage>,
    /// Where each output is pasted back when inpainting at full resolution.
    pub paste_regions: Vec<Option<CropRegion>>,
    /// Mask shown by the mask and mask-composite outputs.
    pub overlay_masks: Vec<GrayImage>,
    /// Histograms the outputs are colour-matched to.
    pub color_references: Vec<ColorReference>,
}

impl PostprocessInputs {
    #[must_use]
    pub fn overlay(&self, index: usize) -> Option<&RgbaImage> {
        self.overlays.get(index)
    }

    #[must_use]
    pub fn paste_region(&self, index: usize) -> Option<CropRegion> {
        self.paste_regions.get(index).copied().flatten()
    }

    #[must_use]
    pub fn overlay_mask(&self, index: usize) -> Option<&GrayImage> {
        self.overlay_masks.get(index)
    }

    #[must_use]
    pub fn color_reference(&self, index: usize) -> Option<&ColorReference> {
        self.color_references.get(index)
    }
}

/// Latents and conditioning shared by every iteration of an img2img run.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub init_latent: LatentTensor,
    pub latent_masks: Option<LatentMasks>,
    pub image_conditioning: ImageConditioning,
}

/// Image-to-image and inpainting strategy.
#[derive(Debug, Clone, Default)]
pub struct Img2Img {
    prepared: Option<PreparedBatch>,
    post: PostprocessInputs,
    inpainting_conditioning: bool,
}

/// One source image after flattening, cropping, and filling.
struct PreparedImage {
    pixels: RgbImage,
    canvas_mask: Option<GrayImage>,
}

impl Img2Img {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The prepared latents, available after `init`.
    #[must_use]
    pub fn prepared(&self) -> Option<&PreparedBatch> {
        self.prepared.as_ref()
    }

    fn prepare_image(
        &mut self,
        request: &GenerationRequest,
        options: &Options,
        index: usize,
        source: &DynamicImage,
    ) -> PreparedImage {
        let (width, height) = (request.width, request.height);
        let mut image = flatten(source, Rgb(options.img2img_background_color));

        let mut paste = None;
        let mut canvas_mask = None;
        if let Some(raw) = request.masks.as_slice().get(index) {
            let mut mask = raw.clone();
            if request.inpainting_mask_invert {
                mask = masking::invert(&mask);
            }
            #[allow(clippy::cast_precision_loss)]
            let mask = masking::blur_mask(&mask, request.mask_blur as f32);

            if request.inpaint_full_res {
                let region = masking::bounding_region(&mask, request.inpaint_full_res_padding);
                let region = masking::expand_region(region, width, height, mask.width(), mask.height());
                tracing::debug!("Image {index}: inpainting region {region:?}");

                let cropped = imageops::crop_imm(&mask, region.x1, region.y1, region.width(), region.height()).to_image();
                canvas_mask = Some(resize_luma(ResizeMode::ResizeAndFill, &cropped, width, height));
                self.post.overlay_masks.push(mask);
                paste = Some(region);
            } else {
                let resized = resize_luma(request.resize_mode, &mask, width, height);
                let mut doubled = resized.clone();
                for pixel in doubled.pixels_mut() {
                    pixel[0] = pixel[0].saturating_mul(2);
                }
                self.post.overlay_masks.push(doubled);
                canvas_mask = Some(resized);
            }
        }

        if paste.is_none() && request.resize_mode != ResizeMode::LatentUpscale {
            image = resize_image(request.resize_mode, &DynamicImage::ImageRgb8(image), width, height).to_rgb8();
        }

        if let Some(overlay_mask) = self.post.overlay_masks.get(index) {
            self.post.overlays.push(masked_overlay(&image, overlay_mask));
            self.post.paste_regions.push(paste);
        }

        if let Some(region) = paste {
            let cropped = imageops::crop_imm(&image, region.x1, region.y1, region.width(), region.height()).to_image();
            image = resize_image(ResizeMode::ResizeAndFill, &DynamicImage::ImageRgb8(cropped), width, height).to_rgb8();
        }

        if let Some(mask) = &canvas_mask {
            if request.inpainting_fill != InpaintingFill::Original {
                let mask = fit_mask(mask, image.width(), image.height());
                image = options.mask_fill.apply(&image, &mask);
            }
        }

        if options.img2img_color_correction {
            self.post.color_references.push(ColorReference::capture(&image));
        }

        PreparedImage {
            pixels: image,
            canvas_mask,
        }
    }
}

impl Processing for Img2Img {
    fn init(&mut self, request: &GenerationRequest, plan: &SeedPlan, stage: &mut Stage<'_>) -> Result<()> {
        if request.init_images.is_empty() {
            return Err(Error::invalid("init_images", "img2img needs at least one source image"));
        }

        self.post = PostprocessInputs::default();
        let prepared: Vec<PreparedImage> = request
            .init_images
            .iter()
            .enumerate()
            .map(|(i, source)| self.prepare_image(request, stage.options, i, source))
            .collect();

        let pixels: Vec<RgbImage> = prepared.iter().map(|p| p.pixels.clone()).collect();
        let source = images_to_tensor(&pixels)?;
        tracing::info!("Encoding {} source images", pixels.len());
        let mut init_latent = stage.backend.encode_first_stage(&source)?;

        let latent_h = (request.height / LATENT_FACTOR) as usize;
        let latent_w = (request.width / LATENT_FACTOR) as usize;
        if request.resize_mode == ResizeMode::LatentUpscale {
            init_latent = interpolate_bilinear(&init_latent, latent_h, latent_w);
        }

        let canvas_masks: Option<Vec<GrayImage>> = prepared.into_iter().map(|p| p.canvas_mask).collect();
        let latent_masks = match &canvas_masks {
            Some(masks) => Some(build_latent_masks(masks, &init_latent)?),
            None => None,
        };

        if let Some(masks) = &latent_masks {
            match request.inpainting_fill {
                InpaintingFill::LatentNoise => {
                    let (b, c, h, w) = init_latent.dim();
                    let seeds = plan.all_seeds.get(..b).ok_or_else(|| {
                        Error::invalid("seeds", format!("{b} seeds needed for latent noise fill"))
                    })?;
                    let noise = NoiseGenerator::new(0, false).generate([c, h, w], seeds, &Variation::default(), 0)?;
                    init_latent = &init_latent * &masks.keep + &noise.noise * &masks.edit;
                }
                InpaintingFill::LatentNothing => init_latent = &init_latent * &masks.keep,
                InpaintingFill::Fill | InpaintingFill::Original => {}
            }
        }

        let key = stage.backend.conditioning_key();
        self.inpainting_conditioning = key.is_inpainting();
        let image_conditioning = match placeholder_conditioning(key, init_latent.dim().0) {
            Some(conditioning) => conditioning,
            None => inpainting_conditioning(
                &mut *stage.backend,
                &source,
                canvas_masks.as_deref(),
                stage.options.inpainting_mask_weight,
            )?,
        };

        self.prepared = Some(PreparedBatch {
            init_latent,
            latent_masks,
            image_conditioning,
        });
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
        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| Error::backend("img2img", "sample called before init"))?;

        let noise = batch_noise(request, batch, stage.options, stage.sampler.needed_noise_slot_count())?;

        let multiplier = request
            .initial_noise_multiplier
            .unwrap_or(stage.options.initial_noise_multiplier);
        if multiplier != 1.0 {
            request
                .extra_generation_params
                .insert("Noise multiplier".to_string(), super::processed::format_float(multiplier));
        }

        let call = SamplerCall {
            steps: request.steps,
            cfg_scale: request.cfg_scale,
            denoising_strength: Some(request.denoising_strength),
            seeds: &batch.seeds,
            subseeds: &batch.subseeds,
            prompts: &batch.prompts,
            sampler_noises: noise.sampler_noises.as_deref(),
        };

        SamplingDriver::new(multiplier).sample(
            &mut *stage.sampler,
            &call,
            &prepared.init_latent,
            noise.noise,
            cond,
            uncond,
            &prepared.image_conditioning,
            prepared.latent_masks.as_ref(),
        )
    }

    fn postprocess_inputs(&self) -> Option<&PostprocessInputs> {
        Some(&self.post)
    }

    fn denoising_strength(&self, request: &GenerationRequest) -> Option<f32> {
        Some(request.denoising_strength)
    }

    fn is_using_inpainting_conditioning(&self) -> bool {
        self.inpainting_conditioning
    }

    fn finish(&mut self) {
        self.post.color_references.clear();
    }
}

fn resize_luma(mode: ResizeMode, mask: &GrayImage, width: u32, height: u32) -> GrayImage {
    resize_image(mode, &DynamicImage::ImageLuma8(mask.clone()), width, height).to_luma8()
}

/// Downsample each canvas mask to the latent grid, round to `{0, 1}`, and broadcast over channels.
fn build_latent_masks(masks: &[GrayImage], init_latent: &LatentTensor) -> Result<LatentMasks> {
    let (b, c, h, w) = init_latent.dim();
    if masks.len() != b {
        return Err(Error::ShapeMismatch {
            expected: format!("{b} masks"),
            actual: format!("{} masks", masks.len()),
        });
    }

    #[allow(clippy::cast_possible_truncation)]
    let small: Vec<GrayImage> = masks
        .iter()
        .map(|mask| imageops::resize(mask, w as u32, h as u32, FilterType::CatmullRom))
        .collect();

    let edit = Array4::from_shape_fn((b, c, h, w), |(i, _, y, x)| {
        #[allow(clippy::cast_possible_truncation)]
        let value = small[i].get_pixel(x as u32, y as u32)[0];
        (f32::from(value) / 255.0).round()
    });
    Ok(LatentMasks::from_edit(edit))
}

/// `[mask, encode(source * (1 - weight * mask))]` along the channel axis.
///
/// Without masks the whole image counts as masked.
fn inpainting_conditioning(
    backend: &mut dyn ModelBackend,
    source: &ImageTensor,
    masks: Option<&[GrayImage]>,
    weight: f32,
) -> Result<ImageConditioning> {
    let (b, _, h, w) = source.dim();

    #[allow(clippy::cast_possible_truncation)]
    let mask = match masks {
        Some(masks) => {
            let fitted: Vec<GrayImage> = masks.iter().map(|m| fit_mask(m, w as u32, h as u32)).collect();
            Array4::from_shape_fn((b, 1, h, w), |(i, _, y, x)| {
                (f32::from(fitted[i].get_pixel(x as u32, y as u32)[0]) / 255.0).round()
            })
        }
        None => Array4::ones((b, 1, h, w)),
    };

    let masked = source * &mask.mapv(|m| 1.0 - weight * m);
    let encoded = backend.encode_first_stage(&masked)?;
    let (_, _, lh, lw) = encoded.dim();

    let small_mask = Array4::from_shape_fn((b, 1, lh, lw), |(i, _, y, x)| mask[[i, 0, y * h / lh, x * w / lw]]);
    let conditioning = concatenate(Axis(1), &[small_mask.view(), encoded.view()]).map_err(|err| Error::ShapeMismatch {
        expected: "mask and latent with matching batch and size".to_string(),
        actual: err.to_string(),
    })?;
    Ok(conditioning.into_dyn())
}

/// Bilinear resample of NCHW latents (half-pixel centres, edge clamped).
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn interpolate_bilinear(input: &LatentTensor, out_h: usize, out_w: usize) -> LatentTensor {
    let (b, c, in_h, in_w) = input.dim();
    if (in_h, in_w) == (out_h, out_w) {
        return input.clone();
    }

    let source_coord = |dst: usize, in_len: usize, out_len: usize| {
        let scale = in_len as f32 / out_len as f32;
        let pos = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
        let lo = (pos.floor() as usize).min(in_len - 1);
        let hi = (lo + 1).min(in_len - 1);
        (lo, hi, pos - lo as f32)
    };

    let mut out = LatentTensor::zeros((b, c, out_h, out_w));
    for y in 0..out_h {
        let (y0, y1, fy) = source_coord(y, in_h, out_h);
        for x in 0..out_w {
            let (x0, x1, fx) = source_coord(x, in_w, out_w);
            let top = &input.slice(s![.., .., y0, x0]) * (1.0 - fx) + &input.slice(s![.., .., y0, x1]) * fx;
            let bottom = &input.slice(s![.., .., y1, x0]) * (1.0 - fx) + &input.slice(s![.., .., y1, x1]) * fx;
            out.slice_mut(s![.., .., y, x]).assign(&(top * (1.0 - fy) + bottom * fy));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ConditioningKey, NoStyles, Sampler};
    use image::Luma;
    use ndarray::{ArrayD, IxDyn};
    use std::sync::Arc;

    /// Encodes by 8x8 average pooling of the first channel; decodes by repetition.
    struct PoolVae {
        key: ConditioningKey,
    }

    impl ModelBackend for PoolVae {
        fn encode_first_stage(&mut self, images: &ImageTensor) -> Result<LatentTensor> {
            let (b, _, h, w) = images.dim();
            Ok(LatentTensor::from_shape_fn((b, 4, h / 8, w / 8), |(i, _, y, x)| {
                images.slice(s![i, 0, y * 8..y * 8 + 8, x * 8..x * 8 + 8]).mean().unwrap_or(0.0)
            }))
        }

        fn decode_first_stage(&mut self, latents: &LatentTensor) -> Result<ImageTensor> {
            let (b, _, h, w) = latents.dim();
            Ok(ImageTensor::from_shape_fn((b, 3, h * 8, w * 8), |(i, _, y, x)| latents[[i, 0, y / 8, x / 8]]))
        }

        fn conditioning_key(&self) -> ConditioningKey {
            self.key
        }
    }

    struct NoiseOut;

    impl Sampler for NoiseOut {
        fn name(&self) -> &str {
            "noise-out"
        }

        fn sample(
            &mut self,
            _call: &SamplerCall<'_>,
            noise: &LatentTensor,
            _cond: &Embedding,
            _uncond: &Embedding,
            _image_conditioning: &ImageConditioning,
        ) -> Result<LatentTensor> {
            Ok(noise.clone())
        }

        fn sample_img2img(
            &mut self,
            _call: &SamplerCall<'_>,
            _init_latent: &LatentTensor,
            noise: &LatentTensor,
            _cond: &Embedding,
            _uncond: &Embedding,
            _image_conditioning: &ImageConditioning,
        ) -> Result<LatentTensor> {
            Ok(noise.clone())
        }
    }

    fn square_mask(size: u32, lo: u32, hi: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if (lo..hi).contains(&x) && (lo..hi).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    fn request(masks: Vec<GrayImage>) -> GenerationRequest {
        let source = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([200, 100, 50])));
        GenerationRequest {
            prompt: "a cat".into(),
            seed: 1,
            width: 64,
            height: 64,
            mask_blur: 0,
            inpaint_full_res: false,
            ..GenerationRequest::default()
        }
        .with_init_images(vec![source], masks)
    }

    fn run_init(img2img: &mut Img2Img, request: &GenerationRequest, key: ConditioningKey) {
        let options = Options::default();
        let plan = SeedPlan::resolve(request, &NoStyles).unwrap();
        let mut vae = PoolVae { key };
        let mut sampler = NoiseOut;
        let mut stage = Stage {
            options: &options,
            backend: &mut vae,
            sampler: &mut sampler,
        };
        img2img.init(request, &plan, &mut stage).unwrap();
    }

    #[test]
    fn test_init_without_masks() {
        let request = request(Vec::new());
        let mut img2img = Img2Img::new();
        run_init(&mut img2img, &request, ConditioningKey::CrossAttn);

        let prepared = img2img.prepared().unwrap();
        assert_eq!(prepared.init_latent.dim(), (1, 4, 8, 8));
        assert!(prepared.latent_masks.is_none());
        assert_eq!(prepared.image_conditioning.shape(), &[1, 5, 1, 1]);
        assert!(img2img.postprocess_inputs().unwrap().overlay(0).is_none());
    }

    #[test]
    fn test_latent_masks_follow_mask() {
        let request = request(vec![square_mask(64, 32, 64)]);
        let mut img2img = Img2Img::new();
        run_init(&mut img2img, &request, ConditioningKey::CrossAttn);

        let masks = img2img.prepared().unwrap().latent_masks.as_ref().unwrap();
        assert_eq!(masks.edit.dim(), (1, 4, 8, 8));
        assert_eq!(masks.edit[[0, 3, 6, 6]], 1.0);
        assert_eq!(masks.edit[[0, 0, 1, 1]], 0.0);
        assert_eq!(masks.keep[[0, 0, 1, 1]], 1.0);

        let post = img2img.postprocess_inputs().unwrap();
        assert_eq!(post.overlay(0).unwrap().get_pixel(1, 1)[3], 255);
        assert_eq!(post.overlay(0).unwrap().get_pixel(60, 60)[3], 0);
        assert_eq!(post.paste_region(0), None);
    }

    #[test]
    fn test_latent_nothing_zeroes_masked_latent() {
        let mut request = request(vec![square_mask(64, 32, 64)]);
        request.inpainting_fill = InpaintingFill::LatentNothing;
        let mut img2img = Img2Img::new();
        run_init(&mut img2img, &request, ConditioningKey::CrossAttn);

        let latent = &img2img.prepared().unwrap().init_latent;
        assert_eq!(latent[[0, 0, 6, 6]], 0.0);
        assert!(latent[[0, 0, 1, 1]] != 0.0);
    }

    #[test]
    fn test_full_res_records_paste_region() {
        let mut request = request(vec![square_mask(64, 40, 48)]);
        request.inpaint_full_res = true;
        request.inpaint_full_res_padding = 4;
        let mut img2img = Img2Img::new();
        run_init(&mut img2img, &request, ConditioningKey::CrossAttn);

        let region = img2img.postprocess_inputs().unwrap().paste_region(0).unwrap();
        assert_eq!(region, CropRegion { x1: 36, y1: 36, x2: 52, y2: 52 });
        assert_eq!(img2img.prepared().unwrap().init_latent.dim(), (1, 4, 8, 8));
    }

    #[test]
    fn test_inpainting_model_conditioning() {
        let request = request(vec![square_mask(64, 32, 64)]);
        let mut img2img = Img2Img::new();
        run_init(&mut img2img, &request, ConditioningKey::Hybrid);

        assert!(img2img.is_using_inpainting_conditioning());
        let conditioning = &img2img.prepared().unwrap().image_conditioning;
        assert_eq!(conditioning.shape(), &[1, 5, 8, 8]);
        assert_eq!(conditioning[[0, 0, 6, 6]], 1.0);
        assert_eq!(conditioning[[0, 0, 1, 1]], 0.0);
        assert_eq!(conditioning[[0, 1, 6, 6]], 0.0);
    }

    #[test]
    fn test_sample_recomposites_and_records_multiplier() {
        let mut request = request(vec![square_mask(64, 32, 64)]);
        request.initial_noise_multiplier = Some(0.5);
        let mut img2img = Img2Img::new();
        run_init(&mut img2img, &request, ConditioningKey::CrossAttn);

        let options = Options::default();
        let plan = SeedPlan::resolve(&request, &NoStyles).unwrap();
        let batch = BatchSlice::new(&plan, 0, 1);
        let mut vae = PoolVae {
            key: ConditioningKey::CrossAttn,
        };
        let mut sampler = NoiseOut;
        let mut stage = Stage {
            options: &options,
            backend: &mut vae,
            sampler: &mut sampler,
        };
        let embedding: Embedding = Arc::new(ArrayD::zeros(IxDyn(&[1, 1])));

        let samples = img2img.sample(&mut request, &batch, &embedding, &embedding, &mut stage).unwrap();
        let init = &img2img.prepared().unwrap().init_latent;
        assert_eq!(samples[[0, 0, 1, 1]], init[[0, 0, 1, 1]]);
        assert_eq!(request.extra_generation_params["Noise multiplier"], "0.5");
    }

    #[test]
    fn test_interpolate_bilinear_constant() {
        let input = LatentTensor::from_elem((1, 4, 4, 4), 2.0);
        let out = interpolate_bilinear(&input, 8, 6);
        assert_eq!(out.dim(), (1, 4, 8, 6));
        assert!(out.iter().all(|&v| (v - 2.0).abs() < 1e-6));
    }
}
