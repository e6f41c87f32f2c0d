//! `latentbatch` CLI - batch img2img and inpainting with ONNX models.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use latentbatch::image::{load_image, DiskSink, LATENT_FACTOR};
use latentbatch::onnx::{ModelDir, OnnxUnetSampler, OnnxVae, UnconditionalConditioner};
use latentbatch::pipeline::{Collaborators, JobState, NoScripts, PromptStyles};
use latentbatch::{process_images, GenerationRequest, Img2Img, Options};

/// Run img2img (or inpainting, with masks) over a batch of images.
#[derive(Parser, Debug)]
#[command(name = "latentbatch")]
#[command(version, about, long_about = None)]
struct Args {
    /// Input image paths; all of them form one batch.
    #[arg(value_name = "INPUT", required = true)]
    inputs: Vec<PathBuf>,

    /// Directory receiving samples, grids and params.txt.
    #[arg(short, long, value_name = "DIR")]
    out_dir: PathBuf,

    /// Mask image (white = repaint). Repeat per input; the last one is reused.
    #[arg(short, long, value_name = "PATH")]
    mask: Vec<PathBuf>,

    /// Directory holding vae_encoder.onnx, vae_decoder.onnx and unet.onnx.
    #[arg(long, value_name = "DIR")]
    models: Option<PathBuf>,

    /// Prompt recorded in the infotext.
    #[arg(short, long, default_value = "")]
    prompt: String,

    /// Negative prompt recorded in the infotext.
    #[arg(long, default_value = "")]
    negative_prompt: String,

    /// Style name to apply to the prompts; repeatable.
    #[arg(long, value_name = "NAME")]
    style: Vec<String>,

    /// JSON file of prompt styles (`name -> {prompt, negative_prompt}`).
    #[arg(long, value_name = "FILE")]
    styles_file: Option<PathBuf>,

    /// Base seed; -1 picks a random one.
    #[arg(long, default_value = "-1", value_name = "INT", allow_negative_numbers = true)]
    seed: i64,

    /// Number of batches to run.
    #[arg(short = 'n', long, default_value = "1", value_name = "INT")]
    iterations: usize,

    /// Denoising strength (0.0-1.0).
    #[arg(short, long, default_value = "0.75", value_name = "FLOAT")]
    strength: f32,

    /// Number of denoising steps.
    #[arg(long, default_value = "20", value_name = "INT")]
    steps: u32,

    /// Classifier-free guidance scale.
    #[arg(long, default_value = "7.0", value_name = "FLOAT")]
    cfg_scale: f32,

    /// Canvas width; defaults to the first input's width rounded down to a multiple of 8.
    #[arg(long, value_name = "INT")]
    width: Option<u32>,

    /// Canvas height; defaults to the first input's height rounded down to a multiple of 8.
    #[arg(long, value_name = "INT")]
    height: Option<u32>,

    /// Mask blur radius in pixels.
    #[arg(long, default_value = "4", value_name = "INT")]
    mask_blur: u32,

    /// Inpaint only the masked region at full resolution.
    #[arg(long)]
    inpaint_full_res: bool,

    /// Padding around the masked region for --inpaint-full-res.
    #[arg(long, default_value = "32", value_name = "INT")]
    padding: u32,

    /// JSON file with option values.
    #[arg(long, value_name = "FILE")]
    options: Option<PathBuf>,

    /// Output JPEG quality (1-100).
    #[arg(short, long, default_value = "95", value_name = "INT")]
    quality: u8,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("latentbatch={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run(&args) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(args: &Args) -> Result<()> {
    let mut options = match &args.options {
        Some(path) => Options::from_json_file(path)
            .with_context(|| format!("Failed to read options from {}", path.display()))?,
        None => Options::default(),
    };

    let images = args
        .inputs
        .iter()
        .map(|path| load_image(path).with_context(|| format!("Failed to load {}", path.display())))
        .collect::<Result<Vec<_>>>()?;
    let masks = args
        .mask
        .iter()
        .map(|path| {
            load_image(path)
                .map(|mask| mask.to_luma8())
                .with_context(|| format!("Failed to load mask {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let (first_width, first_height) = (images[0].width(), images[0].height());
    let mut request = GenerationRequest {
        prompt: args.prompt.clone().into(),
        negative_prompt: args.negative_prompt.clone().into(),
        styles: args.style.clone(),
        seed: args.seed,
        n_iter: args.iterations,
        denoising_strength: args.strength,
        steps: args.steps,
        cfg_scale: args.cfg_scale,
        width: args.width.unwrap_or_else(|| canvas_size(first_width)),
        height: args.height.unwrap_or_else(|| canvas_size(first_height)),
        mask_blur: args.mask_blur,
        inpaint_full_res: args.inpaint_full_res,
        inpaint_full_res_padding: args.padding,
        ..GenerationRequest::default()
    }
    .with_init_images(images, masks);

    let styles = match &args.styles_file {
        Some(path) => PromptStyles::from_json_file(path)
            .with_context(|| format!("Failed to read styles from {}", path.display()))?,
        None => PromptStyles::default(),
    };

    let models = args
        .models
        .clone()
        .map_or_else(ModelDir::default_location, ModelDir::new);
    tracing::info!("Loading models from {}", models.root().display());

    let checkpoint = options.sd_model_checkpoint.clone();
    let mut backend =
        OnnxVae::open(models.clone(), checkpoint.as_deref()).context("Failed to load VAE")?;
    let mut sampler =
        OnnxUnetSampler::open(&models, checkpoint.as_deref()).context("Failed to load UNet")?;
    let mut sink = DiskSink::new(&args.out_dir, args.quality)
        .context("Failed to create output directory")?
        .with_infotext_files(true);
    let mut scripts = NoScripts;
    let state = JobState::new();

    let processed = process_images(
        &mut request,
        &mut Img2Img::new(),
        &mut options,
        Collaborators {
            backend: &mut backend,
            sampler: &mut sampler,
            conditioner: &UnconditionalConditioner,
            face_restorer: None,
            styles: &styles,
            sink: &mut sink,
            scripts: &mut scripts,
            state: &state,
        },
    )
    .context("Failed to process images")?;

    println!(
        "Generated {} image(s) into {}",
        processed.images.len(),
        args.out_dir.display()
    );
    println!("{}", processed.info);

    Ok(())
}

/// Largest multiple of the latent factor not above `size`.
fn canvas_size(size: u32) -> u32 {
    (size / LATENT_FACTOR).max(1) * LATENT_FACTOR
}
