//! # latentbatch
//!
//! Batch img2img and inpainting orchestration for latent diffusion models.
//!
//! The crate owns everything around the sampler: seed-deterministic noise,
//! mask preparation and cropping, latent recomposition, conditioning
//! caching, per-request option overrides, post-processing (color
//! correction, overlays, grids) and the infotext record of each run.
//! Models, samplers and text encoders are plugged in through the traits in
//! [`pipeline`]; the `onnx` feature provides ONNX Runtime implementations.
//!
//! ## Example
//!
//! ```no_run
//! use latentbatch::image::load_image;
//! use latentbatch::pipeline::{
//!     process_images, Collaborators, Conditioner, GenerationRequest, Img2Img, JobState, ModelBackend, NoScripts,
//!     NoStyles, NullSink, Sampler,
//! };
//! use latentbatch::Options;
//!
//! fn repaint(
//!     backend: &mut dyn ModelBackend,
//!     sampler: &mut dyn Sampler,
//!     conditioner: &dyn Conditioner,
//! ) -> latentbatch::Result<()> {
//!     let init = load_image("photo.png")?;
//!     let mut request = GenerationRequest::default().with_init_images(vec![init], Vec::new());
//!     request.denoising_strength = 0.4;
//!
//!     let mut options = Options::default();
//!     let state = JobState::new();
//!     let processed = process_images(
//!         &mut request,
//!         &mut Img2Img::new(),
//!         &mut options,
//!         Collaborators {
//!             backend,
//!             sampler,
//!             conditioner,
//!             face_restorer: None,
//!             styles: &NoStyles,
//!             sink: &mut NullSink,
//!             scripts: &mut NoScripts,
//!             state: &state,
//!         },
//!     )?;
//!     println!("{}", processed.info);
//!     Ok(())
//! }
//! ```
//!
//! With the `onnx` feature, [`onnx::OnnxVae`], [`onnx::OnnxUnetSampler`] and
//! [`onnx::UnconditionalConditioner`] fill these roles.

pub mod error;
pub mod image;
pub mod masking;
pub mod noise;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod options;
pub mod pipeline;

pub use error::{Error, Result};
pub use options::{Options, OverrideScope};
pub use pipeline::{process_images, GenerationRequest, Img2Img, Processed, Txt2Img};
