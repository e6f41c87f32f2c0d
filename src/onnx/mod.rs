//! Stable Diffusion collaborators running on ONNX Runtime.

mod loader;
mod unet;
mod vae;

pub use loader::{ModelDir, ModelFile};
pub use unet::{DdimSchedule, OnnxUnetSampler, UnconditionalConditioner, HIDDEN, TOKENS};
pub use vae::{OnnxVae, VAE_SCALE};
