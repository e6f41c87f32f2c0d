//! Image loading, resizing, compositing, and saving utilities.

mod color;
mod grid;
mod load;
mod overlay;
mod resize;
mod save;

pub use color::{apply_color_correction, ColorReference};
pub use grid::image_grid;
pub use load::{flatten, image_to_tensor, images_to_tensor, load_image};
pub(crate) use overlay::{alpha_composite, fit_mask};
pub use overlay::{apply_overlay, mask_composite, masked_overlay};
pub use resize::{resize_image, ResizeMode};
pub use save::{denormalize, save_image, tensor_to_images, DiskSink};

use ndarray::Array4;

/// Image tensor in NCHW format (batch, channels, height, width).
/// Values are normalized to [-1, 1] range for diffusion model compatibility.
pub type ImageTensor = Array4<f32>;

/// Number of channels in RGB images.
pub const RGB_CHANNELS: usize = 3;

/// Number of channels in a latent produced by the first-stage encoder.
pub const LATENT_CHANNELS: usize = 4;

/// Spatial downscale factor between pixel and latent space.
pub const LATENT_FACTOR: u32 = 8;
