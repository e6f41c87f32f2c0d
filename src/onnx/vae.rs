//! Variational Autoencoder backed by ONNX sessions.

use ndarray::{concatenate, s, Array4, ArrayD, Axis, Ix4, IxDyn};
use ort::session::Session;
use ort::value::Tensor;

use crate::error::{Error, Result};
use crate::image::ImageTensor;
use crate::pipeline::{LatentTensor, ModelBackend};

use super::loader::{ModelDir, ModelFile};

/// VAE scaling factor (from Stable Diffusion).
pub const VAE_SCALE: f32 = 0.18215;

/// First-stage model: encoder and decoder sessions of one checkpoint.
///
/// Batches are run one image at a time, so exports with a fixed batch
/// dimension of 1 work.
pub struct OnnxVae {
    models: ModelDir,
    checkpoint: Option<String>,
    vae: Option<String>,
    encoder: Session,
    decoder: Session,
}

impl OnnxVae {
    /// Open the VAE of `checkpoint` (the root files for `None`).
    ///
    /// # Errors
    ///
    /// Returns an error if either session cannot be loaded.
    pub fn open(models: ModelDir, checkpoint: Option<&str>) -> Result<Self> {
        let encoder = models.load_session(checkpoint, ModelFile::VaeEncoder)?;
        let decoder = models.load_session(checkpoint, ModelFile::VaeDecoder)?;

        Ok(Self {
            models,
            checkpoint: checkpoint.map(str::to_string),
            vae: None,
            encoder,
            decoder,
        })
    }

    #[must_use]
    pub fn models(&self) -> &ModelDir {
        &self.models
    }
}

impl ModelBackend for OnnxVae {
    fn encode_first_stage(&mut self, images: &ImageTensor) -> Result<LatentTensor> {
        let latents = run_per_image(&mut self.encoder, images, "vae encoder")?;
        Ok(latents * VAE_SCALE)
    }

    fn decode_first_stage(&mut self, latents: &LatentTensor) -> Result<ImageTensor> {
        let unscaled = latents / VAE_SCALE;
        run_per_image(&mut self.decoder, &unscaled, "vae decoder")
    }

    fn model_name(&self) -> Option<String> {
        self.checkpoint.clone()
    }

    fn has_checkpoint(&self, name: &str) -> bool {
        self.models.has_checkpoint(name)
    }

    fn reload_weights(&mut self, checkpoint: Option<&str>) -> Result<()> {
        if checkpoint == self.checkpoint.as_deref() {
            return Ok(());
        }
        tracing::info!("Switching checkpoint to {}", checkpoint.unwrap_or("<default>"));
        let reloaded = Self::open(self.models.clone(), checkpoint)?;
        self.encoder = reloaded.encoder;
        self.decoder = reloaded.decoder;
        self.checkpoint = reloaded.checkpoint;
        self.vae = None;
        Ok(())
    }

    fn reload_vae(&mut self, vae: Option<&str>) -> Result<()> {
        if vae == self.vae.as_deref() {
            return Ok(());
        }
        let source = vae.or(self.checkpoint.as_deref());
        self.encoder = self.models.load_session(source, ModelFile::VaeEncoder)?;
        self.decoder = self.models.load_session(source, ModelFile::VaeDecoder)?;
        self.vae = vae.map(str::to_string);
        Ok(())
    }
}

fn run_per_image(session: &mut Session, input: &Array4<f32>, stage: &str) -> Result<Array4<f32>> {
    let mut outputs = Vec::with_capacity(input.dim().0);
    for i in 0..input.dim().0 {
        let single = input.slice(s![i..=i, .., .., ..]).to_owned();
        outputs.push(run_single(session, single, stage)?);
    }

    let views: Vec<_> = outputs.iter().map(Array4::view).collect();
    concatenate(Axis(0), &views).map_err(|_| Error::ShapeMismatch {
        expected: format!("{} equally shaped {stage} outputs", views.len()),
        actual: "mismatched shapes".to_string(),
    })
}

fn run_single(session: &mut Session, input: Array4<f32>, stage: &str) -> Result<Array4<f32>> {
    let input_value = Tensor::from_array(input).map_err(|source| Error::Inference { source })?;

    let outputs = session
        .run(ort::inputs![input_value])
        .map_err(|source| Error::Inference { source })?;

    let output = outputs
        .values()
        .next()
        .ok_or_else(|| Error::ShapeMismatch {
            expected: format!("{stage} output"),
            actual: "no output".to_string(),
        })?;

    output_array4(stage, &output)
}

/// First output of a `stage` session as an `(n, c, h, w)` tensor.
pub(crate) fn output_array4(stage: &str, value: &ort::value::ValueRef<'_>) -> Result<Array4<f32>> {
    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|source| Error::Inference { source })?;
    reshape_output(stage, shape, data.to_vec())
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn reshape_output(stage: &str, shape: &[i64], data: Vec<f32>) -> Result<Array4<f32>> {
    if shape.len() != 4 || shape.iter().any(|&d| d < 0) {
        return Err(Error::ShapeMismatch {
            expected: format!("{stage} output of rank 4"),
            actual: format!("{shape:?}"),
        });
    }

    let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
    ArrayD::from_shape_vec(IxDyn(&dims), data)
        .and_then(|array| array.into_dimensionality::<Ix4>())
        .map_err(|err| Error::ShapeMismatch {
            expected: format!("{stage} output {dims:?}"),
            actual: err.to_string(),
        })
}
