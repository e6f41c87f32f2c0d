//! Locating and opening ONNX model files.

use std::fs;
use std::path::{Path, PathBuf};

use ort::session::Session;

use crate::error::{Error, Result};

/// Models making up one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFile {
    /// VAE Encoder - encodes images to latent space.
    VaeEncoder,
    /// VAE Decoder - decodes latents to images.
    VaeDecoder,
    /// `UNet` - predicts noise for the sampler.
    Unet,
}

impl ModelFile {
    /// Get the filename for this model.
    #[must_use]
    pub const fn filename(&self) -> &'static str {
        match self {
            Self::VaeEncoder => "vae_encoder.onnx",
            Self::VaeDecoder => "vae_decoder.onnx",
            Self::Unet => "unet.onnx",
        }
    }
}

/// A directory of exported models.
///
/// Files for the default checkpoint sit directly in the root; named
/// checkpoints live in subdirectories with the same file names.
#[derive(Debug, Clone)]
pub struct ModelDir {
    root: PathBuf,
}

impl ModelDir {
    /// Use `root` as the model directory.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// The platform cache location:
    /// - Windows: `%LOCALAPPDATA%\latentbatch\models`
    /// - Linux: `~/.cache/latentbatch/models`
    /// - macOS: `~/Library/Caches/latentbatch/models`
    #[must_use]
    pub fn default_location() -> Self {
        let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("latentbatch").join("models"))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the files of `checkpoint`, or the root for `None`.
    #[must_use]
    pub fn checkpoint_dir(&self, checkpoint: Option<&str>) -> PathBuf {
        checkpoint.map_or_else(|| self.root.clone(), |name| self.root.join(name))
    }

    /// Whether `checkpoint` has both VAE halves on disk.
    #[must_use]
    pub fn has_checkpoint(&self, checkpoint: &str) -> bool {
        let dir = self.checkpoint_dir(Some(checkpoint));
        [ModelFile::VaeEncoder, ModelFile::VaeDecoder]
            .iter()
            .all(|model| dir.join(model.filename()).is_file())
    }

    /// Names of the checkpoint subdirectories, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be read.
    pub fn checkpoints(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if self.has_checkpoint(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Path of `model` within `checkpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist.
    pub fn model_path(&self, checkpoint: Option<&str>, model: ModelFile) -> Result<PathBuf> {
        let path = self.checkpoint_dir(checkpoint).join(model.filename());
        if !path.is_file() {
            return Err(Error::invalid(
                "model_dir",
                format!("{} not found", path.display()),
            ));
        }
        Ok(path)
    }

    /// Open an ONNX session for `model`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be loaded.
    pub fn load_session(&self, checkpoint: Option<&str>, model: ModelFile) -> Result<Session> {
        let path = self.model_path(checkpoint, model)?;
        tracing::info!("Loading {}", path.display());

        Session::builder()
            .map_err(|source| Error::ModelLoad {
                name: model.filename().to_string(),
                source,
            })?
            .commit_from_file(&path)
            .map_err(|source| Error::ModelLoad {
                name: model.filename().to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("latentbatch-models-{name}-{}", std::process::id()))
    }

    #[test]
    fn test_filenames() {
        assert_eq!(ModelFile::VaeEncoder.filename(), "vae_encoder.onnx");
        assert_eq!(ModelFile::VaeDecoder.filename(), "vae_decoder.onnx");
        assert_eq!(ModelFile::Unet.filename(), "unet.onnx");
    }

    #[test]
    fn test_checkpoint_discovery() {
        let root = scratch("discover");
        let full = root.join("anime");
        let partial = root.join("broken");
        fs::create_dir_all(&full).unwrap();
        fs::create_dir_all(&partial).unwrap();
        fs::write(full.join("vae_encoder.onnx"), b"").unwrap();
        fs::write(full.join("vae_decoder.onnx"), b"").unwrap();
        fs::write(partial.join("vae_encoder.onnx"), b"").unwrap();

        let models = ModelDir::new(&root);
        assert!(models.has_checkpoint("anime"));
        assert!(!models.has_checkpoint("broken"));
        assert_eq!(models.checkpoints().unwrap(), vec!["anime".to_string()]);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_missing_model_path() {
        let models = ModelDir::new(scratch("missing"));
        let err = models.model_path(None, ModelFile::Unet).unwrap_err();
        assert!(err.to_string().contains("unet.onnx"));
    }
}
