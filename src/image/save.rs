//! Image saving utilities.

use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageBuffer, Rgb, RgbImage};

use crate::error::{Error, Result};
use crate::pipeline::{ImageSink, OutputKind, SaveRequest};

use super::ImageTensor;

/// Save an image to disk.
///
/// The format is inferred from the extension; JPEG output uses `quality`
/// (1-100) and drops any alpha channel.
///
/// # Errors
///
/// Returns an error if the image cannot be saved.
pub fn save_image<P: AsRef<Path>>(img: &DynamicImage, path: P, quality: u8) -> Result<()> {
    let path = path.as_ref();

    // Determine format and save
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png")
        .to_lowercase();

    match extension.as_str() {
        "jpg" | "jpeg" => {
            let mut output = fs::File::create(path)?;
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, quality);
            DynamicImage::ImageRgb8(img.to_rgb8())
                .write_with_encoder(encoder)
                .map_err(|source| Error::ImageSave {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        _ => {
            img.save(path).map_err(|source| Error::ImageSave {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    Ok(())
}

/// Convert a normalized NCHW tensor to one RGB image per batch entry.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn tensor_to_images(tensor: &ImageTensor) -> Vec<RgbImage> {
    let (batch, _, height, width) = tensor.dim();

    (0..batch)
        .map(|i| {
            ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
                let (x, y) = (x as usize, y as usize);
                Rgb([
                    denormalize(tensor[[i, 0, y, x]]),
                    denormalize(tensor[[i, 1, y, x]]),
                    denormalize(tensor[[i, 2, y, x]]),
                ])
            })
        })
        .collect()
}

/// Denormalize a value from [-1, 1] to [0, 255] with clamping.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn denormalize(value: f32) -> u8 {
    // Safe: clamped to [0, 255] range before casting
    let scaled = (value + 1.0) * 127.5;
    scaled.clamp(0.0, 255.0) as u8
}

/// Writes samples and grids into output directories.
///
/// Files are named `<counter>-<seed><suffix>.<ext>` for samples and
/// `grid-<counter>.<ext>` for grids. `params.txt` lands in `data_dir`.
#[derive(Debug, Clone)]
pub struct DiskSink {
    samples_dir: PathBuf,
    grids_dir: PathBuf,
    data_dir: PathBuf,
    quality: u8,
    write_infotext: bool,
    counter: usize,
}

impl DiskSink {
    /// Create a sink writing everything under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the output directories cannot be created.
    pub fn new<P: AsRef<Path>>(root: P, quality: u8) -> Result<Self> {
        let root = root.as_ref();
        let samples_dir = root.join("samples");
        let grids_dir = root.join("grids");
        fs::create_dir_all(&samples_dir)?;
        fs::create_dir_all(&grids_dir)?;

        Ok(Self {
            samples_dir,
            grids_dir,
            data_dir: root.to_path_buf(),
            quality,
            write_infotext: false,
            counter: 0,
        })
    }

    /// Also write each image's infotext next to it as a `.txt` file.
    #[must_use]
    pub const fn with_infotext_files(mut self, enabled: bool) -> Self {
        self.write_infotext = enabled;
        self
    }

    fn next_path(&mut self, request: &SaveRequest<'_>) -> PathBuf {
        let index = self.counter;
        self.counter += 1;
        let suffix = request.suffix.unwrap_or("");

        match request.kind {
            OutputKind::Sample => self
                .samples_dir
                .join(format!("{index:05}-{}{suffix}.{}", request.seed, request.format)),
            OutputKind::Grid => self.grids_dir.join(format!("grid-{index:04}.{}", request.format)),
        }
    }
}

impl ImageSink for DiskSink {
    fn save(&mut self, image: &DynamicImage, request: &SaveRequest<'_>) -> Result<()> {
        let path = self.next_path(request);
        tracing::debug!("Saving {}", path.display());

        save_image(image, &path, self.quality)?;
        if self.write_infotext {
            fs::write(path.with_extension("txt"), request.info)?;
        }
        Ok(())
    }

    fn write_params(&mut self, infotext: &str) -> Result<()> {
        fs::write(self.data_dir.join("params.txt"), infotext)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denormalize() {
        assert_eq!(denormalize(-1.0), 0);
        assert_eq!(denormalize(0.0), 127);
        assert_eq!(denormalize(1.0), 255);
    }

    #[test]
    fn test_denormalize_clamp() {
        assert_eq!(denormalize(-2.0), 0);
        assert_eq!(denormalize(2.0), 255);
    }

    #[test]
    fn test_tensor_to_images() {
        let mut tensor = ImageTensor::from_elem((2, 3, 4, 6), -1.0);
        tensor[[1, 0, 3, 5]] = 1.0;

        let images = tensor_to_images(&tensor);
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].dimensions(), (6, 4));
        assert_eq!(*images[1].get_pixel(5, 3), Rgb([255, 0, 0]));
    }

    #[test]
    fn test_disk_sink_writes_files() {
        let root = std::env::temp_dir().join(format!("latentbatch-sink-{}", std::process::id()));
        let mut sink = DiskSink::new(&root, 90).unwrap().with_infotext_files(true);

        let image = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        let request = SaveRequest {
            kind: OutputKind::Sample,
            seed: 42,
            prompt: "a cat",
            info: "a cat\nSteps: 20",
            suffix: Some("-mask"),
            format: "png",
        };
        sink.save(&image, &request).unwrap();
        sink.write_params("a cat\nSteps: 20").unwrap();

        assert!(root.join("samples/00000-42-mask.png").exists());
        assert_eq!(
            fs::read_to_string(root.join("samples/00000-42-mask.txt")).unwrap(),
            "a cat\nSteps: 20"
        );
        assert!(root.join("params.txt").exists());

        fs::remove_dir_all(&root).unwrap();
    }
}
