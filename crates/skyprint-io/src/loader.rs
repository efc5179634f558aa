//! [`ImageLoader`] for raster files on disk.
//!
//! Decoding goes through the `image` crate, so PNG, JPEG, TIFF, BMP and
//! WebP are supported. FITS files are recognised by extension and
//! rejected with a clear reason rather than a decoder error.

use std::collections::BTreeMap;
use std::path::Path;

use image::{DynamicImage, ImageFormat};
use ndarray::Array3;
use skyprint_pipeline::{ImageData, ImageLoader, ImageProvenance, PipelineError};

use crate::error::IoError;

/// Loads raster images from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileImageLoader;

impl FileImageLoader {
    pub const SUPPORTED_EXTENSIONS: &'static [&'static str] = &["png", "jpg", "jpeg", "tif", "tiff", "bmp", "webp"];
    pub const FITS_EXTENSIONS: &'static [&'static str] = &["fits", "fit", "fts"];

    /// Decode `path` into pixels plus provenance.
    ///
    /// Pixel values are on the 0-255 scale regardless of the file's bit
    /// depth. Images without colour come back single-channel.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Unsupported`] for FITS or unknown extensions and
    /// [`IoError::Decode`] when the file cannot be read or decoded.
    pub fn read(&self, path: &Path) -> Result<(ImageData, ImageProvenance), IoError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if Self::FITS_EXTENSIONS.contains(&extension.as_str()) {
            return Err(IoError::Unsupported {
                path: path.to_path_buf(),
                reason: "FITS decoding is not available".to_string(),
            });
        }
        if !Self::SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(IoError::Unsupported {
                path: path.to_path_buf(),
                reason: format!("extension {extension:?} is not a supported raster format"),
            });
        }

        let decoded = image::open(path)?;
        let pixels = image_data(&decoded)?;

        let mut meta = BTreeMap::new();
        if let Ok(format) = ImageFormat::from_path(path) {
            meta.insert("format".to_string(), format!("{format:?}"));
        }
        meta.insert("color".to_string(), format!("{:?}", decoded.color()));
        meta.insert("width".to_string(), decoded.width().to_string());
        meta.insert("height".to_string(), decoded.height().to_string());

        tracing::debug!(path = %path.display(), shape = ?pixels.shape(), "image decoded");
        Ok((
            pixels,
            ImageProvenance {
                filename: path.display().to_string(),
                radec: None,
                meta,
            },
        ))
    }
}

impl ImageLoader for FileImageLoader {
    fn load(&self, path: &str) -> Result<(ImageData, ImageProvenance), PipelineError> {
        self.read(Path::new(path))
            .map_err(|e| PipelineError::SourceUnavailable {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Convert a decoded image to `(rows, cols, channels)` pixels on the
/// 0-255 scale. Alpha is dropped.
///
/// # Errors
///
/// Returns [`IoError::Pipeline`] if the image has an empty axis.
pub fn image_data(image: &DynamicImage) -> Result<ImageData, IoError> {
    let rows = image.height() as usize;
    let cols = image.width() as usize;
    let (channels, raw) = if image.color().has_color() {
        (3, image.to_rgb32f().into_raw())
    } else {
        (1, image.to_luma32f().into_raw())
    };
    let pixels = Array3::from_shape_vec((rows, cols, channels), raw)
        .map_err(|e| PipelineError::Shape {
            shape: vec![rows, cols, channels],
            reason: e.to_string(),
        })?
        .mapv(|v| v * 255.0);
    Ok(ImageData::new(pixels)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use image::{GrayImage, Luma, Rgb, RgbImage};

    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("skyprint-loader-{}-{name}", std::process::id()))
    }

    #[test]
    fn grayscale_png_is_single_channel() {
        let path = scratch("gray.png");
        GrayImage::from_fn(6, 4, |x, _| Luma([u8::try_from(x * 50).unwrap()]))
            .save(&path)
            .unwrap();

        let (pixels, provenance) = FileImageLoader.read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(pixels.shape(), [4, 6, 1]);
        assert!((pixels.view()[[0, 5, 0]] - 250.0).abs() < 1e-3);
        assert!(pixels.view()[[3, 0, 0]].abs() < 1e-6);
        assert_eq!(provenance.meta["format"], "Png");
        assert_eq!(provenance.meta["width"], "6");
        assert!(provenance.radec.is_none());
    }

    #[test]
    fn rgb_png_keeps_three_channels() {
        let path = scratch("rgb.png");
        RgbImage::from_pixel(3, 5, Rgb([10, 20, 30])).save(&path).unwrap();

        let (pixels, _) = FileImageLoader.read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(pixels.shape(), [5, 3, 3]);
        assert!((pixels.view()[[2, 1, 2]] - 30.0).abs() < 1e-3);
    }

    #[test]
    fn fits_is_reported_as_unavailable() {
        let err = FileImageLoader.load("survey/m31.fits").unwrap_err();
        assert!(
            matches!(err, PipelineError::SourceUnavailable { ref path, ref reason }
                if path == "survey/m31.fits" && reason.contains("FITS"))
        );
    }

    #[test]
    fn unknown_extension_is_rejected_before_reading() {
        let err = FileImageLoader.read(Path::new("notes.txt")).unwrap_err();
        assert!(matches!(err, IoError::Unsupported { .. }));
    }

    #[test]
    fn missing_file_is_unavailable() {
        let err = FileImageLoader.load("/nonexistent/skyprint/missing.png").unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    }
}
