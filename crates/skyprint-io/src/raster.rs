//! PNG encoding of processed pixels for inspecting cutouts.
//!
//! Pixel values are stretched linearly from the tile's own min/max onto
//! 0-255, so faint sources stay visible.

use std::fs;
use std::path::Path;

use image::{ExtendedColorType, ImageEncoder};
use skyprint_pipeline::{ImageData, PipelineError};

use crate::error::IoError;

/// Encode a 1- or 3-channel tile as PNG bytes.
///
/// # Errors
///
/// Returns [`IoError::Pipeline`] for other channel counts and
/// [`IoError::Decode`] if PNG encoding fails.
pub fn encode_png(tile: &ImageData) -> Result<Vec<u8>, IoError> {
    let color = match tile.channels() {
        1 => ExtendedColorType::L8,
        3 => ExtendedColorType::Rgb8,
        _ => {
            return Err(PipelineError::Shape {
                shape: tile.shape().to_vec(),
                reason: "PNG export needs 1 or 3 channels".to_string(),
            }
            .into());
        }
    };

    let (lo, hi) = tile
        .pixels()
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let span = hi - lo;
    let bytes: Vec<u8> = tile
        .pixels()
        .iter()
        .map(|&v| to_byte(if span > 0.0 { (v - lo) / span } else { 0.0 }))
        .collect();

    let width = u32::try_from(tile.cols()).map_err(|e| shape_error(tile, &e))?;
    let height = u32::try_from(tile.rows()).map_err(|e| shape_error(tile, &e))?;

    let mut png = Vec::new();
    image::codecs::png::PngEncoder::new(&mut png).write_image(&bytes, width, height, color)?;
    Ok(png)
}

/// Encode `tile` and write it to `path`.
///
/// # Errors
///
/// As [`encode_png`], plus [`IoError::Io`] if the file cannot be written.
pub fn write_png(path: &Path, tile: &ImageData) -> Result<(), IoError> {
    let png = encode_png(tile)?;
    fs::write(path, png).map_err(|e| IoError::io(path, e))?;
    tracing::debug!(path = %path.display(), shape = ?tile.shape(), "tile written");
    Ok(())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_byte(unit: f32) -> u8 {
    (unit * 255.0).round().clamp(0.0, 255.0) as u8
}

fn shape_error(tile: &ImageData, err: &std::num::TryFromIntError) -> IoError {
    PipelineError::Shape {
        shape: tile.shape().to_vec(),
        reason: err.to_string(),
    }
    .into()
}
