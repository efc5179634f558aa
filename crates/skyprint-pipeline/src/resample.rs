//! Antialiased resampling of float images.
//!
//! Used by the full-image and blob cutout strategies (resize a region to
//! the model input size) and by the zoom processing step.
//!
//! The `image` crate clamps float samples to `[0, 1]` while resampling,
//! so pixels are rescaled into that range around the call and mapped
//! back afterwards. The triangle filter has non-negative weights, so
//! outputs never leave the input's value range and the round trip is
//! lossless up to float rounding.

use image::imageops::FilterType;
use image::{ImageBuffer, Luma, Pixel, Rgb, Rgba};
use ndarray::Array3;

use crate::blur::pixel_extent;
use crate::types::{ImageData, PipelineError};

/// Resampling filter used for all resizes.
pub const RESAMPLE_FILTER: FilterType = FilterType::Triangle;

/// Resize an image to `rows × cols` pixels.
///
/// Supports 1, 3 and 4 channel images.
///
/// # Errors
///
/// Returns [`PipelineError::Shape`] for other channel counts or a zero
/// target size.
pub fn resize(image: &ImageData, rows: usize, cols: usize) -> Result<ImageData, PipelineError> {
    if rows == 0 || cols == 0 {
        return Err(PipelineError::shape(
            &image.shape(),
            format!("cannot resize to {rows}x{cols}"),
        ));
    }
    if image.rows() == rows && image.cols() == cols {
        return Ok(image.clone());
    }

    match image.channels() {
        1 => resize_as::<Luma<f32>>(image, rows, cols),
        3 => resize_as::<Rgb<f32>>(image, rows, cols),
        4 => resize_as::<Rgba<f32>>(image, rows, cols),
        _ => Err(PipelineError::shape(
            &image.shape(),
            "resampling supports 1, 3 or 4 channels",
        )),
    }
}

fn resize_as<P>(image: &ImageData, rows: usize, cols: usize) -> Result<ImageData, PipelineError>
where
    P: Pixel<Subpixel = f32> + 'static,
{
    let shape = image.shape();
    let (lo, hi) = value_range(image);
    let span = hi - lo;
    let channels = image.channels();

    if span <= f32::EPSILON {
        // Constant image: every resampled pixel is the same value.
        return ImageData::new(Array3::from_elem((rows, cols, channels), lo));
    }

    let normalized: Vec<f32> = image.pixels().iter().map(|v| (v - lo) / span).collect();
    let buffer = ImageBuffer::<P, Vec<f32>>::from_raw(
        pixel_extent(image.cols(), &shape)?,
        pixel_extent(image.rows(), &shape)?,
        normalized,
    )
    .ok_or_else(|| PipelineError::shape(&shape, "pixel buffer does not match dimensions"))?;

    let resized = image::imageops::resize(
        &buffer,
        pixel_extent(cols, &shape)?,
        pixel_extent(rows, &shape)?,
        RESAMPLE_FILTER,
    );

    let restored: Vec<f32> = resized.into_raw().into_iter().map(|v| v.mul_add(span, lo)).collect();
    let array = Array3::from_shape_vec((rows, cols, channels), restored)
        .map_err(|e| PipelineError::shape(&shape, e.to_string()))?;
    ImageData::new(array)
}

/// Minimum and maximum finite pixel values.
fn value_range(image: &ImageData) -> (f32, f32) {
    image
        .pixels()
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn gradient(rows: usize, cols: usize, channels: usize) -> ImageData {
        #[allow(clippy::cast_precision_loss)]
        let pixels = Array3::from_shape_fn((rows, cols, channels), |(r, c, _)| {
            (r * 10 + c) as f32 * 3.0
        });
        ImageData::new(pixels).unwrap()
    }

    #[test]
    fn resize_to_square_output() {
        let img = gradient(40, 60, 3);
        let out = resize(&img, 16, 16).unwrap();
        assert_eq!(out.shape(), [16, 16, 3]);
    }

    #[test]
    fn single_channel_keeps_one_channel() {
        let img = gradient(20, 10, 1);
        let out = resize(&img, 5, 5).unwrap();
        assert_eq!(out.shape(), [5, 5, 1]);
    }

    #[test]
    fn output_stays_within_input_range() {
        let img = gradient(30, 30, 1);
        let out = resize(&img, 7, 7).unwrap();
        let max_in = 29.0 * 10.0 * 3.0 + 29.0 * 3.0;
        for &v in out.pixels() {
            assert!((0.0..=max_in + 1e-2).contains(&v), "value {v} escaped range");
        }
    }

    #[test]
    fn large_values_are_not_clamped() {
        let pixels = Array3::from_shape_fn((8, 8, 1), |(r, _, _)| if r < 4 { 1_000.0 } else { 50_000.0 });
        let img = ImageData::new(pixels).unwrap();
        let out = resize(&img, 4, 4).unwrap();
        let max = out.pixels().iter().copied().fold(f32::MIN, f32::max);
        assert!(max > 40_000.0, "expected large values to survive, max was {max}");
    }

    #[test]
    fn constant_image_resizes_to_constant() {
        let img = ImageData::new(Array3::from_elem((9, 5, 3), 42.0)).unwrap();
        let out = resize(&img, 3, 3).unwrap();
        assert!(out.pixels().iter().all(|&v| (v - 42.0).abs() < f32::EPSILON));
    }

    #[test]
    fn same_size_is_a_copy() {
        let img = gradient(6, 6, 3);
        assert_eq!(resize(&img, 6, 6).unwrap(), img);
    }

    #[test]
    fn two_channels_are_rejected() {
        let img = ImageData::new(Array3::from_elem((4, 4, 2), 1.0)).unwrap();
        assert!(matches!(resize(&img, 2, 2), Err(PipelineError::Shape { .. })));
    }

    #[test]
    fn zero_target_is_rejected() {
        let img = gradient(4, 4, 1);
        assert!(matches!(resize(&img, 0, 2), Err(PipelineError::Shape { .. })));
    }
}
