//! Gaussian smoothing of floating-point planes.
//!
//! Wraps [`imageproc::filter::gaussian_blur_f32`] over `Luma<f32>`
//! buffers so science data keeps its dynamic range (no quantisation to
//! 8 bits, negative values survive).
//!
//! [`gaussian_smooth`] operates on one plane. [`gaussian_smooth_image`]
//! applies the same blur independently to every channel.

use image::{ImageBuffer, Luma};
use ndarray::{Array2, Array3, Axis};

use crate::types::{ImageData, PipelineError};

type GrayF32Image = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Apply Gaussian smoothing to a single plane.
///
/// Non-positive sigma values (zero or negative) return the plane
/// unchanged, since `imageproc`'s underlying function panics on
/// `sigma <= 0.0`.
///
/// # Errors
///
/// Returns [`PipelineError::Shape`] if the plane is too large to address
/// with `u32` coordinates.
#[allow(clippy::cast_possible_truncation)]
pub fn gaussian_smooth(plane: &Array2<f32>, sigma: f32) -> Result<Array2<f32>, PipelineError> {
    if sigma <= 0.0 || plane.is_empty() {
        return Ok(plane.clone());
    }

    let (rows, cols) = plane.dim();
    let (width, height) = (
        pixel_extent(cols, plane.shape())?,
        pixel_extent(rows, plane.shape())?,
    );
    let buffer = GrayF32Image::from_fn(width, height, |x, y| {
        Luma([plane[[y as usize, x as usize]]])
    });
    let blurred = imageproc::filter::gaussian_blur_f32(&buffer, sigma);

    Ok(Array2::from_shape_fn((rows, cols), |(r, c)| {
        blurred.get_pixel(c as u32, r as u32).0[0]
    }))
}

/// Apply Gaussian smoothing to every channel of an image independently.
///
/// Gaussian blur is linear and per-channel, so this is equivalent to
/// blurring in color space.
///
/// # Errors
///
/// Propagates [`gaussian_smooth`] errors.
pub fn gaussian_smooth_image(image: &ImageData, sigma: f32) -> Result<ImageData, PipelineError> {
    if sigma <= 0.0 {
        return Ok(image.clone());
    }

    let pixels = image.pixels();
    let (rows, cols, channels) = pixels.dim();
    let mut out = Array3::<f32>::zeros((rows, cols, channels));
    for c in 0..channels {
        let plane = pixels.index_axis(Axis(2), c).to_owned();
        let smoothed = gaussian_smooth(&plane, sigma)?;
        out.index_axis_mut(Axis(2), c).assign(&smoothed);
    }
    ImageData::new(out)
}

/// Convert an array extent to a `u32` pixel coordinate range.
pub(crate) fn pixel_extent(n: usize, shape: &[usize]) -> Result<u32, PipelineError> {
    u32::try_from(n).map_err(|_| PipelineError::shape(shape, "axis exceeds u32 pixel range"))
}
