//! Channel conversions: luminance for segmentation, RGB promotion for
//! feature extraction.
//!
//! Neither function mutates its input; both return freshly allocated
//! arrays.

use ndarray::{Array2, Array3, Axis, s};

use crate::types::{ImageData, PipelineError};

/// Luminance weights applied to the R, G and B channels.
pub const LUMINANCE_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

/// Collapse an image to a single luminance plane.
///
/// Single-channel images are returned as-is. Images with three or more
/// channels use the first three as R, G, B (alpha is ignored).
///
/// # Errors
///
/// Returns [`PipelineError::Shape`] for two-channel images.
pub fn luminance(image: &ImageData) -> Result<Array2<f32>, PipelineError> {
    let pixels = image.pixels();
    match image.channels() {
        1 => Ok(pixels.index_axis(Axis(2), 0).to_owned()),
        n if n >= 3 => {
            let rgb = pixels.slice(s![.., .., 0..3]);
            Ok(rgb.map_axis(Axis(2), |px| {
                px.iter()
                    .zip(LUMINANCE_WEIGHTS)
                    .map(|(v, w)| v * w)
                    .sum()
            }))
        }
        _ => Err(PipelineError::shape(
            &image.shape(),
            "luminance needs 1 channel or at least 3",
        )),
    }
}

/// Promote an image to exactly three channels.
///
/// Grayscale is replicated into R, G and B; four-channel images drop
/// alpha; RGB images are copied.
///
/// # Errors
///
/// Returns [`PipelineError::Shape`] for channel counts other than 1, 3 or 4.
pub fn to_rgb(image: &ImageData) -> Result<ImageData, PipelineError> {
    let pixels = image.pixels();
    let rgb: Array3<f32> = match image.channels() {
        1 => {
            let (rows, cols, _) = pixels.dim();
            Array3::from_shape_fn((rows, cols, 3), |(r, c, _)| pixels[[r, c, 0]])
        }
        3 => pixels.clone(),
        4 => pixels.slice(s![.., .., 0..3]).to_owned(),
        _ => {
            return Err(PipelineError::shape(
                &image.shape(),
                "expected 1, 3 or 4 channels",
            ));
        }
    };
    ImageData::new(rgb)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pixel(r: f32, g: f32, b: f32) -> ImageData {
        ImageData::new(Array3::from_shape_vec((1, 1, 3), vec![r, g, b]).unwrap()).unwrap()
    }

    #[test]
    fn green_is_brightest_channel() {
        let red = luminance(&pixel(255.0, 0.0, 0.0)).unwrap()[[0, 0]];
        let green = luminance(&pixel(0.0, 255.0, 0.0)).unwrap()[[0, 0]];
        let blue = luminance(&pixel(0.0, 0.0, 255.0)).unwrap()[[0, 0]];
        assert!(
            green > red && red > blue,
            "expected green > red > blue luminance, got R={red} G={green} B={blue}",
        );
    }

    #[test]
    fn white_maps_to_full_scale() {
        let white = luminance(&pixel(255.0, 255.0, 255.0)).unwrap()[[0, 0]];
        assert!((white - 255.0).abs() < 1e-3);
    }

    #[test]
    fn single_channel_luminance_is_identity() {
        let plane = Array2::from_shape_fn((3, 2), |(r, c)| (r + c) as f32);
        let img = ImageData::from_gray(plane.clone()).unwrap();
        assert_eq!(luminance(&img).unwrap(), plane);
    }

    #[test]
    fn two_channels_are_rejected() {
        let img = ImageData::new(Array3::zeros((2, 2, 2))).unwrap();
        assert!(matches!(luminance(&img), Err(PipelineError::Shape { .. })));
        assert!(matches!(to_rgb(&img), Err(PipelineError::Shape { .. })));
    }

    #[test]
    fn gray_is_replicated_into_rgb() {
        let img = ImageData::from_gray(Array2::from_elem((2, 3), 7.0)).unwrap();
        let rgb = to_rgb(&img).unwrap();
        assert_eq!(rgb.shape(), [2, 3, 3]);
        assert!(rgb.pixels().iter().all(|&v| (v - 7.0).abs() < f32::EPSILON));
    }

    #[test]
    fn alpha_is_dropped() {
        let img = ImageData::new(Array3::from_elem((2, 2, 4), 1.0)).unwrap();
        assert_eq!(to_rgb(&img).unwrap().shape(), [2, 2, 3]);
    }
}
