//! Data processing steps applied to an image before cutout generation.
//!
//! A [`ProcessingStep`] is a small serializable transform. A record keeps
//! an ordered list of them and replays the list whenever the source image
//! is re-loaded, so each step must be deterministic.

use std::fmt;

use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blur::gaussian_smooth_image;
use crate::resample::resize;
use crate::types::{ImageData, PipelineError};
use crate::variant::load_variant;

/// One transform in a record's data processing chain.
///
/// Serialized with a `processing_type` tag, e.g.
/// `{"processing_type": "median_filter", "size": 5}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "processing_type", rename_all = "snake_case")]
pub enum ProcessingStep {
    /// Per-channel median over a `size × size` window, edges clamped.
    MedianFilter { size: usize },

    /// Resample rows and columns by `factor` (2.0 doubles, 0.5 halves).
    Zoom { factor: f64 },

    /// Per-channel Gaussian blur.
    GaussianSmooth { sigma: f32 },
}

impl ProcessingStep {
    /// Tags accepted by [`load`](Self::load).
    pub const TAGS: &'static [&'static str] = &["median_filter", "zoom", "gaussian_smooth"];

    /// Restore a step from its saved dictionary.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownVariant`] for unrecognised
    /// `processing_type` tags and [`PipelineError::InvalidConfig`] for
    /// parameters [`validate`](Self::validate) rejects.
    pub fn load(value: &Value) -> Result<Self, PipelineError> {
        let step: Self = load_variant(value, "processing_type", "data processing", Self::TAGS)?;
        step.validate()?;
        Ok(step)
    }

    /// Save to a tagged dictionary.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Serialization`] if the step cannot be encoded.
    pub fn save(&self) -> Result<Value, PipelineError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Check parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for a zero median window,
    /// a non-positive or non-finite zoom factor, or a negative sigma.
    pub fn validate(&self) -> Result<(), PipelineError> {
        match *self {
            Self::MedianFilter { size: 0 } => Err(PipelineError::InvalidConfig(
                "median filter size must be at least 1".to_string(),
            )),
            Self::Zoom { factor } if !(factor.is_finite() && factor > 0.0) => Err(
                PipelineError::InvalidConfig(format!("zoom factor must be positive, got {factor}")),
            ),
            Self::GaussianSmooth { sigma } if sigma.is_nan() || sigma < 0.0 => Err(
                PipelineError::InvalidConfig(format!("sigma must be non-negative, got {sigma}")),
            ),
            _ => Ok(()),
        }
    }

    /// Apply the step, returning a new image.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Shape`] when the image cannot be resampled
    /// (zoom of a 2-channel image, or a zoom that shrinks an axis to zero).
    pub fn process(&self, image: &ImageData) -> Result<ImageData, PipelineError> {
        match *self {
            Self::MedianFilter { size } => median_filter(image, size),
            Self::Zoom { factor } => {
                let rows = zoomed_extent(image.rows(), factor);
                let cols = zoomed_extent(image.cols(), factor);
                resize(image, rows, cols)
            }
            Self::GaussianSmooth { sigma } => gaussian_smooth_image(image, sigma),
        }
    }
}

impl fmt::Display for ProcessingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MedianFilter { size } => write!(f, "MedianFilter(size={size})"),
            Self::Zoom { factor } => write!(f, "Zoom(factor={factor})"),
            Self::GaussianSmooth { sigma } => write!(f, "GaussianSmooth(sigma={sigma})"),
        }
    }
}

/// Apply steps in order.
///
/// # Errors
///
/// Propagates the first failing step's error.
pub fn apply_steps(image: ImageData, steps: &[ProcessingStep]) -> Result<ImageData, PipelineError> {
    steps.iter().try_fold(image, |img, step| {
        tracing::debug!(%step, shape = ?img.shape(), "applying data processing");
        step.process(&img)
    })
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn zoomed_extent(n: usize, factor: f64) -> usize {
    (n as f64 * factor).round() as usize
}

fn median_filter(image: &ImageData, size: usize) -> Result<ImageData, PipelineError> {
    if size <= 1 {
        return Ok(image.clone());
    }

    let pixels = image.pixels();
    let (rows, cols, channels) = pixels.dim();
    // Window spans `before` pixels up/left and `size - 1 - before` down/right.
    let before = (size - 1) / 2;
    let mut window = Vec::with_capacity(size * size);
    let mut out = Array3::<f32>::zeros((rows, cols, channels));

    for ch in 0..channels {
        let plane = pixels.index_axis(Axis(2), ch);
        for r in 0..rows {
            for c in 0..cols {
                window.clear();
                for dr in 0..size {
                    let rr = (r + dr).saturating_sub(before).min(rows - 1);
                    for dc in 0..size {
                        let cc = (c + dc).saturating_sub(before).min(cols - 1);
                        window.push(plane[[rr, cc]]);
                    }
                }
                let mid = window.len() / 2;
                let (_, median, _) = window.select_nth_unstable_by(mid, f32::total_cmp);
                out[[r, c, ch]] = *median;
            }
        }
    }
    ImageData::new(out)
}
