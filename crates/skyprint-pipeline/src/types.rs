//! Shared types for the skyprint pipeline.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::{Array2, Array3, ArrayView3, Axis, s};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pixel data for one image or tile.
///
/// Stored as `(rows, cols, channels)`. A 2-D grayscale image is a
/// single-channel array; RGB images have three channels. Values keep
/// whatever scale the loader produced (0-255 for 8-bit rasters, raw
/// counts for science data).
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData(Array3<f32>);

impl ImageData {
    /// Wrap a `(rows, cols, channels)` array.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Shape`] if any axis is empty.
    pub fn new(pixels: Array3<f32>) -> Result<Self, PipelineError> {
        if pixels.shape().contains(&0) {
            return Err(PipelineError::shape(pixels.shape(), "image axes must be non-empty"));
        }
        Ok(Self(pixels))
    }

    /// Wrap a 2-D grayscale plane as a single-channel image.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Shape`] if either axis is empty.
    pub fn from_gray(plane: Array2<f32>) -> Result<Self, PipelineError> {
        Self::new(plane.insert_axis(Axis(2)))
    }

    /// Number of pixel rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.0.dim().0
    }

    /// Number of pixel columns.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.0.dim().1
    }

    /// Number of channels (1 for grayscale, 3 for RGB).
    #[must_use]
    pub fn channels(&self) -> usize {
        self.0.dim().2
    }

    /// Shape as `[rows, cols, channels]`.
    #[must_use]
    pub fn shape(&self) -> [usize; 3] {
        let (r, c, ch) = self.0.dim();
        [r, c, ch]
    }

    /// Borrow the underlying array.
    #[must_use]
    pub const fn pixels(&self) -> &Array3<f32> {
        &self.0
    }

    /// Borrow the underlying array as a view.
    #[must_use]
    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.0.view()
    }

    /// Consume and return the underlying array.
    #[must_use]
    pub fn into_pixels(self) -> Array3<f32> {
        self.0
    }

    /// Copy out the half-open region `[row_min, row_max) × [col_min, col_max)`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Shape`] if the region is empty or extends
    /// past the image.
    pub fn region(&self, bounds: Bounds) -> Result<Self, PipelineError> {
        if !bounds.fits_within(self.rows(), self.cols()) || bounds.is_empty() {
            return Err(PipelineError::shape(
                &self.shape(),
                format!("region {bounds} does not fit inside the image"),
            ));
        }
        let tile = self
            .0
            .slice(s![bounds.row_min..bounds.row_max, bounds.col_min..bounds.col_max, ..])
            .to_owned();
        Ok(Self(tile))
    }

    /// Sum of absolute pixel values.
    #[must_use]
    pub fn abs_sum(&self) -> f64 {
        self.0.iter().map(|v| f64::from(v.abs())).sum()
    }
}

/// Where an image came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageProvenance {
    /// Path the pixels were loaded from.
    pub filename: String,
    /// Sky position of the image center as `(ra, dec)` in degrees, when known.
    pub radec: Option<(f64, f64)>,
    /// Free-form loader metadata (header cards, EXIF fields, ...).
    pub meta: BTreeMap<String, String>,
}

/// Pixel bounds of a cutout: half-open `[row_min, row_max) × [col_min, col_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bounds {
    pub row_min: usize,
    pub row_max: usize,
    pub col_min: usize,
    pub col_max: usize,
}

impl Bounds {
    #[must_use]
    pub const fn new(row_min: usize, row_max: usize, col_min: usize, col_max: usize) -> Self {
        Self {
            row_min,
            row_max,
            col_min,
            col_max,
        }
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.row_max.saturating_sub(self.row_min)
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.col_max.saturating_sub(self.col_min)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.height() == 0 || self.width() == 0
    }

    /// Whether the bounds lie inside an image of `rows × cols` pixels.
    #[must_use]
    pub const fn fits_within(&self, rows: usize, cols: usize) -> bool {
        self.row_min <= self.row_max
            && self.col_min <= self.col_max
            && self.row_max <= rows
            && self.col_max <= cols
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rows {}..{}, cols {}..{}",
            self.row_min, self.row_max, self.col_min, self.col_max
        )
    }
}

/// One square sub-region produced by a cutout generator.
#[derive(Debug, Clone, PartialEq)]
pub struct Cutout {
    /// Where the tile was taken from in the source image.
    pub bounds: Bounds,
    /// Tile pixels, `output_size × output_size × channels`.
    pub tile: ImageData,
}

/// One ranked model output: `(label, description, score)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Machine label (e.g. a WordNet id).
    pub label: String,
    /// Human readable description of the label.
    pub description: String,
    /// Model confidence.
    pub score: f32,
}

impl Prediction {
    #[must_use]
    pub fn new(label: impl Into<String>, description: impl Into<String>, score: f32) -> Self {
        Self {
            label: label.into(),
            description: description.into(),
            score,
        }
    }
}

/// The fingerprint of one cutout.
///
/// Serialized flat as `{row_min, row_max, col_min, col_max, predictions,
/// image}` so persisted records stay human-inspectable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    /// Identifier of the [`ProcessedImageRecord`](crate::record::ProcessedImageRecord)
    /// that owns this fingerprint.
    #[serde(default)]
    pub image: Uuid,
    #[serde(flatten)]
    pub bounds: Bounds,
    /// Predictions ordered by descending score.
    pub predictions: Vec<Prediction>,
}

impl FingerprintRecord {
    /// Reference to this fingerprint that survives without the predictions.
    #[must_use]
    pub const fn reference(&self) -> FingerprintRef {
        FingerprintRef {
            image: self.image,
            bounds: self.bounds,
        }
    }
}

/// Lightweight pointer back to a fingerprint: owning image plus bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FingerprintRef {
    pub image: Uuid,
    #[serde(flatten)]
    pub bounds: Bounds,
}

/// Errors that can occur in the pipeline.
///
/// Uses custom `Serialize`/`Deserialize` because `serde_json::Error`
/// does not implement serde traits. Errors cross the worker boundary as
/// JSON, so the `Serialization` variant travels as its `Display` string.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The array rank or shape is not supported by the operation.
    #[error("unsupported array shape {shape:?}: {reason}")]
    Shape { shape: Vec<usize>, reason: String },

    /// Re-loading the source image of a restored record failed.
    #[error("source image {path:?} is unavailable: {reason}")]
    SourceUnavailable { path: String, reason: String },

    /// A saved dictionary names a variant that is not registered.
    #[error("unknown {kind} variant {tag:?}")]
    UnknownVariant { kind: String, tag: String },

    /// Configuration values are invalid or incomplete.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The feature extractor failed on a tile.
    #[error("feature extractor failed: {0}")]
    Extractor(String),

    /// A configuration or result could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub(crate) fn shape(shape: &[usize], reason: impl Into<String>) -> Self {
        Self::Shape {
            shape: shape.to_vec(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unknown_variant(kind: &str, tag: impl Into<String>) -> Self {
        Self::UnknownVariant {
            kind: kind.to_string(),
            tag: tag.into(),
        }
    }
}

/// Serde-compatible proxy for `PipelineError`.
#[derive(Serialize, Deserialize)]
enum PipelineErrorProxy {
    Shape { shape: Vec<usize>, reason: String },
    SourceUnavailable { path: String, reason: String },
    UnknownVariant { kind: String, tag: String },
    InvalidConfig(String),
    Extractor(String),
    Serialization(String),
}

impl Serialize for PipelineError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let proxy = match self {
            Self::Shape { shape, reason } => PipelineErrorProxy::Shape {
                shape: shape.clone(),
                reason: reason.clone(),
            },
            Self::SourceUnavailable { path, reason } => PipelineErrorProxy::SourceUnavailable {
                path: path.clone(),
                reason: reason.clone(),
            },
            Self::UnknownVariant { kind, tag } => PipelineErrorProxy::UnknownVariant {
                kind: kind.clone(),
                tag: tag.clone(),
            },
            Self::InvalidConfig(s) => PipelineErrorProxy::InvalidConfig(s.clone()),
            Self::Extractor(s) => PipelineErrorProxy::Extractor(s.clone()),
            Self::Serialization(e) => PipelineErrorProxy::Serialization(e.to_string()),
        };
        proxy.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PipelineError {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let proxy = PipelineErrorProxy::deserialize(deserializer)?;
        Ok(match proxy {
            PipelineErrorProxy::Shape { shape, reason } => Self::Shape { shape, reason },
            PipelineErrorProxy::SourceUnavailable { path, reason } => {
                Self::SourceUnavailable { path, reason }
            }
            PipelineErrorProxy::UnknownVariant { kind, tag } => Self::UnknownVariant { kind, tag },
            PipelineErrorProxy::InvalidConfig(s) => Self::InvalidConfig(s),
            PipelineErrorProxy::Extractor(s) => Self::Extractor(s),
            // The typed serde_json error cannot be rebuilt; keep the message.
            PipelineErrorProxy::Serialization(msg) => {
                Self::InvalidConfig(format!("serialization error: {msg}"))
            }
        })
    }
}
