//! Cutout generation: partition an image into square tiles.
//!
//! [`CutoutStrategy`] selects the algorithm and [`CutoutGenerator`] pairs
//! it with a stable identifier. Generators are pure functions of their
//! parameters, so two generators with the same uuid produce the same
//! cutouts for the same image.
//!
//! Tiles are produced lazily by [`Cutouts`]. Calling
//! [`CutoutSource::create_cutouts`] again starts a fresh sequence.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::blob::{BlobParams, blob_boxes, label_blobs};
use crate::resample::resize;
use crate::types::{Bounds, Cutout, ImageData, PipelineError};
use crate::variant::load_variant;

/// Selects which cutout algorithm to use.
///
/// Serialized with a `cutout_type` tag, e.g.
/// `{"cutout_type": "sliding_window", "output_size": 224, "step_size": 112}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cutout_type", rename_all = "snake_case")]
pub enum CutoutStrategy {
    /// Fixed-size tiles centred on a regular grid of anchors.
    ///
    /// Anchors run from `output_size / 2` to `n - output_size / 2`
    /// (exclusive) in steps of `step_size`, rows outer, columns inner.
    SlidingWindow { output_size: usize, step_size: usize },

    /// The whole image resampled to one `output_size` square tile.
    FullImage { output_size: usize },

    /// One tile per connected bright region, padded and squared, then
    /// resampled to `output_size`.
    Blob {
        output_size: usize,
        #[serde(default = "CutoutStrategy::default_mean_threshold")]
        mean_threshold: f32,
        #[serde(default = "CutoutStrategy::default_sigma")]
        gaussian_smoothing_sigma: f32,
        #[serde(default = "CutoutStrategy::default_label_padding")]
        label_padding: usize,
    },
}

impl CutoutStrategy {
    pub const DEFAULT_OUTPUT_SIZE: usize = 224;
    pub const DEFAULT_STEP_SIZE: usize = 112;
    pub const DEFAULT_MEAN_THRESHOLD: f32 = 2.0;
    pub const DEFAULT_GAUSSIAN_SMOOTHING_SIGMA: f32 = 10.0;
    pub const DEFAULT_LABEL_PADDING: usize = 80;

    /// Tags accepted by [`CutoutGenerator::load`].
    pub const TAGS: &'static [&'static str] = &["sliding_window", "full_image", "blob"];

    /// Blob strategy with default threshold, smoothing and padding.
    #[must_use]
    pub const fn blob(output_size: usize) -> Self {
        Self::Blob {
            output_size,
            mean_threshold: Self::DEFAULT_MEAN_THRESHOLD,
            gaussian_smoothing_sigma: Self::DEFAULT_GAUSSIAN_SMOOTHING_SIGMA,
            label_padding: Self::DEFAULT_LABEL_PADDING,
        }
    }

    /// Side length of every produced tile.
    #[must_use]
    pub const fn output_size(&self) -> usize {
        match *self {
            Self::SlidingWindow { output_size, .. }
            | Self::FullImage { output_size }
            | Self::Blob { output_size, .. } => output_size,
        }
    }

    /// Check parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for a zero output size,
    /// a zero step, or a negative or non-finite blob threshold or sigma.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.output_size() == 0 {
            return Err(PipelineError::InvalidConfig(
                "output_size must be at least 1".to_string(),
            ));
        }
        match *self {
            Self::SlidingWindow { step_size: 0, .. } => Err(PipelineError::InvalidConfig(
                "step_size must be at least 1".to_string(),
            )),
            Self::Blob {
                mean_threshold,
                gaussian_smoothing_sigma,
                ..
            } if !(mean_threshold.is_finite() && gaussian_smoothing_sigma.is_finite())
                || gaussian_smoothing_sigma < 0.0 =>
            {
                Err(PipelineError::InvalidConfig(format!(
                    "blob threshold {mean_threshold} and sigma {gaussian_smoothing_sigma} \
                     must be finite with sigma >= 0"
                )))
            }
            _ => Ok(()),
        }
    }

    const fn default_mean_threshold() -> f32 {
        Self::DEFAULT_MEAN_THRESHOLD
    }

    const fn default_sigma() -> f32 {
        Self::DEFAULT_GAUSSIAN_SMOOTHING_SIGMA
    }

    const fn default_label_padding() -> usize {
        Self::DEFAULT_LABEL_PADDING
    }
}

impl Default for CutoutStrategy {
    fn default() -> Self {
        Self::SlidingWindow {
            output_size: Self::DEFAULT_OUTPUT_SIZE,
            step_size: Self::DEFAULT_STEP_SIZE,
        }
    }
}

impl fmt::Display for CutoutStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SlidingWindow { step_size, .. } => {
                write!(f, "Sliding window cutout (step_size={step_size})")
            }
            Self::FullImage { .. } => f.write_str("Full image cutout"),
            Self::Blob {
                mean_threshold,
                gaussian_smoothing_sigma,
                ..
            } => write!(
                f,
                "Blob cutout (mean_threshold={mean_threshold}, \
                 gaussian_smoothing_sigma={gaussian_smoothing_sigma})"
            ),
        }
    }
}

/// Trait for cutout producers.
pub trait CutoutSource {
    /// Number of cutouts `create_cutouts` would produce.
    ///
    /// Exact for the sliding-window and full-image strategies. For blobs
    /// this is the label count, an upper bound since boxes that leave
    /// the image are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Shape`] for images the strategy cannot
    /// segment.
    fn number_cutouts(&self, image: &ImageData) -> Result<usize, PipelineError>;

    /// Start a lazy sequence of cutouts over `image`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Shape`] if segmentation fails up front.
    /// Per-tile failures are reported through the iterator items.
    fn create_cutouts<'a>(&'a self, image: &'a ImageData) -> Result<Cutouts<'a>, PipelineError>;
}

/// A cutout strategy with a stable identity.
///
/// Saves as the strategy's tagged dictionary plus a `uuid` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutoutGenerator {
    #[serde(flatten)]
    strategy: CutoutStrategy,
    uuid: Uuid,
}

impl CutoutGenerator {
    /// New generator with a freshly assigned uuid.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the strategy fails
    /// [`CutoutStrategy::validate`].
    pub fn new(strategy: CutoutStrategy) -> Result<Self, PipelineError> {
        Self::with_uuid(strategy, Uuid::new_v4())
    }

    /// Generator with an explicit identifier, as restored from disk.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for invalid parameters.
    pub fn with_uuid(strategy: CutoutStrategy, uuid: Uuid) -> Result<Self, PipelineError> {
        strategy.validate()?;
        Ok(Self { strategy, uuid })
    }

    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[must_use]
    pub const fn strategy(&self) -> &CutoutStrategy {
        &self.strategy
    }

    /// Restore from a saved dictionary without consulting the registry.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownVariant`] for unknown `cutout_type`
    /// tags, [`PipelineError::InvalidConfig`] for invalid parameters or a
    /// missing tag.
    pub fn load(value: &Value) -> Result<Self, PipelineError> {
        let generator: Self = load_variant(value, "cutout_type", "cutout generator", CutoutStrategy::TAGS)?;
        generator.strategy.validate()?;
        Ok(generator)
    }

    /// Save to a tagged dictionary.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Serialization`] if encoding fails.
    pub fn save(&self) -> Result<Value, PipelineError> {
        Ok(serde_json::to_value(self)?)
    }

    const fn blob_params(&self) -> Option<BlobParams> {
        match self.strategy {
            CutoutStrategy::Blob {
                mean_threshold,
                gaussian_smoothing_sigma,
                label_padding,
                ..
            } => Some(BlobParams {
                mean_threshold,
                gaussian_smoothing_sigma,
                label_padding,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for CutoutGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.strategy.fmt(f)
    }
}

impl CutoutSource for CutoutGenerator {
    fn number_cutouts(&self, image: &ImageData) -> Result<usize, PipelineError> {
        match self.strategy {
            CutoutStrategy::SlidingWindow {
                output_size,
                step_size,
            } => {
                let rows = anchors(image.rows(), output_size, step_size).count();
                let cols = anchors(image.cols(), output_size, step_size).count();
                Ok(rows * cols)
            }
            CutoutStrategy::FullImage { .. } => Ok(1),
            CutoutStrategy::Blob { .. } => match self.blob_params() {
                Some(params) => Ok(label_blobs(image, &params)?.count() as usize),
                None => Ok(0),
            },
        }
    }

    fn create_cutouts<'a>(&'a self, image: &'a ImageData) -> Result<Cutouts<'a>, PipelineError> {
        let output_size = self.strategy.output_size();
        let state = match self.strategy {
            CutoutStrategy::SlidingWindow { step_size, .. } => CutoutsState::Window {
                rows: anchors(image.rows(), output_size, step_size).collect(),
                cols: anchors(image.cols(), output_size, step_size).collect(),
                next: 0,
            },
            CutoutStrategy::FullImage { .. } => CutoutsState::Full { done: false },
            CutoutStrategy::Blob { .. } => {
                let boxes = match self.blob_params() {
                    Some(params) => blob_boxes(image, &params)?,
                    None => Vec::new(),
                };
                CutoutsState::Blob {
                    boxes: boxes.into_iter(),
                }
            }
        };
        Ok(Cutouts {
            image,
            output_size,
            state,
        })
    }
}

/// Window anchors along one axis: `[half, n - half)` stepped by `step`.
fn anchors(n: usize, output_size: usize, step: usize) -> impl Iterator<Item = usize> {
    let half = output_size / 2;
    (half..n.saturating_sub(half)).step_by(step.max(1))
}

/// Lazy sequence of cutouts over one image.
#[derive(Debug)]
pub struct Cutouts<'a> {
    image: &'a ImageData,
    output_size: usize,
    state: CutoutsState,
}

#[derive(Debug)]
enum CutoutsState {
    Window {
        rows: Vec<usize>,
        cols: Vec<usize>,
        next: usize,
    },
    Full {
        done: bool,
    },
    Blob {
        boxes: std::vec::IntoIter<Bounds>,
    },
}

impl Iterator for Cutouts<'_> {
    type Item = Result<Cutout, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let size = self.output_size;
        match &mut self.state {
            CutoutsState::Window { rows, cols, next } => {
                if cols.is_empty() || *next >= rows.len() * cols.len() {
                    return None;
                }
                let (row, col) = (rows[*next / cols.len()], cols[*next % cols.len()]);
                *next += 1;
                let half = size / 2;
                let bounds = Bounds::new(row - half, row - half + size, col - half, col - half + size);
                Some(self.image.region(bounds).map(|tile| Cutout { bounds, tile }))
            }
            CutoutsState::Full { done } => {
                if *done {
                    return None;
                }
                *done = true;
                Some(resize(self.image, size, size).map(|tile| Cutout {
                    bounds: Bounds::new(0, size, 0, size),
                    tile,
                }))
            }
            CutoutsState::Blob { boxes } => {
                let bounds = boxes.next()?;
                Some(
                    self.image
                        .region(bounds)
                        .and_then(|region| resize(&region, size, size))
                        .map(|tile| Cutout { bounds, tile }),
                )
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.state {
            CutoutsState::Window { rows, cols, next } => {
                let remaining = (rows.len() * cols.len()).saturating_sub(*next);
                (remaining, Some(remaining))
            }
            CutoutsState::Full { done } => {
                let remaining = usize::from(!*done);
                (remaining, Some(remaining))
            }
            CutoutsState::Blob { boxes } => boxes.size_hint(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ndarray::{Array2, Array3};
    use serde_json::json;

    use super::*;

    fn gray(rows: usize, cols: usize) -> ImageData {
        #[allow(clippy::cast_precision_loss)]
        let plane = Array2::from_shape_fn((rows, cols), |(r, c)| (r * cols + c) as f32);
        ImageData::from_gray(plane).unwrap()
    }

    fn window(output_size: usize, step_size: usize) -> CutoutGenerator {
        CutoutGenerator::new(CutoutStrategy::SlidingWindow {
            output_size,
            step_size,
        })
        .unwrap()
    }

    #[test]
    fn single_window_on_double_size_image() {
        let img = gray(448, 448);
        let generator = window(224, 224);
        assert_eq!(generator.number_cutouts(&img).unwrap(), 1);
        let cutouts: Vec<_> = generator
            .create_cutouts(&img)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(cutouts.len(), 1);
        assert_eq!(cutouts[0].bounds, Bounds::new(0, 224, 0, 224));
        assert_eq!(cutouts[0].tile.shape(), [224, 224, 1]);
    }

    #[test]
    fn window_count_matches_anchor_product() {
        let img = gray(100, 70);
        let generator = window(20, 15);
        // rows: 10..90 step 15 -> 6 anchors; cols: 10..60 step 15 -> 4 anchors
        assert_eq!(generator.number_cutouts(&img).unwrap(), 24);
        let cutouts: Vec<_> = generator.create_cutouts(&img).unwrap().collect();
        assert_eq!(cutouts.len(), 24);
        for cutout in cutouts {
            assert_eq!(cutout.unwrap().tile.shape(), [20, 20, 1]);
        }
    }

    #[test]
    fn window_order_is_row_major() {
        let img = gray(40, 40);
        let bounds: Vec<_> = window(20, 10)
            .create_cutouts(&img)
            .unwrap()
            .map(|c| c.unwrap().bounds)
            .collect();
        assert_eq!(bounds[0], Bounds::new(0, 20, 0, 20));
        assert_eq!(bounds[1], Bounds::new(0, 20, 10, 30));
        assert_eq!(bounds[2], Bounds::new(10, 30, 0, 20));
    }

    #[test]
    fn odd_output_size_still_gives_full_tiles() {
        let img = gray(30, 30);
        for cutout in window(7, 5).create_cutouts(&img).unwrap() {
            assert_eq!(cutout.unwrap().tile.shape(), [7, 7, 1]);
        }
    }

    #[test]
    fn image_smaller_than_window_yields_nothing() {
        let img = gray(100, 100);
        let generator = window(224, 10);
        assert_eq!(generator.number_cutouts(&img).unwrap(), 0);
        assert_eq!(generator.create_cutouts(&img).unwrap().count(), 0);
    }

    #[test]
    fn create_cutouts_restarts() {
        let img = gray(60, 60);
        let generator = window(20, 20);
        let first = generator.create_cutouts(&img).unwrap().count();
        let second = generator.create_cutouts(&img).unwrap().count();
        assert_eq!(first, second);
        assert!(first > 0);
    }

    #[test]
    fn zero_step_is_rejected() {
        let result = CutoutGenerator::new(CutoutStrategy::SlidingWindow {
            output_size: 224,
            step_size: 0,
        });
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn full_image_yields_exactly_one_cutout() {
        let img = ImageData::new(Array3::from_elem((300, 500, 3), 9.0)).unwrap();
        let generator = CutoutGenerator::new(CutoutStrategy::FullImage { output_size: 64 }).unwrap();
        assert_eq!(generator.number_cutouts(&img).unwrap(), 1);
        let cutouts: Vec<_> = generator.create_cutouts(&img).unwrap().collect();
        assert_eq!(cutouts.len(), 1);
        let cutout = cutouts.into_iter().next().unwrap().unwrap();
        assert_eq!(cutout.bounds, Bounds::new(0, 64, 0, 64));
        assert_eq!(cutout.tile.shape(), [64, 64, 3]);
    }

    #[test]
    fn blob_cutouts_are_resampled_and_in_bounds() {
        let plane = Array2::from_shape_fn((120, 120), |(r, c)| {
            if (20..30).contains(&r) && (20..30).contains(&c) { 500.0 } else { 1.0 }
        });
        let img = ImageData::from_gray(plane).unwrap();
        let generator = CutoutGenerator::new(CutoutStrategy::Blob {
            output_size: 32,
            mean_threshold: 2.0,
            gaussian_smoothing_sigma: 1.0,
            label_padding: 5,
        })
        .unwrap();
        assert_eq!(generator.number_cutouts(&img).unwrap(), 1);
        let cutouts: Vec<_> = generator
            .create_cutouts(&img)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(cutouts.len(), 1);
        assert!(cutouts[0].bounds.fits_within(120, 120));
        assert_eq!(cutouts[0].tile.shape(), [32, 32, 1]);
    }

    #[test]
    fn save_load_keeps_uuid_and_parameters() {
        let generator = CutoutGenerator::new(CutoutStrategy::blob(224)).unwrap();
        let saved = generator.save().unwrap();
        assert_eq!(saved["cutout_type"], "blob");
        assert_eq!(saved["label_padding"], 80);
        let restored = CutoutGenerator::load(&saved).unwrap();
        assert_eq!(restored, generator);
    }

    #[test]
    fn blob_defaults_fill_missing_fields() {
        let value = json!({
            "cutout_type": "blob",
            "output_size": 224,
            "uuid": "67e55044-10b1-426f-9247-bb680e5fe0c8",
        });
        let generator = CutoutGenerator::load(&value).unwrap();
        assert_eq!(*generator.strategy(), CutoutStrategy::blob(224));
    }

    #[test]
    fn unknown_cutout_type_is_rejected() {
        let value = json!({"cutout_type": "spiral", "output_size": 224, "uuid": Uuid::nil()});
        assert!(matches!(
            CutoutGenerator::load(&value),
            Err(PipelineError::UnknownVariant { .. })
        ));
    }
}
