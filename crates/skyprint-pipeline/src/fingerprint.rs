//! Fingerprint calculation: ranked label scores for one tile.
//!
//! The network itself sits behind the [`FeatureExtractor`] trait. This
//! module owns everything around it: channel promotion, the per-model
//! input normalisation, the degenerate-tile guard, ranking and
//! truncation, and the persisted `{class_name, parameters, uuid}` form.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use ndarray::{Array3, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::grayscale::to_rgb;
use crate::types::{ImageData, PipelineError, Prediction};
use crate::variant::tag_of;

/// Tiles whose absolute pixel sum is at or below this are not sent to
/// the model.
pub const DEGENERATE_ABS_SUM: f64 = 1e-4;

/// Placeholder returned for degenerate (all-zero) tiles.
#[must_use]
pub fn degenerate_prediction() -> Prediction {
    Prediction::new("test", "beaver", 1e-13)
}

/// Selects which pretrained network computes fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintModel {
    #[default]
    Resnet50,
    Vgg16,
    Vgg19,
    InceptionV3,
    InceptionResnetV2,
}

/// Input normalisation expected by a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preprocessing {
    /// RGB to BGR, then subtract the ImageNet channel means.
    Caffe,
    /// Scale `[0, 255]` to `[-1, 1]`.
    Tf,
}

/// ImageNet means in BGR order.
const CAFFE_BGR_MEANS: [f32; 3] = [103.939, 116.779, 123.68];

impl FingerprintModel {
    pub const ALL: [Self; 5] = [
        Self::Resnet50,
        Self::Vgg16,
        Self::Vgg19,
        Self::InceptionV3,
        Self::InceptionResnetV2,
    ];

    /// Persisted `class_name` tag.
    #[must_use]
    pub const fn class_name(self) -> &'static str {
        match self {
            Self::Resnet50 => "FingerprintResnet",
            Self::Vgg16 => "FingerprintVGG16",
            Self::Vgg19 => "FingerprintVGG19",
            Self::InceptionV3 => "FingerprintInceptionV3",
            Self::InceptionResnetV2 => "FingerprintInceptionResNetV2",
        }
    }

    /// Inverse of [`class_name`](Self::class_name).
    #[must_use]
    pub fn from_class_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.class_name() == name)
    }

    #[must_use]
    pub const fn preprocessing(self) -> Preprocessing {
        match self {
            Self::Resnet50 | Self::Vgg16 | Self::Vgg19 => Preprocessing::Caffe,
            Self::InceptionV3 | Self::InceptionResnetV2 => Preprocessing::Tf,
        }
    }

    const fn short_name(self) -> &'static str {
        match self {
            Self::Resnet50 => "resnet50",
            Self::Vgg16 => "vgg16",
            Self::Vgg19 => "vgg19",
            Self::InceptionV3 => "inception_v3",
            Self::InceptionResnetV2 => "inception_resnet_v2",
        }
    }
}

impl fmt::Display for FingerprintModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl Preprocessing {
    /// Normalise an RGB tile for the model.
    #[must_use]
    pub fn apply(self, rgb: ArrayView3<'_, f32>) -> Array3<f32> {
        match self {
            Self::Caffe => {
                let mut out = rgb.to_owned();
                // Reverse channel order, then centre each channel.
                out.invert_axis(Axis(2));
                for (ch, mean) in CAFFE_BGR_MEANS.iter().enumerate() {
                    out.index_axis_mut(Axis(2), ch).mapv_inplace(|v| v - mean);
                }
                out
            }
            Self::Tf => rgb.mapv(|v| v / 127.5 - 1.0),
        }
    }
}

/// A model that turns a normalised `(rows, cols, 3)` tile into label scores.
pub trait FeatureExtractor: Send + Sync {
    /// Return up to `top` predictions. Ordering is not required.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Extractor`] when inference fails.
    fn predict(&self, input: ArrayView3<'_, f32>, top: usize)
    -> Result<Vec<Prediction>, PipelineError>;
}

/// Builds extractors for restored calculators.
pub trait ExtractorFactory {
    /// # Errors
    ///
    /// Returns [`PipelineError::Extractor`] if the model cannot be provided.
    fn create(&self, model: FingerprintModel) -> Result<Arc<dyn FeatureExtractor>, PipelineError>;
}

/// Calculator configuration: model, result cap and identity.
///
/// Persists as `{"class_name": ..., "parameters": {"max_fingerprints": ...}, "uuid": ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "SavedCalculator", try_from = "SavedCalculator")]
pub struct FingerprintCalculatorConfig {
    pub model: FingerprintModel,
    pub max_fingerprints: usize,
    pub uuid: Uuid,
}

impl FingerprintCalculatorConfig {
    pub const DEFAULT_MAX_FINGERPRINTS: usize = 200;

    #[must_use]
    pub fn new(model: FingerprintModel, max_fingerprints: usize) -> Self {
        Self {
            model,
            max_fingerprints,
            uuid: Uuid::new_v4(),
        }
    }

    /// Restore from a saved dictionary.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownVariant`] for an unknown
    /// `class_name` and [`PipelineError::Serialization`] for malformed
    /// parameters.
    pub fn load(value: &Value) -> Result<Self, PipelineError> {
        let class_name = tag_of(value, "class_name")?;
        if FingerprintModel::from_class_name(class_name).is_none() {
            return Err(PipelineError::unknown_variant("fingerprint calculator", class_name));
        }
        Ok(Self::deserialize(value)?)
    }

    /// Save to a tagged dictionary.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Serialization`] if encoding fails.
    pub fn save(&self) -> Result<Value, PipelineError> {
        Ok(serde_json::to_value(self)?)
    }
}

impl Default for FingerprintCalculatorConfig {
    fn default() -> Self {
        Self::new(FingerprintModel::default(), Self::DEFAULT_MAX_FINGERPRINTS)
    }
}

#[derive(Serialize, Deserialize)]
struct SavedCalculator {
    class_name: String,
    #[serde(default)]
    parameters: SavedParameters,
    #[serde(default = "Uuid::new_v4")]
    uuid: Uuid,
}

#[derive(Serialize, Deserialize)]
struct SavedParameters {
    #[serde(default = "default_max_fingerprints")]
    max_fingerprints: usize,
}

impl Default for SavedParameters {
    fn default() -> Self {
        Self {
            max_fingerprints: default_max_fingerprints(),
        }
    }
}

const fn default_max_fingerprints() -> usize {
    FingerprintCalculatorConfig::DEFAULT_MAX_FINGERPRINTS
}

impl From<FingerprintCalculatorConfig> for SavedCalculator {
    fn from(config: FingerprintCalculatorConfig) -> Self {
        Self {
            class_name: config.model.class_name().to_string(),
            parameters: SavedParameters {
                max_fingerprints: config.max_fingerprints,
            },
            uuid: config.uuid,
        }
    }
}

impl TryFrom<SavedCalculator> for FingerprintCalculatorConfig {
    type Error = PipelineError;

    fn try_from(saved: SavedCalculator) -> Result<Self, Self::Error> {
        let model = FingerprintModel::from_class_name(&saved.class_name)
            .ok_or_else(|| PipelineError::unknown_variant("fingerprint calculator", saved.class_name))?;
        Ok(Self {
            model,
            max_fingerprints: saved.parameters.max_fingerprints,
            uuid: saved.uuid,
        })
    }
}

/// A configured model that fingerprints tiles.
#[derive(Clone)]
pub struct FingerprintCalculator {
    config: FingerprintCalculatorConfig,
    extractor: Arc<dyn FeatureExtractor>,
}

impl fmt::Debug for FingerprintCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintCalculator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for FingerprintCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint ({}, imagenet)", self.config.model)
    }
}

impl FingerprintCalculator {
    #[must_use]
    pub fn new(config: FingerprintCalculatorConfig, extractor: Arc<dyn FeatureExtractor>) -> Self {
        Self { config, extractor }
    }

    /// Restore a calculator, asking `factory` for its model.
    ///
    /// # Errors
    ///
    /// Propagates [`FingerprintCalculatorConfig::load`] and factory errors.
    pub fn load(value: &Value, factory: &dyn ExtractorFactory) -> Result<Self, PipelineError> {
        let config = FingerprintCalculatorConfig::load(value)?;
        Ok(Self::new(config, factory.create(config.model)?))
    }

    #[must_use]
    pub const fn config(&self) -> &FingerprintCalculatorConfig {
        &self.config
    }

    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.config.uuid
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::Serialization`] if encoding fails.
    pub fn save(&self) -> Result<Value, PipelineError> {
        self.config.save()
    }

    /// Fingerprint one tile.
    ///
    /// Predictions come back sorted by descending score and truncated to
    /// `max_fingerprints`. An all-zero tile yields the single
    /// [`degenerate_prediction`] without invoking the model.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Shape`] for tiles that cannot be promoted
    /// to RGB, and propagates extractor failures.
    pub fn calculate(&self, tile: &ImageData) -> Result<Vec<Prediction>, PipelineError> {
        let start = Instant::now();
        let rgb = to_rgb(tile)?;

        let predictions = if rgb.abs_sum() > DEGENERATE_ABS_SUM {
            let input = self.config.model.preprocessing().apply(rgb.view());
            let mut predictions = self
                .extractor
                .predict(input.view(), self.config.max_fingerprints)?;
            predictions.sort_by(|a, b| b.score.total_cmp(&a.score));
            predictions.truncate(self.config.max_fingerprints);
            predictions
        } else {
            tracing::warn!(shape = ?tile.shape(), "degenerate all-zero tile, skipping model");
            vec![degenerate_prediction()]
        };

        tracing::info!(
            model = %self.config.model,
            count = predictions.len(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1e3,
            "calculated fingerprint",
        );
        Ok(predictions)
    }
}

/// Intensity-histogram extractor.
///
/// Scores each of `bins` equal-width intensity bins (spanning the tile's
/// own value range) by the fraction of samples that fall in it. Needs no
/// model weights, so any [`FingerprintModel`] maps to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramExtractor {
    bins: usize,
}

impl HistogramExtractor {
    pub const DEFAULT_BINS: usize = 32;

    #[must_use]
    pub const fn new(bins: usize) -> Self {
        Self {
            bins: if bins == 0 { 1 } else { bins },
        }
    }

    #[must_use]
    pub const fn bins(&self) -> usize {
        self.bins
    }
}

impl Default for HistogramExtractor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BINS)
    }
}

impl FeatureExtractor for HistogramExtractor {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn predict(
        &self,
        input: ArrayView3<'_, f32>,
        top: usize,
    ) -> Result<Vec<Prediction>, PipelineError> {
        if input.is_empty() {
            return Err(PipelineError::Extractor("empty input tile".to_string()));
        }
        let (lo, hi) = input
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if !(lo.is_finite() && hi.is_finite()) {
            return Err(PipelineError::Extractor("non-finite input values".to_string()));
        }

        let span = hi - lo;
        let mut counts = vec![0usize; self.bins];
        for &v in &input {
            let bin = if span > 0.0 {
                (((v - lo) / span) * self.bins as f32) as usize
            } else {
                0
            };
            counts[bin.min(self.bins - 1)] += 1;
        }

        let total = input.len() as f32;
        let mut predictions: Vec<Prediction> = counts
            .into_iter()
            .enumerate()
            .filter(|&(_, n)| n > 0)
            .map(|(bin, n)| {
                Prediction::new(
                    format!("h{bin:03}"),
                    format!("intensity bin {} of {}", bin + 1, self.bins),
                    n as f32 / total,
                )
            })
            .collect();
        predictions.sort_by(|a, b| b.score.total_cmp(&a.score));
        predictions.truncate(top);
        Ok(predictions)
    }
}

impl ExtractorFactory for HistogramExtractor {
    fn create(&self, _model: FingerprintModel) -> Result<Arc<dyn FeatureExtractor>, PipelineError> {
        Ok(Arc::new(*self))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ndarray::Array2;
    use serde_json::json;

    use super::*;

    /// Extractor that records how often it was called and returns fixed scores.
    #[derive(Default)]
    struct Fixed {
        calls: AtomicUsize,
    }

    impl FeatureExtractor for Fixed {
        fn predict(
            &self,
            _input: ArrayView3<'_, f32>,
            _top: usize,
        ) -> Result<Vec<Prediction>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                Prediction::new("n1", "spiral", 0.1),
                Prediction::new("n2", "nebula", 0.7),
                Prediction::new("n3", "cluster", 0.2),
            ])
        }
    }

    fn calculator(max: usize, extractor: Arc<dyn FeatureExtractor>) -> FingerprintCalculator {
        FingerprintCalculator::new(
            FingerprintCalculatorConfig::new(FingerprintModel::Resnet50, max),
            extractor,
        )
    }

    #[test]
    fn black_tile_returns_placeholder_without_model() {
        let fixed = Arc::new(Fixed::default());
        let calc = calculator(200, fixed.clone());
        let tile = ImageData::from_gray(Array2::zeros((224, 224))).unwrap();
        let predictions = calc.calculate(&tile).unwrap();
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].label, "test");
        assert!((predictions[0].score - 1e-13).abs() < 1e-15);
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn predictions_are_sorted_and_truncated() {
        let calc = calculator(2, Arc::new(Fixed::default()));
        let tile = ImageData::from_gray(Array2::from_elem((8, 8), 100.0)).unwrap();
        let predictions = calc.calculate(&tile).unwrap();
        let labels: Vec<_> = predictions.iter().map(|p| p.description.as_str()).collect();
        assert_eq!(labels, ["nebula", "cluster"]);
    }

    #[test]
    fn caffe_preprocessing_swaps_and_centres() {
        let rgb = Array3::from_shape_vec((1, 1, 3), vec![10.0, 20.0, 30.0]).unwrap();
        let out = Preprocessing::Caffe.apply(rgb.view());
        assert!((out[[0, 0, 0]] - (30.0 - 103.939)).abs() < 1e-4);
        assert!((out[[0, 0, 2]] - (10.0 - 123.68)).abs() < 1e-4);
    }

    #[test]
    fn tf_preprocessing_scales_to_unit_range() {
        let rgb = Array3::from_shape_vec((1, 1, 3), vec![0.0, 127.5, 255.0]).unwrap();
        let out = Preprocessing::Tf.apply(rgb.view());
        assert!((out[[0, 0, 0]] + 1.0).abs() < 1e-6);
        assert!(out[[0, 0, 1]].abs() < 1e-6);
        assert!((out[[0, 0, 2]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn config_saves_class_name_and_parameters() {
        let config = FingerprintCalculatorConfig::new(FingerprintModel::Vgg16, 50);
        let saved = config.save().unwrap();
        assert_eq!(saved["class_name"], "FingerprintVGG16");
        assert_eq!(saved["parameters"]["max_fingerprints"], 50);
        assert_eq!(FingerprintCalculatorConfig::load(&saved).unwrap(), config);
    }

    #[test]
    fn config_without_parameters_uses_defaults() {
        let config =
            FingerprintCalculatorConfig::load(&json!({"class_name": "FingerprintResnet", "parameters": {}}))
                .unwrap();
        assert_eq!(config.model, FingerprintModel::Resnet50);
        assert_eq!(config.max_fingerprints, 200);
    }

    #[test]
    fn unknown_class_name_is_rejected() {
        let err = FingerprintCalculatorConfig::load(&json!({"class_name": "FingerprintAlexNet"}))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownVariant { .. }));
    }

    #[test]
    fn histogram_scores_sum_to_one() {
        let tile = Array3::from_shape_fn((4, 4, 3), |(r, _, _)| r as f32);
        let predictions = HistogramExtractor::new(4).predict(tile.view(), 10).unwrap();
        let total: f32 = predictions.iter().map(|p| p.score).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert_eq!(predictions.len(), 4);
    }

    #[test]
    fn histogram_calculator_runs_end_to_end() {
        let calc = calculator(3, Arc::new(HistogramExtractor::default()));
        let tile = ImageData::from_gray(Array2::from_shape_fn((16, 16), |(r, c)| (r * c) as f32))
            .unwrap();
        let predictions = calc.calculate(&tile).unwrap();
        assert!(!predictions.is_empty() && predictions.len() <= 3);
        assert!(predictions.windows(2).all(|w| w[0].score >= w[1].score));
    }
}
