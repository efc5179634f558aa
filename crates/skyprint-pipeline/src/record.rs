//! One source image, its processed pixels and its fingerprints.
//!
//! A [`ProcessedImageRecord`] loads a file through an [`ImageLoader`],
//! runs the data processing chain, and on [`calculate`] fingerprints
//! every cutout. [`save`] captures configuration and results only; the
//! pixels are rebuilt on [`load`] by replaying loader and processing
//! against the recorded filename.
//!
//! [`calculate`]: ProcessedImageRecord::calculate
//! [`save`]: ProcessedImageRecord::save
//! [`load`]: ProcessedImageRecord::load

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cutout::{CutoutGenerator, CutoutSource};
use crate::fingerprint::{FingerprintCalculator, FingerprintCalculatorConfig};
use crate::grayscale::to_rgb;
use crate::processing::{ProcessingStep, apply_steps};
use crate::registry::GeneratorRegistry;
use crate::types::{Bounds, FingerprintRecord, ImageData, ImageProvenance, PipelineError};

/// Reads pixels and provenance for a path.
pub trait ImageLoader {
    /// # Errors
    ///
    /// Returns [`PipelineError::SourceUnavailable`] for missing, unreadable
    /// or unsupported files.
    fn load(&self, path: &str) -> Result<(ImageData, ImageProvenance), PipelineError>;
}

/// Persisted form of a [`ProcessedImageRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedRecord {
    pub uuid: Uuid,
    pub filename: String,
    pub data_processing: Vec<Value>,
    pub cutout_creator: Value,
    pub fingerprint_calculator: Value,
    pub fingerprints: Vec<FingerprintRecord>,
}

#[derive(Debug, Clone)]
pub struct ProcessedImageRecord {
    uuid: Uuid,
    filename: String,
    provenance: ImageProvenance,
    data_processing: Vec<ProcessingStep>,
    processed: ImageData,
    cutout_creator: Option<Arc<CutoutGenerator>>,
    fingerprint_calculator: Option<FingerprintCalculatorConfig>,
    fingerprints: Vec<FingerprintRecord>,
}

impl ProcessedImageRecord {
    /// Load `filename` and apply `data_processing` in order.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SourceUnavailable`] if the loader fails,
    /// or the first processing error.
    pub fn new(
        filename: &str,
        data_processing: Vec<ProcessingStep>,
        loader: &dyn ImageLoader,
    ) -> Result<Self, PipelineError> {
        let (image, provenance) = load_source(filename, loader)?;
        Self::from_image(image, provenance, data_processing)
    }

    /// Build a record from pixels already in memory.
    ///
    /// Non-finite pixels are zeroed before processing, and a
    /// single-channel result is promoted to RGB.
    ///
    /// # Errors
    ///
    /// Propagates processing errors.
    pub fn from_image(
        image: ImageData,
        provenance: ImageProvenance,
        data_processing: Vec<ProcessingStep>,
    ) -> Result<Self, PipelineError> {
        let processed = prepare(image, &data_processing)?;
        Ok(Self {
            uuid: Uuid::new_v4(),
            filename: provenance.filename.clone(),
            provenance,
            data_processing,
            processed,
            cutout_creator: None,
            fingerprint_calculator: None,
            fingerprints: Vec::new(),
        })
    }

    /// Fingerprint every cutout, replacing earlier results.
    ///
    /// On error no fingerprints are kept and the previous generator and
    /// calculator settings are cleared.
    ///
    /// # Errors
    ///
    /// Propagates cutout and calculator errors.
    pub fn calculate(
        &mut self,
        generator: &Arc<CutoutGenerator>,
        calculator: &FingerprintCalculator,
    ) -> Result<(), PipelineError> {
        tracing::info!(
            file = %self.filename,
            cutouts = %generator,
            calculator = %calculator,
            "calculating fingerprints",
        );
        self.fingerprints.clear();
        self.cutout_creator = None;
        self.fingerprint_calculator = None;

        let fingerprints = self.fingerprint_all(generator, calculator)?;

        tracing::info!(file = %self.filename, count = fingerprints.len(), "fingerprints ready");
        self.fingerprints = fingerprints;
        self.cutout_creator = Some(Arc::clone(generator));
        self.fingerprint_calculator = Some(*calculator.config());
        Ok(())
    }

    fn fingerprint_all(
        &self,
        generator: &CutoutGenerator,
        calculator: &FingerprintCalculator,
    ) -> Result<Vec<FingerprintRecord>, PipelineError> {
        let mut fingerprints = Vec::new();
        for (index, cutout) in generator.create_cutouts(&self.processed)?.enumerate() {
            let cutout = cutout?;
            tracing::debug!(index, bounds = %cutout.bounds, "fingerprinting cutout");
            fingerprints.push(FingerprintRecord {
                image: self.uuid,
                bounds: cutout.bounds,
                predictions: calculator.calculate(&cutout.tile)?,
            });
        }
        Ok(fingerprints)
    }

    /// Capture configuration and results.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if [`calculate`](Self::calculate)
    /// has not completed, or a serialization error.
    pub fn save(&self) -> Result<SavedRecord, PipelineError> {
        let (Some(generator), Some(calculator)) = (&self.cutout_creator, &self.fingerprint_calculator)
        else {
            return Err(PipelineError::InvalidConfig(format!(
                "record for {:?} has no fingerprints to save; run calculate first",
                self.filename
            )));
        };
        Ok(SavedRecord {
            uuid: self.uuid,
            filename: self.filename.clone(),
            data_processing: self
                .data_processing
                .iter()
                .map(ProcessingStep::save)
                .collect::<Result<_, _>>()?,
            cutout_creator: generator.save()?,
            fingerprint_calculator: calculator.save()?,
            fingerprints: self.fingerprints.clone(),
        })
    }

    /// Restore a saved record and rebuild its pixels.
    ///
    /// Variant tags are checked before the source image is touched. The
    /// cutout generator is shared with any live instance of the same uuid
    /// in `registry`. Fingerprints are taken from `saved`, not recomputed.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownVariant`] for unknown tags and
    /// [`PipelineError::SourceUnavailable`] when the file cannot be re-read.
    pub fn load(
        saved: &SavedRecord,
        loader: &dyn ImageLoader,
        registry: &GeneratorRegistry,
    ) -> Result<Self, PipelineError> {
        let data_processing = saved
            .data_processing
            .iter()
            .map(ProcessingStep::load)
            .collect::<Result<Vec<_>, _>>()?;
        let calculator = FingerprintCalculatorConfig::load(&saved.fingerprint_calculator)?;
        let generator = registry.resolve(&saved.cutout_creator)?;

        let (image, provenance) = load_source(&saved.filename, loader)?;
        let processed = prepare(image, &data_processing)?;

        let fingerprints = saved
            .fingerprints
            .iter()
            .cloned()
            .map(|mut fp| {
                fp.image = saved.uuid;
                fp
            })
            .collect();

        Ok(Self {
            uuid: saved.uuid,
            filename: saved.filename.clone(),
            provenance,
            data_processing,
            processed,
            cutout_creator: Some(generator),
            fingerprint_calculator: Some(calculator),
            fingerprints,
        })
    }

    /// Processed pixels inside `bounds`, clipped to the image.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Shape`] if nothing of `bounds` overlaps
    /// the image.
    pub fn display(&self, bounds: Bounds) -> Result<ImageData, PipelineError> {
        let (rows, cols) = (self.processed.rows(), self.processed.cols());
        let clipped = Bounds::new(
            bounds.row_min.min(rows),
            bounds.row_max.min(rows),
            bounds.col_min.min(cols),
            bounds.col_max.min(cols),
        );
        self.processed.region(clipped)
    }

    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    #[must_use]
    pub const fn provenance(&self) -> &ImageProvenance {
        &self.provenance
    }

    #[must_use]
    pub fn data_processing(&self) -> &[ProcessingStep] {
        &self.data_processing
    }

    #[must_use]
    pub const fn processed(&self) -> &ImageData {
        &self.processed
    }

    #[must_use]
    pub const fn cutout_creator(&self) -> Option<&Arc<CutoutGenerator>> {
        self.cutout_creator.as_ref()
    }

    #[must_use]
    pub const fn fingerprint_calculator(&self) -> Option<&FingerprintCalculatorConfig> {
        self.fingerprint_calculator.as_ref()
    }

    #[must_use]
    pub fn fingerprints(&self) -> &[FingerprintRecord] {
        &self.fingerprints
    }
}

fn load_source(
    path: &str,
    loader: &dyn ImageLoader,
) -> Result<(ImageData, ImageProvenance), PipelineError> {
    loader.load(path).map_err(|e| match e {
        PipelineError::SourceUnavailable { .. } => e,
        other => PipelineError::SourceUnavailable {
            path: path.to_string(),
            reason: other.to_string(),
        },
    })
}

fn prepare(image: ImageData, steps: &[ProcessingStep]) -> Result<ImageData, PipelineError> {
    let mut pixels = image.into_pixels();
    pixels.mapv_inplace(|v| if v.is_finite() { v } else { 0.0 });
    let processed = apply_steps(ImageData::new(pixels)?, steps)?;
    if processed.channels() == 1 {
        to_rgb(&processed)
    } else {
        Ok(processed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ndarray::{Array2, Array3, ArrayView3};
    use serde_json::json;

    use super::*;
    use crate::cutout::CutoutStrategy;
    use crate::fingerprint::{FeatureExtractor, FingerprintModel, HistogramExtractor};
    use crate::types::Prediction;

    struct Synthetic;

    impl ImageLoader for Synthetic {
        fn load(&self, path: &str) -> Result<(ImageData, ImageProvenance), PipelineError> {
            if path.starts_with("missing") {
                return Err(PipelineError::SourceUnavailable {
                    path: path.to_string(),
                    reason: "no such file".to_string(),
                });
            }
            let mut plane = Array2::from_shape_fn((64, 64), |(r, c)| ((r + c) % 17) as f32);
            plane[[0, 0]] = f32::NAN;
            let provenance = ImageProvenance {
                filename: path.to_string(),
                ..ImageProvenance::default()
            };
            Ok((ImageData::from_gray(plane).unwrap(), provenance))
        }
    }

    struct Failing;

    impl FeatureExtractor for Failing {
        fn predict(
            &self,
            _input: ArrayView3<'_, f32>,
            _top: usize,
        ) -> Result<Vec<Prediction>, PipelineError> {
            Err(PipelineError::Extractor("model offline".to_string()))
        }
    }

    fn window() -> Arc<CutoutGenerator> {
        Arc::new(
            CutoutGenerator::new(CutoutStrategy::SlidingWindow {
                output_size: 32,
                step_size: 16,
            })
            .unwrap(),
        )
    }

    fn histogram() -> FingerprintCalculator {
        FingerprintCalculator::new(
            FingerprintCalculatorConfig::new(FingerprintModel::Resnet50, 5),
            Arc::new(HistogramExtractor::default()),
        )
    }

    #[test]
    fn new_sanitizes_and_promotes_to_rgb() {
        let record = ProcessedImageRecord::new("sky.png", Vec::new(), &Synthetic).unwrap();
        assert_eq!(record.processed().shape(), [64, 64, 3]);
        assert!(record.processed().pixels().iter().all(|v| v.is_finite()));
        assert_eq!(record.filename(), "sky.png");
    }

    #[test]
    fn calculate_records_one_fingerprint_per_cutout() {
        let mut record = ProcessedImageRecord::new("sky.png", Vec::new(), &Synthetic).unwrap();
        let generator = window();
        record.calculate(&generator, &histogram()).unwrap();
        // anchors 16, 32 (48 is excluded) on each axis
        assert_eq!(record.fingerprints().len(), 4);
        assert!(record.fingerprints().iter().all(|fp| fp.image == record.uuid()));
    }

    #[test]
    fn failed_calculation_leaves_no_fingerprints() {
        let mut record = ProcessedImageRecord::new("sky.png", Vec::new(), &Synthetic).unwrap();
        let generator = window();
        record.calculate(&generator, &histogram()).unwrap();
        let failing = FingerprintCalculator::new(
            FingerprintCalculatorConfig::default(),
            Arc::new(Failing),
        );
        assert!(record.calculate(&generator, &failing).is_err());
        assert!(record.fingerprints().is_empty());
        assert!(matches!(record.save(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn save_before_calculate_is_rejected() {
        let record = ProcessedImageRecord::new("sky.png", Vec::new(), &Synthetic).unwrap();
        assert!(matches!(record.save(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn save_load_restores_configuration() {
        let steps = vec![ProcessingStep::MedianFilter { size: 3 }];
        let mut record = ProcessedImageRecord::new("sky.png", steps.clone(), &Synthetic).unwrap();
        let generator = window();
        let calculator = histogram();
        record.calculate(&generator, &calculator).unwrap();

        let saved = record.save().unwrap();
        let registry = GeneratorRegistry::new();
        let restored = ProcessedImageRecord::load(&saved, &Synthetic, &registry).unwrap();

        assert_eq!(restored.uuid(), record.uuid());
        assert_eq!(restored.data_processing(), steps.as_slice());
        assert_eq!(**restored.cutout_creator().unwrap(), *generator);
        assert_eq!(restored.fingerprint_calculator(), Some(calculator.config()));
        assert_eq!(restored.fingerprints(), record.fingerprints());
        assert_eq!(restored.processed(), record.processed());
    }

    #[test]
    fn unknown_variant_is_reported_before_touching_the_source() {
        let mut record = ProcessedImageRecord::new("sky.png", Vec::new(), &Synthetic).unwrap();
        record.calculate(&window(), &histogram()).unwrap();
        let mut saved = record.save().unwrap();
        saved.filename = "missing.png".to_string();
        saved.cutout_creator = json!({"cutout_type": "spiral", "uuid": Uuid::nil()});
        let err = ProcessedImageRecord::load(&saved, &Synthetic, &GeneratorRegistry::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownVariant { .. }));
    }

    #[test]
    fn missing_source_is_source_unavailable() {
        let mut record = ProcessedImageRecord::new("sky.png", Vec::new(), &Synthetic).unwrap();
        record.calculate(&window(), &histogram()).unwrap();
        let mut saved = record.save().unwrap();
        saved.filename = "missing.png".to_string();
        let err = ProcessedImageRecord::load(&saved, &Synthetic, &GeneratorRegistry::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    }

    #[test]
    fn display_clips_to_the_image() {
        let image = ImageData::new(Array3::from_elem((10, 10, 3), 1.0)).unwrap();
        let record =
            ProcessedImageRecord::from_image(image, ImageProvenance::default(), Vec::new()).unwrap();
        let view = record.display(Bounds::new(5, 50, 0, 4)).unwrap();
        assert_eq!(view.shape(), [5, 4, 3]);
    }
}
