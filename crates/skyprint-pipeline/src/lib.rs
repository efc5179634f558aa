//! skyprint-pipeline: cutout fingerprints and similarity (sans-IO).
//!
//! Turns large astronomical images into searchable fingerprints through:
//! load -> data processing -> cutout generation -> fingerprinting ->
//! similarity.
//!
//! This crate has **no filesystem dependencies** -- pixels arrive through
//! the [`ImageLoader`] trait and configurations leave as JSON values.
//! Reading files lives in `skyprint-io`; running similarity on a worker
//! pool lives in `skyprint-worker`.

pub mod blob;
pub mod blur;
pub mod cutout;
pub mod fingerprint;
pub mod grayscale;
pub mod processing;
pub mod record;
pub mod registry;
pub mod resample;
pub mod similarity;
pub mod tsne;
pub mod types;
pub mod variant;

use std::sync::Arc;

pub use cutout::{CutoutGenerator, CutoutSource, CutoutStrategy, Cutouts};
pub use fingerprint::{
    ExtractorFactory, FeatureExtractor, FingerprintCalculator, FingerprintCalculatorConfig,
    FingerprintModel, HistogramExtractor,
};
pub use processing::ProcessingStep;
pub use record::{ImageLoader, ProcessedImageRecord, SavedRecord};
pub use registry::GeneratorRegistry;
pub use similarity::{Neighbor, Query, SimilarityKind, SimilarityResult};
pub use types::{
    Bounds, Cutout, FingerprintRecord, FingerprintRef, ImageData, ImageProvenance, PipelineError,
    Prediction,
};

/// Load, process and fingerprint one image.
///
/// # Steps
///
/// 1. Load `filename` through `loader` (non-finite pixels zeroed)
/// 2. Apply `data_processing` in order
/// 3. Promote single-channel data to RGB
/// 4. Generate cutouts with `generator`
/// 5. Fingerprint each cutout with `calculator`
///
/// # Errors
///
/// Returns [`PipelineError::SourceUnavailable`] if the image cannot be
/// loaded, and propagates processing, cutout and calculator errors.
pub fn process(
    filename: &str,
    data_processing: Vec<ProcessingStep>,
    generator: &Arc<CutoutGenerator>,
    calculator: &FingerprintCalculator,
    loader: &dyn ImageLoader,
) -> Result<ProcessedImageRecord, PipelineError> {
    let mut record = ProcessedImageRecord::new(filename, data_processing, loader)?;
    record.calculate(generator, calculator)?;
    Ok(record)
}

/// Collect the fingerprints of several records in record order.
#[must_use]
pub fn collect_fingerprints(records: &[ProcessedImageRecord]) -> Vec<FingerprintRecord> {
    records
        .iter()
        .flat_map(|r| r.fingerprints().iter().cloned())
        .collect()
}
