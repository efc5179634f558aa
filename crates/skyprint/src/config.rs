//! Run configuration: everything `skyprint run` needs besides the file list.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skyprint_pipeline::{
    CutoutStrategy, FingerprintCalculatorConfig, FingerprintModel, PipelineError, ProcessingStep,
    SimilarityKind,
};

use crate::error::CliError;

/// Settings for one `skyprint run`.
///
/// Missing fields in a JSON document take their defaults, so a file may
/// contain only what differs, e.g. `{"similarity": {"similarity_type": "jaccard"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Applied in order to every image before cutouts are taken.
    pub data_processing: Vec<ProcessingStep>,
    pub cutout: CutoutStrategy,
    pub model: FingerprintModel,
    pub max_fingerprints: usize,
    /// `None` skips the similarity stage.
    pub similarity: Option<SimilarityKind>,
    /// Pool size for similarity; `0` runs it on the calling thread.
    pub workers: usize,
    pub poll_interval_ms: u64,
}

impl RunConfig {
    pub const DEFAULT_WORKERS: usize = 0;
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

    /// Read a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`CliError::Config`] if the file is unreadable or not a
    /// valid configuration.
    pub fn from_json_file(path: &Path) -> Result<Self, CliError> {
        let config_error = |reason: String| CliError::Config {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| config_error(e.to_string()))
    }

    /// Reject parameter values the pipeline would refuse later.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for the first bad value.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for step in &self.data_processing {
            step.validate()?;
        }
        self.cutout.validate()?;
        if self.max_fingerprints == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_fingerprints must be at least 1".to_string(),
            ));
        }
        if self.workers > 0 && self.poll_interval_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "poll_interval_ms must be positive when using workers".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_processing: Vec::new(),
            cutout: CutoutStrategy::default(),
            model: FingerprintModel::default(),
            max_fingerprints: FingerprintCalculatorConfig::DEFAULT_MAX_FINGERPRINTS,
            similarity: None,
            workers: Self::DEFAULT_WORKERS,
            poll_interval_ms: Self::DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_fills_defaults() {
        let config: RunConfig = serde_json::from_str(
            r#"{
                "data_processing": [{"processing_type": "zoom", "factor": 0.5}],
                "cutout": {"cutout_type": "blob", "output_size": 128},
                "similarity": {"similarity_type": "jaccard"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.data_processing, vec![ProcessingStep::Zoom { factor: 0.5 }]);
        assert_eq!(config.cutout, CutoutStrategy::blob(128));
        assert_eq!(
            config.similarity,
            Some(SimilarityKind::Jaccard {
                top_k: SimilarityKind::DEFAULT_TOP_K
            })
        );
        assert_eq!(config.workers, RunConfig::DEFAULT_WORKERS);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn default_round_trips() {
        let json = serde_json::to_string(&RunConfig::default()).unwrap();
        let back: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RunConfig::default());
    }

    #[test]
    fn validate_rejects_zero_fingerprints() {
        let config = RunConfig {
            max_fingerprints: 0,
            ..RunConfig::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_bad_cutout() {
        let config = RunConfig {
            cutout: CutoutStrategy::SlidingWindow {
                output_size: 64,
                step_size: 0,
            },
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unreadable_file_is_a_config_error() {
        let err = RunConfig::from_json_file(Path::new("/nonexistent/skyprint.json")).unwrap_err();
        assert!(matches!(err, CliError::Config { .. }));
    }
}
