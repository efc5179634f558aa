use std::path::{Path, PathBuf};

use skyprint_pipeline::PipelineError;

/// Errors that can occur reading or writing skyprint files.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// A file could not be opened, created or flushed.
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The raster decoder or encoder rejected the data.
    #[error("image codec failed: {0}")]
    Decode(#[from] image::ImageError),

    /// The file does not use a raster format this crate can decode.
    #[error("{path}: unsupported image format ({reason})")]
    Unsupported { path: PathBuf, reason: String },

    /// A JSON document could not be (de)serialized.
    #[error("JSON (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl IoError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
