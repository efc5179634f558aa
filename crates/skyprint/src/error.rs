use std::path::PathBuf;

use skyprint_io::IoError;
use skyprint_pipeline::PipelineError;
use skyprint_worker::WorkerError;

/// Everything a CLI command can fail with.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// `--config-json` could not be read or parsed.
    #[error("invalid run configuration {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// Arguments are individually valid but unusable together.
    #[error("{0}")]
    Usage(String),

    /// An output directory could not be created.
    #[error("{path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}
