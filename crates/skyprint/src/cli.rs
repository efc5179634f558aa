//! Command-line arguments and their mapping onto [`RunConfig`].

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use skyprint_pipeline::tsne::TsneParams;
use skyprint_pipeline::{
    CutoutStrategy, FingerprintCalculatorConfig, FingerprintModel, ProcessingStep, Query,
    SimilarityKind,
};

use crate::config::RunConfig;
use crate::error::CliError;

/// Fingerprint cutouts of astronomical images and find similar regions.
#[derive(Parser)]
#[command(name = "skyprint", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Fingerprint images and optionally compute similarity.
    Run(RunArgs),
    /// Find the nearest neighbours in a saved similarity result.
    Query(QueryArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Input images (PNG, JPEG, TIFF, BMP, WebP).
    #[arg(required = true)]
    pub images: Vec<PathBuf>,

    /// Where to write the processed-image records.
    #[arg(long, default_value = "records.json")]
    pub records: PathBuf,

    /// Where to write the similarity result.
    #[arg(long, default_value = "similarity.json")]
    pub similarity_out: PathBuf,

    /// Median filter window size, applied first.
    #[arg(long)]
    pub median: Option<usize>,

    /// Zoom factor for both spatial axes, applied after the median filter.
    #[arg(long)]
    pub zoom: Option<f64>,

    /// Gaussian smoothing sigma, applied last.
    #[arg(long)]
    pub smooth: Option<f32>,

    /// Cutout strategy.
    #[arg(long, value_enum, default_value_t = Cutout::SlidingWindow)]
    pub cutout: Cutout,

    /// Cutout edge length in pixels.
    #[arg(long, default_value_t = CutoutStrategy::DEFAULT_OUTPUT_SIZE)]
    pub output_size: usize,

    /// Sliding-window stride in pixels.
    #[arg(long, default_value_t = CutoutStrategy::DEFAULT_STEP_SIZE)]
    pub step_size: usize,

    /// Blob threshold as a multiple of the smoothed image mean.
    #[arg(long, default_value_t = CutoutStrategy::DEFAULT_MEAN_THRESHOLD)]
    pub mean_threshold: f32,

    /// Blob smoothing sigma.
    #[arg(long, default_value_t = CutoutStrategy::DEFAULT_GAUSSIAN_SMOOTHING_SIGMA)]
    pub blob_sigma: f32,

    /// Padding around each blob in pixels.
    #[arg(long, default_value_t = CutoutStrategy::DEFAULT_LABEL_PADDING)]
    pub label_padding: usize,

    /// Fingerprint model.
    #[arg(long, value_enum, default_value_t = Model::Resnet50)]
    pub model: Model,

    /// Predictions kept per fingerprint.
    #[arg(long, default_value_t = FingerprintCalculatorConfig::DEFAULT_MAX_FINGERPRINTS)]
    pub max_fingerprints: usize,

    /// Similarity metric.
    #[arg(long, value_enum, default_value_t = Metric::None)]
    pub similarity: Metric,

    /// t-SNE perplexity.
    #[arg(long, default_value_t = TsneParams::DEFAULT_PERPLEXITY)]
    pub perplexity: f64,

    /// t-SNE iterations.
    #[arg(long, default_value_t = TsneParams::DEFAULT_ITERATIONS)]
    pub iterations: usize,

    /// Labels per fingerprint compared by Jaccard.
    #[arg(long, default_value_t = SimilarityKind::DEFAULT_TOP_K)]
    pub top_k: usize,

    /// Worker threads for similarity (0 = run on the main thread).
    #[arg(long, default_value_t = RunConfig::DEFAULT_WORKERS)]
    pub workers: usize,

    /// Milliseconds between worker polls.
    #[arg(long, default_value_t = RunConfig::DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,

    /// Full run configuration as a JSON file.
    ///
    /// When provided, all other configuration flags are ignored.
    #[arg(long)]
    pub config_json: Option<PathBuf>,
}

#[derive(Args)]
pub struct QueryArgs {
    /// Similarity result written by `skyprint run`.
    #[arg(long, default_value = "similarity.json")]
    pub similarity: PathBuf,

    /// Query by fingerprint index.
    #[arg(long, conflicts_with = "point", required_unless_present = "point")]
    pub index: Option<usize>,

    /// Query by embedding coordinates (t-SNE results only).
    #[arg(long, num_args = 2, value_names = ["X", "Y"], allow_negative_numbers = true)]
    pub point: Option<Vec<f64>>,

    /// Number of neighbours.
    #[arg(short = 'k', long, default_value_t = 5)]
    pub neighbors: usize,

    /// Records file, used to re-load images for `--export-dir`.
    #[arg(long, requires = "export_dir")]
    pub records: Option<PathBuf>,

    /// Write each neighbour's cutout as a PNG into this directory.
    #[arg(long, requires = "records")]
    pub export_dir: Option<PathBuf>,

    /// Print neighbours as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
pub enum Cutout {
    /// Overlapping square tiles on a regular grid.
    SlidingWindow,
    /// The whole image resized to one tile.
    FullImage,
    /// One tile around each bright connected region.
    Blob,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
pub enum Model {
    Resnet50,
    Vgg16,
    Vgg19,
    InceptionV3,
    InceptionResnetV2,
}

impl From<Model> for FingerprintModel {
    fn from(model: Model) -> Self {
        match model {
            Model::Resnet50 => Self::Resnet50,
            Model::Vgg16 => Self::Vgg16,
            Model::Vgg19 => Self::Vgg19,
            Model::InceptionV3 => Self::InceptionV3,
            Model::InceptionResnetV2 => Self::InceptionResnetV2,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
pub enum Metric {
    /// Skip the similarity stage.
    None,
    Tsne,
    Jaccard,
    Distance,
}

impl RunArgs {
    /// Build a [`RunConfig`] from the flags, or from `--config-json`.
    ///
    /// # Errors
    ///
    /// Returns [`CliError::Config`] if the JSON file is unusable.
    pub fn config(&self) -> Result<RunConfig, CliError> {
        if let Some(path) = &self.config_json {
            return RunConfig::from_json_file(path);
        }

        let mut data_processing = Vec::new();
        if let Some(size) = self.median {
            data_processing.push(ProcessingStep::MedianFilter { size });
        }
        if let Some(factor) = self.zoom {
            data_processing.push(ProcessingStep::Zoom { factor });
        }
        if let Some(sigma) = self.smooth {
            data_processing.push(ProcessingStep::GaussianSmooth { sigma });
        }

        let cutout = match self.cutout {
            Cutout::SlidingWindow => CutoutStrategy::SlidingWindow {
                output_size: self.output_size,
                step_size: self.step_size,
            },
            Cutout::FullImage => CutoutStrategy::FullImage {
                output_size: self.output_size,
            },
            Cutout::Blob => CutoutStrategy::Blob {
                output_size: self.output_size,
                mean_threshold: self.mean_threshold,
                gaussian_smoothing_sigma: self.blob_sigma,
                label_padding: self.label_padding,
            },
        };

        let similarity = match self.similarity {
            Metric::None => None,
            Metric::Tsne => Some(SimilarityKind::Tsne {
                perplexity: self.perplexity,
                iterations: self.iterations,
            }),
            Metric::Jaccard => Some(SimilarityKind::Jaccard { top_k: self.top_k }),
            Metric::Distance => Some(SimilarityKind::Distance),
        };

        Ok(RunConfig {
            data_processing,
            cutout,
            model: self.model.into(),
            max_fingerprints: self.max_fingerprints,
            similarity,
            workers: self.workers,
            poll_interval_ms: self.poll_interval_ms,
        })
    }
}

impl QueryArgs {
    #[must_use]
    pub fn query(&self) -> Query {
        match (&self.point, self.index) {
            (Some(xy), _) if xy.len() == 2 => Query::Point([xy[0], xy[1]]),
            (_, Some(index)) => Query::Fingerprint(index),
            _ => Query::Fingerprint(0),
        }
    }
}
