//! The work behind each subcommand, free of argument parsing and printing.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use skyprint_io::{FileImageLoader, read_records, read_similarity, write_png, write_records, write_similarity};
use skyprint_pipeline::{
    CutoutGenerator, FingerprintCalculator, FingerprintCalculatorConfig, FingerprintRecord,
    GeneratorRegistry, HistogramExtractor, Neighbor, ProcessedImageRecord, Query, SimilarityKind,
    SimilarityResult, collect_fingerprints, process,
};
use skyprint_worker::{LocalWorkerPool, TaskCoordinator, run_similarity_local};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::error::CliError;

/// What a finished `run` produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub images: usize,
    pub fingerprints: usize,
    pub similarity: Option<&'static str>,
}

/// Fingerprint `images`, write their records, and run the similarity
/// stage when configured.
///
/// # Errors
///
/// Stops at the first image that fails to load or process.
pub fn run(
    images: &[PathBuf],
    config: &RunConfig,
    records_path: &Path,
    similarity_path: &Path,
) -> Result<RunSummary, CliError> {
    config.validate()?;

    let generator = GeneratorRegistry::global().register(CutoutGenerator::new(config.cutout)?);
    let calculator = FingerprintCalculator::new(
        FingerprintCalculatorConfig::new(config.model, config.max_fingerprints),
        Arc::new(HistogramExtractor::default()),
    );
    tracing::info!(%generator, %calculator, images = images.len(), "starting run");

    let mut records = Vec::with_capacity(images.len());
    for path in images {
        let filename = path
            .to_str()
            .ok_or_else(|| CliError::Usage(format!("path is not valid UTF-8: {}", path.display())))?;
        let record = process(
            filename,
            config.data_processing.clone(),
            &generator,
            &calculator,
            &FileImageLoader,
        )?;
        tracing::info!(filename, fingerprints = record.fingerprints().len(), "image fingerprinted");
        records.push(record);
    }

    let saved = records
        .iter()
        .map(ProcessedImageRecord::save)
        .collect::<Result<Vec<_>, _>>()?;
    write_records(records_path, &saved)?;

    let fingerprints = collect_fingerprints(&records);
    let similarity = match config.similarity {
        Some(kind) => {
            let result = similarity(config, &fingerprints, kind)?;
            write_similarity(similarity_path, &result)?;
            Some(result.name())
        }
        None => None,
    };

    Ok(RunSummary {
        images: records.len(),
        fingerprints: fingerprints.len(),
        similarity,
    })
}

fn similarity(
    config: &RunConfig,
    fingerprints: &[FingerprintRecord],
    kind: SimilarityKind,
) -> Result<SimilarityResult, CliError> {
    if config.workers == 0 {
        return Ok(run_similarity_local(fingerprints, kind)?);
    }

    let pool = LocalWorkerPool::new(config.workers)?;
    let coordinator = TaskCoordinator::new(&pool).with_poll_interval(config.poll_interval());
    let mut last_decile = None;
    let result = coordinator.run_similarity_with(
        fingerprints,
        kind,
        &AtomicBool::new(false),
        &mut |fraction: f64| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let decile = (fraction * 10.0).floor() as u8;
            if last_decile != Some(decile) {
                last_decile = Some(decile);
                tracing::info!(percent = (fraction * 100.0).round(), "similarity progress");
            }
        },
    )?;
    Ok(result)
}

/// Answer `query` against a saved similarity result, optionally writing
/// each neighbour's cutout to `export`'s directory.
///
/// # Errors
///
/// Fails if the result cannot be read, the query does not fit the
/// result, or an exported image cannot be re-loaded.
pub fn query(
    similarity_path: &Path,
    query: Query,
    neighbors: usize,
    export: Option<(&Path, &Path)>,
) -> Result<Vec<Neighbor>, CliError> {
    let result = read_similarity(similarity_path)?;
    tracing::info!(similarity = result.name(), fingerprints = result.len(), ?query, "querying");
    let found = result.find_similar(query, neighbors)?;

    if let Some((records_path, export_dir)) = export {
        export_cutouts(&found, records_path, export_dir)?;
    }
    Ok(found)
}

fn export_cutouts(found: &[Neighbor], records_path: &Path, export_dir: &Path) -> Result<(), CliError> {
    std::fs::create_dir_all(export_dir).map_err(|source| CliError::Filesystem {
        path: export_dir.to_path_buf(),
        source,
    })?;

    let saved: HashMap<Uuid, _> = read_records(records_path)?
        .into_iter()
        .map(|record| (record.uuid, record))
        .collect();
    let registry = GeneratorRegistry::new();
    let mut loaded: HashMap<Uuid, ProcessedImageRecord> = HashMap::new();

    for (rank, neighbor) in found.iter().enumerate() {
        let image = neighbor.fingerprint.image;
        let Some(saved_record) = saved.get(&image) else {
            tracing::warn!(%image, index = neighbor.index, "no record for neighbour, skipping export");
            continue;
        };
        let record = match loaded.entry(image) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                e.insert(ProcessedImageRecord::load(saved_record, &FileImageLoader, &registry)?)
            }
        };
        let tile = record.display(neighbor.fingerprint.bounds)?;
        let path = export_dir.join(format!("{rank:02}-{}.png", neighbor.index));
        write_png(&path, &tile)?;
    }
    tracing::info!(dir = %export_dir.display(), cutouts = found.len(), "cutouts exported");
    Ok(())
}
