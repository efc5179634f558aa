//! JSON files for saved records and similarity results.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use skyprint_pipeline::{SavedRecord, SimilarityResult};

use crate::error::IoError;

/// Write `records` as a pretty-printed JSON array.
///
/// # Errors
///
/// Returns [`IoError::Io`] if the file cannot be created or flushed.
pub fn write_records(path: &Path, records: &[SavedRecord]) -> Result<(), IoError> {
    write_json(path, records)?;
    tracing::info!(path = %path.display(), records = records.len(), "records written");
    Ok(())
}

/// Read a JSON array of saved records.
///
/// # Errors
///
/// Returns [`IoError::Io`] if the file cannot be opened and
/// [`IoError::Json`] if it is not a record array.
pub fn read_records(path: &Path) -> Result<Vec<SavedRecord>, IoError> {
    read_json(path)
}

/// Write one similarity result.
///
/// # Errors
///
/// Returns [`IoError::Io`] if the file cannot be created or flushed.
pub fn write_similarity(path: &Path, result: &SimilarityResult) -> Result<(), IoError> {
    write_json(path, result)?;
    tracing::info!(
        path = %path.display(),
        similarity = result.name(),
        fingerprints = result.len(),
        "similarity written",
    );
    Ok(())
}

/// Read a similarity result written by [`write_similarity`].
///
/// # Errors
///
/// Returns [`IoError::Io`] if the file cannot be opened and
/// [`IoError::Json`] if it is not a similarity result.
pub fn read_similarity(path: &Path) -> Result<SimilarityResult, IoError> {
    read_json(path)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), IoError> {
    let file = File::create(path).map_err(|e| IoError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|e| IoError::io(path, e))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, IoError> {
    let file = File::open(path).map_err(|e| IoError::io(path, e))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;
    use skyprint_pipeline::{Bounds, FingerprintRecord, Prediction, Query, SimilarityKind};
    use uuid::Uuid;

    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("skyprint-files-{}-{name}", std::process::id()))
    }

    fn fingerprint(col: usize, label: &str) -> FingerprintRecord {
        FingerprintRecord {
            image: Uuid::nil(),
            bounds: Bounds::new(0, 32, col, col + 32),
            predictions: vec![Prediction::new(label, label, 0.9)],
        }
    }

    #[test]
    fn records_round_trip() {
        let path = scratch("records.json");
        let records = vec![SavedRecord {
            uuid: Uuid::new_v4(),
            filename: "m101.png".to_string(),
            data_processing: vec![json!({"processing_type": "zoom", "factor": 0.5})],
            cutout_creator: json!({"cutout_type": "full_image", "output_size": 224, "uuid": Uuid::new_v4()}),
            fingerprint_calculator: json!({"class_name": "FingerprintResnet"}),
            fingerprints: vec![fingerprint(0, "spiral")],
        }];

        write_records(&path, &records).unwrap();
        let back = read_records(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(back, records);
    }

    #[test]
    fn similarity_round_trip_keeps_queries_working() {
        let path = scratch("similarity.json");
        let fingerprints = vec![
            fingerprint(0, "spiral"),
            fingerprint(32, "spiral"),
            fingerprint(64, "bar"),
        ];
        let result = SimilarityKind::Jaccard { top_k: 1 }
            .calculate(&fingerprints, &mut |_: f64| {})
            .unwrap();

        write_similarity(&path, &result).unwrap();
        let back = read_similarity(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(back.name(), "jaccard");
        assert_eq!(back.fingerprints(), result.fingerprints());
        let nearest = back.find_similar(Query::Fingerprint(0), 1).unwrap();
        assert_eq!(nearest[0].index, 1);
    }

    #[test]
    fn missing_file_names_the_path() {
        let path = scratch("absent.json");
        let err = read_records(&path).unwrap_err();
        assert!(matches!(&err, IoError::Io { path: p, .. } if *p == path));
    }

    #[test]
    fn wrong_document_is_a_json_error() {
        let path = scratch("wrong.json");
        std::fs::write(&path, "{\"not\": \"records\"}").unwrap();
        let err = read_records(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, IoError::Json(_)));
    }
}
