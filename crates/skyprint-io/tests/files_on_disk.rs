//! Process a PNG from disk, persist the record, restore it from the file.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use image::{GrayImage, Luma};
use skyprint_io::{FileImageLoader, read_records, write_png, write_records};
use skyprint_pipeline::{
    CutoutGenerator, CutoutStrategy, FingerprintCalculator, FingerprintCalculatorConfig,
    FingerprintModel, GeneratorRegistry, HistogramExtractor, ProcessedImageRecord, process,
};

#[test]
fn record_file_restores_against_the_same_image() {
    let dir = std::env::temp_dir().join(format!("skyprint-io-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let image_path = dir.join("field.png");
    GrayImage::from_fn(96, 64, |x, y| {
        if (x / 12 + y / 12) % 2 == 0 { Luma([220]) } else { Luma([15]) }
    })
    .save(&image_path)
    .unwrap();

    let generator = Arc::new(
        CutoutGenerator::new(CutoutStrategy::SlidingWindow {
            output_size: 32,
            step_size: 32,
        })
        .unwrap(),
    );
    let calculator = FingerprintCalculator::new(
        FingerprintCalculatorConfig::new(FingerprintModel::Resnet50, 5),
        Arc::new(HistogramExtractor::default()),
    );
    let record = process(
        image_path.to_str().unwrap(),
        Vec::new(),
        &generator,
        &calculator,
        &FileImageLoader,
    )
    .unwrap();
    // 64 rows -> anchor 16; 96 cols -> anchors 16, 48.
    assert_eq!(record.fingerprints().len(), 2);
    assert_eq!(record.processed().shape(), [64, 96, 3]);

    let records_path = dir.join("records.json");
    write_records(&records_path, &[record.save().unwrap()]).unwrap();
    let saved = read_records(&records_path).unwrap();
    assert_eq!(saved.len(), 1);

    let registry = GeneratorRegistry::new();
    let restored = ProcessedImageRecord::load(&saved[0], &FileImageLoader, &registry).unwrap();
    assert_eq!(restored.fingerprints(), record.fingerprints());
    assert_eq!(restored.processed(), record.processed());

    let tile = restored.display(record.fingerprints()[1].bounds).unwrap();
    let tile_path = dir.join("tile.png");
    write_png(&tile_path, &tile).unwrap();
    let reread = image::open(&tile_path).unwrap();
    assert_eq!((reread.width(), reread.height()), (32, 32));

    std::fs::remove_dir_all(&dir).unwrap();
}
