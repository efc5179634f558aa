//! skyprint-io: the filesystem side of skyprint.
//!
//! Provides the default [`ImageLoader`](skyprint_pipeline::ImageLoader)
//! for raster files, JSON files for saved records and similarity results,
//! and PNG export of cutouts.

pub mod error;
pub mod files;
pub mod loader;
pub mod raster;

pub use error::IoError;
pub use files::{read_records, read_similarity, write_records, write_similarity};
pub use loader::{FileImageLoader, image_data};
pub use raster::{encode_png, write_png};
