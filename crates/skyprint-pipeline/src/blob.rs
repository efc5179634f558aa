//! Connected-component ("blob") segmentation for blob cutouts.
//!
//! The image is collapsed to luminance, smoothed, thresholded against a
//! multiple of its mean and labelled with 8-connectivity. Each label's
//! bounding box is padded, squared and bounds-checked to produce the
//! regions the blob cutout strategy resamples.
//!
//! Squaring moves the far edge of the shorter side out until both sides
//! match. Boxes are not re-centred, so a square can end up past the
//! bottom or right edge of the image; those boxes are dropped.

use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use ndarray::Array2;

use crate::blur::{gaussian_smooth, pixel_extent};
use crate::grayscale::luminance;
use crate::types::{Bounds, ImageData, PipelineError};

/// Parameters shared by labelling and box extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlobParams {
    pub mean_threshold: f32,
    pub gaussian_smoothing_sigma: f32,
    pub label_padding: usize,
}

/// Labelled blob mask.
#[derive(Debug, Clone)]
pub struct BlobLabels {
    labels: Array2<u32>,
    count: u32,
}

impl BlobLabels {
    /// Label image, 0 for background and `1..=count` for blobs.
    #[must_use]
    pub const fn labels(&self) -> &Array2<u32> {
        &self.labels
    }

    /// Number of distinct blobs.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }
}

/// Smooth, threshold and label the image.
///
/// # Errors
///
/// Returns [`PipelineError::Shape`] for 2-channel images or images too
/// large for `u32` pixel addressing.
pub fn label_blobs(image: &ImageData, params: &BlobParams) -> Result<BlobLabels, PipelineError> {
    let gray = luminance(image)?;
    let smoothed = gaussian_smooth(&gray, params.gaussian_smoothing_sigma)?;

    #[allow(clippy::cast_precision_loss)]
    let mean = smoothed.iter().map(|&v| f64::from(v)).sum::<f64>() / smoothed.len() as f64;
    let threshold = f64::from(params.mean_threshold) * mean;

    let (rows, cols) = smoothed.dim();
    let shape = image.shape();
    let (width, height) = (pixel_extent(cols, &shape)?, pixel_extent(rows, &shape)?);
    #[allow(clippy::cast_possible_truncation)]
    let mask = GrayImage::from_fn(width, height, |x, y| {
        let v = f64::from(smoothed[[y as usize, x as usize]]);
        Luma([if v > threshold { 255 } else { 0 }])
    });

    let labelled = connected_components(&mask, Connectivity::Eight, Luma([0u8]));
    let mut count = 0;
    #[allow(clippy::cast_possible_truncation)]
    let labels = Array2::from_shape_fn((rows, cols), |(r, c)| {
        let label = labelled.get_pixel(c as u32, r as u32).0[0];
        count = count.max(label);
        label
    });

    tracing::debug!(count, threshold, "labelled blobs");
    Ok(BlobLabels { labels, count })
}

/// Padded, squared bounding boxes for every blob that fits in the image.
///
/// Boxes are returned in label order.
///
/// # Errors
///
/// Propagates [`label_blobs`] errors.
pub fn blob_boxes(image: &ImageData, params: &BlobParams) -> Result<Vec<Bounds>, PipelineError> {
    let labelled = label_blobs(image, params)?;
    let (nrows, ncols) = (image.rows(), image.cols());

    let mut extents: Vec<Option<Bounds>> = vec![None; labelled.count as usize];
    for ((r, c), &label) in labelled.labels.indexed_iter() {
        if label == 0 {
            continue;
        }
        let slot = &mut extents[label as usize - 1];
        // Inclusive max pixel, converted to exclusive bounds below.
        *slot = Some(match *slot {
            None => Bounds::new(r, r, c, c),
            Some(b) => Bounds::new(b.row_min.min(r), b.row_max.max(r), b.col_min.min(c), b.col_max.max(c)),
        });
    }

    let mut boxes = Vec::with_capacity(extents.len());
    for (index, extent) in extents.into_iter().enumerate() {
        let Some(extent) = extent else { continue };
        tracing::debug!(label = index + 1, %extent, "blob extent");

        let padded = pad(extent, params.label_padding, nrows, ncols);
        let squared = square(padded);
        if squared.row_max > nrows || squared.col_max > ncols {
            tracing::warn!(label = index + 1, bounds = %squared, "dropping blob outside image");
            continue;
        }
        boxes.push(squared);
    }
    Ok(boxes)
}

/// Grow an inclusive pixel extent by `padding`, clamped to the image, and
/// convert to half-open bounds.
const fn pad(extent: Bounds, padding: usize, nrows: usize, ncols: usize) -> Bounds {
    let row_max = extent.row_max + 1 + padding;
    let col_max = extent.col_max + 1 + padding;
    Bounds::new(
        extent.row_min.saturating_sub(padding),
        if row_max < nrows { row_max } else { nrows },
        extent.col_min.saturating_sub(padding),
        if col_max < ncols { col_max } else { ncols },
    )
}

/// Extend the far edge of the shorter side so the box is square.
const fn square(b: Bounds) -> Bounds {
    let (h, w) = (b.height(), b.width());
    if h > w {
        Bounds::new(b.row_min, b.row_max, b.col_min, b.col_min + h)
    } else {
        Bounds::new(b.row_min, b.row_min + w, b.col_min, b.col_max)
    }
}
