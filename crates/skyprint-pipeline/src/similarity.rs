//! Similarity engines over fingerprints.
//!
//! [`SimilarityKind`] selects the metric and its parameters;
//! [`SimilarityKind::calculate`] fits it to a set of fingerprints and
//! returns a [`SimilarityResult`] that answers nearest-neighbour queries
//! through [`SimilarityResult::find_similar`].
//!
//! Results keep only fingerprint references (owning image uuid plus
//! bounds), not the predictions, so they stay small when persisted or
//! sent across the worker boundary.

use std::collections::{HashMap, HashSet};
use std::fmt;

use rstar::RTree;
use rstar::primitives::GeomWithData;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tsne::{TsneParams, embed};
use crate::types::{FingerprintRecord, FingerprintRef, PipelineError};
use crate::variant::load_variant;

/// Selects a similarity metric.
///
/// Serialized with a `similarity_type` tag, e.g.
/// `{"similarity_type": "jaccard", "top_k": 10}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "similarity_type", rename_all = "snake_case")]
pub enum SimilarityKind {
    /// 2-D t-SNE embedding of score vectors; neighbours by Euclidean
    /// distance in the plane.
    Tsne {
        #[serde(default = "default_perplexity")]
        perplexity: f64,
        #[serde(default = "default_iterations")]
        iterations: usize,
    },

    /// Overlap of each fingerprint's top `top_k` labels.
    Jaccard {
        #[serde(default = "default_top_k")]
        top_k: usize,
    },

    /// Euclidean distance between score vectors.
    Distance,
}

const fn default_perplexity() -> f64 {
    TsneParams::DEFAULT_PERPLEXITY
}

const fn default_iterations() -> usize {
    TsneParams::DEFAULT_ITERATIONS
}

const fn default_top_k() -> usize {
    SimilarityKind::DEFAULT_TOP_K
}

impl SimilarityKind {
    pub const DEFAULT_TOP_K: usize = 10;

    /// Tags accepted by [`load`](Self::load) and [`from_name`](Self::from_name).
    pub const TAGS: &'static [&'static str] = &["tsne", "jaccard", "distance"];

    /// Metric with default parameters, by tag name.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownVariant`] for unrecognised names.
    pub fn from_name(name: &str) -> Result<Self, PipelineError> {
        match name {
            "tsne" => Ok(Self::Tsne {
                perplexity: TsneParams::DEFAULT_PERPLEXITY,
                iterations: TsneParams::DEFAULT_ITERATIONS,
            }),
            "jaccard" => Ok(Self::Jaccard {
                top_k: Self::DEFAULT_TOP_K,
            }),
            "distance" => Ok(Self::Distance),
            other => Err(PipelineError::unknown_variant("similarity", other)),
        }
    }

    /// Restore from a saved dictionary.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownVariant`] for unknown tags.
    pub fn load(value: &Value) -> Result<Self, PipelineError> {
        load_variant(value, "similarity_type", "similarity", Self::TAGS)
    }

    /// Tag name of this metric.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Tsne { .. } => "tsne",
            Self::Jaccard { .. } => "jaccard",
            Self::Distance => "distance",
        }
    }

    /// Fit the metric to `fingerprints`.
    ///
    /// `progress` receives the completed fraction in `0.0..=1.0`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for a non-positive
    /// perplexity or a zero `top_k`.
    pub fn calculate(
        &self,
        fingerprints: &[FingerprintRecord],
        progress: &mut dyn FnMut(f64),
    ) -> Result<SimilarityResult, PipelineError> {
        tracing::info!(metric = %self, count = fingerprints.len(), "calculating similarity");
        let references: Vec<FingerprintRef> = fingerprints.iter().map(FingerprintRecord::reference).collect();

        let result = match *self {
            Self::Tsne {
                perplexity,
                iterations,
            } => {
                if !(perplexity.is_finite() && perplexity > 0.0) {
                    return Err(PipelineError::InvalidConfig(format!(
                        "perplexity must be positive, got {perplexity}"
                    )));
                }
                let params = TsneParams {
                    perplexity,
                    iterations,
                    ..TsneParams::default()
                };
                let points = embed(&aligned_scores(fingerprints), &params, progress);
                SimilarityResult::Tsne(Embedding::new(points, references))
            }
            Self::Jaccard { top_k } => {
                if top_k == 0 {
                    return Err(PipelineError::InvalidConfig("top_k must be at least 1".to_string()));
                }
                let sets: Vec<HashSet<&str>> = fingerprints
                    .iter()
                    .map(|fp| fp.predictions.iter().take(top_k).map(|p| p.label.as_str()).collect())
                    .collect();
                let similarity = pairwise(sets.len(), progress, |i, j| jaccard(&sets[i], &sets[j]));
                SimilarityResult::Jaccard(OverlapMatrix {
                    top_k,
                    similarity,
                    fingerprints: references,
                })
            }
            Self::Distance => {
                let scores = aligned_scores(fingerprints);
                let distances = pairwise(scores.len(), progress, |i, j| euclidean(&scores[i], &scores[j]));
                SimilarityResult::Distance(DistanceMatrix {
                    distances,
                    fingerprints: references,
                })
            }
        };
        progress(1.0);
        Ok(result)
    }
}

impl fmt::Display for SimilarityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tsne {
                perplexity,
                iterations,
            } => write!(f, "tSNE (perplexity={perplexity}, iterations={iterations})"),
            Self::Jaccard { top_k } => write!(f, "Jaccard (top_k={top_k})"),
            Self::Distance => f.write_str("Distance"),
        }
    }
}

/// `|a ∩ b| / |a ∪ b|`, or 0 when both sets are empty.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn jaccard<T: Eq + std::hash::Hash, S: std::hash::BuildHasher>(
    a: &HashSet<T, S>,
    b: &HashSet<T, S>,
) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Score vectors over the shared label vocabulary.
///
/// Labels are indexed in first-seen order; labels a fingerprint lacks
/// score 0.
#[must_use]
pub fn aligned_scores(fingerprints: &[FingerprintRecord]) -> Vec<Vec<f64>> {
    let mut vocabulary: HashMap<&str, usize> = HashMap::new();
    for fp in fingerprints {
        for p in &fp.predictions {
            let next = vocabulary.len();
            vocabulary.entry(p.label.as_str()).or_insert(next);
        }
    }
    fingerprints
        .iter()
        .map(|fp| {
            let mut row = vec![0.0; vocabulary.len()];
            for p in &fp.predictions {
                if let Some(&index) = vocabulary.get(p.label.as_str()) {
                    row[index] = f64::from(p.score);
                }
            }
            row
        })
        .collect()
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Symmetric `n × n` matrix from `f(i, j)` evaluated for `i <= j`.
#[allow(clippy::cast_precision_loss)]
fn pairwise(
    n: usize,
    progress: &mut dyn FnMut(f64),
    f: impl Fn(usize, usize) -> f64,
) -> Vec<Vec<f64>> {
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let v = f(i, j);
            matrix[i][j] = v;
            matrix[j][i] = v;
        }
        progress((i + 1) as f64 / n as f64);
    }
    matrix
}

/// Where to search from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    /// A location in the embedding plane.
    Point([f64; 2]),
    /// A fingerprint by its index in the fitted set. The fingerprint
    /// itself is excluded from the answer.
    Fingerprint(usize),
}

/// One answer to a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Index in the fitted fingerprint list.
    pub index: usize,
    /// Distance (embedding, distance) or similarity (jaccard).
    pub score: f64,
    pub fingerprint: FingerprintRef,
}

/// A fitted, queryable similarity structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "similarity_type", rename_all = "snake_case")]
pub enum SimilarityResult {
    Tsne(Embedding),
    Jaccard(OverlapMatrix),
    Distance(DistanceMatrix),
}

impl SimilarityResult {
    /// Tag name of the metric that produced this result.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Tsne(_) => "tsne",
            Self::Jaccard(_) => "jaccard",
            Self::Distance(_) => "distance",
        }
    }

    /// References of the fitted fingerprints, in input order.
    #[must_use]
    pub fn fingerprints(&self) -> &[FingerprintRef] {
        match self {
            Self::Tsne(e) => &e.fingerprints,
            Self::Jaccard(m) => &m.fingerprints,
            Self::Distance(m) => &m.fingerprints,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fingerprints().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fingerprints().is_empty()
    }

    /// The `k` fingerprints most similar to `query`.
    ///
    /// Embedding and distance answers are ordered by ascending distance,
    /// jaccard answers by descending similarity; ties keep input order.
    /// Asking for more than exist returns all of them.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for a point query against
    /// a matrix result, a point with a non-finite coordinate, or an
    /// out-of-range fingerprint index.
    pub fn find_similar(&self, query: Query, k: usize) -> Result<Vec<Neighbor>, PipelineError> {
        if let Query::Point(point) = query {
            if !point.iter().all(|c| c.is_finite()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "query point {point:?} must have finite coordinates"
                )));
            }
        }
        if let Query::Fingerprint(index) = query {
            if index >= self.len() {
                return Err(PipelineError::InvalidConfig(format!(
                    "fingerprint index {index} out of range for {} fingerprints",
                    self.len()
                )));
            }
        }
        match (self, query) {
            (Self::Tsne(embedding), Query::Point(point)) => Ok(embedding.nearest(point, k, None)),
            (Self::Tsne(embedding), Query::Fingerprint(index)) => {
                Ok(embedding.nearest(embedding.points[index], k, Some(index)))
            }
            (Self::Jaccard(m), Query::Fingerprint(index)) => Ok(ranked_row(
                &m.similarity[index],
                &m.fingerprints,
                index,
                k,
                true,
            )),
            (Self::Distance(m), Query::Fingerprint(index)) => Ok(ranked_row(
                &m.distances[index],
                &m.fingerprints,
                index,
                k,
                false,
            )),
            (Self::Jaccard(_) | Self::Distance(_), Query::Point(_)) => Err(PipelineError::InvalidConfig(
                format!("{} results cannot be queried by point", self.name()),
            )),
        }
    }
}

fn ranked_row(
    row: &[f64],
    fingerprints: &[FingerprintRef],
    exclude: usize,
    k: usize,
    descending: bool,
) -> Vec<Neighbor> {
    let mut order: Vec<usize> = (0..row.len()).filter(|&i| i != exclude).collect();
    // Stable sort keeps input order for ties.
    if descending {
        order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
    } else {
        order.sort_by(|&a, &b| row[a].total_cmp(&row[b]));
    }
    order
        .into_iter()
        .take(k)
        .map(|index| Neighbor {
            index,
            score: row[index],
            fingerprint: fingerprints[index],
        })
        .collect()
}

type IndexedPoint = GeomWithData<[f64; 2], usize>;

/// 2-D embedding with an R-tree for neighbour queries.
///
/// Serializes as `{points, fingerprints}`; the tree is rebuilt on load.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "EmbeddingData", into = "EmbeddingData")]
pub struct Embedding {
    points: Vec<[f64; 2]>,
    fingerprints: Vec<FingerprintRef>,
    tree: RTree<IndexedPoint>,
}

#[derive(Serialize, Deserialize)]
struct EmbeddingData {
    points: Vec<[f64; 2]>,
    fingerprints: Vec<FingerprintRef>,
}

impl From<EmbeddingData> for Embedding {
    fn from(data: EmbeddingData) -> Self {
        Self::new(data.points, data.fingerprints)
    }
}

impl From<Embedding> for EmbeddingData {
    fn from(embedding: Embedding) -> Self {
        Self {
            points: embedding.points,
            fingerprints: embedding.fingerprints,
        }
    }
}

impl fmt::Debug for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedding")
            .field("points", &self.points)
            .field("fingerprints", &self.fingerprints)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Embedding {
    fn eq(&self, other: &Self) -> bool {
        self.points == other.points && self.fingerprints == other.fingerprints
    }
}

impl Embedding {
    #[must_use]
    pub fn new(points: Vec<[f64; 2]>, fingerprints: Vec<FingerprintRef>) -> Self {
        let tree = RTree::bulk_load(
            points
                .iter()
                .enumerate()
                .map(|(i, &p)| IndexedPoint::new(p, i))
                .collect(),
        );
        Self {
            points,
            fingerprints,
            tree,
        }
    }

    /// Embedded coordinates, in input order.
    #[must_use]
    pub fn points(&self) -> &[[f64; 2]] {
        &self.points
    }

    fn nearest(&self, point: [f64; 2], k: usize, exclude: Option<usize>) -> Vec<Neighbor> {
        if k == 0 {
            return Vec::new();
        }
        // Collect past the k-th hit while distances tie, then order ties
        // by index.
        let mut hits: Vec<(f64, usize)> = Vec::new();
        for (entry, d2) in self.tree.nearest_neighbor_iter_with_distance_2(&point) {
            if Some(entry.data) == exclude {
                continue;
            }
            if hits.len() >= k && hits.last().is_some_and(|&(last, _)| d2 > last) {
                break;
            }
            hits.push((d2, entry.data));
        }
        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        hits.into_iter()
            .take(k)
            .filter_map(|(d2, index)| {
                Some(Neighbor {
                    index,
                    score: d2.sqrt(),
                    fingerprint: *self.fingerprints.get(index)?,
                })
            })
            .collect()
    }
}

/// Pairwise label-set overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapMatrix {
    pub top_k: usize,
    pub similarity: Vec<Vec<f64>>,
    pub fingerprints: Vec<FingerprintRef>,
}

/// Pairwise score-vector distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceMatrix {
    pub distances: Vec<Vec<f64>>,
    pub fingerprints: Vec<FingerprintRef>,
}
