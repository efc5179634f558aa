//! Exact t-SNE embedding into two dimensions.
//!
//! Quadratic in the number of points per iteration, which is fine for
//! the few thousand cutouts a record set produces. Initialisation is PCA
//! (via the Gram matrix) so repeated runs on the same input give the
//! same layout.

/// Optimiser settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TsneParams {
    pub perplexity: f64,
    pub iterations: usize,
    pub learning_rate: f64,
    pub early_exaggeration: f64,
    pub exaggeration_iterations: usize,
    pub initial_momentum: f64,
    pub final_momentum: f64,
}

impl TsneParams {
    pub const DEFAULT_PERPLEXITY: f64 = 30.0;
    pub const DEFAULT_ITERATIONS: usize = 1000;
}

impl Default for TsneParams {
    fn default() -> Self {
        Self {
            perplexity: Self::DEFAULT_PERPLEXITY,
            iterations: Self::DEFAULT_ITERATIONS,
            learning_rate: 200.0,
            early_exaggeration: 12.0,
            exaggeration_iterations: 250,
            initial_momentum: 0.5,
            final_momentum: 0.8,
        }
    }
}

const PERPLEXITY_TOLERANCE: f64 = 1e-5;
const PERPLEXITY_STEPS: usize = 50;
const MIN_GAIN: f64 = 0.01;
const MIN_PROBABILITY: f64 = 1e-12;
const INIT_SCALE: f64 = 1e-4;

/// Embed `data` (one row per point, equal lengths) into the plane.
///
/// `progress` receives the completed fraction after each iteration.
/// Zero points give an empty embedding, one point sits at the origin and
/// two points are placed at `(-1, 0)` and `(1, 0)`.
#[allow(clippy::cast_precision_loss)]
pub fn embed(data: &[Vec<f64>], params: &TsneParams, progress: &mut dyn FnMut(f64)) -> Vec<[f64; 2]> {
    let n = data.len();
    match n {
        0 => return Vec::new(),
        1 => return vec![[0.0, 0.0]],
        2 => return vec![[-1.0, 0.0], [1.0, 0.0]],
        _ => {}
    }

    let distances = squared_distances(data);
    let perplexity = params.perplexity.min((n - 1) as f64 / 3.0).max(1.0);
    let p = joint_probabilities(&distances, n, perplexity);
    let mut y = pca_init(data);

    let mut update = vec![[0.0_f64; 2]; n];
    let mut gains = vec![[1.0_f64; 2]; n];
    let mut num = vec![0.0_f64; n * n];

    for iter in 0..params.iterations {
        let early = iter < params.exaggeration_iterations;
        let exaggeration = if early { params.early_exaggeration } else { 1.0 };
        let momentum = if early {
            params.initial_momentum
        } else {
            params.final_momentum
        };

        // Student-t kernel and its normaliser.
        let mut z = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                let dx = y[i][0] - y[j][0];
                let dy = y[i][1] - y[j][1];
                let q = 1.0 / (1.0 + dx.mul_add(dx, dy * dy));
                num[i * n + j] = q;
                num[j * n + i] = q;
                z += 2.0 * q;
            }
        }
        let z = z.max(f64::MIN_POSITIVE);

        for i in 0..n {
            let mut grad = [0.0_f64; 2];
            for j in 0..n {
                if i == j {
                    continue;
                }
                let q = num[i * n + j];
                let mult = exaggeration.mul_add(p[i * n + j], -q / z) * q;
                grad[0] += mult * (y[i][0] - y[j][0]);
                grad[1] += mult * (y[i][1] - y[j][1]);
            }
            for d in 0..2 {
                let g = 4.0 * grad[d];
                gains[i][d] = if (g > 0.0) == (update[i][d] > 0.0) {
                    (gains[i][d] * 0.8).max(MIN_GAIN)
                } else {
                    gains[i][d] + 0.2
                };
                update[i][d] = momentum.mul_add(update[i][d], -params.learning_rate * gains[i][d] * g);
            }
        }

        for (point, step) in y.iter_mut().zip(&update) {
            point[0] += step[0];
            point[1] += step[1];
        }
        center(&mut y);
        progress((iter + 1) as f64 / params.iterations as f64);
    }

    y
}

fn squared_distances(data: &[Vec<f64>]) -> Vec<f64> {
    let n = data.len();
    let mut d = vec![0.0; n * n];
    for i in 0..n {
        for j in (i + 1)..n {
            let dist: f64 = data[i]
                .iter()
                .zip(&data[j])
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            d[i * n + j] = dist;
            d[j * n + i] = dist;
        }
    }
    d
}

/// Symmetrised affinities `P` with each row calibrated to `perplexity`.
#[allow(clippy::cast_precision_loss)]
fn joint_probabilities(distances: &[f64], n: usize, perplexity: f64) -> Vec<f64> {
    let target = perplexity.ln();
    let mut p = vec![0.0; n * n];
    let mut row = vec![0.0; n];

    for i in 0..n {
        let d = &distances[i * n..(i + 1) * n];
        let d_min = d
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != i)
            .map(|(_, &v)| v)
            .fold(f64::INFINITY, f64::min);

        let mut beta = 1.0;
        let (mut lo, mut hi) = (f64::NEG_INFINITY, f64::INFINITY);
        for _ in 0..PERPLEXITY_STEPS {
            let mut sum = 0.0;
            let mut weighted = 0.0;
            for j in 0..n {
                row[j] = if j == i {
                    0.0
                } else {
                    (-(d[j] - d_min) * beta).exp()
                };
                sum += row[j];
                weighted += (d[j] - d_min) * row[j];
            }
            let entropy = sum.ln() + beta * weighted / sum;
            let diff = entropy - target;
            if diff.abs() < PERPLEXITY_TOLERANCE {
                break;
            }
            if diff > 0.0 {
                lo = beta;
                beta = if hi.is_finite() { (beta + hi) / 2.0 } else { beta * 2.0 };
            } else {
                hi = beta;
                beta = if lo.is_finite() { (beta + lo) / 2.0 } else { beta / 2.0 };
            }
        }

        let sum: f64 = row.iter().sum();
        for j in 0..n {
            p[i * n + j] = row[j] / sum;
        }
    }

    let scale = 2.0 * n as f64;
    let mut joint = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            if i != j {
                joint[i * n + j] = ((p[i * n + j] + p[j * n + i]) / scale).max(MIN_PROBABILITY);
            }
        }
    }
    joint
}

/// First two principal component scores, scaled to a tiny spread.
#[allow(clippy::cast_precision_loss)]
fn pca_init(data: &[Vec<f64>]) -> Vec<[f64; 2]> {
    let n = data.len();
    let dims = data.first().map_or(0, Vec::len);

    let mut mean = vec![0.0; dims];
    for row in data {
        for (m, v) in mean.iter_mut().zip(row) {
            *m += v / n as f64;
        }
    }

    let mut gram = vec![0.0; n * n];
    for i in 0..n {
        for j in i..n {
            let dot: f64 = data[i]
                .iter()
                .zip(&data[j])
                .zip(&mean)
                .map(|((a, b), m)| (a - m) * (b - m))
                .sum();
            gram[i * n + j] = dot;
            gram[j * n + i] = dot;
        }
    }

    let first = power_iteration(&gram, n, None);
    let second = power_iteration(&gram, n, Some(&first));

    let mut y: Vec<[f64; 2]> = (0..n)
        .map(|i| [first.vector[i] * first.value.sqrt(), second.vector[i] * second.value.sqrt()])
        .collect();

    let spread = std_dev(y.iter().map(|p| p[0]));
    if spread <= f64::EPSILON {
        // Coincident points: fall back to a fixed small circle.
        return (0..n)
            .map(|i| {
                let angle = i as f64;
                [INIT_SCALE * angle.cos(), INIT_SCALE * angle.sin()]
            })
            .collect();
    }
    for p in &mut y {
        p[0] *= INIT_SCALE / spread;
        p[1] *= INIT_SCALE / spread;
    }
    y
}

struct Eigen {
    value: f64,
    vector: Vec<f64>,
}

#[allow(clippy::cast_precision_loss)]
fn power_iteration(matrix: &[f64], n: usize, deflate: Option<&Eigen>) -> Eigen {
    let mut v: Vec<f64> = (0..n).map(|i| 1.0 + (i as f64 + 1.0).sqrt()).collect();
    let mut value = 0.0;
    for _ in 0..200 {
        let mut next = vec![0.0; n];
        for i in 0..n {
            next[i] = (0..n).map(|j| matrix[i * n + j] * v[j]).sum();
        }
        if let Some(e) = deflate {
            let proj: f64 = e.vector.iter().zip(&next).map(|(a, b)| a * b).sum();
            for (x, u) in next.iter_mut().zip(&e.vector) {
                *x -= proj * u;
            }
        }
        let norm = next.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm <= f64::EPSILON {
            return Eigen {
                value: 0.0,
                vector: vec![0.0; n],
            };
        }
        for x in &mut next {
            *x /= norm;
        }
        let converged = next.iter().zip(&v).map(|(a, b)| (a - b).abs()).sum::<f64>() < 1e-10;
        v = next;
        value = norm;
        if converged {
            break;
        }
    }
    Eigen { value, vector: v }
}

fn center(y: &mut [[f64; 2]]) {
    #[allow(clippy::cast_precision_loss)]
    let n = y.len() as f64;
    let (sx, sy) = y.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p[0], sy + p[1]));
    for p in y.iter_mut() {
        p[0] -= sx / n;
        p[1] -= sy / n;
    }
}

#[allow(clippy::cast_precision_loss)]
fn std_dev(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count() as f64;
    let mean = values.clone().sum::<f64>() / n;
    (values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / n).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist(a: [f64; 2], b: [f64; 2]) -> f64 {
        (a[0] - b[0]).hypot(a[1] - b[1])
    }

    #[test]
    fn trivial_sizes() {
        let params = TsneParams::default();
        let mut noop = |_: f64| {};
        assert!(embed(&[], &params, &mut noop).is_empty());
        assert_eq!(embed(&[vec![1.0]], &params, &mut noop), vec![[0.0, 0.0]]);
        assert_eq!(
            embed(&[vec![1.0], vec![2.0]], &params, &mut noop),
            vec![[-1.0, 0.0], [1.0, 0.0]]
        );
    }

    #[test]
    fn separates_two_clusters() {
        let mut data = Vec::new();
        for i in 0..6 {
            let jitter = f64::from(i) * 0.01;
            data.push(vec![1.0 - jitter, jitter, 0.0]);
        }
        for i in 0..6 {
            let jitter = f64::from(i) * 0.01;
            data.push(vec![0.0, jitter, 1.0 - jitter]);
        }
        let params = TsneParams {
            iterations: 500,
            ..TsneParams::default()
        };
        let y = embed(&data, &params, &mut |_: f64| {});
        assert!(y.iter().all(|p| p[0].is_finite() && p[1].is_finite()));

        let mut within = 0.0;
        let mut across = 0.0;
        for i in 0..12 {
            for j in (i + 1)..12 {
                if (i < 6) == (j < 6) {
                    within += dist(y[i], y[j]) / 30.0;
                } else {
                    across += dist(y[i], y[j]) / 36.0;
                }
            }
        }
        assert!(across > within, "across {across} should exceed within {within}");
    }

    #[test]
    fn progress_reaches_one() {
        let data: Vec<Vec<f64>> = (0..5).map(|i| vec![f64::from(i), 0.0]).collect();
        let params = TsneParams {
            iterations: 20,
            ..TsneParams::default()
        };
        let mut last = 0.0;
        embed(&data, &params, &mut |p: f64| last = p);
        assert!((last - 1.0).abs() < 1e-12);
    }

    #[test]
    fn identical_points_stay_finite() {
        let data = vec![vec![0.5, 0.5]; 4];
        let params = TsneParams {
            iterations: 50,
            ..TsneParams::default()
        };
        let y = embed(&data, &params, &mut |_: f64| {});
        assert!(y.iter().all(|p| p[0].is_finite() && p[1].is_finite()));
    }

    #[test]
    fn repeated_runs_are_identical() {
        let data: Vec<Vec<f64>> = (0..8)
            .map(|i| vec![f64::from(i % 3), f64::from(i / 3), 1.0])
            .collect();
        let params = TsneParams {
            iterations: 100,
            ..TsneParams::default()
        };
        let a = embed(&data, &params, &mut |_: f64| {});
        let b = embed(&data, &params, &mut |_: f64| {});
        assert_eq!(a, b);
    }
}
