//! Seeded k-means used to initialize VQ codebooks.

use crate::error::{Error, Result};
use crate::perf::{self, Metric};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use tracing::debug;

/// Restart and convergence settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KmeansOptions {
    /// Independent restarts; the lowest distortion wins.
    pub restarts: usize,
    /// Stop when the relative distortion improvement drops below this.
    pub thresh: f32,
    /// Hard cap on Lloyd iterations per restart.
    pub max_iter: usize,
}

impl Default for KmeansOptions {
    fn default() -> Self {
        Self {
            restarts: 20,
            thresh: 1e-5,
            max_iter: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KmeansResult {
    /// `(k, dim)` centroids.
    pub centroids: Array2<f32>,
    /// Mean Euclidean distance of observations to their centroid.
    pub distortion: f32,
    /// Lloyd iterations run across all restarts.
    pub iterations: usize,
}

/// Cluster the rows of `obs` into `k` centroids.
pub fn kmeans(
    obs: ArrayView2<'_, f32>,
    k: usize,
    options: &KmeansOptions,
    rng: &mut StdRng,
) -> Result<KmeansResult> {
    let _span = perf::span(Metric::Kmeans);
    let n = obs.nrows();
    if k == 0 || n < k {
        return Err(Error::usage(format!(
            "k-means needs at least k={k} observations, got {n}"
        )));
    }

    let mut best: Option<(Array2<f32>, f32)> = None;
    let mut iterations = 0;
    for restart in 0..options.restarts.max(1) {
        let init = rand::seq::index::sample(rng, n, k);
        let mut centroids = obs.select(Axis(0), &init.into_vec());
        let mut prev = f32::INFINITY;
        for _ in 0..options.max_iter.max(1) {
            iterations += 1;
            let (labels, distortion) = assign(obs, &centroids);
            update(obs, &labels, &mut centroids);
            if prev.is_finite() && prev - distortion <= options.thresh * prev {
                break;
            }
            prev = distortion;
        }
        let (_, distortion) = assign(obs, &centroids);
        debug!(restart, distortion, "k-means restart");
        if best.as_ref().map_or(true, |(_, d)| distortion < *d) {
            best = Some((centroids, distortion));
        }
    }
    perf::add_count(Metric::KmeansIterations, iterations as u64);

    let (centroids, distortion) = best.ok_or_else(|| Error::usage("k-means ran no restarts"))?;
    Ok(KmeansResult {
        centroids,
        distortion,
        iterations,
    })
}

/// Nearest centroid per row and the mean Euclidean distance.
fn assign(obs: ArrayView2<'_, f32>, centroids: &Array2<f32>) -> (Array1<usize>, f32) {
    let mut total = 0.0f64;
    let labels = obs
        .outer_iter()
        .map(|row| {
            let (label, d2) = centroids
                .outer_iter()
                .map(|c| (&row - &c).mapv(|v| v * v).sum())
                .enumerate()
                .fold((0, f32::INFINITY), |best, (i, d)| {
                    if d < best.1 {
                        (i, d)
                    } else {
                        best
                    }
                });
            total += f64::from(d2.sqrt());
            label
        })
        .collect();
    (labels, (total / obs.nrows() as f64) as f32)
}

/// Move each centroid to the mean of its members; empty clusters stay put.
fn update(obs: ArrayView2<'_, f32>, labels: &Array1<usize>, centroids: &mut Array2<f32>) {
    let mut sums = Array2::<f32>::zeros(centroids.raw_dim());
    let mut counts = vec![0usize; centroids.nrows()];
    for (row, &label) in obs.outer_iter().zip(labels.iter()) {
        let mut sum = sums.row_mut(label);
        sum += &row;
        counts[label] += 1;
    }
    for (i, &count) in counts.iter().enumerate() {
        if count > 0 {
            let mean = sums.row(i).mapv(|v| v / count as f32);
            centroids.row_mut(i).assign(&mean);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn separates_two_obvious_clusters() {
        let obs = array![
            [0.0f32, 0.0],
            [0.1, 0.0],
            [0.0, 0.1],
            [10.0, 10.0],
            [10.1, 10.0],
            [10.0, 10.1],
        ];
        let mut rng = StdRng::seed_from_u64(0);
        let result = kmeans(obs.view(), 2, &KmeansOptions::default(), &mut rng).unwrap();
        assert_eq!(result.centroids.dim(), (2, 2));
        let mut xs: Vec<f32> = result.centroids.column(0).to_vec();
        xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((xs[0] - 0.0333).abs() < 1e-3);
        assert!((xs[1] - 10.0333).abs() < 1e-3);
        assert!(result.distortion < 0.1);
    }

    #[test]
    fn deterministic_for_a_seed() {
        let obs = Array2::from_shape_fn((40, 3), |(i, j)| ((i * 7 + j * 3) % 11) as f32);
        let run = || {
            let mut rng = StdRng::seed_from_u64(5);
            kmeans(obs.view(), 4, &KmeansOptions::default(), &mut rng)
                .unwrap()
                .centroids
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn too_few_observations_is_an_error() {
        let obs = Array2::<f32>::zeros((2, 3));
        let mut rng = StdRng::seed_from_u64(0);
        assert!(kmeans(obs.view(), 3, &KmeansOptions::default(), &mut rng).is_err());
    }

    #[test]
    fn empty_cluster_keeps_its_centroid() {
        let obs = array![[0.0f32], [0.0]];
        let mut centroids = array![[0.0f32], [5.0]];
        let labels = Array1::from(vec![0usize, 0]);
        update(obs.view(), &labels, &mut centroids);
        assert_eq!(centroids, array![[0.0f32], [5.0]]);
    }
}
