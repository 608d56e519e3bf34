//! Display order of image features: correlated features end up adjacent.

use std::sync::Arc;

use log::info;
use rayon::prelude::*;

use super::Engine;
use crate::error::Result;

/// Square matrix of pairwise distances, `m[i][j] == m[j][i]`.
pub type DistanceMatrix = Vec<Vec<f64>>;

/// Sequences items so that close items (by a distance matrix) are
/// neighbours. Returns a permutation of `0..distances.len()`.
pub trait Reorder: Send + Sync {
    fn reorder(&self, distances: &[Vec<f64>]) -> Vec<usize>;
}

/// Pearson correlation over the positions where both series are finite.
/// `None` when fewer than two such positions exist or either side has no
/// variance.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .zip(b)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(&x, &y)| (x, y))
        .collect();
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }
    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}

/// `1 - |corr|` for every pair of columns. Undefined correlations count as
/// fully uncorrelated (distance 1).
pub fn correlation_distances(columns: &[&[f64]]) -> DistanceMatrix {
    let n = columns.len();
    (0..n)
        .into_par_iter()
        .map(|i| {
            (0..n)
                .map(|j| {
                    if i == j {
                        0.0
                    } else {
                        pearson(columns[i], columns[j]).map_or(1.0, |r| 1.0 - r.abs())
                    }
                })
                .collect()
        })
        .collect()
}

fn path_length(distances: &[Vec<f64>], order: &[usize]) -> f64 {
    order.windows(2).map(|w| distances[w[0]][w[1]]).sum()
}

// ---------------------------------------------------------------------------
// Greedy chain + 2-opt
// ---------------------------------------------------------------------------

/// Nearest-neighbour chains from every start item, keeping the shortest
/// open path, then refined with 2-opt segment reversals.
#[derive(Debug, Clone, Copy)]
pub struct GreedyChain {
    /// Upper bound on 2-opt improvement sweeps.
    pub max_sweeps: usize,
}

impl Default for GreedyChain {
    fn default() -> Self {
        GreedyChain { max_sweeps: 50 }
    }
}

impl GreedyChain {
    fn chain_from(distances: &[Vec<f64>], start: usize) -> Vec<usize> {
        let n = distances.len();
        let mut visited = vec![false; n];
        let mut order = Vec::with_capacity(n);
        let mut current = start;
        visited[current] = true;
        order.push(current);
        while order.len() < n {
            let mut next = None;
            let mut best = f64::INFINITY;
            for candidate in (0..n).filter(|&c| !visited[c]) {
                let d = distances[current][candidate];
                if next.is_none() || d < best {
                    best = d;
                    next = Some(candidate);
                }
            }
            let Some(next) = next else { break };
            visited[next] = true;
            order.push(next);
            current = next;
        }
        order
    }

    /// Reverse `order[i..=j]` whenever that shortens the open path.
    fn two_opt(&self, distances: &[Vec<f64>], order: &mut [usize]) {
        let n = order.len();
        for _ in 0..self.max_sweeps {
            let mut improved = false;
            for i in 0..n.saturating_sub(1) {
                for j in i + 1..n {
                    let before_i = if i > 0 { distances[order[i - 1]][order[i]] } else { 0.0 };
                    let after_j = if j + 1 < n { distances[order[j]][order[j + 1]] } else { 0.0 };
                    let new_i = if i > 0 { distances[order[i - 1]][order[j]] } else { 0.0 };
                    let new_j = if j + 1 < n { distances[order[i]][order[j + 1]] } else { 0.0 };
                    if new_i + new_j < before_i + after_j - 1e-12 {
                        order[i..=j].reverse();
                        improved = true;
                    }
                }
            }
            if !improved {
                break;
            }
        }
    }
}

impl Reorder for GreedyChain {
    fn reorder(&self, distances: &[Vec<f64>]) -> Vec<usize> {
        let n = distances.len();
        if n < 3 {
            return (0..n).collect();
        }
        let mut best: Vec<usize> = (0..n).collect();
        let mut best_length = f64::INFINITY;
        for start in 0..n {
            let order = Self::chain_from(distances, start);
            let length = path_length(distances, &order);
            if length < best_length {
                best_length = length;
                best = order;
            }
        }
        self.two_opt(distances, &mut best);
        best
    }
}

// ---------------------------------------------------------------------------
// Engine operations
// ---------------------------------------------------------------------------

impl Engine {
    /// Image features in display order, from the correlation distances over
    /// a fixed object sample. Memoized per dataset.
    pub fn feature_ordering(&self, dataset: &str) -> Result<Arc<Vec<String>>> {
        self.ensure_dataset(dataset)?;
        self.caches.ordering.get_or_compute(dataset.to_string(), || -> Result<Vec<String>> {
            info!("Order features by correlation ({dataset})");
            let features = self.image_features(dataset)?;
            let sample = self.source.object_sample(dataset, self.config.ordering_sample_size)?;
            let columns: Vec<&[f64]> = features
                .iter()
                .map(|f| sample.columns.get(f).map_or(&[][..], Vec::as_slice))
                .collect();

            let distances = self.pool.install(|| correlation_distances(&columns));
            let permutation = GreedyChain::default().reorder(&distances);
            Ok(permutation.into_iter().map(|i| features[i].clone()).collect())
        })
    }

    /// Ordered image features, as served to clients.
    pub fn feature_info(&self, dataset: &str) -> Result<Arc<Vec<String>>> {
        self.feature_ordering(dataset)
    }
}
