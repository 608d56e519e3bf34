//! Bagged decision-tree ensemble (random forest) for exemplar classification.
//!
//! Trees are grown on bootstrap samples of the training rows with Gini
//! impurity, a random subset of `sqrt(n_features)` candidate features per
//! split, and class weights inversely proportional to class frequency so a
//! population with few exemplars is not drowned out by a large one.
//!
//! Non-finite feature values are read as `0.0` both when training and when
//! predicting.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::config::ForestConfig;
use crate::data::model::PopulationId;
use crate::error::{EngineError, Result};

/// Rows per rayon work item when predicting.
const PREDICT_CHUNK: usize = 4096;

#[inline]
fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() { v } else { 0.0 }
}

// ---------------------------------------------------------------------------
// Decision tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Node {
    /// Normalised class distribution, indexed like `RandomForest::classes`.
    Leaf(Vec<f64>),
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    fn leaf_for(&self, value_of: impl Fn(usize) -> f64) -> &[f64] {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf(distribution) => return distribution,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if finite_or_zero(value_of(*feature)) <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

/// Grows one tree over weighted training rows.
struct TreeBuilder<'a> {
    rows: &'a [Vec<f64>],
    /// Class index of every training row.
    targets: &'a [usize],
    /// Bootstrap multiplicity × class weight, per training row.
    weights: Vec<f64>,
    n_classes: usize,
    max_features: usize,
    max_depth: Option<usize>,
    min_samples_split: usize,
    rng: StdRng,
    nodes: Vec<Node>,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

impl TreeBuilder<'_> {
    fn distribution(&self, samples: &[usize]) -> Vec<f64> {
        let mut dist = vec![0.0; self.n_classes];
        for &s in samples {
            dist[self.targets[s]] += self.weights[s];
        }
        dist
    }

    fn grow(&mut self, samples: &mut [usize], depth: usize) -> usize {
        let dist = self.distribution(samples);
        let pure = dist.iter().filter(|&&w| w > 0.0).count() <= 1;
        let depth_reached = self.max_depth.is_some_and(|max| depth >= max);

        if pure || depth_reached || samples.len() < self.min_samples_split {
            return self.push_leaf(dist);
        }

        let n_features = self.rows[samples[0]].len();
        let candidates = rand::seq::index::sample(&mut self.rng, n_features, self.max_features).into_vec();
        let mut best = self.best_split(samples, &candidates, &dist);
        if best.is_none() {
            // Every sampled feature is constant here; fall back to the rest.
            let rest: Vec<usize> = (0..n_features).filter(|f| !candidates.contains(f)).collect();
            best = self.best_split(samples, &rest, &dist);
        }
        let Some(best) = best else {
            return self.push_leaf(dist);
        };

        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf(Vec::new()));

        let mut split_at = 0;
        for i in 0..samples.len() {
            if finite_or_zero(self.rows[samples[i]][best.feature]) <= best.threshold {
                samples.swap(i, split_at);
                split_at += 1;
            }
        }
        if split_at == 0 || split_at == samples.len() {
            self.nodes.pop();
            return self.push_leaf(dist);
        }
        let (left_samples, right_samples) = samples.split_at_mut(split_at);
        let left = self.grow(left_samples, depth + 1);
        let right = self.grow(right_samples, depth + 1);
        self.nodes[idx] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
        };
        idx
    }

    fn push_leaf(&mut self, mut dist: Vec<f64>) -> usize {
        let total: f64 = dist.iter().sum();
        if total > 0.0 {
            dist.iter_mut().for_each(|w| *w /= total);
        }
        self.nodes.push(Node::Leaf(dist));
        self.nodes.len() - 1
    }

    /// Lowest weighted Gini impurity split over `features`.
    fn best_split(&self, samples: &mut [usize], features: &[usize], total: &[f64]) -> Option<BestSplit> {
        if samples.len() < 2 {
            return None;
        }
        let total_weight: f64 = total.iter().sum();
        let mut best: Option<BestSplit> = None;

        for &feature in features {
            let value = |s: usize| finite_or_zero(self.rows[s][feature]);
            samples.sort_by(|&a, &b| value(a).total_cmp(&value(b)));

            let mut left = vec![0.0; self.n_classes];
            let mut left_weight = 0.0;
            for i in 0..samples.len() - 1 {
                let s = samples[i];
                left[self.targets[s]] += self.weights[s];
                left_weight += self.weights[s];

                let (here, next) = (value(s), value(samples[i + 1]));
                if here == next {
                    continue;
                }
                let right_weight = total_weight - left_weight;
                let impurity = left_weight * gini(&left, left_weight)
                    + right_weight * gini_complement(total, &left, right_weight);
                if best.as_ref().map_or(true, |b| impurity < b.impurity) {
                    // Adjacent floats can round the midpoint up to `next`.
                    let mid = here + (next - here) / 2.0;
                    best = Some(BestSplit {
                        feature,
                        threshold: if mid < next { mid } else { here },
                        impurity,
                    });
                }
            }
        }
        best
    }
}

fn gini(dist: &[f64], weight: f64) -> f64 {
    if weight <= 0.0 {
        return 0.0;
    }
    1.0 - dist.iter().map(|w| (w / weight).powi(2)).sum::<f64>()
}

/// Gini impurity of `total - left` without materialising it.
fn gini_complement(total: &[f64], left: &[f64], weight: f64) -> f64 {
    if weight <= 0.0 {
        return 0.0;
    }
    1.0 - total
        .iter()
        .zip(left)
        .map(|(t, l)| ((t - l) / weight).powi(2))
        .sum::<f64>()
}

// ---------------------------------------------------------------------------
// RandomForest
// ---------------------------------------------------------------------------

/// A trained ensemble. Predicts the class with the highest mean leaf
/// probability; ties go to the lowest population id.
#[derive(Debug, Clone)]
pub struct RandomForest {
    classes: Vec<PopulationId>,
    n_features: usize,
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    /// Train on `rows` (one `Vec` per training object) labelled `labels`.
    ///
    /// Runs tree construction on the current rayon pool.
    pub fn fit(rows: &[Vec<f64>], labels: &[PopulationId], config: &ForestConfig) -> Result<Self> {
        let classes: Vec<PopulationId> = {
            let mut c = labels.to_vec();
            c.sort_unstable();
            c.dedup();
            c
        };
        if classes.len() < 2 {
            return Err(EngineError::InsufficientLabels {
                found: classes.len(),
            });
        }
        let n_features = rows.first().map_or(0, Vec::len);
        if n_features == 0 || rows.len() != labels.len() || rows.iter().any(|r| r.len() != n_features) {
            return Err(EngineError::malformed(
                "training rows",
                "rows must be non-empty, equally long and match the labels",
            ));
        }

        let class_index: BTreeMap<PopulationId, usize> =
            classes.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        let targets: Vec<usize> = labels.iter().map(|l| class_index[l]).collect();

        // "Balanced" weighting: n_samples / (n_classes * class_count).
        let mut counts = vec![0usize; classes.len()];
        targets.iter().for_each(|&t| counts[t] += 1);
        let class_weight: Vec<f64> = counts
            .iter()
            .map(|&c| rows.len() as f64 / (classes.len() * c) as f64)
            .collect();

        let max_features = ((n_features as f64).sqrt().floor() as usize).clamp(1, n_features);
        let n_rows = rows.len();

        let trees: Vec<DecisionTree> = (0..config.n_estimators.max(1))
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(t as u64));
                let mut multiplicity = vec![0usize; n_rows];
                for _ in 0..n_rows {
                    multiplicity[rng.gen_range(0..n_rows)] += 1;
                }
                let weights: Vec<f64> = multiplicity
                    .iter()
                    .zip(&targets)
                    .map(|(&m, &t)| m as f64 * class_weight[t])
                    .collect();
                let mut samples: Vec<usize> = (0..n_rows).filter(|&s| multiplicity[s] > 0).collect();

                let mut builder = TreeBuilder {
                    rows,
                    targets: &targets,
                    weights,
                    n_classes: classes.len(),
                    max_features,
                    max_depth: config.max_depth,
                    min_samples_split: config.min_samples_split.max(2),
                    rng,
                    nodes: Vec::new(),
                };
                builder.grow(&mut samples, 0);
                DecisionTree {
                    nodes: builder.nodes,
                }
            })
            .collect();

        Ok(RandomForest {
            classes,
            n_features,
            trees,
        })
    }

    /// Population ids the forest can predict, ascending.
    pub fn classes(&self) -> &[PopulationId] {
        &self.classes
    }

    /// Predict one row.
    pub fn predict_row(&self, row: &[f64]) -> PopulationId {
        let mut acc = vec![0.0; self.classes.len()];
        self.vote(&mut acc, |f| row[f])
    }

    /// Predict every object given one column slice per training feature,
    /// in training order. Runs on the current rayon pool.
    pub fn predict_columns(&self, columns: &[&[f64]]) -> Result<Vec<PopulationId>> {
        if columns.len() != self.n_features {
            return Err(EngineError::malformed(
                "feature columns",
                format!("expected {} columns, got {}", self.n_features, columns.len()),
            ));
        }
        let n = columns.first().map_or(0, |c| c.len());
        if columns.iter().any(|c| c.len() != n) {
            return Err(EngineError::malformed("feature columns", "columns differ in length"));
        }

        Ok((0..n)
            .into_par_iter()
            .with_min_len(PREDICT_CHUNK)
            .map_init(
                || vec![0.0; self.classes.len()],
                |acc, i| self.vote(acc, |f| columns[f][i]),
            )
            .collect())
    }

    fn vote(&self, acc: &mut [f64], value_of: impl Fn(usize) -> f64) -> PopulationId {
        acc.iter_mut().for_each(|w| *w = 0.0);
        for tree in &self.trees {
            for (a, p) in acc.iter_mut().zip(tree.leaf_for(&value_of)) {
                *a += p;
            }
        }
        let mut best = 0;
        for (i, &w) in acc.iter().enumerate() {
            if w > acc[best] {
                best = i;
            }
        }
        self.classes[best]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(seed: u64) -> ForestConfig {
        ForestConfig {
            seed,
            ..ForestConfig::default()
        }
    }

    /// Two blobs separated along the first feature.
    fn blobs() -> (Vec<Vec<f64>>, Vec<PopulationId>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..20 {
            let jitter = (i % 5) as f64 * 0.01;
            rows.push(vec![0.1 + jitter, 0.5 - jitter]);
            labels.push(10);
            rows.push(vec![0.9 - jitter, 0.5 + jitter]);
            labels.push(20);
        }
        (rows, labels)
    }

    #[test]
    fn separates_two_blobs() {
        let (rows, labels) = blobs();
        let forest = RandomForest::fit(&rows, &labels, &config(0)).unwrap();
        assert_eq!(forest.classes(), &[10, 20]);
        assert_eq!(forest.predict_row(&[0.05, 0.5]), 10);
        assert_eq!(forest.predict_row(&[0.95, 0.5]), 20);
    }

    #[test]
    fn column_prediction_matches_row_prediction() {
        let (rows, labels) = blobs();
        let forest = RandomForest::fit(&rows, &labels, &config(3)).unwrap();
        let x: Vec<f64> = (0..50).map(|i| i as f64 / 49.0).collect();
        let y: Vec<f64> = (0..50).map(|i| (i % 7) as f64 / 7.0).collect();
        let predicted = forest.predict_columns(&[x.as_slice(), y.as_slice()]).unwrap();
        for i in 0..50 {
            assert_eq!(predicted[i], forest.predict_row(&[x[i], y[i]]));
        }
    }

    #[test]
    fn same_seed_same_model() {
        let (rows, labels) = blobs();
        let probe: Vec<f64> = (0..100).map(|i| i as f64 / 99.0).collect();
        let flat = vec![0.5; 100];
        let a = RandomForest::fit(&rows, &labels, &config(7)).unwrap();
        let b = RandomForest::fit(&rows, &labels, &config(7)).unwrap();
        assert_eq!(
            a.predict_columns(&[probe.as_slice(), flat.as_slice()]).unwrap(),
            b.predict_columns(&[probe.as_slice(), flat.as_slice()]).unwrap()
        );
    }

    #[test]
    fn single_class_is_rejected() {
        let rows = vec![vec![0.1], vec![0.2]];
        let err = RandomForest::fit(&rows, &[4, 4], &config(0)).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientLabels { found: 1 }));
    }

    #[test]
    fn minority_class_survives_balanced_weighting() {
        let mut rows: Vec<Vec<f64>> = (0..40).map(|i| vec![i as f64 / 100.0]).collect();
        let mut labels = vec![1; 40];
        for v in [0.93, 0.95, 0.97] {
            rows.push(vec![v]);
            labels.push(2);
        }
        let forest = RandomForest::fit(&rows, &labels, &ForestConfig {
            n_estimators: 25,
            ..ForestConfig::default()
        })
        .unwrap();
        assert_eq!(forest.predict_row(&[0.99]), 2);
        assert_eq!(forest.predict_row(&[0.05]), 1);
    }

    #[test]
    fn non_finite_values_read_as_zero() {
        let (rows, labels) = blobs();
        let forest = RandomForest::fit(&rows, &labels, &config(1)).unwrap();
        assert_eq!(forest.predict_row(&[f64::NAN, 0.5]), forest.predict_row(&[0.0, 0.5]));
    }
}
