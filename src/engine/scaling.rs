use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use serde::Serialize;

use super::Engine;
use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// FeatureMetrics
// ---------------------------------------------------------------------------

/// Summary statistics of one raw feature column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureMetrics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl FeatureMetrics {
    /// Single pass over the finite values of `values`.
    /// `None` when there is no finite value at all.
    pub fn compute(values: &[f64]) -> Option<Self> {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0usize;
        for &v in values.iter().filter(|v| v.is_finite()) {
            min = min.min(v);
            max = max.max(v);
            sum += v;
            count += 1;
        }
        (count > 0).then(|| FeatureMetrics {
            min,
            max,
            mean: sum / count as f64,
        })
    }

    /// Min-max scaling is undefined for a constant column.
    pub fn is_degenerate(&self) -> bool {
        self.max <= self.min
    }

    /// Map `[min, max]` onto `[0, 1]`.
    pub fn scale(&self, value: f64) -> f64 {
        (value - self.min) / (self.max - self.min)
    }
}

/// Scale a whole column. Non-finite inputs stay non-finite.
pub fn min_max_scale(values: &[f64], metrics: &FeatureMetrics) -> Vec<f64> {
    values.iter().map(|&v| metrics.scale(v)).collect()
}

// ---------------------------------------------------------------------------
// Engine operations
// ---------------------------------------------------------------------------

impl Engine {
    /// Min / max / mean of a feature column, computed once per
    /// (dataset, feature) and shared by every consumer.
    pub fn metrics(&self, dataset: &str, feature: &str) -> Result<Arc<FeatureMetrics>> {
        self.ensure_feature(dataset, feature)?;
        self.metrics_known(dataset, feature)
    }

    /// [`Engine::metrics`] for a feature already checked by the caller.
    fn metrics_known(&self, dataset: &str, feature: &str) -> Result<Arc<FeatureMetrics>> {
        let key = (dataset.to_string(), feature.to_string());
        self.caches.metrics.get_or_compute(key, || -> Result<FeatureMetrics> {
            debug!("computing feature metrics for {dataset}/{feature}");
            let column = self.source.numeric_column(dataset, feature)?;
            FeatureMetrics::compute(&column).ok_or_else(|| EngineError::DegenerateFeature {
                dataset: dataset.to_string(),
                feature: feature.to_string(),
                value: f64::NAN,
            })
        })
    }

    /// Metrics of every image feature of the dataset.
    pub fn feature_metrics(&self, dataset: &str) -> Result<BTreeMap<String, FeatureMetrics>> {
        self.image_features(dataset)?
            .into_iter()
            .map(|feature| -> Result<(String, FeatureMetrics)> {
                let metrics = *self.metrics_known(dataset, &feature)?;
                Ok((feature, metrics))
            })
            .collect()
    }

    /// The feature column mapped onto `[0, 1]`.
    ///
    /// Fails with [`EngineError::DegenerateFeature`] when the column is
    /// constant instead of producing NaN.
    pub fn scaled(&self, dataset: &str, feature: &str) -> Result<Arc<Vec<f64>>> {
        self.ensure_feature(dataset, feature)?;
        self.scaled_known(dataset, feature)
    }

    pub(crate) fn scaled_known(&self, dataset: &str, feature: &str) -> Result<Arc<Vec<f64>>> {
        let key = (dataset.to_string(), feature.to_string());
        self.caches.scaled.get_or_compute(key, || -> Result<Vec<f64>> {
            let metrics = self.metrics_known(dataset, feature)?;
            if metrics.is_degenerate() {
                return Err(EngineError::DegenerateFeature {
                    dataset: dataset.to_string(),
                    feature: feature.to_string(),
                    value: metrics.min,
                });
            }
            debug!("scaling {dataset}/{feature}");
            let column = self.source.numeric_column(dataset, feature)?;
            Ok(min_max_scale(&column, &metrics))
        })
    }
}
