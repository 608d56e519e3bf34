use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

/// Tunables for an [`Engine`](crate::engine::Engine). Every field has a
/// default, so a config file only lists what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache_capacity: CacheCapacity,
    /// Size of the shared worker pool; 0 lets rayon pick (one per core).
    pub worker_threads: usize,
    pub forest: ForestConfig,
    /// Objects sampled when ordering features by correlation.
    pub ordering_sample_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: CacheCapacity::default(),
            worker_threads: 0,
            forest: ForestConfig::default(),
            ordering_sample_size: 1000,
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        serde_json::from_str(&text).context("parsing engine config")
    }
}

/// Entry limit per logical cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheCapacity {
    pub well_index: usize,
    pub metrics: usize,
    pub scaled: usize,
    pub classify: usize,
    pub partition: usize,
    pub histograms: usize,
    pub contours: usize,
    pub objects: usize,
    pub ordering: usize,
    pub shares: usize,
}

impl Default for CacheCapacity {
    fn default() -> Self {
        Self {
            well_index: 5,
            metrics: 1000,
            scaled: 100,
            classify: 5,
            partition: 5,
            histograms: 5,
            contours: 5,
            objects: 5,
            ordering: 5,
            shares: 5,
        }
    }
}

/// Bagged decision-tree ensemble parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    pub n_estimators: usize,
    /// Unlimited depth when absent.
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    /// Base seed; tree `i` uses `seed + i`, so results do not depend on
    /// thread scheduling.
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_estimators: 10,
            max_depth: None,
            min_samples_split: 2,
            seed: 0,
        }
    }
}
