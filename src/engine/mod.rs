/// Compute layer: the process-scoped [`Engine`] and its stages.
///
/// Architecture:
/// ```text
///   request (dataset, features, exemplars, ...)
///        │
///        ▼
///   ┌──────────┐   metrics, scaled columns       (scaling)
///   │  Engine  │──► classifier assignment         (classify, forest)
///   │  caches  │──► histograms, contour maps      (histogram)
///   └──────────┘──► resolved objects, ordering    (resolve, ordering)
///        │
///        ▼
///   ArraySource (read-only raw columns)
/// ```
///
/// Every stage goes through its own [`MemoCache`], so stages compose into a
/// dependency graph keyed by (dataset, canonical parameters) and identical
/// concurrent requests compute once. All parallel work runs on the engine's
/// single rayon pool.
pub mod classify;
pub mod forest;
pub mod histogram;
pub mod ordering;
pub mod resolve;
pub mod scaling;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;
use log::info;
use serde::Serialize;

use crate::cache::{CacheStats, MemoCache};
use crate::config::EngineConfig;
use crate::data::model::{ObjectId, PopulationId, WellCoord, WellIndex};
use crate::data::params::{ExemplarSet, FeatureSet, ProbeSet};
use crate::data::source::ArraySource;
use crate::error::{EngineError, Result};

use classify::{ClusterPartition, WellShares};
use histogram::{ContourMatrix, FeatureHistograms};
use scaling::FeatureMetrics;

/// Dataset plus the parameters that determine a classification.
pub(crate) type ClassKey = (String, FeatureSet, ExemplarSet);

/// The named caches owned by an engine, one per memoized operation.
pub(crate) struct Caches {
    pub well_objects: MemoCache<String, BTreeMap<WellCoord, Vec<ObjectId>>>,
    pub metrics: MemoCache<(String, String), FeatureMetrics>,
    pub scaled: MemoCache<(String, String), Vec<f64>>,
    pub classify: MemoCache<ClassKey, Vec<PopulationId>>,
    pub partition: MemoCache<ClassKey, ClusterPartition>,
    pub histograms: MemoCache<(ClassKey, usize), FeatureHistograms>,
    pub contours: MemoCache<(ClassKey, usize), ContourMatrix>,
    pub objects: MemoCache<(String, WellCoord, ExemplarSet, ProbeSet), Vec<ObjectId>>,
    pub ordering: MemoCache<String, Vec<String>>,
    pub shares: MemoCache<ClassKey, WellShares>,
}

impl Caches {
    fn new(config: &EngineConfig) -> Self {
        let cap = &config.cache_capacity;
        Caches {
            well_objects: MemoCache::new("well_objects", cap.well_index),
            metrics: MemoCache::new("metrics", cap.metrics),
            scaled: MemoCache::new("scaled", cap.scaled),
            classify: MemoCache::new("classify", cap.classify),
            partition: MemoCache::new("partition", cap.partition),
            histograms: MemoCache::new("histograms", cap.histograms),
            contours: MemoCache::new("contours", cap.contours),
            objects: MemoCache::new("objects", cap.objects),
            ordering: MemoCache::new("ordering", cap.ordering),
            shares: MemoCache::new("shares", cap.shares),
        }
    }
}

/// Instrumentation snapshot of every cache, keyed by cache name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats(pub BTreeMap<&'static str, CacheStats>);

impl EngineStats {
    pub fn get(&self, cache: &str) -> CacheStats {
        self.0.get(cache).copied().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Process-scoped context: the data source, every cache and the shared
/// worker pool. Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Engine {
    source: Arc<dyn ArraySource>,
    config: EngineConfig,
    pool: rayon::ThreadPool,
    caches: Caches,
}

impl Engine {
    pub fn new(source: Arc<dyn ArraySource>, config: EngineConfig) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("phenotype-worker-{i}"))
            .build()
            .context("building worker pool")?;
        info!(
            "engine ready: {} worker thread(s), {} dataset(s)",
            pool.current_num_threads(),
            source.list_datasets().len()
        );
        Ok(Engine {
            caches: Caches::new(&config),
            source,
            config,
            pool,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source(&self) -> &dyn ArraySource {
        self.source.as_ref()
    }

    /// Names of the available datasets.
    pub fn datasets(&self) -> Vec<String> {
        self.source.list_datasets().into_iter().collect()
    }

    /// Drop every cached artifact.
    pub fn clear_caches(&self) {
        let c = &self.caches;
        c.well_objects.clear();
        c.metrics.clear();
        c.scaled.clear();
        c.classify.clear();
        c.partition.clear();
        c.histograms.clear();
        c.contours.clear();
        c.objects.clear();
        c.ordering.clear();
        c.shares.clear();
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.caches;
        EngineStats(BTreeMap::from([
            (c.well_objects.name(), c.well_objects.stats()),
            (c.metrics.name(), c.metrics.stats()),
            (c.scaled.name(), c.scaled.stats()),
            (c.classify.name(), c.classify.stats()),
            (c.partition.name(), c.partition.stats()),
            (c.histograms.name(), c.histograms.stats()),
            (c.contours.name(), c.contours.stats()),
            (c.objects.name(), c.objects.stats()),
            (c.ordering.name(), c.ordering.stats()),
            (c.shares.name(), c.shares.stats()),
        ]))
    }

    // -- shared lookups --

    pub(crate) fn ensure_dataset(&self, dataset: &str) -> Result<()> {
        if self.source.contains(dataset) {
            Ok(())
        } else {
            Err(EngineError::UnknownDataset(dataset.to_string()))
        }
    }

    /// Ordered image feature names of a dataset.
    pub fn image_features(&self, dataset: &str) -> Result<Vec<String>> {
        self.ensure_dataset(dataset)?;
        Ok(self.source.image_feature_names(dataset)?)
    }

    pub(crate) fn ensure_feature(&self, dataset: &str, feature: &str) -> Result<()> {
        self.ensure_features(dataset, [feature])
    }

    /// One lookup of the image feature names for the whole batch.
    pub(crate) fn ensure_features<'a>(
        &self,
        dataset: &str,
        features: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        let known: BTreeSet<String> = self.image_features(dataset)?.into_iter().collect();
        match features.into_iter().find(|f| !known.contains(*f)) {
            Some(missing) => Err(EngineError::unknown_feature(dataset, missing)),
            None => Ok(()),
        }
    }

    /// Plate / row / column of every object.
    pub fn well_index(&self, dataset: &str) -> Result<Arc<WellIndex>> {
        self.ensure_dataset(dataset)?;
        Ok(self.source.well_index_columns(dataset)?)
    }

    pub fn object_count(&self, dataset: &str) -> Result<usize> {
        Ok(self.well_index(dataset)?.len())
    }

    /// Well → ascending object ids, memoized per dataset.
    pub fn well_to_objects(&self, dataset: &str) -> Result<Arc<BTreeMap<WellCoord, Vec<ObjectId>>>> {
        let index = self.well_index(dataset)?;
        self.caches
            .well_objects
            .get_or_compute(dataset.to_string(), || -> Result<_> { Ok(index.group_by_well()) })
    }

    pub(crate) fn ensure_objects<'a>(
        &self,
        dataset: &str,
        objects: impl IntoIterator<Item = &'a ObjectId>,
    ) -> Result<()> {
        let count = self.object_count(dataset)?;
        match objects.into_iter().find(|&&o| o >= count) {
            Some(&object) => Err(EngineError::UnknownObject {
                dataset: dataset.to_string(),
                object,
                count,
            }),
            None => Ok(()),
        }
    }

    /// Scaled columns fetched up front, so parallel tasks only read memory.
    pub(crate) fn scaled_columns<'a>(
        &self,
        dataset: &str,
        features: impl IntoIterator<Item = &'a str>,
    ) -> Result<BTreeMap<String, Arc<Vec<f64>>>> {
        let features: Vec<&str> = features.into_iter().collect();
        self.ensure_features(dataset, features.iter().copied())?;
        features
            .into_iter()
            .map(|feature| -> Result<(String, Arc<Vec<f64>>)> {
                Ok((feature.to_string(), self.scaled_known(dataset, feature)?))
            })
            .collect()
    }

    /// Fails when a column holds fewer values than the dataset has objects.
    pub(crate) fn ensure_column_lengths(
        &self,
        dataset: &str,
        columns: &BTreeMap<String, Arc<Vec<f64>>>,
        objects: usize,
    ) -> Result<()> {
        match columns.iter().find(|(_, column)| column.len() < objects) {
            Some((feature, column)) => Err(EngineError::Source(anyhow::anyhow!(
                "column '{feature}' of '{dataset}' has {} values for {objects} objects",
                column.len()
            ))),
            None => Ok(()),
        }
    }
}

/// Value of `object` in a column supplied by the source.
pub(crate) fn value_at(column: &[f64], object: ObjectId) -> Result<f64> {
    column.get(object).copied().ok_or_else(|| {
        EngineError::Source(anyhow::anyhow!(
            "object {object} is beyond a column of {} values",
            column.len()
        ))
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::data::model::DatasetTable;
    use crate::data::source::MemorySource;

    /// 4 wells × 25 objects; `size` splits the objects into two blobs,
    /// `shape` is noise, `flat` is constant.
    pub fn blobs_table() -> DatasetTable {
        let n = 100;
        let plate = vec![0; n];
        let row: Vec<i64> = (0..n).map(|i| (i / 50) as i64).collect();
        let column: Vec<i64> = (0..n).map(|i| ((i / 25) % 2) as i64).collect();
        let size: Vec<f64> = (0..n)
            .map(|i| if i % 2 == 0 { 10.0 + (i % 7) as f64 } else { 50.0 + (i % 5) as f64 })
            .collect();
        let shape: Vec<f64> = (0..n).map(|i| ((i * 37) % 23) as f64 / 23.0).collect();
        let index = WellIndex::new(plate, row, column).unwrap();
        DatasetTable::from_columns(
            index,
            vec![
                ("size".into(), size),
                ("shape".into(), shape),
                ("flat".into(), vec![3.0; n]),
            ],
        )
        .unwrap()
    }

    pub fn engine() -> Engine {
        let source = MemorySource::new().with_dataset("blobs", blobs_table());
        let config = EngineConfig {
            worker_threads: 2,
            ..EngineConfig::default()
        };
        Engine::new(Arc::new(source), config).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::engine;
    use crate::error::ErrorKind;

    #[test]
    fn unknown_dataset_and_feature_are_reported() {
        let engine = engine();
        assert_eq!(engine.scaled("nope", "size").unwrap_err().kind(), ErrorKind::UnknownDataset);
        assert_eq!(engine.scaled("blobs", "nope").unwrap_err().kind(), ErrorKind::UnknownFeature);
    }

    #[test]
    fn wells_group_objects() {
        let engine = engine();
        let wells = engine.well_to_objects("blobs").unwrap();
        assert_eq!(wells.len(), 4);
        assert!(wells.values().all(|objects| objects.len() == 25));
    }

    #[test]
    fn scaled_columns_are_cached() {
        let engine = engine();
        let a = engine.scaled("blobs", "size").unwrap();
        let b = engine.scaled("blobs", "size").unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
        let stats = engine.stats();
        assert_eq!(stats.get("scaled").computations, 1);
        assert_eq!(stats.get("metrics").computations, 1);
    }

    #[test]
    fn clear_caches_forces_recomputation() {
        let engine = engine();
        engine.scaled("blobs", "size").unwrap();
        engine.clear_caches();
        engine.scaled("blobs", "size").unwrap();
        assert_eq!(engine.stats().get("scaled").computations, 2);
    }
}
