use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;
use serde::Serialize;

use super::forest::RandomForest;
use super::{ClassKey, Engine};
use crate::data::model::{DEFAULT_POPULATION, ObjectId, PopulationId, WELL_TOTAL_POPULATION, WellCoord};
use crate::data::params::{ExemplarSet, FeatureSet};
use crate::error::{EngineError, Result};

/// Population id → ascending object ids assigned to it.
pub type ClusterPartition = BTreeMap<PopulationId, Vec<ObjectId>>;

/// Whether a request falls back to the single default population.
fn uses_default(features: &FeatureSet, exemplars: &ExemplarSet) -> bool {
    features.is_empty() || exemplars.is_empty()
}

/// Split an assignment into per-population object lists. Every id in
/// `populations` becomes a key, even when nothing was assigned to it.
pub fn partition(assignment: &[PopulationId], populations: impl IntoIterator<Item = PopulationId>) -> ClusterPartition {
    let mut map: ClusterPartition = populations.into_iter().map(|id| (id, Vec::new())).collect();
    for (object, id) in assignment.iter().enumerate() {
        if let Some(objects) = map.get_mut(id) {
            objects.push(object);
        }
    }
    map
}

// ---------------------------------------------------------------------------
// Well population shares
// ---------------------------------------------------------------------------

/// Population make-up of one well.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WellShare {
    pub well: WellCoord,
    pub total: usize,
    /// Fraction of the well's objects per population; sums to 1.
    pub shares: BTreeMap<PopulationId, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WellShares {
    pub wells: Vec<WellShare>,
}

impl WellShares {
    /// `"plate_column_row"` → population → share, with the well's object
    /// count under [`WELL_TOTAL_POPULATION`].
    pub fn flat(&self) -> BTreeMap<String, BTreeMap<String, f64>> {
        self.wells
            .iter()
            .map(|w| {
                let mut row: BTreeMap<String, f64> =
                    w.shares.iter().map(|(id, share)| (id.to_string(), *share)).collect();
                row.insert(WELL_TOTAL_POPULATION.to_string(), w.total as f64);
                (w.well.label(), row)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Engine operations
// ---------------------------------------------------------------------------

impl Engine {
    pub(super) fn class_key(&self, dataset: &str, features: &FeatureSet, exemplars: &ExemplarSet) -> Result<ClassKey> {
        self.ensure_dataset(dataset)?;
        self.ensure_features(dataset, features.iter())?;
        self.ensure_objects(dataset, &exemplars.all_objects())?;
        Ok((dataset.to_string(), features.clone(), exemplars.clone()))
    }

    /// Population id for every object of the dataset.
    ///
    /// With no features or no exemplars every object is in population `1`.
    /// Otherwise a forest is trained on the exemplars (scaled features) and
    /// predicts every object; fewer than two labelled populations is an
    /// [`EngineError::InsufficientLabels`] error.
    pub fn classify(
        &self,
        dataset: &str,
        features: &FeatureSet,
        exemplars: &ExemplarSet,
    ) -> Result<Arc<Vec<PopulationId>>> {
        let key = self.class_key(dataset, features, exemplars)?;
        let n = self.object_count(dataset)?;

        self.caches.classify.get_or_compute(key, || -> Result<Vec<PopulationId>> {
            if uses_default(features, exemplars) {
                return Ok(vec![DEFAULT_POPULATION; n]);
            }
            let labelled = exemplars.labelled_populations();
            if labelled < 2 {
                return Err(EngineError::InsufficientLabels { found: labelled });
            }

            let columns = self.scaled_columns(dataset, features.iter())?;
            self.ensure_column_lengths(dataset, &columns, n)?;
            let columns: Vec<&[f64]> = columns.values().map(|c| c.as_slice()).collect();

            let pairs = exemplars.training_pairs();
            let rows: Vec<Vec<f64>> = pairs
                .iter()
                .map(|&(object, _)| columns.iter().map(|c| c[object]).collect())
                .collect();
            let labels: Vec<PopulationId> = pairs.iter().map(|&(_, label)| label).collect();

            info!(
                "Begin training on {} exemplars, {} features ({dataset})",
                rows.len(),
                columns.len()
            );
            let forest = self
                .pool
                .install(|| RandomForest::fit(&rows, &labels, &self.config.forest))?;
            info!("End training");

            info!("Begin classification of {n} objects");
            let predicted = self.pool.install(|| forest.predict_columns(&columns))?;
            info!("End classification");
            Ok(predicted)
        })
    }

    /// Object ids per population. Keys are exactly the exemplar population
    /// ids, or `{1}` when the request uses the default population.
    pub fn clusters_as_map(
        &self,
        dataset: &str,
        features: &FeatureSet,
        exemplars: &ExemplarSet,
    ) -> Result<Arc<ClusterPartition>> {
        let key = self.class_key(dataset, features, exemplars)?;
        self.caches.partition.get_or_compute(key, || -> Result<ClusterPartition> {
            let assignment = self.classify(dataset, features, exemplars)?;
            let populations: Vec<PopulationId> = if uses_default(features, exemplars) {
                vec![DEFAULT_POPULATION]
            } else {
                exemplars.populations().collect()
            };
            Ok(partition(&assignment, populations))
        })
    }

    /// Per-well population shares of the classification.
    pub fn well_cluster_shares(
        &self,
        dataset: &str,
        features: &FeatureSet,
        exemplars: &ExemplarSet,
    ) -> Result<Arc<WellShares>> {
        let key = self.class_key(dataset, features, exemplars)?;
        self.caches.shares.get_or_compute(key, || -> Result<WellShares> {
            info!("Join clustering and well info ({dataset})");
            let assignment = self.classify(dataset, features, exemplars)?;
            let partition = self.clusters_as_map(dataset, features, exemplars)?;
            let by_well = self.well_to_objects(dataset)?;

            let wells: Vec<WellShare> = by_well
                .iter()
                .map(|(&well, objects)| {
                    let mut shares: BTreeMap<PopulationId, f64> =
                        partition.keys().map(|&id| (id, 0.0)).collect();
                    for &object in objects {
                        *shares.entry(assignment[object]).or_default() += 1.0;
                    }
                    let total = objects.len();
                    shares.values_mut().for_each(|s| *s /= total as f64);
                    WellShare { well, total, shares }
                })
                .collect();
            Ok(WellShares { wells })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::engine;
    use crate::error::ErrorKind;

    fn features(names: &[&str]) -> FeatureSet {
        names.iter().copied().collect()
    }

    #[test]
    fn empty_exemplars_put_everything_in_population_one() {
        let engine = engine();
        let assignment = engine
            .classify("blobs", &features(&["size", "shape"]), &ExemplarSet::default())
            .unwrap();
        assert_eq!(assignment.len(), 100);
        assert!(assignment.iter().all(|&id| id == 1));

        let assignment = engine
            .classify("blobs", &FeatureSet::default(), &[(5, vec![0]), (6, vec![1])].into_iter().collect())
            .unwrap();
        assert!(assignment.iter().all(|&id| id == 1));
    }

    #[test]
    fn exemplars_drive_population_ids() {
        let engine = engine();
        // Even objects are small, odd objects are large.
        let exemplars: ExemplarSet = [(10, vec![0]), (20, vec![1, 3])].into_iter().collect();
        let fs = features(&["size", "shape"]);
        let assignment = engine.classify("blobs", &fs, &exemplars).unwrap();
        assert_eq!(assignment.len(), 100);
        assert!(assignment.iter().all(|id| [10, 20].contains(id)));

        let partition = engine.clusters_as_map("blobs", &fs, &exemplars).unwrap();
        assert_eq!(partition.keys().copied().collect::<Vec<_>>(), vec![10, 20]);
        let total: usize = partition.values().map(Vec::len).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn separable_feature_is_learned() {
        let engine = engine();
        let exemplars: ExemplarSet = [(10, vec![0, 2, 4, 6]), (20, vec![1, 3, 5, 7])].into_iter().collect();
        let assignment = engine.classify("blobs", &features(&["size"]), &exemplars).unwrap();
        for (object, id) in assignment.iter().enumerate() {
            assert_eq!(*id, if object % 2 == 0 { 10 } else { 20 }, "object {object}");
        }
    }

    #[test]
    fn one_population_is_insufficient() {
        let engine = engine();
        let exemplars: ExemplarSet = [(10, vec![0, 1]), (20, vec![])].into_iter().collect();
        let err = engine.classify("blobs", &features(&["size"]), &exemplars).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientLabels);
        // Not cached: the failure is reported again.
        let err = engine.classify("blobs", &features(&["size"]), &exemplars).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientLabels);
        assert_eq!(engine.stats().get("classify").computations, 2);
    }

    #[test]
    fn degenerate_feature_fails_classification() {
        let engine = engine();
        let exemplars: ExemplarSet = [(10, vec![0]), (20, vec![1])].into_iter().collect();
        let err = engine.classify("blobs", &features(&["flat", "size"]), &exemplars).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DegenerateFeature);
    }

    #[test]
    fn out_of_range_exemplar_is_rejected() {
        let engine = engine();
        let exemplars: ExemplarSet = [(10, vec![0]), (20, vec![1000])].into_iter().collect();
        let err = engine.classify("blobs", &features(&["size"]), &exemplars).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownObject);
    }

    #[test]
    fn well_shares_sum_to_one() {
        let engine = engine();
        let exemplars: ExemplarSet = [(10, vec![0, 2]), (20, vec![1, 3])].into_iter().collect();
        let shares = engine
            .well_cluster_shares("blobs", &features(&["size"]), &exemplars)
            .unwrap();
        assert_eq!(shares.wells.len(), 4);
        for well in &shares.wells {
            assert_eq!(well.total, 25);
            let sum: f64 = well.shares.values().sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
        let flat = shares.flat();
        assert_eq!(flat["0_0_0"]["0"], 25.0);
        assert!(flat["0_0_0"].contains_key("10"));
    }

    #[test]
    fn partition_keeps_empty_populations() {
        let map = partition(&[1, 1, 3], [1, 2, 3]);
        assert_eq!(map[&1], vec![0, 1]);
        assert!(map[&2].is_empty());
        assert_eq!(map[&3], vec![2]);
    }
}
