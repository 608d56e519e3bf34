use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

use super::{Engine, value_at};
use crate::data::model::{ObjectId, WellCoord};
use crate::data::params::{ExemplarSet, FeatureSet, ObjectSet, ProbeSet};
use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Object detail records
// ---------------------------------------------------------------------------

/// Location, scaled feature values and well image URLs of one object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectRecord {
    pub object: ObjectId,
    pub plate: i64,
    pub row: i64,
    pub column: i64,
    #[serde(flatten)]
    pub features: BTreeMap<String, f64>,
    /// `img_<name>` → URL.
    #[serde(flatten)]
    pub images: BTreeMap<String, String>,
}

/// Scaled values of every image feature for a set of objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObjectFeatureValues {
    pub objects: Vec<ObjectId>,
    /// Feature → one value per entry of `objects`.
    pub values: BTreeMap<String, Vec<f64>>,
}

/// Index of the smallest finite distance; ties go to the lowest index.
fn nearest(distances: impl ParallelIterator<Item = (ObjectId, f64)>) -> Option<ObjectId> {
    distances
        .filter(|(_, d)| d.is_finite())
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
        .map(|(object, _)| object)
}

impl Engine {
    /// The object whose scaled feature vector is nearest (Euclidean) to the
    /// probe point; `None` without probes.
    pub fn closest_object(&self, dataset: &str, probes: &ProbeSet) -> Result<Option<ObjectId>> {
        if probes.is_empty() {
            return Ok(None);
        }
        self.ensure_dataset(dataset)?;
        let n = self.object_count(dataset)?;
        let columns = self.scaled_columns(dataset, probes.iter().map(|(feature, _)| feature))?;
        self.ensure_column_lengths(dataset, &columns, n)?;
        let axes: Vec<(&[f64], f64)> = probes
            .iter()
            .map(|(feature, coordinate)| (columns[feature].as_slice(), coordinate))
            .collect();

        Ok(self.pool.install(|| {
            nearest((0..n).into_par_iter().map(|object| {
                let squared: f64 = axes
                    .iter()
                    .map(|(column, coordinate)| (column[object] - coordinate).powi(2))
                    .sum();
                (object, squared.sqrt())
            }))
        }))
    }

    /// Union of the exemplar objects, the objects in `well` (when it names a
    /// well of the index) and the object closest to the probes. Ascending.
    ///
    /// An unknown well contributes nothing; it is not an error.
    pub fn resolve_objects(
        &self,
        dataset: &str,
        well: WellCoord,
        exemplars: &ExemplarSet,
        probes: &ProbeSet,
    ) -> Result<Arc<Vec<ObjectId>>> {
        self.ensure_dataset(dataset)?;
        let exemplar_objects = exemplars.all_objects();
        self.ensure_objects(dataset, &exemplar_objects)?;

        let key = (dataset.to_string(), well, exemplars.clone(), probes.clone());
        self.caches.objects.get_or_compute(key, || -> Result<Vec<ObjectId>> {
            let mut objects = exemplar_objects;
            if well.is_selection() {
                if let Some(in_well) = self.well_to_objects(dataset)?.get(&well) {
                    objects.extend(in_well.iter().copied());
                }
            }
            if let Some(closest) = self.closest_object(dataset, probes)? {
                objects.insert(closest);
            }
            Ok(objects.into_iter().collect())
        })
    }

    /// Detail records for the resolved objects: location, scaled values of
    /// `features` and expanded well image URLs.
    pub fn object_info(
        &self,
        dataset: &str,
        features: &FeatureSet,
        well: WellCoord,
        exemplars: &ExemplarSet,
        probes: &ProbeSet,
    ) -> Result<Vec<ObjectRecord>> {
        self.ensure_features(dataset, features.iter())?;
        let objects = self.resolve_objects(dataset, well, exemplars, probes)?;
        let objects: ObjectSet = objects.iter().copied().collect();
        self.object_records(dataset, features, &objects)
    }

    /// Detail records for an explicit set of objects, ascending.
    pub fn object_records(
        &self,
        dataset: &str,
        features: &FeatureSet,
        objects: &ObjectSet,
    ) -> Result<Vec<ObjectRecord>> {
        self.ensure_dataset(dataset)?;
        self.ensure_features(dataset, features.iter())?;
        self.ensure_objects(dataset, &objects.iter().collect::<Vec<_>>())?;
        let index = self.well_index(dataset)?;
        let columns = self.scaled_columns(dataset, features.iter())?;
        let config = self.source.config(dataset)?;

        objects
            .iter()
            .map(|object| -> Result<ObjectRecord> {
                let coord = index.coord(object).ok_or_else(|| EngineError::UnknownObject {
                    dataset: dataset.to_string(),
                    object,
                    count: index.len(),
                })?;
                let features = columns
                    .iter()
                    .map(|(name, values)| -> Result<(String, f64)> {
                        Ok((name.clone(), value_at(values, object)?))
                    })
                    .collect::<Result<BTreeMap<String, f64>>>()?;
                Ok(ObjectRecord {
                    object,
                    plate: coord.plate,
                    row: coord.row,
                    column: coord.column,
                    features,
                    images: config
                        .well_image_urls(coord)
                        .into_iter()
                        .map(|(name, url)| (format!("img_{name}"), url))
                        .collect(),
                })
            })
            .collect()
    }

    /// Scaled values of every image feature for the resolved objects, one
    /// pool task per feature.
    pub fn object_feature_values(
        &self,
        dataset: &str,
        well: WellCoord,
        exemplars: &ExemplarSet,
        probes: &ProbeSet,
    ) -> Result<ObjectFeatureValues> {
        let objects = self.resolve_objects(dataset, well, exemplars, probes)?;
        let features = self.image_features(dataset)?;
        let columns = self.scaled_columns(dataset, features.iter().map(String::as_str))?;

        let values = self.pool.install(|| {
            columns
                .par_iter()
                .map(|(name, column)| -> Result<(String, Vec<f64>)> {
                    let values = objects
                        .iter()
                        .map(|&o| value_at(column, o))
                        .collect::<Result<Vec<f64>>>()?;
                    Ok((name.clone(), values))
                })
                .collect::<Result<BTreeMap<String, Vec<f64>>>>()
        })?;
        Ok(ObjectFeatureValues {
            objects: objects.to_vec(),
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::engine;
    use crate::error::ErrorKind;

    const NO_WELL: WellCoord = WellCoord {
        plate: -1,
        row: -1,
        column: -1,
    };

    #[test]
    fn invalid_well_still_returns_exemplars() {
        let engine = engine();
        let exemplars: ExemplarSet = [(1, vec![5, 6])].into_iter().collect();
        let objects = engine
            .resolve_objects("blobs", NO_WELL, &exemplars, &ProbeSet::default())
            .unwrap();
        assert_eq!(*objects, vec![5, 6]);
    }

    #[test]
    fn nothing_selected_resolves_to_nothing() {
        let engine = engine();
        let objects = engine
            .resolve_objects("blobs", NO_WELL, &ExemplarSet::default(), &ProbeSet::default())
            .unwrap();
        assert!(objects.is_empty());

        let missing_well = WellCoord::new(9, 9, 9);
        let objects = engine
            .resolve_objects("blobs", missing_well, &ExemplarSet::default(), &ProbeSet::default())
            .unwrap();
        assert!(objects.is_empty());
    }

    #[test]
    fn well_objects_are_included() {
        let engine = engine();
        let exemplars: ExemplarSet = [(1, vec![99])].into_iter().collect();
        let objects = engine
            .resolve_objects("blobs", WellCoord::new(0, 0, 1), &exemplars, &ProbeSet::default())
            .unwrap();
        let mut expected: Vec<ObjectId> = (25..50).collect();
        expected.push(99);
        assert_eq!(*objects, expected);
    }

    #[test]
    fn probe_finds_the_nearest_object() {
        let engine = engine();
        let size = engine.scaled("blobs", "size").unwrap();
        let shape = engine.scaled("blobs", "shape").unwrap();

        let mut probes = ProbeSet::default();
        probes.insert("size", size[42]);
        probes.insert("shape", shape[42]);
        assert_eq!(engine.closest_object("blobs", &probes).unwrap(), Some(42));

        let objects = engine
            .resolve_objects("blobs", NO_WELL, &ExemplarSet::default(), &probes)
            .unwrap();
        assert_eq!(*objects, vec![42]);
    }

    #[test]
    fn probe_on_unknown_feature_fails() {
        let engine = engine();
        let mut probes = ProbeSet::default();
        probes.insert("volume", 0.5);
        let err = engine.closest_object("blobs", &probes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownFeature);
    }

    #[test]
    fn object_info_carries_location_and_values() {
        let engine = engine();
        let exemplars: ExemplarSet = [(1, vec![3])].into_iter().collect();
        let features: FeatureSet = ["size"].into_iter().collect();
        let records = engine
            .object_info("blobs", &features, NO_WELL, &exemplars, &ProbeSet::default())
            .unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!((record.object, record.plate, record.row, record.column), (3, 0, 0, 0));
        assert_eq!(record.features["size"], engine.scaled("blobs", "size").unwrap()[3]);

        let json = serde_json::to_value(record).unwrap();
        assert!(json.get("size").is_some());
    }

    #[test]
    fn explicit_object_records_are_checked() {
        let engine = engine();
        let features: FeatureSet = ["shape"].into_iter().collect();
        let objects: ObjectSet = [7, 2].into_iter().collect();
        let records = engine.object_records("blobs", &features, &objects).unwrap();
        assert_eq!(records.iter().map(|r| r.object).collect::<Vec<_>>(), vec![2, 7]);

        let outside: ObjectSet = [100].into_iter().collect();
        let err = engine.object_records("blobs", &features, &outside).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownObject);
    }

    #[test]
    fn feature_values_fail_on_degenerate_image_feature() {
        // "flat" is an image feature with a constant column.
        let engine = engine();
        let exemplars: ExemplarSet = [(1, vec![0, 1])].into_iter().collect();
        let err = engine
            .object_feature_values("blobs", NO_WELL, &exemplars, &ProbeSet::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DegenerateFeature);
    }
}
