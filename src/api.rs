//! JSON-facing operations.
//!
//! Every function takes the dataset name plus JSON-encoded parameters
//! (feature sets, exemplar mappings, probe coordinates, object sets), parses
//! them into canonical parameter types and returns a JSON document. Parsing
//! failures surface as [`ErrorKind::MalformedParameter`].

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Value, json};

use crate::data::model::{ObjectId, WellCoord};
use crate::data::params::{ExemplarSet, FeatureSet, ObjectSet, ProbeSet};
use crate::engine::Engine;
use crate::error::{EngineError, ErrorKind, Result};

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| EngineError::Source(e.into()))
}

/// `{"error": <kind>, "message": <text>}` for a failed request.
pub fn error_response(err: &EngineError) -> Value {
    let kind: ErrorKind = err.kind();
    json!({ "error": kind, "message": err.to_string() })
}

/// Parsed form of the common (features, exemplars) request pair.
fn class_params(features: &str, exemplars: &str) -> Result<(FeatureSet, ExemplarSet)> {
    Ok((FeatureSet::from_json(features)?, ExemplarSet::from_json(exemplars)?))
}

/// Probes are optional; an empty string means none.
fn probe_params(probes: &str) -> Result<ProbeSet> {
    if probes.trim().is_empty() {
        Ok(ProbeSet::default())
    } else {
        ProbeSet::from_json(probes)
    }
}

// ---------------------------------------------------------------------------
// Dataset level
// ---------------------------------------------------------------------------

pub fn datasets(engine: &Engine) -> Result<Value> {
    to_json(&engine.datasets())
}

/// Image features in display order.
pub fn feature_info(engine: &Engine, dataset: &str) -> Result<Value> {
    to_json(engine.feature_info(dataset)?.as_slice())
}

pub fn feature_metrics(engine: &Engine, dataset: &str) -> Result<Value> {
    to_json(&engine.feature_metrics(dataset)?)
}

/// `"plate_column_row"` → object ids.
pub fn well_to_objects(engine: &Engine, dataset: &str) -> Result<Value> {
    let wells = engine.well_to_objects(dataset)?;
    let flat: BTreeMap<String, &Vec<ObjectId>> = wells.iter().map(|(w, o)| (w.label(), o)).collect();
    to_json(&flat)
}

pub fn well_annotations(engine: &Engine, dataset: &str) -> Result<Value> {
    engine.ensure_dataset(dataset)?;
    to_json(&engine.source().well_annotations(dataset)?)
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// One population id per object.
pub fn clusters(engine: &Engine, dataset: &str, features: &str, exemplars: &str) -> Result<Value> {
    let (features, exemplars) = class_params(features, exemplars)?;
    to_json(engine.classify(dataset, &features, &exemplars)?.as_slice())
}

pub fn clusters_as_map(engine: &Engine, dataset: &str, features: &str, exemplars: &str) -> Result<Value> {
    let (features, exemplars) = class_params(features, exemplars)?;
    to_json(&*engine.clusters_as_map(dataset, &features, &exemplars)?)
}

pub fn well_cluster_shares(
    engine: &Engine,
    dataset: &str,
    features: &str,
    exemplars: &str,
) -> Result<Value> {
    let (features, exemplars) = class_params(features, exemplars)?;
    to_json(&engine.well_cluster_shares(dataset, &features, &exemplars)?.flat())
}

pub fn feature_histograms(
    engine: &Engine,
    dataset: &str,
    features: &str,
    exemplars: &str,
    bins: usize,
) -> Result<Value> {
    let (features, exemplars) = class_params(features, exemplars)?;
    to_json(&*engine.feature_histograms(dataset, &features, &exemplars, bins)?)
}

pub fn contour_maps(
    engine: &Engine,
    dataset: &str,
    features: &str,
    exemplars: &str,
    bins: usize,
) -> Result<Value> {
    let (features, exemplars) = class_params(features, exemplars)?;
    to_json(&*engine.contour_maps(dataset, &features, &exemplars, bins)?)
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

pub fn closest_object(engine: &Engine, dataset: &str, probes: &str) -> Result<Value> {
    to_json(&engine.closest_object(dataset, &probe_params(probes)?)?)
}

pub fn objects(
    engine: &Engine,
    dataset: &str,
    well: WellCoord,
    exemplars: &str,
    probes: &str,
) -> Result<Value> {
    let exemplars = ExemplarSet::from_json(exemplars)?;
    let probes = probe_params(probes)?;
    to_json(engine.resolve_objects(dataset, well, &exemplars, &probes)?.as_slice())
}

pub fn object_info(
    engine: &Engine,
    dataset: &str,
    features: &str,
    well: WellCoord,
    exemplars: &str,
    probes: &str,
) -> Result<Value> {
    let (features, exemplars) = class_params(features, exemplars)?;
    let probes = probe_params(probes)?;
    to_json(&engine.object_info(dataset, &features, well, &exemplars, &probes)?)
}

pub fn object_records(engine: &Engine, dataset: &str, features: &str, objects: &str) -> Result<Value> {
    let features = FeatureSet::from_json(features)?;
    let objects = ObjectSet::from_json(objects)?;
    to_json(&engine.object_records(dataset, &features, &objects)?)
}

pub fn object_feature_values(
    engine: &Engine,
    dataset: &str,
    well: WellCoord,
    exemplars: &str,
    probes: &str,
) -> Result<Value> {
    let exemplars = ExemplarSet::from_json(exemplars)?;
    let probes = probe_params(probes)?;
    to_json(&engine.object_feature_values(dataset, well, &exemplars, &probes)?)
}

/// Cache instrumentation.
pub fn stats(engine: &Engine) -> Result<Value> {
    to_json(&engine.stats())
}
