//! Client parameters in canonical form.
//!
//! Every unordered composite argument (feature sets, object sets, exemplar
//! mappings, probes) is parsed from JSON into a sorted, deduplicated
//! structure before it is used as a cache key, so two requests that differ
//! only in ordering hit the same cache entry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::model::{ObjectId, PopulationId, WELL_TOTAL_POPULATION};
use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// FeatureSet
// ---------------------------------------------------------------------------

/// An unordered, deduplicated set of feature names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureSet(BTreeSet<String>);

impl FeatureSet {
    /// Parse a JSON array of feature names.
    pub fn from_json(text: &str) -> Result<Self> {
        let names: Vec<String> = serde_json::from_str(text)
            .map_err(|e| EngineError::malformed("features", e.to_string()))?;
        Ok(names.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Names in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }
}

impl<S: Into<String>> FromIterator<S> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        FeatureSet(iter.into_iter().map(Into::into).collect())
    }
}

// ---------------------------------------------------------------------------
// ObjectSet
// ---------------------------------------------------------------------------

/// An unordered, deduplicated set of object ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectSet(BTreeSet<ObjectId>);

impl ObjectSet {
    /// Parse a JSON array of non-negative integers.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(text)
            .map_err(|e| EngineError::malformed("objects", e.to_string()))?;
        object_ids(&value, "objects").map(ObjectSet)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<ObjectId> for ObjectSet {
    fn from_iter<I: IntoIterator<Item = ObjectId>>(iter: I) -> Self {
        ObjectSet(iter.into_iter().collect())
    }
}

fn object_ids(value: &JsonValue, parameter: &str) -> Result<BTreeSet<ObjectId>> {
    let items = value
        .as_array()
        .ok_or_else(|| EngineError::malformed(parameter, "expected an array of object ids"))?;
    items
        .iter()
        .map(|item| {
            item.as_u64()
                .and_then(|id| usize::try_from(id).ok())
                .ok_or_else(|| {
                    EngineError::malformed(parameter, format!("{item} is not a valid object id"))
                })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// ExemplarSet
// ---------------------------------------------------------------------------

/// Population id → exemplar objects, as labelled by the user.
///
/// An object may be listed under several populations; for training it is
/// attributed to the lowest population id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExemplarSet(BTreeMap<PopulationId, BTreeSet<ObjectId>>);

impl ExemplarSet {
    /// Parse a JSON object `{"<population>": [object, ...], ...}`.
    ///
    /// Population keys must be integers, unique after parsing, and not the
    /// reserved [`WELL_TOTAL_POPULATION`].
    pub fn from_json(text: &str) -> Result<Self> {
        let Entries(entries) = serde_json::from_str(text)
            .map_err(|e| EngineError::malformed("exemplars", e.to_string()))?;

        let mut populations = BTreeMap::new();
        for (key, value) in entries {
            let id: PopulationId = key.trim().parse().map_err(|_| {
                EngineError::malformed("exemplars", format!("population key '{key}' is not an integer"))
            })?;
            if id == WELL_TOTAL_POPULATION {
                return Err(EngineError::malformed(
                    "exemplars",
                    format!("population {id} is reserved for well totals"),
                ));
            }
            let objects = object_ids(&value, "exemplars")?;
            if populations.insert(id, objects).is_some() {
                return Err(EngineError::malformed(
                    "exemplars",
                    format!("population {id} is listed more than once"),
                ));
            }
        }
        Ok(ExemplarSet(populations))
    }

    /// No populations at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Population ids in ascending order.
    pub fn populations(&self) -> impl Iterator<Item = PopulationId> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PopulationId, &BTreeSet<ObjectId>)> {
        self.0.iter().map(|(id, objects)| (*id, objects))
    }

    /// Every object referenced by any population.
    pub fn all_objects(&self) -> BTreeSet<ObjectId> {
        self.0.values().flatten().copied().collect()
    }

    /// Number of populations that actually carry exemplars.
    pub fn labelled_populations(&self) -> usize {
        self.0.values().filter(|objects| !objects.is_empty()).count()
    }

    /// Training rows as `(object, label)` in ascending object order.
    /// Objects listed under several populations keep the lowest id.
    pub fn training_pairs(&self) -> Vec<(ObjectId, PopulationId)> {
        let mut labels: BTreeMap<ObjectId, PopulationId> = BTreeMap::new();
        for (id, objects) in &self.0 {
            for &object in objects {
                labels.entry(object).or_insert(*id);
            }
        }
        labels.into_iter().collect()
    }
}

impl<O: IntoIterator<Item = ObjectId>> FromIterator<(PopulationId, O)> for ExemplarSet {
    fn from_iter<I: IntoIterator<Item = (PopulationId, O)>>(iter: I) -> Self {
        let mut populations: BTreeMap<PopulationId, BTreeSet<ObjectId>> = BTreeMap::new();
        for (id, objects) in iter {
            populations.entry(id).or_default().extend(objects);
        }
        ExemplarSet(populations)
    }
}

// ---------------------------------------------------------------------------
// ProbeSet
// ---------------------------------------------------------------------------

/// A probe coordinate stored by bit pattern so it can be hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeCoord(u64);

impl ProbeCoord {
    pub fn value(self) -> f64 {
        f64::from_bits(self.0)
    }
}

/// Feature → coordinate in scaled feature space (a click on a scatterplot).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeSet(BTreeMap<String, ProbeCoord>);

impl ProbeSet {
    /// Parse either `{"feature": 0.3, ...}` or `[["feature", 0.3], ...]`.
    /// A feature may only be probed once.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(text)
            .map_err(|e| EngineError::malformed("probes", e.to_string()))?;

        let pairs: Vec<(String, JsonValue)> = match value {
            JsonValue::Array(items) => items
                .into_iter()
                .map(|item| {
                    serde_json::from_value::<(String, JsonValue)>(item).map_err(|e| {
                        EngineError::malformed("probes", format!("expected [feature, coordinate]: {e}"))
                    })
                })
                .collect::<Result<_>>()?,
            JsonValue::Object(_) => {
                let Entries(entries) = serde_json::from_str(text)
                    .map_err(|e| EngineError::malformed("probes", e.to_string()))?;
                entries
            }
            other => {
                return Err(EngineError::malformed(
                    "probes",
                    format!("expected an object or array, got {other}"),
                ));
            }
        };

        let mut probes = ProbeSet::default();
        for (feature, coordinate) in pairs {
            let coordinate = coordinate
                .as_f64()
                .filter(|c| c.is_finite())
                .ok_or_else(|| {
                    EngineError::malformed("probes", format!("coordinate for '{feature}' is not a finite number"))
                })?;
            if !probes.insert(feature.clone(), coordinate) {
                return Err(EngineError::malformed(
                    "probes",
                    format!("feature '{feature}' is probed more than once"),
                ));
            }
        }
        Ok(probes)
    }

    /// Returns `false` when the feature was already probed.
    pub fn insert(&mut self, feature: impl Into<String>, coordinate: f64) -> bool {
        let feature = feature.into();
        if self.0.contains_key(&feature) {
            return false;
        }
        self.0.insert(feature, ProbeCoord(coordinate.to_bits()));
        true
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, coord)| (name.as_str(), coord.value()))
    }
}

// ---------------------------------------------------------------------------
// Raw JSON object entries, duplicates preserved
// ---------------------------------------------------------------------------

/// A JSON object read as a list of entries, so repeated keys are visible
/// instead of silently collapsing.
struct Entries(Vec<(String, JsonValue)>);

impl<'de> Deserialize<'de> for Entries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = Entries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Entries, A::Error> {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry::<String, JsonValue>()? {
                    entries.push(entry);
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}
