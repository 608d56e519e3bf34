use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Row position of an object in its dataset.
pub type ObjectId = usize;

/// Population (cluster) label. `1` is reserved for "everything".
pub type PopulationId = i64;

/// Population assigned to every object when no exemplars are given.
pub const DEFAULT_POPULATION: PopulationId = 1;

/// Reserved for the per-well object count in flat share tables; never a
/// user population.
pub const WELL_TOTAL_POPULATION: PopulationId = 0;

/// Names of the per-object system columns locating an object on a plate.
pub const SYSTEM_COLUMNS: [&str; 3] = ["plate", "row", "column"];

// ---------------------------------------------------------------------------
// MetadataValue – a single cell in a well annotation column
// ---------------------------------------------------------------------------

/// A dynamically-typed annotation value mirroring common table dtypes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetadataValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl MetadataValue {
    /// Best-effort typing of a raw text cell.
    pub fn guess(s: &str) -> Self {
        if s.is_empty() {
            return MetadataValue::Null;
        }
        if let Ok(i) = s.parse::<i64>() {
            return MetadataValue::Integer(i);
        }
        if let Ok(f) = s.parse::<f64>() {
            return MetadataValue::Float(f);
        }
        if s == "true" || s == "false" {
            return MetadataValue::Bool(s == "true");
        }
        MetadataValue::String(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Wells
// ---------------------------------------------------------------------------

/// Physical location of a well on a microplate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WellCoord {
    pub plate: i64,
    pub row: i64,
    pub column: i64,
}

impl WellCoord {
    pub fn new(plate: i64, row: i64, column: i64) -> Self {
        WellCoord { plate, row, column }
    }

    /// Clients send a negative column to mean "no well selected".
    pub fn is_selection(&self) -> bool {
        self.column >= 0
    }

    /// Flat well label, `plate_column_row`.
    pub fn label(&self) -> String {
        format!("{}_{}_{}", self.plate, self.column, self.row)
    }
}

/// Plate / row / column of every object, indexed by [`ObjectId`].
#[derive(Debug, Clone, Default)]
pub struct WellIndex {
    pub plate: Vec<i64>,
    pub row: Vec<i64>,
    pub column: Vec<i64>,
}

impl WellIndex {
    pub fn new(plate: Vec<i64>, row: Vec<i64>, column: Vec<i64>) -> Result<Self> {
        if plate.len() != row.len() || plate.len() != column.len() {
            bail!(
                "well index columns differ in length: plate {}, row {}, column {}",
                plate.len(),
                row.len(),
                column.len()
            );
        }
        Ok(WellIndex { plate, row, column })
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.plate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plate.is_empty()
    }

    pub fn coord(&self, object: ObjectId) -> Option<WellCoord> {
        Some(WellCoord {
            plate: *self.plate.get(object)?,
            row: *self.row.get(object)?,
            column: *self.column.get(object)?,
        })
    }

    /// Group object ids by well. Ids within a well are ascending.
    pub fn group_by_well(&self) -> BTreeMap<WellCoord, Vec<ObjectId>> {
        let mut groups: BTreeMap<WellCoord, Vec<ObjectId>> = BTreeMap::new();
        for object in 0..self.len() {
            let coord = WellCoord::new(self.plate[object], self.row[object], self.column[object]);
            groups.entry(coord).or_default().push(object);
        }
        groups
    }
}

/// Per-well annotation rows (gene targets, compounds, ...).
#[derive(Debug, Clone, Default, Serialize)]
pub struct WellAnnotations {
    /// Ordered annotation column names (excludes plate, row, column).
    pub columns: Vec<String>,
    pub wells: BTreeMap<String, BTreeMap<String, MetadataValue>>,
}

// ---------------------------------------------------------------------------
// Dataset configuration
// ---------------------------------------------------------------------------

/// Per-dataset presentation settings supplied next to the data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Image name → URL template with `{plate}`, `{column}`, `{row}` placeholders.
    pub well_images: BTreeMap<String, String>,
    /// Explicit ordered image feature list; all numeric columns when absent.
    pub image_features: Option<Vec<String>>,
}

impl DatasetConfig {
    /// Expand every well image template for the given well.
    pub fn well_image_urls(&self, well: WellCoord) -> BTreeMap<String, String> {
        self.well_images
            .iter()
            .map(|(name, template)| {
                let url = template
                    .replace("{plate}", &well.plate.to_string())
                    .replace("{column}", &well.column.to_string())
                    .replace("{row}", &well.row.to_string());
                (name.clone(), url)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// FeatureTable – a row subset of a dataset
// ---------------------------------------------------------------------------

/// A subset of rows with selected numeric columns, keyed by object id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    pub objects: Vec<ObjectId>,
    pub columns: BTreeMap<String, Vec<f64>>,
}

// ---------------------------------------------------------------------------
// DatasetTable – a fully materialised dataset
// ---------------------------------------------------------------------------

/// Everything an adapter knows about one dataset, held in memory.
#[derive(Debug, Clone)]
pub struct DatasetTable {
    pub well_index: Arc<WellIndex>,
    /// Ordered image feature names.
    pub features: Vec<String>,
    pub columns: HashMap<String, Arc<[f64]>>,
    pub config: DatasetConfig,
    pub annotations: WellAnnotations,
}

impl DatasetTable {
    /// Build a table, checking that every column covers every object.
    pub fn from_columns(well_index: WellIndex, columns: Vec<(String, Vec<f64>)>) -> Result<Self> {
        let n = well_index.len();
        let mut features = Vec::with_capacity(columns.len());
        let mut by_name = HashMap::with_capacity(columns.len());
        for (name, values) in columns {
            if values.len() != n {
                bail!("column '{name}' has {} values, expected {n}", values.len());
            }
            if by_name.contains_key(&name) {
                bail!("duplicate column '{name}'");
            }
            features.push(name.clone());
            by_name.insert(name, Arc::<[f64]>::from(values));
        }
        Ok(DatasetTable {
            well_index: Arc::new(well_index),
            features,
            columns: by_name,
            config: DatasetConfig::default(),
            annotations: WellAnnotations::default(),
        })
    }

    /// Apply a config, restricting image features when it lists them.
    pub fn with_config(mut self, config: DatasetConfig) -> Result<Self> {
        if let Some(listed) = &config.image_features {
            for name in listed {
                if !self.columns.contains_key(name) {
                    bail!("configured image feature '{name}' is not a numeric column");
                }
            }
            self.features = listed.clone();
        }
        self.config = config;
        Ok(self)
    }

    pub fn with_annotations(mut self, annotations: WellAnnotations) -> Self {
        self.annotations = annotations;
        self
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.well_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.well_index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_objects_by_well() {
        let index = WellIndex::new(vec![0, 0, 0, 1], vec![2, 2, 3, 2], vec![5, 5, 5, 5]).unwrap();
        let groups = index.group_by_well();
        assert_eq!(groups[&WellCoord::new(0, 2, 5)], vec![0, 1]);
        assert_eq!(groups[&WellCoord::new(0, 3, 5)], vec![2]);
        assert_eq!(groups[&WellCoord::new(1, 2, 5)], vec![3]);
    }

    #[test]
    fn rejects_ragged_columns() {
        let index = WellIndex::new(vec![0, 0], vec![0, 0], vec![0, 1]).unwrap();
        let err = DatasetTable::from_columns(index, vec![("a".into(), vec![1.0])]);
        assert!(err.is_err());
    }

    #[test]
    fn expands_well_image_templates() {
        let mut config = DatasetConfig::default();
        config
            .well_images
            .insert("dapi".into(), "http://img/{plate}/{row}-{column}.png".into());
        let urls = config.well_image_urls(WellCoord::new(3, 1, 7));
        assert_eq!(urls["dapi"], "http://img/3/1-7.png");
    }

    #[test]
    fn guesses_annotation_types() {
        assert_eq!(MetadataValue::guess("12"), MetadataValue::Integer(12));
        assert_eq!(MetadataValue::guess(""), MetadataValue::Null);
        assert_eq!(MetadataValue::guess("PLK1|AURKB"), MetadataValue::String("PLK1|AURKB".into()));
    }
}
