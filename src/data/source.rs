use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::model::{DatasetConfig, DatasetTable, FeatureTable, ObjectId, WellAnnotations, WellIndex};

// ---------------------------------------------------------------------------
// ArraySource – the narrow interface to raw data
// ---------------------------------------------------------------------------

/// Supplies raw per-object columns for named datasets.
///
/// Read-only from the engine's point of view; implementations must be
/// shareable across worker threads.
pub trait ArraySource: Send + Sync {
    /// Names of the available datasets.
    fn list_datasets(&self) -> BTreeSet<String>;

    /// Presentation config (well image URL templates, ...).
    fn config(&self, dataset: &str) -> Result<DatasetConfig>;

    /// Selected numeric columns for every object.
    fn columns(&self, dataset: &str, column_names: &[String]) -> Result<FeatureTable>;

    /// One dense numeric column indexed by object id.
    fn numeric_column(&self, dataset: &str, feature: &str) -> Result<Arc<[f64]>>;

    /// Ordered names of the image-derived feature columns.
    fn image_feature_names(&self, dataset: &str) -> Result<Vec<String>>;

    /// Plate / row / column of every object.
    fn well_index_columns(&self, dataset: &str) -> Result<Arc<WellIndex>>;

    /// A deterministic `n`-row subset of the image feature table.
    fn object_sample(&self, dataset: &str, n: usize) -> Result<FeatureTable>;

    /// Per-well annotations; empty when the dataset has none.
    fn well_annotations(&self, _dataset: &str) -> Result<WellAnnotations> {
        Ok(WellAnnotations::default())
    }

    /// Whether `dataset` is known.
    fn contains(&self, dataset: &str) -> bool {
        self.list_datasets().contains(dataset)
    }
}

// ---------------------------------------------------------------------------
// TableStore – sources backed by whole in-memory tables
// ---------------------------------------------------------------------------

/// A source that can hand out a complete [`DatasetTable`] per dataset.
/// Every `TableStore` is an [`ArraySource`].
pub trait TableStore: Send + Sync {
    fn names(&self) -> BTreeSet<String>;

    fn table(&self, dataset: &str) -> Result<Arc<DatasetTable>>;
}

impl<T: TableStore> ArraySource for T {
    fn list_datasets(&self) -> BTreeSet<String> {
        self.names()
    }

    fn config(&self, dataset: &str) -> Result<DatasetConfig> {
        Ok(self.table(dataset)?.config.clone())
    }

    fn columns(&self, dataset: &str, column_names: &[String]) -> Result<FeatureTable> {
        let table = self.table(dataset)?;
        let objects: Vec<ObjectId> = (0..table.len()).collect();
        rows(&table, dataset, column_names, &objects)
    }

    fn numeric_column(&self, dataset: &str, feature: &str) -> Result<Arc<[f64]>> {
        self.table(dataset)?
            .columns
            .get(feature)
            .cloned()
            .ok_or_else(|| anyhow!("dataset '{dataset}' has no column '{feature}'"))
    }

    fn image_feature_names(&self, dataset: &str) -> Result<Vec<String>> {
        Ok(self.table(dataset)?.features.clone())
    }

    fn well_index_columns(&self, dataset: &str) -> Result<Arc<WellIndex>> {
        Ok(Arc::clone(&self.table(dataset)?.well_index))
    }

    fn object_sample(&self, dataset: &str, n: usize) -> Result<FeatureTable> {
        let table = self.table(dataset)?;
        let objects = sample_objects(table.len(), n);
        rows(&table, dataset, &table.features, &objects)
    }

    fn well_annotations(&self, dataset: &str) -> Result<WellAnnotations> {
        Ok(self.table(dataset)?.annotations.clone())
    }

    fn contains(&self, dataset: &str) -> bool {
        self.names().contains(dataset)
    }
}

// ---------------------------------------------------------------------------
// MemorySource – datasets held fully in memory
// ---------------------------------------------------------------------------

/// Seed for [`ArraySource::object_sample`], so samples are stable across runs.
const SAMPLE_SEED: u64 = 0x5eed;

/// An [`ArraySource`] over already materialised [`DatasetTable`]s.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    datasets: BTreeMap<String, Arc<DatasetTable>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a dataset.
    pub fn insert(&mut self, name: impl Into<String>, table: DatasetTable) {
        self.datasets.insert(name.into(), Arc::new(table));
    }

    pub fn with_dataset(mut self, name: impl Into<String>, table: DatasetTable) -> Self {
        self.insert(name, table);
        self
    }
}

impl TableStore for MemorySource {
    fn names(&self) -> BTreeSet<String> {
        self.datasets.keys().cloned().collect()
    }

    fn table(&self, dataset: &str) -> Result<Arc<DatasetTable>> {
        self.datasets
            .get(dataset)
            .cloned()
            .with_context(|| format!("no dataset named '{dataset}'"))
    }
}

/// Ascending, deterministic sample of `n` object ids out of `len`.
pub fn sample_objects(len: usize, n: usize) -> Vec<ObjectId> {
    if n >= len {
        return (0..len).collect();
    }
    let mut rng = StdRng::seed_from_u64(SAMPLE_SEED);
    let mut objects = rand::seq::index::sample(&mut rng, len, n).into_vec();
    objects.sort_unstable();
    objects
}

fn rows(
    table: &DatasetTable,
    dataset: &str,
    column_names: &[String],
    objects: &[ObjectId],
) -> Result<FeatureTable> {
    let mut columns = BTreeMap::new();
    for name in column_names {
        let values: Vec<f64> = match name.as_str() {
            "plate" => objects.iter().map(|&o| table.well_index.plate[o] as f64).collect(),
            "row" => objects.iter().map(|&o| table.well_index.row[o] as f64).collect(),
            "column" => objects.iter().map(|&o| table.well_index.column[o] as f64).collect(),
            _ => {
                let Some(column) = table.columns.get(name) else {
                    bail!("dataset '{dataset}' has no column '{name}'");
                };
                objects.iter().map(|&o| column[o]).collect()
            }
        };
        columns.insert(name.clone(), values);
    }
    Ok(FeatureTable {
        objects: objects.to_vec(),
        columns,
    })
}
