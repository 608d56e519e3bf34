use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arrow::array::{Array, ArrayRef, Float32Array, Float64Array, Int32Array, Int64Array};
use arrow::datatypes::DataType;
use log::{debug, info};
use parking_lot::Mutex;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;

use super::model::{DatasetConfig, DatasetTable, MetadataValue, SYSTEM_COLUMNS, WellAnnotations, WellCoord, WellIndex};
use super::source::TableStore;

// ---------------------------------------------------------------------------
// Public entry-point
// ---------------------------------------------------------------------------

/// Load a per-object feature table from a file.  Dispatch by extension.
///
/// Every format must carry integer `plate`, `row` and `column` columns; all
/// other numeric columns become image features in file order. Non-numeric
/// columns are ignored.
///
/// Supported formats:
/// * `.parquet` – flat numeric columns (recommended)
/// * `.json`    – `[{ "plate": 0, "row": 1, "column": 2, "area": 310.5, ... }, ...]`
/// * `.csv`     – header row with column names
pub fn load_file(path: &Path) -> Result<DatasetTable> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let raw = match ext.as_str() {
        "parquet" | "pq" => load_parquet(path)?,
        "json" => load_json(path)?,
        "csv" => load_csv(path)?,
        other => bail!("Unsupported file extension: .{other}"),
    };
    raw.into_table()
        .with_context(|| format!("building dataset from {}", path.display()))
}

/// Columns as read from disk, before system columns are split off.
#[derive(Default)]
struct RawColumns {
    order: Vec<String>,
    values: BTreeMap<String, Vec<f64>>,
}

impl RawColumns {
    fn push(&mut self, name: &str, values: impl IntoIterator<Item = f64>) {
        if !self.values.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.values.entry(name.to_string()).or_default().extend(values);
    }

    fn into_table(mut self) -> Result<DatasetTable> {
        let mut system = Vec::with_capacity(3);
        for name in SYSTEM_COLUMNS {
            let values = self
                .values
                .remove(name)
                .with_context(|| format!("missing system column '{name}'"))?;
            let ints = values
                .iter()
                .enumerate()
                .map(|(row, &v)| {
                    if v.is_finite() && v.fract() == 0.0 {
                        Ok(v as i64)
                    } else {
                        bail!("row {row}: '{name}' value {v} is not an integer")
                    }
                })
                .collect::<Result<Vec<i64>>>()?;
            system.push(ints);
        }
        let column = system.pop().unwrap_or_default();
        let row = system.pop().unwrap_or_default();
        let plate = system.pop().unwrap_or_default();
        let well_index = WellIndex::new(plate, row, column)?;

        let features = self
            .order
            .into_iter()
            .filter_map(|name| self.values.remove(&name).map(|v| (name, v)))
            .collect();
        DatasetTable::from_columns(well_index, features)
    }
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Records-oriented JSON, the default `df.to_json(orient='records')`.
/// A key holding any non-numeric, non-null value is not a feature.
fn load_json(path: &Path) -> Result<RawColumns> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let root: JsonValue = serde_json::from_str(&text).context("parsing JSON")?;

    let records = root.as_array().context("Expected top-level JSON array")?;

    let mut order: Vec<String> = Vec::new();
    let mut non_numeric: BTreeSet<String> = BTreeSet::new();
    for (i, rec) in records.iter().enumerate() {
        let obj = rec
            .as_object()
            .with_context(|| format!("Row {i} is not a JSON object"))?;
        for (key, val) in obj {
            if !order.contains(key) {
                order.push(key.clone());
            }
            if !(val.is_number() || val.is_null()) {
                non_numeric.insert(key.clone());
            }
        }
    }

    let mut raw = RawColumns::default();
    for key in order.iter().filter(|k| !non_numeric.contains(*k)) {
        let values = records
            .iter()
            .map(|rec| rec.get(key).and_then(JsonValue::as_f64).unwrap_or(f64::NAN));
        raw.push(key, values);
    }
    Ok(raw)
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

/// Header row with column names; empty cells read as NaN. A column with any
/// cell that is neither empty nor a number is not a feature.
fn load_csv(path: &Path) -> Result<RawColumns> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut cells: Vec<Vec<f64>> = vec![Vec::new(); headers.len()];
    let mut numeric = vec![true; headers.len()];

    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;
        for (col_idx, value) in record.iter().enumerate().take(headers.len()) {
            let value = value.trim();
            if value.is_empty() {
                cells[col_idx].push(f64::NAN);
            } else if let Ok(v) = value.parse::<f64>() {
                cells[col_idx].push(v);
            } else {
                numeric[col_idx] = false;
            }
        }
    }

    let mut raw = RawColumns::default();
    for ((name, values), is_numeric) in headers.iter().zip(cells).zip(numeric) {
        if is_numeric {
            raw.push(name, values);
        }
    }
    Ok(raw)
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet file of flat per-object columns.
///
/// Works with files written by both **Pandas** (`df.to_parquet()`) and
/// **Polars** (`df.write_parquet()`).
fn load_parquet(path: &Path) -> Result<RawColumns> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?;
    let reader = builder.build().context("building parquet reader")?;

    let mut raw = RawColumns::default();

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let schema = batch.schema();

        for (idx, field) in schema.fields().iter().enumerate() {
            if let Some(values) = extract_f64_column(batch.column(idx)) {
                raw.push(field.name(), values);
            } else {
                debug!("skipping non-numeric column '{}' ({:?})", field.name(), field.data_type());
            }
        }
    }

    Ok(raw)
}

// -- Parquet / Arrow helpers --

/// Read a numeric Arrow column as `f64`, nulls as NaN. `None` for other types.
fn extract_f64_column(col: &ArrayRef) -> Option<Vec<f64>> {
    fn collect<I: Iterator<Item = Option<f64>>>(iter: I) -> Vec<f64> {
        iter.map(|v| v.unwrap_or(f64::NAN)).collect()
    }

    let any = col.as_any();
    match col.data_type() {
        DataType::Float64 => any
            .downcast_ref::<Float64Array>()
            .map(|a| collect(a.iter())),
        DataType::Float32 => any
            .downcast_ref::<Float32Array>()
            .map(|a| collect(a.iter().map(|v| v.map(f64::from)))),
        DataType::Int64 => any
            .downcast_ref::<Int64Array>()
            .map(|a| collect(a.iter().map(|v| v.map(|i| i as f64)))),
        DataType::Int32 => any
            .downcast_ref::<Int32Array>()
            .map(|a| collect(a.iter().map(|v| v.map(f64::from)))),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Side files: config and well annotations
// ---------------------------------------------------------------------------

/// Read a `<name>.config.json` dataset config.
pub fn load_config(path: &Path) -> Result<DatasetConfig> {
    let text = std::fs::read_to_string(path).context("reading dataset config")?;
    serde_json::from_str(&text).context("parsing dataset config")
}

/// Read a tab separated well annotation table with `plate`, `column`, `row`
/// columns plus any number of annotation columns.
pub fn load_well_annotations(path: &Path) -> Result<WellAnnotations> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .context("opening well annotations")?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading well annotation headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let position = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .with_context(|| format!("well annotations missing '{name}' column"))
    };
    let (plate_idx, row_idx, column_idx) = (position("plate")?, position("row")?, position("column")?);
    let columns: Vec<String> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| ![plate_idx, row_idx, column_idx].contains(i))
        .map(|(_, h)| h.clone())
        .collect();

    let mut wells = BTreeMap::new();
    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("well annotation row {row_no}"))?;
        let int_at = |idx: usize| -> Result<i64> {
            let cell = record.get(idx).unwrap_or("").trim();
            cell.parse()
                .with_context(|| format!("well annotation row {row_no}: '{cell}' is not an integer"))
        };
        let coord = WellCoord::new(int_at(plate_idx)?, int_at(row_idx)?, int_at(column_idx)?);

        let mut values = BTreeMap::new();
        for (col_idx, value) in record.iter().enumerate() {
            if col_idx == plate_idx || col_idx == row_idx || col_idx == column_idx {
                continue;
            }
            if let Some(name) = headers.get(col_idx) {
                values.insert(name.clone(), MetadataValue::guess(value.trim()));
            }
        }
        wells.insert(coord.label(), values);
    }

    Ok(WellAnnotations { columns, wells })
}

// ---------------------------------------------------------------------------
// DirectorySource – one dataset per data file in a directory
// ---------------------------------------------------------------------------

const DATA_EXTENSIONS: [&str; 4] = ["parquet", "pq", "csv", "json"];

/// An [`ArraySource`](super::source::ArraySource) over a directory of data
/// files. Datasets are loaded on first use and kept for the process lifetime.
///
/// ```text
///  data/
///    cellmorph.parquet        per-object table
///    cellmorph.config.json    optional DatasetConfig
///    cellmorph.wells.tab      optional well annotations
/// ```
pub struct DirectorySource {
    files: BTreeMap<String, PathBuf>,
    loaded: Mutex<BTreeMap<String, Arc<Mutex<Option<Arc<DatasetTable>>>>>>,
}

impl DirectorySource {
    /// Scan `dir` for dataset files.
    pub fn open(dir: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("listing data directory {}", dir.display()))?;
        for entry in entries {
            let path = entry.context("reading data directory entry")?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.ends_with(".config.json") {
                continue;
            }
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_ascii_lowercase();
            if !DATA_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Some(previous) = files.insert(stem.to_string(), path.clone()) {
                    bail!(
                        "dataset '{stem}' is ambiguous: {} and {}",
                        previous.display(),
                        path.display()
                    );
                }
            }
        }
        info!("found {} dataset(s) in {}", files.len(), dir.display());
        Ok(DirectorySource {
            files,
            loaded: Mutex::new(BTreeMap::new()),
        })
    }

    fn load(&self, dataset: &str, path: &Path) -> Result<DatasetTable> {
        info!("loading dataset '{dataset}' from {}", path.display());
        let mut table = load_file(path)?;

        let config_path = path.with_file_name(format!("{dataset}.config.json"));
        if config_path.exists() {
            table = table.with_config(load_config(&config_path)?)?;
        }
        let wells_path = path.with_file_name(format!("{dataset}.wells.tab"));
        if wells_path.exists() {
            table = table.with_annotations(load_well_annotations(&wells_path)?);
        }
        info!(
            "dataset '{dataset}': {} objects, {} image features",
            table.len(),
            table.features.len()
        );
        Ok(table)
    }
}

impl TableStore for DirectorySource {
    fn names(&self) -> BTreeSet<String> {
        self.files.keys().cloned().collect()
    }

    fn table(&self, dataset: &str) -> Result<Arc<DatasetTable>> {
        let path = self
            .files
            .get(dataset)
            .with_context(|| format!("no dataset named '{dataset}'"))?;

        // One slot per dataset so a slow load does not block other datasets.
        let slot = Arc::clone(self.loaded.lock().entry(dataset.to_string()).or_default());
        let mut guard = slot.lock();
        if let Some(table) = guard.as_ref() {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(self.load(dataset, path)?);
        *guard = Some(Arc::clone(&table));
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::source::ArraySource;

    #[test]
    fn csv_tables_split_system_and_feature_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plate.csv");
        std::fs::write(
            &path,
            "plate,row,column,area,gene,intensity\n0,1,2,10.5,PLK1,3\n0,1,3,,AURKB,4\n",
        )
        .unwrap();

        let table = load_file(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.features, vec!["area", "intensity"]);
        assert!(table.columns["area"][1].is_nan());
        assert_eq!(table.well_index.column, vec![2, 3]);
    }

    #[test]
    fn json_tables_require_system_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, r#"[{"plate": 0, "row": 0, "area": 1.0}]"#).unwrap();
        let err = load_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("column"));
    }

    #[test]
    fn directory_source_reads_side_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("screen.json"),
            r#"[{"plate": 0, "row": 0, "column": 0, "a": 1.0, "b": 2.0},
                {"plate": 0, "row": 0, "column": 1, "a": 3.0, "b": 4.0}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("screen.config.json"),
            r#"{"well_images": {"dapi": "img/{plate}_{row}_{column}.png"}, "image_features": ["b"]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("screen.wells.tab"),
            "plate\tcolumn\trow\tGene\n0\t1\t0\tPLK1|AURKB\n",
        )
        .unwrap();

        let source = DirectorySource::open(dir.path()).unwrap();
        assert_eq!(source.list_datasets().into_iter().collect::<Vec<_>>(), vec!["screen"]);
        assert_eq!(source.image_feature_names("screen").unwrap(), vec!["b"]);
        assert_eq!(&*source.numeric_column("screen", "a").unwrap(), &[1.0, 3.0]);
        assert_eq!(source.config("screen").unwrap().well_images.len(), 1);

        let annotations = source.well_annotations("screen").unwrap();
        assert_eq!(annotations.columns, vec!["Gene"]);
        assert_eq!(
            annotations.wells["0_1_0"]["Gene"],
            MetadataValue::String("PLK1|AURKB".into())
        );
    }
}
