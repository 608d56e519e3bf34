/// Data layer: core types, request parameters, and raw column sources.
///
/// Architecture:
/// ```text
///  .parquet / .csv / .json  (+ .config.json, .wells.tab)
///        │
///        ▼
///   ┌──────────┐
///   │  loader   │  parse file → DatasetTable, DirectorySource
///   └──────────┘
///        │
///        ▼
///   ┌──────────────┐
///   │ ArraySource   │  columns, well index, config, samples
///   └──────────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  params   │  canonical feature / exemplar / probe sets
///   └──────────┘
/// ```

pub mod loader;
pub mod model;
pub mod params;
pub mod source;
