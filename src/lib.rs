//! Compute backend for exploring per-object image features of microplate
//! screens: scaling, exemplar-driven classification, object lookup,
//! per-population histograms and contour maps, and feature ordering.

pub mod api;
pub mod cache;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;

pub use config::EngineConfig;
pub use data::loader::DirectorySource;
pub use data::source::{ArraySource, MemorySource, TableStore};
pub use engine::Engine;
pub use error::{EngineError, ErrorKind, Result};
