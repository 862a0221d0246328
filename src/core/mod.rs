//! Core types shared by fetchers, transforms and writers

pub mod config;
pub mod log;
pub mod model;
pub mod month;
pub mod source;

// Re-export main types for cleaner imports
pub use config::{FundConfig, PipelineConfig, WriteMode};
pub use model::{Cnpj, Layer, Source, TableName, TableRow};
pub use month::ReferenceMonth;
pub use source::{Dataset, FetchOutcome, RawRecord, RawTable, SourceBatch, SourceFetcher};
