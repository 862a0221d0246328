pub mod bigquery;
pub mod disk;
pub mod memory;

use crate::core::config::WriteMode;
use crate::core::model::TableName;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{error, info};

pub use bigquery::BigQueryLoader;
pub use disk::DiskStore;
pub use memory::MemoryWarehouse;

/// Destination that accepts one CSV file per table.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Loads `csv` (header included) into `table`, waiting until the load has
    /// finished.
    async fn load_csv(&self, table: TableName, csv: Vec<u8>, mode: WriteMode) -> Result<()>;
}

/// A table whose load failed; the remaining tables were still attempted.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadFailure {
    pub table: TableName,
    pub reason: String,
}

/// Uploads every file in order, recording failures instead of stopping.
pub async fn upload_tables(
    warehouse: &dyn Warehouse,
    files: &[(TableName, PathBuf)],
    mode: WriteMode,
) -> (Vec<TableName>, Vec<LoadFailure>) {
    let mut loaded = Vec::new();
    let mut failures = Vec::new();

    for (table, path) in files {
        let result = async {
            let csv = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            warehouse.load_csv(*table, csv, mode).await
        }
        .await;

        match result {
            Ok(()) => {
                info!(%table, "Loaded table into warehouse");
                loaded.push(*table);
            }
            Err(e) => {
                error!(%table, error = %format!("{e:#}"), "Warehouse load failed");
                failures.push(LoadFailure {
                    table: *table,
                    reason: format!("{e:#}"),
                });
            }
        }
    }

    (loaded, failures)
}
