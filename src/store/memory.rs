use crate::core::config::WriteMode;
use crate::core::model::TableName;
use crate::store::Warehouse;
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedLoad {
    pub table: TableName,
    pub csv: Vec<u8>,
    pub mode: WriteMode,
}

/// Warehouse that keeps every load in memory.
///
/// Tables registered with `with_failing` reject their loads, which lets the
/// failure path be exercised without a remote service.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    loads: Mutex<Vec<RecordedLoad>>,
    failing: HashSet<TableName>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failing(mut self, table: TableName) -> Self {
        self.failing.insert(table);
        self
    }

    pub fn loads(&self) -> Vec<RecordedLoad> {
        self.loads
            .lock()
            .map(|loads| loads.clone())
            .unwrap_or_default()
    }

    pub fn loaded_tables(&self) -> Vec<TableName> {
        self.loads().into_iter().map(|load| load.table).collect()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn load_csv(&self, table: TableName, csv: Vec<u8>, mode: WriteMode) -> Result<()> {
        if self.failing.contains(&table) {
            bail!("Load job for {table} rejected");
        }
        let mut loads = self
            .loads
            .lock()
            .map_err(|_| anyhow::anyhow!("Warehouse state poisoned"))?;
        loads.push(RecordedLoad { table, csv, mode });
        Ok(())
    }
}
