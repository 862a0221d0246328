use crate::core::model::{Layer, TableName, TableRow};
use crate::core::source::RawTable;
use crate::providers::util::read_delimited;
use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Local output tree: `<root>/staging/<table>.csv` and `<root>/curated/<table>.csv`.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        DiskStore {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layer_dir(&self, layer: Layer) -> PathBuf {
        self.root.join(layer.dir_name())
    }

    pub fn path_for(&self, table: TableName) -> PathBuf {
        self.layer_dir(table.layer())
            .join(format!("{}.csv", table.as_str()))
    }

    /// Replaces the table's file with `rows`. The header is written even when
    /// there are no rows.
    pub fn write_table<R: TableRow>(&self, table: TableName, rows: &[R]) -> Result<PathBuf> {
        let path = self.path_for(table);
        let dir = self.layer_dir(table.layer());
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

        let tmp = dir.join(format!(".{}.csv.tmp", table.as_str()));
        {
            let mut writer = csv::Writer::from_path(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            writer.write_record(table.columns())?;
            for row in rows {
                writer.write_record(row.to_record())?;
            }
            writer
                .flush()
                .with_context(|| format!("Failed to write {}", tmp.display()))?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        debug!(%table, rows = rows.len(), path = %path.display(), "Wrote table");
        Ok(path)
    }

    /// CSV files already present, staging first, in table order. Files that
    /// do not name a known table of their layer are skipped with a warning.
    pub fn existing_tables(&self) -> Result<Vec<(TableName, PathBuf)>> {
        let mut found = Vec::new();
        for layer in [Layer::Staging, Layer::Curated] {
            let dir = self.layer_dir(layer);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to list {}", dir.display()));
                }
            };
            for entry in entries {
                let path = entry?.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("csv") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                match stem.parse::<TableName>() {
                    Ok(table) if table.layer() == layer => found.push((table, path)),
                    _ => warn!(path = %path.display(), "Ignoring CSV that names no known table"),
                }
            }
        }
        found.sort();
        Ok(found)
    }

    /// Reads a previously written table; `None` when its file does not exist.
    pub fn read_table(&self, table: TableName) -> Result<Option<RawTable>> {
        let path = self.path_for(table);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        let raw = read_delimited(&text, b',', |_| true)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(raw))
    }
}
