use crate::core::model::Source;
use crate::core::month::ReferenceMonth;
use crate::core::source::{Dataset, FetchOutcome, SourceBatch, SourceFetcher};
use crate::providers::util::{decode_text, read_delimited};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const TERMS_URL: &str = "https://www.maisretorno.com/termos";

/// Operator-exported CSVs, named `<table>_YYYYMM.csv`, that fill gaps left by
/// the public sources.
pub struct ManualFallbackFetcher {
    dir: PathBuf,
}

impl ManualFallbackFetcher {
    pub fn new(dir: &Path) -> Self {
        warn!(
            "Manual fallback data exported from Mais Retorno must respect its terms of use: {}. \
             Check permission before collecting anything by hand.",
            TERMS_URL
        );
        info!(
            "Manual fallback reads <table>_YYYYMM.csv files from {}",
            dir.display()
        );
        ManualFallbackFetcher {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, dataset: Dataset, month: ReferenceMonth) -> PathBuf {
        self.dir
            .join(format!("{}_{}.csv", dataset.table().as_str(), month.compact()))
    }
}

#[async_trait]
impl SourceFetcher for ManualFallbackFetcher {
    fn source(&self) -> Source {
        Source::Manual
    }

    async fn fetch_month(&self, month: ReferenceMonth) -> Result<FetchOutcome> {
        let mut batch = SourceBatch::new(Source::Manual, month);

        for dataset in [Dataset::DailyQuota, Dataset::Portfolio, Dataset::Shareholders] {
            let path = self.path_for(dataset, month);
            let location = path.display().to_string();
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(%location, "No manual fallback file");
                    batch.mark_unavailable(&location, "file not found");
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read {location}"));
                }
            };
            match read_delimited(&decode_text(&bytes), b',', |_| true) {
                Ok(table) => {
                    debug!(%location, rows = table.len(), "Read manual fallback rows");
                    batch.push(dataset, table);
                }
                Err(e) => {
                    warn!(%location, error = %format!("{e:#}"), "Unreadable manual fallback file");
                    batch.mark_unavailable(&location, format!("{e:#}"));
                }
            }
        }

        Ok(batch.into_outcome())
    }
}
