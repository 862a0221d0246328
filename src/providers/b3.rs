use crate::core::model::{Cnpj, Source};
use crate::core::month::ReferenceMonth;
use crate::core::source::{Dataset, FetchOutcome, RawTable, SourceBatch, SourceFetcher};
use crate::normalize::{columns, parse_date};
use crate::providers::util::{decode_text, detect_delimiter, read_delimited};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// One spreadsheet export split by the month of each row.
#[derive(Debug)]
struct Sheet {
    by_month: BTreeMap<ReferenceMonth, RawTable>,
    /// Rows whose date could not be read.
    undated: RawTable,
}

#[derive(Debug, Default)]
struct LoadedSheets {
    sheets: Vec<Sheet>,
    failures: Vec<(String, String)>,
}

/// Supplementary daily quotas from B3 spreadsheet exports.
///
/// Every location is loaded once, on the first fetched month, and served from
/// memory afterwards.
pub struct B3Fetcher {
    locations: Vec<String>,
    client: reqwest::Client,
    monitored: HashSet<Cnpj>,
    loaded: OnceCell<LoadedSheets>,
    undated_delivered: AtomicBool,
}

impl B3Fetcher {
    pub fn new(locations: Vec<String>, client: reqwest::Client, monitored: HashSet<Cnpj>) -> Self {
        B3Fetcher {
            locations,
            client,
            monitored,
            loaded: OnceCell::new(),
            undated_delivered: AtomicBool::new(false),
        }
    }

    async fn read_location(&self, location: &str) -> Result<Vec<u8>> {
        if location.starts_with("http://") || location.starts_with("https://") {
            info!("Downloading B3 spreadsheet {}", location);
            let response = self.client.get(location).send().await?;
            let status = response.status();
            if !status.is_success() {
                bail!("HTTP {}", status.as_u16());
            }
            Ok(response.bytes().await?.to_vec())
        } else {
            info!("Loading local B3 spreadsheet {}", location);
            tokio::fs::read(location)
                .await
                .with_context(|| format!("Failed to read {location}"))
        }
    }

    fn parse_sheet(&self, bytes: &[u8]) -> Result<Sheet> {
        let text = decode_text(bytes);
        let table = read_delimited(&text, detect_delimiter(&text), |record| {
            match record.get(columns::CNPJ) {
                Some(raw) => Cnpj::normalize(raw).is_none_or(|cnpj| self.monitored.contains(&cnpj)),
                None => true,
            }
        })?;

        let months: Vec<Option<ReferenceMonth>> = table
            .records()
            .map(|record| {
                record
                    .get(columns::QUOTE_DATE)
                    .and_then(parse_date)
                    .map(ReferenceMonth::of)
            })
            .collect();
        let template = table.same_columns();

        let mut sheet = Sheet {
            by_month: BTreeMap::new(),
            undated: template.same_columns(),
        };
        for (row, month) in table.into_rows().into_iter().zip(months) {
            match month {
                Some(month) => sheet
                    .by_month
                    .entry(month)
                    .or_insert_with(|| template.same_columns())
                    .push(row),
                None => sheet.undated.push(row),
            }
        }
        Ok(sheet)
    }

    async fn load(&self) -> LoadedSheets {
        let mut loaded = LoadedSheets::default();
        for location in &self.locations {
            let parsed = match self.read_location(location).await {
                Ok(bytes) => self.parse_sheet(&bytes),
                Err(e) => Err(e),
            };
            match parsed {
                Ok(sheet) => {
                    debug!(%location, months = sheet.by_month.len(), "Loaded B3 spreadsheet");
                    loaded.sheets.push(sheet);
                }
                Err(e) => {
                    warn!(%location, error = %format!("{e:#}"), "Failed to load B3 spreadsheet");
                    loaded.failures.push((location.clone(), format!("{e:#}")));
                }
            }
        }
        if loaded.sheets.is_empty() {
            warn!("No B3 spreadsheet could be loaded");
        }
        loaded
    }
}

#[async_trait]
impl SourceFetcher for B3Fetcher {
    fn source(&self) -> Source {
        Source::B3
    }

    async fn fetch_month(&self, month: ReferenceMonth) -> Result<FetchOutcome> {
        let loaded = self.loaded.get_or_init(|| self.load()).await;
        let mut batch = SourceBatch::new(Source::B3, month);

        for (location, reason) in &loaded.failures {
            batch.mark_unavailable(location, reason.clone());
        }

        let deliver_undated = !self.undated_delivered.swap(true, Ordering::SeqCst);
        for sheet in &loaded.sheets {
            if let Some(table) = sheet.by_month.get(&month) {
                batch.push(Dataset::DailyQuota, table.clone());
            }
            if deliver_undated && !sheet.undated.is_empty() {
                batch.push(Dataset::DailyQuota, sheet.undated.clone());
            }
        }

        Ok(batch.into_outcome())
    }
}
