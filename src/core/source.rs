//! Source fetcher abstraction and the raw record shapes fetchers hand over

use crate::core::model::{Source, TableName};
use crate::core::month::ReferenceMonth;
use anyhow::Result;
use async_trait::async_trait;
use csv::StringRecord;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

/// Which fact table a raw file feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dataset {
    DailyQuota,
    Portfolio,
    Shareholders,
}

impl Dataset {
    pub fn table(&self) -> TableName {
        match self {
            Dataset::DailyQuota => TableName::FatoCotaDiaria,
            Dataset::Portfolio => TableName::FatoCarteiraMensal,
            Dataset::Shareholders => TableName::FatoCotistasMensal,
        }
    }
}

/// Rows of one delimited file, with header names trimmed and lowercased.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    columns: Arc<HashMap<String, usize>>,
    rows: Vec<StringRecord>,
}

impl RawTable {
    pub fn new(headers: &StringRecord) -> Self {
        let columns = headers
            .iter()
            .enumerate()
            .map(|(idx, name)| (normalize_header_name(name), idx))
            .collect();
        Self {
            columns: Arc::new(columns),
            rows: Vec::new(),
        }
    }

    /// Empty table sharing this table's header.
    pub fn same_columns(&self) -> Self {
        Self {
            columns: Arc::clone(&self.columns),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: StringRecord) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn record<'a>(&'a self, row: &'a StringRecord) -> RawRecord<'a> {
        RawRecord { table: self, row }
    }

    pub fn records(&self) -> impl Iterator<Item = RawRecord<'_>> {
        self.rows.iter().map(move |row| RawRecord { table: self, row })
    }

    pub fn into_rows(self) -> Vec<StringRecord> {
        self.rows
    }
}

fn normalize_header_name(name: &str) -> String {
    name.trim().trim_start_matches('\u{feff}').to_lowercase()
}

/// One source-shaped row; fields are looked up by alias.
#[derive(Debug, Clone, Copy)]
pub struct RawRecord<'a> {
    table: &'a RawTable,
    row: &'a StringRecord,
}

impl<'a> RawRecord<'a> {
    /// First non-empty value among the given column aliases.
    pub fn get(&self, aliases: &[&str]) -> Option<&'a str> {
        aliases.iter().find_map(|alias| {
            let idx = self.table.columns.get(*alias)?;
            self.row
                .get(*idx)
                .map(str::trim)
                .filter(|value| !value.is_empty())
        })
    }
}

/// A location that could not be read for a month.
#[derive(Debug, Clone, PartialEq)]
pub struct Unavailable {
    pub source: Source,
    pub month: ReferenceMonth,
    pub location: String,
    pub reason: String,
}

impl Display for Unavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}: {}",
            self.source, self.month, self.location, self.reason
        )
    }
}

/// Raw tables a source produced for one month.
#[derive(Debug)]
pub struct SourceBatch {
    pub source: Source,
    pub month: ReferenceMonth,
    pub tables: Vec<(Dataset, RawTable)>,
    /// Locations of this month that were missing while others were read.
    pub unavailable: Vec<Unavailable>,
}

impl SourceBatch {
    pub fn new(source: Source, month: ReferenceMonth) -> Self {
        Self {
            source,
            month,
            tables: Vec::new(),
            unavailable: Vec::new(),
        }
    }

    pub fn push(&mut self, dataset: Dataset, table: RawTable) {
        self.tables.push((dataset, table));
    }

    pub fn mark_unavailable(&mut self, location: &str, reason: impl Into<String>) {
        self.unavailable.push(Unavailable {
            source: self.source,
            month: self.month,
            location: location.to_string(),
            reason: reason.into(),
        });
    }

    /// `Unavailable` when nothing at all could be read.
    pub fn into_outcome(self) -> FetchOutcome {
        if self.tables.is_empty() {
            FetchOutcome::Unavailable(self.unavailable)
        } else {
            FetchOutcome::Fetched(self)
        }
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(SourceBatch),
    Unavailable(Vec<Unavailable>),
}

/// Retrieves the raw files of one source for a reference month.
///
/// Expected absence (missing file, HTTP 404, unreachable host) is reported as
/// `FetchOutcome::Unavailable`; `Err` is reserved for local failures such as
/// an unwritable cache directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn source(&self) -> Source;

    async fn fetch_month(&self, month: ReferenceMonth) -> Result<FetchOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_lookup_by_alias() {
        let mut table = RawTable::new(&StringRecord::from(vec!["\u{feff}CNPJ_FUNDO", " DT_COMPTC ", "VL_QUOTA"]));
        table.push(StringRecord::from(vec!["00.000.000/0001-91", "2024-01-02", " "]));

        let record = table.records().next().unwrap();
        assert_eq!(record.get(&["cnpj", "cnpj_fundo"]), Some("00.000.000/0001-91"));
        assert_eq!(record.get(&["dt_comptc"]), Some("2024-01-02"));
        // Blank values read as absent
        assert_eq!(record.get(&["vl_quota"]), None);
        assert_eq!(record.get(&["missing"]), None);
    }

    #[test]
    fn test_empty_batch_is_unavailable() {
        let month = ReferenceMonth::new(2024, 1).unwrap();
        let mut batch = SourceBatch::new(Source::Cvm, month);
        batch.mark_unavailable("http://example.com/a.zip", "HTTP 404");

        match batch.into_outcome() {
            FetchOutcome::Unavailable(missing) => {
                assert_eq!(missing.len(), 1);
                assert_eq!(missing[0].location, "http://example.com/a.zip");
            }
            FetchOutcome::Fetched(_) => panic!("Expected an unavailable outcome"),
        }
    }
}
