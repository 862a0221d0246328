//! Month-by-month collection across sources, followed by staging, curation
//! and local output.

use crate::core::config::PipelineConfig;
use crate::core::model::{Source, TableName, TableRow};
use crate::core::month::ReferenceMonth;
use crate::core::source::{Dataset, FetchOutcome, RawRecord, RawTable, SourceFetcher, Unavailable};
use crate::curated::{self, CuratedTables};
use crate::frontend::FrontendExport;
use crate::normalize::{self, Rejection};
use crate::providers::util::http_client;
use crate::providers::{B3Fetcher, CvmFetcher, ManualFallbackFetcher};
use crate::staging::{StagingBuilder, StagingTables};
use crate::store::{DiskStore, LoadFailure};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything the run learned while collecting source data.
#[derive(Debug, Default)]
pub struct CollectReport {
    pub months: Vec<ReferenceMonth>,
    pub unavailable: Vec<Unavailable>,
    pub rejections: BTreeMap<TableName, usize>,
    /// Normalized rows accepted per source, before dedup.
    pub accepted: BTreeMap<Source, usize>,
}

impl CollectReport {
    pub fn total_rejections(&self) -> usize {
        self.rejections.values().sum()
    }

    fn reject(&mut self, table: TableName, rejection: &Rejection) {
        debug!(%table, %rejection, "Rejected record");
        *self.rejections.entry(table).or_default() += 1;
    }
}

pub struct Collected {
    pub staging: StagingTables,
    pub curated: CuratedTables,
    pub report: CollectReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WrittenTable {
    pub table: TableName,
    pub path: PathBuf,
    pub rows: usize,
}

/// Outcome of one command, rendered at the end of the run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub collect: Option<CollectReport>,
    pub written: Vec<WrittenTable>,
    pub uploaded: Vec<TableName>,
    pub load_failures: Vec<LoadFailure>,
    pub frontend: Option<FrontendExport>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        !self.load_failures.is_empty()
    }
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    fetchers: Vec<Box<dyn SourceFetcher>>,
}

impl Pipeline {
    /// CVM is always read; B3 and the manual fallback only when enabled.
    pub fn from_config(config: Arc<PipelineConfig>, workdir: &Path) -> Result<Self> {
        let client = http_client()?;
        let mut fetchers: Vec<Box<dyn SourceFetcher>> = vec![Box::new(CvmFetcher::new(
            &config.providers.cvm.base_url,
            workdir,
            client.clone(),
            config.monitored_funds(),
        ))];
        if config.b3.enabled {
            fetchers.push(Box::new(B3Fetcher::new(
                config.b3.spreadsheets.clone(),
                client,
                config.monitored_funds(),
            )));
        }
        if config.manual_fallback.enabled {
            fetchers.push(Box::new(ManualFallbackFetcher::new(
                &config.manual_fallback.dir,
            )));
        }
        Ok(Self::with_fetchers(config, fetchers))
    }

    pub fn with_fetchers(config: Arc<PipelineConfig>, fetchers: Vec<Box<dyn SourceFetcher>>) -> Self {
        Pipeline { config, fetchers }
    }

    pub fn sources(&self) -> Vec<Source> {
        self.fetchers.iter().map(|fetcher| fetcher.source()).collect()
    }

    pub fn requested_months(&self, reference: ReferenceMonth) -> Result<Vec<ReferenceMonth>> {
        ReferenceMonth::requested_range(
            reference,
            self.config.retroactive_months,
            self.config.skip_recent_months,
        )
    }

    /// Fetches and normalizes every month from every source, then builds the
    /// staging and curated tables. `on_month` is called after each month.
    pub async fn collect<F>(&self, months: &[ReferenceMonth], on_month: F) -> Result<Collected>
    where
        F: Fn(ReferenceMonth),
    {
        let mut builder = StagingBuilder::from_config(&self.config);
        let mut report = CollectReport {
            months: months.to_vec(),
            ..Default::default()
        };

        for &month in months {
            for fetcher in &self.fetchers {
                match fetcher.fetch_month(month).await? {
                    FetchOutcome::Fetched(batch) => {
                        for (dataset, table) in &batch.tables {
                            ingest_table(&mut builder, &mut report, batch.source, *dataset, table);
                        }
                        report.unavailable.extend(batch.unavailable);
                    }
                    FetchOutcome::Unavailable(missing) => {
                        if !missing.is_empty() {
                            warn!(source = %fetcher.source(), %month, "Source unavailable, month skipped");
                        }
                        report.unavailable.extend(missing);
                    }
                }
            }
            on_month(month);
        }

        for (table, count) in &report.rejections {
            warn!(%table, count, "Malformed records rejected");
        }

        let staging = builder.build(&self.config);
        let curated = curated::build(&staging);
        info!(
            months = months.len(),
            daily = staging.daily_quotas.len(),
            portfolio = staging.portfolio.len(),
            shareholders = staging.shareholders.len(),
            "Collected source data"
        );
        Ok(Collected {
            staging,
            curated,
            report,
        })
    }
}

/// Normalizes one record into the builder. `Ok(false)` means the fund is
/// outside the configuration.
fn ingest_record(
    builder: &mut StagingBuilder,
    source: Source,
    dataset: Dataset,
    record: &RawRecord<'_>,
) -> Result<bool, Rejection> {
    match dataset {
        Dataset::DailyQuota => {
            normalize::daily_quota(record, source).map(|row| builder.push_daily_quota(row))
        }
        Dataset::Portfolio => normalize::portfolio_position(record, source)
            .map(|row| builder.push_portfolio_position(row)),
        Dataset::Shareholders => normalize::shareholder_month(record, source)
            .map(|row| builder.push_shareholder_month(row)),
    }
}

fn ingest_table(
    builder: &mut StagingBuilder,
    report: &mut CollectReport,
    source: Source,
    dataset: Dataset,
    table: &RawTable,
) {
    let mut accepted = 0;
    for record in table.records() {
        match ingest_record(builder, source, dataset, &record) {
            Ok(true) => accepted += 1,
            Ok(false) => {}
            Err(rejection) => report.reject(dataset.table(), &rejection),
        }
    }
    *report.accepted.entry(source).or_default() += accepted;
}

/// Rebuilds staging tables from a previous run's CSV output.
///
/// Each row keeps the source recorded in its `fonte` column; rows without a
/// known tag are rejected.
pub fn read_staging(
    store: &DiskStore,
    config: &PipelineConfig,
) -> Result<(StagingTables, CollectReport)> {
    let mut builder = StagingBuilder::from_config(config);
    let mut report = CollectReport::default();

    for dataset in [Dataset::DailyQuota, Dataset::Portfolio, Dataset::Shareholders] {
        let Some(table) = store.read_table(dataset.table())? else {
            warn!(table = %dataset.table(), "No staging file found");
            continue;
        };
        for record in table.records() {
            let result = normalize::source_tag(&record)
                .and_then(|source| ingest_record(&mut builder, source, dataset, &record).map(|kept| (source, kept)));
            match result {
                Ok((source, true)) => *report.accepted.entry(source).or_default() += 1,
                Ok((_, false)) => {}
                Err(rejection) => report.reject(dataset.table(), &rejection),
            }
        }
    }

    Ok((builder.build(config), report))
}

fn write<R: TableRow>(
    store: &DiskStore,
    written: &mut Vec<WrittenTable>,
    table: TableName,
    rows: &[R],
) -> Result<()> {
    let path = store.write_table(table, rows)?;
    written.push(WrittenTable {
        table,
        path,
        rows: rows.len(),
    });
    Ok(())
}

/// Writes every staging and curated table, replacing earlier files.
pub fn write_outputs(
    store: &DiskStore,
    staging: &StagingTables,
    curated: &CuratedTables,
) -> Result<Vec<WrittenTable>> {
    let mut written = Vec::new();
    write(store, &mut written, TableName::FatoCotaDiaria, &staging.daily_quotas)?;
    write(store, &mut written, TableName::FatoCarteiraMensal, &staging.portfolio)?;
    write(store, &mut written, TableName::FatoCotistasMensal, &staging.shareholders)?;
    write(store, &mut written, TableName::DimFundo, &staging.funds)?;
    write(store, &mut written, TableName::DimGestora, &staging.managers)?;
    write(store, &mut written, TableName::DimCategoriaCvm, &staging.cvm_categories)?;
    write(store, &mut written, TableName::DimClasseAnbima, &staging.anbima_classes)?;
    write(store, &mut written, TableName::CuratedCotasPorCategoria, &curated.by_category)?;
    write(store, &mut written, TableName::CuratedCotasPorGestora, &curated.by_manager)?;
    write(store, &mut written, TableName::CuratedCotasPorGrupoLooker, &curated.by_dashboard_group)?;

    info!(root = %store.root().display(), tables = written.len(), "Wrote output tables");
    Ok(written)
}
