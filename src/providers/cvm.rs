use crate::core::model::{Cnpj, Source};
use crate::core::month::ReferenceMonth;
use crate::core::source::{Dataset, FetchOutcome, RawTable, SourceBatch, SourceFetcher};
use crate::normalize::columns;
use crate::providers::util::{Download, decode_text, download_to_file, read_delimited, read_zip_entry};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://dados.cvm.gov.br/dados";

/// Which entry of a downloaded archive holds the rows of a dataset.
#[derive(Debug, Clone, Copy)]
enum EntryMatch {
    FirstCsv,
    Containing(&'static str),
}

impl EntryMatch {
    fn matches(&self, lowercase_name: &str) -> bool {
        match self {
            EntryMatch::FirstCsv => lowercase_name.ends_with(".csv"),
            EntryMatch::Containing(fragment) => lowercase_name.contains(fragment),
        }
    }
}

/// Daily (InfDiario) and monthly (InfMensal) disclosures published by CVM.
pub struct CvmFetcher {
    base_url: String,
    workdir: PathBuf,
    client: reqwest::Client,
    monitored: Arc<HashSet<Cnpj>>,
}

impl CvmFetcher {
    pub fn new(
        base_url: &str,
        workdir: &Path,
        client: reqwest::Client,
        monitored: HashSet<Cnpj>,
    ) -> Self {
        CvmFetcher {
            base_url: base_url.trim_end_matches('/').to_string(),
            workdir: workdir.join("cvm"),
            client,
            monitored: Arc::new(monitored),
        }
    }

    fn daily_urls(&self, month: ReferenceMonth) -> [String; 2] {
        let ym = month.compact();
        [
            format!("{}/FI/DOC/INF_DIARIO/DADOS/inf_diario_fi_{ym}.zip", self.base_url),
            format!("{}/FIM/DOC/INF_DIARIO/DADOS/inf_diario_fim_{ym}.zip", self.base_url),
        ]
    }

    fn monthly_url(&self, month: ReferenceMonth) -> String {
        format!(
            "{}/FI/DOC/INF_MENSAL/DADOS/inf_mensal_fi_{}.zip",
            self.base_url,
            month.compact()
        )
    }

    /// Downloads `url` into `<workdir>/cvm/<dataset_dir>/`; `None` once the
    /// location has been marked unavailable on `batch`.
    async fn download(
        &self,
        url: &str,
        dataset_dir: &str,
        batch: &mut SourceBatch,
    ) -> Result<Option<PathBuf>> {
        let file_name = url.rsplit('/').next().unwrap_or(url);
        let destination = self.workdir.join(dataset_dir).join(file_name);
        match download_to_file(&self.client, url, &destination).await? {
            Download::Saved(path) => Ok(Some(path)),
            Download::Missing { reason } => {
                warn!(%url, %reason, "CVM file unavailable");
                batch.mark_unavailable(url, reason);
                Ok(None)
            }
        }
    }

    /// Reads one archive entry off the async runtime.
    async fn read_entry(&self, archive: &Path, entry: EntryMatch) -> Result<Option<RawTable>> {
        let archive = archive.to_path_buf();
        let monitored = Arc::clone(&self.monitored);
        tokio::task::spawn_blocking(move || read_archive_table(&archive, entry, &monitored)).await?
    }

    async fn collect_entry(
        &self,
        url: &str,
        archive: &Path,
        entry: EntryMatch,
        dataset: Dataset,
        batch: &mut SourceBatch,
    ) -> Result<()> {
        match self.read_entry(archive, entry).await {
            Ok(Some(table)) => {
                debug!(%url, ?dataset, rows = table.len(), "Read CVM rows");
                batch.push(dataset, table);
            }
            Ok(None) => {
                warn!(%url, ?entry, "CVM archive has no matching entry");
                batch.mark_unavailable(url, format!("no entry matching {entry:?}"));
            }
            Err(e) => {
                warn!(%url, error = %format!("{e:#}"), "Failed to read CVM archive");
                batch.mark_unavailable(url, format!("{e:#}"));
            }
        }
        Ok(())
    }
}

/// Rows of funds outside `monitored` are dropped; rows whose CNPJ is blank or
/// malformed stay so normalization can reject and count them.
fn read_archive_table(
    archive: &Path,
    entry: EntryMatch,
    monitored: &HashSet<Cnpj>,
) -> Result<Option<RawTable>> {
    let Some((_, bytes)) = read_zip_entry(archive, |name| entry.matches(name))? else {
        return Ok(None);
    };
    let text = decode_text(&bytes);
    let table = read_delimited(&text, b';', |record| match record.get(columns::CNPJ) {
        Some(raw) => Cnpj::normalize(raw).is_none_or(|cnpj| monitored.contains(&cnpj)),
        None => true,
    })?;
    Ok(Some(table))
}

#[async_trait]
impl SourceFetcher for CvmFetcher {
    fn source(&self) -> Source {
        Source::Cvm
    }

    async fn fetch_month(&self, month: ReferenceMonth) -> Result<FetchOutcome> {
        let mut batch = SourceBatch::new(Source::Cvm, month);

        for url in self.daily_urls(month) {
            if let Some(archive) = self.download(&url, "inf_diario", &mut batch).await? {
                self.collect_entry(&url, &archive, EntryMatch::FirstCsv, Dataset::DailyQuota, &mut batch)
                    .await?;
            }
        }

        let url = self.monthly_url(month);
        if let Some(archive) = self.download(&url, "inf_mensal", &mut batch).await? {
            for (entry, dataset) in [
                (EntryMatch::Containing("carteira"), Dataset::Portfolio),
                (EntryMatch::Containing("cotist"), Dataset::Shareholders),
            ] {
                self.collect_entry(&url, &archive, entry, dataset, &mut batch)
                    .await?;
            }
        }

        Ok(batch.into_outcome())
    }
}
