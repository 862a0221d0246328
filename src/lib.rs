pub mod cli;
pub mod core;
pub mod curated;
pub mod frontend;
pub mod normalize;
pub mod pipeline;
pub mod providers;
pub mod staging;
pub mod store;

pub use crate::core::config;

use crate::core::config::PipelineConfig;
use crate::core::model::Layer;
use crate::core::month::ReferenceMonth;
use crate::pipeline::{Pipeline, RunReport};
use crate::providers::util::http_client;
use crate::store::bigquery::Credentials;
use crate::store::{BigQueryLoader, DiskStore, Warehouse, upload_tables};
use anyhow::{Result, bail};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub enum AppCommand {
    Ingest { skip_bigquery: bool },
    ExportLocal,
    UploadBigquery,
    ExportFrontend { frontend_dir: Option<PathBuf> },
}

impl AppCommand {
    fn needs_warehouse(&self) -> bool {
        matches!(
            self,
            AppCommand::Ingest {
                skip_bigquery: false
            } | AppCommand::UploadBigquery
        )
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    pub output_dir: PathBuf,
    /// Download cache; the platform cache directory when `None`.
    pub workdir: Option<PathBuf>,
    /// Current month when `None`.
    pub reference_month: Option<ReferenceMonth>,
    pub show_progress: bool,
}

impl RunOptions {
    pub fn new<P: Into<PathBuf>>(config_path: P) -> Self {
        RunOptions {
            config_path: config_path.into(),
            output_dir: PathBuf::from("output"),
            workdir: None,
            reference_month: None,
            show_progress: false,
        }
    }
}

/// Runs a command against the BigQuery warehouse configured in the file.
pub async fn run_command(command: AppCommand, options: &RunOptions) -> Result<RunReport> {
    run_with_warehouse(command, options, None).await
}

/// Runs a command; `warehouse` replaces the BigQuery loader when given.
///
/// Configuration, including the warehouse identifiers when an upload is
/// involved, is validated before any file or network access.
pub async fn run_with_warehouse(
    command: AppCommand,
    options: &RunOptions,
    warehouse: Option<Arc<dyn Warehouse>>,
) -> Result<RunReport> {
    let config = Arc::new(PipelineConfig::load_from_path(&options.config_path)?);
    debug!("Loaded config: {config:#?}");

    let warehouse = if command.needs_warehouse() {
        config.validate_warehouse()?;
        Some(match warehouse {
            Some(warehouse) => warehouse,
            None => Arc::new(BigQueryLoader::from_config(
                &config,
                http_client()?,
                Credentials::from_env()?,
            )?) as Arc<dyn Warehouse>,
        })
    } else {
        None
    };

    let store = DiskStore::new(&options.output_dir);
    let mut report = RunReport::default();

    match command {
        AppCommand::Ingest { .. } | AppCommand::ExportLocal => {
            let workdir = match &options.workdir {
                Some(dir) => dir.clone(),
                None => PipelineConfig::default_workdir()?,
            };
            let runner = Pipeline::from_config(Arc::clone(&config), &workdir)?;
            let reference = options.reference_month.unwrap_or_else(ReferenceMonth::current);
            let months = runner.requested_months(reference)?;
            info!(
                sources = ?runner.sources(),
                first = %months.first().map(|m| m.to_string()).unwrap_or_default(),
                last = %reference,
                "Starting ingestion"
            );

            let pb = cli::ui::month_progress_bar(months.len(), options.show_progress);
            pb.set_message("Fetching");
            let collected = runner
                .collect(&months, |month| {
                    pb.set_message(format!("Fetched {month}"));
                    pb.inc(1);
                })
                .await?;
            pb.finish_and_clear();

            report.written =
                pipeline::write_outputs(&store, &collected.staging, &collected.curated)?;
            report.collect = Some(collected.report);
        }
        AppCommand::UploadBigquery => {}
        AppCommand::ExportFrontend { frontend_dir } => {
            let has_staging = store
                .existing_tables()?
                .iter()
                .any(|(table, _)| table.layer() == Layer::Staging);
            if !has_staging {
                bail!(
                    "No staging CSV found under {}; run 'export-local' or 'ingest' first",
                    store.root().display()
                );
            }
            let (staging, collect) = pipeline::read_staging(&store, &config)?;
            let dir = frontend_dir.unwrap_or_else(|| options.output_dir.join("frontend"));
            report.frontend = Some(frontend::export_payload(&staging, &dir)?);
            report.collect = Some(collect);
        }
    }

    if let Some(warehouse) = warehouse {
        let files: Vec<_> = if report.written.is_empty() {
            store.existing_tables()?
        } else {
            report
                .written
                .iter()
                .map(|written| (written.table, written.path.clone()))
                .collect()
        };
        if files.is_empty() {
            bail!(
                "No CSV found under {}; run 'export-local' or 'ingest' first",
                store.root().display()
            );
        }
        let (uploaded, failures) =
            upload_tables(warehouse.as_ref(), &files, config.bigquery.write_mode).await;
        report.uploaded = uploaded;
        report.load_failures = failures;
    }

    Ok(report)
}
