use crate::core::model::{Cnpj, Source};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::{fs, path::PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.yaml";

/// Upper bound for `retroactive_months` and `skip_recent_months`.
pub const MAX_MONTHS: u32 = 1200;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no funds configured")]
    NoFunds,
    #[error("fund {0} is listed more than once")]
    DuplicateFund(Cnpj),
    #[error("retroactive_months must be at least 1")]
    NoMonths,
    #[error("{field} must not exceed 1200")]
    TooManyMonths { field: &'static str },
    #[error("source {0} appears more than once in source_priority")]
    DuplicatePriority(Source),
    #[error("bigquery.{0} is required for warehouse uploads")]
    MissingWarehouseField(&'static str),
    #[error("b3 ingestion is enabled but no spreadsheets are listed")]
    NoSpreadsheets,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct FundConfig {
    pub cnpj: Cnpj,
    pub name: String,
    pub cvm_category: String,
    pub manager: String,
    #[serde(default)]
    pub anbima_class: Option<String>,
    #[serde(default)]
    pub dashboard_group: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Truncate,
    Append,
}

impl WriteMode {
    /// BigQuery `writeDisposition` value.
    pub fn disposition(&self) -> &'static str {
        match self {
            WriteMode::Truncate => "WRITE_TRUNCATE",
            WriteMode::Append => "WRITE_APPEND",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct BigQueryConfig {
    pub project: Option<String>,
    pub staging_dataset: Option<String>,
    pub curated_dataset: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    pub write_mode: WriteMode,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_job_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct B3Config {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub spreadsheets: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ManualFallbackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_manual_dir")]
    pub dir: PathBuf,
}

fn default_manual_dir() -> PathBuf {
    PathBuf::from("data/manual")
}

impl Default for ManualFallbackConfig {
    fn default() -> Self {
        ManualFallbackConfig {
            enabled: false,
            dir: default_manual_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CvmProviderConfig {
    pub base_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BigQueryProviderConfig {
    pub base_url: String,
    pub token_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProvidersConfig {
    #[serde(default = "default_cvm_provider")]
    pub cvm: CvmProviderConfig,
    #[serde(default = "default_bigquery_provider")]
    pub bigquery: BigQueryProviderConfig,
}

fn default_cvm_provider() -> CvmProviderConfig {
    CvmProviderConfig {
        base_url: crate::providers::cvm::DEFAULT_BASE_URL.to_string(),
    }
}

fn default_bigquery_provider() -> BigQueryProviderConfig {
    BigQueryProviderConfig {
        base_url: "https://bigquery.googleapis.com".to_string(),
        token_url: "https://oauth2.googleapis.com/token".to_string(),
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        ProvidersConfig {
            cvm: default_cvm_provider(),
            bigquery: default_bigquery_provider(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_retroactive_months")]
    pub retroactive_months: u32,
    #[serde(default)]
    pub skip_recent_months: u32,
    pub funds: Vec<FundConfig>,
    /// CVM category -> dashboard group, for funds without an explicit group.
    #[serde(default)]
    pub dashboard_groups: BTreeMap<String, String>,
    #[serde(default = "default_source_priority")]
    pub source_priority: Vec<Source>,
    #[serde(default)]
    pub b3: B3Config,
    #[serde(default)]
    pub manual_fallback: ManualFallbackConfig,
    #[serde(default)]
    pub bigquery: BigQueryConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

fn default_retroactive_months() -> u32 {
    24
}

fn default_source_priority() -> Vec<Source> {
    Source::ALL.to_vec()
}

impl PipelineConfig {
    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let mut config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }

    /// Cache directory for downloaded archives when `--workdir` is not given.
    pub fn default_workdir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("br", "siglo", "siglo-fundos")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.cache_dir().to_path_buf())
    }

    /// Warehouse identifiers from the environment win over the file.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(project) = lookup("BIGQUERY_PROJECT") {
            self.bigquery.project = Some(project);
        }
        if let Some(dataset) = lookup("BIGQUERY_DATASET_STAGING") {
            self.bigquery.staging_dataset = Some(dataset);
        }
        if let Some(dataset) = lookup("BIGQUERY_DATASET_CURATED") {
            self.bigquery.curated_dataset = Some(dataset);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.funds.is_empty() {
            return Err(ConfigError::NoFunds);
        }
        if self.retroactive_months == 0 {
            return Err(ConfigError::NoMonths);
        }
        for (field, value) in [
            ("retroactive_months", self.retroactive_months),
            ("skip_recent_months", self.skip_recent_months),
        ] {
            if value > MAX_MONTHS {
                return Err(ConfigError::TooManyMonths { field });
            }
        }
        let mut seen = HashSet::new();
        for fund in &self.funds {
            if !seen.insert(&fund.cnpj) {
                return Err(ConfigError::DuplicateFund(fund.cnpj.clone()));
            }
        }
        let mut sources = HashSet::new();
        for source in &self.source_priority {
            if !sources.insert(source) {
                return Err(ConfigError::DuplicatePriority(*source));
            }
        }
        if self.b3.enabled && self.b3.spreadsheets.is_empty() {
            return Err(ConfigError::NoSpreadsheets);
        }
        Ok(())
    }

    /// Checks the identifiers needed before any upload is attempted.
    pub fn validate_warehouse(&self) -> Result<(), ConfigError> {
        let required = [
            ("project", &self.bigquery.project),
            ("staging_dataset", &self.bigquery.staging_dataset),
            ("curated_dataset", &self.bigquery.curated_dataset),
        ];
        for (field, value) in required {
            if value.as_deref().is_none_or(str::is_empty) {
                return Err(ConfigError::MissingWarehouseField(field));
            }
        }
        Ok(())
    }

    pub fn monitored_funds(&self) -> HashSet<Cnpj> {
        self.funds.iter().map(|fund| fund.cnpj.clone()).collect()
    }

    /// Explicit fund group, then the category mapping, then the category itself.
    pub fn dashboard_group(&self, fund: &FundConfig) -> String {
        fund.dashboard_group
            .clone()
            .or_else(|| self.dashboard_groups.get(&fund.cvm_category).cloned())
            .unwrap_or_else(|| fund.cvm_category.clone())
    }
}
