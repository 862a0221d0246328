use crate::core::config::{PipelineConfig, WriteMode};
use crate::core::model::{Layer, TableName};
use crate::store::Warehouse;
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

pub const ACCESS_TOKEN_ENV: &str = "BIGQUERY_ACCESS_TOKEN";
pub const CREDENTIALS_FILE_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

const BOUNDARY: &str = "siglo_fundos_load_boundary";

/// How the loader authenticates against the REST API.
#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    /// Bearer token used as-is.
    AccessToken(String),
    /// `authorized_user` credential exchanged for a token on first use.
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
}

#[derive(Debug, Deserialize)]
struct CredentialFile {
    #[serde(rename = "type")]
    kind: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(token) = lookup(ACCESS_TOKEN_ENV).filter(|t| !t.trim().is_empty()) {
            return Ok(Credentials::AccessToken(token.trim().to_string()));
        }
        let path = lookup(CREDENTIALS_FILE_ENV).ok_or_else(|| {
            anyhow!("No warehouse credentials: set {ACCESS_TOKEN_ENV} or {CREDENTIALS_FILE_ENV}")
        })?;
        Self::from_file(Path::new(&path))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials: {}", path.display()))?;
        let file: CredentialFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse credentials: {}", path.display()))?;
        match file {
            CredentialFile {
                kind,
                client_id: Some(client_id),
                client_secret: Some(client_secret),
                refresh_token: Some(refresh_token),
            } if kind == "authorized_user" => Ok(Credentials::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
            }),
            CredentialFile { kind, .. } => bail!(
                "Unsupported credential type '{kind}' in {}; use an authorized_user file or {ACCESS_TOKEN_ENV}",
                path.display()
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: JobReference,
    #[serde(default)]
    status: JobStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    state: String,
    error_result: Option<JobError>,
}

#[derive(Debug, Deserialize)]
struct JobError {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

/// Runs one BigQuery load job per table and waits for it to finish.
pub struct BigQueryLoader {
    client: reqwest::Client,
    base_url: String,
    token_url: String,
    project: String,
    staging_dataset: String,
    curated_dataset: String,
    location: Option<String>,
    poll_interval: Duration,
    job_timeout: Duration,
    credentials: Credentials,
    token: OnceCell<String>,
}

impl BigQueryLoader {
    /// Fails when the project or either dataset is missing.
    pub fn from_config(
        config: &PipelineConfig,
        client: reqwest::Client,
        credentials: Credentials,
    ) -> Result<Self> {
        config.validate_warehouse()?;
        let bigquery = &config.bigquery;
        Ok(BigQueryLoader {
            client,
            base_url: config.providers.bigquery.base_url.trim_end_matches('/').to_string(),
            token_url: config.providers.bigquery.token_url.clone(),
            project: bigquery.project.clone().unwrap_or_default(),
            staging_dataset: bigquery.staging_dataset.clone().unwrap_or_default(),
            curated_dataset: bigquery.curated_dataset.clone().unwrap_or_default(),
            location: bigquery.location.clone(),
            poll_interval: Duration::from_secs(bigquery.poll_interval_secs),
            job_timeout: Duration::from_secs(bigquery.job_timeout_secs),
            credentials,
            token: OnceCell::new(),
        })
    }

    fn dataset_for(&self, table: TableName) -> &str {
        match table.layer() {
            Layer::Staging => &self.staging_dataset,
            Layer::Curated => &self.curated_dataset,
        }
    }

    async fn access_token(&self) -> Result<&str> {
        let token = self
            .token
            .get_or_try_init(|| async {
                match &self.credentials {
                    Credentials::AccessToken(token) => Ok(token.clone()),
                    Credentials::AuthorizedUser {
                        client_id,
                        client_secret,
                        refresh_token,
                    } => self.refresh_token(client_id, client_secret, refresh_token).await,
                }
            })
            .await?;
        Ok(token.as_str())
    }

    async fn refresh_token(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<String> {
        debug!("Exchanging refresh token at {}", self.token_url);
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .context("Failed to reach the token endpoint")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Token refresh failed with HTTP {}: {}", status.as_u16(), body);
        }
        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;
        Ok(token.access_token)
    }

    fn job_configuration(&self, table: TableName, mode: WriteMode) -> serde_json::Value {
        let mut reference = json!({ "projectId": self.project });
        if let Some(location) = &self.location {
            reference["location"] = json!(location);
        }
        json!({
            "jobReference": reference,
            "configuration": {
                "load": {
                    "destinationTable": {
                        "projectId": self.project,
                        "datasetId": self.dataset_for(table),
                        "tableId": table.as_str(),
                    },
                    "sourceFormat": "CSV",
                    "skipLeadingRows": 1,
                    "autodetect": true,
                    "createDisposition": "CREATE_IF_NEEDED",
                    "writeDisposition": mode.disposition(),
                }
            }
        })
    }

    async fn insert_job(&self, table: TableName, csv: Vec<u8>, mode: WriteMode) -> Result<Job> {
        let metadata = serde_json::to_vec(&self.job_configuration(table, mode))?;
        let body = multipart_related(&metadata, &csv);
        let url = format!(
            "{}/upload/bigquery/v2/projects/{}/jobs?uploadType=multipart",
            self.base_url, self.project
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.access_token().await?)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={BOUNDARY}"),
            )
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to submit load job for {table}"))?;
        parse_job(response).await
    }

    async fn get_job(&self, job: &JobReference) -> Result<Job> {
        let mut url = format!(
            "{}/bigquery/v2/projects/{}/jobs/{}",
            self.base_url, self.project, job.job_id
        );
        if let Some(location) = job.location.as_ref().or(self.location.as_ref()) {
            url.push_str(&format!("?location={location}"));
        }
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.access_token().await?)
            .send()
            .await
            .with_context(|| format!("Failed to poll job {}", job.job_id))?;
        parse_job(response).await
    }
}

async fn parse_job(response: reqwest::Response) -> Result<Job> {
    let status = response.status();
    let body = response.text().await.context("Failed to read job response")?;
    if !status.is_success() {
        bail!("HTTP {}: {}", status.as_u16(), body);
    }
    serde_json::from_str(&body).with_context(|| format!("Unexpected job response: '{body}'"))
}

fn multipart_related(metadata: &[u8], csv: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + csv.len() + 256);
    body.extend_from_slice(
        format!("--{BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(metadata);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}\r\nContent-Type: text/csv\r\n\r\n").as_bytes());
    body.extend_from_slice(csv);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

#[async_trait]
impl Warehouse for BigQueryLoader {
    #[instrument(skip(self, csv))]
    async fn load_csv(&self, table: TableName, csv: Vec<u8>, mode: WriteMode) -> Result<()> {
        let started = Instant::now();
        let mut job = self.insert_job(table, csv, mode).await?;
        info!(job_id = %job.job_reference.job_id, "Submitted load job");

        while job.status.state != "DONE" {
            if started.elapsed() > self.job_timeout {
                bail!(
                    "Load job {} did not finish within {}s",
                    job.job_reference.job_id,
                    self.job_timeout.as_secs()
                );
            }
            tokio::time::sleep(self.poll_interval).await;
            job = self.get_job(&job.job_reference).await?;
            debug!(state = %job.status.state, "Polled load job");
        }

        if let Some(error) = job.status.error_result {
            bail!(
                "Load job {} failed ({}): {}",
                job.job_reference.job_id,
                error.reason,
                error.message
            );
        }
        Ok(())
    }
}
