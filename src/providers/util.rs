use crate::core::source::{RawRecord, RawTable};
use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord};
use futures::StreamExt;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Shared HTTP client for every provider.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("siglo-fundos/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

/// Result of a download attempt that did not fail locally.
#[derive(Debug)]
pub enum Download {
    Saved(PathBuf),
    /// The remote side did not deliver the file (HTTP status, network error).
    Missing { reason: String },
}

/// Streams `url` into `destination`, replacing any previous copy.
///
/// The body is written to a `.part` sibling and renamed once complete, so a
/// cut-off transfer never leaves a truncated archive behind. Only local I/O
/// failures are returned as `Err`.
pub async fn download_to_file(
    client: &reqwest::Client,
    url: &str,
    destination: &Path,
) -> Result<Download> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    info!("Downloading {}", url);
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => {
            return Ok(Download::Missing {
                reason: format!("request failed: {e}"),
            });
        }
    };
    let status = response.status();
    if !status.is_success() {
        return Ok(Download::Missing {
            reason: format!("HTTP {}", status.as_u16()),
        });
    }

    let part = part_path(destination);
    let mut file = tokio::fs::File::create(&part)
        .await
        .with_context(|| format!("Failed to create file: {}", part.display()))?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&part).await;
                return Ok(Download::Missing {
                    reason: format!("transfer interrupted: {e}"),
                });
            }
        };
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write file: {}", part.display()))?;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&part, destination)
        .await
        .with_context(|| format!("Failed to move download to {}", destination.display()))?;
    debug!("Saved download to {}", destination.display());
    Ok(Download::Saved(destination.to_path_buf()))
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// UTF-8 when valid, Latin-1 otherwise. CVM files are published in both.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Picks `;` or `,` from whichever appears more often in the header line.
pub fn detect_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or_default();
    let semicolons = header.matches(';').count();
    let commas = header.matches(',').count();
    if semicolons > commas { b';' } else { b',' }
}

/// Parses delimited text into a `RawTable`, keeping rows accepted by `keep`.
pub fn read_delimited<F>(text: &str, delimiter: u8, keep: F) -> Result<RawTable>
where
    F: Fn(&RawRecord<'_>) -> bool,
{
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader.headers().context("Failed to read header row")?.clone();
    let mut table = RawTable::new(&headers);

    let mut record = StringRecord::new();
    while reader
        .read_record(&mut record)
        .context("Failed to read delimited row")?
    {
        if keep(&table.record(&record)) {
            table.push(record.clone());
        }
    }
    Ok(table)
}

/// Reads the first entry of a zip archive whose lowercased name satisfies
/// `predicate`. `Ok(None)` when no entry matches.
pub fn read_zip_entry<P>(path: &Path, predicate: P) -> Result<Option<(String, Vec<u8>)>>
where
    P: Fn(&str) -> bool,
{
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open archive: {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Corrupt archive: {}", path.display()))?;

    for idx in 0..archive.len() {
        let mut entry = archive
            .by_index(idx)
            .with_context(|| format!("Corrupt entry in archive: {}", path.display()))?;
        let name = entry.name().to_string();
        if !predicate(&name.to_lowercase()) {
            continue;
        }
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read {name} from {}", path.display()))?;
        return Ok(Some((name, bytes)));
    }
    Ok(None)
}
