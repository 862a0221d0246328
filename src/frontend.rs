//! Static JSON payload for the dashboard frontend: one `index.json` plus one
//! file per fund under `funds/`.

use crate::core::model::{Cnpj, FundDimension, PortfolioPosition};
use crate::core::month::ReferenceMonth;
use crate::staging::StagingTables;
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const TOP_HOLDINGS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct FrontendExport {
    pub index: PathBuf,
    pub funds: usize,
}

#[derive(Debug, Serialize)]
struct Metadata<'a> {
    cnpj: &'a Cnpj,
    nome: &'a str,
    categoria_cvm: &'a str,
    gestora: &'a str,
    classe_anbima: Option<&'a str>,
    grupo_looker: &'a str,
}

impl<'a> From<&'a FundDimension> for Metadata<'a> {
    fn from(fund: &'a FundDimension) -> Self {
        Metadata {
            cnpj: &fund.cnpj,
            nome: &fund.name,
            categoria_cvm: &fund.cvm_category,
            gestora: &fund.manager,
            classe_anbima: fund.anbima_class.as_deref(),
            grupo_looker: &fund.dashboard_group,
        }
    }
}

#[derive(Debug, Serialize)]
struct IndexEntry<'a> {
    #[serde(flatten)]
    metadata: Metadata<'a>,
    dataset_path: String,
}

#[derive(Debug, Serialize)]
struct Index<'a> {
    generated_at: String,
    funds: Vec<IndexEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct DailyPoint {
    data: NaiveDate,
    valor_cota: f64,
    patrimonio_liquido: Option<f64>,
    numero_cotistas: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ShareholderPoint<'a> {
    data_referencia: NaiveDate,
    classe_cotistas: Option<&'a str>,
    numero_cotistas: Option<u64>,
    patrimonio_liquido: Option<f64>,
}

#[derive(Debug, Serialize)]
struct Series<'a> {
    daily: Vec<DailyPoint>,
    cotistas: Vec<ShareholderPoint<'a>>,
}

#[derive(Debug, Serialize)]
struct Holding<'a> {
    ativo_id: &'a str,
    tipo_ativo: Option<&'a str>,
    emissor: Option<&'a str>,
    isin: Option<&'a str>,
    valor_mercado: Option<f64>,
    peso: Option<f64>,
}

#[derive(Debug, Serialize)]
struct LatestHoldings<'a> {
    data_referencia: Option<NaiveDate>,
    total: f64,
    top: Vec<Holding<'a>>,
}

#[derive(Debug, Serialize)]
struct FundPayload<'a> {
    metadata: Metadata<'a>,
    series: Series<'a>,
    latest_holdings: LatestHoldings<'a>,
}

fn dataset_path(cnpj: &Cnpj) -> String {
    format!("funds/{cnpj}.json")
}

fn latest_holdings<'a>(positions: &[&'a PortfolioPosition]) -> LatestHoldings<'a> {
    let latest_month = positions
        .iter()
        .map(|p| ReferenceMonth::of(p.reference_date))
        .max();
    let mut current: Vec<&PortfolioPosition> = positions
        .iter()
        .copied()
        .filter(|p| latest_month.is_some_and(|month| month.contains(p.reference_date)))
        .collect();
    let latest = current.iter().map(|p| p.reference_date).max();
    let total = current.iter().filter_map(|p| p.market_value).sum();
    current.sort_by(|a, b| {
        b.market_value
            .unwrap_or(f64::MIN)
            .partial_cmp(&a.market_value.unwrap_or(f64::MIN))
            .unwrap_or(Ordering::Equal)
    });

    LatestHoldings {
        data_referencia: latest,
        total,
        top: current
            .into_iter()
            .take(TOP_HOLDINGS)
            .map(|p| Holding {
                ativo_id: &p.asset_id,
                tipo_ativo: p.asset_type.as_deref(),
                emissor: p.issuer.as_deref(),
                isin: p.isin.as_deref(),
                valor_mercado: p.market_value,
                peso: p.weight,
            })
            .collect(),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

/// Writes the payload for every fund of `staging.funds` into `dir`.
pub fn export_payload(staging: &StagingTables, dir: &Path) -> Result<FrontendExport> {
    let funds_dir = dir.join("funds");
    fs::create_dir_all(&funds_dir)
        .with_context(|| format!("Failed to create directory: {}", funds_dir.display()))?;

    for fund in &staging.funds {
        let daily = staging
            .daily_quotas
            .iter()
            .filter(|q| q.cnpj == fund.cnpj)
            .map(|q| DailyPoint {
                data: q.date,
                valor_cota: q.quota_value,
                patrimonio_liquido: q.net_assets,
                numero_cotistas: q.shareholders,
            })
            .collect();
        let cotistas = staging
            .shareholders
            .iter()
            .filter(|s| s.cnpj == fund.cnpj)
            .map(|s| ShareholderPoint {
                data_referencia: s.reference_date,
                classe_cotistas: s.shareholder_class.as_deref(),
                numero_cotistas: s.shareholders,
                patrimonio_liquido: s.net_assets,
            })
            .collect();
        let positions: Vec<&PortfolioPosition> = staging
            .portfolio
            .iter()
            .filter(|p| p.cnpj == fund.cnpj)
            .collect();

        let payload = FundPayload {
            metadata: Metadata::from(fund),
            series: Series { daily, cotistas },
            latest_holdings: latest_holdings(&positions),
        };
        let path = dir.join(dataset_path(&fund.cnpj));
        write_json(&path, &payload)?;
        debug!(cnpj = %fund.cnpj, path = %path.display(), "Wrote fund payload");
    }

    let index = Index {
        generated_at: Utc::now().to_rfc3339(),
        funds: staging
            .funds
            .iter()
            .map(|fund| IndexEntry {
                metadata: Metadata::from(fund),
                dataset_path: dataset_path(&fund.cnpj),
            })
            .collect(),
    };
    let index_path = dir.join("index.json");
    write_json(&index_path, &index)?;

    info!(dir = %dir.display(), funds = staging.funds.len(), "Exported frontend payload");
    Ok(FrontendExport {
        index: index_path,
        funds: staging.funds.len(),
    })
}
