//! Pure per-record transforms from source-shaped rows to canonical rows.
//!
//! Column lookup goes through alias lists covering the CVM layouts, B3
//! spreadsheet exports and the canonical staging names, so a staging file read
//! back through these functions yields the same rows.

use crate::core::model::{Cnpj, DailyQuota, PortfolioPosition, ShareholderMonth, Source};
use crate::core::source::RawRecord;
use chrono::NaiveDate;
use thiserror::Error;

/// Column aliases, canonical name first.
pub mod columns {
    pub const CNPJ: &[&str] = &["cnpj", "cnpj_fundo_classe", "cnpj_fundo", "cnpj do fundo"];
    pub const QUOTE_DATE: &[&str] = &[
        "data_cotacao",
        "dt_comptc",
        "data de referência",
        "data de referencia",
        "data_referencia",
        "data",
    ];
    pub const REFERENCE_DATE: &[&str] = &["data_referencia", "dt_comptc", "data"];
    pub const TOTAL_VALUE: &[&str] = &["valor_total", "vl_total"];
    pub const QUOTA_VALUE: &[&str] = &["valor_cota", "vl_quota", "valor da cota"];
    pub const NET_ASSETS: &[&str] = &[
        "patrimonio_liquido",
        "vl_patrim_liq",
        "patrimônio líquido",
        "patrimonio liquido",
    ];
    pub const INFLOWS: &[&str] = &["captacoes", "captc_dia"];
    pub const REDEMPTIONS: &[&str] = &["resgates", "resg_dia"];
    pub const SHAREHOLDERS: &[&str] = &["numero_cotistas", "nr_cotst", "qt_cotistas"];
    pub const SHAREHOLDER_CLASS: &[&str] = &["classe_cotistas"];
    pub const ASSET_ID: &[&str] = &["ativo_id"];
    pub const ASSET_TYPE: &[&str] = &["tipo_ativo", "tp_aplic"];
    pub const ASSET_SUBTYPE: &[&str] = &["subtipo_ativo", "tp_ativo"];
    pub const ISSUER: &[&str] = &["emissor"];
    pub const SECTOR: &[&str] = &["setor"];
    pub const ISIN: &[&str] = &["isin", "cod_isin"];
    pub const MARKET_VALUE: &[&str] = &["valor_mercado", "vl_merc_pos_final"];
    pub const QUANTITY: &[&str] = &["quantidade", "qt_pos_final"];
    pub const SOURCE: &[&str] = &["fonte"];
}

/// Why a raw record did not make it into staging.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid CNPJ `{0}`")]
    InvalidCnpj(String),
    #[error("invalid date `{value}` in `{field}`")]
    InvalidDate { field: &'static str, value: String },
    #[error("invalid number `{value}` in `{field}`")]
    InvalidNumber { field: &'static str, value: String },
    #[error("unknown source tag `{0}`")]
    UnknownSource(String),
}

/// Reads the `fonte` tag written with every fact row.
pub fn source_tag(record: &RawRecord<'_>) -> Result<Source, Rejection> {
    let tag = record
        .get(columns::SOURCE)
        .ok_or(Rejection::MissingField("fonte"))?;
    Source::ALL
        .into_iter()
        .find(|source| source.tag().eq_ignore_ascii_case(tag))
        .ok_or_else(|| Rejection::UnknownSource(tag.to_string()))
}

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"];

/// Parses the date part of `value`; a trailing time component is ignored.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let date_part = value.trim().split([' ', 'T']).next()?;
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
}

/// Accepts `1234.56`, `1234,56` and `1.234,56`.
pub fn parse_number(value: &str) -> Option<f64> {
    let value = value.trim();
    let canonical = if value.contains(',') {
        value.replace('.', "").replace(',', ".")
    } else {
        value.to_string()
    };
    canonical.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn required<'a>(
    record: &RawRecord<'a>,
    aliases: &[&str],
    field: &'static str,
) -> Result<&'a str, Rejection> {
    record.get(aliases).ok_or(Rejection::MissingField(field))
}

fn cnpj(record: &RawRecord<'_>) -> Result<Cnpj, Rejection> {
    let value = required(record, columns::CNPJ, "cnpj")?;
    Cnpj::normalize(value).ok_or_else(|| Rejection::InvalidCnpj(value.to_string()))
}

fn date(
    record: &RawRecord<'_>,
    aliases: &[&str],
    field: &'static str,
) -> Result<NaiveDate, Rejection> {
    let value = required(record, aliases, field)?;
    parse_date(value).ok_or_else(|| Rejection::InvalidDate {
        field,
        value: value.to_string(),
    })
}

fn number(record: &RawRecord<'_>, aliases: &[&str], field: &'static str) -> Result<f64, Rejection> {
    let value = required(record, aliases, field)?;
    parse_number(value).ok_or_else(|| Rejection::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

fn optional_number(
    record: &RawRecord<'_>,
    aliases: &[&str],
    field: &'static str,
) -> Result<Option<f64>, Rejection> {
    record
        .get(aliases)
        .map(|value| {
            parse_number(value).ok_or_else(|| Rejection::InvalidNumber {
                field,
                value: value.to_string(),
            })
        })
        .transpose()
}

fn optional_count(
    record: &RawRecord<'_>,
    aliases: &[&str],
    field: &'static str,
) -> Result<Option<u64>, Rejection> {
    record
        .get(aliases)
        .map(|value| {
            parse_number(value)
                .filter(|n| *n >= 0.0 && n.fract() == 0.0)
                .map(|n| n as u64)
                .ok_or_else(|| Rejection::InvalidNumber {
                    field,
                    value: value.to_string(),
                })
        })
        .transpose()
}

fn optional_text(record: &RawRecord<'_>, aliases: &[&str]) -> Option<String> {
    record.get(aliases).map(str::to_string)
}

pub fn daily_quota(record: &RawRecord<'_>, source: Source) -> Result<DailyQuota, Rejection> {
    Ok(DailyQuota {
        cnpj: cnpj(record)?,
        date: date(record, columns::QUOTE_DATE, "data_cotacao")?,
        total_value: optional_number(record, columns::TOTAL_VALUE, "valor_total")?,
        quota_value: number(record, columns::QUOTA_VALUE, "valor_cota")?,
        net_assets: optional_number(record, columns::NET_ASSETS, "patrimonio_liquido")?,
        inflows: optional_number(record, columns::INFLOWS, "captacoes")?,
        redemptions: optional_number(record, columns::REDEMPTIONS, "resgates")?,
        shareholders: optional_count(record, columns::SHAREHOLDERS, "numero_cotistas")?,
        source,
    })
}

pub fn portfolio_position(
    record: &RawRecord<'_>,
    source: Source,
) -> Result<PortfolioPosition, Rejection> {
    let cnpj = cnpj(record)?;
    let reference_date = date(record, columns::REFERENCE_DATE, "data_referencia")?;
    let asset_type = optional_text(record, columns::ASSET_TYPE);
    let issuer = optional_text(record, columns::ISSUER);
    let isin = optional_text(record, columns::ISIN);

    let asset_id = optional_text(record, columns::ASSET_ID)
        .or_else(|| isin.clone())
        .or_else(|| match (&asset_type, &issuer) {
            (None, None) => None,
            (kind, issuer) => Some(format!(
                "{}|{}",
                kind.as_deref().unwrap_or_default(),
                issuer.as_deref().unwrap_or_default()
            )),
        })
        .ok_or(Rejection::MissingField("ativo_id"))?;

    Ok(PortfolioPosition {
        cnpj,
        reference_date,
        asset_id,
        asset_type,
        asset_subtype: optional_text(record, columns::ASSET_SUBTYPE),
        issuer,
        sector: optional_text(record, columns::SECTOR),
        isin,
        market_value: optional_number(record, columns::MARKET_VALUE, "valor_mercado")?,
        quantity: optional_number(record, columns::QUANTITY, "quantidade")?,
        weight: None,
        source,
    })
}

pub fn shareholder_month(
    record: &RawRecord<'_>,
    source: Source,
) -> Result<ShareholderMonth, Rejection> {
    Ok(ShareholderMonth {
        cnpj: cnpj(record)?,
        reference_date: date(record, columns::REFERENCE_DATE, "data_referencia")?,
        shareholder_class: optional_text(record, columns::SHAREHOLDER_CLASS),
        shareholders: optional_count(record, columns::SHAREHOLDERS, "numero_cotistas")?,
        net_assets: optional_number(record, columns::NET_ASSETS, "patrimonio_liquido")?,
        source,
    })
}
