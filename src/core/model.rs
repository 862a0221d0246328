//! Canonical row shapes for the staging and curated layers

use crate::core::month::ReferenceMonth;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid CNPJ: {0}")]
pub struct InvalidCnpj(pub String);

/// Brazilian entity tax id, always held as 14 digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cnpj(String);

impl Cnpj {
    pub const DIGITS: usize = 14;

    /// Strips punctuation and restores leading zeros lost by spreadsheet tools.
    pub fn normalize(value: &str) -> Option<Cnpj> {
        let digits: String = value.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() || digits.len() > Self::DIGITS {
            return None;
        }
        Some(Cnpj(format!("{digits:0>14}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Cnpj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Cnpj {
    type Err = InvalidCnpj;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cnpj::normalize(s).ok_or_else(|| InvalidCnpj(s.to_string()))
    }
}

impl TryFrom<String> for Cnpj {
    type Error = InvalidCnpj;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cnpj> for String {
    fn from(value: Cnpj) -> Self {
        value.0
    }
}

/// Where a fact row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "cvm", alias = "CVM")]
    Cvm,
    #[serde(rename = "b3", alias = "B3")]
    B3,
    #[serde(rename = "manual", alias = "MANUAL")]
    Manual,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Cvm, Source::B3, Source::Manual];

    /// Value written to the `fonte` column.
    pub fn tag(&self) -> &'static str {
        match self {
            Source::Cvm => "CVM",
            Source::B3 => "B3",
            Source::Manual => "MANUAL",
        }
    }
}

impl Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Layer {
    Staging,
    Curated,
}

impl Layer {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Layer::Staging => "staging",
            Layer::Curated => "curated",
        }
    }
}

/// Fixed set of warehouse tables produced by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableName {
    FatoCotaDiaria,
    FatoCarteiraMensal,
    FatoCotistasMensal,
    DimFundo,
    DimGestora,
    DimCategoriaCvm,
    DimClasseAnbima,
    CuratedCotasPorCategoria,
    CuratedCotasPorGestora,
    CuratedCotasPorGrupoLooker,
}

impl TableName {
    pub const ALL: [TableName; 10] = [
        TableName::FatoCotaDiaria,
        TableName::FatoCarteiraMensal,
        TableName::FatoCotistasMensal,
        TableName::DimFundo,
        TableName::DimGestora,
        TableName::DimCategoriaCvm,
        TableName::DimClasseAnbima,
        TableName::CuratedCotasPorCategoria,
        TableName::CuratedCotasPorGestora,
        TableName::CuratedCotasPorGrupoLooker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::FatoCotaDiaria => "fato_cota_diaria",
            TableName::FatoCarteiraMensal => "fato_carteira_mensal",
            TableName::FatoCotistasMensal => "fato_cotistas_mensal",
            TableName::DimFundo => "dim_fundo",
            TableName::DimGestora => "dim_gestora",
            TableName::DimCategoriaCvm => "dim_categoria_cvm",
            TableName::DimClasseAnbima => "dim_classe_anbima",
            TableName::CuratedCotasPorCategoria => "curated_cotas_por_categoria",
            TableName::CuratedCotasPorGestora => "curated_cotas_por_gestora",
            TableName::CuratedCotasPorGrupoLooker => "curated_cotas_por_grupo_looker",
        }
    }

    pub fn layer(&self) -> Layer {
        match self {
            TableName::CuratedCotasPorCategoria
            | TableName::CuratedCotasPorGestora
            | TableName::CuratedCotasPorGrupoLooker => Layer::Curated,
            _ => Layer::Staging,
        }
    }

    /// Header row, in output order.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            TableName::FatoCotaDiaria => &[
                "cnpj",
                "data_cotacao",
                "valor_total",
                "valor_cota",
                "patrimonio_liquido",
                "captacoes",
                "resgates",
                "numero_cotistas",
                "fonte",
            ],
            TableName::FatoCarteiraMensal => &[
                "cnpj",
                "data_referencia",
                "ativo_id",
                "tipo_ativo",
                "subtipo_ativo",
                "emissor",
                "setor",
                "isin",
                "valor_mercado",
                "quantidade",
                "peso",
                "fonte",
            ],
            TableName::FatoCotistasMensal => &[
                "cnpj",
                "data_referencia",
                "classe_cotistas",
                "numero_cotistas",
                "patrimonio_liquido",
                "fonte",
            ],
            TableName::DimFundo => &[
                "cnpj",
                "nome",
                "categoria_cvm",
                "gestora",
                "classe_anbima",
                "grupo_looker",
            ],
            TableName::DimGestora => &["gestora"],
            TableName::DimCategoriaCvm => &["categoria_cvm"],
            TableName::DimClasseAnbima => &["classe_anbima"],
            TableName::CuratedCotasPorCategoria => &CURATED_COLUMNS_CATEGORIA,
            TableName::CuratedCotasPorGestora => &CURATED_COLUMNS_GESTORA,
            TableName::CuratedCotasPorGrupoLooker => &CURATED_COLUMNS_GRUPO,
        }
    }
}

const CURATED_COLUMNS_CATEGORIA: [&str; 6] = [
    "mes_referencia",
    "categoria_cvm",
    "valor_cota_medio",
    "patrimonio_liquido_total",
    "quantidade_fundos",
    "quantidade_registros",
];
const CURATED_COLUMNS_GESTORA: [&str; 6] = [
    "mes_referencia",
    "gestora",
    "valor_cota_medio",
    "patrimonio_liquido_total",
    "quantidade_fundos",
    "quantidade_registros",
];
const CURATED_COLUMNS_GRUPO: [&str; 6] = [
    "mes_referencia",
    "grupo_looker",
    "valor_cota_medio",
    "patrimonio_liquido_total",
    "quantidade_fundos",
    "quantidade_registros",
];

impl Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TableName::ALL
            .into_iter()
            .find(|table| table.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown table: {}", s))
    }
}

/// A row that can be written as one line of its table.
pub trait TableRow {
    type Key: Ord + Clone;

    fn key(&self) -> Self::Key;

    /// Field values in the order of `TableName::columns`.
    fn to_record(&self) -> Vec<String>;
}

/// A fact row that remembers its origin, for priority-aware dedup.
pub trait SourcedRow: TableRow {
    fn source(&self) -> Source;
}

fn opt_number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn opt_text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyQuota {
    pub cnpj: Cnpj,
    pub date: NaiveDate,
    pub total_value: Option<f64>,
    pub quota_value: f64,
    pub net_assets: Option<f64>,
    pub inflows: Option<f64>,
    pub redemptions: Option<f64>,
    pub shareholders: Option<u64>,
    pub source: Source,
}

impl TableRow for DailyQuota {
    type Key = (Cnpj, NaiveDate);

    fn key(&self) -> Self::Key {
        (self.cnpj.clone(), self.date)
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.cnpj.to_string(),
            self.date.to_string(),
            opt_number(self.total_value),
            self.quota_value.to_string(),
            opt_number(self.net_assets),
            opt_number(self.inflows),
            opt_number(self.redemptions),
            self.shareholders.map(|n| n.to_string()).unwrap_or_default(),
            self.source.tag().to_string(),
        ]
    }
}

impl SourcedRow for DailyQuota {
    fn source(&self) -> Source {
        self.source
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioPosition {
    pub cnpj: Cnpj,
    pub reference_date: NaiveDate,
    /// ISIN when disclosed, otherwise `tipo_ativo|emissor`.
    pub asset_id: String,
    pub asset_type: Option<String>,
    pub asset_subtype: Option<String>,
    pub issuer: Option<String>,
    pub sector: Option<String>,
    pub isin: Option<String>,
    pub market_value: Option<f64>,
    pub quantity: Option<f64>,
    pub weight: Option<f64>,
    pub source: Source,
}

impl TableRow for PortfolioPosition {
    type Key = (Cnpj, ReferenceMonth, String);

    fn key(&self) -> Self::Key {
        (
            self.cnpj.clone(),
            ReferenceMonth::of(self.reference_date),
            self.asset_id.clone(),
        )
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.cnpj.to_string(),
            self.reference_date.to_string(),
            self.asset_id.clone(),
            opt_text(&self.asset_type),
            opt_text(&self.asset_subtype),
            opt_text(&self.issuer),
            opt_text(&self.sector),
            opt_text(&self.isin),
            opt_number(self.market_value),
            opt_number(self.quantity),
            opt_number(self.weight),
            self.source.tag().to_string(),
        ]
    }
}

impl SourcedRow for PortfolioPosition {
    fn source(&self) -> Source {
        self.source
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShareholderMonth {
    pub cnpj: Cnpj,
    pub reference_date: NaiveDate,
    pub shareholder_class: Option<String>,
    pub shareholders: Option<u64>,
    pub net_assets: Option<f64>,
    pub source: Source,
}

impl TableRow for ShareholderMonth {
    /// CVM reports one row per shareholder class, so the class is part of the key.
    type Key = (Cnpj, ReferenceMonth, String);

    fn key(&self) -> Self::Key {
        (
            self.cnpj.clone(),
            ReferenceMonth::of(self.reference_date),
            self.shareholder_class.clone().unwrap_or_default(),
        )
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.cnpj.to_string(),
            self.reference_date.to_string(),
            opt_text(&self.shareholder_class),
            self.shareholders.map(|n| n.to_string()).unwrap_or_default(),
            opt_number(self.net_assets),
            self.source.tag().to_string(),
        ]
    }
}

impl SourcedRow for ShareholderMonth {
    fn source(&self) -> Source {
        self.source
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FundDimension {
    pub cnpj: Cnpj,
    pub name: String,
    pub cvm_category: String,
    pub manager: String,
    pub anbima_class: Option<String>,
    pub dashboard_group: String,
}

impl TableRow for FundDimension {
    type Key = Cnpj;

    fn key(&self) -> Self::Key {
        self.cnpj.clone()
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.cnpj.to_string(),
            self.name.clone(),
            self.cvm_category.clone(),
            self.manager.clone(),
            opt_text(&self.anbima_class),
            self.dashboard_group.clone(),
        ]
    }
}

/// Single-column dimension (`dim_gestora`, `dim_categoria_cvm`, `dim_classe_anbima`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LabelDimension(pub String);

impl TableRow for LabelDimension {
    type Key = String;

    fn key(&self) -> Self::Key {
        self.0.clone()
    }

    fn to_record(&self) -> Vec<String> {
        vec![self.0.clone()]
    }
}

/// One group/month of a curated table.
#[derive(Debug, Clone, PartialEq)]
pub struct CuratedQuota {
    pub month: ReferenceMonth,
    pub group: String,
    pub mean_quota: f64,
    pub total_net_assets: Option<f64>,
    pub funds: usize,
    pub records: usize,
}

impl TableRow for CuratedQuota {
    type Key = (ReferenceMonth, String);

    fn key(&self) -> Self::Key {
        (self.month, self.group.clone())
    }

    fn to_record(&self) -> Vec<String> {
        vec![
            self.month.first_day_iso(),
            self.group.clone(),
            self.mean_quota.to_string(),
            opt_number(self.total_net_assets),
            self.funds.to_string(),
            self.records.to_string(),
        ]
    }
}
