//! Staging layer assembly: monitored-fund filter, priority-aware dedup,
//! deterministic ordering and configuration-driven dimensions.

use crate::core::config::PipelineConfig;
use crate::core::model::{
    Cnpj, DailyQuota, FundDimension, LabelDimension, PortfolioPosition, ShareholderMonth, Source,
    SourcedRow, TableRow,
};
use crate::core::month::ReferenceMonth;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Sources ordered from most to least trusted.
///
/// Sources missing from the list rank after every listed one, so a manual
/// export can only fill keys no better source provided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePriority(Vec<Source>);

impl SourcePriority {
    pub fn new(order: Vec<Source>) -> Self {
        Self(order)
    }

    /// Lower is better.
    pub fn rank(&self, source: Source) -> usize {
        self.0
            .iter()
            .position(|s| *s == source)
            .unwrap_or(self.0.len())
    }
}

impl Default for SourcePriority {
    fn default() -> Self {
        Self(Source::ALL.to_vec())
    }
}

/// Staging tables, each sorted by key.
#[derive(Debug, Clone, Default)]
pub struct StagingTables {
    pub daily_quotas: Vec<DailyQuota>,
    pub portfolio: Vec<PortfolioPosition>,
    pub shareholders: Vec<ShareholderMonth>,
    pub funds: Vec<FundDimension>,
    pub managers: Vec<LabelDimension>,
    pub cvm_categories: Vec<LabelDimension>,
    pub anbima_classes: Vec<LabelDimension>,
}

/// Accumulates normalized fact rows across months and sources.
pub struct StagingBuilder {
    priority: SourcePriority,
    monitored: HashSet<Cnpj>,
    daily_quotas: BTreeMap<(Cnpj, chrono::NaiveDate), DailyQuota>,
    portfolio: BTreeMap<(Cnpj, ReferenceMonth, String), PortfolioPosition>,
    shareholders: BTreeMap<(Cnpj, ReferenceMonth, String), ShareholderMonth>,
}

fn merge<R: SourcedRow>(map: &mut BTreeMap<R::Key, R>, priority: &SourcePriority, row: R) {
    let key = row.key();
    if let Some(existing) = map.get(&key) {
        if priority.rank(existing.source()) < priority.rank(row.source()) {
            return;
        }
    }
    map.insert(key, row);
}

impl StagingBuilder {
    pub fn new(priority: SourcePriority, monitored: HashSet<Cnpj>) -> Self {
        Self {
            priority,
            monitored,
            daily_quotas: BTreeMap::new(),
            portfolio: BTreeMap::new(),
            shareholders: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            SourcePriority::new(config.source_priority.clone()),
            config.monitored_funds(),
        )
    }

    /// Whether rows of this fund are kept at all.
    pub fn is_monitored(&self, cnpj: &Cnpj) -> bool {
        self.monitored.contains(cnpj)
    }

    /// Returns false when the row belongs to a fund outside the configuration.
    pub fn push_daily_quota(&mut self, row: DailyQuota) -> bool {
        if !self.is_monitored(&row.cnpj) {
            return false;
        }
        merge(&mut self.daily_quotas, &self.priority, row);
        true
    }

    /// A source lists each fund/month portfolio once, so a second row of the
    /// same source under an existing key is a distinct holding (two CDBs of
    /// one issuer, say). It is kept under `<ativo_id>#<n>`.
    pub fn push_portfolio_position(&mut self, mut row: PortfolioPosition) -> bool {
        if !self.is_monitored(&row.cnpj) {
            return false;
        }
        let base = row.asset_id.clone();
        let mut ordinal = 1;
        while self.holds_same_source_position(&row) {
            ordinal += 1;
            row.asset_id = format!("{base}#{ordinal}");
        }
        if ordinal > 1 {
            debug!(cnpj = %row.cnpj, asset = %row.asset_id, "Repeated position identifier");
        }
        merge(&mut self.portfolio, &self.priority, row);
        true
    }

    fn holds_same_source_position(&self, row: &PortfolioPosition) -> bool {
        self.portfolio
            .get(&row.key())
            .is_some_and(|existing| existing.source == row.source)
    }

    pub fn push_shareholder_month(&mut self, row: ShareholderMonth) -> bool {
        if !self.is_monitored(&row.cnpj) {
            return false;
        }
        merge(&mut self.shareholders, &self.priority, row);
        true
    }

    pub fn build(self, config: &PipelineConfig) -> StagingTables {
        let mut portfolio: Vec<PortfolioPosition> = self.portfolio.into_values().collect();
        assign_weights(&mut portfolio);

        let tables = StagingTables {
            daily_quotas: self.daily_quotas.into_values().collect(),
            portfolio,
            shareholders: self.shareholders.into_values().collect(),
            funds: fund_dimension(config),
            managers: label_dimension(config.funds.iter().map(|f| Some(&f.manager))),
            cvm_categories: label_dimension(config.funds.iter().map(|f| Some(&f.cvm_category))),
            anbima_classes: label_dimension(config.funds.iter().map(|f| f.anbima_class.as_ref())),
        };
        debug!(
            daily = tables.daily_quotas.len(),
            portfolio = tables.portfolio.len(),
            shareholders = tables.shareholders.len(),
            "Built staging tables"
        );
        tables
    }
}

/// Share of each position in its fund's total market value for the month.
fn assign_weights(positions: &mut [PortfolioPosition]) {
    let mut totals: HashMap<(Cnpj, ReferenceMonth), f64> = HashMap::new();
    for position in positions.iter() {
        if let Some(value) = position.market_value {
            *totals
                .entry((
                    position.cnpj.clone(),
                    ReferenceMonth::of(position.reference_date),
                ))
                .or_default() += value;
        }
    }
    for position in positions.iter_mut() {
        let total = totals
            .get(&(
                position.cnpj.clone(),
                ReferenceMonth::of(position.reference_date),
            ))
            .copied();
        position.weight = match (position.market_value, total) {
            (Some(value), Some(total)) if total != 0.0 => Some(value / total),
            _ => None,
        };
    }
}

fn fund_dimension(config: &PipelineConfig) -> Vec<FundDimension> {
    let mut funds: Vec<FundDimension> = config
        .funds
        .iter()
        .map(|fund| FundDimension {
            cnpj: fund.cnpj.clone(),
            name: fund.name.clone(),
            cvm_category: fund.cvm_category.clone(),
            manager: fund.manager.clone(),
            anbima_class: fund.anbima_class.clone(),
            dashboard_group: config.dashboard_group(fund),
        })
        .collect();
    funds.sort_by(|a, b| a.cnpj.cmp(&b.cnpj));
    funds
}

fn label_dimension<'a>(values: impl Iterator<Item = Option<&'a String>>) -> Vec<LabelDimension> {
    values
        .flatten()
        .filter(|value| !value.trim().is_empty())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(LabelDimension)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn config() -> PipelineConfig {
        serde_yaml::from_str(
            r#"
funds:
  - cnpj: "22222222000122"
    name: "Fundo B"
    cvm_category: "Renda Fixa"
    manager: "Gestora Y"
  - cnpj: "11111111000111"
    name: "Fundo A"
    cvm_category: "Ações"
    manager: "Gestora X"
    anbima_class: "Ações Livre"
  - cnpj: "33333333000133"
    name: "Fundo C"
    cvm_category: "Renda Fixa"
    manager: "Gestora X"
"#,
        )
        .unwrap()
    }

    fn cnpj(value: &str) -> Cnpj {
        Cnpj::normalize(value).unwrap()
    }

    fn quota(cnpj_value: &str, day: u32, value: f64, source: Source) -> DailyQuota {
        DailyQuota {
            cnpj: cnpj(cnpj_value),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            total_value: None,
            quota_value: value,
            net_assets: Some(100.0),
            inflows: None,
            redemptions: None,
            shareholders: None,
            source,
        }
    }

    fn position(asset: &str, value: Option<f64>) -> PortfolioPosition {
        PortfolioPosition {
            cnpj: cnpj("11111111000111"),
            reference_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            asset_id: asset.to_string(),
            asset_type: None,
            asset_subtype: None,
            issuer: None,
            sector: None,
            isin: None,
            market_value: value,
            quantity: None,
            weight: None,
            source: Source::Cvm,
        }
    }

    #[test]
    fn test_higher_priority_source_wins_regardless_of_order() {
        let config = config();
        let mut builder = StagingBuilder::from_config(&config);
        builder.push_daily_quota(quota("11111111000111", 2, 2.0, Source::Manual));
        builder.push_daily_quota(quota("11111111000111", 2, 1.0, Source::Cvm));
        builder.push_daily_quota(quota("11111111000111", 2, 3.0, Source::B3));
        builder.push_daily_quota(quota("11111111000111", 2, 4.0, Source::Manual));

        let tables = builder.build(&config);
        assert_eq!(tables.daily_quotas.len(), 1);
        assert_eq!(tables.daily_quotas[0].source, Source::Cvm);
        assert_eq!(tables.daily_quotas[0].quota_value, 1.0);
    }

    #[test]
    fn test_manual_fallback_only_fills_gaps() {
        let config = config();
        let mut builder = StagingBuilder::from_config(&config);
        builder.push_daily_quota(quota("11111111000111", 2, 1.0, Source::Cvm));
        builder.push_daily_quota(quota("11111111000111", 2, 9.0, Source::Manual));
        builder.push_daily_quota(quota("11111111000111", 3, 9.5, Source::Manual));

        let tables = builder.build(&config);
        let sources: Vec<_> = tables.daily_quotas.iter().map(|r| r.source).collect();
        assert_eq!(sources, vec![Source::Cvm, Source::Manual]);
    }

    #[test]
    fn test_same_source_last_write_wins() {
        let config = config();
        let mut builder = StagingBuilder::from_config(&config);
        builder.push_daily_quota(quota("11111111000111", 2, 1.0, Source::Cvm));
        builder.push_daily_quota(quota("11111111000111", 2, 1.1, Source::Cvm));

        let tables = builder.build(&config);
        assert_eq!(tables.daily_quotas[0].quota_value, 1.1);
    }

    #[test]
    fn test_configurable_priority() {
        let config = config();
        let mut builder = StagingBuilder::new(
            SourcePriority::new(vec![Source::Manual, Source::Cvm]),
            config.monitored_funds(),
        );
        builder.push_daily_quota(quota("11111111000111", 2, 1.0, Source::Cvm));
        builder.push_daily_quota(quota("11111111000111", 2, 2.0, Source::Manual));
        // B3 is unlisted and ranks last
        builder.push_daily_quota(quota("11111111000111", 3, 3.0, Source::Cvm));
        builder.push_daily_quota(quota("11111111000111", 3, 4.0, Source::B3));

        let tables = builder.build(&config);
        assert_eq!(tables.daily_quotas[0].source, Source::Manual);
        assert_eq!(tables.daily_quotas[1].source, Source::Cvm);
    }

    #[test]
    fn test_unmonitored_rows_are_dropped_and_output_is_sorted() {
        let config = config();
        let mut builder = StagingBuilder::from_config(&config);
        assert!(!builder.push_daily_quota(quota("99999999000199", 2, 1.0, Source::Cvm)));
        assert!(builder.push_daily_quota(quota("22222222000122", 3, 1.0, Source::Cvm)));
        assert!(builder.push_daily_quota(quota("11111111000111", 4, 1.0, Source::Cvm)));
        assert!(builder.push_daily_quota(quota("11111111000111", 2, 1.0, Source::Cvm)));

        let tables = builder.build(&config);
        let keys: Vec<(String, u32)> = tables
            .daily_quotas
            .iter()
            .map(|r| (r.cnpj.to_string(), chrono::Datelike::day(&r.date)))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("11111111000111".to_string(), 2),
                ("11111111000111".to_string(), 4),
                ("22222222000122".to_string(), 3),
            ]
        );
    }

    #[test]
    fn test_portfolio_weights() {
        let config = config();
        let mut builder = StagingBuilder::from_config(&config);
        builder.push_portfolio_position(position("A", Some(750.0)));
        builder.push_portfolio_position(position("B", Some(250.0)));
        builder.push_portfolio_position(position("C", None));

        let tables = builder.build(&config);
        let weights: Vec<_> = tables.portfolio.iter().map(|p| p.weight).collect();
        assert_eq!(weights, vec![Some(0.75), Some(0.25), None]);
    }

    #[test]
    fn test_repeated_position_identifier_keeps_every_holding() {
        let config = config();
        let mut builder = StagingBuilder::from_config(&config);
        builder.push_portfolio_position(position("CDB|Banco X", Some(600.0)));
        builder.push_portfolio_position(position("CDB|Banco X", Some(400.0)));
        let mut manual = position("CDB|Banco X", Some(1.0));
        manual.source = Source::Manual;
        builder.push_portfolio_position(manual);

        let tables = builder.build(&config);
        let rows: Vec<_> = tables
            .portfolio
            .iter()
            .map(|p| (p.asset_id.as_str(), p.market_value, p.weight, p.source))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("CDB|Banco X", Some(600.0), Some(0.6), Source::Cvm),
                ("CDB|Banco X#2", Some(400.0), Some(0.4), Source::Cvm),
            ]
        );
    }

    #[test]
    fn test_shareholder_classes_are_kept_apart() {
        let config = config();
        let holders = |class: &str, count: u64, source: Source| ShareholderMonth {
            cnpj: cnpj("11111111000111"),
            reference_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            shareholder_class: Some(class.to_string()),
            shareholders: Some(count),
            net_assets: None,
            source,
        };
        let mut builder = StagingBuilder::from_config(&config);
        builder.push_shareholder_month(holders("Pessoa fisica", 1000, Source::Cvm));
        builder.push_shareholder_month(holders("Pessoa juridica", 10, Source::Cvm));
        builder.push_shareholder_month(holders("Pessoa fisica", 999, Source::Manual));

        let tables = builder.build(&config);
        let rows: Vec<_> = tables
            .shareholders
            .iter()
            .map(|s| (s.shareholder_class.as_deref(), s.shareholders, s.source))
            .collect();
        assert_eq!(
            rows,
            vec![
                (Some("Pessoa fisica"), Some(1000), Source::Cvm),
                (Some("Pessoa juridica"), Some(10), Source::Cvm),
            ]
        );
    }

    #[test]
    fn test_dimensions_from_config() {
        let config = config();
        let tables = StagingBuilder::from_config(&config).build(&config);

        let cnpjs: Vec<_> = tables.funds.iter().map(|f| f.cnpj.to_string()).collect();
        assert_eq!(
            cnpjs,
            vec!["11111111000111", "22222222000122", "33333333000133"]
        );
        assert_eq!(
            tables.managers,
            vec![
                LabelDimension("Gestora X".to_string()),
                LabelDimension("Gestora Y".to_string())
            ]
        );
        assert_eq!(tables.cvm_categories.len(), 2);
        assert_eq!(
            tables.anbima_classes,
            vec![LabelDimension("Ações Livre".to_string())]
        );
        assert_eq!(tables.funds[1].dashboard_group, "Renda Fixa");
    }
}
