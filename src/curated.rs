//! Curated aggregates over the daily quota staging table

use crate::core::model::{Cnpj, CuratedQuota, DailyQuota, FundDimension};
use crate::core::month::ReferenceMonth;
use crate::staging::StagingTables;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CuratedTables {
    pub by_category: Vec<CuratedQuota>,
    pub by_manager: Vec<CuratedQuota>,
    pub by_dashboard_group: Vec<CuratedQuota>,
}

#[derive(Default)]
struct Accumulator {
    quota_sum: f64,
    records: usize,
    /// Latest reported net assets per fund within the month.
    latest_net_assets: HashMap<Cnpj, (NaiveDate, f64)>,
    funds: HashSet<Cnpj>,
}

impl Accumulator {
    fn add(&mut self, row: &DailyQuota) {
        self.quota_sum += row.quota_value;
        self.records += 1;
        self.funds.insert(row.cnpj.clone());
        if let Some(net_assets) = row.net_assets {
            let entry = self
                .latest_net_assets
                .entry(row.cnpj.clone())
                .or_insert((row.date, net_assets));
            if row.date >= entry.0 {
                *entry = (row.date, net_assets);
            }
        }
    }

    fn finish(self, month: ReferenceMonth, group: String) -> CuratedQuota {
        let total_net_assets: Option<f64> = (!self.latest_net_assets.is_empty())
            .then(|| self.latest_net_assets.values().map(|(_, v)| v).sum());
        CuratedQuota {
            month,
            group,
            mean_quota: self.quota_sum / self.records as f64,
            total_net_assets,
            funds: self.funds.len(),
            records: self.records,
        }
    }
}

/// Groups daily quotas by `group_of(fund)` and month.
///
/// The mean is taken over every contributing row; the net asset total sums
/// each fund's last reported value in the month. A group/month with no
/// contributing rows produces no output row.
pub fn aggregate<F>(quotas: &[DailyQuota], funds: &[FundDimension], group_of: F) -> Vec<CuratedQuota>
where
    F: Fn(&FundDimension) -> &str,
{
    let by_cnpj: HashMap<&Cnpj, &FundDimension> = funds.iter().map(|f| (&f.cnpj, f)).collect();
    let mut groups: BTreeMap<(ReferenceMonth, String), Accumulator> = BTreeMap::new();

    for row in quotas {
        let Some(fund) = by_cnpj.get(&row.cnpj).copied() else {
            debug!(cnpj = %row.cnpj, "Skipping quota of fund without dimension row");
            continue;
        };
        groups
            .entry((ReferenceMonth::of(row.date), group_of(fund).to_string()))
            .or_default()
            .add(row);
    }

    groups
        .into_iter()
        .map(|((month, group), acc)| acc.finish(month, group))
        .collect()
}

pub fn build(staging: &StagingTables) -> CuratedTables {
    CuratedTables {
        by_category: aggregate(&staging.daily_quotas, &staging.funds, |f| f.cvm_category.as_str()),
        by_manager: aggregate(&staging.daily_quotas, &staging.funds, |f| f.manager.as_str()),
        by_dashboard_group: aggregate(&staging.daily_quotas, &staging.funds, |f| {
            f.dashboard_group.as_str()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Source;

    fn fund(cnpj: &str, category: &str, manager: &str, group: &str) -> FundDimension {
        FundDimension {
            cnpj: Cnpj::normalize(cnpj).unwrap(),
            name: format!("Fundo {cnpj}"),
            cvm_category: category.to_string(),
            manager: manager.to_string(),
            anbima_class: None,
            dashboard_group: group.to_string(),
        }
    }

    fn quota(cnpj: &str, date: (i32, u32, u32), value: f64, net_assets: Option<f64>) -> DailyQuota {
        DailyQuota {
            cnpj: Cnpj::normalize(cnpj).unwrap(),
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            total_value: None,
            quota_value: value,
            net_assets,
            inflows: None,
            redemptions: None,
            shareholders: None,
            source: Source::Cvm,
        }
    }

    fn funds() -> Vec<FundDimension> {
        vec![
            fund("1", "A", "G1", "Grupo1"),
            fund("2", "B", "G2", "Grupo2"),
            fund("3", "A", "G2", "Grupo2"),
        ]
    }

    #[test]
    fn test_curated_tables_grouping() {
        let quotas = vec![
            quota("1", (2023, 1, 2), 1.0, Some(100.0)),
            quota("1", (2023, 1, 3), 1.2, Some(120.0)),
            quota("3", (2023, 1, 3), 2.0, Some(50.0)),
            quota("2", (2023, 1, 3), 1.5, Some(200.0)),
        ];
        let staging = StagingTables {
            daily_quotas: quotas,
            funds: funds(),
            ..Default::default()
        };
        let curated = build(&staging);

        let by_category = &curated.by_category;
        assert_eq!(by_category.len(), 2);
        assert_eq!(by_category[0].group, "A");
        assert!((by_category[0].mean_quota - (1.0 + 1.2 + 2.0) / 3.0).abs() < 1e-9);
        // Month-end net assets of fund 1 (120) plus fund 3 (50)
        assert_eq!(by_category[0].total_net_assets, Some(170.0));
        assert_eq!(by_category[0].funds, 2);
        assert_eq!(by_category[0].records, 3);
        assert_eq!(by_category[1].group, "B");

        let managers: Vec<_> = curated.by_manager.iter().map(|r| r.group.as_str()).collect();
        assert_eq!(managers, vec!["G1", "G2"]);
        assert_eq!(curated.by_manager[1].total_net_assets, Some(250.0));

        let groups: Vec<_> = curated
            .by_dashboard_group
            .iter()
            .map(|r| r.group.as_str())
            .collect();
        assert_eq!(groups, vec!["Grupo1", "Grupo2"]);
    }

    #[test]
    fn test_months_without_rows_are_absent() {
        let quotas = vec![
            quota("1", (2023, 1, 31), 1.0, Some(100.0)),
            quota("1", (2023, 3, 1), 1.1, Some(110.0)),
            quota("2", (2023, 3, 1), 1.5, None),
        ];
        let rows = aggregate(&quotas, &funds(), |f| f.cvm_category.as_str());

        let keys: Vec<_> = rows
            .iter()
            .map(|r| (r.month.to_string(), r.group.clone()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("2023-01".to_string(), "A".to_string()),
                ("2023-03".to_string(), "A".to_string()),
                ("2023-03".to_string(), "B".to_string()),
            ]
        );
        // Group B reported no net assets at all
        assert_eq!(rows[2].total_net_assets, None);
    }

    #[test]
    fn test_empty_input_yields_no_rows() {
        assert!(aggregate(&[], &funds(), |f| f.manager.as_str()).is_empty());
    }
}
