//! Calendar month arithmetic for disclosure periods

use anyhow::{Result, anyhow};
use chrono::{Datelike, NaiveDate, Utc};
use std::fmt::Display;
use std::str::FromStr;

/// A calendar month a disclosure file refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferenceMonth {
    year: i32,
    month: u32,
}

impl ReferenceMonth {
    /// Years outside `1..=9999` are refused so `compact` stays six digits.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        ((1..=9999).contains(&year) && (1..=12).contains(&month)).then_some(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn current() -> Self {
        Self::of(Utc::now().date_naive())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// `YYYYMM`, as used in CVM file names.
    pub fn compact(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }

    /// First day of the month in ISO 8601 form.
    pub fn first_day_iso(&self) -> String {
        format!("{:04}-{:02}-01", self.year, self.month)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    /// `None` when the result falls before year 1.
    pub fn minus(&self, months: u32) -> Option<Self> {
        let index = i64::from(self.year) * 12 + i64::from(self.month) - 1 - i64::from(months);
        let year = i32::try_from(index.div_euclid(12)).ok()?;
        Self::new(year, index.rem_euclid(12) as u32 + 1)
    }

    /// The `count` months ending `skip_recent` months before `reference`, oldest first.
    pub fn requested_range(reference: Self, count: u32, skip_recent: u32) -> Result<Vec<Self>> {
        let out_of_range =
            || anyhow!("{count} months ending {skip_recent} months before {reference} start before year 1");
        let last = reference.minus(skip_recent).ok_or_else(out_of_range)?;
        (0..count)
            .rev()
            .map(|offset| last.minus(offset).ok_or_else(out_of_range))
            .collect()
    }
}

impl Display for ReferenceMonth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for ReferenceMonth {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (year, month) = match s.split_once('-') {
            Some(parts) => parts,
            None if s.len() == 6 => s.split_at(4),
            None => return Err(anyhow!("Invalid reference month: {s}")),
        };
        let year: i32 = year
            .parse()
            .map_err(|_| anyhow!("Invalid reference month: {s}"))?;
        let month: u32 = month
            .parse()
            .map_err(|_| anyhow!("Invalid reference month: {s}"))?;
        Self::new(year, month).ok_or_else(|| anyhow!("Invalid reference month: {s}"))
    }
}
