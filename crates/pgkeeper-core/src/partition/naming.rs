//! Calendar math and names of time-range partitions.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Width of one partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Daily,
    /// ISO weeks, starting on Monday.
    Weekly,
    Monthly,
    Yearly,
}

impl Granularity {
    /// First day of the period containing `date`.
    pub fn floor(self, date: NaiveDate) -> NaiveDate {
        match self {
            Granularity::Daily => date,
            Granularity::Weekly => {
                date - Days::new(u64::from(date.weekday().num_days_from_monday()))
            }
            Granularity::Monthly => date.with_day(1).unwrap_or(date),
            Granularity::Yearly => date.with_ordinal(1).unwrap_or(date),
        }
    }

    /// Start of the period `n` periods after the one containing `date`.
    ///
    /// Returns `None` past the end of the supported calendar.
    pub fn add(self, date: NaiveDate, n: u32) -> Option<NaiveDate> {
        let start = self.floor(date);
        match self {
            Granularity::Daily => start.checked_add_days(Days::new(u64::from(n))),
            Granularity::Weekly => start.checked_add_days(Days::new(7 * u64::from(n))),
            Granularity::Monthly => start.checked_add_months(Months::new(n)),
            Granularity::Yearly => start.checked_add_months(Months::new(12 * n)),
        }
    }

    /// `[start, end)` of the period containing `date`.
    pub fn range(self, date: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
        Some((self.floor(date), self.add(date, 1)?))
    }

    /// Name suffix of the period starting at `start`, without the leading `_`.
    ///
    /// `2024_07_15`, `2024_w28`, `2024_07`, `2024`.
    pub fn suffix(self, start: NaiveDate) -> String {
        match self {
            Granularity::Daily => start.format("%Y_%m_%d").to_string(),
            Granularity::Weekly => {
                let week = start.iso_week();
                format!("{:04}_w{:02}", week.year(), week.week())
            }
            Granularity::Monthly => start.format("%Y_%m").to_string(),
            Granularity::Yearly => start.format("%Y").to_string(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
            Granularity::Weekly => "weekly",
            Granularity::Monthly => "monthly",
            Granularity::Yearly => "yearly",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" | "day" => Ok(Granularity::Daily),
            "weekly" | "week" => Ok(Granularity::Weekly),
            "monthly" | "month" => Ok(Granularity::Monthly),
            "yearly" | "year" => Ok(Granularity::Yearly),
            _ => Err(Error::InvalidArgument(format!("unknown granularity {s:?}"))),
        }
    }
}

/// PostgreSQL partitioning method. Only `Range` is managed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionStrategy {
    #[default]
    Range,
    List,
    Hash,
}

impl PartitionStrategy {
    pub fn as_sql(self) -> &'static str {
        match self {
            PartitionStrategy::Range => "RANGE",
            PartitionStrategy::List => "LIST",
            PartitionStrategy::Hash => "HASH",
        }
    }
}
