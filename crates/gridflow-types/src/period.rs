//! Period keys for the entity/period grid.
//!
//! A period is usually a fiscal year (`2024`), occasionally a free-form label
//! such as `2024-Q3`, and `ALL` when a step collapses the period axis into a
//! single synthetic bucket. On the wire every period is a string so it can be
//! used as a JSON object key; numeric input (`2024`) is accepted as well.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Key used for both the synthetic entity and the synthetic period produced
/// by cross-grid aggregation.
pub const ALL_KEY: &str = "ALL";

/// A discrete time bucket associated with one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    /// A fiscal year.
    Year(i32),
    /// Any other discrete key (quarters, custom buckets).
    Label(String),
    /// The synthetic "every period" bucket.
    All,
}

impl Period {
    /// Returns the fiscal year if this is a year period.
    pub fn year(&self) -> Option<i32> {
        match self {
            Period::Year(y) => Some(*y),
            _ => None,
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Period::All)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Year(y) => write!(f, "{y}"),
            Period::Label(l) => f.write_str(l),
            Period::All => f.write_str(ALL_KEY),
        }
    }
}

impl FromStr for Period {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case(ALL_KEY) {
            return Ok(Period::All);
        }
        match trimmed.parse::<i32>() {
            Ok(year) => Ok(Period::Year(year)),
            Err(_) => Ok(Period::Label(trimmed.to_string())),
        }
    }
}

impl From<i32> for Period {
    fn from(year: i32) -> Self {
        Period::Year(year)
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct PeriodVisitor;

impl<'de> Visitor<'de> for PeriodVisitor {
    type Value = Period;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a fiscal year, a period label, or \"ALL\"")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Period, E> {
        i32::try_from(v)
            .map(Period::Year)
            .map_err(|_| E::custom(format!("period year out of range: {v}")))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Period, E> {
        i32::try_from(v)
            .map(Period::Year)
            .map_err(|_| E::custom(format!("period year out of range: {v}")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Period, E> {
        if v.trim().is_empty() {
            return Err(E::custom("period must not be empty"));
        }
        let Ok(period) = v.parse::<Period>();
        Ok(period)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(PeriodVisitor)
    }
}
