//! Time qualifiers: the granularity of a timeperiod.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SchedulerError;

/// Granularity of a timeperiod.
///
/// Variants are declared finest first, so the derived ordering places
/// `Yearly` above `Monthly` above `Daily` above `Hourly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeQualifier {
    RealTime,
    Hourly,
    Daily,
    Monthly,
    Yearly,
}

impl TimeQualifier {
    /// Qualifiers usable inside a timetable tree
    pub const MANAGED: [TimeQualifier; 4] = [
        TimeQualifier::Yearly,
        TimeQualifier::Monthly,
        TimeQualifier::Daily,
        TimeQualifier::Hourly,
    ];

    /// Length of a timeperiod token at this granularity
    pub fn token_len(&self) -> usize {
        match self {
            TimeQualifier::Yearly => 4,
            TimeQualifier::Monthly => 6,
            TimeQualifier::Daily => 8,
            TimeQualifier::Hourly => 10,
            TimeQualifier::RealTime => 14,
        }
    }

    /// Infer the qualifier from a token length
    pub fn from_token_len(len: usize) -> Option<Self> {
        match len {
            4 => Some(TimeQualifier::Yearly),
            6 => Some(TimeQualifier::Monthly),
            8 => Some(TimeQualifier::Daily),
            10 => Some(TimeQualifier::Hourly),
            14 => Some(TimeQualifier::RealTime),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeQualifier::RealTime => "real_time",
            TimeQualifier::Hourly => "hourly",
            TimeQualifier::Daily => "daily",
            TimeQualifier::Monthly => "monthly",
            TimeQualifier::Yearly => "yearly",
        }
    }
}

impl fmt::Display for TimeQualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeQualifier {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "real_time" => Ok(TimeQualifier::RealTime),
            "hourly" => Ok(TimeQualifier::Hourly),
            "daily" => Ok(TimeQualifier::Daily),
            "monthly" => Ok(TimeQualifier::Monthly),
            "yearly" => Ok(TimeQualifier::Yearly),
            other => Err(SchedulerError::InvalidConfig(format!("unknown time qualifier: {}", other))),
        }
    }
}
