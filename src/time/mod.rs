//! Calendar utilities: time qualifiers, timeperiod tokens and trigger frequencies.
//!
//! A timeperiod is a lexicographically ordered token whose length encodes its
//! granularity: `YYYY`, `YYYYMM`, `YYYYMMDD`, `YYYYMMDDHH` or `YYYYMMDDHHMMSS`.

mod qualifier;
mod timeperiod;
mod trigger;

pub use qualifier::TimeQualifier;
pub use timeperiod::{
    actual_timeperiod, actual_timeperiod_at, cast_to_time_qualifier, increment_timeperiod, is_grouping_aligned,
    parse_timeperiod, periods_between, timeperiod_to_datetime,
};
pub use trigger::{EventTime, TriggerFrequency};
