//! Trigger frequencies for recurring timers.
//!
//! Two formats are accepted:
//! - `every NNN` fires every NNN seconds
//! - `at D-HH:MM, HH:MM, *-HH:MM` fires at wall-clock times (day of week 0 = Monday, `*` or
//!   omitted = every day)

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SchedulerError};

const PREAMBLE_AT: &str = "at ";
const PREAMBLE_EVERY: &str = "every ";

/// A single wall-clock trigger point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTime {
    /// 0 = Monday; None = every day
    pub day_of_week: Option<u32>,
    pub time_of_day: NaiveTime,
}

impl EventTime {
    /// Next instant at or after `now` matching this event
    pub fn next_trigger(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut date = now.date_naive();
        if now.time() > self.time_of_day {
            date += Duration::days(1);
        }
        for _ in 0..7 {
            let matches = match self.day_of_week {
                None => true,
                Some(dow) => date.weekday().num_days_from_monday() == dow,
            };
            if matches {
                break;
            }
            date += Duration::days(1);
        }
        date.and_time(self.time_of_day).and_utc()
    }
}

impl FromStr for EventTime {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || SchedulerError::InvalidConfig(format!("invalid event time: {}", s));
        let (dow, time) = match s.split_once('-') {
            Some((dow, time)) => (Some(dow), time),
            None => (None, s),
        };
        let day_of_week = match dow {
            None | Some("*") => None,
            Some(d) => {
                let d: u32 = d.parse().map_err(|_| bad())?;
                if d > 6 {
                    return Err(bad());
                }
                Some(d)
            }
        };
        let time_of_day = NaiveTime::parse_from_str(time, "%H:%M").map_err(|_| bad())?;
        Ok(Self {
            day_of_week,
            time_of_day,
        })
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.day_of_week {
            Some(d) => write!(f, "{}-{}", d, self.time_of_day.format("%H:%M")),
            None => write!(f, "*-{}", self.time_of_day.format("%H:%M")),
        }
    }
}

/// How often a timer fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerFrequency {
    Every(std::time::Duration),
    At(Vec<EventTime>),
}

impl TriggerFrequency {
    pub fn every_secs(secs: u64) -> Self {
        TriggerFrequency::Every(std::time::Duration::from_secs(secs))
    }

    /// Delay from `now` until the next firing
    pub fn next_run_in(&self, now: DateTime<Utc>) -> std::time::Duration {
        match self {
            TriggerFrequency::Every(interval) => *interval,
            TriggerFrequency::At(events) => events
                .iter()
                .map(|e| (e.next_trigger(now) - now).to_std().unwrap_or_default())
                .min()
                .unwrap_or(std::time::Duration::from_secs(60)),
        }
    }
}

impl fmt::Display for TriggerFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerFrequency::Every(interval) => write!(f, "{}{}", PREAMBLE_EVERY, interval.as_secs()),
            TriggerFrequency::At(events) => {
                let events: Vec<String> = events.iter().map(|e| e.to_string()).collect();
                write!(f, "{}{}", PREAMBLE_AT, events.join(", "))
            }
        }
    }
}

impl FromStr for TriggerFrequency {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ");

        if let Some(rest) = normalized.strip_prefix(PREAMBLE_EVERY) {
            let secs: u64 = rest
                .trim()
                .parse()
                .map_err(|_| SchedulerError::InvalidConfig(format!("invalid trigger frequency: {}", s)))?;
            if secs == 0 {
                return Err(SchedulerError::InvalidConfig(format!("trigger interval must be positive: {}", s)));
            }
            return Ok(TriggerFrequency::every_secs(secs));
        }

        if let Some(rest) = normalized.strip_prefix(PREAMBLE_AT) {
            let events = rest
                .split(',')
                .map(|token| token.trim())
                .filter(|token| !token.is_empty())
                .map(EventTime::from_str)
                .collect::<Result<Vec<_>>>()?;
            if events.is_empty() {
                return Err(SchedulerError::InvalidConfig(format!("no event times in: {}", s)));
            }
            return Ok(TriggerFrequency::At(events));
        }

        Err(SchedulerError::InvalidConfig(format!("unknown trigger format: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_every() {
        let freq: TriggerFrequency = "every  60".parse().unwrap();
        assert_eq!(freq, TriggerFrequency::every_secs(60));
        assert_eq!(freq.to_string(), "every 60");
    }

    #[test]
    fn test_parse_at() {
        let freq: TriggerFrequency = "at 1-10:30, 08:00".parse().unwrap();
        match freq {
            TriggerFrequency::At(events) => {
                assert_eq!(events.len(), 2);
                assert_eq!(events[0].day_of_week, Some(1));
                assert_eq!(events[1].day_of_week, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!("hourly".parse::<TriggerFrequency>().is_err());
        assert!("every 0".parse::<TriggerFrequency>().is_err());
        assert!("at 9-10:00".parse::<TriggerFrequency>().is_err());
    }

    #[test]
    fn test_next_trigger_same_day() {
        // 2020-01-01 is a Wednesday
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 9, 0, 0).unwrap();
        let event: EventTime = "10:30".parse().unwrap();
        assert_eq!(event.next_trigger(now), Utc.with_ymd_and_hms(2020, 1, 1, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_next_trigger_winds_to_weekday() {
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 11, 0, 0).unwrap();
        let monday: EventTime = "0-10:30".parse().unwrap();
        assert_eq!(monday.next_trigger(now), Utc.with_ymd_and_hms(2020, 1, 6, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_next_run_in_picks_smallest() {
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 9, 0, 0).unwrap();
        let freq: TriggerFrequency = "at 12:00, 09:30".parse().unwrap();
        assert_eq!(freq.next_run_in(now), std::time::Duration::from_secs(30 * 60));
    }
}
