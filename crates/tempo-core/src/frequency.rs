use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// When a scheduler timer fires.
///
/// Textual grammar, as written in configuration and accepted by
/// `change_interval`:
///
/// - `every 3600` fires every N seconds.
/// - `at 10:30, 2-14:00, *-23:15` fires at the listed UTC event times. The
///   optional prefix is a weekday (0 = Monday … 6 = Sunday); `*` or no prefix
///   means every day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TriggerFrequency {
    Every { secs: u64 },
    At(Vec<EventTime>),
}

/// One entry of an `at ...` frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventTime {
    /// `None` means every day.
    pub day_of_week: Option<u8>,
    pub hour: u8,
    pub minute: u8,
}

impl FromStr for EventTime {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || CoreError::InvalidFrequency(format!("bad event time: {s:?}"));

        let (day_of_week, clock) = match s.split_once('-') {
            Some(("*", clock)) => (None, clock),
            Some((day, clock)) => {
                let day: u8 = day.trim().parse().map_err(|_| invalid())?;
                if day > 6 {
                    return Err(invalid());
                }
                (Some(day), clock)
            }
            None => (None, s),
        };

        let (hour, minute) = clock.split_once(':').ok_or_else(invalid)?;
        let hour: u8 = hour.trim().parse().map_err(|_| invalid())?;
        let minute: u8 = minute.trim().parse().map_err(|_| invalid())?;
        if hour > 23 || minute > 59 {
            return Err(invalid());
        }

        Ok(EventTime {
            day_of_week,
            hour,
            minute,
        })
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.day_of_week {
            Some(day) => write!(f, "{day}-{:02}:{:02}", self.hour, self.minute),
            None => write!(f, "{:02}:{:02}", self.hour, self.minute),
        }
    }
}

impl TriggerFrequency {
    pub fn every(secs: u64) -> Self {
        TriggerFrequency::Every { secs }
    }
}

impl FromStr for TriggerFrequency {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("every") {
            let secs: u64 = rest
                .trim()
                .parse()
                .map_err(|_| CoreError::InvalidFrequency(format!("bad interval: {s:?}")))?;
            if secs == 0 {
                return Err(CoreError::InvalidFrequency(
                    "interval must be at least one second".to_string(),
                ));
            }
            return Ok(TriggerFrequency::Every { secs });
        }

        if let Some(rest) = s.strip_prefix("at") {
            let mut times = rest
                .split(',')
                .filter(|t| !t.trim().is_empty())
                .map(EventTime::from_str)
                .collect::<Result<Vec<_>>>()?;
            if times.is_empty() {
                return Err(CoreError::InvalidFrequency(format!("no event times in {s:?}")));
            }
            times.sort();
            times.dedup();
            return Ok(TriggerFrequency::At(times));
        }

        Err(CoreError::InvalidFrequency(format!(
            "expected `every <secs>` or `at <time>, ...`, got {s:?}"
        )))
    }
}

impl fmt::Display for TriggerFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerFrequency::Every { secs } => write!(f, "every {secs}"),
            TriggerFrequency::At(times) => {
                let joined = times
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "at {joined}")
            }
        }
    }
}

impl TryFrom<String> for TriggerFrequency {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TriggerFrequency> for String {
    fn from(value: TriggerFrequency) -> Self {
        value.to_string()
    }
}
