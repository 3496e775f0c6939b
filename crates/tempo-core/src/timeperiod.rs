//! Calendar arithmetic over canonical timeperiod keys.
//!
//! Every managed timeperiod is a 10-digit, zero-padded string:
//!
//! | Qualifier | Layout       | Example      |
//! |-----------|--------------|--------------|
//! | yearly    | `YYYY000000` | `2024000000` |
//! | monthly   | `YYYYMM0000` | `2024030000` |
//! | daily     | `YYYYMMDD00` | `2024031500` |
//! | hourly    | `YYYYMMDDHH` | `2024031507` |
//!
//! Within one qualifier, plain string ordering equals chronological ordering.
//! The tree builder relies on that to pick "next" and "selected" buckets with
//! a lexicographic max/min, so no function here may break the fixed width.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

const KEY_LEN: usize = 10;
const MAX_YEAR: i64 = 9999;
const FIRST_KEY: &str = "0001010100";
const LAST_KEY: &str = "9999123123";
/// Wider than the whole key range, small enough for chrono arithmetic.
const MAX_SPAN_HOURS: i64 = 100_000_000;

/// Granularity of a timeperiod.
///
/// Declaration order runs finest → coarsest, so `Hourly < Daily < Monthly < Yearly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeQualifier {
    Hourly,
    Daily,
    Monthly,
    Yearly,
}

impl TimeQualifier {
    /// All qualifiers, coarsest first. This is the fixed order of tree levels.
    pub const COARSEST_FIRST: [TimeQualifier; 4] = [
        TimeQualifier::Yearly,
        TimeQualifier::Monthly,
        TimeQualifier::Daily,
        TimeQualifier::Hourly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeQualifier::Hourly => "hourly",
            TimeQualifier::Daily => "daily",
            TimeQualifier::Monthly => "monthly",
            TimeQualifier::Yearly => "yearly",
        }
    }

    /// The next finer granularity, `None` for hourly.
    pub fn finer(self) -> Option<Self> {
        match self {
            TimeQualifier::Hourly => None,
            TimeQualifier::Daily => Some(TimeQualifier::Hourly),
            TimeQualifier::Monthly => Some(TimeQualifier::Daily),
            TimeQualifier::Yearly => Some(TimeQualifier::Monthly),
        }
    }

    /// The next coarser granularity, `None` for yearly.
    pub fn coarser(self) -> Option<Self> {
        match self {
            TimeQualifier::Hourly => Some(TimeQualifier::Daily),
            TimeQualifier::Daily => Some(TimeQualifier::Monthly),
            TimeQualifier::Monthly => Some(TimeQualifier::Yearly),
            TimeQualifier::Yearly => None,
        }
    }

    /// Name of the per-granularity job table.
    pub fn job_table(self) -> &'static str {
        match self {
            TimeQualifier::Hourly => "job_hourly",
            TimeQualifier::Daily => "job_daily",
            TimeQualifier::Monthly => "job_monthly",
            TimeQualifier::Yearly => "job_yearly",
        }
    }
}

impl fmt::Display for TimeQualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeQualifier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hourly" => Ok(TimeQualifier::Hourly),
            "daily" => Ok(TimeQualifier::Daily),
            "monthly" => Ok(TimeQualifier::Monthly),
            "yearly" => Ok(TimeQualifier::Yearly),
            other => Err(CoreError::UnknownQualifier(other.to_string())),
        }
    }
}

/// Canonical 10-digit timeperiod key.
///
/// Construction always validates the calendar fields, so every accessor below
/// can assume a real date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeperiod(String);

impl Timeperiod {
    /// Parse a timeperiod, right-padding the short forms `YYYY`, `YYYYMM` and
    /// `YYYYMMDD` with zeros to the canonical width.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let invalid = || CoreError::InvalidTimeperiod(raw.to_string());

        if !matches!(raw.len(), 4 | 6 | 8 | KEY_LEN) || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let key = format!("{raw:0<KEY_LEN$}");

        let year: i32 = key[0..4].parse().map_err(|_| invalid())?;
        let month: u32 = key[4..6].parse().map_err(|_| invalid())?;
        let day: u32 = key[6..8].parse().map_err(|_| invalid())?;
        let hour: u32 = key[8..10].parse().map_err(|_| invalid())?;

        if year == 0 || month > 12 || hour > 23 {
            return Err(invalid());
        }
        // finer fields may only be set when the coarser ones are
        if (month == 0 && (day != 0 || hour != 0)) || (day == 0 && hour != 0) {
            return Err(invalid());
        }
        if month != 0 && day != 0 && NaiveDate::from_ymd_opt(year, month, day).is_none() {
            return Err(invalid());
        }

        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First instant covered by this key. Zero month/day fields read as 1.
    pub fn start(&self) -> DateTime<Utc> {
        let field = |range: std::ops::Range<usize>| self.0[range].parse::<u32>().unwrap_or(0);
        let year = field(0..4) as i32;
        let month = field(4..6).max(1);
        let day = field(6..8).max(1);
        let hour = field(8..10);
        // construction guarantees a valid calendar date
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .unwrap_or_default()
            .and_utc()
    }

    /// True when the key is already in the canonical layout of `qualifier`.
    pub fn is_aligned(&self, qualifier: TimeQualifier) -> bool {
        cast(self, qualifier) == *self
    }
}

impl fmt::Display for Timeperiod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Timeperiod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Timeperiod::parse(s)
    }
}

impl TryFrom<String> for Timeperiod {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Timeperiod::parse(&value)
    }
}

impl From<Timeperiod> for String {
    fn from(value: Timeperiod) -> Self {
        value.0
    }
}

/// Bucket of `qualifier` that contains `instant`.
pub fn to_timeperiod(instant: DateTime<Utc>, qualifier: TimeQualifier) -> Timeperiod {
    let (y, m, d, h) = (instant.year(), instant.month(), instant.day(), instant.hour());
    let key = match qualifier {
        TimeQualifier::Hourly => format!("{y:04}{m:02}{d:02}{h:02}"),
        TimeQualifier::Daily => format!("{y:04}{m:02}{d:02}00"),
        TimeQualifier::Monthly => format!("{y:04}{m:02}0000"),
        TimeQualifier::Yearly => format!("{y:04}000000"),
    };
    Timeperiod(key)
}

/// The bucket currently open at `now`.
pub fn actual_timeperiod(qualifier: TimeQualifier, now: DateTime<Utc>) -> Timeperiod {
    to_timeperiod(now, qualifier)
}

/// Re-express `timeperiod` at another granularity.
///
/// Casting to a coarser qualifier truncates; casting to a finer one yields the
/// first bucket of the range (`2024000000` → hourly `2024010100`).
pub fn cast(timeperiod: &Timeperiod, qualifier: TimeQualifier) -> Timeperiod {
    to_timeperiod(timeperiod.start(), qualifier)
}

/// Parent bucket one level up, `None` for yearly timeperiods.
pub fn parent(timeperiod: &Timeperiod, qualifier: TimeQualifier) -> Option<Timeperiod> {
    qualifier.coarser().map(|up| cast(timeperiod, up))
}

pub fn next(timeperiod: &Timeperiod, qualifier: TimeQualifier) -> Timeperiod {
    shift(timeperiod, qualifier, 1)
}

pub fn previous(timeperiod: &Timeperiod, qualifier: TimeQualifier) -> Timeperiod {
    shift(timeperiod, qualifier, -1)
}

/// Move `delta` buckets forward (or backward when negative).
///
/// Saturates at the first (`0001010100`) and last (`9999123123`) buckets a
/// key can express.
pub fn shift(timeperiod: &Timeperiod, qualifier: TimeQualifier, delta: i64) -> Timeperiod {
    let start = cast(timeperiod, qualifier).start();
    let bounded = |instant: DateTime<Utc>| {
        let first = Timeperiod(FIRST_KEY.to_string()).start();
        let last = Timeperiod(LAST_KEY.to_string()).start();
        to_timeperiod(instant.clamp(first, last), qualifier)
    };
    match qualifier {
        TimeQualifier::Hourly => bounded(start + Duration::hours(delta.clamp(-MAX_SPAN_HOURS, MAX_SPAN_HOURS))),
        TimeQualifier::Daily => {
            let span = MAX_SPAN_HOURS / 24;
            bounded(start + Duration::days(delta.clamp(-span, span)))
        }
        TimeQualifier::Monthly => {
            let total = (start.year() as i64 * 12 + (start.month() as i64 - 1))
                .saturating_add(delta)
                .clamp(12, MAX_YEAR * 12 + 11);
            let year = total.div_euclid(12);
            let month = total.rem_euclid(12) + 1;
            Timeperiod(format!("{year:04}{month:02}0000"))
        }
        TimeQualifier::Yearly => {
            let year = (start.year() as i64).saturating_add(delta).clamp(1, MAX_YEAR);
            Timeperiod(format!("{year:04}000000"))
        }
    }
}

/// First instant after the bucket.
pub fn end_of(timeperiod: &Timeperiod, qualifier: TimeQualifier) -> DateTime<Utc> {
    next(timeperiod, qualifier).start()
}

/// Every bucket of the next finer qualifier that `timeperiod` subsumes, in
/// ascending order. Empty for hourly.
pub fn children(timeperiod: &Timeperiod, qualifier: TimeQualifier) -> Vec<Timeperiod> {
    let Some(finer) = qualifier.finer() else {
        return Vec::new();
    };
    let end = cast(&next(timeperiod, qualifier), finer);
    let mut cursor = cast(timeperiod, finer);
    let mut out = Vec::new();
    while cursor < end {
        let following = next(&cursor, finer);
        out.push(cursor);
        cursor = following;
    }
    out
}

/// 14-digit `YYYYMMDDHHMMSS` session key, used to stamp freerun units of work.
pub fn session_timeperiod(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tp(s: &str) -> Timeperiod {
        Timeperiod::parse(s).expect("valid timeperiod")
    }

    #[test]
    fn to_timeperiod_formats_every_qualifier() {
        let at = Utc.with_ymd_and_hms(2024, 3, 15, 7, 42, 10).unwrap();
        assert_eq!(to_timeperiod(at, TimeQualifier::Hourly).as_str(), "2024031507");
        assert_eq!(to_timeperiod(at, TimeQualifier::Daily).as_str(), "2024031500");
        assert_eq!(to_timeperiod(at, TimeQualifier::Monthly).as_str(), "2024030000");
        assert_eq!(to_timeperiod(at, TimeQualifier::Yearly).as_str(), "2024000000");
        assert_eq!(session_timeperiod(at), "20240315074210");
    }

    #[test]
    fn short_forms_are_canonicalised() {
        assert_eq!(tp("2024").as_str(), "2024000000");
        assert_eq!(tp("202403").as_str(), "2024030000");
        assert_eq!(tp("20240315").as_str(), "2024031500");
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for bad in ["", "20240", "2024x31507", "2024131500", "2024023000", "2024000012", "0000000000"] {
            assert!(Timeperiod::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn lexicographic_order_matches_time_order() {
        let mut cursor = tp("2023122820");
        let mut previous_instant = cursor.start();
        for _ in 0..2_000 {
            let following = next(&cursor, TimeQualifier::Hourly);
            assert!(following > cursor);
            assert!(following.start() > previous_instant);
            previous_instant = following.start();
            cursor = following;
        }
    }

    #[test]
    fn parent_is_stable_within_a_parent_and_advances_across() {
        let hour = tp("2024031507");
        let same_day = next(&hour, TimeQualifier::Hourly);
        assert_eq!(
            parent(&same_day, TimeQualifier::Hourly),
            parent(&hour, TimeQualifier::Hourly)
        );

        let last_hour = tp("2024031523");
        let crossed = next(&last_hour, TimeQualifier::Hourly);
        assert_eq!(crossed.as_str(), "2024031600");
        let old_parent = parent(&last_hour, TimeQualifier::Hourly).unwrap();
        assert_eq!(
            parent(&crossed, TimeQualifier::Hourly).unwrap(),
            next(&old_parent, TimeQualifier::Daily)
        );
    }

    #[test]
    fn month_and_year_arithmetic_wraps() {
        assert_eq!(next(&tp("2024120000"), TimeQualifier::Monthly).as_str(), "2025010000");
        assert_eq!(previous(&tp("2024010000"), TimeQualifier::Monthly).as_str(), "2023120000");
        assert_eq!(shift(&tp("2024030000"), TimeQualifier::Monthly, -15).as_str(), "2022120000");
        assert_eq!(previous(&tp("2024000000"), TimeQualifier::Yearly).as_str(), "2023000000");
        assert_eq!(previous(&tp("2024030100"), TimeQualifier::Daily).as_str(), "2024022900");
    }

    #[test]
    fn shift_saturates_at_the_key_range() {
        assert_eq!(previous(&tp("0001000000"), TimeQualifier::Yearly).as_str(), "0001000000");
        assert_eq!(shift(&tp("0001030000"), TimeQualifier::Monthly, -5).as_str(), "0001010000");
        assert_eq!(previous(&tp("0001010100"), TimeQualifier::Daily).as_str(), "0001010100");
        assert_eq!(previous(&tp("0001010100"), TimeQualifier::Hourly).as_str(), "0001010100");
        assert_eq!(next(&tp("9999000000"), TimeQualifier::Yearly).as_str(), "9999000000");
        assert_eq!(next(&tp("9999123123"), TimeQualifier::Hourly).as_str(), "9999123123");
        assert_eq!(shift(&tp("2024031500"), TimeQualifier::Daily, i64::MIN).as_str(), "0001010100");
        for qualifier in TimeQualifier::COARSEST_FIRST {
            let far_back = shift(&tp("0001010100"), qualifier, -1_000);
            assert!(Timeperiod::parse(far_back.as_str()).is_ok(), "{qualifier}: {far_back}");
        }
    }

    #[test]
    fn parent_of_yearly_is_none() {
        assert!(parent(&tp("2024000000"), TimeQualifier::Yearly).is_none());
        assert_eq!(
            parent(&tp("2024031500"), TimeQualifier::Daily).unwrap().as_str(),
            "2024030000"
        );
    }

    #[test]
    fn children_cover_the_whole_parent() {
        let hours = children(&tp("2024031500"), TimeQualifier::Daily);
        assert_eq!(hours.len(), 24);
        assert_eq!(hours[0].as_str(), "2024031500");
        assert_eq!(hours[23].as_str(), "2024031523");

        assert_eq!(children(&tp("2024020000"), TimeQualifier::Monthly).len(), 29);
        assert_eq!(children(&tp("2024000000"), TimeQualifier::Yearly).len(), 12);
        assert!(children(&tp("2024031507"), TimeQualifier::Hourly).is_empty());
    }

    #[test]
    fn cast_to_finer_takes_first_bucket() {
        assert_eq!(cast(&tp("2024000000"), TimeQualifier::Hourly).as_str(), "2024010100");
        assert!(tp("2024031500").is_aligned(TimeQualifier::Daily));
        assert!(!tp("2024031507").is_aligned(TimeQualifier::Daily));
    }

    #[test]
    fn serde_uses_the_plain_key() {
        let json = serde_json::to_string(&tp("2024031507")).unwrap();
        assert_eq!(json, "\"2024031507\"");
        let back: Timeperiod = serde_json::from_str("\"20240315\"").unwrap();
        assert_eq!(back.as_str(), "2024031500");
        assert!(serde_json::from_str::<Timeperiod>("\"2024-03-15\"").is_err());
    }
}
