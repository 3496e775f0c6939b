use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use tempo_core::frequency::EventTime;
use tempo_core::TriggerFrequency;

/// Next UTC instant strictly after `from` at which a timer with `frequency`
/// fires. `None` only for an `at` list with no usable event time.
pub fn compute_next_fire(frequency: &TriggerFrequency, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match frequency {
        TriggerFrequency::Every { secs } => Some(from + Duration::seconds((*secs).max(1) as i64)),
        TriggerFrequency::At(events) => events.iter().filter_map(|e| next_event(e, from)).min(),
    }
}

fn next_event(event: &EventTime, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match event.day_of_week {
        None => {
            let candidate = at_clock(from, event)?;
            if candidate > from {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(1))
            }
        }
        Some(day) => {
            // 0 = Monday, matching chrono's `num_days_from_monday`.
            let today = from.weekday().num_days_from_monday() as i64;
            let days_ahead = (day as i64 - today).rem_euclid(7);
            let candidate = at_clock(from + Duration::days(days_ahead), event)?;
            if candidate > from {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(7))
            }
        }
    }
}

fn at_clock(day: DateTime<Utc>, event: &EventTime) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(
        day.year(),
        day.month(),
        day.day(),
        event.hour as u32,
        event.minute as u32,
        0,
    )
    .single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn freq(s: &str) -> TriggerFrequency {
        s.parse().unwrap()
    }

    #[test]
    fn interval_adds_seconds() {
        let from = Utc.with_ymd_and_hms(2024, 3, 15, 10, 0, 0).unwrap();
        assert_eq!(
            compute_next_fire(&freq("every 900"), from),
            Some(Utc.with_ymd_and_hms(2024, 3, 15, 10, 15, 0).unwrap())
        );
    }

    #[test]
    fn daily_event_rolls_to_tomorrow_once_passed() {
        let from = Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 0).unwrap();
        assert_eq!(
            compute_next_fire(&freq("at 10:30"), from),
            Some(Utc.with_ymd_and_hms(2024, 3, 16, 10, 30, 0).unwrap())
        );
        assert_eq!(
            compute_next_fire(&freq("at 10:30, 23:15"), from),
            Some(Utc.with_ymd_and_hms(2024, 3, 15, 23, 15, 0).unwrap())
        );
    }

    #[test]
    fn weekly_event_picks_the_right_weekday() {
        // 2024-03-15 is a Friday (4).
        let from = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        assert_eq!(
            compute_next_fire(&freq("at 0-08:00"), from),
            Some(Utc.with_ymd_and_hms(2024, 3, 18, 8, 0, 0).unwrap())
        );
        assert_eq!(
            compute_next_fire(&freq("at 4-11:00"), from),
            Some(Utc.with_ymd_and_hms(2024, 3, 22, 11, 0, 0).unwrap())
        );
        assert_eq!(
            compute_next_fire(&freq("at 4-13:00"), from),
            Some(Utc.with_ymd_and_hms(2024, 3, 15, 13, 0, 0).unwrap())
        );
    }

    #[test]
    fn mixed_list_takes_the_earliest() {
        let from = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        assert_eq!(
            compute_next_fire(&freq("at 5-01:00, *-12:30"), from),
            Some(Utc.with_ymd_and_hms(2024, 3, 15, 12, 30, 0).unwrap())
        );
    }
}
