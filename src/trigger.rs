//! Pure trigger logic: turns a declarative schedule into fire instants.
//!
//! All trigger math happens in the configured IANA zone (DST rules and
//! all); only the result is ever handed back out, and it is always a UTC
//! instant.

use crate::error::{Result, SchedulerError};
use crate::time::Instant;
use jiff::civil::{self, Weekday};
use std::cell::Cell;
use std::collections::HashSet;

/// One schedule-kind enum, used for both the catalog entry and the live
/// trigger, rather than two names for the same concept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Immediate,
    Daily,
    Interval,
}

/// Validated configuration shared by the Daily and Interval trigger
/// variants (Immediate ignores it entirely).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TriggerConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_time: Option<civil::Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<civil::Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<civil::Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<jiff::Span>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekdays: Option<HashSet<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dates: Option<Vec<civil::Date>>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            run_time: None,
            start_time: None,
            end_time: None,
            interval: None,
            weekdays: None,
            dates: None,
        }
    }
}

impl TriggerConfig {
    /// Validate timezone name and weekday range up front — this runs
    /// regardless of schedule type.
    fn validate_common(&self) -> Result<()> {
        jiff::tz::TimeZone::get(&self.timezone)
            .map_err(|_| SchedulerError::validation(format!("Invalid timezone: {}", self.timezone)))?;

        if let Some(weekdays) = &self.weekdays {
            if weekdays.is_empty() || weekdays.iter().any(|d| !(1..=7).contains(d)) {
                return Err(SchedulerError::validation(
                    "Weekdays must be between 1 and 7",
                ));
            }
        }
        Ok(())
    }

    fn validate_for(&self, schedule_type: ScheduleType) -> Result<()> {
        self.validate_common()?;
        match schedule_type {
            ScheduleType::Immediate => Ok(()),
            ScheduleType::Daily => {
                if self.run_time.is_none() {
                    return Err(SchedulerError::validation("Run time must be provided"));
                }
                Ok(())
            }
            ScheduleType::Interval => {
                if self.start_time.is_none() {
                    return Err(SchedulerError::validation("Start time must be provided"));
                }
                if self.end_time.is_none() {
                    return Err(SchedulerError::validation("End time must be provided"));
                }
                if self.interval.is_none() {
                    return Err(SchedulerError::validation("Interval must be provided"));
                }
                if self.end_time.unwrap() <= self.start_time.unwrap() {
                    return Err(SchedulerError::validation(
                        "End time must be after start time",
                    ));
                }
                Ok(())
            }
        }
    }
}

/// A trigger is a pure function of (schedule, wall clock) except for the
/// Immediate variant, which is a one-shot cursor.
#[derive(Debug)]
pub enum Trigger {
    Immediate { fired: Cell<bool> },
    Daily { config: TriggerConfig },
    Interval { config: TriggerConfig },
}

impl Trigger {
    pub fn new(schedule_type: ScheduleType, config: TriggerConfig) -> Result<Self> {
        config.validate_for(schedule_type)?;
        Ok(match schedule_type {
            ScheduleType::Immediate => Trigger::Immediate {
                fired: Cell::new(false),
            },
            ScheduleType::Daily => Trigger::Daily { config },
            ScheduleType::Interval => Trigger::Interval { config },
        })
    }

    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            Trigger::Immediate { .. } => ScheduleType::Immediate,
            Trigger::Daily { .. } => ScheduleType::Daily,
            Trigger::Interval { .. } => ScheduleType::Interval,
        }
    }

    /// Smallest instant `t >= now` that satisfies the trigger, or `None`
    /// if the trigger is exhausted.
    pub fn get_next_run(&self, now: Instant) -> Result<Option<Instant>> {
        match self {
            Trigger::Immediate { fired } => {
                if fired.get() {
                    Ok(None)
                } else {
                    fired.set(true);
                    Ok(Some(now))
                }
            }
            Trigger::Daily { config } => daily_next_run(config, now),
            Trigger::Interval { config } => interval_next_run(config, now),
        }
    }

    /// True iff `candidate` is a valid fire instant and `now` lies in the
    /// grace window around it.
    pub fn should_run(&self, candidate: Instant, now: Instant) -> bool {
        match self {
            Trigger::Immediate { fired } => {
                if fired.get() {
                    false
                } else {
                    fired.set(true);
                    true
                }
            }
            Trigger::Daily { .. } => now <= candidate,
            Trigger::Interval { config } => {
                let interval = config.interval.expect("validated");
                let window_start = candidate.checked_sub(interval).unwrap_or(candidate);
                now > window_start && now <= candidate
            }
        }
    }
}

fn weekday_number(weekday: Weekday) -> u8 {
    match weekday {
        Weekday::Monday => 1,
        Weekday::Tuesday => 2,
        Weekday::Wednesday => 3,
        Weekday::Thursday => 4,
        Weekday::Friday => 5,
        Weekday::Saturday => 6,
        Weekday::Sunday => 7,
    }
}

fn is_allowed(config: &TriggerConfig, date: civil::Date) -> bool {
    if let Some(weekdays) = &config.weekdays {
        if !weekdays.contains(&weekday_number(date.weekday())) {
            return false;
        }
    }
    if let Some(dates) = &config.dates {
        if !dates.contains(&date) {
            return false;
        }
    }
    true
}

/// No future candidate date can possibly satisfy `dates` from `date` on.
fn dates_exhausted(config: &TriggerConfig, date: civil::Date) -> bool {
    match &config.dates {
        Some(dates) => dates.iter().all(|d| *d <= date),
        None => false,
    }
}

const MAX_DAY_SEARCH: u32 = 4000;

fn daily_next_run(config: &TriggerConfig, now: Instant) -> Result<Option<Instant>> {
    let run_time = config.run_time.expect("validated");
    let now_zoned = now.in_tz(&config.timezone)?;
    let mut date = now_zoned.date();

    let mut candidate = date
        .at(run_time.hour(), run_time.minute(), run_time.second(), 0)
        .in_tz(&config.timezone)?;
    if candidate.timestamp() <= now {
        date = date.tomorrow()?;
        candidate = date
            .at(run_time.hour(), run_time.minute(), run_time.second(), 0)
            .in_tz(&config.timezone)?;
    }

    for _ in 0..MAX_DAY_SEARCH {
        if is_allowed(config, date) {
            return Ok(Some(candidate.timestamp()));
        }
        if dates_exhausted(config, date) {
            return Ok(None);
        }
        date = date.tomorrow()?;
        candidate = date
            .at(run_time.hour(), run_time.minute(), run_time.second(), 0)
            .in_tz(&config.timezone)?;
    }
    Ok(None)
}

fn interval_next_run(config: &TriggerConfig, now: Instant) -> Result<Option<Instant>> {
    let start_time = config.start_time.expect("validated");
    let end_time = config.end_time.expect("validated");
    let interval = config.interval.expect("validated");

    let now_zoned = now.in_tz(&config.timezone)?;
    let mut date = now_zoned.date();
    let mut first_day = true;

    for _ in 0..MAX_DAY_SEARCH {
        if !is_allowed(config, date) {
            if dates_exhausted(config, date) {
                return Ok(None);
            }
            date = date.tomorrow()?;
            first_day = false;
            continue;
        }

        let day_start = date
            .at(start_time.hour(), start_time.minute(), start_time.second(), 0)
            .in_tz(&config.timezone)?;
        let day_end = date
            .at(end_time.hour(), end_time.minute(), end_time.second(), 0)
            .in_tz(&config.timezone)?;

        if first_day {
            if now_zoned < day_start {
                return Ok(Some(day_start.timestamp()));
            }
            if now_zoned <= day_end {
                let mut slot = day_start.clone();
                while slot < now_zoned {
                    slot = slot.checked_add(interval)?;
                }
                if slot <= day_end {
                    return Ok(Some(slot.timestamp()));
                }
            }
        } else {
            return Ok(Some(day_start.timestamp()));
        }

        if dates_exhausted(config, date) {
            return Ok(None);
        }
        date = date.tomorrow()?;
        first_day = false;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jiff::civil::{date, time};
    use jiff::ToSpan;
    use pretty_assertions::assert_eq;

    fn utc_instant(y: i16, m: i8, d: i8, h: i8, min: i8, s: i8) -> Instant {
        date(y, m, d).at(h, min, s, 0).in_tz("UTC").unwrap().timestamp()
    }

    #[test]
    fn immediate_fires_once() {
        let trigger = Trigger::new(ScheduleType::Immediate, TriggerConfig::default()).unwrap();
        let now = utc_instant(2024, 1, 1, 0, 0, 0);
        assert_eq!(trigger.get_next_run(now).unwrap(), Some(now));
        assert_eq!(trigger.get_next_run(now).unwrap(), None);
    }

    #[test]
    fn immediate_should_run_once() {
        let trigger = Trigger::new(ScheduleType::Immediate, TriggerConfig::default()).unwrap();
        let now = utc_instant(2024, 1, 1, 0, 0, 0);
        assert!(trigger.should_run(now, now));
        assert!(!trigger.should_run(now, now));
    }

    #[test]
    fn daily_same_day() {
        let config = TriggerConfig {
            run_time: Some(time(12, 0, 0, 0)),
            ..Default::default()
        };
        let trigger = Trigger::new(ScheduleType::Daily, config).unwrap();
        let now = utc_instant(2023, 1, 1, 10, 0, 0);
        let expected = utc_instant(2023, 1, 1, 12, 0, 0);
        assert_eq!(trigger.get_next_run(now).unwrap(), Some(expected));
    }

    #[test]
    fn daily_rolls_to_next_day() {
        let config = TriggerConfig {
            run_time: Some(time(12, 0, 0, 0)),
            ..Default::default()
        };
        let trigger = Trigger::new(ScheduleType::Daily, config).unwrap();
        let now = utc_instant(2023, 1, 1, 14, 0, 0);
        let expected = utc_instant(2023, 1, 2, 12, 0, 0);
        assert_eq!(trigger.get_next_run(now).unwrap(), Some(expected));
    }

    #[test]
    fn daily_weekday_filter_skips_to_monday() {
        let config = TriggerConfig {
            run_time: Some(time(12, 0, 0, 0)),
            weekdays: Some([1, 2, 3, 4, 5].into_iter().collect()),
            ..Default::default()
        };
        let trigger = Trigger::new(ScheduleType::Daily, config).unwrap();
        // 2023-01-07 is a Saturday.
        let now = utc_instant(2023, 1, 7, 10, 0, 0);
        let expected = utc_instant(2023, 1, 9, 12, 0, 0);
        assert_eq!(trigger.get_next_run(now).unwrap(), Some(expected));
    }

    #[test]
    fn daily_exhausts_when_dates_are_past() {
        let config = TriggerConfig {
            run_time: Some(time(12, 0, 0, 0)),
            dates: Some(vec![date(2023, 1, 1)]),
            ..Default::default()
        };
        let trigger = Trigger::new(ScheduleType::Daily, config).unwrap();
        let now = utc_instant(2023, 1, 2, 0, 0, 0);
        assert_eq!(trigger.get_next_run(now).unwrap(), None);
    }

    #[test]
    fn interval_before_start() {
        let config = TriggerConfig {
            start_time: Some(time(9, 0, 0, 0)),
            end_time: Some(time(17, 0, 0, 0)),
            interval: Some(1.hours()),
            ..Default::default()
        };
        let trigger = Trigger::new(ScheduleType::Interval, config).unwrap();
        let now = utc_instant(2023, 1, 1, 8, 0, 0);
        let expected = utc_instant(2023, 1, 1, 9, 0, 0);
        assert_eq!(trigger.get_next_run(now).unwrap(), Some(expected));
    }

    #[test]
    fn interval_exact_start_fires_at_start() {
        let config = TriggerConfig {
            start_time: Some(time(9, 0, 0, 0)),
            end_time: Some(time(17, 0, 0, 0)),
            interval: Some(1.hours()),
            ..Default::default()
        };
        let trigger = Trigger::new(ScheduleType::Interval, config).unwrap();
        let now = utc_instant(2023, 1, 1, 9, 0, 0);
        assert_eq!(trigger.get_next_run(now).unwrap(), Some(now));
    }

    #[test]
    fn interval_mid_window() {
        let config = TriggerConfig {
            start_time: Some(time(9, 0, 0, 0)),
            end_time: Some(time(17, 0, 0, 0)),
            interval: Some(1.hours()),
            ..Default::default()
        };
        let trigger = Trigger::new(ScheduleType::Interval, config).unwrap();
        let now = utc_instant(2023, 1, 1, 10, 30, 0);
        let expected = utc_instant(2023, 1, 1, 11, 0, 0);
        assert_eq!(trigger.get_next_run(now).unwrap(), Some(expected));
    }

    #[test]
    fn interval_after_end_rolls_to_next_day() {
        let config = TriggerConfig {
            start_time: Some(time(9, 0, 0, 0)),
            end_time: Some(time(17, 0, 0, 0)),
            interval: Some(1.hours()),
            ..Default::default()
        };
        let trigger = Trigger::new(ScheduleType::Interval, config).unwrap();
        let now = utc_instant(2023, 1, 1, 18, 0, 0);
        let expected = utc_instant(2023, 1, 2, 9, 0, 0);
        assert_eq!(trigger.get_next_run(now).unwrap(), Some(expected));
    }

    #[test]
    fn interval_weekday_filter_skips_to_monday() {
        let config = TriggerConfig {
            start_time: Some(time(9, 0, 0, 0)),
            end_time: Some(time(17, 0, 0, 0)),
            interval: Some(1.hours()),
            weekdays: Some([1, 2, 3, 4, 5].into_iter().collect()),
            ..Default::default()
        };
        let trigger = Trigger::new(ScheduleType::Interval, config).unwrap();
        let now = utc_instant(2023, 1, 7, 10, 0, 0);
        let expected = utc_instant(2023, 1, 9, 9, 0, 0);
        assert_eq!(trigger.get_next_run(now).unwrap(), Some(expected));
    }

    #[test]
    fn interval_dates_exhausted() {
        let config = TriggerConfig {
            start_time: Some(time(9, 0, 0, 0)),
            end_time: Some(time(17, 0, 0, 0)),
            interval: Some(1.hours()),
            dates: Some(vec![date(2023, 1, 1), date(2023, 1, 3)]),
            ..Default::default()
        };
        let trigger = Trigger::new(ScheduleType::Interval, config).unwrap();
        let now = utc_instant(2023, 1, 3, 18, 0, 0);
        assert_eq!(trigger.get_next_run(now).unwrap(), None);
    }

    #[test]
    fn rejects_unknown_timezone() {
        let config = TriggerConfig {
            timezone: "Invalid/Timezone".to_string(),
            run_time: Some(time(12, 0, 0, 0)),
            ..Default::default()
        };
        let err = Trigger::new(ScheduleType::Daily, config).unwrap_err();
        assert!(err.to_string().contains("Invalid timezone"));
    }

    #[test]
    fn rejects_bad_weekdays() {
        let config = TriggerConfig {
            run_time: Some(time(12, 0, 0, 0)),
            weekdays: Some([0, 1, 2].into_iter().collect()),
            ..Default::default()
        };
        let err = Trigger::new(ScheduleType::Daily, config).unwrap_err();
        assert!(err.to_string().contains("Weekdays must be between 1 and 7"));
    }

    #[test]
    fn rejects_interval_without_end_time() {
        let config = TriggerConfig {
            start_time: Some(time(9, 0, 0, 0)),
            interval: Some(1.hours()),
            ..Default::default()
        };
        let err = Trigger::new(ScheduleType::Interval, config).unwrap_err();
        assert!(err.to_string().contains("End time must be provided"));
    }
}
