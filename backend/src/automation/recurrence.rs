// Recurrence rules - when a workflow trigger becomes due

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How often a workflow fires. Calendar rules are evaluated in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    /// Fixed interval, measured from the moment the trigger last fired or skipped.
    Interval { every_secs: u64 },
    /// Once a day at a time of day.
    Daily { at: NaiveTime },
    /// Once a week on a weekday at a time of day.
    Weekly { weekday: Weekday, at: NaiveTime },
    /// Six-field cron expression (`sec min hour dom month dow`).
    Cron { expression: String },
}

impl Recurrence {
    pub fn every(secs: u64) -> Self {
        Self::Interval { every_secs: secs }
    }

    pub fn daily(hour: u32, minute: u32) -> Result<Self, String> {
        Ok(Self::Daily {
            at: time_of_day(hour, minute)?,
        })
    }

    pub fn weekly(weekday: Weekday, hour: u32, minute: u32) -> Result<Self, String> {
        Ok(Self::Weekly {
            weekday,
            at: time_of_day(hour, minute)?,
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Interval { every_secs: 0 } => Err("interval must be at least one second".to_string()),
            Self::Interval { every_secs } if interval(*every_secs).is_none() => {
                Err(format!("interval of {} seconds is out of range", every_secs))
            }
            Self::Cron { expression } => Schedule::from_str(expression)
                .map(|_| ())
                .map_err(|e| format!("invalid cron expression '{}': {}", expression, e)),
            _ => Ok(()),
        }
    }

    /// Due time of a freshly registered trigger. Interval workflows fire on the
    /// first tick after startup; calendar workflows wait for their next slot.
    pub fn first_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval { .. } => Some(now),
            _ => self.next_after(now),
        }
    }

    /// Next due time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval { every_secs } => now.checked_add_signed(interval(*every_secs)?),
            Self::Daily { at } => {
                let today = Utc.from_utc_datetime(&now.date_naive().and_time(*at));
                if today > now {
                    Some(today)
                } else {
                    today.checked_add_signed(Duration::days(1))
                }
            }
            Self::Weekly { weekday, at } => {
                let days_ahead = (7 + weekday.num_days_from_monday()
                    - now.weekday().num_days_from_monday())
                    % 7;
                let date = now.date_naive() + Duration::days(i64::from(days_ahead));
                let candidate = Utc.from_utc_datetime(&date.and_time(*at));
                if candidate > now {
                    Some(candidate)
                } else {
                    candidate.checked_add_signed(Duration::weeks(1))
                }
            }
            Self::Cron { expression } => Schedule::from_str(expression).ok()?.after(&now).next(),
        }
    }
}

fn time_of_day(hour: u32, minute: u32) -> Result<NaiveTime, String> {
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| format!("invalid time of day {:02}:{:02}", hour, minute))
}

fn interval(every_secs: u64) -> Option<Duration> {
    i64::try_from(every_secs).ok().and_then(Duration::try_seconds)
}
