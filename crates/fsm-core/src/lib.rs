//! Core domain model and recurrence math for FSM.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fsm-core";

/// Recurrence unit of a service schedule, persisted as its SCREAMING_SNAKE tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Bimonthly,
    Quarterly,
    Semiannual,
    Annual,
    Custom,
}

impl Frequency {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Biweekly => "BIWEEKLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Bimonthly => "BIMONTHLY",
            Frequency::Quarterly => "QUARTERLY",
            Frequency::Semiannual => "SEMIANNUAL",
            Frequency::Annual => "ANNUAL",
            Frequency::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl FromStr for Frequency {
    type Err = RecurrenceError;

    /// Tags outside the nine known values are a hard error, never a fallback.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DAILY" => Ok(Frequency::Daily),
            "WEEKLY" => Ok(Frequency::Weekly),
            "BIWEEKLY" => Ok(Frequency::Biweekly),
            "MONTHLY" => Ok(Frequency::Monthly),
            "BIMONTHLY" => Ok(Frequency::Bimonthly),
            "QUARTERLY" => Ok(Frequency::Quarterly),
            "SEMIANNUAL" => Ok(Frequency::Semiannual),
            "ANNUAL" => Ok(Frequency::Annual),
            "CUSTOM" => Ok(Frequency::Custom),
            other => Err(RecurrenceError::InvalidFrequency(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecurrenceError {
    #[error("unrecognized frequency tag `{0}`")]
    InvalidFrequency(String),
    #[error("CUSTOM frequency requires a positive interval in days")]
    MissingCustomInterval,
    #[error("day of month {0} is outside 1..=31")]
    InvalidDayOfMonth(u32),
    #[error("date arithmetic left the supported calendar range")]
    DateOverflow,
}

/// Kind tag on a service order; only `Scheduled` orders belong to the
/// materialization/dedup lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceKind {
    Scheduled,
    OnDemand,
}

impl ServiceKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            ServiceKind::Scheduled => "SCHEDULED",
            ServiceKind::OnDemand => "ON_DEMAND",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "SCHEDULED" => Some(ServiceKind::Scheduled),
            "ON_DEMAND" => Some(ServiceKind::OnDemand),
            _ => None,
        }
    }
}

/// Recurring-service configuration. `last_run_at`/`next_run_at` are owned by
/// the maintenance pass; everything else comes from the scheduling surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSchedule {
    pub id: Uuid,
    pub frequency: Frequency,
    /// Interval in days, only meaningful for `Frequency::Custom`.
    pub custom_interval_days: Option<u32>,
    /// Preferred day of month (1..=31), only consulted for `Frequency::Monthly`.
    pub day_of_month: Option<u32>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl ServiceSchedule {
    pub fn recurrence(&self) -> Recurrence {
        Recurrence {
            frequency: self.frequency,
            custom_interval_days: self.custom_interval_days,
            day_of_month: self.day_of_month,
        }
    }
}

/// One materialized (or ad-hoc) visit on the service calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceOrder {
    pub id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub scheduled_for: DateTime<Utc>,
    pub start_time: Option<NaiveTime>,
    pub kind: ServiceKind,
    pub created_at: DateTime<Utc>,
}

impl ServiceOrder {
    /// Calendar day (UTC) this order occupies on the service calendar.
    pub fn slot_day(&self) -> NaiveDate {
        self.scheduled_for.date_naive()
    }
}

/// Pure next-occurrence calculator. Time-of-day is out of scope: the
/// calculator maps calendar days to calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recurrence {
    pub frequency: Frequency,
    pub custom_interval_days: Option<u32>,
    pub day_of_month: Option<u32>,
}

impl Recurrence {
    /// Next occurrence strictly after `reference`.
    ///
    /// Month and year steps use calendar-aware arithmetic: a step landing on a
    /// day the target month does not have clamps to that month's last day
    /// (Jan 31 + 1 month = Feb 29 in a leap year). The same clamping applies
    /// when a monthly schedule pins `day_of_month` past the month's length.
    pub fn next_after(&self, reference: NaiveDate) -> Result<NaiveDate, RecurrenceError> {
        match self.frequency {
            Frequency::Daily => add_days(reference, 1),
            Frequency::Weekly => add_days(reference, 7),
            Frequency::Biweekly => add_days(reference, 15),
            Frequency::Monthly => {
                let shifted = add_months(reference, 1)?;
                match self.day_of_month {
                    Some(day) => pin_day_of_month(shifted, day),
                    None => Ok(shifted),
                }
            }
            Frequency::Bimonthly => add_months(reference, 2),
            Frequency::Quarterly => add_months(reference, 3),
            Frequency::Semiannual => add_months(reference, 6),
            Frequency::Annual => add_months(reference, 12),
            Frequency::Custom => match self.custom_interval_days {
                Some(days) if days > 0 => add_days(reference, u64::from(days)),
                _ => Err(RecurrenceError::MissingCustomInterval),
            },
        }
    }
}

/// Midnight UTC on `date`, the canonical instant persisted for run pointers.
pub fn utc_midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn add_days(date: NaiveDate, days: u64) -> Result<NaiveDate, RecurrenceError> {
    date.checked_add_days(Days::new(days))
        .ok_or(RecurrenceError::DateOverflow)
}

fn add_months(date: NaiveDate, months: u32) -> Result<NaiveDate, RecurrenceError> {
    date.checked_add_months(Months::new(months))
        .ok_or(RecurrenceError::DateOverflow)
}

/// Move `date` to `day` within its month, clamping past the month's last day.
fn pin_day_of_month(date: NaiveDate, day: u32) -> Result<NaiveDate, RecurrenceError> {
    if !(1..=31).contains(&day) {
        return Err(RecurrenceError::InvalidDayOfMonth(day));
    }
    let clamped = day.min(days_in_month(date.year(), date.month()));
    date.with_day(clamped).ok_or(RecurrenceError::DateOverflow)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn recurrence(frequency: Frequency) -> Recurrence {
        Recurrence {
            frequency,
            custom_interval_days: None,
            day_of_month: None,
        }
    }

    #[test]
    fn fixed_day_offsets_cross_month_and_year_boundaries() {
        assert_eq!(
            recurrence(Frequency::Daily).next_after(date(2024, 12, 31)),
            Ok(date(2025, 1, 1))
        );
        assert_eq!(
            recurrence(Frequency::Weekly).next_after(date(2024, 12, 30)),
            Ok(date(2025, 1, 6))
        );
        assert_eq!(
            recurrence(Frequency::Biweekly).next_after(date(2025, 1, 20)),
            Ok(date(2025, 2, 4))
        );
    }

    #[test]
    fn month_steps_clamp_to_short_months() {
        assert_eq!(
            recurrence(Frequency::Monthly).next_after(date(2024, 1, 31)),
            Ok(date(2024, 2, 29))
        );
        assert_eq!(
            recurrence(Frequency::Bimonthly).next_after(date(2024, 12, 31)),
            Ok(date(2025, 2, 28))
        );
        assert_eq!(
            recurrence(Frequency::Quarterly).next_after(date(2024, 11, 30)),
            Ok(date(2025, 2, 28))
        );
        assert_eq!(
            recurrence(Frequency::Semiannual).next_after(date(2024, 8, 31)),
            Ok(date(2025, 2, 28))
        );
    }

    #[test]
    fn annual_step_resolves_leap_day() {
        assert_eq!(
            recurrence(Frequency::Annual).next_after(date(2024, 2, 29)),
            Ok(date(2025, 2, 28))
        );
    }

    #[test]
    fn monthly_day_pin_hits_exact_day() {
        let rec = Recurrence {
            frequency: Frequency::Monthly,
            custom_interval_days: None,
            day_of_month: Some(10),
        };
        assert_eq!(rec.next_after(date(2025, 3, 5)), Ok(date(2025, 4, 10)));
    }

    #[test]
    fn monthly_day_pin_clamps_instead_of_rolling_over() {
        let rec = Recurrence {
            frequency: Frequency::Monthly,
            custom_interval_days: None,
            day_of_month: Some(31),
        };
        assert_eq!(rec.next_after(date(2024, 1, 15)), Ok(date(2024, 2, 29)));
        assert_eq!(rec.next_after(date(2025, 3, 31)), Ok(date(2025, 4, 30)));
    }

    #[test]
    fn monthly_day_pin_rejects_out_of_range_days() {
        for bad_day in [0, 32] {
            let rec = Recurrence {
                frequency: Frequency::Monthly,
                custom_interval_days: None,
                day_of_month: Some(bad_day),
            };
            assert_eq!(
                rec.next_after(date(2025, 1, 1)),
                Err(RecurrenceError::InvalidDayOfMonth(bad_day))
            );
        }
    }

    #[test]
    fn custom_interval_adds_exact_days() {
        for days in [1u32, 10, 365] {
            let rec = Recurrence {
                frequency: Frequency::Custom,
                custom_interval_days: Some(days),
                day_of_month: None,
            };
            let start = date(2025, 1, 1);
            let expected = start
                .checked_add_days(Days::new(u64::from(days)))
                .expect("in range");
            assert_eq!(rec.next_after(start), Ok(expected));
        }
    }

    #[test]
    fn custom_without_interval_is_an_error_not_a_fallback() {
        for interval in [None, Some(0)] {
            let rec = Recurrence {
                frequency: Frequency::Custom,
                custom_interval_days: interval,
                day_of_month: None,
            };
            assert_eq!(
                rec.next_after(date(2025, 6, 1)),
                Err(RecurrenceError::MissingCustomInterval)
            );
        }
    }

    #[test]
    fn next_occurrence_is_strictly_after_reference() {
        let frequencies = [
            Frequency::Daily,
            Frequency::Weekly,
            Frequency::Biweekly,
            Frequency::Monthly,
            Frequency::Bimonthly,
            Frequency::Quarterly,
            Frequency::Semiannual,
            Frequency::Annual,
        ];
        let references = [
            date(2024, 2, 29),
            date(2024, 12, 31),
            date(2025, 1, 1),
            date(2025, 6, 15),
        ];
        for frequency in frequencies {
            for reference in references {
                let next = recurrence(frequency)
                    .next_after(reference)
                    .expect("valid step");
                assert!(next > reference, "{frequency} from {reference} gave {next}");
            }
        }
    }

    #[test]
    fn frequency_tags_round_trip() {
        let tags = [
            "DAILY",
            "WEEKLY",
            "BIWEEKLY",
            "MONTHLY",
            "BIMONTHLY",
            "QUARTERLY",
            "SEMIANNUAL",
            "ANNUAL",
            "CUSTOM",
        ];
        for tag in tags {
            let parsed: Frequency = tag.parse().expect("known tag");
            assert_eq!(parsed.as_tag(), tag);
        }
    }

    #[test]
    fn unknown_frequency_tag_is_rejected() {
        let err = "YEARLY".parse::<Frequency>().unwrap_err();
        assert_eq!(err, RecurrenceError::InvalidFrequency("YEARLY".to_string()));
    }

    #[test]
    fn slot_day_truncates_to_utc_day() {
        let order = ServiceOrder {
            id: Uuid::new_v4(),
            schedule_id: Some(Uuid::new_v4()),
            scheduled_for: utc_midnight(date(2025, 6, 10)) + chrono::Duration::hours(14),
            start_time: NaiveTime::from_hms_opt(10, 0, 0),
            kind: ServiceKind::Scheduled,
            created_at: utc_midnight(date(2025, 6, 1)),
        };
        assert_eq!(order.slot_day(), date(2025, 6, 10));
    }
}
