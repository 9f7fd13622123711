//! Minimal 5-field cron expression evaluation.
//!
//! Supports `*`, single values, ranges, comma lists and `/step`, which
//! covers the preset table with room to spare. Evaluation is in local time
//! since the presets describe wall-clock moments.

use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::Datelike;
use chrono::Duration as ChronoDuration;
use chrono::Local;
use chrono::NaiveTime;
use chrono::TimeZone;
use chrono::Timelike;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CronParseError {
    #[error("cron expression must have 5 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid cron field '{0}'")]
    Field(String),
    #[error("cron value {value} out of range {min}..={max}")]
    Range { value: u32, min: u32, max: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::FieldCount(fields.len()));
        }

        let minutes = parse_field(fields[0], 0, 59)?;
        let hours = parse_field(fields[1], 0, 23)?;
        let days_of_month = parse_field(fields[2], 1, 31)?;
        let months = parse_field(fields[3], 1, 12)?;
        // 0 and 7 both mean Sunday.
        let days_of_week: BTreeSet<u32> = parse_field(fields[4], 0, 7)?
            .into_iter()
            .map(|d| if d == 7 { 0 } else { d })
            .collect();

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    fn day_matches(&self, date: chrono::NaiveDate) -> bool {
        if !self.months.contains(&date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(&date.day());
        let dow = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());
        // Classic cron: when both day fields are restricted the match is a
        // union, otherwise both must hold.
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }

    /// The next local instant strictly after `after` matching this
    /// expression. `None` only if nothing matches within four years
    /// (an unsatisfiable field combination).
    pub fn next_after(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        let start = after + ChronoDuration::minutes(1);
        let start_date = start.date_naive();
        let start_minute_of_day = start.hour() * 60 + start.minute();

        for day_offset in 0..(4 * 366) {
            let date = start_date + ChronoDuration::days(day_offset);
            if !self.day_matches(date) {
                continue;
            }

            let floor = if day_offset == 0 {
                start_minute_of_day
            } else {
                0
            };

            for &hour in &self.hours {
                for &minute in &self.minutes {
                    let minute_of_day = hour * 60 + minute;
                    if minute_of_day < floor {
                        continue;
                    }
                    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
                    let naive = date.and_time(time);
                    // Skip instants that do not exist locally (DST gaps).
                    if let Some(resolved) = Local.from_local_datetime(&naive).earliest() {
                        return Some(resolved);
                    }
                }
            }
        }

        None
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<BTreeSet<u32>, CronParseError> {
    let mut values = BTreeSet::new();

    for part in field.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| CronParseError::Field(part.to_string()))?;
                if step == 0 {
                    return Err(CronParseError::Field(part.to_string()));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let a: u32 = a
                .parse()
                .map_err(|_| CronParseError::Field(part.to_string()))?;
            let b: u32 = b
                .parse()
                .map_err(|_| CronParseError::Field(part.to_string()))?;
            (a, b)
        } else {
            let v: u32 = range_part
                .parse()
                .map_err(|_| CronParseError::Field(part.to_string()))?;
            (v, v)
        };

        for value in [lo, hi] {
            if value < min || value > max {
                return Err(CronParseError::Range { value, min, max });
            }
        }
        if lo > hi {
            return Err(CronParseError::Field(part.to_string()));
        }

        values.extend((lo..=hi).step_by(step as usize));
    }

    Ok(values)
}
