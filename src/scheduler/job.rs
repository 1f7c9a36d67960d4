//! Scheduled job types and cron parsing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTrigger {
    /// Fire once, as soon as the scheduler sees it.
    Immediate,
    /// Fire on every occurrence of a cron expression.
    Cron { expression: String },
}

impl JobTrigger {
    /// The string tag stored in the DB trigger_type column.
    pub fn type_tag(&self) -> &'static str {
        match self {
            JobTrigger::Immediate => "immediate",
            JobTrigger::Cron { .. } => "cron",
        }
    }

    /// Parse a trigger from its DB representation.
    pub fn from_db(trigger_type: &str, expression: Option<String>) -> Result<Self, String> {
        match trigger_type {
            "immediate" => Ok(JobTrigger::Immediate),
            "cron" => {
                let expression = expression.ok_or("cron trigger missing expression")?;
                Ok(JobTrigger::Cron { expression })
            }
            other => Err(format!("unknown trigger type: {other}")),
        }
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            JobTrigger::Immediate => None,
            JobTrigger::Cron { expression } => Some(expression),
        }
    }

    /// First run time for a job scheduled at `now`.
    pub fn first_run_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        match self {
            JobTrigger::Immediate => Ok(now),
            JobTrigger::Cron { expression } => {
                next_cron_fire(expression, now)?.ok_or_else(|| SchedulerError::InvalidCron {
                    expression: expression.clone(),
                    reason: "schedule has no upcoming occurrence".to_string(),
                })
            }
        }
    }

    /// Run time following a firing at `now`. `None` once the job is spent.
    pub fn next_run_after(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        match self {
            JobTrigger::Immediate => Ok(None),
            JobTrigger::Cron { expression } => next_cron_fire(expression, now),
        }
    }
}

/// A request to register a job. Scheduling an existing id replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub id: String,
    /// Name the job handler dispatches on.
    pub callback: String,
    /// JSON array of positional arguments for the callback.
    pub args: serde_json::Value,
    pub trigger: JobTrigger,
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJob {
    pub id: String,
    pub callback: String,
    pub args: serde_json::Value,
    pub trigger: JobTrigger,
    pub next_run_at: DateTime<Utc>,
    /// Bumped on every replace; guards claims against concurrent rescheduling.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parse a cron expression.
///
/// Accepts 5-field crontab (`min hour dom mon dow`, Sunday = 0 or 7),
/// 6/7-field expressions with a seconds column, and `@hourly`-style macros.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, SchedulerError> {
    let normalized = normalize_crontab(expression);
    cron::Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Next occurrence strictly after `after`.
pub fn next_cron_fire(
    expression: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    Ok(parse_cron(expression)?.after(&after).next())
}

/// Rewrite a 5-field crontab into the seconds-first form the `cron` crate reads.
fn normalize_crontab(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return trimmed.to_string();
    }
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() != 5 {
        return fields.join(" ");
    }
    let day_of_week = fields[4]
        .split(',')
        .map(shift_day_of_week)
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], day_of_week
    )
}

/// Crontab numbers days 0-6 from Sunday (7 is Sunday too); `cron` uses 1-7.
fn shift_day_of_week(item: &str) -> String {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };

    let shifted = match base.split_once('-') {
        Some((start, end)) => match (start.parse::<u32>(), end.parse::<u32>()) {
            (Ok(start), Ok(7)) if (1..=6).contains(&start) && step.is_none() => {
                // Range ending on Sunday wraps around to the start of the week.
                return format!("{}-7,1", start + 1);
            }
            (Ok(start), Ok(end)) if start <= 6 && end <= 7 => {
                format!("{}-{}", start + 1, end.min(6) + 1)
            }
            _ => base.to_string(),
        },
        None => match base.parse::<u32>() {
            Ok(0) | Ok(7) => "1".to_string(),
            Ok(n) if n <= 6 => (n + 1).to_string(),
            _ => base.to_string(),
        },
    };

    match step {
        Some(step) => format!("{shifted}/{step}"),
        None => shifted,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike, Weekday};

    use super::*;

    #[test]
    fn crontab_gets_seconds_column() {
        assert_eq!(normalize_crontab("0 * * * *"), "0 0 * * * *");
        assert_eq!(normalize_crontab("  */5  * * * * "), "0 */5 * * * *");
    }

    #[test]
    fn seconds_form_passes_through() {
        assert_eq!(normalize_crontab("0 30 9 * * MON-FRI"), "0 30 9 * * MON-FRI");
        assert_eq!(normalize_crontab("@hourly"), "@hourly");
    }

    #[test]
    fn crontab_day_numbers_are_shifted() {
        assert_eq!(normalize_crontab("0 9 * * 0"), "0 0 9 * * 1");
        assert_eq!(normalize_crontab("0 9 * * 7"), "0 0 9 * * 1");
        assert_eq!(normalize_crontab("0 9 * * 1-5"), "0 0 9 * * 2-6");
        assert_eq!(normalize_crontab("0 9 * * 1,3"), "0 0 9 * * 2,4");
        assert_eq!(normalize_crontab("0 9 * * 5-7"), "0 0 9 * * 6-7,1");
        assert_eq!(normalize_crontab("0 9 * * 0-6"), "0 0 9 * * 1-7");
        assert_eq!(normalize_crontab("0 9 * * */2"), "0 0 9 * * */2");
        assert_eq!(normalize_crontab("0 9 * * MON"), "0 0 9 * * MON");
    }

    #[test]
    fn monday_crontab_fires_on_monday() {
        let next = next_cron_fire("0 9 * * 1", Utc::now()).unwrap().unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn hourly_crontab_fires_on_the_hour() {
        let now = Utc::now();
        let next = next_cron_fire("0 * * * *", now).unwrap().unwrap();
        assert!(next > now);
        assert_eq!(next.minute(), 0);
        assert_eq!(next.second(), 0);
        assert!(next - now <= chrono::Duration::hours(1));
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let err = parse_cron("not a cron").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { expression, .. } if expression == "not a cron"));
    }

    #[test]
    fn immediate_trigger_runs_now_once() {
        let now = Utc::now();
        let trigger = JobTrigger::Immediate;
        assert_eq!(trigger.first_run_at(now).unwrap(), now);
        assert_eq!(trigger.next_run_after(now).unwrap(), None);
    }

    #[test]
    fn cron_trigger_keeps_advancing() {
        let now = Utc::now();
        let trigger = JobTrigger::Cron {
            expression: "* * * * *".to_string(),
        };
        let first = trigger.first_run_at(now).unwrap();
        let second = trigger.next_run_after(first).unwrap().unwrap();
        assert!(first > now);
        assert_eq!(second - first, chrono::Duration::minutes(1));
    }

    #[test]
    fn trigger_db_roundtrip() {
        let cron = JobTrigger::Cron {
            expression: "0 * * * *".to_string(),
        };
        let parsed =
            JobTrigger::from_db(cron.type_tag(), cron.cron_expression().map(String::from)).unwrap();
        assert_eq!(parsed, cron);

        let parsed = JobTrigger::from_db("immediate", None).unwrap();
        assert_eq!(parsed, JobTrigger::Immediate);

        assert!(JobTrigger::from_db("cron", None).is_err());
        assert!(JobTrigger::from_db("interval", None).is_err());
    }
}
