// Schedule validation and schedule-to-queue translation
//
// Everything that turns a Schedule into a queue operation goes through
// `queue_plan`, so enqueue, dequeue and reconciliation always agree on the
// exact repeat specification.

use crate::errors::ScheduleError;
use crate::models::Schedule;
use chrono::{DateTime, Duration, TimeZone, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Policy applied when validating schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    /// Smallest allowed gap between two fires of a repeating job
    pub minimum_execution_interval_minutes: u32,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            minimum_execution_interval_minutes: 5,
        }
    }
}

impl SchedulePolicy {
    fn effective_minimum(&self) -> u32 {
        self.minimum_execution_interval_minutes.max(1)
    }
}

/// Largest interval the job table can hold
pub const MAXIMUM_INTERVAL_MINUTES: u32 = i32::MAX as u32;

/// Why a schedule is being validated; a past OnTime is only rejected on update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPurpose {
    Create,
    Update,
}

/// Validate a schedule against the policy
pub fn validate_schedule(
    schedule: &Schedule,
    policy: &SchedulePolicy,
    purpose: ValidationPurpose,
    now: DateTime<Utc>,
) -> Result<(), ScheduleError> {
    let minimum = policy.effective_minimum();

    match schedule {
        Schedule::Interval(minutes) => {
            if *minutes < minimum {
                return Err(ScheduleError::IntervalTooShort { minimum });
            }
            if *minutes > MAXIMUM_INTERVAL_MINUTES {
                return Err(ScheduleError::IntervalTooLong {
                    maximum: MAXIMUM_INTERVAL_MINUTES,
                });
            }
            Ok(())
        }
        Schedule::Periodical(expression) => {
            let next = next_occurrences(expression, now, 2)?;
            let (first, second) = match next.as_slice() {
                [first, second, ..] => (*first, *second),
                _ => {
                    return Err(ScheduleError::NoNextExecution {
                        schedule_type: "periodical".to_string(),
                    })
                }
            };
            if second - first < Duration::minutes(i64::from(minimum)) {
                return Err(ScheduleError::IntervalTooShort { minimum });
            }
            Ok(())
        }
        Schedule::OnTime(at) => {
            if purpose == ValidationPurpose::Update && *at < now {
                return Err(ScheduleError::DateInPast);
            }
            Ok(())
        }
    }
}

/// Repeat specification of a repeating queue entry.
///
/// Removal of a repeating entry only succeeds when the specification is
/// identical to the one used when it was added.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepeatSpec {
    Every { millis: u64 },
    Cron { expression: String },
}

impl RepeatSpec {
    /// Stable identifier of the specification, used in queue storage keys
    pub fn id(&self) -> String {
        match self {
            RepeatSpec::Every { millis } => format!("every:{}", millis),
            RepeatSpec::Cron { expression } => format!("cron:{}", expression),
        }
    }

    /// Next fire time strictly after `after`.
    ///
    /// Fixed intervals are aligned to multiples of the interval since the
    /// epoch, so the same spec always yields the same fire times.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            RepeatSpec::Every { millis } => {
                if *millis == 0 {
                    return Err(ScheduleError::NoNextExecution {
                        schedule_type: "interval".to_string(),
                    });
                }
                let every = *millis as i64;
                let next_ms = (after.timestamp_millis().div_euclid(every) + 1) * every;
                Ok(Utc.timestamp_millis_opt(next_ms).single())
            }
            RepeatSpec::Cron { expression } => {
                Ok(next_occurrences(expression, after, 1)?.into_iter().next())
            }
        }
    }
}

impl std::fmt::Display for RepeatSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// The queue operation a schedule maps to at a given instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuePlan {
    Repeating(RepeatSpec),
    Delayed { delay_ms: u64 },
    /// OnTime whose instant has already passed; nothing is queued
    Expired,
}

/// Translate a schedule into its queue operation
pub fn queue_plan(schedule: &Schedule, now: DateTime<Utc>) -> QueuePlan {
    match schedule {
        Schedule::Interval(minutes) => QueuePlan::Repeating(RepeatSpec::Every {
            millis: u64::from(*minutes) * 60_000,
        }),
        Schedule::Periodical(expression) => QueuePlan::Repeating(RepeatSpec::Cron {
            expression: expression.clone(),
        }),
        Schedule::OnTime(at) => {
            let delay_ms = (*at - now).num_milliseconds();
            if delay_ms <= 0 {
                QueuePlan::Expired
            } else {
                QueuePlan::Delayed {
                    delay_ms: delay_ms as u64,
                }
            }
        }
    }
}

/// Accept classic 5-field crontab expressions by adding a seconds field
pub fn normalize_cron_expression(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(&normalize_cron_expression(expression)).map_err(|e| {
        ScheduleError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: e.to_string(),
        }
    })
}

/// Next `count` occurrences of a cron expression strictly after `after`, in UTC
pub fn next_occurrences(
    expression: &str,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
    let schedule = parse_cron_expression(expression)?;
    Ok(schedule.after(&after).take(count).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_interval_plan_converts_minutes_to_millis() {
        let plan = queue_plan(&Schedule::Interval(5), Utc::now());
        assert_eq!(plan, QueuePlan::Repeating(RepeatSpec::Every { millis: 300_000 }));
    }

    #[test]
    fn test_periodical_plan_keeps_raw_expression() {
        let plan = queue_plan(&Schedule::Periodical("0 * * * *".to_string()), Utc::now());
        assert_eq!(
            plan,
            QueuePlan::Repeating(RepeatSpec::Cron {
                expression: "0 * * * *".to_string()
            })
        );
    }

    #[test]
    fn test_on_time_plan() {
        let now = at("2024-01-01T00:00:00Z");
        assert_eq!(
            queue_plan(&Schedule::OnTime(now + Duration::seconds(90)), now),
            QueuePlan::Delayed { delay_ms: 90_000 }
        );
        assert_eq!(queue_plan(&Schedule::OnTime(now), now), QueuePlan::Expired);
        assert_eq!(
            queue_plan(&Schedule::OnTime(now - Duration::minutes(1)), now),
            QueuePlan::Expired
        );
    }

    #[test]
    fn test_interval_below_minimum_is_rejected() {
        let policy = SchedulePolicy::default();
        let result = validate_schedule(&Schedule::Interval(4), &policy, ValidationPurpose::Create, Utc::now());
        assert_eq!(result, Err(ScheduleError::IntervalTooShort { minimum: 5 }));

        assert!(validate_schedule(&Schedule::Interval(5), &policy, ValidationPurpose::Create, Utc::now()).is_ok());
    }

    #[test]
    fn test_interval_above_column_range_is_rejected() {
        let policy = SchedulePolicy::default();
        let too_long = Schedule::Interval(MAXIMUM_INTERVAL_MINUTES + 1);
        assert_eq!(
            validate_schedule(&too_long, &policy, ValidationPurpose::Create, Utc::now()),
            Err(ScheduleError::IntervalTooLong {
                maximum: MAXIMUM_INTERVAL_MINUTES
            })
        );

        let longest = Schedule::Interval(MAXIMUM_INTERVAL_MINUTES);
        assert!(validate_schedule(&longest, &policy, ValidationPurpose::Update, Utc::now()).is_ok());
    }

    #[test]
    fn test_zero_minimum_still_requires_one_minute() {
        let policy = SchedulePolicy {
            minimum_execution_interval_minutes: 0,
        };
        let result = validate_schedule(&Schedule::Interval(0), &policy, ValidationPurpose::Create, Utc::now());
        assert_eq!(result, Err(ScheduleError::IntervalTooShort { minimum: 1 }));
    }

    #[test]
    fn test_cron_gap_below_minimum_is_rejected() {
        let policy = SchedulePolicy::default();
        let every_minute = Schedule::Periodical("* * * * *".to_string());
        assert_eq!(
            validate_schedule(&every_minute, &policy, ValidationPurpose::Create, Utc::now()),
            Err(ScheduleError::IntervalTooShort { minimum: 5 })
        );

        let hourly = Schedule::Periodical("0 * * * *".to_string());
        assert!(validate_schedule(&hourly, &policy, ValidationPurpose::Create, Utc::now()).is_ok());
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        let result = validate_schedule(
            &Schedule::Periodical("not a cron".to_string()),
            &SchedulePolicy::default(),
            ValidationPurpose::Create,
            Utc::now(),
        );
        assert!(matches!(result, Err(ScheduleError::InvalidCronExpression { .. })));
    }

    #[test]
    fn test_past_on_time_rejected_only_on_update() {
        let now = Utc::now();
        let past = Schedule::OnTime(now - Duration::hours(1));
        let policy = SchedulePolicy::default();

        assert!(validate_schedule(&past, &policy, ValidationPurpose::Create, now).is_ok());
        assert_eq!(
            validate_schedule(&past, &policy, ValidationPurpose::Update, now),
            Err(ScheduleError::DateInPast)
        );
    }

    #[test]
    fn test_normalize_cron_expression() {
        assert_eq!(normalize_cron_expression("0 * * * *"), "0 0 * * * *");
        assert_eq!(normalize_cron_expression("0 0 * * * *"), "0 0 * * * *");
        assert_eq!(normalize_cron_expression("  */5 * * * *  "), "0 */5 * * * *");
    }

    #[test]
    fn test_next_occurrences_for_hourly_cron() {
        let now = at("2024-01-01T10:15:00Z");
        let next = next_occurrences("0 * * * *", now, 2).unwrap();
        assert_eq!(next, vec![at("2024-01-01T11:00:00Z"), at("2024-01-01T12:00:00Z")]);
    }

    #[test]
    fn test_every_spec_aligns_to_interval() {
        let spec = RepeatSpec::Every { millis: 300_000 };
        let next = spec.next_after(at("2024-01-01T10:02:30Z")).unwrap();
        assert_eq!(next, Some(at("2024-01-01T10:05:00Z")));

        // strictly after, even when already aligned
        let next = spec.next_after(at("2024-01-01T10:05:00Z")).unwrap();
        assert_eq!(next, Some(at("2024-01-01T10:10:00Z")));
    }

    #[test]
    fn test_repeat_spec_ids_differ_by_kind() {
        let every = RepeatSpec::Every { millis: 300_000 };
        let cron = RepeatSpec::Cron {
            expression: "0 * * * *".to_string(),
        };
        assert_eq!(every.id(), "every:300000");
        assert_eq!(cron.id(), "cron:0 * * * *");
    }
}
