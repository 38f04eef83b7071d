//! Time-rule due logic — cron and interval triggers.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::SchedulerError;
use crate::store::models::{AutomationRule, TriggerKind};
use crate::types::RuleId;

/// The `cron` crate expects a seconds field; operator-facing rules use the
/// conventional five-field form. Normalize by prepending seconds.
pub fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

fn parse_schedule(expression: &str) -> Result<Schedule, SchedulerError> {
    let normalized = normalize_cron(expression);
    Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCronExpression {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// A cron rule is due when the first fire after the latest run has passed.
/// With no prior run the rule fires immediately.
pub fn cron_due(
    expression: &str,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool, SchedulerError> {
    let schedule = parse_schedule(expression)?;
    match last_run {
        None => Ok(true),
        Some(last) => Ok(schedule
            .after(&last)
            .next()
            .map(|next_fire| next_fire <= now)
            .unwrap_or(false)),
    }
}

/// An interval rule is due when `now >= last_run + interval` (or never ran).
pub fn interval_due(
    interval_seconds: i64,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if interval_seconds <= 0 {
        return false;
    }
    match last_run {
        None => true,
        Some(last) => now >= last + chrono::Duration::seconds(interval_seconds),
    }
}

/// Whether the rule should fire at `now` given its most recent run.
pub fn rule_due(
    rule: &AutomationRule,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match rule.trigger {
        TriggerKind::Cron => {
            let Some(expression) = rule.trigger_config.get("cron").and_then(|v| v.as_str()) else {
                return false;
            };
            match cron_due(expression, last_run, now) {
                Ok(due) => due,
                Err(err) => {
                    tracing::warn!(rule_id = %rule.id, error = %err, "invalid cron expression on rule");
                    false
                }
            }
        }
        TriggerKind::Interval => {
            let interval_seconds = rule
                .trigger_config
                .get("interval_seconds")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            interval_due(interval_seconds, last_run, now)
        }
        TriggerKind::Event => false,
    }
}

/// Minute-bucketed anti-stampede fingerprint:
/// `{rule_id}:{trigger}:{YYYYmmddHHMM}`.
pub fn rule_fingerprint(rule_id: RuleId, trigger: TriggerKind, now: DateTime<Utc>) -> String {
    format!(
        "{rule_id}:{}:{}",
        trigger.as_str(),
        now.format("%Y%m%d%H%M")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_normalize_cron_five_fields() {
        assert_eq!(normalize_cron("*/30 * * * *"), "0 */30 * * * *");
        assert_eq!(normalize_cron("0 9 * * 1-5"), "0 0 9 * * 1-5");
        // Six-field expressions pass through untouched.
        assert_eq!(normalize_cron("0 0 9 * * *"), "0 0 9 * * *");
    }

    #[test]
    fn test_cron_due_no_prior_run() {
        assert!(cron_due("*/30 * * * *", None, at(10, 0)).unwrap());
    }

    #[test]
    fn test_cron_due_after_fire_boundary() {
        // Last ran at 09:50; the 10:00 fire has passed by 10:05.
        assert!(cron_due("*/30 * * * *", Some(at(9, 50)), at(10, 5)).unwrap());
        // Last ran at 10:01; next fire is 10:30, not yet due at 10:05.
        assert!(!cron_due("*/30 * * * *", Some(at(10, 1)), at(10, 5)).unwrap());
    }

    #[test]
    fn test_cron_invalid_expression() {
        let err = cron_due("not a cron", None, at(10, 0)).unwrap_err();
        assert!(err.to_string().contains("not a cron"));
    }

    #[test]
    fn test_interval_due() {
        assert!(interval_due(600, None, at(10, 0)));
        assert!(interval_due(600, Some(at(9, 49)), at(10, 0)));
        assert!(!interval_due(600, Some(at(9, 55)), at(10, 0)));
        // Zero or negative interval never fires.
        assert!(!interval_due(0, None, at(10, 0)));
    }

    #[test]
    fn test_rule_fingerprint_minute_bucket() {
        let rule_id = RuleId::new();
        let a = rule_fingerprint(rule_id, TriggerKind::Cron, at(10, 30));
        let b = rule_fingerprint(
            rule_id,
            TriggerKind::Cron,
            Utc.with_ymd_and_hms(2025, 6, 1, 10, 30, 45).unwrap(),
        );
        // Same minute, same fingerprint regardless of seconds.
        assert_eq!(a, b);
        assert!(a.ends_with(":cron:202506011030"));

        let c = rule_fingerprint(rule_id, TriggerKind::Cron, at(10, 31));
        assert_ne!(a, c);
    }
}
