//! Rule guardrails — checked before materializing content or posts.
//!
//! Violations never abort a run; they downgrade the produced content to
//! `needs_review` and are recorded on its metadata.

use chrono::{DateTime, NaiveTime, Utc};

use crate::error::OutpostError;
use crate::store::models::{AutomationRule, QuietHours};
use crate::store::Store;

pub const VIOLATION_MAX_POSTS_PER_DAY: &str = "max_posts_per_day_project";
pub const VIOLATION_QUIET_HOURS: &str = "quiet_hours";
pub const VIOLATION_BLACKOUT_DATE: &str = "blackout_date";
pub const VIOLATION_DUPLICATE_TOPIC: &str = "duplicate_topic";

/// Whether `now` falls inside the window: start inclusive, end exclusive,
/// wrapping midnight when `start > end`.
pub fn in_quiet_hours(quiet: &QuietHours, now: DateTime<Utc>) -> bool {
    let Ok(start) = NaiveTime::parse_from_str(&quiet.start, "%H:%M") else {
        return false;
    };
    let Ok(end) = NaiveTime::parse_from_str(&quiet.end, "%H:%M") else {
        return false;
    };
    let current = now.time();
    if start <= end {
        current >= start && current < end
    } else {
        current >= start || current < end
    }
}

/// Evaluate every guardrail configured on the rule. `title` enables the
/// duplicate-topic check when content was generated.
pub fn check_guardrails(
    store: &dyn Store,
    rule: &AutomationRule,
    now: DateTime<Utc>,
    title: Option<&str>,
) -> Result<Vec<String>, OutpostError> {
    let mut violations = Vec::new();
    let guardrails = &rule.guardrails;

    if let Some(max_per_day) = guardrails.max_posts_per_day_project {
        if max_per_day > 0 {
            let day_start = now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|naive| naive.and_utc())
                .unwrap_or(now);
            let day_end = day_start + chrono::Duration::days(1);
            let posts_today = store.count_posts_created_between(
                rule.tenant_id,
                rule.project_id,
                day_start,
                day_end,
            )?;
            if posts_today >= u64::from(max_per_day) {
                violations.push(VIOLATION_MAX_POSTS_PER_DAY.to_string());
            }
        }
    }

    if let Some(quiet) = &guardrails.quiet_hours {
        if in_quiet_hours(quiet, now) {
            violations.push(VIOLATION_QUIET_HOURS.to_string());
        }
    }

    if !guardrails.blackout_dates.is_empty() {
        let today = now.date_naive().to_string();
        if guardrails.blackout_dates.iter().any(|date| *date == today) {
            violations.push(VIOLATION_BLACKOUT_DATE.to_string());
        }
    }

    if let (Some(days), Some(title)) = (guardrails.duplicate_topic_days, title) {
        if days > 0 && !title.trim().is_empty() {
            let since = now - chrono::Duration::days(i64::from(days));
            let duplicate = store.duplicate_title_exists(
                rule.tenant_id,
                rule.project_id,
                &title.trim().to_lowercase(),
                since,
            )?;
            if duplicate {
                violations.push(VIOLATION_DUPLICATE_TOPIC.to_string());
            }
        }
    }

    Ok(violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{
        ActionKind, ContentItem, ContentSource, ContentStatus, Guardrails, Post, TriggerKind,
    };
    use crate::store::MemoryStore;
    use crate::types::{ContentItemId, ProjectId, RuleId, TenantId};
    use chrono::TimeZone;
    use serde_json::json;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, h, m, 0).unwrap()
    }

    fn rule_with(guardrails: Guardrails) -> AutomationRule {
        AutomationRule {
            id: RuleId::new(),
            tenant_id: TenantId::new(),
            project_id: ProjectId::new(),
            name: "guarded".into(),
            trigger: TriggerKind::Cron,
            trigger_config: json!({ "cron": "*/30 * * * *" }),
            action: ActionKind::GeneratePost,
            action_config: json!({}),
            guardrails,
            campaign_id: None,
            is_enabled: true,
            created_at: at(0, 0),
        }
    }

    #[test]
    fn test_quiet_hours_plain_window() {
        let quiet = QuietHours {
            start: "09:00".into(),
            end: "17:00".into(),
        };
        assert!(in_quiet_hours(&quiet, at(9, 0)), "start is inclusive");
        assert!(in_quiet_hours(&quiet, at(12, 30)));
        assert!(!in_quiet_hours(&quiet, at(17, 0)), "end is exclusive");
        assert!(!in_quiet_hours(&quiet, at(8, 59)));
    }

    #[test]
    fn test_quiet_hours_wrap_midnight() {
        let quiet = QuietHours {
            start: "22:00".into(),
            end: "06:00".into(),
        };
        assert!(in_quiet_hours(&quiet, at(23, 30)));
        assert!(in_quiet_hours(&quiet, at(3, 0)));
        assert!(in_quiet_hours(&quiet, at(22, 0)));
        assert!(!in_quiet_hours(&quiet, at(6, 0)));
        assert!(!in_quiet_hours(&quiet, at(12, 0)));
    }

    #[test]
    fn test_quiet_hours_malformed_never_matches() {
        let quiet = QuietHours {
            start: "late".into(),
            end: "06:00".into(),
        };
        assert!(!in_quiet_hours(&quiet, at(23, 0)));
    }

    #[test]
    fn test_quiet_hours_guardrail_violation() {
        let store = MemoryStore::new();
        let rule = rule_with(Guardrails {
            quiet_hours: Some(QuietHours {
                start: "22:00".into(),
                end: "06:00".into(),
            }),
            ..Default::default()
        });
        let violations = check_guardrails(&store, &rule, at(23, 30), None).unwrap();
        assert_eq!(violations, vec![VIOLATION_QUIET_HOURS]);

        let clear = check_guardrails(&store, &rule, at(12, 0), None).unwrap();
        assert!(clear.is_empty());
    }

    #[test]
    fn test_max_posts_per_day() {
        let store = MemoryStore::new();
        let rule = rule_with(Guardrails {
            max_posts_per_day_project: Some(2),
            ..Default::default()
        });
        for i in 0..2 {
            let post = Post::new(
                rule.tenant_id,
                rule.project_id,
                format!("post {i}"),
                "body",
                at(8, i),
            );
            store.insert_post(&post).unwrap();
        }
        let violations = check_guardrails(&store, &rule, at(10, 0), None).unwrap();
        assert_eq!(violations, vec![VIOLATION_MAX_POSTS_PER_DAY]);
    }

    #[test]
    fn test_blackout_dates() {
        let store = MemoryStore::new();
        let rule = rule_with(Guardrails {
            blackout_dates: vec!["2025-06-01".into(), "2025-12-25".into()],
            ..Default::default()
        });
        let violations = check_guardrails(&store, &rule, at(10, 0), None).unwrap();
        assert_eq!(violations, vec![VIOLATION_BLACKOUT_DATE]);

        let tomorrow = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        assert!(check_guardrails(&store, &rule, tomorrow, None).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_topic_window() {
        let store = MemoryStore::new();
        let rule = rule_with(Guardrails {
            duplicate_topic_days: Some(30),
            ..Default::default()
        });
        store
            .insert_content_item(
                &ContentItem {
                    id: ContentItemId::new(),
                    tenant_id: rule.tenant_id,
                    project_id: rule.project_id,
                    campaign_id: None,
                    template_id: None,
                    status: ContentStatus::Draft,
                    title: "Spring Launch".into(),
                    body: "body".into(),
                    metadata: json!({}),
                    source: ContentSource::Ai,
                    created_at: at(8, 0),
                },
                &[],
            )
            .unwrap();

        let violations =
            check_guardrails(&store, &rule, at(10, 0), Some("spring launch")).unwrap();
        assert_eq!(violations, vec![VIOLATION_DUPLICATE_TOPIC]);

        // A different title passes; the check is title-gated.
        assert!(check_guardrails(&store, &rule, at(10, 0), Some("summer launch"))
            .unwrap()
            .is_empty());
        assert!(check_guardrails(&store, &rule, at(10, 0), None).unwrap().is_empty());
    }
}
