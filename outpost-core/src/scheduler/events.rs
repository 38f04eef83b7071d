//! Event-rule matching and the publish-event cursor.

use chrono::{DateTime, Utc};

use crate::store::models::{AutomationRule, PublishEvent};

/// Whether an event rule's filters accept a publish event. Empty filter
/// lists accept everything; tenant/project scoping is checked first.
pub fn event_matches_rule(rule: &AutomationRule, event: &PublishEvent) -> bool {
    if rule.tenant_id != event.tenant_id || rule.project_id != event.project_id {
        return false;
    }
    let config = &rule.trigger_config;
    let event_types: Vec<&str> = config
        .get("event_types")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    if !event_types.is_empty() && !event_types.contains(&event.event_type.as_str()) {
        return false;
    }
    let statuses: Vec<&str> = config
        .get("statuses")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    if !statuses.is_empty() && !statuses.contains(&event.status.as_str()) {
        return false;
    }
    true
}

/// Parse a stored cursor value; malformed or missing cursors fall back to a
/// short lookback so a corrupted key cannot replay the whole log.
pub fn parse_cursor(raw: Option<String>, now: DateTime<Utc>) -> DateTime<Utc> {
    raw.and_then(|value| {
        DateTime::parse_from_rfc3339(&value)
            .ok()
            .map(|d| d.with_timezone(&Utc))
    })
    .unwrap_or(now - chrono::Duration::minutes(5))
}
