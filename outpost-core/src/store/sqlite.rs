//! SQLite store backend.
//!
//! Schema is created on open. Timestamps are stored as RFC 3339 text and
//! JSON columns as serialized text. Composite methods run inside a single
//! transaction; uniqueness violations surface as `StoreError::Conflict`
//! through the `From<rusqlite::Error>` mapping.
//!
//! SQLite has no `FOR UPDATE SKIP LOCKED`; due-post claiming uses the
//! status compare-and-swap UPDATE so concurrent claimers take disjoint
//! rows.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;

use super::models::*;
use super::{AttemptStats, Store, StoreResult};
use crate::error::StoreError;
use crate::types::{
    CampaignId, ChannelId, ChannelKind, ContentItemId, EventId, IncidentId, PostId, ProjectId,
    RuleId, RunId, TemplateId, TenantId,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_projects_tenant ON projects(tenant_id);

CREATE TABLE IF NOT EXISTS posts (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    project_id TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN
        ('draft','scheduled','publishing','published','published_partial','failed')),
    publish_at TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_posts_tenant ON posts(tenant_id);
CREATE INDEX IF NOT EXISTS ix_posts_due ON posts(status, publish_at);

CREATE TABLE IF NOT EXISTS channels (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    project_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('active','disabled')),
    capabilities TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (tenant_id, project_id, kind)
);
CREATE INDEX IF NOT EXISTS ix_channels_tenant ON channels(tenant_id);

CREATE TABLE IF NOT EXISTS connector_credentials (
    tenant_id TEXT NOT NULL,
    connector TEXT NOT NULL,
    encrypted_access_token TEXT,
    encrypted_refresh_token TEXT,
    expires_at TEXT,
    scopes TEXT NOT NULL,
    account_ref TEXT,
    status TEXT NOT NULL CHECK (status IN ('active','revoked','error')),
    last_error TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (tenant_id, connector)
);

CREATE TABLE IF NOT EXISTS channel_publications (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    post_id TEXT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
    channel_id TEXT NOT NULL,
    external_post_id TEXT NOT NULL,
    metadata TEXT NOT NULL,
    published_at TEXT NOT NULL,
    UNIQUE (tenant_id, post_id, channel_id),
    UNIQUE (tenant_id, channel_id, external_post_id)
);
CREATE INDEX IF NOT EXISTS ix_channel_publications_tenant ON channel_publications(tenant_id);

CREATE TABLE IF NOT EXISTS website_publications (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    post_id TEXT NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
    slug TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    published_at TEXT NOT NULL,
    UNIQUE (tenant_id, post_id),
    UNIQUE (tenant_id, slug)
);

CREATE TABLE IF NOT EXISTS publish_events (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    post_id TEXT NOT NULL,
    channel_id TEXT,
    event_type TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('ok','error')),
    attempt INTEGER NOT NULL DEFAULT 1,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_publish_events_tenant ON publish_events(tenant_id);
CREATE INDEX IF NOT EXISTS ix_publish_events_created ON publish_events(created_at);
CREATE INDEX IF NOT EXISTS ix_publish_events_post ON publish_events(tenant_id, post_id);

CREATE TABLE IF NOT EXISTS automation_rules (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    project_id TEXT NOT NULL,
    name TEXT NOT NULL,
    trigger_kind TEXT NOT NULL CHECK (trigger_kind IN ('cron','interval','event')),
    trigger_config TEXT NOT NULL,
    action_kind TEXT NOT NULL CHECK (action_kind IN
        ('generate_post','schedule_post','publish_now','sync_metrics')),
    action_config TEXT NOT NULL,
    guardrails TEXT NOT NULL,
    campaign_id TEXT,
    is_enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_automation_rules_tenant ON automation_rules(tenant_id);

CREATE TABLE IF NOT EXISTS automation_runs (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('queued','running','success','partial','failed')),
    stats TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_automation_runs_rule ON automation_runs(tenant_id, project_id, rule_id);

CREATE TABLE IF NOT EXISTS automation_events (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    run_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('ok','error')),
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_automation_events_run ON automation_events(tenant_id, run_id);

CREATE TABLE IF NOT EXISTS content_items (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    campaign_id TEXT,
    template_id TEXT,
    status TEXT NOT NULL CHECK (status IN
        ('draft','needs_review','approved','rejected','scheduled','published','failed')),
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    metadata TEXT NOT NULL,
    source TEXT NOT NULL CHECK (source IN ('ai','manual')),
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_content_items_tenant ON content_items(tenant_id, project_id);

CREATE TABLE IF NOT EXISTS content_templates (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    name TEXT NOT NULL,
    template_type TEXT NOT NULL,
    prompt_template TEXT NOT NULL,
    output_schema TEXT,
    default_values TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS campaigns (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    name TEXT NOT NULL,
    brand_profile TEXT NOT NULL,
    language TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS channel_retry_policies (
    channel_kind TEXT PRIMARY KEY,
    max_attempts INTEGER NOT NULL,
    backoff TEXT NOT NULL CHECK (backoff IN ('linear','exponential')),
    retry_delay_seconds INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS platform_rate_limits (
    platform TEXT PRIMARY KEY,
    requests_per_minute INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS feature_flags (
    key TEXT PRIMARY KEY,
    enabled_globally INTEGER NOT NULL DEFAULT 0,
    enabled_per_tenant TEXT NOT NULL,
    description TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS platform_incidents (
    id TEXT PRIMARY KEY,
    tenant_id TEXT,
    incident_type TEXT NOT NULL,
    severity TEXT NOT NULL CHECK (severity IN ('info','warning','critical')),
    status TEXT NOT NULL CHECK (status IN ('open','resolved')),
    message TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE TABLE IF NOT EXISTS tenant_risk_scores (
    tenant_id TEXT PRIMARY KEY,
    risk_score INTEGER NOT NULL,
    publish_failure_ratio REAL NOT NULL,
    flagged_content_ratio REAL NOT NULL,
    abuse_rate REAL NOT NULL,
    rate_limit_violations INTEGER NOT NULL,
    level TEXT NOT NULL CHECK (level IN ('low','medium','high','critical')),
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS company_subscriptions (
    tenant_id TEXT PRIMARY KEY,
    plan TEXT NOT NULL,
    max_posts_per_month INTEGER NOT NULL,
    status TEXT NOT NULL,
    grace_period_ends_at TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS company_usages (
    tenant_id TEXT PRIMARY KEY,
    posts_used_current_period INTEGER NOT NULL DEFAULT 0,
    period_started_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS failed_jobs (
    id TEXT PRIMARY KEY,
    tenant_id TEXT,
    queue TEXT NOT NULL,
    payload TEXT NOT NULL,
    error TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ai_quality_policies (
    tenant_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    policy TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (tenant_id, project_id)
);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    tenant_id TEXT,
    action TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stripe_events (
    event_id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    processed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS system_health (
    component TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    latency_ms REAL NOT NULL,
    error_rate REAL NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS performance_baselines (
    id TEXT PRIMARY KEY,
    component TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    avg_value REAL NOT NULL,
    p95_value REAL NOT NULL,
    sample_size INTEGER NOT NULL,
    regression_detected INTEGER NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_performance_baselines_metric
    ON performance_baselines(component, metric_name, recorded_at);
"#;

/// rusqlite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn conversion_err(message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        Type::Text,
        Box::new(std::io::Error::other(message.into())),
    )
}

fn dt(value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(format!("bad timestamp '{value}': {e}")))
}

fn opt_dt(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(dt).transpose()
}

fn sql_dt(value: DateTime<Utc>) -> String {
    // Fixed-precision RFC 3339 so lexicographic order matches time order.
    value.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn opt_sql_dt(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(sql_dt)
}

fn json(value: String) -> rusqlite::Result<Value> {
    serde_json::from_str(&value).map_err(|e| conversion_err(format!("bad json column: {e}")))
}

fn sql_json(value: &Value) -> String {
    value.to_string()
}

fn parse_enum<T>(value: &str, parse: fn(&str) -> Option<T>, what: &str) -> rusqlite::Result<T> {
    parse(value).ok_or_else(|| conversion_err(format!("unknown {what} '{value}'")))
}

fn uuid_col<T: Copy>(value: &str, parse: fn(&str) -> Option<T>, what: &str) -> rusqlite::Result<T> {
    parse(value).ok_or_else(|| conversion_err(format!("bad {what} id '{value}'")))
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        id: uuid_col(&row.get::<_, String>(0)?, PostId::parse, "post")?,
        tenant_id: uuid_col(&row.get::<_, String>(1)?, TenantId::parse, "tenant")?,
        project_id: uuid_col(&row.get::<_, String>(2)?, ProjectId::parse, "project")?,
        title: row.get(3)?,
        content: row.get(4)?,
        status: parse_enum(&row.get::<_, String>(5)?, PostStatus::parse, "post status")?,
        publish_at: opt_dt(row.get(6)?)?,
        last_error: row.get(7)?,
        created_at: dt(row.get(8)?)?,
        updated_at: dt(row.get(9)?)?,
    })
}

const POST_COLUMNS: &str =
    "id, tenant_id, project_id, title, content, status, publish_at, last_error, created_at, updated_at";

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    let capabilities_raw: String = row.get(6)?;
    Ok(Channel {
        id: uuid_col(&row.get::<_, String>(0)?, ChannelId::parse, "channel")?,
        tenant_id: uuid_col(&row.get::<_, String>(1)?, TenantId::parse, "tenant")?,
        project_id: uuid_col(&row.get::<_, String>(2)?, ProjectId::parse, "project")?,
        kind: parse_enum(&row.get::<_, String>(3)?, ChannelKind::parse, "channel kind")?,
        name: row.get(4)?,
        status: parse_enum(&row.get::<_, String>(5)?, ChannelStatus::parse, "channel status")?,
        capabilities: serde_json::from_str(&capabilities_raw)
            .map_err(|e| conversion_err(format!("bad capabilities column: {e}")))?,
        created_at: dt(row.get(7)?)?,
        updated_at: dt(row.get(8)?)?,
    })
}

const CHANNEL_COLUMNS: &str =
    "id, tenant_id, project_id, kind, name, status, capabilities, created_at, updated_at";

fn publish_event_from_row(row: &Row<'_>) -> rusqlite::Result<PublishEvent> {
    let channel_id: Option<String> = row.get(4)?;
    Ok(PublishEvent {
        id: uuid_col(&row.get::<_, String>(0)?, EventId::parse, "event")?,
        tenant_id: uuid_col(&row.get::<_, String>(1)?, TenantId::parse, "tenant")?,
        project_id: uuid_col(&row.get::<_, String>(2)?, ProjectId::parse, "project")?,
        post_id: uuid_col(&row.get::<_, String>(3)?, PostId::parse, "post")?,
        channel_id: channel_id
            .map(|c| uuid_col(&c, ChannelId::parse, "channel"))
            .transpose()?,
        event_type: parse_enum(
            &row.get::<_, String>(5)?,
            PublishEventType::parse,
            "publish event type",
        )?,
        status: parse_enum(&row.get::<_, String>(6)?, EventStatus::parse, "event status")?,
        attempt: row.get::<_, i64>(7)? as u32,
        metadata: json(row.get(8)?)?,
        created_at: dt(row.get(9)?)?,
    })
}

const PUBLISH_EVENT_COLUMNS: &str =
    "id, tenant_id, project_id, post_id, channel_id, event_type, status, attempt, metadata, created_at";

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<AutomationRule> {
    let campaign_id: Option<String> = row.get(9)?;
    let guardrails_raw: String = row.get(8)?;
    Ok(AutomationRule {
        id: uuid_col(&row.get::<_, String>(0)?, RuleId::parse, "rule")?,
        tenant_id: uuid_col(&row.get::<_, String>(1)?, TenantId::parse, "tenant")?,
        project_id: uuid_col(&row.get::<_, String>(2)?, ProjectId::parse, "project")?,
        name: row.get(3)?,
        trigger: parse_enum(&row.get::<_, String>(4)?, TriggerKind::parse, "trigger kind")?,
        trigger_config: json(row.get(5)?)?,
        action: parse_enum(&row.get::<_, String>(6)?, ActionKind::parse, "action kind")?,
        action_config: json(row.get(7)?)?,
        guardrails: serde_json::from_str(&guardrails_raw)
            .map_err(|e| conversion_err(format!("bad guardrails column: {e}")))?,
        campaign_id: campaign_id
            .map(|c| uuid_col(&c, CampaignId::parse, "campaign"))
            .transpose()?,
        is_enabled: row.get::<_, i64>(10)? != 0,
        created_at: dt(row.get(11)?)?,
    })
}

const RULE_COLUMNS: &str = "id, tenant_id, project_id, name, trigger_kind, trigger_config, \
                            action_kind, action_config, guardrails, campaign_id, is_enabled, created_at";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<AutomationRun> {
    Ok(AutomationRun {
        id: uuid_col(&row.get::<_, String>(0)?, RunId::parse, "run")?,
        tenant_id: uuid_col(&row.get::<_, String>(1)?, TenantId::parse, "tenant")?,
        project_id: uuid_col(&row.get::<_, String>(2)?, ProjectId::parse, "project")?,
        rule_id: uuid_col(&row.get::<_, String>(3)?, RuleId::parse, "rule")?,
        status: parse_enum(&row.get::<_, String>(4)?, RunStatus::parse, "run status")?,
        stats: json(row.get(5)?)?,
        started_at: opt_dt(row.get(6)?)?,
        finished_at: opt_dt(row.get(7)?)?,
        created_at: dt(row.get(8)?)?,
    })
}

const RUN_COLUMNS: &str =
    "id, tenant_id, project_id, rule_id, status, stats, started_at, finished_at, created_at";

fn content_item_from_row(row: &Row<'_>) -> rusqlite::Result<ContentItem> {
    let campaign_id: Option<String> = row.get(3)?;
    let template_id: Option<String> = row.get(4)?;
    Ok(ContentItem {
        id: uuid_col(&row.get::<_, String>(0)?, ContentItemId::parse, "content item")?,
        tenant_id: uuid_col(&row.get::<_, String>(1)?, TenantId::parse, "tenant")?,
        project_id: uuid_col(&row.get::<_, String>(2)?, ProjectId::parse, "project")?,
        campaign_id: campaign_id
            .map(|c| uuid_col(&c, CampaignId::parse, "campaign"))
            .transpose()?,
        template_id: template_id
            .map(|t| uuid_col(&t, TemplateId::parse, "template"))
            .transpose()?,
        status: parse_enum(&row.get::<_, String>(5)?, ContentStatus::parse, "content status")?,
        title: row.get(6)?,
        body: row.get(7)?,
        metadata: json(row.get(8)?)?,
        source: parse_enum(&row.get::<_, String>(9)?, ContentSource::parse, "content source")?,
        created_at: dt(row.get(10)?)?,
    })
}

const CONTENT_ITEM_COLUMNS: &str = "id, tenant_id, project_id, campaign_id, template_id, status, \
                                    title, body, metadata, source, created_at";

fn insert_publish_event_sql(conn: &Connection, event: &PublishEvent) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO publish_events \
         (id, tenant_id, project_id, post_id, channel_id, event_type, status, attempt, metadata, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            event.id.to_string(),
            event.tenant_id.to_string(),
            event.project_id.to_string(),
            event.post_id.to_string(),
            event.channel_id.map(|c| c.to_string()),
            event.event_type.as_str(),
            event.status.as_str(),
            event.attempt as i64,
            sql_json(&event.metadata),
            sql_dt(event.created_at),
        ],
    )?;
    Ok(())
}

fn insert_automation_event_sql(conn: &Connection, event: &AutomationEvent) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO automation_events \
         (id, tenant_id, project_id, run_id, event_type, status, metadata, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.id.to_string(),
            event.tenant_id.to_string(),
            event.project_id.to_string(),
            event.run_id.to_string(),
            event.event_type.as_str(),
            event.status.as_str(),
            sql_json(&event.metadata),
            sql_dt(event.created_at),
        ],
    )?;
    Ok(())
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl Store for SqliteStore {
    fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tenants (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![tenant.id.to_string(), tenant.name, sql_dt(tenant.created_at)],
        )?;
        Ok(())
    }

    fn insert_project(&self, project: &Project) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO projects (id, tenant_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                project.id.to_string(),
                project.tenant_id.to_string(),
                project.name,
                sql_dt(project.created_at)
            ],
        )?;
        Ok(())
    }

    fn platform_tenant_ids(&self) -> StoreResult<Vec<TenantId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM tenants ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| {
                uuid_col(&row.get::<_, String>(0)?, TenantId::parse, "tenant")
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn insert_post(&self, post: &Post) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO posts \
             (id, tenant_id, project_id, title, content, status, publish_at, last_error, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                post.id.to_string(),
                post.tenant_id.to_string(),
                post.project_id.to_string(),
                post.title,
                post.content,
                post.status.as_str(),
                opt_sql_dt(post.publish_at),
                post.last_error,
                sql_dt(post.created_at),
                sql_dt(post.updated_at),
            ],
        )?;
        Ok(())
    }

    fn insert_post_with_event(&self, post: &Post, event: &PublishEvent) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO posts \
             (id, tenant_id, project_id, title, content, status, publish_at, last_error, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                post.id.to_string(),
                post.tenant_id.to_string(),
                post.project_id.to_string(),
                post.title,
                post.content,
                post.status.as_str(),
                opt_sql_dt(post.publish_at),
                post.last_error,
                sql_dt(post.created_at),
                sql_dt(post.updated_at),
            ],
        )?;
        insert_publish_event_sql(&tx, event)?;
        tx.commit()?;
        Ok(())
    }

    fn post(&self, tenant_id: TenantId, post_id: PostId) -> StoreResult<Option<Post>> {
        let conn = self.conn.lock().unwrap();
        let post = conn
            .query_row(
                &format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1 AND tenant_id = ?2"),
                params![post_id.to_string(), tenant_id.to_string()],
                post_from_row,
            )
            .optional()?;
        Ok(post)
    }

    fn schedule_post(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        publish_at: DateTime<Utc>,
        from: &[PostStatus],
        event: &PublishEvent,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let placeholders: Vec<String> = from.iter().map(|s| format!("'{}'", s.as_str())).collect();
        let changed = tx.execute(
            &format!(
                "UPDATE posts SET status = 'scheduled', publish_at = ?1, last_error = NULL, updated_at = ?2 \
                 WHERE id = ?3 AND tenant_id = ?4 AND status IN ({})",
                placeholders.join(", ")
            ),
            params![
                sql_dt(publish_at),
                sql_dt(event.created_at),
                post_id.to_string(),
                tenant_id.to_string()
            ],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        insert_publish_event_sql(&tx, event)?;
        tx.commit()?;
        Ok(true)
    }

    fn platform_claim_due_posts(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Post>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let due: Vec<Post> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {POST_COLUMNS} FROM posts \
                 WHERE status = 'scheduled' AND publish_at IS NOT NULL AND publish_at <= ?1 \
                 ORDER BY publish_at ASC LIMIT ?2"
            ))?;
            stmt.query_map(params![sql_dt(now), limit as i64], post_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut claimed = Vec::with_capacity(due.len());
        for mut post in due {
            let changed = tx.execute(
                "UPDATE posts SET status = 'publishing', last_error = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'scheduled'",
                params![sql_dt(now), post.id.to_string()],
            )?;
            if changed == 0 {
                continue;
            }
            post.status = PostStatus::Publishing;
            post.last_error = None;
            post.updated_at = now;
            insert_publish_event_sql(&tx, &crate::events::publishing_started(&post, "scheduler", now))?;
            claimed.push(post);
        }
        tx.commit()?;
        Ok(claimed)
    }

    fn revert_post_to_scheduled(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        note: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE posts SET status = 'scheduled', last_error = ?1, updated_at = ?2 \
             WHERE id = ?3 AND tenant_id = ?4",
            params![note, sql_dt(now), post_id.to_string(), tenant_id.to_string()],
        )?;
        Ok(())
    }

    fn finalize_post(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        status: PostStatus,
        last_error: Option<&str>,
        event: &PublishEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE posts SET status = ?1, last_error = ?2, updated_at = ?3 \
             WHERE id = ?4 AND tenant_id = ?5",
            params![
                status.as_str(),
                last_error,
                sql_dt(now),
                post_id.to_string(),
                tenant_id.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "post".to_string(),
            });
        }
        insert_publish_event_sql(&tx, event)?;
        tx.commit()?;
        Ok(())
    }

    fn posts_by_status(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        statuses: &[PostStatus],
        limit: usize,
    ) -> StoreResult<Vec<Post>> {
        let conn = self.conn.lock().unwrap();
        let placeholders: Vec<String> =
            statuses.iter().map(|s| format!("'{}'", s.as_str())).collect();
        let mut stmt = conn.prepare(&format!(
            "SELECT {POST_COLUMNS} FROM posts \
             WHERE tenant_id = ?1 AND project_id = ?2 AND status IN ({}) \
             ORDER BY created_at ASC LIMIT ?3",
            placeholders.join(", ")
        ))?;
        let posts = stmt
            .query_map(
                params![tenant_id.to_string(), project_id.to_string(), limit as i64],
                post_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(posts)
    }

    fn count_posts_created_between(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM posts \
             WHERE tenant_id = ?1 AND project_id = ?2 AND created_at >= ?3 AND created_at < ?4",
            params![
                tenant_id.to_string(),
                project_id.to_string(),
                sql_dt(from),
                sql_dt(to)
            ],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn insert_channel(&self, channel: &Channel) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO channels \
             (id, tenant_id, project_id, kind, name, status, capabilities, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                channel.id.to_string(),
                channel.tenant_id.to_string(),
                channel.project_id.to_string(),
                channel.kind.as_str(),
                channel.name,
                channel.status.as_str(),
                serde_json::to_string(&channel.capabilities).unwrap_or_else(|_| "{}".into()),
                sql_dt(channel.created_at),
                sql_dt(channel.updated_at),
            ],
        )?;
        Ok(())
    }

    fn channel(&self, tenant_id: TenantId, channel_id: ChannelId) -> StoreResult<Option<Channel>> {
        let conn = self.conn.lock().unwrap();
        let channel = conn
            .query_row(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1 AND tenant_id = ?2"),
                params![channel_id.to_string(), tenant_id.to_string()],
                channel_from_row,
            )
            .optional()?;
        Ok(channel)
    }

    fn project_channels(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
    ) -> StoreResult<Vec<Channel>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels \
             WHERE tenant_id = ?1 AND project_id = ?2 ORDER BY created_at ASC"
        ))?;
        let channels = stmt
            .query_map(
                params![tenant_id.to_string(), project_id.to_string()],
                channel_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(channels)
    }

    fn active_channel_of_kind(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        kind: ChannelKind,
    ) -> StoreResult<Option<Channel>> {
        let conn = self.conn.lock().unwrap();
        let channel = conn
            .query_row(
                &format!(
                    "SELECT {CHANNEL_COLUMNS} FROM channels \
                     WHERE tenant_id = ?1 AND project_id = ?2 AND kind = ?3 AND status = 'active'"
                ),
                params![tenant_id.to_string(), project_id.to_string(), kind.as_str()],
                channel_from_row,
            )
            .optional()?;
        Ok(channel)
    }

    fn set_channel_status(
        &self,
        tenant_id: TenantId,
        channel_id: ChannelId,
        status: ChannelStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE channels SET status = ?1, updated_at = ?2 WHERE id = ?3 AND tenant_id = ?4",
            params![
                status.as_str(),
                sql_dt(now),
                channel_id.to_string(),
                tenant_id.to_string()
            ],
        )?;
        Ok(changed > 0)
    }

    fn connector_credential(
        &self,
        tenant_id: TenantId,
        connector: ChannelKind,
    ) -> StoreResult<Option<ConnectorCredential>> {
        let conn = self.conn.lock().unwrap();
        let credential = conn
            .query_row(
                "SELECT tenant_id, connector, encrypted_access_token, encrypted_refresh_token, \
                        expires_at, scopes, account_ref, status, last_error, updated_at \
                 FROM connector_credentials WHERE tenant_id = ?1 AND connector = ?2",
                params![tenant_id.to_string(), connector.as_str()],
                |row| {
                    let scopes_raw: String = row.get(5)?;
                    Ok(ConnectorCredential {
                        tenant_id: uuid_col(&row.get::<_, String>(0)?, TenantId::parse, "tenant")?,
                        connector: parse_enum(
                            &row.get::<_, String>(1)?,
                            ChannelKind::parse,
                            "connector",
                        )?,
                        encrypted_access_token: row.get(2)?,
                        encrypted_refresh_token: row.get(3)?,
                        expires_at: opt_dt(row.get(4)?)?,
                        scopes: serde_json::from_str(&scopes_raw)
                            .map_err(|e| conversion_err(format!("bad scopes column: {e}")))?,
                        account_ref: row.get(6)?,
                        status: parse_enum(
                            &row.get::<_, String>(7)?,
                            CredentialStatus::parse,
                            "credential status",
                        )?,
                        last_error: row.get(8)?,
                        updated_at: dt(row.get(9)?)?,
                    })
                },
            )
            .optional()?;
        Ok(credential)
    }

    fn upsert_connector_credential(&self, credential: &ConnectorCredential) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO connector_credentials \
             (tenant_id, connector, encrypted_access_token, encrypted_refresh_token, expires_at, \
              scopes, account_ref, status, last_error, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT (tenant_id, connector) DO UPDATE SET \
             encrypted_access_token = excluded.encrypted_access_token, \
             encrypted_refresh_token = excluded.encrypted_refresh_token, \
             expires_at = excluded.expires_at, scopes = excluded.scopes, \
             account_ref = excluded.account_ref, \
             status = excluded.status, last_error = excluded.last_error, \
             updated_at = excluded.updated_at",
            params![
                credential.tenant_id.to_string(),
                credential.connector.as_str(),
                credential.encrypted_access_token,
                credential.encrypted_refresh_token,
                opt_sql_dt(credential.expires_at),
                serde_json::to_string(&credential.scopes).unwrap_or_else(|_| "[]".into()),
                credential.account_ref,
                credential.status.as_str(),
                credential.last_error,
                sql_dt(credential.updated_at),
            ],
        )?;
        Ok(())
    }

    fn set_credential_status(
        &self,
        tenant_id: TenantId,
        connector: ChannelKind,
        status: CredentialStatus,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let truncated: Option<String> =
            last_error.map(|m| m.chars().take(512).collect());
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE connector_credentials SET status = ?1, last_error = ?2, updated_at = ?3 \
             WHERE tenant_id = ?4 AND connector = ?5",
            params![
                status.as_str(),
                truncated,
                sql_dt(now),
                tenant_id.to_string(),
                connector.as_str()
            ],
        )?;
        Ok(())
    }

    fn channel_publication(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        channel_id: ChannelId,
    ) -> StoreResult<Option<ChannelPublication>> {
        let conn = self.conn.lock().unwrap();
        let publication = conn
            .query_row(
                "SELECT id, tenant_id, post_id, channel_id, external_post_id, metadata, published_at \
                 FROM channel_publications \
                 WHERE tenant_id = ?1 AND post_id = ?2 AND channel_id = ?3",
                params![
                    tenant_id.to_string(),
                    post_id.to_string(),
                    channel_id.to_string()
                ],
                |row| {
                    Ok(ChannelPublication {
                        id: uuid_col(&row.get::<_, String>(0)?, EventId::parse, "publication")?,
                        tenant_id: uuid_col(&row.get::<_, String>(1)?, TenantId::parse, "tenant")?,
                        post_id: uuid_col(&row.get::<_, String>(2)?, PostId::parse, "post")?,
                        channel_id: uuid_col(&row.get::<_, String>(3)?, ChannelId::parse, "channel")?,
                        external_post_id: row.get(4)?,
                        metadata: json(row.get(5)?)?,
                        published_at: dt(row.get(6)?)?,
                    })
                },
            )
            .optional()?;
        Ok(publication)
    }

    fn insert_channel_publication(
        &self,
        publication: &ChannelPublication,
        event: &PublishEvent,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO channel_publications \
             (id, tenant_id, post_id, channel_id, external_post_id, metadata, published_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                publication.id.to_string(),
                publication.tenant_id.to_string(),
                publication.post_id.to_string(),
                publication.channel_id.to_string(),
                publication.external_post_id,
                sql_json(&publication.metadata),
                sql_dt(publication.published_at),
            ],
        )?;
        insert_publish_event_sql(&tx, event)?;
        tx.commit()?;
        Ok(())
    }

    fn website_publication_for_post(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
    ) -> StoreResult<Option<WebsitePublication>> {
        let conn = self.conn.lock().unwrap();
        let publication = conn
            .query_row(
                "SELECT id, tenant_id, project_id, post_id, slug, title, content, published_at \
                 FROM website_publications WHERE tenant_id = ?1 AND post_id = ?2",
                params![tenant_id.to_string(), post_id.to_string()],
                |row| {
                    Ok(WebsitePublication {
                        id: uuid_col(&row.get::<_, String>(0)?, EventId::parse, "publication")?,
                        tenant_id: uuid_col(&row.get::<_, String>(1)?, TenantId::parse, "tenant")?,
                        project_id: uuid_col(&row.get::<_, String>(2)?, ProjectId::parse, "project")?,
                        post_id: uuid_col(&row.get::<_, String>(3)?, PostId::parse, "post")?,
                        slug: row.get(4)?,
                        title: row.get(5)?,
                        content: row.get(6)?,
                        published_at: dt(row.get(7)?)?,
                    })
                },
            )
            .optional()?;
        Ok(publication)
    }

    fn insert_website_publication(
        &self,
        publication: &WebsitePublication,
        event: &PublishEvent,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO website_publications \
             (id, tenant_id, project_id, post_id, slug, title, content, published_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                publication.id.to_string(),
                publication.tenant_id.to_string(),
                publication.project_id.to_string(),
                publication.post_id.to_string(),
                publication.slug,
                publication.title,
                publication.content,
                sql_dt(publication.published_at),
            ],
        )?;
        insert_publish_event_sql(&tx, event)?;
        tx.commit()?;
        Ok(())
    }

    fn website_slug_exists(&self, tenant_id: TenantId, slug: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM website_publications WHERE tenant_id = ?1 AND slug = ?2",
                params![tenant_id.to_string(), slug],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    fn append_publish_event(&self, event: &PublishEvent) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        insert_publish_event_sql(&conn, event)?;
        Ok(())
    }

    fn publish_events_for_post(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
    ) -> StoreResult<Vec<PublishEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PUBLISH_EVENT_COLUMNS} FROM publish_events \
             WHERE tenant_id = ?1 AND post_id = ?2 ORDER BY created_at ASC"
        ))?;
        let events = stmt
            .query_map(
                params![tenant_id.to_string(), post_id.to_string()],
                publish_event_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn platform_publish_events_after(
        &self,
        after: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<PublishEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PUBLISH_EVENT_COLUMNS} FROM publish_events \
             WHERE created_at > ?1 ORDER BY created_at ASC LIMIT ?2"
        ))?;
        let events = stmt
            .query_map(params![sql_dt(after), limit as i64], publish_event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn count_channel_failures(
        &self,
        tenant_id: TenantId,
        post_id: PostId,
        channel_id: ChannelId,
    ) -> StoreResult<u32> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM publish_events \
             WHERE tenant_id = ?1 AND post_id = ?2 AND channel_id = ?3 \
               AND event_type = 'ChannelPublishFailed'",
            params![
                tenant_id.to_string(),
                post_id.to_string(),
                channel_id.to_string()
            ],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    fn recent_channel_outcomes(
        &self,
        tenant_id: TenantId,
        channel_id: ChannelId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<EventStatus>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT status FROM publish_events \
             WHERE tenant_id = ?1 AND channel_id = ?2 AND created_at >= ?3 \
               AND event_type IN ('ChannelPublishSucceeded','ChannelPublishFailed') \
             ORDER BY created_at DESC LIMIT ?4",
        )?;
        let outcomes = stmt
            .query_map(
                params![
                    tenant_id.to_string(),
                    channel_id.to_string(),
                    sql_dt(since),
                    limit as i64
                ],
                |row| parse_enum(&row.get::<_, String>(0)?, EventStatus::parse, "event status"),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(outcomes)
    }

    fn channel_attempt_events(
        &self,
        tenant_id: TenantId,
        channel_id: ChannelId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<PublishEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PUBLISH_EVENT_COLUMNS} FROM publish_events \
             WHERE tenant_id = ?1 AND channel_id = ?2 AND created_at >= ?3 \
               AND event_type IN ('ChannelPublishSucceeded','ChannelPublishFailed') \
             ORDER BY created_at DESC LIMIT ?4"
        ))?;
        let events = stmt
            .query_map(
                params![
                    tenant_id.to_string(),
                    channel_id.to_string(),
                    sql_dt(since),
                    limit as i64
                ],
                publish_event_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn publish_attempt_stats(
        &self,
        tenant_id: Option<TenantId>,
        since: DateTime<Utc>,
    ) -> StoreResult<AttemptStats> {
        let conn = self.conn.lock().unwrap();
        let (attempts, failures): (i64, i64) = match tenant_id {
            Some(tenant_id) => conn.query_row(
                "SELECT COUNT(*), \
                        COALESCE(SUM(CASE WHEN event_type = 'ChannelPublishFailed' THEN 1 ELSE 0 END), 0) \
                 FROM publish_events \
                 WHERE tenant_id = ?1 AND created_at >= ?2 \
                   AND event_type IN ('ChannelPublishSucceeded','ChannelPublishFailed')",
                params![tenant_id.to_string(), sql_dt(since)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*), \
                        COALESCE(SUM(CASE WHEN event_type = 'ChannelPublishFailed' THEN 1 ELSE 0 END), 0) \
                 FROM publish_events \
                 WHERE created_at >= ?1 \
                   AND event_type IN ('ChannelPublishSucceeded','ChannelPublishFailed')",
                params![sql_dt(since)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?,
        };
        Ok(AttemptStats {
            attempts: attempts as u64,
            failures: failures as u64,
        })
    }

    fn platform_channels_with_failures(
        &self,
        since: DateTime<Utc>,
        min_failures: u64,
    ) -> StoreResult<Vec<(TenantId, ChannelId, u64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT tenant_id, channel_id, COUNT(*) AS failures FROM publish_events \
             WHERE event_type = 'ChannelPublishFailed' AND created_at >= ?1 \
               AND channel_id IS NOT NULL \
             GROUP BY tenant_id, channel_id HAVING COUNT(*) >= ?2 \
             ORDER BY tenant_id, channel_id",
        )?;
        let rows = stmt
            .query_map(params![sql_dt(since), min_failures as i64], |row| {
                Ok((
                    uuid_col(&row.get::<_, String>(0)?, TenantId::parse, "tenant")?,
                    uuid_col(&row.get::<_, String>(1)?, ChannelId::parse, "channel")?,
                    row.get::<_, i64>(2)? as u64,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn platform_publish_duration_samples(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<f64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT metadata FROM publish_events \
             WHERE created_at >= ?1 \
               AND event_type IN ('ChannelPublishSucceeded','ChannelPublishFailed') \
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let payloads = stmt
            .query_map(params![sql_dt(since), limit as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(payloads
            .iter()
            .filter_map(|raw| {
                serde_json::from_str::<Value>(raw)
                    .ok()?
                    .get("publish_duration_ms")?
                    .as_f64()
            })
            .collect())
    }

    fn insert_automation_rule(&self, rule: &AutomationRule) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO automation_rules \
             (id, tenant_id, project_id, name, trigger_kind, trigger_config, action_kind, \
              action_config, guardrails, campaign_id, is_enabled, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                rule.id.to_string(),
                rule.tenant_id.to_string(),
                rule.project_id.to_string(),
                rule.name,
                rule.trigger.as_str(),
                sql_json(&rule.trigger_config),
                rule.action.as_str(),
                sql_json(&rule.action_config),
                serde_json::to_string(&rule.guardrails).unwrap_or_else(|_| "{}".into()),
                rule.campaign_id.map(|c| c.to_string()),
                rule.is_enabled as i64,
                sql_dt(rule.created_at),
            ],
        )?;
        Ok(())
    }

    fn automation_rule(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        rule_id: RuleId,
    ) -> StoreResult<Option<AutomationRule>> {
        let conn = self.conn.lock().unwrap();
        let rule = conn
            .query_row(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM automation_rules \
                     WHERE id = ?1 AND tenant_id = ?2 AND project_id = ?3"
                ),
                params![
                    rule_id.to_string(),
                    tenant_id.to_string(),
                    project_id.to_string()
                ],
                rule_from_row,
            )
            .optional()?;
        Ok(rule)
    }

    fn platform_enabled_rules(
        &self,
        triggers: &[TriggerKind],
    ) -> StoreResult<Vec<AutomationRule>> {
        let conn = self.conn.lock().unwrap();
        let placeholders: Vec<String> =
            triggers.iter().map(|t| format!("'{}'", t.as_str())).collect();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM automation_rules \
             WHERE is_enabled = 1 AND trigger_kind IN ({}) ORDER BY created_at ASC",
            placeholders.join(", ")
        ))?;
        let rules = stmt
            .query_map([], rule_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }

    fn latest_run_created_at(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        rule_id: RuleId,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(created_at) FROM automation_runs \
             WHERE tenant_id = ?1 AND project_id = ?2 AND rule_id = ?3",
            params![
                tenant_id.to_string(),
                project_id.to_string(),
                rule_id.to_string()
            ],
            |row| row.get(0),
        )?;
        latest.map(dt).transpose().map_err(StoreError::from)
    }

    fn create_run_if_no_recent(
        &self,
        run: &AutomationRun,
        event: &AutomationEvent,
        window: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let window_start =
            run.created_at - chrono::Duration::from_std(window).unwrap_or_default();
        let recent: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM automation_runs \
                 WHERE tenant_id = ?1 AND project_id = ?2 AND rule_id = ?3 \
                   AND created_at >= ?4 \
                   AND status IN ('queued','running','success','partial') \
                 LIMIT 1",
                params![
                    run.tenant_id.to_string(),
                    run.project_id.to_string(),
                    run.rule_id.to_string(),
                    sql_dt(window_start)
                ],
                |row| row.get(0),
            )
            .optional()?;
        if recent.is_some() {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO automation_runs \
             (id, tenant_id, project_id, rule_id, status, stats, started_at, finished_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.id.to_string(),
                run.tenant_id.to_string(),
                run.project_id.to_string(),
                run.rule_id.to_string(),
                run.status.as_str(),
                sql_json(&run.stats),
                opt_sql_dt(run.started_at),
                opt_sql_dt(run.finished_at),
                sql_dt(run.created_at),
            ],
        )?;
        insert_automation_event_sql(&tx, event)?;
        tx.commit()?;
        Ok(true)
    }

    fn automation_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> StoreResult<Option<AutomationRun>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM automation_runs WHERE id = ?1 AND tenant_id = ?2"
                ),
                params![run_id.to_string(), tenant_id.to_string()],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    fn start_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        now: DateTime<Utc>,
        event: &AutomationEvent,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE automation_runs SET status = 'running', started_at = ?1 \
             WHERE id = ?2 AND tenant_id = ?3 AND status = 'queued'",
            params![sql_dt(now), run_id.to_string(), tenant_id.to_string()],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        insert_automation_event_sql(&tx, event)?;
        tx.commit()?;
        Ok(true)
    }

    fn finish_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        status: RunStatus,
        stats: &Value,
        now: DateTime<Utc>,
        event: &AutomationEvent,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE automation_runs SET status = ?1, stats = ?2, finished_at = ?3 \
             WHERE id = ?4 AND tenant_id = ?5",
            params![
                status.as_str(),
                sql_json(stats),
                sql_dt(now),
                run_id.to_string(),
                tenant_id.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "automation_run".to_string(),
            });
        }
        insert_automation_event_sql(&tx, event)?;
        tx.commit()?;
        Ok(())
    }

    fn append_automation_event(&self, event: &AutomationEvent) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        insert_automation_event_sql(&conn, event)?;
        Ok(())
    }

    fn automation_events_for_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> StoreResult<Vec<AutomationEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, project_id, run_id, event_type, status, metadata, created_at \
             FROM automation_events WHERE tenant_id = ?1 AND run_id = ?2 ORDER BY created_at ASC",
        )?;
        let events = stmt
            .query_map(params![tenant_id.to_string(), run_id.to_string()], |row| {
                Ok(AutomationEvent {
                    id: uuid_col(&row.get::<_, String>(0)?, EventId::parse, "event")?,
                    tenant_id: uuid_col(&row.get::<_, String>(1)?, TenantId::parse, "tenant")?,
                    project_id: uuid_col(&row.get::<_, String>(2)?, ProjectId::parse, "project")?,
                    run_id: uuid_col(&row.get::<_, String>(3)?, RunId::parse, "run")?,
                    event_type: parse_enum(
                        &row.get::<_, String>(4)?,
                        AutomationEventType::parse,
                        "automation event type",
                    )?,
                    status: parse_enum(
                        &row.get::<_, String>(5)?,
                        EventStatus::parse,
                        "event status",
                    )?,
                    metadata: json(row.get(6)?)?,
                    created_at: dt(row.get(7)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn insert_content_item(
        &self,
        item: &ContentItem,
        events: &[AutomationEvent],
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO content_items \
             (id, tenant_id, project_id, campaign_id, template_id, status, title, body, metadata, source, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                item.id.to_string(),
                item.tenant_id.to_string(),
                item.project_id.to_string(),
                item.campaign_id.map(|c| c.to_string()),
                item.template_id.map(|t| t.to_string()),
                item.status.as_str(),
                item.title,
                item.body,
                sql_json(&item.metadata),
                item.source.as_str(),
                sql_dt(item.created_at),
            ],
        )?;
        for event in events {
            insert_automation_event_sql(&tx, event)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn content_items_by_status(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        statuses: &[ContentStatus],
    ) -> StoreResult<Vec<ContentItem>> {
        let conn = self.conn.lock().unwrap();
        let placeholders: Vec<String> =
            statuses.iter().map(|s| format!("'{}'", s.as_str())).collect();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTENT_ITEM_COLUMNS} FROM content_items \
             WHERE tenant_id = ?1 AND project_id = ?2 AND status IN ({}) \
             ORDER BY created_at ASC",
            placeholders.join(", ")
        ))?;
        let items = stmt
            .query_map(
                params![tenant_id.to_string(), project_id.to_string()],
                content_item_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn set_content_item_status(
        &self,
        tenant_id: TenantId,
        item_id: ContentItemId,
        status: ContentStatus,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE content_items SET status = ?1 WHERE id = ?2 AND tenant_id = ?3",
            params![status.as_str(), item_id.to_string(), tenant_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn duplicate_title_exists(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        title: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let normalized = title.trim().to_lowercase();
        let conn = self.conn.lock().unwrap();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM content_items \
                 WHERE tenant_id = ?1 AND project_id = ?2 AND created_at >= ?3 \
                   AND LOWER(TRIM(title)) = ?4 LIMIT 1",
                params![
                    tenant_id.to_string(),
                    project_id.to_string(),
                    sql_dt(since),
                    normalized
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    fn content_items_since(
        &self,
        tenant_id: TenantId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ContentItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTENT_ITEM_COLUMNS} FROM content_items \
             WHERE tenant_id = ?1 AND created_at >= ?2 ORDER BY created_at ASC"
        ))?;
        let items = stmt
            .query_map(
                params![tenant_id.to_string(), sql_dt(since)],
                content_item_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn insert_content_template(&self, template: &ContentTemplate) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO content_templates \
             (id, tenant_id, project_id, name, template_type, prompt_template, output_schema, default_values, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                template.id.to_string(),
                template.tenant_id.to_string(),
                template.project_id.to_string(),
                template.name,
                template.template_type,
                template.prompt_template,
                template.output_schema.as_ref().map(sql_json),
                sql_json(&template.default_values),
                sql_dt(template.created_at),
            ],
        )?;
        Ok(())
    }

    fn content_template(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        template_id: TemplateId,
    ) -> StoreResult<Option<ContentTemplate>> {
        let conn = self.conn.lock().unwrap();
        let template = conn
            .query_row(
                "SELECT id, tenant_id, project_id, name, template_type, prompt_template, \
                        output_schema, default_values, created_at \
                 FROM content_templates WHERE id = ?1 AND tenant_id = ?2 AND project_id = ?3",
                params![
                    template_id.to_string(),
                    tenant_id.to_string(),
                    project_id.to_string()
                ],
                |row| {
                    let output_schema: Option<String> = row.get(6)?;
                    Ok(ContentTemplate {
                        id: uuid_col(&row.get::<_, String>(0)?, TemplateId::parse, "template")?,
                        tenant_id: uuid_col(&row.get::<_, String>(1)?, TenantId::parse, "tenant")?,
                        project_id: uuid_col(&row.get::<_, String>(2)?, ProjectId::parse, "project")?,
                        name: row.get(3)?,
                        template_type: row.get(4)?,
                        prompt_template: row.get(5)?,
                        output_schema: output_schema.map(json).transpose()?,
                        default_values: json(row.get(7)?)?,
                        created_at: dt(row.get(8)?)?,
                    })
                },
            )
            .optional()?;
        Ok(template)
    }

    fn insert_campaign(&self, campaign: &Campaign) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO campaigns (id, tenant_id, project_id, name, brand_profile, language, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                campaign.id.to_string(),
                campaign.tenant_id.to_string(),
                campaign.project_id.to_string(),
                campaign.name,
                sql_json(&campaign.brand_profile),
                campaign.language,
                sql_dt(campaign.created_at),
            ],
        )?;
        Ok(())
    }

    fn campaign(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        campaign_id: CampaignId,
    ) -> StoreResult<Option<Campaign>> {
        let conn = self.conn.lock().unwrap();
        let campaign = conn
            .query_row(
                "SELECT id, tenant_id, project_id, name, brand_profile, language, created_at \
                 FROM campaigns WHERE id = ?1 AND tenant_id = ?2 AND project_id = ?3",
                params![
                    campaign_id.to_string(),
                    tenant_id.to_string(),
                    project_id.to_string()
                ],
                |row| {
                    Ok(Campaign {
                        id: uuid_col(&row.get::<_, String>(0)?, CampaignId::parse, "campaign")?,
                        tenant_id: uuid_col(&row.get::<_, String>(1)?, TenantId::parse, "tenant")?,
                        project_id: uuid_col(&row.get::<_, String>(2)?, ProjectId::parse, "project")?,
                        name: row.get(3)?,
                        brand_profile: json(row.get(4)?)?,
                        language: row.get(5)?,
                        created_at: dt(row.get(6)?)?,
                    })
                },
            )
            .optional()?;
        Ok(campaign)
    }

    fn channel_retry_policy(
        &self,
        kind: ChannelKind,
    ) -> StoreResult<Option<ChannelRetryPolicy>> {
        let conn = self.conn.lock().unwrap();
        let policy = conn
            .query_row(
                "SELECT channel_kind, max_attempts, backoff, retry_delay_seconds \
                 FROM channel_retry_policies WHERE channel_kind = ?1",
                params![kind.as_str()],
                |row| {
                    Ok(ChannelRetryPolicy {
                        channel_kind: parse_enum(
                            &row.get::<_, String>(0)?,
                            ChannelKind::parse,
                            "channel kind",
                        )?,
                        max_attempts: row.get::<_, i64>(1)? as u32,
                        backoff: parse_enum(
                            &row.get::<_, String>(2)?,
                            BackoffKind::parse,
                            "backoff kind",
                        )?,
                        retry_delay_seconds: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(policy)
    }

    fn upsert_channel_retry_policy(&self, policy: &ChannelRetryPolicy) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO channel_retry_policies (channel_kind, max_attempts, backoff, retry_delay_seconds) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (channel_kind) DO UPDATE SET max_attempts = excluded.max_attempts, \
             backoff = excluded.backoff, retry_delay_seconds = excluded.retry_delay_seconds",
            params![
                policy.channel_kind.as_str(),
                policy.max_attempts as i64,
                policy.backoff.as_str(),
                policy.retry_delay_seconds as i64,
            ],
        )?;
        Ok(())
    }

    fn platform_rate_limit(&self, kind: ChannelKind) -> StoreResult<Option<PlatformRateLimit>> {
        let conn = self.conn.lock().unwrap();
        let limit = conn
            .query_row(
                "SELECT platform, requests_per_minute FROM platform_rate_limits WHERE platform = ?1",
                params![kind.as_str()],
                |row| {
                    Ok(PlatformRateLimit {
                        platform: parse_enum(
                            &row.get::<_, String>(0)?,
                            ChannelKind::parse,
                            "platform",
                        )?,
                        requests_per_minute: row.get::<_, i64>(1)? as u32,
                    })
                },
            )
            .optional()?;
        Ok(limit)
    }

    fn upsert_platform_rate_limit(&self, limit: &PlatformRateLimit) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO platform_rate_limits (platform, requests_per_minute) VALUES (?1, ?2) \
             ON CONFLICT (platform) DO UPDATE SET requests_per_minute = excluded.requests_per_minute",
            params![limit.platform.as_str(), limit.requests_per_minute as i64],
        )?;
        Ok(())
    }

    fn list_feature_flags(&self) -> StoreResult<Vec<FeatureFlag>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT key, enabled_globally, enabled_per_tenant, description, updated_at \
             FROM feature_flags ORDER BY key ASC",
        )?;
        let flags = stmt
            .query_map([], |row| {
                let per_tenant_raw: String = row.get(2)?;
                Ok(FeatureFlag {
                    key: row.get(0)?,
                    enabled_globally: row.get::<_, i64>(1)? != 0,
                    enabled_per_tenant: serde_json::from_str(&per_tenant_raw)
                        .map_err(|e| conversion_err(format!("bad per-tenant column: {e}")))?,
                    description: row.get(3)?,
                    updated_at: dt(row.get(4)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(flags)
    }

    fn upsert_feature_flag(&self, flag: &FeatureFlag) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO feature_flags (key, enabled_globally, enabled_per_tenant, description, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (key) DO UPDATE SET enabled_globally = excluded.enabled_globally, \
             enabled_per_tenant = excluded.enabled_per_tenant, \
             description = excluded.description, updated_at = excluded.updated_at",
            params![
                flag.key,
                flag.enabled_globally as i64,
                serde_json::to_string(&flag.enabled_per_tenant).unwrap_or_else(|_| "{}".into()),
                flag.description,
                sql_dt(flag.updated_at),
            ],
        )?;
        Ok(())
    }

    fn insert_incident(&self, incident: &PlatformIncident) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO platform_incidents \
             (id, tenant_id, incident_type, severity, status, message, metadata, created_at, resolved_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                incident.id.to_string(),
                incident.tenant_id.map(|t| t.to_string()),
                incident.incident_type,
                incident.severity.as_str(),
                incident.status.as_str(),
                incident.message,
                sql_json(&incident.metadata),
                sql_dt(incident.created_at),
                opt_sql_dt(incident.resolved_at),
            ],
        )?;
        Ok(())
    }

    fn open_incidents(&self, limit: usize) -> StoreResult<Vec<PlatformIncident>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, incident_type, severity, status, message, metadata, created_at, resolved_at \
             FROM platform_incidents WHERE status = 'open' ORDER BY created_at DESC LIMIT ?1",
        )?;
        let incidents = stmt
            .query_map(params![limit as i64], |row| {
                let tenant_id: Option<String> = row.get(1)?;
                Ok(PlatformIncident {
                    id: uuid_col(&row.get::<_, String>(0)?, IncidentId::parse, "incident")?,
                    tenant_id: tenant_id
                        .map(|t| uuid_col(&t, TenantId::parse, "tenant"))
                        .transpose()?,
                    incident_type: row.get(2)?,
                    severity: parse_enum(
                        &row.get::<_, String>(3)?,
                        IncidentSeverity::parse,
                        "severity",
                    )?,
                    status: parse_enum(
                        &row.get::<_, String>(4)?,
                        IncidentStatus::parse,
                        "incident status",
                    )?,
                    message: row.get(5)?,
                    metadata: json(row.get(6)?)?,
                    created_at: dt(row.get(7)?)?,
                    resolved_at: opt_dt(row.get(8)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(incidents)
    }

    fn resolve_incident(
        &self,
        incident_id: IncidentId,
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE platform_incidents SET status = 'resolved', resolved_at = ?1, \
             metadata = json_set(metadata, '$.resolved_by', ?2) WHERE id = ?3",
            params![sql_dt(now), resolved_by, incident_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn upsert_tenant_risk(&self, score: &TenantRiskScore) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tenant_risk_scores \
             (tenant_id, risk_score, publish_failure_ratio, flagged_content_ratio, abuse_rate, \
              rate_limit_violations, level, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT (tenant_id) DO UPDATE SET risk_score = excluded.risk_score, \
             publish_failure_ratio = excluded.publish_failure_ratio, \
             flagged_content_ratio = excluded.flagged_content_ratio, \
             abuse_rate = excluded.abuse_rate, \
             rate_limit_violations = excluded.rate_limit_violations, \
             level = excluded.level, updated_at = excluded.updated_at",
            params![
                score.tenant_id.to_string(),
                score.risk_score as i64,
                score.publish_failure_ratio,
                score.flagged_content_ratio,
                score.abuse_rate,
                score.rate_limit_violations as i64,
                score.level.as_str(),
                sql_dt(score.updated_at),
            ],
        )?;
        Ok(())
    }

    fn tenant_risk(&self, tenant_id: TenantId) -> StoreResult<Option<TenantRiskScore>> {
        let conn = self.conn.lock().unwrap();
        let score = conn
            .query_row(
                "SELECT tenant_id, risk_score, publish_failure_ratio, flagged_content_ratio, \
                        abuse_rate, rate_limit_violations, level, updated_at \
                 FROM tenant_risk_scores WHERE tenant_id = ?1",
                params![tenant_id.to_string()],
                |row| {
                    Ok(TenantRiskScore {
                        tenant_id: uuid_col(&row.get::<_, String>(0)?, TenantId::parse, "tenant")?,
                        risk_score: row.get::<_, i64>(1)? as u32,
                        publish_failure_ratio: row.get(2)?,
                        flagged_content_ratio: row.get(3)?,
                        abuse_rate: row.get(4)?,
                        rate_limit_violations: row.get::<_, i64>(5)? as u64,
                        level: parse_enum(&row.get::<_, String>(6)?, RiskLevel::parse, "risk level")?,
                        updated_at: dt(row.get(7)?)?,
                    })
                },
            )
            .optional()?;
        Ok(score)
    }

    fn company_subscription(
        &self,
        tenant_id: TenantId,
    ) -> StoreResult<Option<CompanySubscription>> {
        let conn = self.conn.lock().unwrap();
        let subscription = conn
            .query_row(
                "SELECT tenant_id, plan, max_posts_per_month, status, grace_period_ends_at, updated_at \
                 FROM company_subscriptions WHERE tenant_id = ?1",
                params![tenant_id.to_string()],
                |row| {
                    Ok(CompanySubscription {
                        tenant_id: uuid_col(&row.get::<_, String>(0)?, TenantId::parse, "tenant")?,
                        plan: row.get(1)?,
                        max_posts_per_month: row.get::<_, i64>(2)? as u64,
                        status: row.get(3)?,
                        grace_period_ends_at: opt_dt(row.get(4)?)?,
                        updated_at: dt(row.get(5)?)?,
                    })
                },
            )
            .optional()?;
        Ok(subscription)
    }

    fn upsert_company_subscription(&self, subscription: &CompanySubscription) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO company_subscriptions \
             (tenant_id, plan, max_posts_per_month, status, grace_period_ends_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (tenant_id) DO UPDATE SET plan = excluded.plan, \
             max_posts_per_month = excluded.max_posts_per_month, status = excluded.status, \
             grace_period_ends_at = excluded.grace_period_ends_at, updated_at = excluded.updated_at",
            params![
                subscription.tenant_id.to_string(),
                subscription.plan,
                subscription.max_posts_per_month as i64,
                subscription.status,
                opt_sql_dt(subscription.grace_period_ends_at),
                sql_dt(subscription.updated_at),
            ],
        )?;
        Ok(())
    }

    fn company_usage(&self, tenant_id: TenantId) -> StoreResult<Option<CompanyUsage>> {
        let conn = self.conn.lock().unwrap();
        let usage = conn
            .query_row(
                "SELECT tenant_id, posts_used_current_period, period_started_at \
                 FROM company_usages WHERE tenant_id = ?1",
                params![tenant_id.to_string()],
                |row| {
                    Ok(CompanyUsage {
                        tenant_id: uuid_col(&row.get::<_, String>(0)?, TenantId::parse, "tenant")?,
                        posts_used_current_period: row.get::<_, i64>(1)? as u64,
                        period_started_at: dt(row.get(2)?)?,
                    })
                },
            )
            .optional()?;
        Ok(usage)
    }

    fn upsert_company_usage(&self, usage: &CompanyUsage) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO company_usages (tenant_id, posts_used_current_period, period_started_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (tenant_id) DO UPDATE SET \
             posts_used_current_period = excluded.posts_used_current_period, \
             period_started_at = excluded.period_started_at",
            params![
                usage.tenant_id.to_string(),
                usage.posts_used_current_period as i64,
                sql_dt(usage.period_started_at),
            ],
        )?;
        Ok(())
    }

    fn increment_posts_used(&self, tenant_id: TenantId, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO company_usages (tenant_id, posts_used_current_period, period_started_at) \
             VALUES (?1, 1, ?2) \
             ON CONFLICT (tenant_id) DO UPDATE SET \
             posts_used_current_period = posts_used_current_period + 1",
            params![tenant_id.to_string(), sql_dt(now)],
        )?;
        let used: i64 = tx.query_row(
            "SELECT posts_used_current_period FROM company_usages WHERE tenant_id = ?1",
            params![tenant_id.to_string()],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(used as u64)
    }

    fn platform_reset_usage(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE company_usages SET posts_used_current_period = 0, period_started_at = ?1",
            params![sql_dt(now)],
        )?;
        Ok(changed as u64)
    }

    fn insert_failed_job(&self, job: &FailedJob) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO failed_jobs (id, tenant_id, queue, payload, error, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id.to_string(),
                job.tenant_id.map(|t| t.to_string()),
                job.queue,
                sql_json(&job.payload),
                job.error,
                sql_dt(job.created_at),
            ],
        )?;
        Ok(())
    }

    fn failed_jobs(&self, limit: usize) -> StoreResult<Vec<FailedJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, queue, payload, error, created_at \
             FROM failed_jobs ORDER BY created_at DESC LIMIT ?1",
        )?;
        let jobs = stmt
            .query_map(params![limit as i64], |row| {
                let tenant_id: Option<String> = row.get(1)?;
                Ok(FailedJob {
                    id: uuid_col(&row.get::<_, String>(0)?, EventId::parse, "failed job")?,
                    tenant_id: tenant_id
                        .map(|t| uuid_col(&t, TenantId::parse, "tenant"))
                        .transpose()?,
                    queue: row.get(2)?,
                    payload: json(row.get(3)?)?,
                    error: row.get(4)?,
                    created_at: dt(row.get(5)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn quality_policy(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
    ) -> StoreResult<Option<AiQualityPolicy>> {
        let conn = self.conn.lock().unwrap();
        let policy = conn
            .query_row(
                "SELECT tenant_id, project_id, policy, created_at FROM ai_quality_policies \
                 WHERE tenant_id = ?1 AND project_id = ?2",
                params![tenant_id.to_string(), project_id.to_string()],
                |row| {
                    Ok(AiQualityPolicy {
                        tenant_id: uuid_col(&row.get::<_, String>(0)?, TenantId::parse, "tenant")?,
                        project_id: uuid_col(&row.get::<_, String>(1)?, ProjectId::parse, "project")?,
                        policy: json(row.get(2)?)?,
                        created_at: dt(row.get(3)?)?,
                    })
                },
            )
            .optional()?;
        Ok(policy)
    }

    fn upsert_quality_policy(&self, policy: &AiQualityPolicy) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ai_quality_policies (tenant_id, project_id, policy, created_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (tenant_id, project_id) DO UPDATE SET policy = excluded.policy",
            params![
                policy.tenant_id.to_string(),
                policy.project_id.to_string(),
                sql_json(&policy.policy),
                sql_dt(policy.created_at),
            ],
        )?;
        Ok(())
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_log (id, tenant_id, action, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id.to_string(),
                entry.tenant_id.map(|t| t.to_string()),
                entry.action,
                sql_json(&entry.metadata),
                sql_dt(entry.created_at),
            ],
        )?;
        Ok(())
    }

    fn audit_entries(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> StoreResult<Vec<AuditLogEntry>> {
        let conn = self.conn.lock().unwrap();
        let map_row = |row: &Row<'_>| -> rusqlite::Result<AuditLogEntry> {
            let tenant_id: Option<String> = row.get(1)?;
            Ok(AuditLogEntry {
                id: uuid_col(&row.get::<_, String>(0)?, EventId::parse, "audit entry")?,
                tenant_id: tenant_id
                    .map(|t| uuid_col(&t, TenantId::parse, "tenant"))
                    .transpose()?,
                action: row.get(2)?,
                metadata: json(row.get(3)?)?,
                created_at: dt(row.get(4)?)?,
            })
        };
        let entries = match tenant_id {
            Some(tenant_id) => {
                let mut stmt = conn.prepare(
                    "SELECT id, tenant_id, action, metadata, created_at FROM audit_log \
                     WHERE tenant_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![tenant_id.to_string(), limit as i64], map_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, tenant_id, action, metadata, created_at FROM audit_log \
                     ORDER BY created_at DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit as i64], map_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(entries)
    }

    fn insert_stripe_event(&self, event: &StripeEvent) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO stripe_events (event_id, event_type, processed_at) VALUES (?1, ?2, ?3)",
            params![event.event_id, event.event_type, sql_dt(event.processed_at)],
        )?;
        Ok(())
    }

    fn upsert_system_health(&self, component: &SystemHealthComponent) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO system_health (component, status, latency_ms, error_rate, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (component) DO UPDATE SET status = excluded.status, \
             latency_ms = excluded.latency_ms, error_rate = excluded.error_rate, \
             updated_at = excluded.updated_at",
            params![
                component.component,
                component.status,
                component.latency_ms,
                component.error_rate,
                sql_dt(component.updated_at),
            ],
        )?;
        Ok(())
    }

    fn system_health_components(&self) -> StoreResult<Vec<SystemHealthComponent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT component, status, latency_ms, error_rate, updated_at \
             FROM system_health ORDER BY component ASC",
        )?;
        let components = stmt
            .query_map([], |row| {
                Ok(SystemHealthComponent {
                    component: row.get(0)?,
                    status: row.get(1)?,
                    latency_ms: row.get(2)?,
                    error_rate: row.get(3)?,
                    updated_at: dt(row.get(4)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(components)
    }

    fn insert_performance_baseline(&self, baseline: &PerformanceBaseline) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO performance_baselines \
             (id, component, metric_name, avg_value, p95_value, sample_size, regression_detected, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                baseline.id.to_string(),
                baseline.component,
                baseline.metric_name,
                baseline.avg_value,
                baseline.p95_value,
                baseline.sample_size as i64,
                baseline.regression_detected as i64,
                sql_dt(baseline.recorded_at),
            ],
        )?;
        Ok(())
    }

    fn recent_baselines(
        &self,
        component: &str,
        metric_name: &str,
        limit: usize,
    ) -> StoreResult<Vec<PerformanceBaseline>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, component, metric_name, avg_value, p95_value, sample_size, \
                    regression_detected, recorded_at \
             FROM performance_baselines WHERE component = ?1 AND metric_name = ?2 \
             ORDER BY recorded_at DESC LIMIT ?3",
        )?;
        let baselines = stmt
            .query_map(params![component, metric_name, limit as i64], |row| {
                Ok(PerformanceBaseline {
                    id: uuid_col(&row.get::<_, String>(0)?, EventId::parse, "baseline")?,
                    component: row.get(1)?,
                    metric_name: row.get(2)?,
                    avg_value: row.get(3)?,
                    p95_value: row.get(4)?,
                    sample_size: row.get::<_, i64>(5)? as usize,
                    regression_detected: row.get::<_, i64>(6)? != 0,
                    recorded_at: dt(row.get(7)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(baselines)
    }

    fn ping(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    fn seeded() -> (SqliteStore, Post) {
        let store = SqliteStore::open_in_memory().unwrap();
        let tenant = Tenant {
            id: TenantId::new(),
            name: "Acme".into(),
            created_at: now(),
        };
        let project = Project {
            id: ProjectId::new(),
            tenant_id: tenant.id,
            name: "Main".into(),
            created_at: now(),
        };
        store.insert_tenant(&tenant).unwrap();
        store.insert_project(&project).unwrap();
        let post = Post::new(tenant.id, project.id, "Hello", "Body", now()).scheduled_at(now());
        store.insert_post(&post).unwrap();
        (store, post)
    }

    #[test]
    fn test_open_creates_schema_and_roundtrips_post() {
        let (store, post) = seeded();
        let loaded = store.post(post.tenant_id, post.id).unwrap().unwrap();
        assert_eq!(loaded.title, "Hello");
        assert_eq!(loaded.status, PostStatus::Scheduled);
        assert_eq!(loaded.publish_at, post.publish_at);
    }

    #[test]
    fn test_tenant_scoping_enforced_in_sql() {
        let (store, post) = seeded();
        assert!(store.post(TenantId::new(), post.id).unwrap().is_none());
    }

    #[test]
    fn test_claim_due_posts_cas() {
        let (store, post) = seeded();
        let claimed = store.platform_claim_due_posts(now(), 50).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, PostStatus::Publishing);
        assert!(store.platform_claim_due_posts(now(), 50).unwrap().is_empty());

        let events = store.publish_events_for_post(post.tenant_id, post.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, PublishEventType::PostPublishingStarted);
    }

    #[test]
    fn test_channel_publication_conflict_maps_to_store_conflict() {
        let (store, post) = seeded();
        let channel = Channel::new(
            post.tenant_id,
            post.project_id,
            ChannelKind::LinkedIn,
            "LinkedIn",
            ChannelCapabilities::text_only(3000),
            now(),
        );
        store.insert_channel(&channel).unwrap();

        let publication = ChannelPublication {
            id: EventId::new(),
            tenant_id: post.tenant_id,
            post_id: post.id,
            channel_id: channel.id,
            external_post_id: "urn:li:share:42".into(),
            metadata: json!({}),
            published_at: now(),
        };
        let event = events::channel_succeeded(&post, channel.id, 1, json!({}), now());
        store.insert_channel_publication(&publication, &event).unwrap();

        let mut replay = publication.clone();
        replay.id = EventId::new();
        assert!(matches!(
            store.insert_channel_publication(&replay, &event),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[test]
    fn test_website_slug_uniqueness() {
        let (store, post) = seeded();
        let publication = WebsitePublication {
            id: EventId::new(),
            tenant_id: post.tenant_id,
            project_id: post.project_id,
            post_id: post.id,
            slug: "hello-abc123".into(),
            title: post.title.clone(),
            content: post.content.clone(),
            published_at: now(),
        };
        let event = events::channel_succeeded(&post, ChannelId::new(), 1, json!({}), now());
        store.insert_website_publication(&publication, &event).unwrap();
        assert!(store.website_slug_exists(post.tenant_id, "hello-abc123").unwrap());
        assert!(!store.website_slug_exists(TenantId::new(), "hello-abc123").unwrap());
    }

    #[test]
    fn test_run_lifecycle_and_anti_stampede() {
        let (store, post) = seeded();
        let rule_id = RuleId::new();
        let run = AutomationRun {
            id: RunId::new(),
            tenant_id: post.tenant_id,
            project_id: post.project_id,
            rule_id,
            status: RunStatus::Queued,
            stats: json!({}),
            started_at: None,
            finished_at: None,
            created_at: now(),
        };
        let queued = events::run_queued(&run, rule_id, "time_trigger", json!({}), now());
        assert!(store
            .create_run_if_no_recent(&run, &queued, Duration::from_secs(300))
            .unwrap());

        let mut dup = run.clone();
        dup.id = RunId::new();
        dup.created_at = now() + chrono::Duration::seconds(30);
        assert!(!store
            .create_run_if_no_recent(&dup, &queued, Duration::from_secs(300))
            .unwrap());

        let started = events::run_started(&run, rule_id, "generate_post", now());
        assert!(store.start_run(run.tenant_id, run.id, now(), &started).unwrap());
        assert!(!store.start_run(run.tenant_id, run.id, now(), &started).unwrap());

        let completed = events::run_completed(&run, RunStatus::Success, json!({"x": 1}), now());
        store
            .finish_run(run.tenant_id, run.id, RunStatus::Success, &json!({"x": 1}), now(), &completed)
            .unwrap();
        let reloaded = store.automation_run(run.tenant_id, run.id).unwrap().unwrap();
        assert_eq!(reloaded.status, RunStatus::Success);
        assert_eq!(reloaded.stats["x"], 1);

        let trail = store.automation_events_for_run(run.tenant_id, run.id).unwrap();
        assert_eq!(trail.len(), 3);
    }

    #[test]
    fn test_feature_flag_upsert_roundtrip() {
        let (store, post) = seeded();
        let mut flag = FeatureFlag {
            key: "enable_global_publish_circuit_breaker".into(),
            enabled_globally: false,
            enabled_per_tenant: Default::default(),
            description: "Global publish pause during incidents".into(),
            updated_at: now(),
        };
        flag.enabled_per_tenant.insert(post.tenant_id.to_string(), true);
        store.upsert_feature_flag(&flag).unwrap();

        let flags = store.list_feature_flags().unwrap();
        assert_eq!(flags.len(), 1);
        assert!(flags[0].effective_for(Some(post.tenant_id)));
        assert!(!flags[0].effective_for(None));
    }

    #[test]
    fn test_usage_increment_upsert() {
        let (store, post) = seeded();
        assert_eq!(store.increment_posts_used(post.tenant_id, now()).unwrap(), 1);
        assert_eq!(store.increment_posts_used(post.tenant_id, now()).unwrap(), 2);
        assert_eq!(store.platform_reset_usage(now()).unwrap(), 1);
    }

    #[test]
    fn test_stripe_event_unique() {
        let (store, _) = seeded();
        let event = StripeEvent {
            event_id: "evt_42".into(),
            event_type: "checkout.session.completed".into(),
            processed_at: now(),
        };
        store.insert_stripe_event(&event).unwrap();
        assert!(matches!(
            store.insert_stripe_event(&event),
            Err(StoreError::Conflict { .. })
        ));
    }
}
