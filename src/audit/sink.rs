use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{PgPool, QueryBuilder};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;

use super::{AuditAction, AuditEvent, AuditOutcome, RATE_LIMIT_SUBJECT_PREFIX};

/// key: audit-filter
/// Filter envelope applied to audit queries from the compliance reporter and admin API.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuditFilter {
    pub subject_prefix: Option<String>,
    pub action: Option<AuditAction>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl AuditFilter {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Self::default()
        }
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(prefix) = &self.subject_prefix {
            if !event.subject.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(action) = self.action {
            if event.action != action {
                return false;
            }
        }
        if let Some(start) = self.start {
            if event.occurred_at < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if event.occurred_at >= end {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectCount {
    pub action: AuditAction,
    pub subject: String,
    pub count: u64,
    pub last_at: DateTime<Utc>,
}

/// Grouped counts over `[start, end)`. Rate-limit subjects are one per client, so they
/// are only counted per action plus the `top_n` most denied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditAggregate {
    /// Per (action, subject) counts for everything outside the rate-limit namespace.
    pub by_subject: Vec<SubjectCount>,
    pub rate_limit_actions: Vec<(AuditAction, u64)>,
    /// Highest first, ties by subject.
    pub top_denied: Vec<(String, u64)>,
}

impl AuditAggregate {
    pub fn total_events(&self) -> u64 {
        let keyed: u64 = self.by_subject.iter().map(|group| group.count).sum();
        let limited: u64 = self.rate_limit_actions.iter().map(|(_, count)| count).sum();
        keyed + limited
    }
}

fn is_denial(action: AuditAction) -> bool {
    matches!(
        action,
        AuditAction::RateLimitDenied | AuditAction::RateLimitStoreUnavailable
    )
}

/// key: audit-sink
/// Append-only event sink. No update or delete path exists on any implementation.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> Result<(), StoreError>;

    /// Events matching `filter`, oldest first.
    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, StoreError>;

    async fn aggregate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        top_n: usize,
    ) -> Result<AuditAggregate, StoreError>;
}

#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_events(event_id, occurred_at, subject, action, outcome, detail) VALUES($1,$2,$3,$4,$5,$6)",
        )
        .bind(event.event_id)
        .bind(event.occurred_at)
        .bind(&event.subject)
        .bind(event.action.as_str())
        .bind(event.outcome.as_str())
        .bind(&event.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, StoreError> {
        let mut builder = QueryBuilder::new(
            "SELECT event_id, occurred_at, subject, action, outcome, detail FROM audit_events WHERE TRUE",
        );

        if let Some(prefix) = &filter.subject_prefix {
            builder.push(" AND starts_with(subject, ");
            builder.push_bind(prefix.clone());
            builder.push(")");
        }

        if let Some(action) = filter.action {
            builder.push(" AND action = ");
            builder.push_bind(action.as_str());
        }

        if let Some(start) = filter.start {
            builder.push(" AND occurred_at >= ");
            builder.push_bind(start);
        }

        if let Some(end) = filter.end {
            builder.push(" AND occurred_at < ");
            builder.push_bind(end);
        }

        builder.push(" ORDER BY occurred_at ASC");

        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }

        let rows = builder
            .build_query_as::<AuditEventRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(AuditEvent::try_from).collect()
    }

    async fn aggregate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        top_n: usize,
    ) -> Result<AuditAggregate, StoreError> {
        let grouped: Vec<(String, String, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT action, subject, COUNT(*), MAX(occurred_at) FROM audit_events \
             WHERE occurred_at >= $1 AND occurred_at < $2 AND NOT starts_with(subject, $3) \
             GROUP BY action, subject",
        )
        .bind(start)
        .bind(end)
        .bind(RATE_LIMIT_SUBJECT_PREFIX)
        .fetch_all(&self.pool)
        .await?;

        let limited: Vec<(String, i64)> = sqlx::query_as(
            "SELECT action, COUNT(*) FROM audit_events \
             WHERE occurred_at >= $1 AND occurred_at < $2 AND starts_with(subject, $3) \
             GROUP BY action",
        )
        .bind(start)
        .bind(end)
        .bind(RATE_LIMIT_SUBJECT_PREFIX)
        .fetch_all(&self.pool)
        .await?;

        let top_denied: Vec<(String, i64)> = sqlx::query_as(
            "SELECT subject, COUNT(*) AS denials FROM audit_events \
             WHERE occurred_at >= $1 AND occurred_at < $2 AND starts_with(subject, $3) \
             AND action IN ($4, $5) \
             GROUP BY subject ORDER BY denials DESC, subject ASC LIMIT $6",
        )
        .bind(start)
        .bind(end)
        .bind(RATE_LIMIT_SUBJECT_PREFIX)
        .bind(AuditAction::RateLimitDenied.as_str())
        .bind(AuditAction::RateLimitStoreUnavailable.as_str())
        .bind(top_n as i64)
        .fetch_all(&self.pool)
        .await?;

        let by_subject = grouped
            .into_iter()
            .map(|(action, subject, count, last_at)| {
                Ok(SubjectCount {
                    action: parse_action(&action)?,
                    subject,
                    count: count as u64,
                    last_at,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        let rate_limit_actions = limited
            .into_iter()
            .map(|(action, count)| Ok((parse_action(&action)?, count as u64)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(AuditAggregate {
            by_subject,
            rate_limit_actions,
            top_denied: top_denied
                .into_iter()
                .map(|(subject, count)| (subject, count as u64))
                .collect(),
        })
    }
}

fn parse_action(value: &str) -> Result<AuditAction, StoreError> {
    AuditAction::from_str(value)
        .ok_or_else(|| StoreError::Rejected(format!("unknown audit action: {value}")))
}

#[derive(sqlx::FromRow)]
struct AuditEventRow {
    event_id: Uuid,
    occurred_at: DateTime<Utc>,
    subject: String,
    action: String,
    outcome: String,
    detail: serde_json::Value,
}

impl TryFrom<AuditEventRow> for AuditEvent {
    type Error = StoreError;

    fn try_from(row: AuditEventRow) -> Result<Self, Self::Error> {
        let action = parse_action(&row.action)?;
        Ok(AuditEvent {
            event_id: row.event_id,
            occurred_at: row.occurred_at,
            subject: row.subject,
            action,
            outcome: AuditOutcome::from_str(&row.outcome),
            detail: row.detail,
        })
    }
}

/// In-process sink for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn count(&self, action: AuditAction) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|event| event.action == action)
            .count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, StoreError> {
        let events = self.events.read().await;
        let mut matched: Vec<AuditEvent> = events
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        matched.sort_by_key(|event| event.occurred_at);
        if let Some(limit) = filter.limit {
            matched.truncate(limit.max(0) as usize);
        }
        Ok(matched)
    }

    async fn aggregate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        top_n: usize,
    ) -> Result<AuditAggregate, StoreError> {
        let events = self.events.read().await;
        let mut grouped: HashMap<(AuditAction, &str), (u64, DateTime<Utc>)> = HashMap::new();
        let mut limited: HashMap<AuditAction, u64> = HashMap::new();
        let mut denied: HashMap<&str, u64> = HashMap::new();

        for event in events
            .iter()
            .filter(|event| event.occurred_at >= start && event.occurred_at < end)
        {
            if event.subject.starts_with(RATE_LIMIT_SUBJECT_PREFIX) {
                *limited.entry(event.action).or_default() += 1;
                if is_denial(event.action) {
                    *denied.entry(event.subject.as_str()).or_default() += 1;
                }
                continue;
            }
            let group = grouped
                .entry((event.action, event.subject.as_str()))
                .or_insert((0, event.occurred_at));
            group.0 += 1;
            group.1 = group.1.max(event.occurred_at);
        }

        let mut top_denied: Vec<(String, u64)> = denied
            .into_iter()
            .map(|(subject, count)| (subject.to_string(), count))
            .collect();
        top_denied.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_denied.truncate(top_n);

        Ok(AuditAggregate {
            by_subject: grouped
                .into_iter()
                .map(|((action, subject), (count, last_at))| SubjectCount {
                    action,
                    subject: subject.to_string(),
                    count,
                    last_at,
                })
                .collect(),
            rate_limit_actions: limited.into_iter().collect(),
            top_denied,
        })
    }
}
