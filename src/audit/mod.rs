//! Append-only audit trail for rate-limit denials and key rotation lifecycle transitions.

pub mod buffer;
pub mod report;
pub mod sink;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::keys::models::KeyType;

pub use report::{ComplianceReport, ReportPeriod};
pub use buffer::BufferedAuditSink;
pub use sink::{
    AuditAggregate, AuditFilter, AuditSink, MemoryAuditSink, PgAuditSink, SubjectCount,
};

/// key: audit-event
/// Immutable once written. Sinks only ever append.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub subject: String,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub detail: Value,
}

impl AuditEvent {
    pub fn new(
        subject: impl Into<String>,
        action: AuditAction,
        outcome: AuditOutcome,
        detail: Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at,
            subject: subject.into(),
            action,
            outcome,
            detail,
        }
    }

    pub fn key_type(&self) -> Option<KeyType> {
        self.subject
            .strip_prefix(KEY_SUBJECT_PREFIX)
            .and_then(KeyType::from_str)
    }
}

pub const KEY_SUBJECT_PREFIX: &str = "key:";
pub const RATE_LIMIT_SUBJECT_PREFIX: &str = "ratelimit:";
pub const SCHEDULER_SUBJECT: &str = "scheduler";

pub fn key_subject(key_type: KeyType) -> String {
    format!("{KEY_SUBJECT_PREFIX}{}", key_type.as_str())
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RateLimitDenied,
    RateLimitStoreUnavailable,
    KeyGenerated,
    KeyActivated,
    KeyGraceStarted,
    KeyRetired,
    RotationQueued,
    RotationCompleted,
    RotationFailed,
    RotationEscalated,
    MigrationCompleted,
    MigrationFailed,
    MigrationCancelled,
    MigrationAbandoned,
    SchedulerPaused,
    SchedulerResumed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::RateLimitDenied => "rate_limit_denied",
            AuditAction::RateLimitStoreUnavailable => "rate_limit_store_unavailable",
            AuditAction::KeyGenerated => "key_generated",
            AuditAction::KeyActivated => "key_activated",
            AuditAction::KeyGraceStarted => "key_grace_started",
            AuditAction::KeyRetired => "key_retired",
            AuditAction::RotationQueued => "rotation_queued",
            AuditAction::RotationCompleted => "rotation_completed",
            AuditAction::RotationFailed => "rotation_failed",
            AuditAction::RotationEscalated => "rotation_escalated",
            AuditAction::MigrationCompleted => "migration_completed",
            AuditAction::MigrationFailed => "migration_failed",
            AuditAction::MigrationCancelled => "migration_cancelled",
            AuditAction::MigrationAbandoned => "migration_abandoned",
            AuditAction::SchedulerPaused => "scheduler_paused",
            AuditAction::SchedulerResumed => "scheduler_resumed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "rate_limit_denied" => Some(Self::RateLimitDenied),
            "rate_limit_store_unavailable" => Some(Self::RateLimitStoreUnavailable),
            "key_generated" => Some(Self::KeyGenerated),
            "key_activated" => Some(Self::KeyActivated),
            "key_grace_started" => Some(Self::KeyGraceStarted),
            "key_retired" => Some(Self::KeyRetired),
            "rotation_queued" => Some(Self::RotationQueued),
            "rotation_completed" => Some(Self::RotationCompleted),
            "rotation_failed" => Some(Self::RotationFailed),
            "rotation_escalated" => Some(Self::RotationEscalated),
            "migration_completed" => Some(Self::MigrationCompleted),
            "migration_failed" => Some(Self::MigrationFailed),
            "migration_cancelled" => Some(Self::MigrationCancelled),
            "migration_abandoned" => Some(Self::MigrationAbandoned),
            "scheduler_paused" => Some(Self::SchedulerPaused),
            "scheduler_resumed" => Some(Self::SchedulerResumed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Failure => "failure",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "success" => AuditOutcome::Success,
            "denied" => AuditOutcome::Denied,
            _ => AuditOutcome::Failure,
        }
    }
}

/// Appends `event`, logging instead of failing when the sink is down.
/// Used on hot paths where the audited decision must still be returned.
pub async fn record_best_effort(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(err) = sink.append(&event).await {
        tracing::warn!(
            ?err,
            action = event.action.as_str(),
            subject = %event.subject,
            "failed to append audit event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_subject_resolves_key_type() {
        let event = AuditEvent::new(
            key_subject(KeyType::JwtSigning),
            AuditAction::KeyActivated,
            AuditOutcome::Success,
            json!({}),
            Utc::now(),
        );
        assert_eq!(event.key_type(), Some(KeyType::JwtSigning));
    }

    #[test]
    fn action_strings_round_trip() {
        for action in [
            AuditAction::RateLimitDenied,
            AuditAction::KeyGraceStarted,
            AuditAction::RotationEscalated,
            AuditAction::MigrationAbandoned,
        ] {
            assert_eq!(AuditAction::from_str(action.as_str()), Some(action));
        }
    }
}
