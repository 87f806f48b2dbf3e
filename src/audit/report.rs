use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::keys::models::KeyType;

use super::{AuditAction, AuditAggregate, AuditSink, KEY_SUBJECT_PREFIX};

const TOP_SUBJECTS: usize = 10;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportPeriod {
    Daily,
    Weekly,
}

impl ReportPeriod {
    pub fn duration(&self) -> Duration {
        match self {
            ReportPeriod::Daily => Duration::days(1),
            ReportPeriod::Weekly => Duration::weeks(1),
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(ReportPeriod::Daily),
            "weekly" => Some(ReportPeriod::Weekly),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct RateLimitSummary {
    pub denials: u64,
    pub store_unavailable_denials: u64,
    /// Most-denied scopes, highest first.
    pub top_subjects: Vec<(String, u64)>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct KeyRotationSummary {
    pub rotations_completed: u64,
    pub rotations_failed: u64,
    pub rotations_escalated: u64,
    pub keys_activated: u64,
    pub keys_retired: u64,
    pub migrations_completed: u64,
    pub migrations_failed: u64,
    pub migrations_abandoned: u64,
    pub last_rotated_at: Option<DateTime<Utc>>,
}

/// key: compliance-report
/// Aggregate view of one reporting period, built from the audit trail only.
#[derive(Clone, Debug, Serialize)]
pub struct ComplianceReport {
    pub period: ReportPeriod,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub total_events: u64,
    pub actions: BTreeMap<String, u64>,
    pub rate_limit: RateLimitSummary,
    pub key_rotation: BTreeMap<KeyType, KeyRotationSummary>,
    pub findings: Vec<String>,
}

/// Builds the report for the period ending at `period_end` from grouped counts, so the
/// cost follows the number of distinct subjects rather than the number of events.
pub async fn generate(
    sink: &dyn AuditSink,
    period: ReportPeriod,
    period_end: DateTime<Utc>,
) -> Result<ComplianceReport, StoreError> {
    let period_start = period_end - period.duration();
    let aggregate = sink
        .aggregate(period_start, period_end, TOP_SUBJECTS)
        .await?;
    Ok(summarize(period, period_start, period_end, &aggregate))
}

pub fn summarize(
    period: ReportPeriod,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    aggregate: &AuditAggregate,
) -> ComplianceReport {
    let mut actions: BTreeMap<String, u64> = BTreeMap::new();
    let mut rate_limit = RateLimitSummary {
        top_subjects: aggregate.top_denied.clone(),
        ..RateLimitSummary::default()
    };
    let mut key_rotation: BTreeMap<KeyType, KeyRotationSummary> = BTreeMap::new();

    for (action, count) in &aggregate.rate_limit_actions {
        *actions.entry(action.as_str().to_string()).or_default() += count;
        match action {
            AuditAction::RateLimitDenied => rate_limit.denials += count,
            AuditAction::RateLimitStoreUnavailable => {
                rate_limit.denials += count;
                rate_limit.store_unavailable_denials += count;
            }
            _ => {}
        }
    }

    for group in &aggregate.by_subject {
        *actions.entry(group.action.as_str().to_string()).or_default() += group.count;

        let Some(key_type) = group
            .subject
            .strip_prefix(KEY_SUBJECT_PREFIX)
            .and_then(KeyType::from_str)
        else {
            continue;
        };
        let summary = key_rotation.entry(key_type).or_default();
        match group.action {
            AuditAction::RotationCompleted => {
                summary.rotations_completed += group.count;
                summary.last_rotated_at = Some(
                    summary
                        .last_rotated_at
                        .map_or(group.last_at, |at| at.max(group.last_at)),
                );
            }
            AuditAction::RotationFailed => summary.rotations_failed += group.count,
            AuditAction::RotationEscalated => summary.rotations_escalated += group.count,
            AuditAction::KeyActivated => summary.keys_activated += group.count,
            AuditAction::KeyRetired => summary.keys_retired += group.count,
            AuditAction::MigrationCompleted => summary.migrations_completed += group.count,
            AuditAction::MigrationFailed => summary.migrations_failed += group.count,
            AuditAction::MigrationAbandoned => summary.migrations_abandoned += group.count,
            _ => {}
        }
    }

    let mut findings = Vec::new();
    if rate_limit.store_unavailable_denials > 0 {
        findings.push(format!(
            "{} requests denied while the rate-limit store was unavailable",
            rate_limit.store_unavailable_denials
        ));
    }
    for (key_type, summary) in &key_rotation {
        if summary.rotations_escalated > 0 {
            findings.push(format!(
                "{key_type}: {} rotation(s) escalated after exhausting retries",
                summary.rotations_escalated
            ));
        }
        if summary.migrations_abandoned > 0 {
            findings.push(format!(
                "{key_type}: {} migration(s) abandoned with records left on the previous key",
                summary.migrations_abandoned
            ));
        }
        if summary.migrations_failed > summary.migrations_completed {
            findings.push(format!("{key_type}: migration failures outnumber completions"));
        }
    }

    ComplianceReport {
        period,
        period_start,
        period_end,
        generated_at: Utc::now(),
        total_events: aggregate.total_events(),
        actions,
        rate_limit,
        key_rotation,
        findings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{key_subject, AuditEvent, AuditOutcome, MemoryAuditSink};
    use serde_json::json;

    async fn push(
        sink: &MemoryAuditSink,
        subject: String,
        action: AuditAction,
        at: DateTime<Utc>,
    ) {
        let outcome = match action {
            AuditAction::RateLimitDenied | AuditAction::RateLimitStoreUnavailable => {
                AuditOutcome::Denied
            }
            AuditAction::RotationFailed | AuditAction::RotationEscalated => AuditOutcome::Failure,
            _ => AuditOutcome::Success,
        };
        sink.append(&AuditEvent::new(subject, action, outcome, json!({}), at))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn daily_report_aggregates_denials_and_rotations() {
        let sink = MemoryAuditSink::new();
        let end = Utc::now();
        let inside = end - Duration::hours(2);
        let outside = end - Duration::days(2);

        for _ in 0..3 {
            push(&sink, "ratelimit:org-a:1".into(), AuditAction::RateLimitDenied, inside).await;
        }
        push(&sink, "ratelimit:org-b:2".into(), AuditAction::RateLimitStoreUnavailable, inside)
            .await;
        push(&sink, key_subject(KeyType::TokenEncryption), AuditAction::RotationCompleted, inside)
            .await;
        push(&sink, key_subject(KeyType::JwtSigning), AuditAction::RotationEscalated, inside).await;
        push(&sink, key_subject(KeyType::JwtSigning), AuditAction::RotationCompleted, outside)
            .await;

        let report = generate(&sink, ReportPeriod::Daily, end).await.unwrap();

        assert_eq!(report.total_events, 6);
        assert_eq!(report.rate_limit.denials, 4);
        assert_eq!(report.rate_limit.store_unavailable_denials, 1);
        assert_eq!(
            report.rate_limit.top_subjects[0],
            ("ratelimit:org-a:1".to_string(), 3)
        );
        let token = &report.key_rotation[&KeyType::TokenEncryption];
        assert_eq!(token.rotations_completed, 1);
        assert_eq!(token.last_rotated_at, Some(inside));
        let jwt = &report.key_rotation[&KeyType::JwtSigning];
        assert_eq!(jwt.rotations_completed, 0);
        assert_eq!(jwt.rotations_escalated, 1);
        assert_eq!(report.findings.len(), 2);
        assert_eq!(report.actions["rate_limit_denied"], 3);
    }

    #[tokio::test]
    async fn top_subjects_are_capped() {
        let sink = MemoryAuditSink::new();
        let end = Utc::now();
        let at = end - Duration::hours(1);
        for client in 0..(TOP_SUBJECTS + 5) {
            push(&sink, format!("ratelimit:org-a:{client:02}"), AuditAction::RateLimitDenied, at)
                .await;
        }

        let report = generate(&sink, ReportPeriod::Daily, end).await.unwrap();
        assert_eq!(report.rate_limit.denials, (TOP_SUBJECTS + 5) as u64);
        assert_eq!(report.rate_limit.top_subjects.len(), TOP_SUBJECTS);
        assert_eq!(report.rate_limit.top_subjects[0].0, "ratelimit:org-a:00");
    }

    #[test]
    fn weekly_period_spans_seven_days() {
        assert_eq!(ReportPeriod::Weekly.duration(), Duration::days(7));
        assert_eq!(ReportPeriod::from_str("daily"), Some(ReportPeriod::Daily));
        assert_eq!(ReportPeriod::from_str("monthly"), None);
    }
}
