use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::audit::{
    record_best_effort, AuditAction, AuditEvent, AuditOutcome, AuditSink,
    RATE_LIMIT_SUBJECT_PREFIX,
};
use crate::config::{FailureMode, RateLimitConfig};
use crate::error::StoreError;

use super::window::{WindowKind, WindowOutcome, WindowSpec, WindowStore};

/// Retry hint returned while the shared store is unreachable and the limiter fails closed.
pub const STORE_UNAVAILABLE_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Tenant + identifier pair every window key is derived from.
/// The identifier is hashed so raw API keys or addresses never reach the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitScope {
    pub org_id: String,
    pub identifier_digest: String,
}

impl RateLimitScope {
    pub fn new(org_id: &str, identifier: &str) -> Self {
        Self {
            org_id: org_id.to_string(),
            identifier_digest: hex::encode(&Sha256::digest(identifier.as_bytes())[..16]),
        }
    }

    /// Redis hash tag shared by all windows of this scope.
    /// The org id is hashed too so tenant-controlled text cannot break out of the tag.
    fn hash_tag(&self) -> String {
        let org = hex::encode(&Sha256::digest(self.org_id.as_bytes())[..8]);
        format!("{org}:{}", self.identifier_digest)
    }

    pub fn window_key(&self, prefix: &str, kind: WindowKind) -> String {
        format!("{prefix}:{{{}}}:{}", self.hash_tag(), kind.as_str())
    }

    pub fn audit_subject(&self) -> String {
        format!(
            "{RATE_LIMIT_SUBJECT_PREFIX}{}:{}",
            self.org_id, self.identifier_digest
        )
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Allowed,
    Limited,
    /// Store unreachable, request admitted by policy.
    FailedOpen,
    /// Store unreachable, request denied by policy.
    FailedClosed,
}

/// key: rate-limit-decision
/// Outcome of one `check`. Exceeding a limit is a normal decision, not an error.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Decision {
    pub status: DecisionStatus,
    pub allowed: bool,
    pub limiting_window: Option<WindowKind>,
    /// Limit of the window reported in headers.
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: Duration,
    pub retry_after: Option<Duration>,
}

impl Decision {
    fn from_outcome(outcome: &WindowOutcome) -> Self {
        let binding = outcome.binding_window();
        let limit = binding.map(|window| window.limit).unwrap_or(0);
        let reset_after = binding
            .map(|window| window.reset_after)
            .unwrap_or(Duration::ZERO);

        if outcome.allowed {
            return Self {
                status: DecisionStatus::Allowed,
                allowed: true,
                limiting_window: None,
                limit,
                remaining: outcome.remaining(),
                reset_after,
                retry_after: None,
            };
        }

        let limiting = outcome.limiting_window();
        // Sub-millisecond resets still need a positive hint for clients.
        let retry_after = limiting
            .map(|window| window.reset_after)
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_millis(1));

        Self {
            status: DecisionStatus::Limited,
            allowed: false,
            limiting_window: limiting.map(|window| window.kind),
            limit,
            remaining: 0,
            reset_after,
            retry_after: Some(retry_after),
        }
    }

    fn store_failure(mode: FailureMode) -> Self {
        match mode {
            FailureMode::Open => Self {
                status: DecisionStatus::FailedOpen,
                allowed: true,
                limiting_window: None,
                limit: 0,
                remaining: 0,
                reset_after: Duration::ZERO,
                retry_after: None,
            },
            FailureMode::Closed => Self {
                status: DecisionStatus::FailedClosed,
                allowed: false,
                limiting_window: None,
                limit: 0,
                remaining: 0,
                reset_after: STORE_UNAVAILABLE_RETRY_AFTER,
                retry_after: Some(STORE_UNAVAILABLE_RETRY_AFTER),
            },
        }
    }
}

/// key: distributed-rate-limiter
/// Multi-window sliding limiter over a shared [`WindowStore`]. When the store cannot answer after the
/// configured local retries, the configured [`FailureMode`] decides; no local counters are
/// ever substituted.
#[derive(Clone)]
pub struct DistributedRateLimiter {
    store: Arc<dyn WindowStore>,
    audit: Arc<dyn AuditSink>,
    config: RateLimitConfig,
}

impl DistributedRateLimiter {
    pub fn new(
        store: Arc<dyn WindowStore>,
        audit: Arc<dyn AuditSink>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.config.failure_mode
    }

    pub fn window_specs(&self, scope: &RateLimitScope) -> Vec<WindowSpec> {
        let limits = &self.config.limits;
        WindowKind::ALL
            .into_iter()
            .map(|kind| {
                let (limit, length) = match kind {
                    WindowKind::Second => (limits.per_second, Duration::from_secs(1)),
                    WindowKind::Minute => (limits.per_minute, Duration::from_secs(60)),
                    WindowKind::Hour => (limits.per_hour, Duration::from_secs(3600)),
                    WindowKind::Burst => (limits.burst, limits.burst_window),
                };
                WindowSpec {
                    kind,
                    key: scope.window_key(&self.config.key_prefix, kind),
                    limit,
                    length,
                }
            })
            .collect()
    }

    pub async fn check(&self, identifier: &str, org_id: &str) -> Decision {
        let scope = RateLimitScope::new(org_id, identifier);
        let specs = self.window_specs(&scope);

        let result = self
            .config
            .store_retry
            .run(
                |attempt| {
                    let store = Arc::clone(&self.store);
                    let specs = &specs;
                    async move {
                        if attempt > 1 {
                            tracing::debug!(attempt, "retrying rate-limit store");
                        }
                        store.check_and_increment(specs).await
                    }
                },
                StoreError::is_transient,
            )
            .await;

        match result {
            Ok(outcome) => {
                let decision = Decision::from_outcome(&outcome);
                if !decision.allowed {
                    self.audit_denial(&scope, &decision).await;
                }
                decision
            }
            Err(exhausted) => {
                self.on_store_failure(&scope, exhausted.attempts, &exhausted.error)
                    .await
            }
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    async fn on_store_failure(
        &self,
        scope: &RateLimitScope,
        attempts: u32,
        error: &StoreError,
    ) -> Decision {
        let decision = Decision::store_failure(self.config.failure_mode);
        match self.config.failure_mode {
            FailureMode::Open => {
                tracing::warn!(
                    org_id = %scope.org_id,
                    attempts,
                    ?error,
                    "rate-limit store unavailable; failing open"
                );
            }
            FailureMode::Closed => {
                tracing::error!(
                    org_id = %scope.org_id,
                    attempts,
                    ?error,
                    "rate-limit store unavailable; failing closed"
                );
                let event = AuditEvent::new(
                    scope.audit_subject(),
                    AuditAction::RateLimitStoreUnavailable,
                    AuditOutcome::Denied,
                    json!({
                        "failure_mode": self.config.failure_mode.as_str(),
                        "attempts": attempts,
                        "error": error.to_string(),
                    }),
                    Utc::now(),
                );
                record_best_effort(self.audit.as_ref(), event).await;
            }
        }
        decision
    }

    async fn audit_denial(&self, scope: &RateLimitScope, decision: &Decision) {
        tracing::debug!(
            org_id = %scope.org_id,
            window = ?decision.limiting_window,
            "rate limit exceeded"
        );
        let event = AuditEvent::new(
            scope.audit_subject(),
            AuditAction::RateLimitDenied,
            AuditOutcome::Denied,
            json!({
                "window": decision.limiting_window.map(|kind| kind.as_str()),
                "limit": decision.limit,
                "retry_after_ms": decision.retry_after.map(|delay| delay.as_millis() as u64),
            }),
            Utc::now(),
        );
        record_best_effort(self.audit.as_ref(), event).await;
    }
}
