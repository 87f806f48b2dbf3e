use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::crypto::SecretKey;

/// key: key-types
/// Independent key families, each rotated on its own cadence.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    TokenEncryption,
    JwtSigning,
    WebhookSigning,
    ApiKeyHashing,
    DatabaseEncryption,
}

impl KeyType {
    pub const ALL: [KeyType; 5] = [
        KeyType::TokenEncryption,
        KeyType::JwtSigning,
        KeyType::WebhookSigning,
        KeyType::ApiKeyHashing,
        KeyType::DatabaseEncryption,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::TokenEncryption => "token_encryption",
            KeyType::JwtSigning => "jwt_signing",
            KeyType::WebhookSigning => "webhook_signing",
            KeyType::ApiKeyHashing => "api_key_hashing",
            KeyType::DatabaseEncryption => "database_encryption",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "token_encryption" => Some(KeyType::TokenEncryption),
            "jwt_signing" => Some(KeyType::JwtSigning),
            "webhook_signing" => Some(KeyType::WebhookSigning),
            "api_key_hashing" => Some(KeyType::ApiKeyHashing),
            "database_encryption" => Some(KeyType::DatabaseEncryption),
            _ => None,
        }
    }

    /// Upper-case stem used for per-type environment overrides.
    pub fn env_stem(&self) -> &'static str {
        match self {
            KeyType::TokenEncryption => "TOKEN_ENCRYPTION",
            KeyType::JwtSigning => "JWT_SIGNING",
            KeyType::WebhookSigning => "WEBHOOK_SIGNING",
            KeyType::ApiKeyHashing => "API_KEY_HASHING",
            KeyType::DatabaseEncryption => "DATABASE_ENCRYPTION",
        }
    }

    /// (rotation interval, grace period) used when no override is configured.
    pub fn default_cadence(&self) -> (Duration, Duration) {
        match self {
            KeyType::TokenEncryption => (Duration::days(90), Duration::days(30)),
            KeyType::JwtSigning => (Duration::days(30), Duration::days(7)),
            KeyType::WebhookSigning => (Duration::days(180), Duration::days(14)),
            KeyType::ApiKeyHashing => (Duration::days(365), Duration::days(30)),
            KeyType::DatabaseEncryption => (Duration::days(365), Duration::days(60)),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Pending,
    Active,
    Grace,
    Retired,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Pending => "pending",
            KeyStatus::Active => "active",
            KeyStatus::Grace => "grace",
            KeyStatus::Retired => "retired",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "active" => KeyStatus::Active,
            "grace" => KeyStatus::Grace,
            "retired" => KeyStatus::Retired,
            _ => KeyStatus::Pending,
        }
    }
}

/// key: key-material
/// One version of a key type. The secret is dropped (and zeroized) once the version retires.
#[derive(Clone, Debug, Serialize)]
pub struct KeyMaterial {
    pub id: Uuid,
    pub key_type: KeyType,
    pub version: u32,
    #[serde(skip)]
    pub secret: Option<SecretKey>,
    pub fingerprint: String,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub activates_at: DateTime<Utc>,
    pub retires_at: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
}

impl KeyMaterial {
    pub fn can_encrypt(&self) -> bool {
        self.status == KeyStatus::Active && self.secret.is_some()
    }

    /// Active keys always decrypt; grace keys only until `retires_at`.
    pub fn can_decrypt_at(&self, now: DateTime<Utc>) -> bool {
        if self.secret.is_none() {
            return false;
        }
        match self.status {
            KeyStatus::Active => true,
            KeyStatus::Grace => self.retires_at.map(|at| now < at).unwrap_or(false),
            KeyStatus::Pending | KeyStatus::Retired => false,
        }
    }

    pub fn grace_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == KeyStatus::Grace && self.retires_at.map(|at| at <= now).unwrap_or(true)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RotationPriority {
    Normal,
    High,
    Emergency,
}

impl RotationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationPriority::Normal => "normal",
            RotationPriority::High => "high",
            RotationPriority::Emergency => "emergency",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "normal" => Some(RotationPriority::Normal),
            "high" => Some(RotationPriority::High),
            "emergency" => Some(RotationPriority::Emergency),
            _ => None,
        }
    }

    /// High and emergency jobs run outside the maintenance window.
    pub fn bypasses_maintenance_window(&self) -> bool {
        !matches!(self, RotationPriority::Normal)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    /// Key flip committed; records are being moved by a background task.
    Migrating,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Migrating => "migrating",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "running" => JobStatus::Running,
            "migrating" => JobStatus::Migrating,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Queued,
        }
    }
}

/// key: rotation-job
/// Rotation request tracked by the scheduler from enqueue to completion or escalation.
#[derive(Clone, Debug, Serialize)]
pub struct RotationJob {
    pub id: Uuid,
    pub key_type: KeyType,
    pub priority: RotationPriority,
    pub reason: String,
    pub force: bool,
    pub requested_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set once the key transition committed; retries then only resume migration.
    pub rotated_version: Option<u32>,
}

impl RotationJob {
    pub fn new(
        key_type: KeyType,
        priority: RotationPriority,
        reason: impl Into<String>,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key_type,
            priority,
            reason: reason.into(),
            force: priority == RotationPriority::Emergency,
            requested_at,
            status: JobStatus::Queued,
            attempts: 0,
            started_at: None,
            finished_at: None,
            last_error: None,
            rotated_version: None,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// key: rotation-result
#[derive(Clone, Debug, Serialize)]
pub struct RotationResult {
    pub key_type: KeyType,
    pub previous_version: Option<u32>,
    pub new_version: u32,
    pub rotated_at: DateTime<Utc>,
    pub grace_until: Option<DateTime<Utc>>,
    pub forced: bool,
    pub reason: String,
    /// Records still sealed under older versions when the flip committed; `None` if they
    /// could not be counted. Migration runs separately.
    pub records_pending: Option<u64>,
}
