use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::keys::models::KeyType;

/// key: error-taxonomy -> backing store failures
/// Failure talking to a shared store (Redis windows, scheduler leases, Postgres keys/audit).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("backing store timed out after {0:?}")]
    Timeout(Duration),
    #[error("backing store rejected operation: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Connection-level failures worth retrying locally before the failure policy applies.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(Duration::ZERO)
        } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Rejected(err.to_string())
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Unavailable(err.to_string())
            }
            other => StoreError::Rejected(other.to_string()),
        }
    }
}

/// key: error-taxonomy -> key validation
/// Malformed or missing key material. Fatal when raised during startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyValidationError {
    #[error("{name} must be set")]
    Missing { name: String },
    #[error("{name} is not valid base64: {reason}")]
    Encoding { name: String, reason: String },
    #[error("{name} must be {expected} bytes, got {actual}")]
    Length {
        name: String,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext is truncated")]
    Truncated,
    #[error("authenticated decryption failed")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}

/// key: error-taxonomy -> rotation lifecycle
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("key type {0} is not configured")]
    UnknownKeyType(String),
    #[error("rotation of {key_type} is not due until {due_at}")]
    NotDue {
        key_type: KeyType,
        due_at: DateTime<Utc>,
    },
    #[error("no active key for {0}")]
    NoActiveKey(KeyType),
    #[error("{key_type} key version {version} is not available for decryption")]
    KeyUnavailable { key_type: KeyType, version: u32 },
    #[error(
        "migration of {key_type} records from version {from_version} to {to_version} failed after {batches_completed} batches: {reason}"
    )]
    MigrationFailure {
        key_type: KeyType,
        from_version: u32,
        to_version: u32,
        batches_completed: u64,
        reason: String,
        /// False when the failing batch hit something a retry cannot fix, such as a record
        /// that no longer authenticates.
        retryable: bool,
    },
    #[error("migration of {key_type} records from version {from_version} to {to_version} was cancelled")]
    MigrationCancelled {
        key_type: KeyType,
        from_version: u32,
        to_version: u32,
    },
    #[error("rotation slot lease for {0} was lost to another holder")]
    LeaseLost(KeyType),
    #[error("migration task for {0} ended without a result: {1}")]
    MigrationTaskLost(KeyType, String),
    #[error(transparent)]
    Validation(#[from] KeyValidationError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RotationError {
    pub fn is_migration_failure(&self) -> bool {
        matches!(self, RotationError::MigrationFailure { .. })
    }

    /// Version already activated when a rotation failed during its migration phase.
    pub fn committed_version(&self) -> Option<u32> {
        match self {
            RotationError::MigrationFailure { to_version, .. }
            | RotationError::MigrationCancelled { to_version, .. } => Some(*to_version),
            _ => None,
        }
    }

    /// Failures that a later attempt may not hit again.
    pub fn is_retryable(&self) -> bool {
        match self {
            RotationError::Store(err) => err.is_transient(),
            RotationError::MigrationFailure { retryable, .. } => *retryable,
            RotationError::LeaseLost(_) | RotationError::MigrationTaskLost(..) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rotation(#[from] RotationError),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    Message(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Rotation(RotationError::UnknownKeyType(_)) => StatusCode::NOT_FOUND,
            AppError::Rotation(RotationError::NotDue { .. }) => StatusCode::CONFLICT,
            AppError::Rotation(RotationError::Store(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Db(_) | AppError::Rotation(_) | AppError::Message(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
