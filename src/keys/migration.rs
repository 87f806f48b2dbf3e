//! Batched re-encryption of records from older key versions onto the active one.
//!
//! Each batch is fetched, re-sealed and written back as one unit, so a record is either
//! fully on the old version or fully on the new one. Progress needs no checkpoint: the next
//! fetch only sees rows still on the old version, which makes every run resumable.
//! Cancellation is honoured between batches only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::RotationError;
use crate::retry::RetryPolicy;

use super::crypto::SecretKey;
use super::models::KeyType;
use super::records::{EncryptedRecord, RecordStore};

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// No older decrypt-capable version existed.
    #[default]
    NotRequired,
    Completed,
}

/// key: migration-report
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub state: MigrationState,
    pub to_version: Option<u32>,
    pub from_versions: Vec<u32>,
    pub batches_completed: u64,
    pub records_migrated: u64,
    /// Batch attempts beyond the first, summed over all batches.
    pub retries: u64,
}

/// Cancellation flag shared between a running migration and whoever may abort it.
#[derive(Clone, Debug, Default)]
pub struct MigrationControl {
    cancelled: Arc<AtomicBool>,
}

impl MigrationControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Source version still holding records that must move to the target.
pub struct MigrationSource<'a> {
    pub version: u32,
    pub secret: &'a SecretKey,
}

pub struct MigrationPlan<'a> {
    pub key_type: KeyType,
    pub sources: Vec<MigrationSource<'a>>,
    pub target_version: u32,
    pub target: &'a SecretKey,
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

/// Runs the plan to completion. A batch failing with a retryable error is retried under
/// `plan.retry`; once attempts run out the migration stops with `MigrationFailure`.
pub async fn run(
    records: &dyn RecordStore,
    plan: &MigrationPlan<'_>,
    control: &MigrationControl,
) -> Result<MigrationReport, RotationError> {
    let mut report = MigrationReport {
        to_version: Some(plan.target_version),
        from_versions: plan.sources.iter().map(|source| source.version).collect(),
        ..MigrationReport::default()
    };
    if plan.sources.is_empty() {
        return Ok(report);
    }

    for source in &plan.sources {
        loop {
            if control.is_cancelled() {
                tracing::warn!(
                    key_type = %plan.key_type,
                    from_version = source.version,
                    batches = report.batches_completed,
                    "key migration cancelled"
                );
                return Err(RotationError::MigrationCancelled {
                    key_type: plan.key_type,
                    from_version: source.version,
                    to_version: plan.target_version,
                });
            }

            let mut attempts_made = 0;
            let outcome = plan
                .retry
                .run(
                    |attempt| {
                        attempts_made = attempt;
                        migrate_batch(records, plan, source)
                    },
                    RotationError::is_retryable,
                )
                .await;
            report.retries += u64::from(attempts_made.saturating_sub(1));

            match outcome {
                Ok(0) => break,
                Ok(migrated) => {
                    report.batches_completed += 1;
                    report.records_migrated += migrated;
                    tracing::debug!(
                        key_type = %plan.key_type,
                        from_version = source.version,
                        batch = report.batches_completed,
                        migrated,
                        "key migration batch committed"
                    );
                }
                Err(exhausted) => {
                    let retryable = exhausted.error.is_retryable();
                    return Err(RotationError::MigrationFailure {
                        key_type: plan.key_type,
                        from_version: source.version,
                        to_version: plan.target_version,
                        batches_completed: report.batches_completed,
                        reason: format!(
                            "{} (after {} attempts)",
                            exhausted.error, exhausted.attempts
                        ),
                        retryable,
                    });
                }
            }
        }
    }

    report.state = MigrationState::Completed;
    Ok(report)
}

/// Returns how many records were fetched; zero means the source version is drained.
async fn migrate_batch(
    records: &dyn RecordStore,
    plan: &MigrationPlan<'_>,
    source: &MigrationSource<'_>,
) -> Result<u64, RotationError> {
    let batch = records
        .fetch_batch(plan.key_type, source.version, plan.batch_size)
        .await?;
    if batch.is_empty() {
        return Ok(0);
    }

    let mut resealed = Vec::with_capacity(batch.len());
    for record in &batch {
        let plaintext = zeroize::Zeroizing::new(source.secret.open(plan.key_type, &record.ciphertext)?);
        let ciphertext = plan
            .target
            .seal(plan.key_type, plan.target_version, &plaintext)?;
        resealed.push(EncryptedRecord {
            id: record.id,
            key_type: plan.key_type,
            key_version: plan.target_version,
            ciphertext,
        });
    }

    records.replace_batch(source.version, &resealed).await?;
    Ok(batch.len() as u64)
}
