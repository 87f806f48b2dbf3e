use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::audit::{
    key_subject, record_best_effort, AuditAction, AuditEvent, AuditOutcome, AuditSink,
};
use crate::config::{KeyTypePolicy, RotationConfig};
use crate::error::{RotationError, StoreError};

use super::crypto::{sealed_version, SecretKey};
use super::migration::{self, MigrationControl, MigrationPlan, MigrationReport, MigrationSource};
use super::models::{KeyMaterial, KeyStatus, KeyType, RotationJob, RotationResult};
use super::records::RecordStore;
use super::store::{Demotion, KeyStore, KeyTransition};

/// How long a loaded key set is trusted before it is re-read. Rotations by other
/// instances become visible within this bound; decrypt misses reload immediately.
const KEY_CACHE_TTL: StdDuration = StdDuration::from_secs(30);

struct KeyCache {
    loaded_at: Instant,
    keys: Vec<KeyMaterial>,
}

/// key: key-rotation-status
/// Secret-free view of one key type for status endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct KeyTypeStatus {
    pub key_type: KeyType,
    pub active_version: Option<u32>,
    pub active_since: Option<DateTime<Utc>>,
    pub rotation_due_at: Option<DateTime<Utc>>,
    pub interval_days: i64,
    pub grace_days: i64,
    pub versions: Vec<KeyMaterial>,
}

/// key: key-rotation-service
/// Owns the per-type lifecycle `pending -> active -> grace -> retired`: rotation, batched
/// re-encryption, decrypt-only grace access and the retirement sweep. Every transition is
/// audited.
pub struct KeyRotationService {
    keys: Arc<dyn KeyStore>,
    records: Arc<dyn RecordStore>,
    audit: Arc<dyn AuditSink>,
    config: RotationConfig,
    cache: RwLock<Option<KeyCache>>,
    migrations: Mutex<HashMap<KeyType, MigrationControl>>,
    rotation_locks: HashMap<KeyType, tokio::sync::Mutex<()>>,
}

impl KeyRotationService {
    pub fn new(
        keys: Arc<dyn KeyStore>,
        records: Arc<dyn RecordStore>,
        audit: Arc<dyn AuditSink>,
        config: RotationConfig,
    ) -> Self {
        let rotation_locks = config
            .policies
            .keys()
            .map(|key_type| (*key_type, tokio::sync::Mutex::new(())))
            .collect();
        Self {
            keys,
            records,
            audit,
            config,
            cache: RwLock::new(None),
            migrations: Mutex::new(HashMap::new()),
            rotation_locks,
        }
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    pub fn configured_types(&self) -> Vec<KeyType> {
        self.config.policies.keys().copied().collect()
    }

    pub fn policy(&self, key_type: KeyType) -> Result<KeyTypePolicy, RotationError> {
        self.config
            .policy(key_type)
            .copied()
            .ok_or_else(|| RotationError::UnknownKeyType(key_type.to_string()))
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    async fn load_keys(&self, force_reload: bool) -> Result<Vec<KeyMaterial>, StoreError> {
        if !force_reload {
            if let Some(cache) = self.cache.read().await.as_ref() {
                if cache.loaded_at.elapsed() < KEY_CACHE_TTL {
                    return Ok(cache.keys.clone());
                }
            }
        }
        let keys = self.keys.list_keys().await?;
        *self.cache.write().await = Some(KeyCache {
            loaded_at: Instant::now(),
            keys: keys.clone(),
        });
        Ok(keys)
    }

    async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
    }

    async fn keys_of(&self, key_type: KeyType) -> Result<Vec<KeyMaterial>, StoreError> {
        Ok(self
            .load_keys(false)
            .await?
            .into_iter()
            .filter(|key| key.key_type == key_type)
            .collect())
    }

    pub async fn active_key(&self, key_type: KeyType) -> Result<Option<KeyMaterial>, RotationError> {
        Ok(self
            .keys_of(key_type)
            .await?
            .into_iter()
            .find(|key| key.status == KeyStatus::Active))
    }

    /// When the active key of `key_type` reaches the end of its interval.
    pub async fn rotation_due_at(
        &self,
        key_type: KeyType,
    ) -> Result<Option<DateTime<Utc>>, RotationError> {
        let policy = self.policy(key_type)?;
        Ok(self
            .active_key(key_type)
            .await?
            .map(|key| key.activates_at + policy.interval))
    }

    /// Creates the first active key for every configured type that has none.
    pub async fn ensure_initialized(&self, now: DateTime<Utc>) -> Result<Vec<KeyMaterial>, RotationError> {
        let mut created = Vec::new();
        for key_type in self.configured_types() {
            let _guard = self.lock_for(key_type)?.lock().await;
            let existing = self.load_keys(true).await?;
            let of_type: Vec<&KeyMaterial> = existing
                .iter()
                .filter(|key| key.key_type == key_type)
                .collect();
            if of_type.iter().any(|key| key.status == KeyStatus::Active) {
                continue;
            }

            let mut key = self.stage_pending(key_type, &of_type, now).await?;
            let version = key.version;
            self.keys
                .commit_transition(&KeyTransition {
                    key_type,
                    activate_version: version,
                    activated_at: now,
                    demote: None,
                })
                .await?;
            self.invalidate_cache().await;
            key.status = KeyStatus::Active;
            key.activates_at = now;

            tracing::info!(%key_type, version, fingerprint = %key.fingerprint, "initial key created");
            self.audit_key(
                key_type,
                AuditAction::KeyActivated,
                json!({"version": version, "bootstrap": true}),
                now,
            )
            .await;
            created.push(key);
        }
        Ok(created)
    }

    pub async fn rotate(
        &self,
        key_type: KeyType,
        force: bool,
        reason: &str,
    ) -> Result<RotationResult, RotationError> {
        self.rotate_at(key_type, force, reason, Utc::now()).await
    }

    /// Activates a new key version and moves the previous one into grace. Unless `force` is
    /// set, rotation is refused before the active key reaches the end of its interval.
    ///
    /// The new version is first persisted as `pending`; promotion and demotion then commit
    /// together, so a failure in between leaves the previous key active and the pending one
    /// is reused by the next attempt. Records still sealed under older versions are not
    /// touched here: callers follow up with [`resume_migration`](Self::resume_migration).
    pub async fn rotate_at(
        &self,
        key_type: KeyType,
        force: bool,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<RotationResult, RotationError> {
        let policy = self.policy(key_type)?;
        let _guard = self.lock_for(key_type)?.lock().await;

        let keys: Vec<KeyMaterial> = self
            .load_keys(true)
            .await?
            .into_iter()
            .filter(|key| key.key_type == key_type)
            .collect();
        let previous = keys.iter().find(|key| key.status == KeyStatus::Active).cloned();

        if let Some(active) = &previous {
            let due_at = active.activates_at + policy.interval;
            if !force && now < due_at {
                return Err(RotationError::NotDue { key_type, due_at });
            }
        }

        let of_type: Vec<&KeyMaterial> = keys.iter().collect();
        let new_key = self.stage_pending(key_type, &of_type, now).await?;
        let version = new_key.version;
        let grace_until = previous.as_ref().map(|_| now + policy.grace_period);

        self.keys
            .commit_transition(&KeyTransition {
                key_type,
                activate_version: version,
                activated_at: now,
                demote: previous.as_ref().zip(grace_until).map(|(key, retires_at)| Demotion {
                    version: key.version,
                    retires_at,
                }),
            })
            .await?;
        self.invalidate_cache().await;

        tracing::info!(
            %key_type,
            version,
            previous_version = previous.as_ref().map(|key| key.version),
            force,
            reason,
            "key rotated"
        );
        self.audit_key(
            key_type,
            AuditAction::KeyActivated,
            json!({"version": version, "force": force, "reason": reason}),
            now,
        )
        .await;
        if let (Some(previous), Some(grace_until)) = (&previous, grace_until) {
            self.audit_key(
                key_type,
                AuditAction::KeyGraceStarted,
                json!({"version": previous.version, "retires_at": grace_until}),
                now,
            )
            .await;
        }

        let stale_versions: Vec<u32> = keys
            .iter()
            .filter(|key| key.version != version && key.can_decrypt_at(now))
            .map(|key| key.version)
            .collect();
        let records_pending = self.count_pending(key_type, &stale_versions).await;

        Ok(RotationResult {
            key_type,
            previous_version: previous.map(|key| key.version),
            new_version: version,
            rotated_at: now,
            grace_until,
            forced: force,
            reason: reason.to_string(),
            records_pending,
        })
    }

    /// Reuses a pending version left by an interrupted rotation, otherwise generates and
    /// stores a new one.
    async fn stage_pending(
        &self,
        key_type: KeyType,
        of_type: &[&KeyMaterial],
        now: DateTime<Utc>,
    ) -> Result<KeyMaterial, RotationError> {
        if let Some(pending) = of_type
            .iter()
            .find(|key| key.status == KeyStatus::Pending && key.secret.is_some())
        {
            tracing::info!(%key_type, version = pending.version, "reusing pending key");
            return Ok((*pending).clone());
        }

        let key = new_key(key_type, next_version(of_type), now);
        self.keys.insert_pending(&key).await?;
        self.invalidate_cache().await;
        self.audit_key(
            key_type,
            AuditAction::KeyGenerated,
            json!({"version": key.version, "fingerprint": key.fingerprint}),
            now,
        )
        .await;
        Ok(key)
    }

    /// Records still sealed under `versions`. `None` when the record store could not say.
    async fn count_pending(&self, key_type: KeyType, versions: &[u32]) -> Option<u64> {
        let mut total = 0;
        for version in versions {
            match self.records.count_on_version(key_type, *version).await {
                Ok(count) => total += count,
                Err(err) => {
                    tracing::warn!(%key_type, version, ?err, "could not count records awaiting migration");
                    return None;
                }
            }
        }
        Some(total)
    }

    /// Moves records of every decrypt-capable older version onto the current active key.
    /// Safe to re-run: only records still on an older version are visited.
    pub async fn resume_migration(&self, key_type: KeyType) -> Result<MigrationReport, RotationError> {
        self.policy(key_type)?;
        let _guard = self.lock_for(key_type)?.lock().await;
        let active = self
            .active_key(key_type)
            .await?
            .ok_or(RotationError::NoActiveKey(key_type))?;
        self.migrate_to(key_type, &active, Utc::now()).await
    }

    async fn migrate_to(
        &self,
        key_type: KeyType,
        target: &KeyMaterial,
        now: DateTime<Utc>,
    ) -> Result<MigrationReport, RotationError> {
        let keys = self.keys_of(key_type).await?;
        let sources: Vec<MigrationSource<'_>> = keys
            .iter()
            .filter(|key| key.version != target.version && key.can_decrypt_at(now))
            .filter_map(|key| {
                key.secret.as_ref().map(|secret| MigrationSource {
                    version: key.version,
                    secret,
                })
            })
            .collect();
        let target_secret = target
            .secret
            .as_ref()
            .ok_or(RotationError::KeyUnavailable {
                key_type,
                version: target.version,
            })?;
        if sources.is_empty() {
            return Ok(MigrationReport {
                to_version: Some(target.version),
                ..MigrationReport::default()
            });
        }

        let control = MigrationControl::new();
        self.lock_migrations().insert(key_type, control.clone());

        let plan = MigrationPlan {
            key_type,
            sources,
            target_version: target.version,
            target: target_secret,
            batch_size: self.config.migration_batch_size,
            retry: self.config.migration_retry,
        };
        let outcome = migration::run(self.records.as_ref(), &plan, &control).await;
        self.lock_migrations().remove(&key_type);

        match &outcome {
            Ok(report) => {
                tracing::info!(
                    %key_type,
                    to_version = target.version,
                    records = report.records_migrated,
                    batches = report.batches_completed,
                    "key migration completed"
                );
                self.audit_key(
                    key_type,
                    AuditAction::MigrationCompleted,
                    json!({
                        "from_versions": report.from_versions,
                        "to_version": target.version,
                        "batches": report.batches_completed,
                        "records": report.records_migrated,
                        "retries": report.retries,
                    }),
                    now,
                )
                .await;
            }
            Err(RotationError::MigrationCancelled { from_version, .. }) => {
                self.audit_key_outcome(
                    key_type,
                    AuditAction::MigrationCancelled,
                    AuditOutcome::Failure,
                    json!({"from_version": from_version, "to_version": target.version}),
                    now,
                )
                .await;
            }
            Err(err) => {
                tracing::error!(%key_type, to_version = target.version, ?err, "key migration failed");
                self.audit_key_outcome(
                    key_type,
                    AuditAction::MigrationFailed,
                    AuditOutcome::Failure,
                    json!({"to_version": target.version, "error": err.to_string()}),
                    now,
                )
                .await;
            }
        }

        outcome
    }

    /// Requests that an in-flight migration of `key_type` stop after its current batch.
    pub fn cancel_migration(&self, key_type: KeyType) -> bool {
        match self.lock_migrations().get(&key_type) {
            Some(control) => {
                control.cancel();
                true
            }
            None => false,
        }
    }

    /// Gives up on moving the remaining records of `from_version`. They stay decryptable until
    /// that version retires, after which they are unreadable; the abandonment is audited with
    /// the number of records left behind.
    pub async fn abandon_migration(
        &self,
        key_type: KeyType,
        from_version: u32,
        reason: &str,
    ) -> Result<u64, RotationError> {
        self.policy(key_type)?;
        self.cancel_migration(key_type);
        let remaining = self.records.count_on_version(key_type, from_version).await?;
        tracing::warn!(%key_type, from_version, remaining, reason, "key migration abandoned");
        self.audit_key_outcome(
            key_type,
            AuditAction::MigrationAbandoned,
            AuditOutcome::Failure,
            json!({"from_version": from_version, "remaining_records": remaining, "reason": reason}),
            Utc::now(),
        )
        .await;
        Ok(remaining)
    }

    /// Retires every grace key whose grace period ended at or before `now`.
    pub async fn retire_expired(&self, now: DateTime<Utc>) -> Result<Vec<KeyMaterial>, RotationError> {
        let expired: Vec<KeyMaterial> = self
            .load_keys(true)
            .await?
            .into_iter()
            .filter(|key| key.grace_expired_at(now))
            .collect();

        let mut retired = Vec::with_capacity(expired.len());
        for mut key in expired {
            self.keys.retire(key.key_type, key.version, now).await?;
            tracing::info!(key_type = %key.key_type, version = key.version, "grace key retired");
            self.audit_key(
                key.key_type,
                AuditAction::KeyRetired,
                json!({"version": key.version, "retires_at": key.retires_at}),
                now,
            )
            .await;
            key.status = KeyStatus::Retired;
            key.retired_at = Some(now);
            key.secret = None;
            retired.push(key);
        }
        if !retired.is_empty() {
            self.invalidate_cache().await;
        }
        Ok(retired)
    }

    /// Seals `plaintext` under the active key; the output carries its key version.
    pub async fn encrypt(&self, key_type: KeyType, plaintext: &[u8]) -> Result<Vec<u8>, RotationError> {
        self.policy(key_type)?;
        let active = self
            .active_key(key_type)
            .await?
            .ok_or(RotationError::NoActiveKey(key_type))?;
        let secret = active.secret.as_ref().ok_or(RotationError::KeyUnavailable {
            key_type,
            version: active.version,
        })?;
        Ok(secret.seal(key_type, active.version, plaintext)?)
    }

    pub async fn decrypt(&self, key_type: KeyType, sealed: &[u8]) -> Result<Vec<u8>, RotationError> {
        self.decrypt_at(key_type, sealed, Utc::now()).await
    }

    /// Opens `sealed` with the version it names, if that version is active or still in grace
    /// at `now`.
    pub async fn decrypt_at(
        &self,
        key_type: KeyType,
        sealed: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, RotationError> {
        self.policy(key_type)?;
        let version = sealed_version(sealed)?;

        let mut key = self.find_version(key_type, version, false).await?;
        if key.is_none() {
            key = self.find_version(key_type, version, true).await?;
        }
        let key = key
            .filter(|key| key.can_decrypt_at(now))
            .ok_or(RotationError::KeyUnavailable { key_type, version })?;
        let secret = key
            .secret
            .as_ref()
            .ok_or(RotationError::KeyUnavailable { key_type, version })?;
        Ok(secret.open(key_type, sealed)?)
    }

    async fn find_version(
        &self,
        key_type: KeyType,
        version: u32,
        force_reload: bool,
    ) -> Result<Option<KeyMaterial>, StoreError> {
        Ok(self
            .load_keys(force_reload)
            .await?
            .into_iter()
            .find(|key| key.key_type == key_type && key.version == version))
    }

    pub async fn status(&self) -> Result<Vec<KeyTypeStatus>, RotationError> {
        let keys = self.load_keys(false).await?;
        Ok(self
            .config
            .policies
            .iter()
            .map(|(key_type, policy)| {
                let versions: Vec<KeyMaterial> = keys
                    .iter()
                    .filter(|key| key.key_type == *key_type)
                    .cloned()
                    .collect();
                let active = versions.iter().find(|key| key.status == KeyStatus::Active);
                KeyTypeStatus {
                    key_type: *key_type,
                    active_version: active.map(|key| key.version),
                    active_since: active.map(|key| key.activates_at),
                    rotation_due_at: active.map(|key| key.activates_at + policy.interval),
                    interval_days: policy.interval.num_days(),
                    grace_days: policy.grace_period.num_days(),
                    versions,
                }
            })
            .collect())
    }

    pub async fn record_job(&self, job: &RotationJob) -> Result<(), StoreError> {
        self.keys.upsert_job(job).await
    }

    pub async fn recent_jobs(&self, limit: i64) -> Result<Vec<RotationJob>, StoreError> {
        self.keys.recent_jobs(limit).await
    }

    fn lock_for(&self, key_type: KeyType) -> Result<&tokio::sync::Mutex<()>, RotationError> {
        self.rotation_locks
            .get(&key_type)
            .ok_or_else(|| RotationError::UnknownKeyType(key_type.to_string()))
    }

    fn lock_migrations(&self) -> std::sync::MutexGuard<'_, HashMap<KeyType, MigrationControl>> {
        self.migrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn audit_key(
        &self,
        key_type: KeyType,
        action: AuditAction,
        detail: serde_json::Value,
        at: DateTime<Utc>,
    ) {
        self.audit_key_outcome(key_type, action, AuditOutcome::Success, detail, at)
            .await;
    }

    async fn audit_key_outcome(
        &self,
        key_type: KeyType,
        action: AuditAction,
        outcome: AuditOutcome,
        detail: serde_json::Value,
        at: DateTime<Utc>,
    ) {
        let event = AuditEvent::new(key_subject(key_type), action, outcome, detail, at);
        record_best_effort(self.audit.as_ref(), event).await;
    }
}

fn next_version(keys: &[&KeyMaterial]) -> u32 {
    keys.iter().map(|key| key.version).max().unwrap_or(0) + 1
}

fn new_key(key_type: KeyType, version: u32, now: DateTime<Utc>) -> KeyMaterial {
    let secret = SecretKey::generate();
    KeyMaterial {
        id: Uuid::new_v4(),
        key_type,
        version,
        fingerprint: secret.fingerprint(),
        secret: Some(secret),
        status: KeyStatus::Pending,
        created_at: now,
        activates_at: now,
        retires_at: None,
        retired_at: None,
    }
}
