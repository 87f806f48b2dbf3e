use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;

use super::crypto::MasterKey;
use super::models::{
    JobStatus, KeyMaterial, KeyStatus, KeyType, RotationJob, RotationPriority,
};

/// Atomic lifecycle step committed by a rotation: the previous active key (if any) moves
/// to grace and the pending version becomes active in the same unit of work.
#[derive(Clone, Copy, Debug)]
pub struct KeyTransition {
    pub key_type: KeyType,
    pub activate_version: u32,
    pub activated_at: DateTime<Utc>,
    pub demote: Option<Demotion>,
}

#[derive(Clone, Copy, Debug)]
pub struct Demotion {
    pub version: u32,
    pub retires_at: DateTime<Utc>,
}

/// key: key-store
/// Persistence for key material and the rotation job ledger.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Every version of every key type, ordered by type then version.
    async fn list_keys(&self) -> Result<Vec<KeyMaterial>, StoreError>;

    /// Stores freshly generated material as `pending`. Pending keys never encrypt or decrypt.
    async fn insert_pending(&self, key: &KeyMaterial) -> Result<(), StoreError>;

    /// Promotes a pending version to active, demoting the current active one if requested.
    async fn commit_transition(&self, transition: &KeyTransition) -> Result<(), StoreError>;

    /// Marks a version retired and discards its secret.
    async fn retire(
        &self,
        key_type: KeyType,
        version: u32,
        retired_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn upsert_job(&self, job: &RotationJob) -> Result<(), StoreError>;

    async fn recent_jobs(&self, limit: i64) -> Result<Vec<RotationJob>, StoreError>;
}

/// Postgres key store. Secrets are wrapped with the master key before they leave the process.
#[derive(Clone)]
pub struct PgKeyStore {
    pool: PgPool,
    master: MasterKey,
}

impl PgKeyStore {
    pub fn new(pool: PgPool, master: MasterKey) -> Self {
        Self { pool, master }
    }
}

#[derive(sqlx::FromRow)]
struct KeyRow {
    id: Uuid,
    key_type: String,
    version: i32,
    wrapped_secret: Option<Vec<u8>>,
    fingerprint: String,
    status: String,
    created_at: DateTime<Utc>,
    activates_at: DateTime<Utc>,
    retires_at: Option<DateTime<Utc>>,
    retired_at: Option<DateTime<Utc>>,
}

impl KeyRow {
    fn into_material(self, master: &MasterKey) -> Result<KeyMaterial, StoreError> {
        let key_type = KeyType::from_str(&self.key_type)
            .ok_or_else(|| StoreError::Rejected(format!("unknown key type: {}", self.key_type)))?;
        let secret = match &self.wrapped_secret {
            Some(wrapped) => Some(master.unwrap_key(key_type, wrapped).map_err(|err| {
                StoreError::Rejected(format!(
                    "cannot unwrap {key_type} version {}: {err}",
                    self.version
                ))
            })?),
            None => None,
        };
        Ok(KeyMaterial {
            id: self.id,
            key_type,
            version: self.version as u32,
            secret,
            fingerprint: self.fingerprint,
            status: KeyStatus::from_str(&self.status),
            created_at: self.created_at,
            activates_at: self.activates_at,
            retires_at: self.retires_at,
            retired_at: self.retired_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    key_type: String,
    priority: String,
    reason: String,
    force: bool,
    requested_at: DateTime<Utc>,
    status: String,
    attempts: i32,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    rotated_version: Option<i32>,
}

impl TryFrom<JobRow> for RotationJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let key_type = KeyType::from_str(&row.key_type)
            .ok_or_else(|| StoreError::Rejected(format!("unknown key type: {}", row.key_type)))?;
        Ok(RotationJob {
            id: row.id,
            key_type,
            priority: RotationPriority::from_str(&row.priority).unwrap_or(RotationPriority::Normal),
            reason: row.reason,
            force: row.force,
            requested_at: row.requested_at,
            status: JobStatus::from_str(&row.status),
            attempts: row.attempts.max(0) as u32,
            started_at: row.started_at,
            finished_at: row.finished_at,
            last_error: row.last_error,
            rotated_version: row.rotated_version.map(|version| version as u32),
        })
    }
}

#[async_trait]
impl KeyStore for PgKeyStore {
    async fn list_keys(&self) -> Result<Vec<KeyMaterial>, StoreError> {
        let rows = sqlx::query_as::<_, KeyRow>(
            r#"
            SELECT id, key_type, version, wrapped_secret, fingerprint, status,
                   created_at, activates_at, retires_at, retired_at
            FROM security_keys
            ORDER BY key_type, version
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_material(&self.master))
            .collect()
    }

    async fn insert_pending(&self, key: &KeyMaterial) -> Result<(), StoreError> {
        let secret = key
            .secret
            .as_ref()
            .ok_or_else(|| StoreError::Rejected("new key has no secret".into()))?;
        let wrapped = self
            .master
            .wrap(key.key_type, key.version, secret)
            .map_err(|err| StoreError::Rejected(err.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO security_keys(id, key_type, version, wrapped_secret, fingerprint, status, created_at, activates_at, retires_at, retired_at)
            VALUES($1,$2,$3,$4,$5,'pending',$6,$7,NULL,NULL)
            "#,
        )
        .bind(key.id)
        .bind(key.key_type.as_str())
        .bind(key.version as i32)
        .bind(wrapped)
        .bind(&key.fingerprint)
        .bind(key.created_at)
        .bind(key.activates_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit_transition(&self, transition: &KeyTransition) -> Result<(), StoreError> {
        let key_type = transition.key_type;
        let mut tx = self.pool.begin().await?;

        if let Some(demotion) = transition.demote {
            let result = sqlx::query(
                "UPDATE security_keys SET status = 'grace', retires_at = $3 WHERE key_type = $1 AND version = $2 AND status = 'active'",
            )
            .bind(key_type.as_str())
            .bind(demotion.version as i32)
            .bind(demotion.retires_at)
            .execute(&mut tx)
            .await?;
            if result.rows_affected() != 1 {
                return Err(StoreError::Rejected(format!(
                    "{key_type} version {} is no longer active",
                    demotion.version
                )));
            }
        }

        let result = sqlx::query(
            "UPDATE security_keys SET status = 'active', activates_at = $3 WHERE key_type = $1 AND version = $2 AND status = 'pending'",
        )
        .bind(key_type.as_str())
        .bind(transition.activate_version as i32)
        .bind(transition.activated_at)
        .execute(&mut tx)
        .await?;
        if result.rows_affected() != 1 {
            return Err(StoreError::Rejected(format!(
                "{key_type} version {} is not pending",
                transition.activate_version
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn retire(
        &self,
        key_type: KeyType,
        version: u32,
        retired_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE security_keys SET status = 'retired', retired_at = $3, wrapped_secret = NULL WHERE key_type = $1 AND version = $2",
        )
        .bind(key_type.as_str())
        .bind(version as i32)
        .bind(retired_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_job(&self, job: &RotationJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO rotation_jobs(id, key_type, priority, reason, force, requested_at, status, attempts, started_at, finished_at, last_error, rotated_version)
            VALUES($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                attempts = EXCLUDED.attempts,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at,
                last_error = EXCLUDED.last_error,
                rotated_version = EXCLUDED.rotated_version
            "#,
        )
        .bind(job.id)
        .bind(job.key_type.as_str())
        .bind(job.priority.as_str())
        .bind(&job.reason)
        .bind(job.force)
        .bind(job.requested_at)
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.last_error)
        .bind(job.rotated_version.map(|version| version as i32))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_jobs(&self, limit: i64) -> Result<Vec<RotationJob>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, key_type, priority, reason, force, requested_at, status, attempts,
                   started_at, finished_at, last_error, rotated_version
            FROM rotation_jobs
            ORDER BY requested_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RotationJob::try_from).collect()
    }
}

#[derive(Default)]
struct MemoryState {
    keys: Vec<KeyMaterial>,
    jobs: Vec<RotationJob>,
}

/// In-process key store enforcing the same uniqueness rules as the Postgres schema.
#[derive(Default)]
pub struct MemoryKeyStore {
    state: RwLock<MemoryState>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn list_keys(&self) -> Result<Vec<KeyMaterial>, StoreError> {
        let mut keys = self.state.read().await.keys.clone();
        keys.sort_by_key(|key| (key.key_type, key.version));
        Ok(keys)
    }

    async fn insert_pending(&self, key: &KeyMaterial) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state
            .keys
            .iter()
            .any(|existing| existing.key_type == key.key_type && existing.version == key.version)
        {
            return Err(StoreError::Rejected(format!(
                "{} version {} already exists",
                key.key_type, key.version
            )));
        }
        let mut pending = key.clone();
        pending.status = KeyStatus::Pending;
        pending.retires_at = None;
        pending.retired_at = None;
        state.keys.push(pending);
        Ok(())
    }

    async fn commit_transition(&self, transition: &KeyTransition) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let key_type = transition.key_type;

        let position = |status: KeyStatus, version: Option<u32>| {
            state.keys.iter().position(|existing| {
                existing.key_type == key_type
                    && existing.status == status
                    && version.map_or(true, |version| existing.version == version)
            })
        };

        let pending = position(KeyStatus::Pending, Some(transition.activate_version)).ok_or_else(
            || {
                StoreError::Rejected(format!(
                    "{key_type} version {} is not pending",
                    transition.activate_version
                ))
            },
        )?;
        let demoted = match transition.demote {
            Some(demotion) => Some(
                position(KeyStatus::Active, Some(demotion.version))
                    .map(|index| (index, demotion.retires_at))
                    .ok_or_else(|| {
                        StoreError::Rejected(format!(
                            "{key_type} version {} is no longer active",
                            demotion.version
                        ))
                    })?,
            ),
            None => {
                if position(KeyStatus::Active, None).is_some() {
                    return Err(StoreError::Rejected(format!(
                        "{key_type} already has an active key"
                    )));
                }
                None
            }
        };

        if let Some((index, retires_at)) = demoted {
            let previous = &mut state.keys[index];
            previous.status = KeyStatus::Grace;
            previous.retires_at = Some(retires_at);
        }
        let promoted = &mut state.keys[pending];
        promoted.status = KeyStatus::Active;
        promoted.activates_at = transition.activated_at;
        Ok(())
    }

    async fn retire(
        &self,
        key_type: KeyType,
        version: u32,
        retired_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(key) = state
            .keys
            .iter_mut()
            .find(|key| key.key_type == key_type && key.version == version)
        {
            key.status = KeyStatus::Retired;
            key.retired_at = Some(retired_at);
            key.secret = None;
        }
        Ok(())
    }

    async fn upsert_job(&self, job: &RotationJob) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        match state.jobs.iter_mut().find(|existing| existing.id == job.id) {
            Some(existing) => *existing = job.clone(),
            None => state.jobs.push(job.clone()),
        }
        Ok(())
    }

    async fn recent_jobs(&self, limit: i64) -> Result<Vec<RotationJob>, StoreError> {
        let mut jobs = self.state.read().await.jobs.clone();
        jobs.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::crypto::SecretKey;
    use chrono::Duration;

    fn key(version: u32, status: KeyStatus) -> KeyMaterial {
        let secret = SecretKey::generate();
        KeyMaterial {
            id: Uuid::new_v4(),
            key_type: KeyType::WebhookSigning,
            version,
            fingerprint: secret.fingerprint(),
            secret: Some(secret),
            status,
            created_at: Utc::now(),
            activates_at: Utc::now(),
            retires_at: None,
            retired_at: None,
        }
    }

    fn promote(version: u32, demote: Option<Demotion>) -> KeyTransition {
        KeyTransition {
            key_type: KeyType::WebhookSigning,
            activate_version: version,
            activated_at: Utc::now(),
            demote,
        }
    }

    #[tokio::test]
    async fn memory_store_allows_one_active_key_per_type() {
        let store = MemoryKeyStore::new();
        store.insert_pending(&key(1, KeyStatus::Pending)).await.unwrap();
        store.commit_transition(&promote(1, None)).await.unwrap();

        store.insert_pending(&key(2, KeyStatus::Pending)).await.unwrap();
        assert!(store.commit_transition(&promote(2, None)).await.is_err());
        assert_eq!(store.list_keys().await.unwrap()[1].status, KeyStatus::Pending);

        let retires_at = Utc::now() + Duration::days(14);
        store
            .commit_transition(&promote(
                2,
                Some(Demotion {
                    version: 1,
                    retires_at,
                }),
            ))
            .await
            .unwrap();

        let keys = store.list_keys().await.unwrap();
        assert_eq!(keys[0].status, KeyStatus::Grace);
        assert_eq!(keys[0].retires_at, Some(retires_at));
        assert_eq!(keys[1].status, KeyStatus::Active);

        store.retire(KeyType::WebhookSigning, 1, Utc::now()).await.unwrap();
        let retired = &store.list_keys().await.unwrap()[0];
        assert_eq!(retired.status, KeyStatus::Retired);
        assert!(retired.secret.is_none());
    }

    #[tokio::test]
    async fn failed_promotion_leaves_both_versions_untouched() {
        let store = MemoryKeyStore::new();
        store.insert_pending(&key(1, KeyStatus::Pending)).await.unwrap();
        store.commit_transition(&promote(1, None)).await.unwrap();
        store.insert_pending(&key(2, KeyStatus::Pending)).await.unwrap();

        let stale = Demotion {
            version: 7,
            retires_at: Utc::now(),
        };
        assert!(store.commit_transition(&promote(2, Some(stale))).await.is_err());
        assert!(store.commit_transition(&promote(3, None)).await.is_err());

        let keys = store.list_keys().await.unwrap();
        assert_eq!(keys[0].status, KeyStatus::Active);
        assert_eq!(keys[1].status, KeyStatus::Pending);
        assert!(store.insert_pending(&key(2, KeyStatus::Pending)).await.is_err());
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL with Postgres server"]
    async fn pg_store_wraps_secrets_and_tracks_jobs(pool: PgPool) {
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = PgKeyStore::new(pool.clone(), MasterKey::new(SecretKey::generate()));

        let first = key(1, KeyStatus::Pending);
        store.insert_pending(&first).await.unwrap();
        store.commit_transition(&promote(1, None)).await.unwrap();

        let stored: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT wrapped_secret FROM security_keys WHERE key_type = 'webhook_signing' AND version = 1",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        let stored = stored.unwrap();
        assert_ne!(stored.as_slice(), first.secret.as_ref().unwrap().as_bytes());

        let loaded = store.list_keys().await.unwrap();
        assert_eq!(
            loaded[0].secret.as_ref().unwrap().fingerprint(),
            first.fingerprint
        );

        let mut job = RotationJob::new(
            KeyType::WebhookSigning,
            RotationPriority::High,
            "overdue",
            Utc::now(),
        );
        store.upsert_job(&job).await.unwrap();
        job.status = JobStatus::Completed;
        job.attempts = 1;
        store.upsert_job(&job).await.unwrap();
        let jobs = store.recent_jobs(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Completed);
    }
}
