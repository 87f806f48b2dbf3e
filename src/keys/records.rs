use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;

use super::models::KeyType;

/// key: encrypted-record
/// Application data sealed under one version of a key type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedRecord {
    pub id: Uuid,
    pub key_type: KeyType,
    pub key_version: u32,
    pub ciphertext: Vec<u8>,
}

/// Version-tagged ciphertext that key rotation re-encrypts in batches.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, record: &EncryptedRecord) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<EncryptedRecord>, StoreError>;

    /// Up to `limit` records still sealed under `version`, ordered by id.
    async fn fetch_batch(
        &self,
        key_type: KeyType,
        version: u32,
        limit: usize,
    ) -> Result<Vec<EncryptedRecord>, StoreError>;

    /// Writes re-sealed records as one unit. A row only changes if it is still on
    /// `from_version`, so concurrent writers under the new key are never overwritten.
    async fn replace_batch(
        &self,
        from_version: u32,
        records: &[EncryptedRecord],
    ) -> Result<u64, StoreError>;

    async fn count_on_version(&self, key_type: KeyType, version: u32) -> Result<u64, StoreError>;
}

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct EncryptedRecordRow {
    id: Uuid,
    key_type: String,
    key_version: i32,
    ciphertext: Vec<u8>,
}

impl TryFrom<EncryptedRecordRow> for EncryptedRecord {
    type Error = StoreError;

    fn try_from(row: EncryptedRecordRow) -> Result<Self, Self::Error> {
        let key_type = KeyType::from_str(&row.key_type).ok_or_else(|| {
            StoreError::Rejected(format!("unknown key type on record {}: {}", row.id, row.key_type))
        })?;
        Ok(EncryptedRecord {
            id: row.id,
            key_type,
            key_version: row.key_version as u32,
            ciphertext: row.ciphertext,
        })
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn insert(&self, record: &EncryptedRecord) -> Result<(), StoreError> {
        let now: DateTime<Utc> = Utc::now();
        sqlx::query(
            "INSERT INTO encrypted_records(id, key_type, key_version, ciphertext, updated_at) VALUES($1,$2,$3,$4,$5)",
        )
        .bind(record.id)
        .bind(record.key_type.as_str())
        .bind(record.key_version as i32)
        .bind(&record.ciphertext)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<EncryptedRecord>, StoreError> {
        let row = sqlx::query_as::<_, EncryptedRecordRow>(
            "SELECT id, key_type, key_version, ciphertext FROM encrypted_records WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(EncryptedRecord::try_from).transpose()
    }

    async fn fetch_batch(
        &self,
        key_type: KeyType,
        version: u32,
        limit: usize,
    ) -> Result<Vec<EncryptedRecord>, StoreError> {
        let rows = sqlx::query_as::<_, EncryptedRecordRow>(
            "SELECT id, key_type, key_version, ciphertext FROM encrypted_records WHERE key_type = $1 AND key_version = $2 ORDER BY id LIMIT $3",
        )
        .bind(key_type.as_str())
        .bind(version as i32)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EncryptedRecord::try_from).collect()
    }

    async fn replace_batch(
        &self,
        from_version: u32,
        records: &[EncryptedRecord],
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::new(
            "UPDATE encrypted_records AS r SET key_version = v.key_version, ciphertext = v.ciphertext, updated_at = now() FROM (",
        );
        builder.push_values(records, |mut row, record| {
            row.push_bind(record.id)
                .push_bind(record.key_version as i32)
                .push_bind(&record.ciphertext);
        });
        builder.push(") AS v(id, key_version, ciphertext) WHERE r.id = v.id AND r.key_version = ");
        builder.push_bind(from_version as i32);

        let mut tx = self.pool.begin().await?;
        let result = builder.build().execute(&mut tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn count_on_version(&self, key_type: KeyType, version: u32) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM encrypted_records WHERE key_type = $1 AND key_version = $2",
        )
        .bind(key_type.as_str())
        .bind(version as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}

/// In-process record store used by tests and single-node deployments.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<Uuid, EncryptedRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: &EncryptedRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::Rejected(format!("record {} already exists", record.id)));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<EncryptedRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn fetch_batch(
        &self,
        key_type: KeyType,
        version: u32,
        limit: usize,
    ) -> Result<Vec<EncryptedRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.key_type == key_type && record.key_version == version)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replace_batch(
        &self,
        from_version: u32,
        records: &[EncryptedRecord],
    ) -> Result<u64, StoreError> {
        let mut stored = self.records.write().await;
        let mut updated = 0;
        for record in records {
            if let Some(existing) = stored.get_mut(&record.id) {
                if existing.key_version == from_version {
                    *existing = record.clone();
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn count_on_version(&self, key_type: KeyType, version: u32) -> Result<u64, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.key_type == key_type && record.key_version == version)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: u32) -> EncryptedRecord {
        EncryptedRecord {
            id: Uuid::new_v4(),
            key_type: KeyType::TokenEncryption,
            key_version: version,
            ciphertext: vec![version as u8; 4],
        }
    }

    #[tokio::test]
    async fn replace_skips_rows_already_moved() {
        let store = MemoryRecordStore::new();
        let stale = record(1);
        let moved = record(2);
        store.insert(&stale).await.unwrap();
        store.insert(&moved).await.unwrap();

        let rewrites = vec![
            EncryptedRecord {
                key_version: 3,
                ..stale.clone()
            },
            EncryptedRecord {
                key_version: 3,
                ..moved.clone()
            },
        ];
        assert_eq!(store.replace_batch(1, &rewrites).await.unwrap(), 1);
        assert_eq!(store.get(stale.id).await.unwrap().unwrap().key_version, 3);
        assert_eq!(store.get(moved.id).await.unwrap().unwrap().key_version, 2);
        assert_eq!(store.count_on_version(KeyType::TokenEncryption, 1).await.unwrap(), 0);
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL with Postgres server"]
    async fn pg_records_move_between_versions(pool: PgPool) {
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = PgRecordStore::new(pool);
        let first = record(1);
        store.insert(&first).await.unwrap();

        let batch = store.fetch_batch(KeyType::TokenEncryption, 1, 10).await.unwrap();
        assert_eq!(batch, vec![first.clone()]);

        let rewritten = EncryptedRecord {
            key_version: 2,
            ciphertext: vec![9; 4],
            ..first.clone()
        };
        assert_eq!(store.replace_batch(1, &[rewritten.clone()]).await.unwrap(), 1);
        assert_eq!(store.get(first.id).await.unwrap(), Some(rewritten));
    }
}
