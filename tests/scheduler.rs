use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use guardrail::audit::{AuditAction, MemoryAuditSink};
use guardrail::config::{RotationConfig, SchedulerConfig};
use guardrail::error::{RotationError, StoreError};
use guardrail::keys::{
    EncryptedRecord, JobStatus, KeyRotationService, KeyType, MemoryKeyStore, MemoryRecordStore,
    RecordStore, RotationJob, RotationPriority,
};
use guardrail::retry::RetryPolicy;
use guardrail::scheduler::{ConcurrencyGate, MemoryConcurrencyGate, RotationScheduler};

/// Record store whose writes can fail, or park until the test hands out a permit.
struct SwitchableRecords {
    inner: MemoryRecordStore,
    writes_down: AtomicBool,
    writes_held: AtomicBool,
    permits: Semaphore,
}

impl Default for SwitchableRecords {
    fn default() -> Self {
        Self {
            inner: MemoryRecordStore::new(),
            writes_down: AtomicBool::new(false),
            writes_held: AtomicBool::new(false),
            permits: Semaphore::new(0),
        }
    }
}

impl SwitchableRecords {
    fn hold_writes(&self) {
        self.writes_held.store(true, Ordering::SeqCst);
    }

    /// Lets parked and future writes through.
    fn release_writes(&self) {
        self.writes_held.store(false, Ordering::SeqCst);
        self.permits.close();
    }
}

#[async_trait]
impl RecordStore for SwitchableRecords {
    async fn insert(&self, record: &EncryptedRecord) -> Result<(), StoreError> {
        self.inner.insert(record).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<EncryptedRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn fetch_batch(
        &self,
        key_type: KeyType,
        version: u32,
        limit: usize,
    ) -> Result<Vec<EncryptedRecord>, StoreError> {
        self.inner.fetch_batch(key_type, version, limit).await
    }

    async fn replace_batch(
        &self,
        from_version: u32,
        records: &[EncryptedRecord],
    ) -> Result<u64, StoreError> {
        if self.writes_held.load(Ordering::SeqCst) {
            let _ = self.permits.acquire().await;
        }
        if self.writes_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("primary unreachable".into()));
        }
        self.inner.replace_batch(from_version, records).await
    }

    async fn count_on_version(&self, key_type: KeyType, version: u32) -> Result<u64, StoreError> {
        self.inner.count_on_version(key_type, version).await
    }
}

/// Grants a fixed number of acquisitions, then reports every slot taken, as when a lease
/// lapsed and another instance claimed the slot.
struct ExpiringGate {
    inner: MemoryConcurrencyGate,
    grants_left: AtomicU32,
}

#[async_trait]
impl ConcurrencyGate for ExpiringGate {
    async fn try_acquire(
        &self,
        holder: &str,
        capacity: u32,
        ttl: StdDuration,
    ) -> Result<bool, StoreError> {
        if self
            .grants_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_err()
        {
            return Ok(false);
        }
        self.inner.try_acquire(holder, capacity, ttl).await
    }

    async fn release(&self, holder: &str) -> Result<(), StoreError> {
        self.inner.release(holder).await
    }

    async fn in_use(&self) -> Result<u32, StoreError> {
        self.inner.in_use().await
    }
}

/// Gate whose grants wait until the test releases them.
struct SlowGate {
    inner: MemoryConcurrencyGate,
    entered: Notify,
    release: Semaphore,
}

impl Default for SlowGate {
    fn default() -> Self {
        Self {
            inner: MemoryConcurrencyGate::new(),
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl ConcurrencyGate for SlowGate {
    async fn try_acquire(
        &self,
        holder: &str,
        capacity: u32,
        ttl: StdDuration,
    ) -> Result<bool, StoreError> {
        self.entered.notify_one();
        let _permit = self
            .release
            .acquire()
            .await
            .map_err(|_| StoreError::Unavailable("gate closed".into()))?;
        self.inner.try_acquire(holder, capacity, ttl).await
    }

    async fn release(&self, holder: &str) -> Result<(), StoreError> {
        self.inner.release(holder).await
    }

    async fn in_use(&self) -> Result<u32, StoreError> {
        self.inner.in_use().await
    }
}

struct Harness {
    keys: Arc<KeyRotationService>,
    records: Arc<SwitchableRecords>,
    gate: Arc<dyn ConcurrencyGate>,
    audit: Arc<MemoryAuditSink>,
    scheduler: Arc<RotationScheduler>,
}

fn harness(max_concurrent: u32) -> Harness {
    harness_with(
        max_concurrent,
        Arc::new(MemoryConcurrencyGate::new()),
        StdDuration::from_secs(1800),
    )
}

fn harness_with(
    max_concurrent: u32,
    gate: Arc<dyn ConcurrencyGate>,
    lease_ttl: StdDuration,
) -> Harness {
    let audit = Arc::new(MemoryAuditSink::new());
    let records = Arc::new(SwitchableRecords::default());
    let keys = Arc::new(KeyRotationService::new(
        Arc::new(MemoryKeyStore::new()),
        records.clone(),
        audit.clone(),
        RotationConfig {
            migration_retry: RetryPolicy::new(1, StdDuration::from_millis(1)),
            ..RotationConfig::default()
        },
    ));
    let scheduler = Arc::new(RotationScheduler::new(
        keys.clone(),
        gate.clone(),
        audit.clone(),
        SchedulerConfig {
            max_concurrent,
            job_retry: RetryPolicy::new(2, StdDuration::from_millis(1)),
            lease_ttl,
            ..SchedulerConfig::default()
        },
    ));
    Harness {
        keys,
        records,
        gate,
        audit,
        scheduler,
    }
}

async fn seal_record(h: &Harness, key_type: KeyType, plaintext: &[u8]) -> Uuid {
    let ciphertext = h.keys.encrypt(key_type, plaintext).await.unwrap();
    let record = EncryptedRecord {
        id: Uuid::new_v4(),
        key_type,
        key_version: 1,
        ciphertext,
    };
    h.records.insert(&record).await.unwrap();
    record.id
}

/// `days_ago` days before today at `hour`:00 UTC.
fn at_hour(days_ago: i64, hour: u32) -> DateTime<Utc> {
    let day = (Utc::now() - Duration::days(days_ago)).date_naive();
    Utc.from_utc_datetime(&day.and_hms_opt(hour, 0, 0).unwrap())
}

#[tokio::test]
async fn severely_overdue_key_rotates_outside_the_maintenance_window() {
    let h = harness(2);
    let start = at_hour(46, 12);
    h.keys.ensure_initialized(start).await.unwrap();

    // 46 days into a 30 day interval, at noon.
    let now = start + Duration::days(46);
    let report = h.scheduler.process_tick(now).await.unwrap();
    assert!(!report.in_maintenance_window);
    assert_eq!(report.enqueued, vec![KeyType::JwtSigning]);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].key_type, KeyType::JwtSigning);
    assert_eq!(report.outcomes[0].status, JobStatus::Migrating);

    let settled = h.scheduler.wait_for_migrations(now).await;
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].status, JobStatus::Completed);

    let active = h.keys.active_key(KeyType::JwtSigning).await.unwrap().unwrap();
    assert_eq!(active.version, 2);
    assert_eq!(h.audit.count(AuditAction::RotationQueued).await, 1);
    assert_eq!(h.audit.count(AuditAction::RotationCompleted).await, 1);
}

#[tokio::test]
async fn due_key_waits_for_the_maintenance_window() {
    let h = harness(2);
    let start = at_hour(40, 12);
    h.keys.ensure_initialized(start).await.unwrap();

    let midday = start + Duration::days(31);
    let report = h.scheduler.process_tick(midday).await.unwrap();
    assert_eq!(report.enqueued, vec![KeyType::JwtSigning]);
    assert!(report.outcomes.is_empty());
    assert_eq!(report.deferred, vec![KeyType::JwtSigning]);

    let early_morning = start + Duration::days(32) - Duration::hours(9);
    let report = h.scheduler.process_tick(early_morning).await.unwrap();
    assert!(report.in_maintenance_window);
    assert!(report.enqueued.is_empty());
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].status, JobStatus::Migrating);
    let settled = h.scheduler.wait_for_migrations(early_morning).await;
    assert_eq!(settled[0].status, JobStatus::Completed);
}

#[tokio::test]
async fn concurrency_cap_limits_parallel_rotations() {
    let h = harness(1);
    let start = at_hour(1, 12);
    h.keys.ensure_initialized(start).await.unwrap();

    h.scheduler
        .request_rotation(KeyType::JwtSigning, RotationPriority::Emergency, "leak", true)
        .await
        .unwrap();
    h.scheduler
        .request_rotation(KeyType::WebhookSigning, RotationPriority::Emergency, "leak", true)
        .await
        .unwrap();

    let now = Utc::now();
    let first = h.scheduler.process_tick(now).await.unwrap();
    assert_eq!(first.outcomes.len(), 1);
    assert_eq!(first.waiting_for_slot.len(), 1);
    // The migration keeps the slot until it finishes.
    h.scheduler.wait_for_migrations(now).await;

    let second = h.scheduler.process_tick(now + Duration::seconds(1)).await.unwrap();
    assert_eq!(second.outcomes.len(), 1);
    assert_ne!(first.outcomes[0].key_type, second.outcomes[0].key_type);
    h.scheduler.wait_for_migrations(now + Duration::seconds(1)).await;
    assert_eq!(h.gate.in_use().await.unwrap(), 0);
}

#[tokio::test]
async fn slot_held_by_another_instance_blocks_dispatch() {
    let h = harness(1);
    h.keys.ensure_initialized(at_hour(1, 12)).await.unwrap();
    assert!(h
        .gate
        .try_acquire("other-instance:job", 1, StdDuration::from_secs(60))
        .await
        .unwrap());

    h.scheduler
        .request_rotation(KeyType::TokenEncryption, RotationPriority::High, "audit finding", true)
        .await
        .unwrap();
    let now = Utc::now();
    let blocked = h.scheduler.process_tick(now).await.unwrap();
    assert!(blocked.outcomes.is_empty());
    assert_eq!(blocked.waiting_for_slot, vec![KeyType::TokenEncryption]);

    h.gate.release("other-instance:job").await.unwrap();
    let report = h.scheduler.process_tick(now + Duration::seconds(1)).await.unwrap();
    assert_eq!(report.outcomes.len(), 1);
    let settled = h.scheduler.wait_for_migrations(now + Duration::seconds(1)).await;
    assert_eq!(settled[0].status, JobStatus::Completed);
}

#[tokio::test]
async fn repeated_failures_escalate_and_later_attempts_resume_migration() {
    let h = harness(2);
    let start = at_hour(46, 12);
    h.keys.ensure_initialized(start).await.unwrap();
    seal_record(&h, KeyType::JwtSigning, b"claims").await;
    h.records.writes_down.store(true, Ordering::SeqCst);

    let now = start + Duration::days(46);
    h.scheduler.process_tick(now).await.unwrap();
    let first = h.scheduler.wait_for_migrations(now).await;
    assert_eq!(first[0].status, JobStatus::Queued);
    assert!(!first[0].escalated);

    let later = now + Duration::seconds(1);
    let second = h.scheduler.process_tick(later).await.unwrap();
    assert_eq!(second.outcomes.len(), 1);
    assert_eq!(second.outcomes[0].status, JobStatus::Migrating);
    let second = h.scheduler.wait_for_migrations(later).await;
    assert_eq!(second[0].status, JobStatus::Failed);
    assert_eq!(second[0].attempts, 2);
    assert!(second[0].escalated);

    // Retried attempts resumed the migration instead of minting another version.
    let active = h.keys.active_key(KeyType::JwtSigning).await.unwrap().unwrap();
    assert_eq!(active.version, 2);
    assert_eq!(h.audit.count(AuditAction::RotationFailed).await, 1);
    assert_eq!(h.audit.count(AuditAction::RotationEscalated).await, 1);

    let status = h.scheduler.status().await.unwrap();
    assert_eq!(status.escalated.len(), 1);
    assert_eq!(status.escalated[0].rotated_version, Some(2));

    let third = h.scheduler.process_tick(now + Duration::seconds(2)).await.unwrap();
    assert!(third.outcomes.is_empty());
}

#[tokio::test]
async fn paused_scheduler_still_retires_but_does_not_rotate() {
    let h = harness(2);
    let start = at_hour(46, 12);
    h.keys.ensure_initialized(start).await.unwrap();

    h.scheduler.pause("ops@example.com").await;
    let report = h.scheduler.process_tick(start + Duration::days(46)).await.unwrap();
    assert!(report.paused);
    assert!(report.enqueued.is_empty());
    assert!(report.outcomes.is_empty());

    h.scheduler.resume("ops@example.com").await;
    let report = h
        .scheduler
        .process_tick(start + Duration::days(46) + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(h.audit.count(AuditAction::SchedulerPaused).await, 1);
    assert_eq!(h.audit.count(AuditAction::SchedulerResumed).await, 1);
}

#[tokio::test]
async fn scheduler_starts_once_and_shuts_down() {
    let h = harness(2);
    h.keys.ensure_initialized(Utc::now()).await.unwrap();

    let handle = h.scheduler.spawn().unwrap();
    assert!(h.scheduler.spawn().is_err());
    handle.shutdown().await;

    let handle = h.scheduler.spawn().unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn tick_returns_while_records_are_still_migrating() {
    let h = harness(2);
    let start = at_hour(46, 12);
    h.keys.ensure_initialized(start).await.unwrap();
    let id = seal_record(&h, KeyType::JwtSigning, b"claims").await;
    h.records.hold_writes();

    let now = start + Duration::days(46);
    let report = tokio::time::timeout(StdDuration::from_secs(5), h.scheduler.process_tick(now))
        .await
        .expect("tick must not wait for the migration")
        .unwrap();
    assert_eq!(report.outcomes[0].status, JobStatus::Migrating);

    // The flip is visible while the record still sits on the old version.
    let active = h.keys.active_key(KeyType::JwtSigning).await.unwrap().unwrap();
    assert_eq!(active.version, 2);
    assert_eq!(h.records.get(id).await.unwrap().unwrap().key_version, 1);
    let status = h.scheduler.status().await.unwrap();
    assert_eq!(status.migrating, vec![KeyType::JwtSigning]);
    assert_eq!(status.slots_in_use, Some(1));

    // A tick in the meantime neither settles nor restarts the job.
    let busy = h.scheduler.process_tick(now + Duration::seconds(1)).await.unwrap();
    assert!(busy.outcomes.is_empty());
    assert!(busy.enqueued.is_empty());

    h.records.release_writes();
    let settled = h.scheduler.wait_for_migrations(now).await;
    assert_eq!(settled[0].status, JobStatus::Completed);
    assert_eq!(h.records.get(id).await.unwrap().unwrap().key_version, 2);
    assert_eq!(h.gate.in_use().await.unwrap(), 0);
    assert!(h.scheduler.status().await.unwrap().migrating.is_empty());
}

#[tokio::test]
async fn corrupt_record_escalates_on_the_first_attempt() {
    let h = harness(2);
    let start = at_hour(46, 12);
    h.keys.ensure_initialized(start).await.unwrap();
    let mut ciphertext = h.keys.encrypt(KeyType::JwtSigning, b"claims").await.unwrap();
    let last = ciphertext.len() - 1;
    ciphertext[last] ^= 0xff;
    h.records
        .insert(&EncryptedRecord {
            id: Uuid::new_v4(),
            key_type: KeyType::JwtSigning,
            key_version: 1,
            ciphertext,
        })
        .await
        .unwrap();

    let now = start + Duration::days(46);
    h.scheduler.process_tick(now).await.unwrap();
    let settled = h.scheduler.wait_for_migrations(now).await;
    assert_eq!(settled[0].status, JobStatus::Failed);
    assert_eq!(settled[0].attempts, 1);
    assert!(settled[0].escalated);
    assert_eq!(h.audit.count(AuditAction::RotationFailed).await, 0);
    assert_eq!(h.audit.count(AuditAction::RotationEscalated).await, 1);
}

#[tokio::test]
async fn lost_lease_stops_the_migration_and_retries() {
    let gate = Arc::new(ExpiringGate {
        inner: MemoryConcurrencyGate::new(),
        grants_left: AtomicU32::new(1),
    });
    let h = harness_with(1, gate, StdDuration::from_millis(30));
    let start = at_hour(46, 12);
    h.keys.ensure_initialized(start).await.unwrap();
    seal_record(&h, KeyType::JwtSigning, b"claims").await;
    h.records.hold_writes();

    let now = start + Duration::days(46);
    let report = h.scheduler.process_tick(now).await.unwrap();
    assert_eq!(report.outcomes[0].status, JobStatus::Migrating);

    // Several renewals fail while the first batch is parked.
    tokio::time::sleep(StdDuration::from_millis(80)).await;
    h.records.release_writes();

    let settled = h.scheduler.wait_for_migrations(now).await;
    assert_eq!(settled[0].status, JobStatus::Queued);
    assert!(!settled[0].escalated);
    assert!(settled[0].error.as_deref().unwrap().contains("lease"));
    // The batch in flight still committed; nothing after it ran.
    assert_eq!(
        h.records
            .count_on_version(KeyType::JwtSigning, 1)
            .await
            .unwrap(),
        0
    );
    assert_eq!(h.audit.count(AuditAction::RotationCompleted).await, 0);
}

#[tokio::test]
async fn grace_key_retires_through_the_scheduler() {
    let h = harness(2);
    let start = Utc::now();
    h.keys.ensure_initialized(start).await.unwrap();
    let sealed_v1 = h
        .keys
        .encrypt(KeyType::TokenEncryption, b"oauth-refresh-token")
        .await
        .unwrap();

    h.scheduler
        .request_rotation(KeyType::TokenEncryption, RotationPriority::Emergency, "leak", true)
        .await
        .unwrap();
    let rotated_at = Utc::now();
    h.scheduler.process_tick(rotated_at).await.unwrap();
    h.scheduler.wait_for_migrations(rotated_at).await;

    let day_29 = rotated_at + Duration::days(29);
    let report = h.scheduler.process_tick(day_29).await.unwrap();
    assert!(report.retired.is_empty());
    assert_eq!(
        h.keys
            .decrypt_at(KeyType::TokenEncryption, &sealed_v1, day_29)
            .await
            .unwrap(),
        b"oauth-refresh-token"
    );

    let day_31 = rotated_at + Duration::days(31);
    let report = h.scheduler.process_tick(day_31).await.unwrap();
    assert!(report.retired.contains(&(KeyType::TokenEncryption, 1)));
    let err = h
        .keys
        .decrypt_at(KeyType::TokenEncryption, &sealed_v1, day_31)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RotationError::KeyUnavailable {
            key_type: KeyType::TokenEncryption,
            version: 1
        }
    ));
    h.scheduler.wait_for_migrations(day_31).await;
}

#[tokio::test]
async fn migration_interrupted_by_a_restart_resumes() {
    let h = harness(2);
    let start = Utc::now();
    h.keys.ensure_initialized(start).await.unwrap();
    let id = seal_record(&h, KeyType::WebhookSigning, b"payload").await;

    // A previous process committed the flip and died mid-migration.
    let rotation = h
        .keys
        .rotate_at(KeyType::WebhookSigning, true, "leak", start)
        .await
        .unwrap();
    let mut job = RotationJob::new(
        KeyType::WebhookSigning,
        RotationPriority::Emergency,
        "leak",
        start,
    );
    job.status = JobStatus::Migrating;
    job.attempts = 1;
    job.rotated_version = Some(rotation.new_version);
    h.keys.record_job(&job).await.unwrap();

    assert_eq!(h.scheduler.recover_interrupted().await, 1);
    let now = Utc::now();
    let report = h.scheduler.process_tick(now).await.unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].job_id, job.id);
    let settled = h.scheduler.wait_for_migrations(now).await;
    assert_eq!(settled[0].status, JobStatus::Completed);
    assert_eq!(settled[0].attempts, 2);
    assert_eq!(h.records.get(id).await.unwrap().unwrap().key_version, 2);

    // Only one version was ever minted for the job.
    let active = h.keys.active_key(KeyType::WebhookSigning).await.unwrap().unwrap();
    assert_eq!(active.version, 2);
}

#[tokio::test]
async fn slow_gate_does_not_block_status_or_requests() {
    let gate = Arc::new(SlowGate::default());
    let h = harness_with(2, gate.clone(), StdDuration::from_secs(1800));
    let start = at_hour(46, 12);
    h.keys.ensure_initialized(start).await.unwrap();
    let now = start + Duration::days(46);

    let scheduler = h.scheduler.clone();
    let tick = tokio::spawn(async move { scheduler.process_tick(now).await });
    gate.entered.notified().await;

    let status = tokio::time::timeout(StdDuration::from_secs(1), h.scheduler.status())
        .await
        .expect("status waited on the gate")
        .unwrap();
    assert_eq!(status.running, vec![KeyType::JwtSigning]);

    let duplicate = tokio::time::timeout(
        StdDuration::from_secs(1),
        h.scheduler
            .request_rotation(KeyType::JwtSigning, RotationPriority::Normal, "again", false),
    )
    .await
    .expect("request waited on the gate")
    .unwrap();
    assert!(duplicate.is_none());

    gate.release.add_permits(8);
    let report = tick.await.unwrap().unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].status, JobStatus::Migrating);
    let settled = h.scheduler.wait_for_migrations(now).await;
    assert_eq!(settled[0].status, JobStatus::Completed);
}
