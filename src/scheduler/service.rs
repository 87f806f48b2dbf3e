use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{
    key_subject, record_best_effort, AuditAction, AuditEvent, AuditOutcome, AuditSink,
    SCHEDULER_SUBJECT,
};
use crate::config::{KeyTypePolicy, SchedulerConfig};
use crate::error::{RotationError, StoreError};
use crate::keys::migration::MigrationReport;
use crate::keys::models::{JobStatus, KeyType, RotationJob, RotationPriority};
use crate::keys::service::{KeyRotationService, KeyTypeStatus};

use super::gate::ConcurrencyGate;
use super::queue::RotationQueue;

/// Where a key type stands against its rotation interval.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    OnTime,
    Due,
    /// Older than `severe_overdue_ratio` times the interval.
    SeverelyOverdue,
    /// No active key at all.
    Missing,
}

impl Urgency {
    pub fn priority(&self) -> Option<RotationPriority> {
        match self {
            Urgency::OnTime => None,
            Urgency::Due => Some(RotationPriority::Normal),
            Urgency::SeverelyOverdue => Some(RotationPriority::High),
            Urgency::Missing => Some(RotationPriority::Emergency),
        }
    }
}

/// key: rotation-scheduler -> classification
pub fn classify(
    active_since: Option<DateTime<Utc>>,
    policy: &KeyTypePolicy,
    now: DateTime<Utc>,
    severe_overdue_ratio: f64,
) -> Urgency {
    let Some(active_since) = active_since else {
        return Urgency::Missing;
    };
    let age = now - active_since;
    if age < policy.interval {
        return Urgency::OnTime;
    }
    let severe_after_ms = (policy.interval.num_milliseconds() as f64 * severe_overdue_ratio) as i64;
    if age > Duration::milliseconds(severe_after_ms) {
        Urgency::SeverelyOverdue
    } else {
        Urgency::Due
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Assessment {
    pub key_type: KeyType,
    pub urgency: Urgency,
    pub age_days: Option<i64>,
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub key_type: KeyType,
    pub status: JobStatus,
    pub attempts: u32,
    pub escalated: bool,
    pub error: Option<String>,
}

/// Ledger rows scanned at start-up for migrations interrupted by a restart.
const RECOVERY_SCAN: i64 = 200;

/// key: rotation-scheduler -> tick report
#[derive(Clone, Debug, Serialize)]
pub struct TickReport {
    pub at: DateTime<Utc>,
    pub paused: bool,
    pub in_maintenance_window: bool,
    pub assessments: Vec<Assessment>,
    pub enqueued: Vec<KeyType>,
    pub outcomes: Vec<JobOutcome>,
    /// Normal-priority jobs held back until the maintenance window opens.
    pub deferred: Vec<KeyType>,
    /// Jobs ready to run but blocked by the concurrency cap.
    pub waiting_for_slot: Vec<KeyType>,
    pub retired: Vec<(KeyType, u32)>,
}

impl TickReport {
    fn new(at: DateTime<Utc>, paused: bool, in_maintenance_window: bool) -> Self {
        Self {
            at,
            paused,
            in_maintenance_window,
            assessments: Vec::new(),
            enqueued: Vec::new(),
            outcomes: Vec::new(),
            deferred: Vec::new(),
            waiting_for_slot: Vec::new(),
            retired: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SchedulerStatus {
    pub started: bool,
    pub paused: bool,
    pub instance_id: String,
    pub in_maintenance_window: bool,
    pub max_concurrent: u32,
    pub slots_in_use: Option<u32>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub queued: Vec<RotationJob>,
    pub running: Vec<KeyType>,
    /// Key types whose flip committed and whose records are still moving.
    pub migrating: Vec<KeyType>,
    pub escalated: Vec<RotationJob>,
    pub keys: Vec<KeyTypeStatus>,
}

#[derive(Debug, Error)]
#[error("rotation scheduler already started")]
pub struct AlreadyStarted;

struct InFlight {
    job: RotationJob,
    task: JoinHandle<Result<MigrationReport, RotationError>>,
}

#[derive(Default)]
struct SchedulerState {
    queue: RotationQueue,
    /// Key types with a job past dispatch, including those still migrating.
    running: HashSet<KeyType>,
    migrations: HashMap<KeyType, InFlight>,
    /// Jobs that exhausted retries; their key type is skipped until an operator acts.
    escalated: BTreeMap<KeyType, RotationJob>,
    last_tick_at: Option<DateTime<Utc>>,
}

/// key: rotation-scheduler
/// Process-wide rotation scheduler. Construct once, call [`spawn`](Self::spawn) once at
/// startup and [`SchedulerHandle::shutdown`] on exit. Instances coordinate only through
/// the shared [`ConcurrencyGate`]; in-process state covers this instance's queue.
pub struct RotationScheduler {
    keys: Arc<KeyRotationService>,
    gate: Arc<dyn ConcurrencyGate>,
    audit: Arc<dyn AuditSink>,
    config: SchedulerConfig,
    instance_id: String,
    state: Mutex<SchedulerState>,
    paused: AtomicBool,
    started: AtomicBool,
    wake: Arc<Notify>,
}

/// Owner of the background loop. Dropping it without `shutdown` leaves the loop running.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the loop after the tick in progress, if any, finishes.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            warn!(?err, "rotation scheduler task ended abnormally");
        }
    }
}

impl RotationScheduler {
    pub fn new(
        keys: Arc<KeyRotationService>,
        gate: Arc<dyn ConcurrencyGate>,
        audit: Arc<dyn AuditSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            keys,
            gate,
            audit,
            config,
            instance_id: Uuid::new_v4().to_string(),
            state: Mutex::new(SchedulerState::default()),
            paused: AtomicBool::new(false),
            started: AtomicBool::new(false),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// key: rotation-scheduler -> background loop
    pub fn spawn(self: &Arc<Self>) -> Result<SchedulerHandle, AlreadyStarted> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AlreadyStarted);
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let join = tokio::spawn(async move {
            let mut ticker = time::interval(scheduler.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                instance_id = %scheduler.instance_id,
                interval_secs = scheduler.config.check_interval.as_secs(),
                "rotation scheduler started"
            );
            scheduler.recover_interrupted().await;

            loop {
                let retry_in = scheduler.next_retry_in().await;
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = scheduler.wake.notified() => {}
                    _ = time::sleep(retry_in.unwrap_or(scheduler.config.check_interval)), if retry_in.is_some() => {}
                    _ = shutdown_rx.changed() => break,
                }

                if let Err(err) = scheduler.process_tick(Utc::now()).await {
                    warn!(?err, "rotation scheduler tick failed");
                }
            }

            scheduler.interrupt_migrations().await;
            scheduler.started.store(false, Ordering::SeqCst);
            info!(instance_id = %scheduler.instance_id, "rotation scheduler stopped");
        });

        Ok(SchedulerHandle { shutdown, join })
    }

    async fn next_retry_in(&self) -> Option<std::time::Duration> {
        let now = Utc::now();
        let at = self.state.lock().await.queue.next_retry_at(now)?;
        (at - now).to_std().ok()
    }

    /// key: rotation-scheduler -> tick handler
    /// One scheduling pass at `now`: settle finished migrations, retire expired grace keys,
    /// classify every key type, enqueue what is due, then start as many eligible jobs as the
    /// shared cap allows. Never waits for a migration.
    pub async fn process_tick(&self, now: DateTime<Utc>) -> Result<TickReport, RotationError> {
        let paused = self.is_paused();
        let in_window = self.config.maintenance_window.contains(now);
        let mut report = TickReport::new(now, paused, in_window);

        report.outcomes = self.collect_migrations(now, false).await;

        match self.keys.retire_expired(now).await {
            Ok(retired) => {
                report.retired = retired
                    .iter()
                    .map(|key| (key.key_type, key.version))
                    .collect();
            }
            Err(err) => warn!(?err, "grace key retirement sweep failed"),
        }

        self.state.lock().await.last_tick_at = Some(now);
        if paused {
            debug!("rotation scheduler paused; skipping rotations");
            return Ok(report);
        }

        let statuses = self.keys.status().await?;
        for status in &statuses {
            let policy = self.keys.policy(status.key_type)?;
            let urgency = classify(
                status.active_since,
                &policy,
                now,
                self.config.severe_overdue_ratio,
            );
            report.assessments.push(Assessment {
                key_type: status.key_type,
                urgency,
                age_days: status.active_since.map(|since| (now - since).num_days()),
                due_at: status.rotation_due_at,
            });

            let Some(priority) = urgency.priority() else {
                continue;
            };
            let reason = match urgency {
                Urgency::Missing => "no active key",
                Urgency::SeverelyOverdue => "rotation severely overdue",
                _ => "rotation interval elapsed",
            };
            let job = RotationJob::new(status.key_type, priority, reason, now);
            if self.enqueue(job, now, false).await {
                report.enqueued.push(status.key_type);
            }
        }

        let jobs = self.dispatch(now, in_window, &mut report).await;
        if !jobs.is_empty() {
            let outcomes = join_all(jobs.into_iter().map(|job| self.execute(job, now))).await;
            report.outcomes.extend(outcomes);
        }

        Ok(report)
    }

    /// Blocks until every in-flight migration finishes, then settles each one the way a
    /// tick would.
    pub async fn wait_for_migrations(&self, now: DateTime<Utc>) -> Vec<JobOutcome> {
        self.collect_migrations(now, true).await
    }

    async fn collect_migrations(&self, now: DateTime<Utc>, wait: bool) -> Vec<JobOutcome> {
        let finished: Vec<InFlight> = {
            let mut state = self.state.lock().await;
            let done: Vec<KeyType> = state
                .migrations
                .iter()
                .filter(|(_, in_flight)| wait || in_flight.task.is_finished())
                .map(|(key_type, _)| *key_type)
                .collect();
            done.iter()
                .filter_map(|key_type| state.migrations.remove(key_type))
                .collect()
        };

        let mut outcomes = Vec::with_capacity(finished.len());
        for InFlight { job, task } in finished {
            let key_type = job.key_type;
            let result = match task.await {
                Ok(result) => result,
                Err(err) => Err(RotationError::MigrationTaskLost(key_type, err.to_string())),
            };
            outcomes.push(self.settle(job, result, now).await);
            self.state.lock().await.running.remove(&key_type);
        }
        outcomes
    }

    /// Re-queues jobs the ledger still shows as migrating, so their records move after a
    /// restart. Returns how many were picked up.
    pub async fn recover_interrupted(&self) -> usize {
        let jobs = match self.keys.recent_jobs(RECOVERY_SCAN).await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(?err, "could not read rotation ledger; interrupted migrations not recovered");
                return 0;
            }
        };

        let now = Utc::now();
        let mut recovered = 0;
        for mut job in jobs
            .into_iter()
            .filter(|job| job.status == JobStatus::Migrating && job.rotated_version.is_some())
        {
            let added = {
                let mut state = self.state.lock().await;
                if state.running.contains(&job.key_type)
                    || state.escalated.contains_key(&job.key_type)
                {
                    false
                } else {
                    job.status = JobStatus::Queued;
                    state.queue.push(job.clone(), now)
                }
            };
            if added {
                info!(
                    key_type = %job.key_type,
                    job_id = %job.id,
                    version = job.rotated_version,
                    "resuming interrupted key migration"
                );
                self.persist(&job).await;
                recovered += 1;
            }
        }
        if recovered > 0 {
            self.wake.notify_one();
        }
        recovered
    }

    /// Stops in-flight migrations at their next batch boundary. Jobs cut short stay
    /// `migrating` in the ledger and resume on the next start.
    async fn interrupt_migrations(&self) {
        let in_flight: Vec<InFlight> = self
            .state
            .lock()
            .await
            .migrations
            .drain()
            .map(|(_, in_flight)| in_flight)
            .collect();

        for InFlight { job, task } in in_flight {
            let key_type = job.key_type;
            self.keys.cancel_migration(key_type);
            let result = match task.await {
                Ok(result) => result,
                Err(err) => Err(RotationError::MigrationTaskLost(key_type, err.to_string())),
            };
            if let Err(RotationError::MigrationCancelled { .. }) = result {
                info!(%key_type, job_id = %job.id, "key migration interrupted by shutdown");
            } else {
                self.settle(job, result, Utc::now()).await;
            }
            self.state.lock().await.running.remove(&key_type);
        }
    }

    /// Adds a job unless its key type is running, queued or escalated (the latter only when
    /// `operator` is false). Persists and audits new jobs.
    async fn enqueue(&self, mut job: RotationJob, now: DateTime<Utc>, operator: bool) -> bool {
        let added = {
            let mut state = self.state.lock().await;
            if operator {
                state.escalated.remove(&job.key_type);
            }
            if state.running.contains(&job.key_type)
                || state.escalated.contains_key(&job.key_type)
            {
                return false;
            }
            job.status = JobStatus::Queued;
            state.queue.push(job.clone(), now)
        };
        if !added {
            return false;
        }

        self.persist(&job).await;
        info!(
            key_type = %job.key_type,
            priority = job.priority.as_str(),
            reason = %job.reason,
            "rotation queued"
        );
        self.audit_job(&job, AuditAction::RotationQueued, AuditOutcome::Success, json!({}))
            .await;
        true
    }

    /// Pops eligible jobs while shared slots are available. Jobs that cannot get a slot go
    /// back to the queue unchanged. The state lock is not held while the gate is consulted;
    /// a popped job is marked running first so it cannot be enqueued twice meanwhile.
    async fn dispatch(
        &self,
        now: DateTime<Utc>,
        in_window: bool,
        report: &mut TickReport,
    ) -> Vec<RotationJob> {
        let mut started = Vec::new();

        loop {
            let mut job = {
                let mut state = self.state.lock().await;
                let Some(job) = state.queue.pop_ready(now, in_window) else {
                    break;
                };
                state.running.insert(job.key_type);
                job
            };

            let holder = self.holder(&job);
            let acquired = self
                .gate
                .try_acquire(&holder, self.config.max_concurrent, self.config.lease_ttl)
                .await;

            match acquired {
                Ok(true) => {
                    job.status = JobStatus::Running;
                    job.started_at = Some(now);
                    started.push(job);
                    continue;
                }
                Ok(false) => {
                    debug!(key_type = %job.key_type, "rotation waiting for a concurrency slot");
                }
                Err(err) => {
                    warn!(?err, key_type = %job.key_type, "concurrency gate unavailable; rotation deferred");
                }
            }
            report.waiting_for_slot.push(job.key_type);
            let mut state = self.state.lock().await;
            state.running.remove(&job.key_type);
            state.queue.push(job, now);
            break;
        }

        if !in_window {
            report.deferred = self.state.lock().await.queue.deferred_by_window(now);
        }

        for job in &started {
            self.persist(job).await;
        }
        started
    }

    /// Commits the key flip (unless an earlier attempt already did) and hands the migration
    /// to a background task that keeps the job's slot until it finishes.
    async fn execute(&self, mut job: RotationJob, now: DateTime<Utc>) -> JobOutcome {
        let holder = self.holder(&job);
        job.attempts += 1;

        if job.rotated_version.is_none() {
            let key_type = job.key_type;
            let flip = self.keys.rotate_at(key_type, job.force, &job.reason, now);
            let (result, _) = hold_lease(
                self.gate.as_ref(),
                &holder,
                self.config.max_concurrent,
                self.config.lease_ttl,
                flip,
                || warn!(%key_type, "rotation slot lease lost during key flip"),
            )
            .await;

            match result {
                Ok(rotation) => {
                    info!(
                        %key_type,
                        version = rotation.new_version,
                        records_pending = rotation.records_pending,
                        "key flip committed; migrating records in the background"
                    );
                    job.rotated_version = Some(rotation.new_version);
                }
                Err(err) => {
                    if let Err(err) = self.gate.release(&holder).await {
                        warn!(?err, %key_type, "failed to release rotation slot");
                    }
                    let outcome = self.settle(job, Err(err), now).await;
                    self.state.lock().await.running.remove(&key_type);
                    return outcome;
                }
            }
        }

        job.status = JobStatus::Migrating;
        self.persist(&job).await;

        let task = MigrationTask {
            keys: Arc::clone(&self.keys),
            gate: Arc::clone(&self.gate),
            wake: Arc::clone(&self.wake),
            holder,
            key_type: job.key_type,
            capacity: self.config.max_concurrent,
            lease_ttl: self.config.lease_ttl,
        };
        let outcome = outcome_of(&job, false);
        let task = tokio::spawn(task.run());
        self.state
            .lock()
            .await
            .migrations
            .insert(job.key_type, InFlight { job, task });
        outcome
    }

    /// Records the result of an attempt: completion, a backed-off retry, or escalation once
    /// attempts are exhausted or the failure is one a retry cannot fix.
    async fn settle(
        &self,
        mut job: RotationJob,
        result: Result<MigrationReport, RotationError>,
        now: DateTime<Utc>,
    ) -> JobOutcome {
        let error = match result {
            Ok(report) => {
                self.audit_job(
                    &job,
                    AuditAction::RotationCompleted,
                    AuditOutcome::Success,
                    json!({
                        "new_version": job.rotated_version,
                        "records_migrated": report.records_migrated,
                        "batches": report.batches_completed,
                    }),
                )
                .await;
                None
            }
            Err(RotationError::NotDue { due_at, .. }) => {
                debug!(key_type = %job.key_type, %due_at, "rotation no longer due");
                None
            }
            Err(err) => Some(err),
        };

        let Some(err) = error else {
            job.status = JobStatus::Completed;
            job.finished_at = Some(now);
            job.last_error = None;
            self.persist(&job).await;
            return outcome_of(&job, false);
        };

        if let Some(version) = err.committed_version() {
            job.rotated_version = Some(version);
        }
        job.last_error = Some(err.to_string());

        let cancelled = matches!(err, RotationError::MigrationCancelled { .. });
        let retryable = err.is_retryable();
        if retryable && self.config.job_retry.should_retry(job.attempts) {
            let delay = self.config.job_retry.delay_for(job.attempts);
            let retry_at = now + Duration::from_std(delay).unwrap_or_else(|_| Duration::zero());
            warn!(
                key_type = %job.key_type,
                attempt = job.attempts,
                retry_at = %retry_at,
                error = %err,
                "rotation failed; retrying"
            );
            self.audit_job(
                &job,
                AuditAction::RotationFailed,
                AuditOutcome::Failure,
                json!({"error": err.to_string(), "retry_at": retry_at}),
            )
            .await;
            job.status = JobStatus::Queued;
            self.persist(&job).await;
            self.state.lock().await.queue.push(job.clone(), retry_at);
            self.wake.notify_one();
            return outcome_of(&job, false);
        }

        job.status = JobStatus::Failed;
        job.finished_at = Some(now);
        self.persist(&job).await;

        if cancelled {
            warn!(key_type = %job.key_type, error = %err, "rotation cancelled by operator");
            self.audit_job(
                &job,
                AuditAction::RotationFailed,
                AuditOutcome::Failure,
                json!({"error": err.to_string(), "cancelled": true}),
            )
            .await;
            return outcome_of(&job, false);
        }

        error!(
            alert = "page",
            key_type = %job.key_type,
            attempts = job.attempts,
            retryable,
            error = %err,
            "rotation failed; operator action required"
        );
        self.audit_job(
            &job,
            AuditAction::RotationEscalated,
            AuditOutcome::Failure,
            json!({"error": err.to_string(), "attempts": job.attempts, "retryable": retryable}),
        )
        .await;
        self.state
            .lock()
            .await
            .escalated
            .insert(job.key_type, job.clone());
        outcome_of(&job, true)
    }

    /// Queues an operator-requested rotation and wakes the loop. Clears any escalation for
    /// the key type.
    pub async fn request_rotation(
        &self,
        key_type: KeyType,
        priority: RotationPriority,
        reason: &str,
        force: bool,
    ) -> Result<Option<RotationJob>, RotationError> {
        self.keys.policy(key_type)?;
        let mut job = RotationJob::new(key_type, priority, reason, Utc::now());
        if force {
            job = job.forced();
        }
        let added = self.enqueue(job.clone(), job.requested_at, true).await;
        self.wake.notify_one();
        Ok(added.then_some(job))
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub async fn pause(&self, actor: &str) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!(actor, "rotation scheduler paused");
            self.audit_scheduler(AuditAction::SchedulerPaused, actor).await;
        }
    }

    pub async fn resume(&self, actor: &str) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!(actor, "rotation scheduler resumed");
            self.audit_scheduler(AuditAction::SchedulerResumed, actor).await;
            self.wake.notify_one();
        }
    }

    pub async fn status(&self) -> Result<SchedulerStatus, RotationError> {
        let keys = self.keys.status().await?;
        let slots_in_use = match self.gate.in_use().await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(?err, "concurrency gate unavailable for status");
                None
            }
        };
        let state = self.state.lock().await;
        Ok(SchedulerStatus {
            started: self.started.load(Ordering::SeqCst),
            paused: self.is_paused(),
            instance_id: self.instance_id.clone(),
            in_maintenance_window: self.config.maintenance_window.contains(Utc::now()),
            max_concurrent: self.config.max_concurrent,
            slots_in_use,
            last_tick_at: state.last_tick_at,
            queued: state.queue.snapshot(),
            running: state.running.iter().copied().collect(),
            migrating: state.migrations.keys().copied().collect(),
            escalated: state.escalated.values().cloned().collect(),
            keys,
        })
    }

    fn holder(&self, job: &RotationJob) -> String {
        format!("{}:{}", self.instance_id, job.id)
    }

    async fn persist(&self, job: &RotationJob) {
        if let Err(err) = self.keys.record_job(job).await {
            log_store_failure(&err, job);
        }
    }

    async fn audit_job(
        &self,
        job: &RotationJob,
        action: AuditAction,
        outcome: AuditOutcome,
        extra: serde_json::Value,
    ) {
        let event = AuditEvent::new(
            key_subject(job.key_type),
            action,
            outcome,
            json!({
                "job_id": job.id,
                "priority": job.priority.as_str(),
                "reason": job.reason,
                "attempts": job.attempts,
                "detail": extra,
            }),
            Utc::now(),
        );
        record_best_effort(self.audit.as_ref(), event).await;
    }

    async fn audit_scheduler(&self, action: AuditAction, actor: &str) {
        let event = AuditEvent::new(
            SCHEDULER_SUBJECT,
            action,
            AuditOutcome::Success,
            json!({"actor": actor, "instance_id": self.instance_id}),
            Utc::now(),
        );
        record_best_effort(self.audit.as_ref(), event).await;
    }
}

/// Background half of a rotation: moves records onto the new version while renewing the
/// job's slot, then frees the slot and wakes the scheduler loop.
struct MigrationTask {
    keys: Arc<KeyRotationService>,
    gate: Arc<dyn ConcurrencyGate>,
    wake: Arc<Notify>,
    holder: String,
    key_type: KeyType,
    capacity: u32,
    lease_ttl: StdDuration,
}

impl MigrationTask {
    async fn run(self) -> Result<MigrationReport, RotationError> {
        let key_type = self.key_type;
        let keys = &self.keys;
        let (result, lost) = hold_lease(
            self.gate.as_ref(),
            &self.holder,
            self.capacity,
            self.lease_ttl,
            keys.resume_migration(key_type),
            || {
                warn!(%key_type, "rotation slot lease lost; stopping migration after the current batch");
                keys.cancel_migration(key_type);
            },
        )
        .await;

        if let Err(err) = self.gate.release(&self.holder).await {
            warn!(?err, %key_type, "failed to release rotation slot");
        }
        self.wake.notify_one();

        match result {
            Err(RotationError::MigrationCancelled { .. }) if lost => {
                Err(RotationError::LeaseLost(key_type))
            }
            other => other,
        }
    }
}

/// Drives `work` while renewing `holder`'s slot every third of the lease. Returns the work's
/// output and whether the gate reported the slot taken by someone else; `on_lost` runs once
/// when that happens and renewal stops.
async fn hold_lease<F: Future>(
    gate: &dyn ConcurrencyGate,
    holder: &str,
    capacity: u32,
    ttl: StdDuration,
    work: F,
    on_lost: impl Fn(),
) -> (F::Output, bool) {
    tokio::pin!(work);
    let mut renew = time::interval((ttl / 3).max(StdDuration::from_millis(1)));
    renew.tick().await;
    let mut lost = false;
    loop {
        tokio::select! {
            output = &mut work => return (output, lost),
            _ = renew.tick(), if !lost => {
                match gate.try_acquire(holder, capacity, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        lost = true;
                        on_lost();
                    }
                    Err(err) => warn!(?err, holder, "failed to renew rotation slot lease"),
                }
            }
        }
    }
}

fn log_store_failure(err: &StoreError, job: &RotationJob) {
    warn!(?err, job_id = %job.id, key_type = %job.key_type, "failed to persist rotation job");
}

fn outcome_of(job: &RotationJob, escalated: bool) -> JobOutcome {
    JobOutcome {
        job_id: job.id,
        key_type: job.key_type,
        status: job.status,
        attempts: job.attempts,
        escalated,
        error: job.last_error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(days: i64) -> KeyTypePolicy {
        KeyTypePolicy {
            interval: Duration::days(days),
            grace_period: Duration::days(7),
        }
    }

    #[test]
    fn classification_thresholds() {
        let now = Utc::now();
        let p = policy(30);
        assert_eq!(classify(None, &p, now, 1.5), Urgency::Missing);
        assert_eq!(classify(Some(now - Duration::days(10)), &p, now, 1.5), Urgency::OnTime);
        assert_eq!(classify(Some(now - Duration::days(30)), &p, now, 1.5), Urgency::Due);
        assert_eq!(classify(Some(now - Duration::days(45)), &p, now, 1.5), Urgency::Due);
        assert_eq!(
            classify(Some(now - Duration::days(46)), &p, now, 1.5),
            Urgency::SeverelyOverdue
        );
    }

    #[test]
    fn urgency_maps_to_priority() {
        assert_eq!(Urgency::OnTime.priority(), None);
        assert_eq!(Urgency::Due.priority(), Some(RotationPriority::Normal));
        assert_eq!(Urgency::SeverelyOverdue.priority(), Some(RotationPriority::High));
        assert_eq!(Urgency::Missing.priority(), Some(RotationPriority::Emergency));
    }
}
