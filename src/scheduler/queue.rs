use chrono::{DateTime, Utc};

use crate::keys::models::{KeyType, RotationJob, RotationPriority};

#[derive(Clone, Debug)]
struct QueuedJob {
    job: RotationJob,
    not_before: DateTime<Utc>,
}

/// key: rotation-queue
/// Pending rotations, at most one per key type. Higher priority runs first, then the older
/// request. Normal-priority jobs only leave the queue inside the maintenance window.
#[derive(Debug, Default)]
pub struct RotationQueue {
    jobs: Vec<QueuedJob>,
}

impl RotationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `job` unless its key type is already waiting. A duplicate request with a
    /// higher priority upgrades the waiting job instead. Returns whether a new job was added.
    pub fn push(&mut self, job: RotationJob, not_before: DateTime<Utc>) -> bool {
        if let Some(existing) = self
            .jobs
            .iter_mut()
            .find(|queued| queued.job.key_type == job.key_type)
        {
            if job.priority > existing.job.priority {
                existing.job.priority = job.priority;
                existing.job.force |= job.force;
                existing.not_before = existing.not_before.min(not_before);
            }
            return false;
        }
        self.jobs.push(QueuedJob { job, not_before });
        true
    }

    pub fn contains(&self, key_type: KeyType) -> bool {
        self.jobs.iter().any(|queued| queued.job.key_type == key_type)
    }

    /// Removes and returns the most urgent job allowed to start at `now`.
    pub fn pop_ready(&mut self, now: DateTime<Utc>, in_maintenance_window: bool) -> Option<RotationJob> {
        let index = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, queued)| queued.not_before <= now)
            .filter(|(_, queued)| {
                in_maintenance_window || queued.job.priority.bypasses_maintenance_window()
            })
            .max_by(|(_, a), (_, b)| {
                a.job
                    .priority
                    .cmp(&b.job.priority)
                    .then_with(|| b.job.requested_at.cmp(&a.job.requested_at))
            })
            .map(|(index, _)| index)?;
        Some(self.jobs.remove(index).job)
    }

    /// Jobs waiting only for the maintenance window.
    pub fn deferred_by_window(&self, now: DateTime<Utc>) -> Vec<KeyType> {
        self.jobs
            .iter()
            .filter(|queued| {
                queued.not_before <= now && queued.job.priority == RotationPriority::Normal
            })
            .map(|queued| queued.job.key_type)
            .collect()
    }

    /// Earliest moment a backed-off job becomes eligible again.
    pub fn next_retry_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.jobs
            .iter()
            .map(|queued| queued.not_before)
            .filter(|at| *at > now)
            .min()
    }

    pub fn snapshot(&self) -> Vec<RotationJob> {
        self.jobs.iter().map(|queued| queued.job.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
