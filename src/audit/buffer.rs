use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::StoreError;

use super::{AuditAggregate, AuditEvent, AuditFilter, AuditSink};

/// key: buffered-audit-sink
/// Puts appends on a bounded queue drained by one writer task, so a slow or stalled sink
/// never holds up the request that produced the event. A full queue drops the event and
/// counts it in `guardrail_audit_events_dropped_total`.
pub struct BufferedAuditSink {
    tx: mpsc::Sender<AuditEvent>,
    inner: Arc<dyn AuditSink>,
    dropped: AtomicU64,
    shutdown: Arc<Notify>,
}

impl BufferedAuditSink {
    pub fn spawn(inner: Arc<dyn AuditSink>, capacity: usize) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shutdown = Arc::new(Notify::new());
        let writer = tokio::spawn(write_events(inner.clone(), rx, shutdown.clone()));
        let sink = Arc::new(Self {
            tx,
            inner,
            dropped: AtomicU64::new(0),
            shutdown,
        });
        (sink, writer)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops accepting events. The writer finishes whatever is already queued.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }
}

async fn write_events(
    inner: Arc<dyn AuditSink>,
    mut rx: mpsc::Receiver<AuditEvent>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => write_one(inner.as_ref(), &event).await,
                None => break,
            },
            _ = shutdown.notified() => {
                rx.close();
                while let Some(event) = rx.recv().await {
                    write_one(inner.as_ref(), &event).await;
                }
                break;
            }
        }
    }
    tracing::debug!("audit writer stopped");
}

async fn write_one(inner: &dyn AuditSink, event: &AuditEvent) {
    if let Err(err) = inner.append(event).await {
        tracing::warn!(
            ?err,
            action = event.action.as_str(),
            subject = %event.subject,
            "failed to write buffered audit event"
        );
    }
}

#[async_trait]
impl AuditSink for BufferedAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<(), StoreError> {
        match self.tx.try_send(event.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::increment_counter!("guardrail_audit_events_dropped_total");
                tracing::warn!(
                    action = event.action.as_str(),
                    subject = %event.subject,
                    dropped,
                    "audit queue full, event dropped"
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(StoreError::Unavailable("audit writer stopped".into()))
            }
        }
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, StoreError> {
        self.inner.query(filter).await
    }

    async fn aggregate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        top_n: usize,
    ) -> Result<AuditAggregate, StoreError> {
        self.inner.aggregate(start, end, top_n).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, AuditOutcome, MemoryAuditSink};
    use serde_json::json;

    fn denial(n: usize) -> AuditEvent {
        AuditEvent::new(
            format!("ratelimit:org-1:{n}"),
            AuditAction::RateLimitDenied,
            AuditOutcome::Denied,
            json!({}),
            Utc::now(),
        )
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_drops_instead_of_waiting() {
        let memory = Arc::new(MemoryAuditSink::new());
        let (sink, writer) = BufferedAuditSink::spawn(memory.clone(), 1);

        // The writer cannot run until this task yields, so only the first event fits.
        for n in 0..3 {
            sink.append(&denial(n)).await.unwrap();
        }
        assert_eq!(sink.dropped(), 2);

        sink.close();
        writer.await.unwrap();
        assert_eq!(memory.count(AuditAction::RateLimitDenied).await, 1);
        assert!(sink.append(&denial(9)).await.is_err());
    }

    #[tokio::test]
    async fn queued_events_are_written_on_close() {
        let memory = Arc::new(MemoryAuditSink::new());
        let (sink, writer) = BufferedAuditSink::spawn(memory.clone(), 16);

        for n in 0..10 {
            sink.append(&denial(n)).await.unwrap();
        }
        sink.close();
        writer.await.unwrap();

        assert_eq!(sink.dropped(), 0);
        assert_eq!(memory.count(AuditAction::RateLimitDenied).await, 10);
        let seen = sink.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(seen.len(), 10);
    }
}
