use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;

use super::window::{evaluate, SlidingCounter, WindowOutcome, WindowSpec, WindowStore};

const SWEEP_EVERY: u64 = 1024;

struct Counter {
    window: SlidingCounter,
    length_ms: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct Counters {
    entries: HashMap<String, Counter>,
    operations: u64,
}

/// key: memory-window-store
/// Single-process window counters. Only correct when exactly one instance serves traffic,
/// so it is selected explicitly (`STORE_BACKEND=memory`) and never used as a fallback
/// for an unreachable shared store.
pub struct MemoryWindowStore {
    counters: Mutex<Counters>,
    /// Bucket boundaries are measured from here, like the Redis script measures from the epoch.
    origin: Instant,
}

impl Default for MemoryWindowStore {
    fn default() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            origin: Instant::now(),
        }
    }
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, now: Instant, length_ms: u64) -> (u64, u64) {
        let since_origin = now.duration_since(self.origin).as_millis() as u64;
        (since_origin / length_ms, since_origin % length_ms)
    }

    /// Current sliding estimate for `key`.
    pub async fn count(&self, key: &str) -> u64 {
        let counters = self.counters.lock().await;
        let now = Instant::now();
        counters
            .entries
            .get(key)
            .filter(|counter| counter.expires_at > now)
            .map(|counter| {
                let (bucket, elapsed) = self.position(now, counter.length_ms);
                let mut window = counter.window;
                window.roll(bucket);
                window.estimate(elapsed, counter.length_ms)
            })
            .unwrap_or(0)
    }

    pub async fn len(&self) -> usize {
        self.counters.lock().await.entries.len()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn check_and_increment(&self, windows: &[WindowSpec]) -> Result<WindowOutcome, StoreError> {
        let mut counters = self.counters.lock().await;
        let now = Instant::now();

        counters.operations += 1;
        if counters.operations % SWEEP_EVERY == 0 {
            counters.entries.retain(|_, counter| counter.expires_at > now);
        }

        let mut rolled = Vec::with_capacity(windows.len());
        let mut observed = Vec::with_capacity(windows.len());
        for spec in windows {
            let length_ms = spec.length_ms();
            let (bucket, elapsed) = self.position(now, length_ms);
            let mut window = match counters.entries.get(&spec.key) {
                Some(counter) if counter.expires_at > now => counter.window,
                _ => SlidingCounter {
                    bucket,
                    ..SlidingCounter::default()
                },
            };
            window.roll(bucket);
            observed.push((
                window.estimate(elapsed, length_ms),
                Duration::from_millis(length_ms - elapsed),
            ));
            rolled.push(window);
        }

        let outcome = evaluate(windows, &observed);
        if outcome.allowed {
            for (spec, mut window) in windows.iter().zip(rolled) {
                window.current += 1;
                let length_ms = spec.length_ms();
                counters.entries.insert(
                    spec.key.clone(),
                    Counter {
                        window,
                        length_ms,
                        expires_at: now + Duration::from_millis(length_ms * 2),
                    },
                );
            }
        }
        Ok(outcome)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::window::WindowKind;

    fn window(kind: WindowKind, limit: u64, length: Duration) -> WindowSpec {
        WindowSpec {
            kind,
            key: format!("test:{{scope}}:{}", kind.as_str()),
            limit,
            length,
        }
    }

    #[tokio::test]
    async fn denial_does_not_consume_quota() {
        let store = MemoryWindowStore::new();
        let windows = vec![
            window(WindowKind::Second, 100, Duration::from_secs(1)),
            window(WindowKind::Minute, 1, Duration::from_secs(60)),
        ];

        assert!(store.check_and_increment(&windows).await.unwrap().allowed);
        let denied = store.check_and_increment(&windows).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(store.count(&windows[0].key).await, 1);
        assert_eq!(store.count(&windows[1].key).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn window_frees_up_once_old_requests_slide_out() {
        let store = MemoryWindowStore::new();
        let windows = vec![window(WindowKind::Second, 1, Duration::from_secs(1))];

        assert!(store.check_and_increment(&windows).await.unwrap().allowed);
        assert!(!store.check_and_increment(&windows).await.unwrap().allowed);

        tokio::time::advance(Duration::from_millis(2001)).await;
        let outcome = store.check_and_increment(&windows).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.windows[0].count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_boundary_does_not_double_the_limit() {
        let store = MemoryWindowStore::new();
        let windows = vec![window(WindowKind::Burst, 2, Duration::from_secs(10))];

        tokio::time::advance(Duration::from_millis(9_900)).await;
        assert!(store.check_and_increment(&windows).await.unwrap().allowed);
        assert!(store.check_and_increment(&windows).await.unwrap().allowed);
        assert!(!store.check_and_increment(&windows).await.unwrap().allowed);

        // Just past the boundary both earlier requests still fall inside the window.
        tokio::time::advance(Duration::from_millis(200)).await;
        let denied = store.check_and_increment(&windows).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.windows[0].count, 2);

        // Halfway through the next bucket one of them has slid out.
        tokio::time::advance(Duration::from_millis(4_900)).await;
        assert!(store.check_and_increment(&windows).await.unwrap().allowed);
        assert!(!store.check_and_increment(&windows).await.unwrap().allowed);
    }
}
