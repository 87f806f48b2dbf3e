use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StoreError;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Second,
    Minute,
    Hour,
    Burst,
}

impl WindowKind {
    pub const ALL: [WindowKind; 4] = [
        WindowKind::Second,
        WindowKind::Minute,
        WindowKind::Hour,
        WindowKind::Burst,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Second => "second",
            WindowKind::Minute => "minute",
            WindowKind::Hour => "hour",
            WindowKind::Burst => "burst",
        }
    }

    /// Tie-break order when two exceeded windows reset at the same moment.
    fn rank(&self) -> u8 {
        match self {
            WindowKind::Hour => 3,
            WindowKind::Minute => 2,
            WindowKind::Burst => 1,
            WindowKind::Second => 0,
        }
    }
}

/// One counter the atomic operation must check and bump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowSpec {
    pub kind: WindowKind,
    pub key: String,
    pub limit: u64,
    /// Span the limit applies to. The window slides; it never resets all at once.
    pub length: Duration,
}

impl WindowSpec {
    pub fn length_ms(&self) -> u64 {
        (self.length.as_millis() as u64).max(1)
    }
}

/// Sliding-window counter: hits in the current fixed bucket plus the bucket before it.
/// The previous bucket is weighted by how much of it still overlaps the window ending now,
/// so a client cannot spend a full limit on each side of a bucket boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlidingCounter {
    pub bucket: u64,
    pub current: u64,
    pub previous: u64,
}

impl SlidingCounter {
    /// Moves the counter to `bucket`. The old current bucket becomes the previous one only
    /// when the two are adjacent; anything older no longer overlaps the window.
    pub fn roll(&mut self, bucket: u64) {
        if bucket == self.bucket {
            return;
        }
        self.previous = if bucket == self.bucket + 1 {
            self.current
        } else {
            0
        };
        self.current = 0;
        self.bucket = bucket;
    }

    /// Requests counted against the window ending `elapsed_ms` into the current bucket.
    /// The weighted share of the previous bucket is rounded up.
    pub fn estimate(&self, elapsed_ms: u64, length_ms: u64) -> u64 {
        let overlap = length_ms.saturating_sub(elapsed_ms);
        let weighted = self
            .previous
            .saturating_mul(overlap)
            .saturating_add(length_ms - 1)
            / length_ms;
        weighted.saturating_add(self.current)
    }
}

/// Counter state as observed inside the atomic operation.
/// `count` is the sliding estimate, post-increment when the request was admitted and
/// untouched otherwise. `reset_after` is the time until the current bucket rolls over.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WindowState {
    pub kind: WindowKind,
    pub limit: u64,
    pub count: u64,
    pub reset_after: Duration,
    pub exceeded: bool,
}

impl WindowState {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}

/// key: atomic-window-outcome
/// Structured result of one check-and-increment across every window of a scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WindowOutcome {
    pub allowed: bool,
    pub windows: Vec<WindowState>,
}

impl WindowOutcome {
    /// The exceeded window the caller has to wait out: the one that resets last.
    /// Equal resets prefer the longer window kind.
    pub fn limiting_window(&self) -> Option<&WindowState> {
        self.windows
            .iter()
            .filter(|window| window.exceeded)
            .max_by(|a, b| {
                a.reset_after
                    .cmp(&b.reset_after)
                    .then_with(|| a.kind.rank().cmp(&b.kind.rank()))
            })
    }

    /// Window whose numbers belong in the response headers.
    pub fn binding_window(&self) -> Option<&WindowState> {
        if let Some(limiting) = self.limiting_window() {
            return Some(limiting);
        }
        self.windows.iter().min_by(|a, b| {
            a.remaining()
                .cmp(&b.remaining())
                .then_with(|| b.reset_after.cmp(&a.reset_after))
        })
    }

    pub fn remaining(&self) -> u64 {
        self.windows
            .iter()
            .map(WindowState::remaining)
            .min()
            .unwrap_or(0)
    }
}

/// key: atomic-window-counter
/// Check-and-increment over several counters as one indivisible step. Either every window
/// has room and all of them are incremented, or none is touched and the exceeded windows
/// are reported. Implementations never expose a read/write split to callers.
#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn check_and_increment(&self, windows: &[WindowSpec]) -> Result<WindowOutcome, StoreError>;

    /// Reachability check used by `/healthz`.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Shared evaluation step: given the estimates and bucket remainders read inside the atomic
/// section, decides admission and returns what the store must write back.
pub(crate) fn evaluate(windows: &[WindowSpec], observed: &[(u64, Duration)]) -> WindowOutcome {
    let exceeded: Vec<bool> = windows
        .iter()
        .zip(observed)
        .map(|(spec, (count, _))| count.saturating_add(1) > spec.limit)
        .collect();
    let allowed = !exceeded.iter().any(|flag| *flag);

    let states = windows
        .iter()
        .zip(observed)
        .zip(exceeded)
        .map(|((spec, (count, reset_after)), exceeded)| WindowState {
            kind: spec.kind,
            limit: spec.limit,
            count: if allowed { count + 1 } else { *count },
            reset_after: *reset_after,
            exceeded,
        })
        .collect();

    WindowOutcome {
        allowed,
        windows: states,
    }
}
