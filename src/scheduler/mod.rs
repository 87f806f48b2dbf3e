//! Background rotation scheduling: due-date classification, the maintenance window,
//! prioritised queueing and a cluster-wide concurrency cap.

pub mod gate;
pub mod queue;
pub mod service;
pub mod window;

pub use gate::{ConcurrencyGate, MemoryConcurrencyGate, RedisConcurrencyGate};
pub use queue::RotationQueue;
pub use service::{
    classify, AlreadyStarted, JobOutcome, RotationScheduler, SchedulerHandle, SchedulerStatus,
    TickReport, Urgency,
};
pub use window::MaintenanceWindow;
