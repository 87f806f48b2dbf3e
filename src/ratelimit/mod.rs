//! Multi-window rate limiting over a store shared by every instance.

pub mod limiter;
pub mod memory;
pub mod middleware;
pub mod redis_store;
pub mod window;

pub use limiter::{Decision, DecisionStatus, DistributedRateLimiter, RateLimitScope};
pub use memory::MemoryWindowStore;
pub use redis_store::RedisWindowStore;
pub use window::{WindowKind, WindowOutcome, WindowSpec, WindowState, WindowStore};
