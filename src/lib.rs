pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod extractor;
pub mod keys;
pub mod ratelimit;
pub mod redis_pool;
pub mod retry;
pub mod scheduler;

pub use api::{router, AppServices};
pub use config::SecurityConfig;
