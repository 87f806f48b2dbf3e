//! Versioned key material with scheduled rotation, grace periods and record migration.

pub mod crypto;
pub mod migration;
pub mod models;
pub mod records;
pub mod service;
pub mod store;

pub use crypto::{MasterKey, SecretKey};
pub use migration::{MigrationControl, MigrationReport, MigrationState};
pub use models::{
    JobStatus, KeyMaterial, KeyStatus, KeyType, RotationJob, RotationPriority, RotationResult,
};
pub use records::{EncryptedRecord, MemoryRecordStore, PgRecordStore, RecordStore};
pub use service::{KeyRotationService, KeyTypeStatus};
pub use store::{Demotion, KeyStore, KeyTransition, MemoryKeyStore, PgKeyStore};
