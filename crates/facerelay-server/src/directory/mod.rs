//! Lookups the relay needs from the outside world: device credentials,
//! per-device recognition endpoints and person display names.

mod memory;
mod postgres;

pub use memory::MemoryDirectory;
pub use postgres::PgDirectory;

use async_trait::async_trait;
use facerelay_protocol::DeviceClass;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid record for {key}: {reason}")]
    InvalidRecord { key: String, reason: String },
}

/// A registered device
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub device_id: String,
    /// Argon2 PHC string
    pub secret_hash: String,
    pub approved: bool,
    pub class: DeviceClass,
    pub recognition_endpoint: Option<String>,
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>, DirectoryError>;

    /// Endpoint override for a device; `None` means use the relay default
    async fn recognition_endpoint(&self, device_id: &str) -> Result<Option<String>, DirectoryError>;

    async fn person_name(&self, identity: &str) -> Result<Option<String>, DirectoryError>;
}
