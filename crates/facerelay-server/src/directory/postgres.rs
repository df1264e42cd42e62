use async_trait::async_trait;
use facerelay_protocol::DeviceClass;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

use super::{DeviceRecord, Directory, DirectoryError};

#[derive(Debug, FromRow)]
struct DeviceRow {
    device_id: String,
    secret_hash: String,
    approved: bool,
    class: String,
    recognition_endpoint: Option<String>,
}

impl TryFrom<DeviceRow> for DeviceRecord {
    type Error = DirectoryError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        let class: DeviceClass = row.class.parse().map_err(|reason| DirectoryError::InvalidRecord {
            key: row.device_id.clone(),
            reason,
        })?;

        Ok(DeviceRecord {
            device_id: row.device_id,
            secret_hash: row.secret_hash,
            approved: row.approved,
            class,
            recognition_endpoint: row.recognition_endpoint,
        })
    }
}

/// Directory backed by the `devices` and `persons` tables
#[derive(Clone)]
pub struct PgDirectory {
    db: PgPool,
}

impl PgDirectory {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Open a pool of at most `max_connections` and bring the schema up to date
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, DirectoryError> {
        let db = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&db).await?;

        tracing::info!(
            "Postgres directory ready (pool of {} connections)",
            max_connections
        );
        Ok(Self::new(db))
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>, DirectoryError> {
        let row = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT device_id, secret_hash, approved, class, recognition_endpoint
            FROM devices WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.db)
        .await?;

        row.map(DeviceRecord::try_from).transpose()
    }

    async fn recognition_endpoint(&self, device_id: &str) -> Result<Option<String>, DirectoryError> {
        let endpoint = sqlx::query_scalar::<_, Option<String>>(
            "SELECT recognition_endpoint FROM devices WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(endpoint.flatten())
    }

    async fn person_name(&self, identity: &str) -> Result<Option<String>, DirectoryError> {
        let name = sqlx::query_scalar::<_, String>(
            "SELECT display_name FROM persons WHERE identity = $1",
        )
        .bind(identity)
        .fetch_optional(&self.db)
        .await?;

        Ok(name)
    }
}
