//! PostgreSQL log store

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use super::{LogStore, NewLogPart};
use crate::config::DatabaseConfig;
use crate::error::StoreError;

const FIND_LOG_ID: &str = "SELECT id::int8 FROM logs WHERE job_id = $1";

const INSERT_LOG_PART: &str = r#"
    INSERT INTO log_parts (log_id, number, content, final, created_at)
    VALUES ($1, $2, $3, $4, $5)
    RETURNING id::int8
"#;

/// Store backed by a private connection pool
///
/// Every worker builds its own instance so no two workers queue behind the
/// same connection.
#[derive(Debug, Clone)]
pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.connections_per_worker)
            .min_connections(0)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        tracing::debug!(
            max_connections = config.connections_per_worker,
            "Database connection pool created"
        );

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(StoreError::from)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn find_log_id(&self, job_id: i64) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(FIND_LOG_ID)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { job_id })
    }

    async fn create_log_part(&self, part: &NewLogPart<'_>) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(INSERT_LOG_PART)
            .bind(part.log_id)
            .bind(part.number)
            .bind(part.content)
            .bind(part.is_final)
            .bind(part.created_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(id)
    }
}
