//! PostgreSQL checkpoint store
//!
//! One row per (source, document id) holding the JSON document as JSONB.

use super::{validate_key, CheckpointStore, DocumentKind};
use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS harvest_documents (
    source      TEXT        NOT NULL,
    id          TEXT        NOT NULL,
    document    JSONB       NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (source, id)
)
"#;

/// Checkpoint store backed by a PostgreSQL table
#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    /// Connect and make sure the document table exists.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn get(&self, key: &str, kind: DocumentKind) -> Result<Option<Value>, StoreError> {
        validate_key(key)?;

        let row: Option<Json<Value>> = sqlx::query_scalar(
            "SELECT document FROM harvest_documents WHERE source = $1 AND id = $2",
        )
        .bind(key)
        .bind(kind.id())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|Json(doc)| doc))
    }

    async fn put(&self, key: &str, kind: DocumentKind, doc: &Value) -> Result<(), StoreError> {
        validate_key(key)?;

        sqlx::query(
            r#"
            INSERT INTO harvest_documents (source, id, document, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (source, id)
            DO UPDATE SET document = EXCLUDED.document, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(kind.id())
        .bind(Json(doc))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, key: &str, kind: DocumentKind) -> Result<bool, StoreError> {
        validate_key(key)?;

        let result = sqlx::query("DELETE FROM harvest_documents WHERE source = $1 AND id = $2")
            .bind(key)
            .bind(kind.id())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
