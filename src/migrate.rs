use sqlx::SqlitePool;
use tracing::info;

use crate::error::{Result, Service, ServiceResultExt};
use crate::{keyword, vector};

/// Create every table the SQLite adapters use. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            jurisdiction TEXT NOT NULL,
            content_ref TEXT NOT NULL,
            version TEXT NOT NULL,
            parent_id TEXT,
            created_by TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            modified_at INTEGER,
            modified_by TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .service_err(Service::Storage)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_weights (
            document_id TEXT PRIMARY KEY,
            jurisdiction_score REAL NOT NULL,
            recency_score REAL NOT NULL,
            manual_boost REAL NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await
    .service_err(Service::Storage)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            page INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await
    .service_err(Service::Storage)?;

    sqlx::query(vector::CREATE_TABLE)
        .execute(pool)
        .await
        .service_err(Service::Storage)?;

    keyword::create_fts_table(pool).await?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)",
        "CREATE INDEX IF NOT EXISTS idx_documents_parent_id ON documents(parent_id)",
        "CREATE INDEX IF NOT EXISTS idx_documents_jurisdiction ON documents(jurisdiction)",
        vector::CREATE_INDEX,
    ] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .service_err(Service::Storage)?;
    }

    info!("database schema is up to date");
    Ok(())
}
