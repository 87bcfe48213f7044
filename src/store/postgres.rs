//! PostgreSQL adapter. Items and records are JSONB documents; a field
//! patch is applied with `jsonb_set` inside a single transaction.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{
    ArchiveStore, BlobStore, DeskDirectory, FieldPatch, ItemFilter, ItemStore, StoreHealth,
    VerificationStore,
};
use crate::error::{BlobError, StoreError};
use crate::model::{DeskId, IngestItem, ItemId, OriginalImage, VerificationId, VerificationRecord};
use crate::util::error::classify_sqlx;

const SCHEMA: &str = include_str!("../../migrations/0001_verification.sql");

/// A JSONB document column addressed by a key column.
struct DocumentColumn {
    table: &'static str,
    key: &'static str,
    key_cast: &'static str,
    column: &'static str,
    entity: &'static str,
}

const INGEST_DOC: DocumentColumn = DocumentColumn {
    table: "ingest_items",
    key: "id",
    key_cast: "text",
    column: "doc",
    entity: "ingest item",
};

const RECORD_RESULTS: DocumentColumn = DocumentColumn {
    table: "verification_records",
    key: "id",
    key_cast: "uuid",
    column: "results",
    entity: "verification record",
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the embedded schema. Every statement is idempotent.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to apply verification schema")?;
        Ok(())
    }

    async fn apply_patch(
        &self,
        target: &DocumentColumn,
        key: &str,
        patch: &FieldPatch,
    ) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(classify_sqlx)?;

        for (path, value) in patch.iter() {
            let segments = path.segments();
            // Parents first: jsonb_set only creates the last key of a path.
            for depth in 1..segments.len() {
                let prefix = segments[..depth].to_vec();
                let updated = set_object_at(&mut tx, target, key, prefix).await?;
                if !updated {
                    return Err(not_found(target, key));
                }
            }
            let updated = set_value_at(&mut tx, target, key, segments.to_vec(), value).await?;
            if !updated {
                return Err(not_found(target, key));
            }
        }

        tx.commit().await.map_err(classify_sqlx)?;
        Ok(())
    }
}

fn not_found(target: &DocumentColumn, key: &str) -> StoreError {
    StoreError::NotFound {
        entity: target.entity,
        id: key.to_string(),
    }
}

/// Ensures the value at `path` is an object, replacing scalars and nulls.
async fn set_object_at(
    tx: &mut Transaction<'_, Postgres>,
    target: &DocumentColumn,
    key: &str,
    path: Vec<String>,
) -> Result<bool, StoreError> {
    let sql = format!(
        "UPDATE {table} SET {column} = jsonb_set({column}, $2::text[], \
         CASE WHEN jsonb_typeof({column} #> $2::text[]) = 'object' \
         THEN {column} #> $2::text[] ELSE '{{}}'::jsonb END, true), \
         updated_at = NOW() \
         WHERE {key} = $1::{cast}",
        table = target.table,
        column = target.column,
        key = target.key,
        cast = target.key_cast,
    );
    let result = sqlx::query(&sql)
        .bind(key)
        .bind(path)
        .execute(&mut **tx)
        .await
        .map_err(classify_sqlx)?;
    Ok(result.rows_affected() > 0)
}

async fn set_value_at(
    tx: &mut Transaction<'_, Postgres>,
    target: &DocumentColumn,
    key: &str,
    path: Vec<String>,
    value: &Value,
) -> Result<bool, StoreError> {
    let sql = format!(
        "UPDATE {table} SET {column} = jsonb_set({column}, $2::text[], $3, true), \
         updated_at = NOW() \
         WHERE {key} = $1::{cast}",
        table = target.table,
        column = target.column,
        key = target.key,
        cast = target.key_cast,
    );
    let result = sqlx::query(&sql)
        .bind(key)
        .bind(path)
        .bind(Json(value))
        .execute(&mut **tx)
        .await
        .map_err(classify_sqlx)?;
    Ok(result.rows_affected() > 0)
}

fn decode_item(row: &PgRow) -> Result<IngestItem, StoreError> {
    let id: String = row.try_get("id").map_err(classify_sqlx)?;
    let Json(doc): Json<Value> = row.try_get("doc").map_err(classify_sqlx)?;
    let mut item: IngestItem = match serde_json::from_value(doc) {
        Ok(item) => item,
        Err(error) => {
            return Err(StoreError::MalformedItem {
                id,
                reason: error.to_string(),
            });
        }
    };
    item.id = ItemId(id);
    Ok(item)
}

#[async_trait]
impl ItemStore for PgStore {
    fn find(&self, filter: ItemFilter) -> BoxStream<'_, Result<IngestItem, StoreError>> {
        sqlx::query(
            r"
            SELECT id, doc
            FROM ingest_items
            WHERE ($1::text IS NULL OR doc ->> 'type' = $1::text)
              AND (NOT $2 OR (doc -> 'verification') IS NULL
                   OR jsonb_typeof(doc -> 'verification') = 'null')
            ORDER BY created_at, id
            ",
        )
        .bind(filter.kind.map(|kind| kind.as_str()))
        .bind(filter.verification_absent)
        .fetch(&self.pool)
        .map(|row| row.map_err(classify_sqlx).and_then(|row| decode_item(&row)))
        .boxed()
    }

    async fn patch(&self, id: &ItemId, patch: &FieldPatch) -> Result<(), StoreError> {
        self.apply_patch(&INGEST_DOC, id.as_str(), patch).await
    }

    async fn delete(&self, id: &ItemId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM ingest_items WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl VerificationStore for PgStore {
    async fn create(&self) -> Result<VerificationId, StoreError> {
        let id = VerificationId::generate();
        sqlx::query("INSERT INTO verification_records (id) VALUES ($1)")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx)?;
        Ok(id)
    }

    async fn patch(&self, id: VerificationId, patch: &FieldPatch) -> Result<(), StoreError> {
        self.apply_patch(&RECORD_RESULTS, &id.to_string(), patch)
            .await
    }

    async fn get(&self, id: VerificationId) -> Result<Option<VerificationRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, results, created_at FROM verification_records WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record_id: Uuid = row.try_get("id").map_err(classify_sqlx)?;
        let Json(results): Json<Map<String, Value>> =
            row.try_get("results").map_err(classify_sqlx)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(classify_sqlx)?;
        Ok(Some(VerificationRecord {
            id: VerificationId(record_id),
            results,
            created_at,
        }))
    }
}

#[async_trait]
impl BlobStore for PgStore {
    async fn fetch_original(&self, item: &IngestItem) -> Result<OriginalImage, BlobError> {
        let rendition = item
            .original_rendition()
            .ok_or_else(|| BlobError::ImageNotFound(item.id.clone()))?;
        let bytes: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT content FROM ingest_media WHERE media_id = $1")
                .bind(&rendition.media)
                .fetch_optional(&self.pool)
                .await
                .map_err(classify_sqlx)?;
        let bytes = bytes.ok_or_else(|| BlobError::ImageNotFound(item.id.clone()))?;
        Ok(OriginalImage {
            href: rendition.href.clone(),
            bytes,
        })
    }
}

#[async_trait]
impl DeskDirectory for PgStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<DeskId>, StoreError> {
        let id: Option<String> = sqlx::query_scalar("SELECT id FROM desks WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx)?;
        Ok(id.map(DeskId))
    }
}

#[async_trait]
impl StoreHealth for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl ArchiveStore for PgStore {
    async fn fetch_into_desk(&self, item: &ItemId, desk: &DeskId) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO archive_items (item_id, desk_id, doc)
            SELECT id, $2, doc FROM ingest_items WHERE id = $1
            ON CONFLICT (item_id) DO NOTHING
            ",
        )
        .bind(item.as_str())
        .bind(&desk.0)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;
        Ok(())
    }
}
