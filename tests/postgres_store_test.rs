//! Tests for the PostgreSQL store adapter.
//!
//! These need a disposable database: set `DATABASE_URL` to run them, otherwise
//! they return early.
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use serde_json::json;
use sqlx::{Row, postgres::PgPoolOptions};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use verify_worker::engine::{EngineSettings, LocalQueue, ProviderRegistry, VerificationEngine};
use verify_worker::error::BlobError;
use verify_worker::model::{DeskId, ItemId};
use verify_worker::observability::Telemetry;
use verify_worker::store::{
    ArchiveStore, BlobStore, Collaborators, DeskDirectory, FieldPatch, ItemFilter, ItemStore,
    PgStore, StoreHealth, VerificationStore, WritePolicy,
};

/// Sweeps see every unverified row, so tests sharing the database run one at a time.
static DB_LOCK: Mutex<()> = Mutex::const_new(());

async fn setup_store() -> Option<(MutexGuard<'static, ()>, PgStore)> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping PostgreSQL store test");
        return None;
    };
    let guard = DB_LOCK.lock().await;
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&database_url)
        .await
        .expect("database connection");
    let store = PgStore::new(pool);
    store.ensure_schema().await.expect("schema applies");
    Some((guard, store))
}

/// Inserts an ingest item with a fresh id and optionally its original bytes.
async fn insert_picture(store: &PgStore, with_original: bool) -> ItemId {
    let id = format!("urn:test:{}", Uuid::now_v7());
    let media = format!("media-{id}");
    let mut doc = json!({ "_id": id, "type": "picture", "slugline": "harbour-fire" });
    if with_original {
        doc["renditions"] = json!({ "original": { "href": "http://cdn/x.jpg", "media": media } });
        sqlx::query("INSERT INTO ingest_media (media_id, content) VALUES ($1, $2)")
            .bind(&media)
            .bind(vec![0xFF_u8, 0xD8, 0xFF])
            .execute(store.pool())
            .await
            .expect("insert media");
    }
    sqlx::query("INSERT INTO ingest_items (id, doc) VALUES ($1, $2)")
        .bind(&id)
        .bind(sqlx::types::Json(doc))
        .execute(store.pool())
        .await
        .expect("insert item");
    ItemId(id)
}

async fn insert_desk(store: &PgStore) -> (String, DeskId) {
    let id = format!("desk-{}", Uuid::now_v7());
    let name = format!("Verified {id}");
    sqlx::query("INSERT INTO desks (id, name) VALUES ($1, $2)")
        .bind(&id)
        .bind(&name)
        .execute(store.pool())
        .await
        .expect("insert desk");
    (name, DeskId(id))
}

async fn item_doc(store: &PgStore, id: &ItemId) -> Option<serde_json::Value> {
    sqlx::query("SELECT doc FROM ingest_items WHERE id = $1")
        .bind(id.as_str())
        .fetch_optional(store.pool())
        .await
        .expect("select item")
        .map(|row| row.get::<sqlx::types::Json<serde_json::Value>, _>("doc").0)
}

#[tokio::test]
async fn ping_succeeds_against_live_database() {
    let Some((_guard, store)) = setup_store().await else {
        return;
    };
    store.ping().await.expect("ping");
}

#[tokio::test]
async fn nested_patches_do_not_clobber_sibling_fields() {
    let Some((_guard, store)) = setup_store().await else {
        return;
    };
    let item = insert_picture(&store, true).await;

    ItemStore::patch(
        &store,
        &item,
        &FieldPatch::new().set("verification", json!({ "id": Uuid::nil(), "status": "in_progress" })),
    )
    .await
    .expect("marker patch");
    ItemStore::patch(&store, &item, &FieldPatch::new().set("verification.tineye", 4))
        .await
        .expect("tineye patch");
    ItemStore::patch(&store, &item, &FieldPatch::new().set("verification.izitru", json!(null)))
        .await
        .expect("izitru patch");

    let doc = item_doc(&store, &item).await.expect("item exists");
    assert_eq!(doc["slugline"], "harbour-fire");
    assert_eq!(doc["verification"]["status"], "in_progress");
    assert_eq!(doc["verification"]["tineye"], 4);
    assert!(doc["verification"].get("izitru").is_some());
}

#[tokio::test]
async fn patching_a_missing_item_is_not_found() {
    let Some((_guard, store)) = setup_store().await else {
        return;
    };
    let error = ItemStore::patch(
        &store,
        &ItemId::new(format!("urn:missing:{}", Uuid::now_v7())),
        &FieldPatch::new().set("verification.status", "completed"),
    )
    .await
    .expect_err("missing item");

    assert!(!error.is_transient());
}

#[tokio::test]
async fn unverified_query_skips_marked_items() {
    let Some((_guard, store)) = setup_store().await else {
        return;
    };
    let fresh = insert_picture(&store, true).await;
    let marked = insert_picture(&store, true).await;
    ItemStore::patch(
        &store,
        &marked,
        &FieldPatch::new().set("verification", json!({ "id": Uuid::nil(), "status": "in_progress" })),
    )
    .await
    .expect("marker patch");

    let ids: Vec<ItemId> = store
        .find(ItemFilter::unverified_pictures())
        .map_ok(|item| item.id)
        .try_collect()
        .await
        .expect("query runs");

    assert!(ids.contains(&fresh));
    assert!(!ids.contains(&marked));
}

#[tokio::test]
async fn undecodable_document_is_an_item_level_error() {
    let Some((_guard, store)) = setup_store().await else {
        return;
    };
    let id = format!("urn:test:{}", Uuid::now_v7());
    sqlx::query("INSERT INTO ingest_items (id, doc) VALUES ($1, $2)")
        .bind(&id)
        .bind(sqlx::types::Json(json!({ "_id": id, "type": "picture", "renditions": null })))
        .execute(store.pool())
        .await
        .expect("insert item");

    let results: Vec<_> = store.find(ItemFilter::unverified_pictures()).collect().await;
    let broken = results
        .iter()
        .filter_map(|result| result.as_ref().err())
        .find(|error| error.to_string().contains(&id))
        .expect("malformed row reported");

    assert!(broken.is_item_level());
    sqlx::query("DELETE FROM ingest_items WHERE id = $1")
        .bind(&id)
        .execute(store.pool())
        .await
        .expect("cleanup");
}

#[tokio::test]
async fn missing_original_is_reported_as_not_found() {
    let Some((_guard, store)) = setup_store().await else {
        return;
    };
    let id = insert_picture(&store, false).await;
    let item = store
        .find(ItemFilter::unverified_pictures())
        .try_filter(|item| futures::future::ready(item.id == id))
        .try_next()
        .await
        .expect("query runs")
        .expect("item found");

    let error = store.fetch_original(&item).await.expect_err("no original");

    assert!(matches!(error, BlobError::ImageNotFound(_)));
}

#[tokio::test]
async fn fetch_into_desk_and_delete_are_idempotent() {
    let Some((_guard, store)) = setup_store().await else {
        return;
    };
    let (name, desk) = insert_desk(&store).await;
    let item = insert_picture(&store, true).await;

    assert_eq!(store.find_by_name(&name).await.expect("desk lookup"), Some(desk.clone()));
    store.fetch_into_desk(&item, &desk).await.expect("first fetch");
    store.fetch_into_desk(&item, &desk).await.expect("second fetch");
    store.delete(&item).await.expect("first delete");
    store.delete(&item).await.expect("second delete");

    let archived: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM archive_items WHERE item_id = $1")
        .bind(item.as_str())
        .fetch_one(store.pool())
        .await
        .expect("count archive");
    assert_eq!(archived, 1);
    assert!(item_doc(&store, &item).await.is_none());
}

#[tokio::test]
async fn sweep_without_providers_archives_items() {
    let Some((_guard, store)) = setup_store().await else {
        return;
    };
    let (name, desk) = insert_desk(&store).await;
    let item = insert_picture(&store, true).await;
    let store = Arc::new(store);
    let telemetry = Telemetry::without_tracing().expect("telemetry");
    let queue = LocalQueue::new(telemetry.metrics());
    let engine = VerificationEngine::new(
        Collaborators::from_backend(Arc::clone(&store)),
        ProviderRegistry::new(),
        Arc::new(queue.clone()),
        EngineSettings {
            desk_name: name,
            write_policy: WritePolicy::default(),
        },
        telemetry.metrics(),
    );
    queue.start(Arc::new(engine.clone()), 2);

    engine.verify_ingest().await.expect("sweep runs");
    tokio::time::timeout(Duration::from_secs(10), queue.wait_idle())
        .await
        .expect("runs settle");

    let row = sqlx::query("SELECT desk_id, doc FROM archive_items WHERE item_id = $1")
        .bind(item.as_str())
        .fetch_one(store.pool())
        .await
        .expect("archived row");
    assert_eq!(row.get::<String, _>("desk_id"), desk.0);
    let doc = row.get::<sqlx::types::Json<serde_json::Value>, _>("doc").0;
    assert_eq!(doc["verification"]["status"], "completed");

    let record_id = serde_json::from_value(doc["verification"]["id"].clone()).expect("id");
    let record = store.get(record_id).await.expect("record query");
    assert!(record.is_some());
}
