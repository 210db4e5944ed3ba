#![cfg(feature = "postgres-store")]

use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;

use craftfeed::store::pg::PgStore;
use craftfeed::store::{Document, DocumentStore, OrderBy, Query, StoreError};

fn doc(v: Value) -> Document {
    v.as_object().cloned().unwrap()
}

async fn store() -> Option<PgStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(&url)
        .await
        .ok()?;
    let store = PgStore::new(pool);
    store.migrate().await.ok()?;
    Some(store)
}

// unique per run so reruns against the same database start clean
fn collection(name: &str) -> String {
    format!("{name}_{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
#[serial_test::serial]
async fn crud_and_counters() {
    let Some(store) = store().await else {
        eprintln!("skip: no DATABASE_URL");
        return;
    };
    let posts = collection("posts");

    store.create(&posts, "p1", doc(json!({"likeCount": 0}))).await.unwrap();
    assert!(matches!(
        store.create(&posts, "p1", doc(json!({}))).await,
        Err(StoreError::AlreadyExists)
    ));
    assert_eq!(store.increment(&posts, "p1", "likeCount", 2).await.unwrap(), 2);
    assert_eq!(store.increment(&posts, "p1", "likeCount", -1).await.unwrap(), 1);

    store.array_union(&posts, "p1", "images", vec![json!("a"), json!("b"), json!("a")]).await.unwrap();
    store.array_remove(&posts, "p1", "images", vec![json!("a")]).await.unwrap();
    let p1 = store.get(&posts, "p1").await.unwrap();
    assert_eq!(p1["images"], json!(["b"]));

    assert!(store.delete(&posts, "p1").await.unwrap());
    assert!(!store.delete(&posts, "p1").await.unwrap());
    assert!(matches!(store.get(&posts, "p1").await, Err(StoreError::NotFound)));
}

#[tokio::test]
#[serial_test::serial]
async fn keyset_paging_matches_the_in_memory_order() {
    let Some(store) = store().await else {
        eprintln!("skip: no DATABASE_URL");
        return;
    };
    let posts = collection("posts");
    for (id, likes) in [("a", 3), ("b", 5), ("c", 3), ("d", 1)] {
        store.put(&posts, id, doc(json!({"likeCount": likes}))).await.unwrap();
    }
    let base = Query::new().order(OrderBy::desc("likeCount")).limit(2);
    let first = store.query(&posts, &base).await.unwrap();
    let second = store.query(&posts, &base.clone().start_after(first.last_cursor)).await.unwrap();
    let ids: Vec<_> = first.items.iter().chain(second.items.iter()).map(|d| d.id.as_str()).collect();
    assert_eq!(ids, ["b", "a", "c", "d"]);
}
