#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::Notify;

use craftfeed::authoring::AuthoringService;
use craftfeed::engagement::EngagementService;
use craftfeed::feed::{ComposerConfig, FeedComposer};
use craftfeed::models::{NewProfile, Post, Timestamp};
use craftfeed::profile::{ProfileCache, ProfileService};
use craftfeed::repo::{insert_post_raw, CommentLayout, DocRepo, Repo};
use craftfeed::storage::{BlobError, BlobStore};
use craftfeed::store::inmem::InMemStore;
use craftfeed::store::{
    Document, DocumentStore, Query, QueryPage, SnapshotCallback, StoreError, StoreResult, Subscription,
};

// ---------------- In-memory mock BlobStore (tests only) ----------------
#[derive(Default)]
pub struct MockBlobStore {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub deleted: Mutex<Vec<String>>,
    pub fail_deletes: AtomicBool,
}

pub const BLOB_BASE: &str = "https://blobs.test";

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn upload(&self, path: &str, bytes: &[u8], _mime: &str) -> Result<String, BlobError> {
        let url = format!("{BLOB_BASE}/{path}");
        self.objects.lock().unwrap().insert(url.clone(), bytes.to_vec());
        Ok(url)
    }

    async fn delete(&self, url: &str) -> Result<(), BlobError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BlobError::Other("blob backend offline".into()));
        }
        self.objects.lock().unwrap().remove(url);
        self.deleted.lock().unwrap().push(url.to_string());
        Ok(())
    }

    fn key_of(&self, url: &str) -> Option<String> {
        url.strip_prefix(BLOB_BASE)?.strip_prefix('/').map(str::to_string)
    }
}

/// URL an image named `name` would have after `owner` uploaded it.
pub fn owned_image(owner: &str, name: &str) -> String {
    format!("{BLOB_BASE}/{}{name}", craftfeed::storage::image_prefix(owner))
}

// ---------------- Store wrapper with fault and timing knobs ----------------
#[derive(Default)]
pub struct TestStore {
    pub inner: InMemStore,
    pub fail_increments: AtomicBool,
    pub fail_queries: AtomicBool,
    /// Deletes in this collection fail.
    pub fail_deletes_in: Mutex<Option<String>>,
    /// While set, trending queries (ordered by likeCount) park until released.
    pub hold_trending: AtomicBool,
    /// Yield to the scheduler before reads and writes so joined futures
    /// interleave.
    pub yield_each_call: AtomicBool,
    pub trending_entered: Notify,
    pub trending_release: Notify,
}

fn offline() -> StoreError {
    StoreError::Backend("injected failure".into())
}

impl TestStore {
    async fn maybe_yield(&self) {
        if self.yield_each_call.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl DocumentStore for TestStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Document> {
        self.maybe_yield().await;
        self.inner.get(collection, id).await
    }
    async fn create(&self, collection: &str, id: &str, doc: Document) -> StoreResult<()> {
        self.maybe_yield().await;
        self.inner.create(collection, id, doc).await
    }
    async fn put(&self, collection: &str, id: &str, doc: Document) -> StoreResult<()> {
        self.inner.put(collection, id, doc).await
    }
    async fn update(&self, collection: &str, id: &str, fields: Document) -> StoreResult<()> {
        self.inner.update(collection, id, fields).await
    }
    async fn delete(&self, collection: &str, id: &str) -> StoreResult<bool> {
        self.maybe_yield().await;
        if self.fail_deletes_in.lock().unwrap().as_deref() == Some(collection) {
            return Err(offline());
        }
        self.inner.delete(collection, id).await
    }
    async fn query(&self, collection: &str, query: &Query) -> StoreResult<QueryPage> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(offline());
        }
        let trending = query.order_by.first().map(|o| o.field == "likeCount").unwrap_or(false);
        if trending && self.hold_trending.load(Ordering::SeqCst) {
            self.trending_entered.notify_one();
            self.trending_release.notified().await;
        }
        self.inner.query(collection, query).await
    }
    async fn increment(&self, collection: &str, id: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.maybe_yield().await;
        if self.fail_increments.load(Ordering::SeqCst) {
            return Err(offline());
        }
        self.inner.increment(collection, id, field, delta).await
    }
    async fn array_union(&self, collection: &str, id: &str, field: &str, values: Vec<Value>) -> StoreResult<()> {
        self.inner.array_union(collection, id, field, values).await
    }
    async fn array_remove(&self, collection: &str, id: &str, field: &str, values: Vec<Value>) -> StoreResult<()> {
        self.inner.array_remove(collection, id, field, values).await
    }
    async fn subscribe(&self, collection: &str, query: Query, callback: SnapshotCallback) -> StoreResult<Subscription> {
        self.inner.subscribe(collection, query, callback).await
    }
}

pub struct Harness {
    pub store: Arc<TestStore>,
    pub blobs: Arc<MockBlobStore>,
    pub repo: Arc<dyn Repo>,
    pub profiles: ProfileService,
    pub composer: FeedComposer,
    pub engagement: EngagementService,
    pub authoring: AuthoringService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_layout(CommentLayout::Collection)
    }

    pub fn with_layout(layout: CommentLayout) -> Self {
        let store = Arc::new(TestStore::default());
        let blobs = Arc::new(MockBlobStore::default());
        let repo: Arc<dyn Repo> = Arc::new(DocRepo::new(store.clone()).with_comment_layout(layout));
        let cache = ProfileCache::new();
        let profiles = ProfileService::new(repo.clone(), cache.clone());
        Self {
            composer: FeedComposer::new(repo.clone(), profiles.clone(), ComposerConfig::default()),
            engagement: EngagementService::new(repo.clone(), blobs.clone(), cache.clone()),
            authoring: AuthoringService::new(repo.clone(), blobs.clone(), cache),
            profiles,
            repo,
            store,
            blobs,
        }
    }

    pub async fn user(&self, id: &str) {
        self.repo
            .ensure_profile(
                id,
                NewProfile {
                    username: id.to_string(),
                    email: format!("{id}@example.com"),
                    display_name: Some(format!("{id} the crafter")),
                    avatar_url: None,
                },
            )
            .await
            .unwrap();
    }

    /// Insert a post created `minute` minutes after a fixed epoch.
    pub async fn post(&self, id: &str, author: &str, minute: i64) -> Post {
        self.post_with(id, author, minute, 0, &[], "a handmade thing").await
    }

    pub async fn post_with(
        &self,
        id: &str,
        author: &str,
        minute: i64,
        like_count: i64,
        categories: &[&str],
        description: &str,
    ) -> Post {
        let at = at_minute(minute);
        let post = Post::new(
            id.to_string(),
            author.to_string(),
            description.to_string(),
            vec![],
            like_count,
            categories.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>(),
            "General".to_string(),
            at,
            at,
        );
        insert_post_raw(self.store.as_ref(), &post).await.unwrap();
        post
    }
}

pub fn at_minute(minute: i64) -> Timestamp {
    Utc.timestamp_millis_opt(1_700_000_000_000).unwrap() + Duration::minutes(minute)
}

pub fn ids(items: &[craftfeed::models::FeedItem]) -> Vec<&str> {
    items.iter().map(|i| i.post.id.as_str()).collect()
}
