use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::*;

const SNAPSHOT_FILE: &str = "state.json";

#[derive(Default, Serialize, Deserialize)]
struct State {
    collections: HashMap<String, HashMap<String, Document>>,
}

impl State {
    fn doc_mut(&mut self, collection: &str, id: &str) -> StoreResult<&mut Document> {
        self.collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or(StoreError::NotFound)
    }

    fn run_query(&self, collection: &str, query: &Query) -> QueryPage {
        let Some(docs) = self.collections.get(collection) else {
            return QueryPage::default();
        };
        let mut hits: Vec<(Cursor, StoredDoc)> = docs
            .iter()
            .filter(|(_, d)| query.filters.iter().all(|f| f.matches(d)))
            .map(|(id, d)| {
                let doc = StoredDoc { id: id.clone(), data: d.clone() };
                (query.cursor_for(&doc), doc)
            })
            .collect();
        hits.sort_by(|(a, _), (b, _)| query.compare(a, b));
        if let Some(after) = &query.start_after {
            hits.retain(|(pos, _)| query.compare(pos, after) == std::cmp::Ordering::Greater);
        }
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        let last_cursor = hits.last().map(|(pos, _)| pos.clone());
        QueryPage { items: hits.into_iter().map(|(_, d)| d).collect(), last_cursor }
    }
}

struct Subscriber {
    collection: String,
    query: Query,
    callback: SnapshotCallback,
}

/// Process-local store. Every write notifies the subscribers of the touched
/// collection after the state lock is released.
#[derive(Clone)]
pub struct InMemStore {
    state: Arc<RwLock<State>>,
    subscribers: Arc<Mutex<HashMap<u64, Subscriber>>>,
    next_subscriber: Arc<AtomicU64>,
    snapshot_path: Option<Arc<PathBuf>>,
}

impl Default for InMemStore {
    fn default() -> Self { Self::new() }
}

impl InMemStore {
    /// Volatile store, nothing written to disk.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: Arc::new(AtomicU64::new(0)),
            snapshot_path: None,
        }
    }

    /// Store persisted as `<dir>/state.json`, loaded on start when present.
    pub fn with_snapshot_dir(dir: &Path) -> Self {
        let path = dir.join(SNAPSHOT_FILE);
        let state = Self::load_state_from(&path);
        Self {
            state: Arc::new(RwLock::new(state)),
            snapshot_path: Some(Arc::new(path)),
            ..Self::new()
        }
    }

    fn load_state_from(path: &Path) -> State {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                Ok(s) => {
                    info!("[inmem] loaded snapshot '{}'", path.display());
                    s
                }
                Err(e) => {
                    warn!("[inmem] failed to parse snapshot '{}': {e}. Starting empty.", path.display());
                    State::default()
                }
            },
            Err(e) => {
                info!("[inmem] no snapshot at '{}': {e}. Starting empty.", path.display());
                State::default()
            }
        }
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| StoreError::Backend("state lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| StoreError::Backend("state lock poisoned".into()))
    }

    fn persist(&self) {
        let Some(path) = self.snapshot_path.as_ref() else { return };
        let bytes = match self.read().map(|s| serde_json::to_vec_pretty(&*s)) {
            Ok(Ok(bytes)) => bytes,
            _ => return,
        };
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        if let Err(e) = std::fs::write(path.as_ref(), bytes) {
            warn!("[inmem] failed to write snapshot '{}': {e}", path.display());
        }
    }

    /// Persist, then push a fresh snapshot to every subscriber of `collection`.
    fn after_write(&self, collection: &str) {
        self.persist();
        let targets: Vec<(Query, SnapshotCallback)> = match self.subscribers.lock() {
            Ok(subs) => subs
                .values()
                .filter(|s| s.collection == collection)
                .map(|s| (s.query.clone(), s.callback.clone()))
                .collect(),
            Err(_) => return,
        };
        for (query, callback) in targets {
            let page = match self.read() {
                Ok(s) => s.run_query(collection, &query),
                Err(_) => return,
            };
            callback(&page.items);
        }
    }

    /// Number of live subscriptions, all collections.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for InMemStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Document> {
        let s = self.read()?;
        s.collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create(&self, collection: &str, id: &str, doc: Document) -> StoreResult<()> {
        let mut s = self.write()?;
        let docs = s.collections.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(StoreError::AlreadyExists);
        }
        docs.insert(id.to_string(), doc);
        drop(s);
        self.after_write(collection);
        Ok(())
    }

    async fn put(&self, collection: &str, id: &str, doc: Document) -> StoreResult<()> {
        let mut s = self.write()?;
        s.collections.entry(collection.to_string()).or_default().insert(id.to_string(), doc);
        drop(s);
        self.after_write(collection);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Document) -> StoreResult<()> {
        let mut s = self.write()?;
        let doc = s.doc_mut(collection, id)?;
        for (k, v) in fields {
            doc.insert(k, v);
        }
        drop(s);
        self.after_write(collection);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<bool> {
        let mut s = self.write()?;
        let removed = s.collections.get_mut(collection).and_then(|c| c.remove(id)).is_some();
        drop(s);
        if removed {
            self.after_write(collection);
        }
        Ok(removed)
    }

    async fn query(&self, collection: &str, query: &Query) -> StoreResult<QueryPage> {
        Ok(self.read()?.run_query(collection, query))
    }

    async fn increment(&self, collection: &str, id: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut s = self.write()?;
        let doc = s.doc_mut(collection, id)?;
        let current = match doc.get(field) {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| StoreError::NotNumeric(field.to_string()))?,
        };
        let next = current + delta;
        doc.insert(field.to_string(), Value::from(next));
        drop(s);
        self.after_write(collection);
        Ok(next)
    }

    async fn array_union(&self, collection: &str, id: &str, field: &str, values: Vec<Value>) -> StoreResult<()> {
        let mut s = self.write()?;
        let doc = s.doc_mut(collection, id)?;
        let entry = doc.entry(field.to_string()).or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(items) = entry {
            for v in values {
                if !items.contains(&v) {
                    items.push(v);
                }
            }
        }
        drop(s);
        self.after_write(collection);
        Ok(())
    }

    async fn array_remove(&self, collection: &str, id: &str, field: &str, values: Vec<Value>) -> StoreResult<()> {
        let mut s = self.write()?;
        let doc = s.doc_mut(collection, id)?;
        if let Some(Value::Array(items)) = doc.get_mut(field) {
            items.retain(|v| !values.contains(v));
        }
        drop(s);
        self.after_write(collection);
        Ok(())
    }

    async fn subscribe(&self, collection: &str, query: Query, callback: SnapshotCallback) -> StoreResult<Subscription> {
        let key = self.next_subscriber.fetch_add(1, AtomicOrdering::Relaxed);
        let initial = self.read()?.run_query(collection, &query);
        self.subscribers
            .lock()
            .map_err(|_| StoreError::Backend("subscriber lock poisoned".into()))?
            .insert(key, Subscriber { collection: collection.to_string(), query, callback: callback.clone() });
        callback(&initial.items);

        let subscribers = Arc::downgrade(&self.subscribers);
        Ok(Subscription::new(move || {
            if let Some(subs) = subscribers.upgrade() {
                if let Ok(mut subs) = subs.lock() {
                    subs.remove(&key);
                }
            }
        }))
    }
}
