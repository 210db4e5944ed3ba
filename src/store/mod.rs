//! Document store abstraction the rest of the crate is written against.
//!
//! Documents are untyped JSON objects grouped in named collections; the
//! typed boundary lives in [`crate::schema`]. Backends: [`inmem`] (default)
//! and [`pg`] (feature `postgres-store`).

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(feature = "inmem-store")]
pub mod inmem;
#[cfg(feature = "postgres-store")]
pub mod pg;

pub type Document = serde_json::Map<String, Value>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("not found")] NotFound,
    #[error("already exists")] AlreadyExists,
    #[error("field `{0}` is not an integer")] NotNumeric(String),
    #[error("invalid cursor")] InvalidCursor,
    #[error("backend: {0}")] Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A document together with its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDoc {
    pub id: String,
    pub data: Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self { field: field.to_string(), op: FilterOp::Eq, value: value.into() }
    }

    pub fn is_in<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        Self { field: field.to_string(), op: FilterOp::In, value: Value::Array(values) }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        let actual = doc.get(&self.field).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::In => match &self.value {
                Value::Array(candidates) => candidates.iter().any(|c| c == actual),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub dir: Direction,
}

impl OrderBy {
    pub fn asc(field: &str) -> Self { Self { field: field.to_string(), dir: Direction::Asc } }
    pub fn desc(field: &str) -> Self { Self { field: field.to_string(), dir: Direction::Desc } }
}

/// Position of a document within an ordered query: the values of every
/// `order_by` field followed by the document id, which breaks ties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub values: Vec<Value>,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub start_after: Option<Cursor>,
}

impl Query {
    pub fn new() -> Self { Self::default() }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, cursor: Option<Cursor>) -> Self {
        self.start_after = cursor;
        self
    }

    /// Sort position of `doc` under this query's ordering.
    pub fn cursor_for(&self, doc: &StoredDoc) -> Cursor {
        let values = self
            .order_by
            .iter()
            .map(|o| doc.data.get(&o.field).cloned().unwrap_or(Value::Null))
            .collect();
        Cursor { values, id: doc.id.clone() }
    }

    /// Compare two sort positions under this query's ordering.
    pub fn compare(&self, a: &Cursor, b: &Cursor) -> Ordering {
        for (i, order) in self.order_by.iter().enumerate() {
            let av = a.values.get(i).unwrap_or(&Value::Null);
            let bv = b.values.get(i).unwrap_or(&Value::Null);
            let ord = compare_values(av, bv);
            let ord = match order.dir {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.id.cmp(&b.id)
    }
}

/// Result of one `query` call.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub items: Vec<StoredDoc>,
    /// Position of the last item, `None` when the page is empty.
    pub last_cursor: Option<Cursor>,
}

/// Total order over JSON values used for sorting:
/// null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

pub type SnapshotCallback = Arc<dyn Fn(&[StoredDoc]) + Send + Sync>;

/// Handle for a live query. Dropping it, or calling [`unsubscribe`], stops
/// delivery.
///
/// [`unsubscribe`]: Subscription::unsubscribe
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Document>;
    /// Insert only if absent; `AlreadyExists` otherwise.
    async fn create(&self, collection: &str, id: &str, doc: Document) -> StoreResult<()>;
    /// Full overwrite.
    async fn put(&self, collection: &str, id: &str, doc: Document) -> StoreResult<()>;
    /// Shallow merge into an existing document.
    async fn update(&self, collection: &str, id: &str, fields: Document) -> StoreResult<()>;
    /// Deleting a missing document succeeds; returns whether this call
    /// removed one.
    async fn delete(&self, collection: &str, id: &str) -> StoreResult<bool>;
    async fn query(&self, collection: &str, query: &Query) -> StoreResult<QueryPage>;
    /// Atomically add `delta` to an integer field (missing counts as 0) and
    /// return the new value.
    async fn increment(&self, collection: &str, id: &str, field: &str, delta: i64) -> StoreResult<i64>;
    /// Append each value not already present in the array field.
    async fn array_union(&self, collection: &str, id: &str, field: &str, values: Vec<Value>) -> StoreResult<()>;
    /// Remove every element equal to one of `values` from the array field.
    async fn array_remove(&self, collection: &str, id: &str, field: &str, values: Vec<Value>) -> StoreResult<()>;
    /// Deliver the query result now and again after every write to the
    /// collection, until the returned handle is dropped.
    async fn subscribe(&self, collection: &str, query: Query, callback: SnapshotCallback) -> StoreResult<Subscription>;

    /// Create a document under a store-generated id.
    async fn add(&self, collection: &str, doc: Document) -> StoreResult<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.create(collection, &id, doc).await?;
        Ok(id)
    }
}
