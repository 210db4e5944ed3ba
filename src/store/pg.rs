//! Postgres backend: every collection lives in one JSONB `documents` table
//! (see `migrations/`). Live queries ride on `LISTEN documents_changed`,
//! fed by a trigger that sends the collection name as payload.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use tracing::{debug, warn};

use super::*;

const CHANGE_CHANNEL: &str = "documents_changed";

#[derive(Clone)]
pub struct PgStore { pool: Pool<Postgres> }

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        other => StoreError::Backend(other.to_string()),
    }
}

fn into_document(v: Value) -> StoreResult<Document> {
    match v {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::Backend("stored document is not an object".into())),
    }
}

fn push_order_expr(qb: &mut QueryBuilder<'_, Postgres>, field: &str) {
    qb.push("data->").push_bind(field.to_string());
}

/// Keyset predicate equivalent to "position > cursor" under `query`'s order:
/// `(k0 > v0) OR (k0 = v0 AND k1 > v1) OR ... OR (all equal AND id > cid)`.
fn push_start_after(qb: &mut QueryBuilder<'_, Postgres>, query: &Query, cursor: &Cursor) {
    qb.push(" AND (");
    for i in 0..=query.order_by.len() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push("(TRUE");
        for (j, order) in query.order_by.iter().take(i).enumerate() {
            qb.push(" AND ");
            push_order_expr(qb, &order.field);
            qb.push(" = ").push_bind(cursor.values.get(j).cloned().unwrap_or(Value::Null));
        }
        match query.order_by.get(i) {
            Some(order) => {
                qb.push(" AND ");
                push_order_expr(qb, &order.field);
                qb.push(match order.dir {
                    Direction::Asc => " > ",
                    Direction::Desc => " < ",
                });
                qb.push_bind(cursor.values.get(i).cloned().unwrap_or(Value::Null));
            }
            None => {
                qb.push(" AND id > ").push_bind(cursor.id.clone());
            }
        }
        qb.push(")");
    }
    qb.push(")");
}

async fn run_query(pool: &Pool<Postgres>, collection: &str, query: &Query) -> StoreResult<QueryPage> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT id, data FROM documents WHERE collection = ");
    qb.push_bind(collection.to_string());
    for f in &query.filters {
        qb.push(" AND ");
        match f.op {
            FilterOp::Eq => {
                qb.push("data->").push_bind(f.field.clone()).push(" = ").push_bind(f.value.clone());
            }
            FilterOp::In => {
                qb.push("(").push_bind(f.value.clone()).push(")::jsonb @> jsonb_build_array(data->")
                    .push_bind(f.field.clone())
                    .push(")");
            }
        }
    }
    if let Some(cursor) = &query.start_after {
        push_start_after(&mut qb, query, cursor);
    }
    qb.push(" ORDER BY ");
    for order in &query.order_by {
        push_order_expr(&mut qb, &order.field);
        qb.push(match order.dir {
            Direction::Asc => " ASC NULLS FIRST, ",
            Direction::Desc => " DESC NULLS LAST, ",
        });
    }
    qb.push("id ASC");
    if let Some(limit) = query.limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }

    let rows: Vec<PgRow> = qb.build().fetch_all(pool).await.map_err(backend)?;
    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.try_get("id").map_err(backend)?;
        let data: Value = row.try_get("data").map_err(backend)?;
        items.push(StoredDoc { id, data: into_document(data)? });
    }
    let last_cursor = items.last().map(|d| query.cursor_for(d));
    Ok(QueryPage { items, last_cursor })
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Document> {
        let row = sqlx::query("SELECT data FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        into_document(row.try_get("data").map_err(backend)?)
    }

    async fn create(&self, collection: &str, id: &str, doc: Document) -> StoreResult<()> {
        let res = sqlx::query("INSERT INTO documents (collection, id, data) VALUES ($1,$2,$3) ON CONFLICT DO NOTHING")
            .bind(collection)
            .bind(id)
            .bind(Value::Object(doc))
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if res.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists);
        }
        Ok(())
    }

    async fn put(&self, collection: &str, id: &str, doc: Document) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO documents (collection, id, data) VALUES ($1,$2,$3)
             ON CONFLICT (collection, id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(collection)
        .bind(id)
        .bind(Value::Object(doc))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Document) -> StoreResult<()> {
        let res = sqlx::query("UPDATE documents SET data = data || $3 WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .bind(Value::Object(fields))
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<bool> {
        let res = sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(res.rows_affected() > 0)
    }

    async fn query(&self, collection: &str, query: &Query) -> StoreResult<QueryPage> {
        run_query(&self.pool, collection, query).await
    }

    async fn increment(&self, collection: &str, id: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let row = sqlx::query(
            "UPDATE documents
                SET data = jsonb_set(data, ARRAY[$3], to_jsonb(COALESCE((data->>$3)::bigint, 0) + $4))
              WHERE collection = $1 AND id = $2
          RETURNING (data->>$3)::bigint AS value",
        )
        .bind(collection)
        .bind(id)
        .bind(field)
        .bind(delta)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("22P02") => StoreError::NotNumeric(field.to_string()),
            other => backend(other),
        })?;
        row.try_get("value").map_err(backend)
    }

    async fn array_union(&self, collection: &str, id: &str, field: &str, values: Vec<Value>) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE documents
                SET data = jsonb_set(data, ARRAY[$3],
                    COALESCE(data->$3, '[]'::jsonb) || COALESCE(
                        (SELECT jsonb_agg(v) FROM jsonb_array_elements($4::jsonb) v
                          WHERE NOT COALESCE(data->$3, '[]'::jsonb) @> jsonb_build_array(v)),
                        '[]'::jsonb))
              WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .bind(field)
        .bind(Value::Array(values))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn array_remove(&self, collection: &str, id: &str, field: &str, values: Vec<Value>) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE documents
                SET data = jsonb_set(data, ARRAY[$3], COALESCE(
                    (SELECT jsonb_agg(v) FROM jsonb_array_elements(COALESCE(data->$3, '[]'::jsonb)) v
                      WHERE NOT $4::jsonb @> jsonb_build_array(v)),
                    '[]'::jsonb))
              WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .bind(field)
        .bind(Value::Array(values))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn subscribe(&self, collection: &str, query: Query, callback: SnapshotCallback) -> StoreResult<Subscription> {
        let mut listener = PgListener::connect_with(&self.pool).await.map_err(backend)?;
        listener.listen(CHANGE_CHANNEL).await.map_err(backend)?;

        let initial = run_query(&self.pool, collection, &query).await?;
        callback(&initial.items);

        let pool = self.pool.clone();
        let collection = collection.to_string();
        let task = tokio::spawn(async move {
            loop {
                let notification = match listener.recv().await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(%collection, "listener failed, live query stopped: {e}");
                        return;
                    }
                };
                if notification.payload() != collection {
                    continue;
                }
                match run_query(&pool, &collection, &query).await {
                    Ok(page) => callback(&page.items),
                    Err(e) => debug!(%collection, "live query refresh failed: {e}"),
                }
            }
        });
        Ok(Subscription::new(move || task.abort()))
    }
}
