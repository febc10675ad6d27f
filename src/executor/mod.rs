// # Execution Context
//
// Per-operation state: the connection source (pool, or one pinned
// transaction when a database role is bound so `SET LOCAL ROLE` stays in
// effect for the whole operation), and the relationship cache the batch
// loader fills. The context is created at operation start and discarded at
// its end; it never outlives or leaks across operations.

pub mod loader;

use std::collections::HashMap;

use serde_json::Value as Json;
use sqlx::postgres::{PgPool, PgRow, Postgres};
use sqlx::{Column as _, Row as _, TypeInfo as _};
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::sql::builder::SelectQuery;
use crate::sql::{quote_ident, BindValue};

/// A decoded result row: column name → JSON value.
pub type JsonRow = serde_json::Map<String, Json>;

/// Relationship cache: one entry per (referenced table, referenced column
/// set), mapping key tuples to rows. A failed bulk load is remembered so
/// the field resolvers surface the error instead of quietly re-querying.
#[derive(Default)]
pub struct RelationshipCache {
    pub loaded: HashMap<String, HashMap<String, JsonRow>>,
    pub failed: HashMap<String, String>,
}

pub struct ExecutionContext {
    pool: PgPool,
    role: Option<String>,
    tx: Option<tokio::sync::Mutex<sqlx::Transaction<'static, Postgres>>>,
    pub relationship_cache: tokio::sync::RwLock<RelationshipCache>,
}

impl ExecutionContext {
    /// Context without a bound role: statements run on pooled connections.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            role: None,
            tx: None,
            relationship_cache: tokio::sync::RwLock::new(RelationshipCache::default()),
        }
    }

    /// Context with a database role bound via `SET LOCAL ROLE` on a single
    /// transaction held for the whole operation. The role identifier must
    /// already be validated by the security guard.
    pub async fn with_role(pool: PgPool, role: String) -> Result<Self> {
        let mut tx = pool.begin().await.map_err(GatewayError::from_sqlx)?;
        let statement = format!("SET LOCAL ROLE {}", quote_ident(&role));
        sqlx::query(&statement)
            .execute(&mut *tx)
            .await
            .map_err(GatewayError::from_sqlx)?;
        debug!(%role, "bound database role for operation");
        Ok(Self {
            pool,
            role: Some(role),
            tx: Some(tokio::sync::Mutex::new(tx)),
            relationship_cache: tokio::sync::RwLock::new(RelationshipCache::default()),
        })
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    pub async fn fetch_all(&self, query: &SelectQuery) -> Result<Vec<JsonRow>> {
        debug!(sql = %query.sql, params = query.binds.len(), "executing statement");
        let rows = match &self.tx {
            Some(tx) => {
                let mut guard = tx.lock().await;
                bind_all(sqlx::query(&query.sql), &query.binds)
                    .fetch_all(&mut **guard)
                    .await
            }
            None => {
                bind_all(sqlx::query(&query.sql), &query.binds)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(GatewayError::from_sqlx)?;
        rows.iter().map(row_to_json).collect()
    }

    pub async fn fetch_optional(&self, query: &SelectQuery) -> Result<Option<JsonRow>> {
        debug!(sql = %query.sql, params = query.binds.len(), "executing statement");
        let row = match &self.tx {
            Some(tx) => {
                let mut guard = tx.lock().await;
                bind_all(sqlx::query(&query.sql), &query.binds)
                    .fetch_optional(&mut **guard)
                    .await
            }
            None => {
                bind_all(sqlx::query(&query.sql), &query.binds)
                    .fetch_optional(&self.pool)
                    .await
            }
        }
        .map_err(GatewayError::from_sqlx)?;
        row.as_ref().map(row_to_json).transpose()
    }

    /// Run a COUNT query and read its `count` column.
    pub async fn fetch_count(&self, query: &SelectQuery) -> Result<i64> {
        let row = self
            .fetch_optional(query)
            .await?
            .ok_or_else(|| GatewayError::Database("count query returned no row".into()))?;
        row.get("count")
            .and_then(Json::as_i64)
            .ok_or_else(|| GatewayError::Database("count query returned no count".into()))
    }

    /// Commit the pinned transaction, if any. Dropping the context without
    /// calling this rolls the transaction back, which is the right outcome
    /// for cancelled or failed operations.
    pub async fn finish(self) -> Result<()> {
        if let Some(tx) = self.tx {
            tx.into_inner()
                .commit()
                .await
                .map_err(GatewayError::from_sqlx)?;
        }
        Ok(())
    }
}

/// Bind an ordered parameter list onto a statement.
fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    binds: &'q [BindValue],
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    for bind in binds {
        query = match bind {
            BindValue::Int(v) => query.bind(*v),
            BindValue::Float(v) => query.bind(*v),
            BindValue::Bool(v) => query.bind(*v),
            BindValue::Text(v) => query.bind(v.as_deref()),
            BindValue::Uuid(v) => query.bind(*v),
            BindValue::Date(v) => query.bind(*v),
            BindValue::Timestamp(v) => query.bind(*v),
            BindValue::TimestampTz(v) => query.bind(*v),
            BindValue::Json(v) => query.bind(v.clone()),
        };
    }
    query
}

/// Decode a result row. Projections wrap columns in `to_jsonb`, so values
/// decode as JSON; COUNT aliases and catalog/CDC queries contribute the
/// few remaining wire types.
pub fn row_to_json(row: &PgRow) -> Result<JsonRow> {
    let mut map = JsonRow::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "JSONB" | "JSON" => row
                .try_get::<Option<Json>, _>(i)
                .map_err(GatewayError::from_sqlx)?
                .unwrap_or(Json::Null),
            "INT8" => json_number(row.try_get::<Option<i64>, _>(i).map_err(GatewayError::from_sqlx)?),
            "INT4" => json_number(
                row.try_get::<Option<i32>, _>(i)
                    .map_err(GatewayError::from_sqlx)?
                    .map(i64::from),
            ),
            "INT2" => json_number(
                row.try_get::<Option<i16>, _>(i)
                    .map_err(GatewayError::from_sqlx)?
                    .map(i64::from),
            ),
            "BOOL" => row
                .try_get::<Option<bool>, _>(i)
                .map_err(GatewayError::from_sqlx)?
                .map(Json::Bool)
                .unwrap_or(Json::Null),
            _ => row
                .try_get::<Option<String>, _>(i)
                .map_err(GatewayError::from_sqlx)?
                .map(Json::String)
                .unwrap_or(Json::Null),
        };
        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}

fn json_number(value: Option<i64>) -> Json {
    value.map(|v| Json::Number(v.into())).unwrap_or(Json::Null)
}

/// Canonical key for a tuple of JSON values; used to index relationship
/// cache entries.
pub fn tuple_key(values: &[&Json]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\u{1f}")
}
