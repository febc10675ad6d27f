// # Relationship Batch Loader
//
// Eliminates N+1 queries: for each relationship field in a selection-set
// level, the FK tuples of the already-loaded parent rows are collected and
// one bulk query per referenced table fetches every referenced row, indexed
// into the execution context's relationship cache. Child resolvers only
// read the cache. Nested relationship selections preload recursively, so
// every level costs at most one query per referenced table.

use std::collections::HashSet;

use serde_json::Value as Json;
use tracing::warn;

use super::{tuple_key, ExecutionContext, JsonRow};
use crate::catalog::{Catalog, ForeignKey, Table};
use crate::error::{GatewayError, Result};
use crate::graphql::selection::{RelationshipSelection, SelectionPlan};
use crate::graphql::type_mapper::classify_column;
use crate::sql::builder::SelectQuery;
use crate::sql::{bind_cast, coerce_bind, qualified_table, quote_ident, ParamList};

/// Cache entry key for one (referenced table, referenced column set).
pub fn cache_key(fk: &ForeignKey) -> String {
    format!("{}:{}", fk.referenced_table, fk.referenced_columns.join(","))
}

/// Preload every relationship the plan references, for the given parent
/// rows. A failed bulk load is recorded per relationship; parent rows stay
/// usable and the affected field resolvers report the error.
pub async fn preload_relationships(
    ctx: &ExecutionContext,
    catalog: &Catalog,
    rows: &[JsonRow],
    plan: &SelectionPlan,
) {
    for relationship in &plan.relationships {
        let key = cache_key(&relationship.foreign_key);
        {
            let cache = ctx.relationship_cache.read().await;
            if cache.loaded.contains_key(&key) || cache.failed.contains_key(&key) {
                continue;
            }
        }
        if let Err(err) = preload_one(ctx, catalog, rows, relationship).await {
            warn!(
                relationship = %relationship.field_name,
                error = %err,
                "bulk relationship load failed"
            );
            ctx.relationship_cache
                .write()
                .await
                .failed
                .insert(key, err.client_message());
        }
    }
}

async fn preload_one(
    ctx: &ExecutionContext,
    catalog: &Catalog,
    rows: &[JsonRow],
    relationship: &RelationshipSelection,
) -> Result<()> {
    let fk = &relationship.foreign_key;
    let referenced = catalog.table(&relationship.referenced_table).ok_or_else(|| {
        GatewayError::Catalog(format!(
            "relationship references unknown table {:?}",
            relationship.referenced_table
        ))
    })?;

    // Distinct non-null FK tuples present in the parent rows.
    let mut seen: HashSet<String> = HashSet::new();
    let mut tuples: Vec<Vec<&Json>> = Vec::new();
    for row in rows {
        let values: Option<Vec<&Json>> = fk
            .columns
            .iter()
            .map(|column| row.get(column).filter(|v| !v.is_null()))
            .collect();
        if let Some(values) = values {
            if seen.insert(tuple_key(&values)) {
                tuples.push(values);
            }
        }
    }

    let key = cache_key(fk);
    if tuples.is_empty() {
        // Cache an empty index so child resolvers know the level was
        // handled and resolve to null without querying.
        ctx.relationship_cache
            .write()
            .await
            .loaded
            .insert(key, Default::default());
        return Ok(());
    }

    let query = build_bulk_query(catalog, referenced, fk, &relationship.plan, &tuples)?;
    let loaded = ctx.fetch_all(&query).await?;

    let mut index = std::collections::HashMap::with_capacity(loaded.len());
    for row in &loaded {
        let values: Vec<&Json> = fk
            .referenced_columns
            .iter()
            .map(|column| row.get(column).unwrap_or(&Json::Null))
            .collect();
        index.insert(tuple_key(&values), row.clone());
    }
    ctx.relationship_cache
        .write()
        .await
        .loaded
        .insert(key, index);

    // The loaded rows form the parent level for any nested relationships.
    if !relationship.plan.relationships.is_empty() {
        Box::pin(preload_relationships(ctx, catalog, &loaded, &relationship.plan)).await;
    }
    Ok(())
}

/// One bulk query per referenced table:
/// `SELECT <cols> FROM ref WHERE (rc1, rc2) IN ((v11, v12), …)`.
fn build_bulk_query(
    catalog: &Catalog,
    referenced: &Table,
    fk: &ForeignKey,
    plan: &SelectionPlan,
    tuples: &[Vec<&Json>],
) -> Result<SelectQuery> {
    let projection = plan.projection(referenced, &fk.referenced_columns);
    let select_list: Vec<String> = projection
        .iter()
        .map(|name| {
            let quoted = quote_ident(name);
            format!("to_jsonb({}) AS {}", quoted, quoted)
        })
        .collect();

    let mut params = ParamList::new();
    let mut tuple_placeholders = Vec::with_capacity(tuples.len());
    for tuple in tuples {
        let mut placeholders = Vec::with_capacity(fk.referenced_columns.len());
        for (column_name, value) in fk.referenced_columns.iter().zip(tuple) {
            let column = referenced.column(column_name).ok_or_else(|| {
                GatewayError::Catalog(format!(
                    "foreign key references unknown column {:?}.{:?}",
                    referenced.name, column_name
                ))
            })?;
            let mapped = classify_column(column, catalog);
            let cast = bind_cast(&mapped, &column.raw_type, &catalog.schema);
            let bind = coerce_bind(value, &mapped, catalog, column_name)?;
            placeholders.push(params.push_cast(bind, cast.as_deref()));
        }
        tuple_placeholders.push(if placeholders.len() == 1 {
            placeholders.remove(0)
        } else {
            format!("({})", placeholders.join(", "))
        });
    }

    let key_columns: Vec<String> = fk
        .referenced_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect();
    let key_expr = if key_columns.len() == 1 {
        key_columns[0].clone()
    } else {
        format!("({})", key_columns.join(", "))
    };

    let sql = format!(
        "SELECT {} FROM {} WHERE {} IN ({})",
        select_list.join(", "),
        qualified_table(&catalog.schema, &referenced.name),
        key_expr,
        tuple_placeholders.join(", ")
    );
    Ok(SelectQuery {
        sql,
        binds: params.into_binds(),
    })
}

/// Fallback for singular fetch paths where no batch cache exists: one
/// single-row query, logged so N+1 regressions stay visible.
pub async fn load_single(
    ctx: &ExecutionContext,
    catalog: &Catalog,
    fk: &ForeignKey,
    parent: &JsonRow,
) -> Result<Option<JsonRow>> {
    let referenced = catalog.table(&fk.referenced_table).ok_or_else(|| {
        GatewayError::Catalog(format!(
            "relationship references unknown table {:?}",
            fk.referenced_table
        ))
    })?;
    let values: Option<Vec<&Json>> = fk
        .columns
        .iter()
        .map(|column| parent.get(column).filter(|v| !v.is_null()))
        .collect();
    let Some(values) = values else {
        return Ok(None);
    };

    warn!(
        table = %referenced.name,
        "relationship cache absent; falling back to single-row fetch"
    );

    let select_list: Vec<String> = referenced
        .columns
        .iter()
        .map(|c| {
            let quoted = quote_ident(&c.name);
            format!("to_jsonb({}) AS {}", quoted, quoted)
        })
        .collect();

    let mut params = ParamList::new();
    let mut conjuncts = Vec::with_capacity(fk.referenced_columns.len());
    for (column_name, value) in fk.referenced_columns.iter().zip(&values) {
        let column = referenced.column(column_name).ok_or_else(|| {
            GatewayError::Catalog(format!(
                "foreign key references unknown column {:?}.{:?}",
                referenced.name, column_name
            ))
        })?;
        let mapped = classify_column(column, catalog);
        let cast = bind_cast(&mapped, &column.raw_type, &catalog.schema);
        let bind = coerce_bind(value, &mapped, catalog, column_name)?;
        conjuncts.push(format!(
            "{} = {}",
            quote_ident(column_name),
            params.push_cast(bind, cast.as_deref())
        ));
    }

    let sql = format!(
        "SELECT {} FROM {} WHERE {} LIMIT 1",
        select_list.join(", "),
        qualified_table(&catalog.schema, &referenced.name),
        conjuncts.join(" AND ")
    );
    ctx.fetch_optional(&SelectQuery {
        sql,
        binds: params.into_binds(),
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::sample_catalog;
    use serde_json::json;

    #[test]
    fn test_bulk_query_single_column_key() {
        let catalog = sample_catalog();
        let orders = catalog.table("orders").unwrap();
        let customer = catalog.table("customer").unwrap();
        let fk = &orders.foreign_keys[0];

        let v1 = json!(1);
        let v2 = json!(2);
        let tuples = vec![vec![&v1], vec![&v2]];
        let plan = SelectionPlan {
            columns: vec!["name".to_string()],
            relationships: vec![],
        };
        let query = build_bulk_query(&catalog, customer, fk, &plan, &tuples).unwrap();
        assert_eq!(
            query.sql,
            "SELECT to_jsonb(\"customer_id\") AS \"customer_id\", to_jsonb(\"name\") AS \"name\" \
             FROM \"public\".\"customer\" WHERE \"customer_id\" IN ($1, $2)"
        );
        assert_eq!(query.binds.len(), 2);
    }

    #[test]
    fn test_bulk_query_composite_key() {
        let catalog = sample_catalog();
        let items = catalog.table("order_items").unwrap();
        let orders = catalog.table("orders").unwrap();
        // Synthesize a composite FK to exercise the row-value IN form.
        let fk = ForeignKey {
            name: "fk".to_string(),
            columns: vec!["order_id".to_string(), "product_id".to_string()],
            referenced_table: "order_items".to_string(),
            referenced_columns: vec!["order_id".to_string(), "product_id".to_string()],
        };
        let _ = (items, orders);

        let a = json!(1);
        let b = json!(2);
        let tuples = vec![vec![&a, &b]];
        let plan = SelectionPlan {
            columns: vec!["quantity".to_string()],
            relationships: vec![],
        };
        let query = build_bulk_query(
            &catalog,
            catalog.table("order_items").unwrap(),
            &fk,
            &plan,
            &tuples,
        )
        .unwrap();
        assert!(query
            .sql
            .contains("WHERE (\"order_id\", \"product_id\") IN (($1, $2))"));
    }
}
