// # SQL Builder
//
// Builds exactly one parameterized statement per list / connection-page /
// aggregate call. Projections wrap every selected column in `to_jsonb` so
// rows decode uniformly as JSON with PostgreSQL's own serialization
// providing the documented scalar forms. ORDER BY and WHERE operate on the
// raw columns.

use serde_json::Value as Json;

use super::binding::{bind_cast, coerce_bind};
use super::filter::FilterCompiler;
use super::{qualified_table, quote_ident, BindValue, ParamList};
use crate::catalog::{Catalog, Table};
use crate::error::{GatewayError, Result};
use crate::graphql::type_mapper::classify_column;

/// One ORDER BY entry, in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderByEntry {
    pub column: String,
    pub descending: bool,
}

/// A finished statement: SQL text plus its ordered bind parameters.
#[derive(Debug)]
pub struct SelectQuery {
    pub sql: String,
    pub binds: Vec<BindValue>,
}

/// Aggregate functions requested by the selection set; only referenced
/// columns are aggregated.
#[derive(Debug, Default, Clone)]
pub struct AggregateSelection {
    pub count: bool,
    pub sum: Vec<String>,
    pub avg: Vec<String>,
    pub min: Vec<String>,
    pub max: Vec<String>,
}

pub struct SqlBuilder<'a> {
    catalog: &'a Catalog,
    table: &'a Table,
}

impl<'a> SqlBuilder<'a> {
    pub fn new(catalog: &'a Catalog, table: &'a Table) -> Self {
        Self { catalog, table }
    }

    fn from_clause(&self) -> String {
        qualified_table(&self.catalog.schema, &self.table.name)
    }

    fn projection(&self, columns: &[String]) -> Result<String> {
        if columns.is_empty() {
            return Err(GatewayError::Validation(format!(
                "no selectable columns requested from {:?}",
                self.table.name
            )));
        }
        let mut parts = Vec::with_capacity(columns.len());
        for name in columns {
            if !self.table.has_column(name) {
                return Err(GatewayError::Catalog(format!(
                    "unknown column {:?} in projection for {:?}",
                    name, self.table.name
                )));
            }
            let quoted = quote_ident(name);
            parts.push(format!("to_jsonb({}) AS {}", quoted, quoted));
        }
        Ok(parts.join(", "))
    }

    fn order_clause(&self, order_by: &[OrderByEntry], invert: bool) -> Result<Option<String>> {
        if order_by.is_empty() {
            return Ok(None);
        }
        let mut parts = Vec::with_capacity(order_by.len());
        for entry in order_by {
            if !self.table.has_column(&entry.column) {
                return Err(GatewayError::Validation(format!(
                    "unknown orderBy column {:?} on table {:?}",
                    entry.column, self.table.name
                )));
            }
            let descending = entry.descending ^ invert;
            parts.push(format!(
                "{} {}",
                quote_ident(&entry.column),
                if descending { "DESC" } else { "ASC" }
            ));
        }
        Ok(Some(parts.join(", ")))
    }

    /// List path: SELECT … [WHERE …] [ORDER BY …] [LIMIT …] [OFFSET …].
    pub fn build_list(
        &self,
        columns: &[String],
        where_filter: Option<&Json>,
        or_filters: Option<&Json>,
        order_by: &[OrderByEntry],
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<SelectQuery> {
        let mut params = ParamList::new();
        let mut sql = format!(
            "SELECT {} FROM {}",
            self.projection(columns)?,
            self.from_clause()
        );

        let compiler = FilterCompiler::new(self.catalog, self.table);
        if let Some(clause) = compiler.compile(where_filter, or_filters, &mut params)? {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        if let Some(order) = self.order_clause(order_by, false)? {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }
        if let Some(limit) = limit {
            let placeholder = params.push(BindValue::Int(Some(limit)));
            sql.push_str(&format!(" LIMIT {}", placeholder));
        }
        if let Some(offset) = offset {
            let placeholder = params.push(BindValue::Int(Some(offset)));
            sql.push_str(&format!(" OFFSET {}", placeholder));
        }

        Ok(SelectQuery {
            sql,
            binds: params.into_binds(),
        })
    }

    /// Plain COUNT(*) over the base filter (connection totalCount).
    pub fn build_count(
        &self,
        where_filter: Option<&Json>,
        or_filters: Option<&Json>,
    ) -> Result<SelectQuery> {
        let mut params = ParamList::new();
        let mut sql = format!("SELECT COUNT(*) AS \"count\" FROM {}", self.from_clause());
        let compiler = FilterCompiler::new(self.catalog, self.table);
        if let Some(clause) = compiler.compile(where_filter, or_filters, &mut params)? {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        Ok(SelectQuery {
            sql,
            binds: params.into_binds(),
        })
    }

    /// Connection page over the keyset. `backward` serves `last`/`before`:
    /// the scan order is inverted and the caller restores declared order.
    pub fn build_keyset_page(
        &self,
        columns: &[String],
        where_filter: Option<&Json>,
        or_filters: Option<&Json>,
        order_by: &[OrderByEntry],
        cursor: Option<&[(String, Json)]>,
        backward: bool,
        limit: i64,
    ) -> Result<SelectQuery> {
        if order_by.is_empty() {
            return Err(GatewayError::Validation(
                "cursor pagination requires an orderBy".to_string(),
            ));
        }

        let mut params = ParamList::new();
        let mut sql = format!(
            "SELECT {} FROM {}",
            self.projection(columns)?,
            self.from_clause()
        );

        let compiler = FilterCompiler::new(self.catalog, self.table);
        let mut clauses = Vec::new();
        if let Some(clause) = compiler.compile(where_filter, or_filters, &mut params)? {
            clauses.push(clause);
        }
        if let Some(tuple) = cursor {
            clauses.push(self.keyset_predicate(order_by, tuple, backward, &mut params)?);
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        // Safe to unwrap presence: order_by was checked non-empty above.
        if let Some(order) = self.order_clause(order_by, backward)? {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }
        let placeholder = params.push(BindValue::Int(Some(limit)));
        sql.push_str(&format!(" LIMIT {}", placeholder));

        Ok(SelectQuery {
            sql,
            binds: params.into_binds(),
        })
    }

    /// COUNT(*) probe reusing the keyset predicate from a boundary row's
    /// tuple; drives hasNextPage / hasPreviousPage.
    pub fn build_keyset_count(
        &self,
        where_filter: Option<&Json>,
        or_filters: Option<&Json>,
        order_by: &[OrderByEntry],
        tuple: &[(String, Json)],
        backward: bool,
    ) -> Result<SelectQuery> {
        let mut params = ParamList::new();
        let mut sql = format!("SELECT COUNT(*) AS \"count\" FROM {}", self.from_clause());

        let compiler = FilterCompiler::new(self.catalog, self.table);
        let mut clauses = Vec::new();
        if let Some(clause) = compiler.compile(where_filter, or_filters, &mut params)? {
            clauses.push(clause);
        }
        clauses.push(self.keyset_predicate(order_by, tuple, backward, &mut params)?);
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));

        Ok(SelectQuery {
            sql,
            binds: params.into_binds(),
        })
    }

    /// Lexicographic keyset predicate over the orderBy tuple:
    /// `(k1 OP v1) OR (k1 = v1 AND k2 OP v2) OR …` where OP follows each
    /// key's direction, inverted for backward scans.
    fn keyset_predicate(
        &self,
        order_by: &[OrderByEntry],
        tuple: &[(String, Json)],
        backward: bool,
        params: &mut ParamList,
    ) -> Result<String> {
        if tuple.len() != order_by.len()
            || !tuple
                .iter()
                .zip(order_by)
                .all(|((field, _), entry)| *field == entry.column)
        {
            return Err(GatewayError::Validation(
                "cursor does not match the orderBy tuple".to_string(),
            ));
        }

        let mut placeholders = Vec::with_capacity(tuple.len());
        for (field, value) in tuple {
            let column = self.table.column(field).ok_or_else(|| {
                GatewayError::Validation(format!(
                    "unknown orderBy column {:?} on table {:?}",
                    field, self.table.name
                ))
            })?;
            let mapped = classify_column(column, self.catalog);
            let cast = bind_cast(&mapped, &column.raw_type, &self.catalog.schema);
            let bind = coerce_bind(value, &mapped, self.catalog, field)?;
            placeholders.push(params.push_cast(bind, cast.as_deref()));
        }

        let mut alternatives = Vec::with_capacity(order_by.len());
        for (i, entry) in order_by.iter().enumerate() {
            let mut conjuncts = Vec::with_capacity(i + 1);
            for (j, prior) in order_by.iter().enumerate().take(i) {
                conjuncts.push(format!(
                    "{} = {}",
                    quote_ident(&prior.column),
                    placeholders[j]
                ));
            }
            let descending = entry.descending ^ backward;
            let op = if descending { "<" } else { ">" };
            conjuncts.push(format!(
                "{} {} {}",
                quote_ident(&entry.column),
                op,
                placeholders[i]
            ));
            alternatives.push(format!("({})", conjuncts.join(" AND ")));
        }
        Ok(format!("({})", alternatives.join(" OR ")))
    }

    /// Aggregate path over the same base filter as the list path.
    pub fn build_aggregate(
        &self,
        selection: &AggregateSelection,
        where_filter: Option<&Json>,
        or_filters: Option<&Json>,
    ) -> Result<SelectQuery> {
        let mut items = vec!["COUNT(*) AS \"count\"".to_string()];

        for (function, columns, summing) in [
            ("SUM", &selection.sum, true),
            ("AVG", &selection.avg, true),
            ("MIN", &selection.min, false),
            ("MAX", &selection.max, false),
        ] {
            for name in columns {
                let column = self.table.column(name).ok_or_else(|| {
                    GatewayError::Validation(format!(
                        "unknown aggregate column {:?} on table {:?}",
                        name, self.table.name
                    ))
                })?;
                let mapped = classify_column(column, self.catalog);
                let eligible = if summing {
                    mapped.is_summable()
                } else {
                    mapped.is_comparable_aggregate()
                };
                if !eligible {
                    return Err(GatewayError::Validation(format!(
                        "column {:?} does not support {}",
                        name,
                        function.to_lowercase()
                    )));
                }
                items.push(format!(
                    "to_jsonb({}({})) AS {}",
                    function,
                    quote_ident(name),
                    quote_ident(&format!("{}__{}", function.to_lowercase(), name))
                ));
            }
        }

        let mut params = ParamList::new();
        let mut sql = format!("SELECT {} FROM {}", items.join(", "), self.from_clause());
        let compiler = FilterCompiler::new(self.catalog, self.table);
        if let Some(clause) = compiler.compile(where_filter, or_filters, &mut params)? {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }

        Ok(SelectQuery {
            sql,
            binds: params.into_binds(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::sample_catalog;
    use serde_json::json;

    fn order_by(entries: &[(&str, bool)]) -> Vec<OrderByEntry> {
        entries
            .iter()
            .map(|(column, descending)| OrderByEntry {
                column: column.to_string(),
                descending: *descending,
            })
            .collect()
    }

    #[test]
    fn test_list_query_shape() {
        let catalog = sample_catalog();
        let table = catalog.table("customer").unwrap();
        let builder = SqlBuilder::new(&catalog, table);
        let query = builder
            .build_list(
                &["customer_id".to_string(), "name".to_string()],
                Some(&json!({"active": {"eq": true}})),
                None,
                &order_by(&[("customer_id", false)]),
                Some(5),
                Some(10),
            )
            .unwrap();
        assert_eq!(
            query.sql,
            "SELECT to_jsonb(\"customer_id\") AS \"customer_id\", to_jsonb(\"name\") AS \"name\" \
             FROM \"public\".\"customer\" WHERE \"active\" = $1 \
             ORDER BY \"customer_id\" ASC LIMIT $2 OFFSET $3"
        );
        assert_eq!(query.binds.len(), 3);
    }

    #[test]
    fn test_keyset_predicate_two_keys() {
        let catalog = sample_catalog();
        let table = catalog.table("customer").unwrap();
        let builder = SqlBuilder::new(&catalog, table);
        let query = builder
            .build_keyset_page(
                &["customer_id".to_string()],
                None,
                None,
                &order_by(&[("name", false), ("customer_id", true)]),
                Some(&[
                    ("name".to_string(), json!("Ada")),
                    ("customer_id".to_string(), json!(7)),
                ]),
                false,
                5,
            )
            .unwrap();
        assert!(query.sql.contains(
            "((\"name\" > $1) OR (\"name\" = $1 AND \"customer_id\" < $2))"
        ));
        assert!(query.sql.ends_with("ORDER BY \"name\" ASC, \"customer_id\" DESC LIMIT $3"));
    }

    #[test]
    fn test_backward_scan_inverts_operators_and_order() {
        let catalog = sample_catalog();
        let table = catalog.table("customer").unwrap();
        let builder = SqlBuilder::new(&catalog, table);
        let query = builder
            .build_keyset_page(
                &["customer_id".to_string()],
                None,
                None,
                &order_by(&[("customer_id", false)]),
                Some(&[("customer_id".to_string(), json!(6))]),
                true,
                5,
            )
            .unwrap();
        assert!(query.sql.contains("((\"customer_id\" < $1))"));
        assert!(query.sql.contains("ORDER BY \"customer_id\" DESC"));
    }

    #[test]
    fn test_cursor_must_match_order_by() {
        let catalog = sample_catalog();
        let table = catalog.table("customer").unwrap();
        let builder = SqlBuilder::new(&catalog, table);
        let err = builder
            .build_keyset_page(
                &["customer_id".to_string()],
                None,
                None,
                &order_by(&[("customer_id", false)]),
                Some(&[("name".to_string(), json!("Ada"))]),
                false,
                5,
            )
            .unwrap_err();
        assert!(err.to_string().contains("orderBy"));
    }

    #[test]
    fn test_cursor_without_order_by_is_an_error() {
        let catalog = sample_catalog();
        let table = catalog.table("customer").unwrap();
        let builder = SqlBuilder::new(&catalog, table);
        let err = builder
            .build_keyset_page(&["customer_id".to_string()], None, None, &[], None, false, 5)
            .unwrap_err();
        assert!(err.to_string().contains("orderBy"));
    }

    #[test]
    fn test_aggregate_selection() {
        let catalog = sample_catalog();
        let table = catalog.table("orders").unwrap();
        let builder = SqlBuilder::new(&catalog, table);
        let selection = AggregateSelection {
            count: true,
            sum: vec!["total".to_string()],
            avg: vec!["total".to_string()],
            min: vec![],
            max: vec!["order_id".to_string()],
        };
        let query = builder
            .build_aggregate(&selection, Some(&json!({"customer_id": {"eq": 1}})), None)
            .unwrap();
        assert_eq!(
            query.sql,
            "SELECT COUNT(*) AS \"count\", to_jsonb(SUM(\"total\")) AS \"sum__total\", \
             to_jsonb(AVG(\"total\")) AS \"avg__total\", to_jsonb(MAX(\"order_id\")) AS \"max__order_id\" \
             FROM \"public\".\"orders\" WHERE \"customer_id\" = $1"
        );
    }

    #[test]
    fn test_aggregate_rejects_non_numeric_sum() {
        let catalog = sample_catalog();
        let table = catalog.table("customer").unwrap();
        let builder = SqlBuilder::new(&catalog, table);
        let selection = AggregateSelection {
            count: true,
            sum: vec!["name".to_string()],
            ..Default::default()
        };
        assert!(builder.build_aggregate(&selection, None, None).is_err());
    }
}
