// # Filter Compiler
//
// Translates `where`/`or` filter objects into SQL predicates with typed
// bind parameters. Column filters within one object combine with AND, an
// `or` list combines with OR at the same level, and `where` plus a
// top-level `or` list combine with AND. Pattern operators never concatenate
// user input into SQL text; patterns travel as parameters.

use serde_json::Value as Json;

use super::binding::{bind_cast, coerce_bind};
use super::{quote_ident, BindValue, ParamList};
use crate::catalog::{Catalog, Column, Table};
use crate::error::{GatewayError, Result};
use crate::graphql::type_mapper::{
    classify_column, operators_for, FilterCategory, MappedType,
};

pub struct FilterCompiler<'a> {
    catalog: &'a Catalog,
    table: &'a Table,
}

impl<'a> FilterCompiler<'a> {
    pub fn new(catalog: &'a Catalog, table: &'a Table) -> Self {
        Self { catalog, table }
    }

    /// Compile the `where` filter and the top-level `or` list into one
    /// predicate, or None when no filtering was requested.
    pub fn compile(
        &self,
        where_filter: Option<&Json>,
        or_filters: Option<&Json>,
        params: &mut ParamList,
    ) -> Result<Option<String>> {
        let mut clauses = Vec::new();

        if let Some(filter) = where_filter {
            clauses.extend(self.compile_filter(filter, params)?);
        }
        if let Some(or_value) = or_filters {
            if let Some(clause) = self.compile_or_list(or_value, params)? {
                clauses.push(clause);
            }
        }

        if clauses.is_empty() {
            Ok(None)
        } else {
            Ok(Some(clauses.join(" AND ")))
        }
    }

    fn compile_or_list(&self, or_value: &Json, params: &mut ParamList) -> Result<Option<String>> {
        let list = or_value
            .as_array()
            .ok_or_else(|| GatewayError::Validation("or: expected a list of filters".into()))?;
        let mut alternatives = Vec::with_capacity(list.len());
        for filter in list {
            let predicates = self.compile_filter(filter, params)?;
            if !predicates.is_empty() {
                alternatives.push(format!("({})", predicates.join(" AND ")));
            }
        }
        if alternatives.is_empty() {
            Ok(None)
        } else {
            Ok(Some(format!("({})", alternatives.join(" OR "))))
        }
    }

    /// AND-combined predicates of one filter object.
    fn compile_filter(&self, filter: &Json, params: &mut ParamList) -> Result<Vec<String>> {
        let obj = filter
            .as_object()
            .ok_or_else(|| GatewayError::Validation("filter: expected an object".into()))?;

        let mut predicates = Vec::new();
        for (key, value) in obj {
            if value.is_null() {
                continue;
            }
            if key == "or" {
                if let Some(clause) = self.compile_or_list(value, params)? {
                    predicates.push(clause);
                }
                continue;
            }
            let column = self.table.column(key).ok_or_else(|| {
                GatewayError::Validation(format!(
                    "unknown filter column {:?} on table {:?}",
                    key, self.table.name
                ))
            })?;
            predicates.extend(self.compile_column(column, value, params)?);
        }
        Ok(predicates)
    }

    fn compile_column(
        &self,
        column: &Column,
        ops: &Json,
        params: &mut ParamList,
    ) -> Result<Vec<String>> {
        let mapped = classify_column(column, self.catalog);
        let category = mapped.filter_category();
        let allowed = operators_for(category);
        let ops = ops.as_object().ok_or_else(|| {
            GatewayError::Validation(format!("{}: expected an operator object", column.name))
        })?;

        let mut predicates = Vec::with_capacity(ops.len());
        for (op, value) in ops {
            if !allowed.contains(&op.as_str()) {
                return Err(GatewayError::Validation(format!(
                    "operator {:?} is not supported on column {:?}",
                    op, column.name
                )));
            }
            predicates.push(self.compile_operator(column, &mapped, op, value, params)?);
        }
        Ok(predicates)
    }

    fn compile_operator(
        &self,
        column: &Column,
        mapped: &MappedType,
        op: &str,
        value: &Json,
        params: &mut ParamList,
    ) -> Result<String> {
        let col = quote_ident(&column.name);
        let cast = bind_cast(mapped, &column.raw_type, &self.catalog.schema);

        let comparison = |sql_op: &str, params: &mut ParamList| -> Result<String> {
            let bind = coerce_bind(value, mapped, self.catalog, &column.name)?;
            Ok(format!(
                "{} {} {}",
                col,
                sql_op,
                params.push_cast(bind, cast.as_deref())
            ))
        };

        match op {
            "eq" if matches!(mapped.filter_category(), FilterCategory::Json) => {
                let bind = coerce_bind(value, mapped, self.catalog, &column.name)?;
                Ok(format!("({})::jsonb = {}", col, params.push(bind)))
            }
            "eq" => comparison("=", params),
            "neq" => comparison("<>", params),
            "gt" => comparison(">", params),
            "gte" => comparison(">=", params),
            "lt" => comparison("<", params),
            "lte" => comparison("<=", params),
            "in" | "notIn" => {
                let list = value.as_array().ok_or_else(|| {
                    GatewayError::Validation(format!("{}.{}: expected a list", column.name, op))
                })?;
                let negated = op == "notIn";
                if list.is_empty() {
                    // IN () is not valid SQL; an empty list matches nothing.
                    return Ok(if negated { "TRUE" } else { "FALSE" }.to_string());
                }
                let mut placeholders = Vec::with_capacity(list.len());
                for item in list {
                    let bind = coerce_bind(item, mapped, self.catalog, &column.name)?;
                    placeholders.push(params.push_cast(bind, cast.as_deref()));
                }
                let keyword = if negated { "NOT IN" } else { "IN" };
                Ok(format!("{} {} ({})", col, keyword, placeholders.join(", ")))
            }
            "contains" if matches!(mapped.filter_category(), FilterCategory::Json) => {
                let bind = coerce_bind(value, mapped, self.catalog, &column.name)?;
                Ok(format!("({})::jsonb @> {}", col, params.push(bind)))
            }
            "contains" if mapped.is_array() => {
                let bind = coerce_bind(value, mapped, self.catalog, &column.name)?;
                Ok(format!(
                    "{} @> {}",
                    col,
                    params.push_cast(bind, cast.as_deref())
                ))
            }
            "contains" => self.like_predicate(&col, value, &column.name, LikeShape::Contains, params),
            "startsWith" => {
                self.like_predicate(&col, value, &column.name, LikeShape::Prefix, params)
            }
            "endsWith" => self.like_predicate(&col, value, &column.name, LikeShape::Suffix, params),
            "like" => self.like_predicate(&col, value, &column.name, LikeShape::Verbatim, params),
            "ilike" => {
                self.like_predicate(&col, value, &column.name, LikeShape::VerbatimInsensitive, params)
            }
            "hasKey" => {
                let key = value.as_str().ok_or_else(|| {
                    GatewayError::Validation(format!("{}.hasKey: expected a string", column.name))
                })?;
                let placeholder = params.push(BindValue::Text(Some(key.to_string())));
                Ok(format!("jsonb_exists(({})::jsonb, {})", col, placeholder))
            }
            "isNull" => Ok(null_predicate(&col, value, &column.name, false)?),
            "isNotNull" => Ok(null_predicate(&col, value, &column.name, true)?),
            other => Err(GatewayError::Validation(format!(
                "operator {:?} is not supported on column {:?}",
                other, column.name
            ))),
        }
    }

    fn like_predicate(
        &self,
        col: &str,
        value: &Json,
        column_name: &str,
        shape: LikeShape,
        params: &mut ParamList,
    ) -> Result<String> {
        let raw = value.as_str().ok_or_else(|| {
            GatewayError::Validation(format!("{}: expected a string pattern", column_name))
        })?;
        let (keyword, pattern) = match shape {
            LikeShape::Contains => ("LIKE", format!("%{}%", escape_like(raw))),
            LikeShape::Prefix => ("LIKE", format!("{}%", escape_like(raw))),
            LikeShape::Suffix => ("LIKE", format!("%{}", escape_like(raw))),
            LikeShape::Verbatim => ("LIKE", raw.to_string()),
            LikeShape::VerbatimInsensitive => ("ILIKE", raw.to_string()),
        };
        let placeholder = params.push(BindValue::Text(Some(pattern)));
        // Pattern matching runs on the text form so uuid/inet/bit columns
        // behave like their printed representation.
        Ok(format!("({})::text {} {}", col, keyword, placeholder))
    }
}

enum LikeShape {
    Contains,
    Prefix,
    Suffix,
    Verbatim,
    VerbatimInsensitive,
}

fn null_predicate(col: &str, value: &Json, column_name: &str, invert: bool) -> Result<String> {
    let flag = match value {
        Json::Bool(b) => *b,
        _ => {
            return Err(GatewayError::Validation(format!(
                "{}: isNull/isNotNull take a boolean",
                column_name
            )))
        }
    };
    // The boolean argument inverts the check; isNotNull additionally flips it.
    let want_null = if invert { !flag } else { flag };
    if want_null {
        Ok(format!("{} IS NULL", col))
    } else {
        Ok(format!("{} IS NOT NULL", col))
    }
}

/// Escape LIKE metacharacters in user-supplied fragments so contains /
/// startsWith / endsWith match literally.
fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::sample_catalog;
    use serde_json::json;

    fn compile(where_filter: Option<Json>, or_filters: Option<Json>) -> (Option<String>, usize) {
        let catalog = sample_catalog();
        let table = catalog.table("customer").unwrap();
        let compiler = FilterCompiler::new(&catalog, table);
        let mut params = ParamList::new();
        let clause = compiler
            .compile(where_filter.as_ref(), or_filters.as_ref(), &mut params)
            .unwrap();
        (clause, params.len())
    }

    #[test]
    fn test_where_and_or_combine_with_and() {
        let (clause, binds) = compile(
            Some(json!({"active": {"eq": true}})),
            Some(json!([
                {"customer_id": {"lt": 10}},
                {"customer_id": {"gt": 600}}
            ])),
        );
        assert_eq!(
            clause.as_deref(),
            Some("\"active\" = $1 AND ((\"customer_id\" < $2) OR (\"customer_id\" > $3))")
        );
        assert_eq!(binds, 3);
    }

    #[test]
    fn test_nested_or_inside_filter() {
        let (clause, _) = compile(
            Some(json!({
                "active": {"eq": true},
                "or": [{"name": {"eq": "Ada"}}, {"name": {"eq": "Grace"}}]
            })),
            None,
        );
        let clause = clause.unwrap();
        assert!(clause.contains("\"active\" = $"));
        assert!(clause.contains("OR"));
    }

    #[test]
    fn test_string_operators() {
        let (clause, _) = compile(Some(json!({"name": {"contains": "a%b"}})), None);
        // LIKE metacharacters in the fragment are escaped.
        assert_eq!(
            clause.as_deref(),
            Some("(\"name\")::text LIKE $1")
        );

        let (clause, _) = compile(Some(json!({"name": {"startsWith": "Ad"}})), None);
        assert_eq!(clause.as_deref(), Some("(\"name\")::text LIKE $1"));
    }

    #[test]
    fn test_in_list() {
        let (clause, binds) = compile(Some(json!({"customer_id": {"in": [1, 2, 3]}})), None);
        assert_eq!(
            clause.as_deref(),
            Some("\"customer_id\" IN ($1, $2, $3)")
        );
        assert_eq!(binds, 3);

        let (clause, binds) = compile(Some(json!({"customer_id": {"in": []}})), None);
        assert_eq!(clause.as_deref(), Some("FALSE"));
        assert_eq!(binds, 0);

        let (clause, _) = compile(Some(json!({"customer_id": {"notIn": []}})), None);
        assert_eq!(clause.as_deref(), Some("TRUE"));
    }

    #[test]
    fn test_null_checks() {
        let (clause, _) = compile(Some(json!({"name": {"isNull": true}})), None);
        assert_eq!(clause.as_deref(), Some("\"name\" IS NULL"));

        let (clause, _) = compile(Some(json!({"name": {"isNull": false}})), None);
        assert_eq!(clause.as_deref(), Some("\"name\" IS NOT NULL"));

        let (clause, _) = compile(Some(json!({"name": {"isNotNull": true}})), None);
        assert_eq!(clause.as_deref(), Some("\"name\" IS NOT NULL"));
    }

    #[test]
    fn test_decimal_comparison_casts_parameter() {
        let catalog = sample_catalog();
        let table = catalog.table("orders").unwrap();
        let compiler = FilterCompiler::new(&catalog, table);
        let mut params = ParamList::new();
        let clause = compiler
            .compile(Some(&json!({"total": {"gte": "10.00"}})), None, &mut params)
            .unwrap();
        assert_eq!(clause.as_deref(), Some("\"total\" >= $1::numeric(10,2)"));
    }

    #[test]
    fn test_unknown_column_and_operator() {
        let catalog = sample_catalog();
        let table = catalog.table("customer").unwrap();
        let compiler = FilterCompiler::new(&catalog, table);
        let mut params = ParamList::new();

        let err = compiler
            .compile(Some(&json!({"ghost": {"eq": 1}})), None, &mut params)
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));

        let err = compiler
            .compile(Some(&json!({"active": {"gt": true}})), None, &mut params)
            .unwrap_err();
        assert!(err.to_string().contains("gt"));
    }

    #[test]
    fn test_empty_filter_compiles_to_none() {
        let (clause, binds) = compile(None, None);
        assert!(clause.is_none());
        assert_eq!(binds, 0);
    }
}
