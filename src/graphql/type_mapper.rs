// # Type Mapper
//
// Maps database-native column types onto the gateway's closed set of
// GraphQL kinds, and fixes the filter-operator grid per kind. Classification
// is derived from the catalog's `raw_type` strings so the rest of the
// pipeline (schema builder, filter compiler, bind coercion) agrees on one
// source of truth.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, Column, ForeignKey, Table};

/// Semantic kind of a column value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Int,
    BigInt,
    Float,
    Decimal,
    Boolean,
    Text,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,
    Json,
    Bytea,
    Inet,
    Bit,
    Enum(String),
    Composite(String),
}

/// Operator families for filter inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterCategory {
    Comparable,
    Stringy,
    Boolean,
    Json,
    Enum,
    Array,
    /// No filter input is generated (composite columns)
    None,
}

/// A classified column type: kind plus array dimensionality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedType {
    pub kind: FieldKind,
    pub dims: i32,
}

impl MappedType {
    pub fn scalar(kind: FieldKind) -> Self {
        Self { kind, dims: 0 }
    }

    pub fn is_array(&self) -> bool {
        self.dims > 0
    }

    pub fn is_temporal(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::Date
                | FieldKind::Time
                | FieldKind::Timestamp
                | FieldKind::TimestampTz
                | FieldKind::Interval
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::Int | FieldKind::BigInt | FieldKind::Float | FieldKind::Decimal
        )
    }

    /// Eligible for SUM/AVG aggregation.
    pub fn is_summable(&self) -> bool {
        !self.is_array() && self.is_numeric()
    }

    /// Eligible for MIN/MAX aggregation (numeric or date-like).
    pub fn is_comparable_aggregate(&self) -> bool {
        !self.is_array() && (self.is_numeric() || self.is_temporal())
    }

    /// Base GraphQL type name for this kind (ignoring array wrapping).
    pub fn graphql_base_type(&self) -> String {
        match &self.kind {
            FieldKind::Int => "Int".to_string(),
            FieldKind::BigInt => "BigInt".to_string(),
            FieldKind::Float => "Float".to_string(),
            FieldKind::Decimal => "Decimal".to_string(),
            FieldKind::Boolean => "Boolean".to_string(),
            FieldKind::Text
            | FieldKind::Uuid
            | FieldKind::Bytea
            | FieldKind::Inet
            | FieldKind::Bit => "String".to_string(),
            FieldKind::Date
            | FieldKind::Time
            | FieldKind::Timestamp
            | FieldKind::TimestampTz
            | FieldKind::Interval => "DateTime".to_string(),
            FieldKind::Json => "JSON".to_string(),
            FieldKind::Enum(name) | FieldKind::Composite(name) => type_name(name),
        }
    }

    /// Name of the per-kind filter input type, or None when the kind has no
    /// filter surface.
    pub fn filter_input_name(&self) -> Option<String> {
        if self.is_array() {
            return Some("ArrayFilter".to_string());
        }
        match &self.kind {
            FieldKind::Int => Some("IntFilter".to_string()),
            FieldKind::BigInt => Some("BigIntFilter".to_string()),
            FieldKind::Float => Some("FloatFilter".to_string()),
            FieldKind::Decimal => Some("DecimalFilter".to_string()),
            FieldKind::Boolean => Some("BooleanFilter".to_string()),
            FieldKind::Text
            | FieldKind::Uuid
            | FieldKind::Bytea
            | FieldKind::Inet
            | FieldKind::Bit => Some("StringFilter".to_string()),
            FieldKind::Date
            | FieldKind::Time
            | FieldKind::Timestamp
            | FieldKind::TimestampTz
            | FieldKind::Interval => Some("DateTimeFilter".to_string()),
            FieldKind::Json => Some("JSONFilter".to_string()),
            FieldKind::Enum(name) => Some(format!("{}Filter", type_name(name))),
            FieldKind::Composite(_) => None,
        }
    }

    pub fn filter_category(&self) -> FilterCategory {
        if self.is_array() {
            return FilterCategory::Array;
        }
        match &self.kind {
            FieldKind::Int
            | FieldKind::BigInt
            | FieldKind::Float
            | FieldKind::Decimal
            | FieldKind::Date
            | FieldKind::Time
            | FieldKind::Timestamp
            | FieldKind::TimestampTz
            | FieldKind::Interval => FilterCategory::Comparable,
            FieldKind::Text
            | FieldKind::Uuid
            | FieldKind::Bytea
            | FieldKind::Inet
            | FieldKind::Bit => FilterCategory::Stringy,
            FieldKind::Boolean => FilterCategory::Boolean,
            FieldKind::Json => FilterCategory::Json,
            FieldKind::Enum(_) => FilterCategory::Enum,
            FieldKind::Composite(_) => FilterCategory::None,
        }
    }
}

/// Filter operators per category, in declaration order.
pub fn operators_for(category: FilterCategory) -> &'static [&'static str] {
    match category {
        FilterCategory::Comparable => &[
            "eq", "neq", "gt", "gte", "lt", "lte", "in", "notIn", "isNull", "isNotNull",
        ],
        FilterCategory::Stringy => &[
            "eq",
            "neq",
            "contains",
            "startsWith",
            "endsWith",
            "like",
            "ilike",
            "in",
            "notIn",
            "isNull",
            "isNotNull",
        ],
        FilterCategory::Boolean => &["eq", "isNull"],
        FilterCategory::Json => &["eq", "contains", "hasKey", "isNull", "isNotNull"],
        FilterCategory::Enum => &["eq", "neq", "in", "notIn", "isNull", "isNotNull"],
        FilterCategory::Array => &["contains", "eq", "isNull"],
        FilterCategory::None => &[],
    }
}

/// Classify a reflected column. Unknown raw types fall back to text, which
/// keeps every column representable.
pub fn classify_column(column: &Column, catalog: &Catalog) -> MappedType {
    if column.array_dimensions > 0 {
        let element = column
            .element_type
            .as_deref()
            .unwrap_or(column.raw_type.trim_end_matches("[]"));
        return MappedType {
            kind: classify_raw(element, catalog),
            dims: column.array_dimensions,
        };
    }
    MappedType::scalar(classify_raw(&column.raw_type, catalog))
}

/// Classify a raw database type name.
pub fn classify_raw(raw: &str, catalog: &Catalog) -> FieldKind {
    let normalized = normalize_raw_type(raw);
    match normalized.as_str() {
        "smallint" | "int2" | "integer" | "int" | "int4" | "serial" | "smallserial" => {
            FieldKind::Int
        }
        "bigint" | "int8" | "bigserial" => FieldKind::BigInt,
        "real" | "float4" | "double precision" | "float8" => FieldKind::Float,
        "numeric" | "decimal" | "money" => FieldKind::Decimal,
        "boolean" | "bool" => FieldKind::Boolean,
        "text" | "character varying" | "varchar" | "character" | "char" | "bpchar" | "name"
        | "citext" | "xml" => FieldKind::Text,
        "uuid" => FieldKind::Uuid,
        "date" => FieldKind::Date,
        "time" | "time without time zone" | "time with time zone" | "timetz" => FieldKind::Time,
        "timestamp" | "timestamp without time zone" => FieldKind::Timestamp,
        "timestamptz" | "timestamp with time zone" => FieldKind::TimestampTz,
        "interval" => FieldKind::Interval,
        "json" | "jsonb" => FieldKind::Json,
        "bytea" => FieldKind::Bytea,
        "inet" | "cidr" | "macaddr" | "macaddr8" => FieldKind::Inet,
        "bit" | "bit varying" | "varbit" => FieldKind::Bit,
        other => {
            if catalog.enum_type(other).is_some() {
                FieldKind::Enum(other.to_string())
            } else if catalog.composite_type(other).is_some() {
                FieldKind::Composite(other.to_string())
            } else {
                FieldKind::Text
            }
        }
    }
}

/// Strip modifiers and schema qualification from a `format_type` string:
/// `character varying(30)` → `character varying`, `public.mood` → `mood`.
fn normalize_raw_type(raw: &str) -> String {
    let no_modifier = match raw.find('(') {
        Some(open) => {
            let close = raw.rfind(')').unwrap_or(raw.len() - 1);
            format!("{}{}", &raw[..open], &raw[close + 1..])
        }
        None => raw.to_string(),
    };
    let trimmed = no_modifier.trim();
    let unqualified = trimmed.rsplit('.').next().unwrap_or(trimmed);
    unqualified.trim().to_ascii_lowercase()
}

/// GraphQL type name for a table or user type: first character uppercased,
/// the rest preserved (`order_items` → `Order_items`).
pub fn type_name(raw: &str) -> String {
    let sanitized = sanitize_name(raw);
    let mut chars = sanitized.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => sanitized,
    }
}

/// GraphQL enum value name: uppercased, sanitized label.
pub fn enum_value_name(label: &str) -> String {
    sanitize_name(&label.to_ascii_uppercase())
}

/// Make a string a legal GraphQL name: non-identifier characters become
/// underscores and a leading digit gets an underscore prefix.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, ch) in raw.chars().enumerate() {
        let ok = ch == '_' || ch.is_ascii_alphabetic() || (i > 0 && ch.is_ascii_digit());
        if ok {
            out.push(ch);
        } else if i == 0 && ch.is_ascii_digit() {
            out.push('_');
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Relationship fields wired onto a table's object type, one per foreign
/// key. A single FK to `customer` yields a field `customer`; multiple FKs to
/// the same table are disambiguated by their local columns. A name clashing
/// with a column gets a `_ref` suffix.
pub fn relationship_fields(table: &Table) -> Vec<(String, &ForeignKey)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for fk in &table.foreign_keys {
        *counts.entry(fk.referenced_table.as_str()).or_default() += 1;
    }
    table
        .foreign_keys
        .iter()
        .map(|fk| {
            let mut name = if counts[fk.referenced_table.as_str()] > 1 {
                format!("{}_{}", fk.referenced_table, fk.columns.join("_"))
            } else {
                fk.referenced_table.clone()
            };
            if table.has_column(&name) {
                name.push_str("_ref");
            }
            (name, fk)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::sample_catalog;

    #[test]
    fn test_classify_builtin_types() {
        let catalog = sample_catalog();
        assert_eq!(classify_raw("integer", &catalog), FieldKind::Int);
        assert_eq!(classify_raw("bigint", &catalog), FieldKind::BigInt);
        assert_eq!(classify_raw("numeric(10,2)", &catalog), FieldKind::Decimal);
        assert_eq!(classify_raw("double precision", &catalog), FieldKind::Float);
        assert_eq!(
            classify_raw("character varying(255)", &catalog),
            FieldKind::Text
        );
        assert_eq!(
            classify_raw("timestamp with time zone", &catalog),
            FieldKind::TimestampTz
        );
        assert_eq!(classify_raw("jsonb", &catalog), FieldKind::Json);
        assert_eq!(classify_raw("uuid", &catalog), FieldKind::Uuid);
        assert_eq!(classify_raw("bit varying(8)", &catalog), FieldKind::Bit);
        assert_eq!(classify_raw("cidr", &catalog), FieldKind::Inet);
        assert_eq!(classify_raw("xml", &catalog), FieldKind::Text);
    }

    #[test]
    fn test_classify_user_types() {
        let catalog = sample_catalog();
        assert_eq!(
            classify_raw("mood", &catalog),
            FieldKind::Enum("mood".to_string())
        );
        assert_eq!(
            classify_raw("public.mood", &catalog),
            FieldKind::Enum("mood".to_string())
        );
        // Unknown types degrade to text rather than failing.
        assert_eq!(classify_raw("tsvector", &catalog), FieldKind::Text);
    }

    #[test]
    fn test_array_classification() {
        let catalog = sample_catalog();
        let mut col = crate::catalog::test_fixtures::column("tags", "text[]");
        col.array_dimensions = 1;
        col.element_type = Some("text".to_string());
        let mapped = classify_column(&col, &catalog);
        assert!(mapped.is_array());
        assert_eq!(mapped.kind, FieldKind::Text);
        assert_eq!(mapped.filter_input_name().as_deref(), Some("ArrayFilter"));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(type_name("customer"), "Customer");
        assert_eq!(type_name("order_items"), "Order_items");
        assert_eq!(enum_value_name("happy"), "HAPPY");
        assert_eq!(enum_value_name("not-sure"), "NOT_SURE");
        assert_eq!(sanitize_name("2fa_codes"), "_2fa_codes");
    }

    #[test]
    fn test_operator_grid() {
        let comparable = operators_for(FilterCategory::Comparable);
        assert!(comparable.contains(&"gte"));
        assert!(!comparable.contains(&"like"));

        let stringy = operators_for(FilterCategory::Stringy);
        assert!(stringy.contains(&"ilike"));
        assert!(stringy.contains(&"startsWith"));

        assert_eq!(operators_for(FilterCategory::Boolean), &["eq", "isNull"]);
        assert!(operators_for(FilterCategory::Json).contains(&"hasKey"));
        assert_eq!(
            operators_for(FilterCategory::Array),
            &["contains", "eq", "isNull"]
        );
    }

    #[test]
    fn test_relationship_field_naming() {
        let catalog = sample_catalog();
        let orders = catalog.table("orders").unwrap();
        let fields = relationship_fields(orders);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].0, "customer");
        assert_eq!(fields[0].1.columns, vec!["customer_id"]);
    }

    #[test]
    fn test_aggregate_eligibility() {
        let decimal = MappedType::scalar(FieldKind::Decimal);
        assert!(decimal.is_summable());
        let ts = MappedType::scalar(FieldKind::Timestamp);
        assert!(!ts.is_summable());
        assert!(ts.is_comparable_aggregate());
        let text = MappedType::scalar(FieldKind::Text);
        assert!(!text.is_comparable_aggregate());
    }
}
