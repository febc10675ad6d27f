// # Bind-Time Coercion
//
// Turns GraphQL input values into typed bind parameters using the catalog's
// column classification. Invalid coercions surface as validation errors
// before any SQL is issued; there is no silent truncation.

use serde_json::Value as Json;

use super::BindValue;
use crate::catalog::Catalog;
use crate::error::{GatewayError, Result};
use crate::graphql::scalars;
use crate::graphql::type_mapper::{enum_value_name, FieldKind, MappedType};
use crate::sql::quote_ident;

/// Typed SQL NULL for a column kind.
pub fn null_bind(mapped: &MappedType) -> BindValue {
    if mapped.is_array() {
        return BindValue::Text(None);
    }
    match &mapped.kind {
        FieldKind::Int | FieldKind::BigInt => BindValue::Int(None),
        FieldKind::Float => BindValue::Float(None),
        FieldKind::Boolean => BindValue::Bool(None),
        FieldKind::Uuid => BindValue::Uuid(None),
        FieldKind::Date => BindValue::Date(None),
        FieldKind::Timestamp => BindValue::Timestamp(None),
        FieldKind::TimestampTz => BindValue::TimestampTz(None),
        FieldKind::Json => BindValue::Json(None),
        _ => BindValue::Text(None),
    }
}

/// Cast target appended to a placeholder when the bound wire type differs
/// from the column type. Targets are derived from the catalog (`raw_type` as
/// printed by format_type, or a quoted qualified name for user types),
/// never from request input.
pub fn bind_cast(mapped: &MappedType, raw_type: &str, schema: &str) -> Option<String> {
    if mapped.is_array() {
        return Some(array_cast_target(mapped, raw_type, schema));
    }
    match &mapped.kind {
        FieldKind::Decimal
        | FieldKind::Time
        | FieldKind::Interval
        | FieldKind::Bytea
        | FieldKind::Inet
        | FieldKind::Bit => Some(raw_type.to_string()),
        FieldKind::Json if raw_type.eq_ignore_ascii_case("json") => Some("json".to_string()),
        FieldKind::Enum(name) | FieldKind::Composite(name) => {
            Some(format!("{}.{}", quote_ident(schema), quote_ident(name)))
        }
        _ => None,
    }
}

fn array_cast_target(mapped: &MappedType, raw_type: &str, schema: &str) -> String {
    match &mapped.kind {
        FieldKind::Enum(name) | FieldKind::Composite(name) => {
            let brackets = "[]".repeat(mapped.dims.max(1) as usize);
            format!("{}.{}{}", quote_ident(schema), quote_ident(name), brackets)
        }
        _ => raw_type.to_string(),
    }
}

/// Coerce one GraphQL input value into a bind parameter for a column of the
/// given mapped type. `context` names the column (or argument) for error
/// messages.
pub fn coerce_bind(
    value: &Json,
    mapped: &MappedType,
    catalog: &Catalog,
    context: &str,
) -> Result<BindValue> {
    if value.is_null() {
        return Ok(null_bind(mapped));
    }
    if mapped.is_array() {
        let items = value.as_array().ok_or_else(|| {
            GatewayError::Validation(format!("{}: expected a list value", context))
        })?;
        return Ok(BindValue::Text(Some(pg_array_literal(items))));
    }
    match &mapped.kind {
        FieldKind::Int | FieldKind::BigInt => Ok(BindValue::Int(Some(as_i64(value, context)?))),
        FieldKind::Float => Ok(BindValue::Float(Some(as_f64(value, context)?))),
        FieldKind::Decimal => {
            let text = match value {
                Json::Number(n) => n.to_string(),
                Json::String(s) => s.clone(),
                _ => {
                    return Err(GatewayError::Validation(format!(
                        "{}: expected a decimal value",
                        context
                    )))
                }
            };
            validate_decimal_text(&text, context)?;
            Ok(BindValue::Text(Some(text)))
        }
        FieldKind::Boolean => match value {
            Json::Bool(b) => Ok(BindValue::Bool(Some(*b))),
            _ => Err(GatewayError::Validation(format!(
                "{}: expected a boolean value",
                context
            ))),
        },
        FieldKind::Text => Ok(BindValue::Text(Some(as_string(value, context)?))),
        FieldKind::Uuid => {
            let raw = as_string(value, context)?;
            Ok(BindValue::Uuid(Some(scalars::parse_uuid(&raw)?)))
        }
        FieldKind::Date => {
            let raw = as_string(value, context)?;
            Ok(BindValue::Date(Some(scalars::parse_temporal(&raw)?.as_date())))
        }
        FieldKind::Timestamp => {
            let raw = as_string(value, context)?;
            Ok(BindValue::Timestamp(Some(
                scalars::parse_temporal(&raw)?.as_timestamp(),
            )))
        }
        FieldKind::TimestampTz => {
            let raw = as_string(value, context)?;
            Ok(BindValue::TimestampTz(Some(
                scalars::parse_temporal(&raw)?.as_timestamptz(),
            )))
        }
        // Time-of-day and interval values pass through as text and are cast
        // server-side to the exact column type.
        FieldKind::Time | FieldKind::Interval => {
            Ok(BindValue::Text(Some(as_string(value, context)?)))
        }
        FieldKind::Json => Ok(BindValue::Json(Some(scalars::coerce_json_input(
            value.clone(),
        )?))),
        FieldKind::Bytea => {
            let raw = as_string(value, context)?;
            let hex = raw.strip_prefix("\\x").unwrap_or(&raw);
            if hex.len() % 2 != 0 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(GatewayError::Validation(format!(
                    "{}: expected base16 binary data",
                    context
                )));
            }
            Ok(BindValue::Text(Some(format!("\\x{}", hex))))
        }
        FieldKind::Inet => {
            let raw = as_string(value, context)?;
            scalars::validate_network(&raw)?;
            Ok(BindValue::Text(Some(raw)))
        }
        FieldKind::Bit => {
            let raw = as_string(value, context)?;
            scalars::validate_bit_string(&raw)?;
            Ok(BindValue::Text(Some(raw)))
        }
        FieldKind::Enum(name) => {
            let raw = as_string(value, context)?;
            let label = resolve_enum_label(catalog, name, &raw).ok_or_else(|| {
                GatewayError::Validation(format!(
                    "{}: {:?} is not a value of enum {}",
                    context, raw, name
                ))
            })?;
            Ok(BindValue::Text(Some(label)))
        }
        FieldKind::Composite(name) => {
            let composite = catalog.composite_type(name).ok_or_else(|| {
                GatewayError::Catalog(format!("unknown composite type {}", name))
            })?;
            let obj = value.as_object().ok_or_else(|| {
                GatewayError::Validation(format!("{}: expected an object value", context))
            })?;
            let mut parts = Vec::with_capacity(composite.fields.len());
            for field in &composite.fields {
                match obj.get(&field.name) {
                    None | Some(Json::Null) => parts.push(String::new()),
                    Some(v) => parts.push(quote_composite_part(v)),
                }
            }
            Ok(BindValue::Text(Some(format!("({})", parts.join(",")))))
        }
    }
}

/// Map a GraphQL enum value name back to the original database label.
fn resolve_enum_label(catalog: &Catalog, enum_name: &str, input: &str) -> Option<String> {
    let def = catalog.enum_type(enum_name)?;
    def.values
        .iter()
        .find(|label| enum_value_name(label) == input || label.as_str() == input)
        .cloned()
}

fn as_i64(value: &Json, context: &str) -> Result<i64> {
    match value {
        Json::Number(n) => n
            .as_i64()
            .ok_or_else(|| GatewayError::Validation(format!("{}: integer out of range", context))),
        Json::String(s) => s
            .parse::<i64>()
            .map_err(|_| GatewayError::Validation(format!("{}: invalid integer {:?}", context, s))),
        _ => Err(GatewayError::Validation(format!(
            "{}: expected an integer value",
            context
        ))),
    }
}

fn as_f64(value: &Json, context: &str) -> Result<f64> {
    match value {
        Json::Number(n) => n
            .as_f64()
            .ok_or_else(|| GatewayError::Validation(format!("{}: invalid float", context))),
        Json::String(s) => s
            .parse::<f64>()
            .map_err(|_| GatewayError::Validation(format!("{}: invalid float {:?}", context, s))),
        _ => Err(GatewayError::Validation(format!(
            "{}: expected a float value",
            context
        ))),
    }
}

fn as_string(value: &Json, context: &str) -> Result<String> {
    match value {
        Json::String(s) => Ok(s.clone()),
        _ => Err(GatewayError::Validation(format!(
            "{}: expected a string value",
            context
        ))),
    }
}

fn validate_decimal_text(text: &str, context: &str) -> Result<()> {
    let mut chars = text.chars().peekable();
    if matches!(chars.peek(), Some('+') | Some('-')) {
        chars.next();
    }
    let rest: String = chars.collect();
    let ok = !rest.is_empty()
        && rest.chars().all(|c| c.is_ascii_digit() || c == '.')
        && rest.chars().filter(|&c| c == '.').count() <= 1
        && rest.chars().any(|c| c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(GatewayError::Validation(format!(
            "{}: invalid decimal {:?}",
            context, text
        )))
    }
}

/// Render a JSON list as a Postgres array literal; the placeholder carrying
/// it is cast to the exact array type.
pub fn pg_array_literal(items: &[Json]) -> String {
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Json::Null => parts.push("NULL".to_string()),
            Json::Array(inner) => parts.push(pg_array_literal(inner)),
            Json::String(s) => parts.push(quote_array_element(s)),
            other => parts.push(quote_array_element(&other.to_string())),
        }
    }
    format!("{{{}}}", parts.join(","))
}

fn quote_array_element(raw: &str) -> String {
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}

fn quote_composite_part(value: &Json) -> String {
    let raw = match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    };
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::sample_catalog;
    use crate::graphql::type_mapper::MappedType;
    use serde_json::json;

    #[test]
    fn test_integer_coercion() {
        let catalog = sample_catalog();
        let mapped = MappedType::scalar(FieldKind::Int);
        assert_eq!(
            coerce_bind(&json!(42), &mapped, &catalog, "customer_id").unwrap(),
            BindValue::Int(Some(42))
        );
        assert!(coerce_bind(&json!("abc"), &mapped, &catalog, "customer_id").is_err());
        assert!(coerce_bind(&json!(1.5), &mapped, &catalog, "customer_id").is_err());
    }

    #[test]
    fn test_null_is_typed() {
        let catalog = sample_catalog();
        let mapped = MappedType::scalar(FieldKind::Uuid);
        assert_eq!(
            coerce_bind(&Json::Null, &mapped, &catalog, "id").unwrap(),
            BindValue::Uuid(None)
        );
    }

    #[test]
    fn test_temporal_target_types() {
        let catalog = sample_catalog();
        let date = coerce_bind(
            &json!("2024-03-01 10:30:00"),
            &MappedType::scalar(FieldKind::Date),
            &catalog,
            "d",
        )
        .unwrap();
        assert_eq!(
            date,
            BindValue::Date(chrono::NaiveDate::from_ymd_opt(2024, 3, 1))
        );
        assert!(coerce_bind(
            &json!("03/01/2024"),
            &MappedType::scalar(FieldKind::Timestamp),
            &catalog,
            "d"
        )
        .is_err());
    }

    #[test]
    fn test_enum_round_trip() {
        let catalog = sample_catalog();
        let mapped = MappedType::scalar(FieldKind::Enum("mood".to_string()));
        assert_eq!(
            coerce_bind(&json!("HAPPY"), &mapped, &catalog, "mood").unwrap(),
            BindValue::Text(Some("happy".to_string()))
        );
        assert!(coerce_bind(&json!("FURIOUS"), &mapped, &catalog, "mood").is_err());
    }

    #[test]
    fn test_bytea_forms() {
        let catalog = sample_catalog();
        let mapped = MappedType::scalar(FieldKind::Bytea);
        assert_eq!(
            coerce_bind(&json!("\\xdeadbeef"), &mapped, &catalog, "payload").unwrap(),
            BindValue::Text(Some("\\xdeadbeef".to_string()))
        );
        assert_eq!(
            coerce_bind(&json!("deadbeef"), &mapped, &catalog, "payload").unwrap(),
            BindValue::Text(Some("\\xdeadbeef".to_string()))
        );
        assert!(coerce_bind(&json!("xyz"), &mapped, &catalog, "payload").is_err());
    }

    #[test]
    fn test_array_literal() {
        assert_eq!(
            pg_array_literal(&[json!(1), json!(2), Json::Null]),
            "{\"1\",\"2\",NULL}"
        );
        assert_eq!(
            pg_array_literal(&[json!("a\"b"), json!("c\\d")]),
            "{\"a\\\"b\",\"c\\\\d\"}"
        );
    }

    #[test]
    fn test_decimal_validation() {
        let catalog = sample_catalog();
        let mapped = MappedType::scalar(FieldKind::Decimal);
        assert_eq!(
            coerce_bind(&json!("12.50"), &mapped, &catalog, "total").unwrap(),
            BindValue::Text(Some("12.50".to_string()))
        );
        assert!(coerce_bind(&json!("12.5.0"), &mapped, &catalog, "total").is_err());
        assert!(coerce_bind(&json!("12,50"), &mapped, &catalog, "total").is_err());
    }

    #[test]
    fn test_bind_cast_targets() {
        let decimal = MappedType::scalar(FieldKind::Decimal);
        assert_eq!(
            bind_cast(&decimal, "numeric(10,2)", "public").as_deref(),
            Some("numeric(10,2)")
        );
        let enum_ty = MappedType::scalar(FieldKind::Enum("mood".to_string()));
        assert_eq!(
            bind_cast(&enum_ty, "mood", "public").as_deref(),
            Some("\"public\".\"mood\"")
        );
        let int = MappedType::scalar(FieldKind::Int);
        assert_eq!(bind_cast(&int, "integer", "public"), None);
        let int_array = MappedType {
            kind: FieldKind::Int,
            dims: 1,
        };
        assert_eq!(
            bind_cast(&int_array, "integer[]", "public").as_deref(),
            Some("integer[]")
        );
    }
}
