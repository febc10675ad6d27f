// # Pagination Cursors
//
// A cursor encodes the final row's orderBy tuple as
// `base64("field1:v1|field2:v2|…")` in declared order. Field names and
// values are percent-escaped so the separators stay unambiguous. Decoding
// failures are validation errors.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value as Json;

use crate::error::{GatewayError, Result};

/// Cursor value emitted on offset-based paging, where no orderBy tuple
/// exists to build a real cursor from.
pub const OFFSET_CURSOR_SENTINEL: &str = "offset-paging:orderBy-required-for-cursors";

/// Encode an orderBy tuple into an opaque cursor.
pub fn encode_cursor(tuple: &[(String, Json)]) -> String {
    let payload = tuple
        .iter()
        .map(|(field, value)| format!("{}:{}", escape(field), escape(&value.to_string())))
        .collect::<Vec<_>>()
        .join("|");
    BASE64.encode(payload)
}

/// Decode a cursor back into its orderBy tuple.
pub fn decode_cursor(cursor: &str) -> Result<Vec<(String, Json)>> {
    let invalid = || GatewayError::Validation(format!("invalid cursor {:?}", cursor));

    let raw = BASE64.decode(cursor).map_err(|_| invalid())?;
    let payload = String::from_utf8(raw).map_err(|_| invalid())?;

    let mut tuple = Vec::new();
    for segment in payload.split('|') {
        let (field, value) = segment.split_once(':').ok_or_else(invalid)?;
        let field = unescape(field).ok_or_else(invalid)?;
        let value = unescape(value).ok_or_else(invalid)?;
        let value: Json = serde_json::from_str(&value).map_err(|_| invalid())?;
        tuple.push((field, value));
    }
    if tuple.is_empty() {
        return Err(invalid());
    }
    Ok(tuple)
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '|' => out.push_str("%7C"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let hex: String = chars.by_ref().take(2).collect();
        let code = u8::from_str_radix(&hex, 16).ok()?;
        out.push(code as char);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let tuple = vec![
            ("customer_id".to_string(), json!(5)),
            ("name".to_string(), json!("Ada")),
        ];
        let decoded = decode_cursor(&encode_cursor(&tuple)).unwrap();
        assert_eq!(decoded, tuple);
    }

    #[test]
    fn test_separators_in_values() {
        let tuple = vec![("label".to_string(), json!("a|b:c%d"))];
        let decoded = decode_cursor(&encode_cursor(&tuple)).unwrap();
        assert_eq!(decoded, tuple);
    }

    #[test]
    fn test_invalid_cursors() {
        assert!(decode_cursor("not base64!").is_err());
        assert!(decode_cursor(&BASE64.encode("no-separator")).is_err());
        assert!(decode_cursor(&BASE64.encode("field:not-json")).is_err());
        assert!(decode_cursor("").is_err());
    }

    #[test]
    fn test_sentinel_shape() {
        assert_eq!(
            OFFSET_CURSOR_SENTINEL,
            "offset-paging:orderBy-required-for-cursors"
        );
        // The sentinel must never decode as a real cursor.
        assert!(decode_cursor(OFFSET_CURSOR_SENTINEL).is_err());
    }
}
