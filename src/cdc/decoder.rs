// # wal2json Decoder
//
// Decodes wal2json format-version 2 change records into `ChangeEvent`s.
// Each record is one JSON document with an `action` tag: `I`/`U`/`D` carry
// row images as `columns` (new) and `identity` (old / replica identity);
// `B`/`C`/`M`/`T` frame records are skipped. Under REPLICA IDENTITY FULL
// the identity array holds the complete old row.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as Json;

use super::{ChangeEvent, ChangeOperation};
use crate::error::{GatewayError, Result};

#[derive(Debug, Deserialize)]
struct Wal2JsonRecord {
    action: String,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    columns: Option<Vec<Wal2JsonColumn>>,
    #[serde(default)]
    identity: Option<Vec<Wal2JsonColumn>>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonColumn {
    name: String,
    #[serde(default)]
    value: Json,
}

/// Decode one replication record. Frame records (begin/commit/message/
/// truncate) decode to None.
pub fn decode_change(lsn: &str, payload: &str) -> Result<Option<ChangeEvent>> {
    let record: Wal2JsonRecord = serde_json::from_str(payload)
        .map_err(|e| GatewayError::Replication(format!("undecodable wal2json record: {}", e)))?;

    let operation = match record.action.as_str() {
        "I" => ChangeOperation::Insert,
        "U" => ChangeOperation::Update,
        "D" => ChangeOperation::Delete,
        _ => return Ok(None),
    };

    let table = record
        .table
        .ok_or_else(|| GatewayError::Replication("change record without table".to_string()))?;
    let schema = record.schema.unwrap_or_default();

    let new_image = record.columns.map(columns_to_object);
    let old_image = record.identity.map(columns_to_object);

    let (data, old) = match operation {
        ChangeOperation::Insert => (new_image, None),
        ChangeOperation::Update => (new_image, old_image),
        // DELETE carries only the old image; it is the event payload.
        ChangeOperation::Delete => (old_image, None),
        _ => unreachable!("frame records handled above"),
    };

    Ok(Some(ChangeEvent {
        table,
        schema,
        operation,
        timestamp: parse_commit_timestamp(record.timestamp.as_deref()),
        lsn: Some(lsn.to_string()),
        data,
        old,
        error: None,
    }))
}

fn columns_to_object(columns: Vec<Wal2JsonColumn>) -> Json {
    let mut object = serde_json::Map::with_capacity(columns.len());
    for column in columns {
        object.insert(column.name, column.value);
    }
    Json::Object(object)
}

/// wal2json prints commit timestamps like `2024-03-01 10:30:00.123456+00`.
fn parse_commit_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return Utc::now();
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.with_timezone(&Utc);
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, format) {
            return ts.with_timezone(&Utc);
        }
    }
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_insert() {
        let payload = r#"{
            "action": "I",
            "schema": "public",
            "table": "customer",
            "timestamp": "2024-03-01 10:30:00.123456+00",
            "columns": [
                {"name": "customer_id", "type": "integer", "value": 7},
                {"name": "name", "type": "text", "value": "Ada"},
                {"name": "active", "type": "boolean", "value": true}
            ]
        }"#;
        let event = decode_change("0/16B3748", payload).unwrap().unwrap();
        assert_eq!(event.operation, ChangeOperation::Insert);
        assert_eq!(event.table, "customer");
        assert_eq!(event.schema, "public");
        assert_eq!(event.lsn.as_deref(), Some("0/16B3748"));
        assert_eq!(
            event.data,
            Some(json!({"customer_id": 7, "name": "Ada", "active": true}))
        );
        assert!(event.old.is_none());
        assert_eq!(event.timestamp.to_rfc3339(), "2024-03-01T10:30:00.123456+00:00");
    }

    #[test]
    fn test_decode_update_with_full_identity() {
        let payload = r#"{
            "action": "U",
            "schema": "public",
            "table": "customer",
            "columns": [{"name": "customer_id", "value": 7}, {"name": "name", "value": "Ada L."}],
            "identity": [{"name": "customer_id", "value": 7}, {"name": "name", "value": "Ada"}]
        }"#;
        let event = decode_change("0/16B3800", payload).unwrap().unwrap();
        assert_eq!(event.operation, ChangeOperation::Update);
        assert_eq!(event.data, Some(json!({"customer_id": 7, "name": "Ada L."})));
        assert_eq!(event.old, Some(json!({"customer_id": 7, "name": "Ada"})));
    }

    #[test]
    fn test_decode_delete_uses_identity_as_data() {
        let payload = r#"{
            "action": "D",
            "schema": "public",
            "table": "customer",
            "identity": [{"name": "customer_id", "value": 7}]
        }"#;
        let event = decode_change("0/16B3900", payload).unwrap().unwrap();
        assert_eq!(event.operation, ChangeOperation::Delete);
        assert_eq!(event.data, Some(json!({"customer_id": 7})));
        assert!(event.old.is_none());
    }

    #[test]
    fn test_frame_records_are_skipped() {
        assert!(decode_change("0/1", r#"{"action":"B"}"#).unwrap().is_none());
        assert!(decode_change("0/2", r#"{"action":"C"}"#).unwrap().is_none());
        assert!(decode_change("0/3", r#"{"action":"T"}"#).unwrap().is_none());
    }

    #[test]
    fn test_garbage_is_a_replication_error() {
        let err = decode_change("0/4", "not json").unwrap_err();
        assert_eq!(err.code(), "ReplicationError");
    }

    #[test]
    fn test_null_column_values_survive() {
        let payload = r#"{
            "action": "I",
            "schema": "public",
            "table": "customer",
            "columns": [{"name": "customer_id", "value": 8}, {"name": "name", "value": null}]
        }"#;
        let event = decode_change("0/5", payload).unwrap().unwrap();
        assert_eq!(event.data, Some(json!({"customer_id": 8, "name": null})));
    }
}
