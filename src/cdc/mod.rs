// # Change Data Capture
//
// Logical-replication change events and their per-table fan-out. The engine
// (one per process) decodes replication data into `ChangeEvent`s and
// publishes them through lazily created broadcast channels, one per table;
// subscribers receive only their table's events, in LSN order. A slow
// subscriber drops intermediate events (observable as an ERROR event) but
// never blocks the producer or desyncs the engine's own LSN tracking.

pub mod decoder;
pub mod engine;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::broadcast;

pub use engine::CdcEngine;

/// Buffered events per subscriber before lag drops begin.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
    Heartbeat,
    Error,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "INSERT",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
            ChangeOperation::Heartbeat => "HEARTBEAT",
            ChangeOperation::Error => "ERROR",
        }
    }
}

/// One decoded change-stream event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub schema: String,
    pub operation: ChangeOperation,
    pub timestamp: DateTime<Utc>,
    pub lsn: Option<String>,
    /// Row image: the new row for INSERT/UPDATE, the old row for DELETE.
    pub data: Option<Json>,
    /// Old image for UPDATE: the full row under REPLICA IDENTITY FULL,
    /// otherwise only the replica-identity columns.
    pub old: Option<Json>,
    pub error: Option<String>,
}

impl ChangeEvent {
    pub fn heartbeat(schema: &str, table: &str) -> Self {
        Self {
            table: table.to_string(),
            schema: schema.to_string(),
            operation: ChangeOperation::Heartbeat,
            timestamp: Utc::now(),
            lsn: None,
            data: None,
            old: None,
            error: None,
        }
    }

    pub fn error(schema: &str, table: &str, message: impl Into<String>) -> Self {
        Self {
            table: table.to_string(),
            schema: schema.to_string(),
            operation: ChangeOperation::Error,
            timestamp: Utc::now(),
            lsn: None,
            data: None,
            old: None,
            error: Some(message.into()),
        }
    }
}

/// Per-table broadcast registry.
pub struct TablePublisher {
    schema: String,
    channels: DashMap<String, broadcast::Sender<ChangeEvent>>,
}

impl TablePublisher {
    pub fn new(schema: String) -> Self {
        Self {
            schema,
            channels: DashMap::new(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Subscribe to one table's events; the channel is created on first use.
    pub fn subscribe(&self, table: &str) -> broadcast::Receiver<ChangeEvent> {
        self.channels
            .entry(table.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish one event to its table channel. Events for tables nobody
    /// subscribed to are dropped.
    pub fn publish(&self, event: ChangeEvent) {
        if let Some(sender) = self.channels.get(&event.table) {
            let _ = sender.send(event);
        }
    }

    /// Send an event built per table to every live channel (heartbeats,
    /// engine-level errors).
    pub fn publish_all(&self, build: impl Fn(&str, &str) -> ChangeEvent) {
        for entry in self.channels.iter() {
            let _ = entry.value().send(build(&self.schema, entry.key()));
        }
    }

    /// Number of live subscribers across all tables.
    pub fn subscriber_count(&self) -> usize {
        self.channels
            .iter()
            .map(|entry| entry.value().receiver_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_per_table_fan_out() {
        let publisher = TablePublisher::new("public".to_string());
        let mut customer_rx = publisher.subscribe("customer");
        let mut orders_rx = publisher.subscribe("orders");

        publisher.publish(ChangeEvent {
            table: "customer".to_string(),
            schema: "public".to_string(),
            operation: ChangeOperation::Insert,
            timestamp: Utc::now(),
            lsn: Some("0/16B3748".to_string()),
            data: Some(serde_json::json!({"customer_id": 1})),
            old: None,
            error: None,
        });

        let received = customer_rx.recv().await.unwrap();
        assert_eq!(received.operation, ChangeOperation::Insert);
        assert_eq!(received.table, "customer");
        assert!(orders_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_all_reaches_every_channel() {
        let publisher = TablePublisher::new("public".to_string());
        let mut a = publisher.subscribe("customer");
        let mut b = publisher.subscribe("orders");

        publisher.publish_all(ChangeEvent::heartbeat);

        assert_eq!(a.recv().await.unwrap().operation, ChangeOperation::Heartbeat);
        let hb = b.recv().await.unwrap();
        assert_eq!(hb.operation, ChangeOperation::Heartbeat);
        assert_eq!(hb.table, "orders");
    }
}
