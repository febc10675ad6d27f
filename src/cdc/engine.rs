// # CDC Engine
//
// Consumes PostgreSQL logical replication through the wal2json output
// plugin on a dedicated connection that never joins the pool. The loop
// peeks a batch of changes, decodes and fans them out, then advances the
// slot, so the slot's confirmed LSN only moves past events that reached
// the publisher, and a restart resumes from the last confirmed LSN. On
// connection loss it reconnects with capped exponential backoff and emits
// one ERROR event per failure window to every live subscriber.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sqlx::postgres::PgConnection;
use sqlx::{Connection, Row};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use super::{ChangeEvent, TablePublisher};
use crate::config::CdcConfig;
use crate::error::{GatewayError, Result};

/// Idle wait between empty polls of the replication slot.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Changes fetched per poll.
const BATCH_SIZE: i32 = 512;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct CdcEngine {
    database_url: String,
    schema: String,
    config: CdcConfig,
    publisher: TablePublisher,
    last_lsn: RwLock<Option<String>>,
    shutdown: watch::Sender<bool>,
}

impl CdcEngine {
    pub fn new(database_url: String, schema: String, config: CdcConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            database_url,
            schema: schema.clone(),
            config,
            publisher: TablePublisher::new(schema),
            last_lsn: RwLock::new(None),
            shutdown,
        })
    }

    /// Subscribe to one table's change stream.
    pub fn subscribe(&self, table: &str) -> broadcast::Receiver<ChangeEvent> {
        self.publisher.subscribe(table)
    }

    /// Last LSN handed to the publisher (observability).
    pub fn last_lsn(&self) -> Option<String> {
        self.last_lsn.read().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.publisher.subscriber_count()
    }

    /// Start the replication consumer and the heartbeat ticker.
    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move { engine.run().await });

        let engine = self.clone();
        tokio::spawn(async move { engine.heartbeat_loop().await });
    }

    /// Stop the engine; both loops exit at their next check.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.publisher.publish_all(ChangeEvent::heartbeat);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = Duration::from_secs(1);
        let mut error_emitted = false;

        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.consume(&mut shutdown, &mut error_emitted, &mut backoff).await {
                Ok(()) => return, // clean shutdown
                Err(err) => {
                    error!(error = %err, "replication consumer failed");
                    if !error_emitted {
                        // One ERROR event per failure window; the flag
                        // resets when a session attaches again.
                        self.publisher.publish_all(|schema, table| {
                            ChangeEvent::error(schema, table, "change stream interrupted; reconnecting")
                        });
                        error_emitted = true;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// One consumer session: connect, ensure the slot, then poll-decode-
    /// publish-advance until shutdown.
    async fn consume(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        error_emitted: &mut bool,
        backoff: &mut Duration,
    ) -> Result<()> {
        let mut conn = PgConnection::connect(&self.database_url)
            .await
            .map_err(GatewayError::from_sqlx)?;

        self.ensure_slot(&mut conn).await?;
        let table_filter = self.table_filter(&mut conn).await?;
        info!(
            slot = %self.config.slot_name,
            filter = %table_filter,
            "replication consumer attached"
        );
        // The failure window ends once a session attaches.
        *error_emitted = false;
        *backoff = Duration::from_secs(1);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let rows = sqlx::query(
                "SELECT lsn::text AS lsn, data \
                 FROM pg_logical_slot_peek_changes($1, NULL, $2, \
                      'format-version', '2', 'include-timestamp', 'true', 'add-tables', $3)",
            )
            .bind(&self.config.slot_name)
            .bind(BATCH_SIZE)
            .bind(&table_filter)
            .fetch_all(&mut conn)
            .await
            .map_err(GatewayError::from_sqlx)?;

            if rows.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let mut upto: Option<String> = None;
            for row in &rows {
                let lsn: String = row.try_get("lsn").map_err(GatewayError::from_sqlx)?;
                let data: String = row.try_get("data").map_err(GatewayError::from_sqlx)?;
                match super::decoder::decode_change(&lsn, &data) {
                    Ok(Some(event)) => self.publisher.publish(event),
                    Ok(None) => {}
                    Err(err) => {
                        // A single undecodable record must not wedge the
                        // slot; skip it and keep the stream moving.
                        warn!(%lsn, error = %err, "skipping undecodable change record");
                    }
                }
                upto = Some(lsn);
            }

            if let Some(lsn) = upto {
                sqlx::query("SELECT pg_replication_slot_advance($1, $2::pg_lsn)")
                    .bind(&self.config.slot_name)
                    .bind(&lsn)
                    .execute(&mut conn)
                    .await
                    .map_err(GatewayError::from_sqlx)?;
                *self.last_lsn.write() = Some(lsn);
            }
        }
    }

    async fn ensure_slot(&self, conn: &mut PgConnection) -> Result<()> {
        let exists = sqlx::query("SELECT 1 FROM pg_replication_slots WHERE slot_name = $1")
            .bind(&self.config.slot_name)
            .fetch_optional(&mut *conn)
            .await
            .map_err(GatewayError::from_sqlx)?
            .is_some();
        if exists {
            return Ok(());
        }
        info!(slot = %self.config.slot_name, "creating logical replication slot");
        sqlx::query("SELECT pg_create_logical_replication_slot($1, 'wal2json')")
            .bind(&self.config.slot_name)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                GatewayError::Replication(format!(
                    "cannot attach replication slot {:?}: {} \
                     (logical replication must be enabled and wal2json installed)",
                    self.config.slot_name, e
                ))
            })?;
        Ok(())
    }

    /// wal2json add-tables filter from the configured publication, falling
    /// back to every table of the exposed schema.
    async fn table_filter(&self, conn: &mut PgConnection) -> Result<String> {
        let rows = sqlx::query(
            "SELECT schemaname, tablename FROM pg_publication_tables WHERE pubname = $1",
        )
        .bind(&self.config.publication_name)
        .fetch_all(&mut *conn)
        .await
        .map_err(GatewayError::from_sqlx)?;

        if rows.is_empty() {
            warn!(
                publication = %self.config.publication_name,
                "publication not found or empty; capturing the whole schema"
            );
            return Ok(format!("{}.*", self.schema));
        }

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let schema: String = row.try_get("schemaname").map_err(GatewayError::from_sqlx)?;
            let table: String = row.try_get("tablename").map_err(GatewayError::from_sqlx)?;
            entries.push(format!("{}.{}", schema, table));
        }
        Ok(entries.join(","))
    }
}
