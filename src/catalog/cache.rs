// # Catalog Snapshot Cache
//
// TTL cache of reflected catalog snapshots keyed by schema name. Reads take
// a shared lock on the entry map; refreshes serialize behind an async mutex
// and swap in whole snapshots, so readers always see a consistent catalog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sqlx::postgres::PgPool;
use tracing::debug;

use super::reflector::SchemaReflector;
use super::Catalog;
use crate::error::Result;

struct CacheEntry {
    catalog: Arc<Catalog>,
    cached_at: Instant,
}

pub struct CatalogCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl CatalogCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// A live (unexpired) snapshot for the schema, if one is cached.
    pub fn get(&self, schema: &str) -> Option<Arc<Catalog>> {
        let entries = self.entries.read();
        let entry = entries.get(schema)?;
        if entry.cached_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.catalog.clone())
    }

    /// The cached snapshot or a fresh reflection. Concurrent callers for an
    /// expired entry serialize on the refresh lock; only one reflects, the
    /// rest pick up the swapped-in snapshot. A failed reflection caches
    /// nothing.
    pub async fn get_or_reflect(
        &self,
        pool: &PgPool,
        reflector: &dyn SchemaReflector,
        schema: &str,
    ) -> Result<Arc<Catalog>> {
        if let Some(catalog) = self.get(schema) {
            return Ok(catalog);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another task may have refreshed while we waited.
        if let Some(catalog) = self.get(schema) {
            return Ok(catalog);
        }

        let catalog = Arc::new(reflector.reflect(pool, schema).await?);
        self.entries.write().insert(
            schema.to_string(),
            CacheEntry {
                catalog: catalog.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(catalog)
    }

    /// Drop the snapshot for one schema.
    pub fn invalidate(&self, schema: &str) {
        debug!(schema, "invalidating catalog snapshot");
        self.entries.write().remove(schema);
    }

    /// Drop every cached snapshot.
    pub fn invalidate_all(&self) {
        debug!("invalidating all catalog snapshots");
        self.entries.write().clear();
    }
}
