// # PostGate Server
//
// Main entry point. Reflects the configured schema, builds the GraphQL
// schema from the snapshot, optionally starts the CDC engine, and serves
// HTTP + WebSocket traffic until shutdown.

use std::sync::Arc;
use std::time::Instant;

use postgate::catalog::{CatalogCache, ReflectorRegistry};
use postgate::cdc::CdcEngine;
use postgate::graphql::{build_schema, GatewayState};
use postgate::security::SecurityGuard;
use postgate::server::{build_router, AppState};
use postgate::{GatewayConfig, Result, VERSION};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    info!("PostGate {} starting", VERSION);

    let config = Arc::new(GatewayConfig::from_env()?);
    info!(
        schema = %config.schema,
        dialect = %config.database_type,
        listen = %config.listen_addr,
        cdc = config.cdc.enabled,
        "configuration loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.pool_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(postgate::GatewayError::from_sqlx)?;

    let registry = ReflectorRegistry::with_defaults();
    let reflector = registry.get(&config.database_type)?;
    let catalog_cache = Arc::new(CatalogCache::new(config.cache.schema_ttl));

    let catalog = catalog_cache
        .get_or_reflect(&pool, reflector.as_ref(), &config.schema)
        .await?;

    let cdc = if config.cdc.enabled {
        let engine = CdcEngine::new(
            config.database_url.clone(),
            config.schema.clone(),
            config.cdc.clone(),
        );
        engine.start();
        info!(
            slot = %config.cdc.slot_name,
            publication = %config.cdc.publication_name,
            "CDC engine started"
        );
        Some(engine)
    } else {
        None
    };

    let rebuild = Arc::new(tokio::sync::Notify::new());
    let gateway_state = GatewayState {
        pool: pool.clone(),
        catalog: catalog.clone(),
        config: config.clone(),
        catalog_cache: catalog_cache.clone(),
        cdc: cdc.clone(),
        rebuild: rebuild.clone(),
    };
    let schema = build_schema(gateway_state)?;
    info!(tables = catalog.tables.len(), "GraphQL schema built");

    let app_state = AppState {
        schema: Arc::new(tokio::sync::RwLock::new(schema)),
        catalog: Arc::new(tokio::sync::RwLock::new(catalog)),
        pool: pool.clone(),
        config: config.clone(),
        guard: Arc::new(SecurityGuard::new(config.security.clone())),
        cdc: cdc.clone(),
        started_at: Instant::now(),
    };

    // Schema rebuild loop: refreshSchema invalidates the catalog cache and
    // notifies; a fresh snapshot and schema are swapped in together.
    {
        let app_state = app_state.clone();
        let pool = pool.clone();
        let config = config.clone();
        let catalog_cache = catalog_cache.clone();
        let cdc = cdc.clone();
        let rebuild = rebuild.clone();
        let reflector = reflector.clone();
        tokio::spawn(async move {
            loop {
                rebuild.notified().await;
                info!(schema = %config.schema, "rebuilding GraphQL schema");
                let snapshot = match catalog_cache
                    .get_or_reflect(&pool, reflector.as_ref(), &config.schema)
                    .await
                {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        error!(error = %err, "schema reflection failed; keeping current schema");
                        continue;
                    }
                };
                let state = GatewayState {
                    pool: pool.clone(),
                    catalog: snapshot.clone(),
                    config: config.clone(),
                    catalog_cache: catalog_cache.clone(),
                    cdc: cdc.clone(),
                    rebuild: rebuild.clone(),
                };
                match build_schema(state) {
                    Ok(new_schema) => {
                        *app_state.schema.write().await = new_schema;
                        *app_state.catalog.write().await = snapshot;
                        info!("GraphQL schema rebuilt");
                    }
                    Err(err) => {
                        error!(error = %err, "schema rebuild failed; keeping current schema");
                    }
                }
            }
        });
    }

    let router = build_router(app_state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr.as_str()).await?;
    info!(listen = %config.listen_addr, "serving GraphQL at /graphql, subscriptions at /graphql/ws");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(engine) = &cdc {
        engine.stop();
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
