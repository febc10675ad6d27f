// # GraphQL over HTTP
//
// `POST /graphql` accepts `{query, variables?, operationName?}`. Batched
// array payloads are rejected with 4xx. The security guard checks request
// size and query shape before execution; an `X-Database-Role` header binds
// a validated role onto the operation's pinned connection.

use std::sync::Arc;
use std::time::Instant;

use async_graphql::dynamic::Schema;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value as JsonValue};
use sqlx::postgres::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info_span, warn, Instrument};

use crate::catalog::Catalog;
use crate::cdc::CdcEngine;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::executor::ExecutionContext;
use crate::security::SecurityGuard;

pub const ROLE_HEADER: &str = "x-database-role";

/// State shared by the HTTP handlers. Schema and catalog swap together
/// when `refreshSchema` triggers a rebuild.
#[derive(Clone)]
pub struct AppState {
    pub schema: Arc<tokio::sync::RwLock<Schema>>,
    pub catalog: Arc<tokio::sync::RwLock<Arc<Catalog>>>,
    pub pool: PgPool,
    pub config: Arc<GatewayConfig>,
    pub guard: Arc<SecurityGuard>,
    pub cdc: Option<Arc<CdcEngine>>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/graphql", post(graphql_handler))
        .route("/graphql/ws", get(super::ws::ws_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn graphql_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = state.guard.check_request_size(body.len()) {
        return (StatusCode::PAYLOAD_TOO_LARGE, Json(error_body(&err))).into_response();
    }

    let payload: JsonValue = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            let err = GatewayError::Validation(format!("malformed request body: {}", err));
            return (StatusCode::BAD_REQUEST, Json(error_body(&err))).into_response();
        }
    };
    if payload.is_array() {
        let err = GatewayError::Validation("batched GraphQL requests are not supported".into());
        return (StatusCode::BAD_REQUEST, Json(error_body(&err))).into_response();
    }
    let Some(query) = payload.get("query").and_then(JsonValue::as_str) else {
        let err = GatewayError::Validation("request is missing the query field".into());
        return (StatusCode::BAD_REQUEST, Json(error_body(&err))).into_response();
    };
    let operation_name = payload
        .get("operationName")
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    let variables = payload.get("variables").cloned();

    let role = match role_from_headers(&state, &headers) {
        Ok(role) => role,
        Err(err) => return (StatusCode::OK, Json(error_body(&err))).into_response(),
    };

    let catalog = state.catalog.read().await.clone();
    if let Err(err) = state.guard.check_query(query, &catalog) {
        return (StatusCode::OK, Json(error_body(&err))).into_response();
    }

    let exec = match &role {
        Some(role) => match ExecutionContext::with_role(state.pool.clone(), role.clone()).await {
            Ok(ctx) => Arc::new(ctx),
            Err(err) => return (StatusCode::OK, Json(error_body(&err))).into_response(),
        },
        None => Arc::new(ExecutionContext::new(state.pool.clone())),
    };

    let mut request = async_graphql::Request::new(query);
    if let Some(variables) = variables {
        request = request.variables(async_graphql::Variables::from_json(variables));
    }
    if let Some(name) = &operation_name {
        request = request.operation_name(name);
    }
    request = request.data(exec.clone());

    let span = info_span!(
        "graphql_operation",
        operation = operation_name.as_deref().unwrap_or("anonymous"),
        role = role.as_deref().unwrap_or("")
    );
    let schema = state.schema.read().await.clone();
    let response = schema.execute(request).instrument(span).await;

    let mut body = serde_json::to_value(&response).unwrap_or_else(|_| json!({"data": null}));

    // Commit the role-pinned transaction once execution is done.
    match Arc::try_unwrap(exec) {
        Ok(context) => {
            if let Err(err) = context.finish().await {
                warn!(error = %err, "failed to commit role-bound transaction");
                append_error(&mut body, &err);
            }
        }
        Err(_) => warn!("execution context still shared after execution"),
    }

    (StatusCode::OK, Json(body)).into_response()
}

fn role_from_headers(
    state: &AppState,
    headers: &HeaderMap,
) -> crate::error::Result<Option<String>> {
    let Some(raw) = headers.get(ROLE_HEADER) else {
        return Ok(None);
    };
    let role = raw
        .to_str()
        .map_err(|_| GatewayError::Validation("invalid database role header".into()))?;
    state.guard.validate_role(role)?;
    Ok(Some(role.to_string()))
}

/// Standard GraphQL error body for failures raised before execution.
fn error_body(err: &GatewayError) -> JsonValue {
    json!({
        "data": null,
        "errors": [{
            "message": err.client_message(),
            "extensions": {"code": err.code()}
        }]
    })
}

fn append_error(body: &mut JsonValue, err: &GatewayError) {
    let entry = json!({
        "message": err.client_message(),
        "extensions": {"code": err.code()}
    });
    match body.get_mut("errors").and_then(JsonValue::as_array_mut) {
        Some(errors) => errors.push(entry),
        None => {
            body["errors"] = json!([entry]);
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<JsonValue> {
    let catalog = state.catalog.read().await.clone();
    let cdc = match &state.cdc {
        Some(engine) => json!({
            "enabled": true,
            "lastLsn": engine.last_lsn(),
            "subscribers": engine.subscriber_count(),
        }),
        None => json!({"enabled": false}),
    };
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "schema": catalog.schema,
        "tables": catalog.tables.len(),
        "cdc": cdc,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_shape() {
        let err = GatewayError::ExecutionAborted("maximum query depth exceeded".into());
        let body = error_body(&err);
        assert_eq!(body["errors"][0]["extensions"]["code"], "ExecutionAborted");
        assert!(body["errors"][0]["message"]
            .as_str()
            .unwrap()
            .contains("maximum query depth exceeded"));
        assert!(body["data"].is_null());
    }

    #[test]
    fn test_database_errors_stay_generic() {
        let err = GatewayError::Database("secret table layout".into());
        let body = error_body(&err);
        assert_eq!(body["errors"][0]["message"], "internal database error");
    }
}
