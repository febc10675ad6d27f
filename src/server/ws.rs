// # graphql-transport-ws Transport
//
// Hand-rolled session for the `graphql-transport-ws` subprotocol:
// `connection_init` acks, `ping` pongs, `subscribe` starts a forwarding
// task per operation id, `complete` cancels it, unknown message types are
// ignored. A repeated subscribe on a live id cancels the prior stream
// first; closing the socket cancels everything. Each subscription forwards
// one event at a time, so the client's consumption paces demand.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::debug;

use super::http::AppState;
use crate::executor::ExecutionContext;

pub const SUBPROTOCOL: &str = "graphql-transport-ws";

/// Messages a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ConnectionInit {
        #[serde(default)]
        payload: Option<JsonValue>,
    },
    Ping {
        #[serde(default)]
        payload: Option<JsonValue>,
    },
    Pong {
        #[serde(default)]
        payload: Option<JsonValue>,
    },
    Subscribe {
        id: String,
        payload: SubscribePayload,
    },
    Complete {
        id: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct SubscribePayload {
    pub query: String,
    #[serde(default)]
    pub variables: Option<JsonValue>,
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
}

/// Messages the server sends.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAck,
    Pong,
    Next { id: String, payload: JsonValue },
    Error { id: String, payload: JsonValue },
    Complete { id: String },
}

type SharedSink = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: AppState) {
    let (sink, mut incoming) = socket.split();
    let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();
    let mut acknowledged = false;

    while let Some(Ok(message)) = incoming.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let parsed: ClientMessage = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(_) => {
                // Unknown or malformed message types are ignored.
                debug!("ignoring unrecognized websocket message");
                continue;
            }
        };

        match parsed {
            ClientMessage::ConnectionInit { .. } => {
                if acknowledged {
                    // Duplicate init is a protocol violation.
                    break;
                }
                acknowledged = true;
                if send(&sink, &ServerMessage::ConnectionAck).await.is_err() {
                    break;
                }
            }
            ClientMessage::Ping { .. } => {
                if send(&sink, &ServerMessage::Pong).await.is_err() {
                    break;
                }
            }
            ClientMessage::Pong { .. } => {}
            ClientMessage::Complete { id } => {
                if let Some(handle) = subscriptions.remove(&id) {
                    handle.abort();
                }
            }
            ClientMessage::Subscribe { id, payload } => {
                if !acknowledged {
                    // Subscribe before connection_init is a protocol
                    // violation.
                    break;
                }
                // A repeated subscribe with a live id cancels the prior
                // stream first.
                if let Some(prior) = subscriptions.remove(&id) {
                    prior.abort();
                }

                let catalog = state.catalog.read().await.clone();
                if let Err(err) = state.guard.check_query(&payload.query, &catalog) {
                    let message = ServerMessage::Error {
                        id: id.clone(),
                        payload: serde_json::json!([{
                            "message": err.client_message(),
                            "extensions": {"code": err.code()}
                        }]),
                    };
                    if send(&sink, &message).await.is_err() {
                        break;
                    }
                    continue;
                }

                let schema = state.schema.read().await.clone();
                let pool = state.pool.clone();
                let sink = sink.clone();
                let subscription_id = id.clone();
                let handle = tokio::spawn(async move {
                    run_subscription(schema, pool, sink, subscription_id, payload).await;
                });
                subscriptions.insert(id, handle);
            }
        }
    }

    // Connection closed: cancel every live subscription. Aborting the
    // forwarding task drops its stream, which unsubscribes it from the CDC
    // publisher.
    for (_, handle) in subscriptions {
        handle.abort();
    }
}

async fn run_subscription(
    schema: async_graphql::dynamic::Schema,
    pool: sqlx::postgres::PgPool,
    sink: SharedSink,
    id: String,
    payload: SubscribePayload,
) {
    let mut request = async_graphql::Request::new(payload.query);
    if let Some(variables) = payload.variables {
        request = request.variables(async_graphql::Variables::from_json(variables));
    }
    if let Some(name) = payload.operation_name {
        request = request.operation_name(name);
    }
    // Queries and mutations also ride this transport; give them an
    // execution context.
    request = request.data(Arc::new(ExecutionContext::new(pool)));

    let mut stream = schema.execute_stream(request);
    while let Some(response) = stream.next().await {
        if response.errors.is_empty() {
            let payload = serde_json::to_value(&response).unwrap_or(JsonValue::Null);
            let message = ServerMessage::Next {
                id: id.clone(),
                payload,
            };
            if send(&sink, &message).await.is_err() {
                return;
            }
        } else {
            let payload = serde_json::to_value(&response.errors).unwrap_or(JsonValue::Null);
            let _ = send(
                &sink,
                &ServerMessage::Error {
                    id: id.clone(),
                    payload,
                },
            )
            .await;
            return;
        }
    }
    let _ = send(&sink, &ServerMessage::Complete { id }).await;
}

/// Serialize and send one message. Writes to a closed session surface as
/// errors the callers treat as session teardown.
async fn send(sink: &SharedSink, message: &ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).expect("server message serializes");
    sink.lock().await.send(Message::Text(text)).await
}
