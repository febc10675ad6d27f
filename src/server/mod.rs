// # HTTP & WebSocket Server
//
// One POST endpoint for GraphQL over HTTP, one WebSocket path speaking the
// `graphql-transport-ws` subprotocol, and a health probe.

pub mod http;
pub mod ws;

pub use http::{build_router, AppState};
