mod compression;
mod encoding;
mod handler;

pub use encoding::WireEncoding;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use halyard_core::AppState;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct GatewayParams {
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    compress: Option<String>,
}

pub fn gateway_router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<GatewayParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let encoding = WireEncoding::from_query(params.encoding.as_deref());
    let compress = params.compress.as_deref() == Some("zlib-stream");
    ws.on_upgrade(move |socket| handler::handle_connection(socket, state, encoding, compress))
}
