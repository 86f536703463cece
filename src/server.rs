//! HTTP surface: one listener hosting the four relay endpoints (info
//! document or WebSocket upgrade per path), static assets, and the Blossom
//! blob endpoints mounted on the outbox relay.

use std::{future::Future, net::SocketAddr, path::Path, sync::Arc};

use anyhow::Result;
use axum::{
    body::Body,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{any, get, put},
    Json, Router,
};
use serde_json::json;
use tracing::info;

use crate::{blossom::BlobStore, relay::Relay, ws};

/// Everything the handlers need, shared across connections.
pub struct AppState {
    pub private: Arc<Relay>,
    pub chat: Arc<Relay>,
    pub inbox: Arc<Relay>,
    pub outbox: Arc<Relay>,
    pub blossom: Arc<BlobStore>,
}

/// Shared info-page template; placeholders are substituted per relay.
const INDEX_TEMPLATE: &str = include_str!("../templates/index.html");

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", any(outbox_endpoint))
        .route("/private", any(private_endpoint))
        .route("/chat", any(chat_endpoint))
        .route("/inbox", any(inbox_endpoint))
        .route("/upload", put(crate::blossom::upload))
        .route("/static/{*path}", get(static_asset))
        .route(
            "/{sha256}",
            get(crate::blossom::get_blob).delete(crate::blossom::delete_blob),
        )
        // Blobs are larger than the default 2 MiB body cap.
        .layer(axum::extract::DefaultBodyLimit::max(100 * 1024 * 1024))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening at {addr}");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

async fn private_endpoint(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    serve_relay(Arc::clone(&state.private), ws, headers, addr, false).await
}

async fn chat_endpoint(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    serve_relay(Arc::clone(&state.chat), ws, headers, addr, false).await
}

async fn inbox_endpoint(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    serve_relay(Arc::clone(&state.inbox), ws, headers, addr, false).await
}

async fn outbox_endpoint(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    serve_relay(Arc::clone(&state.outbox), ws, headers, addr, true).await
}

/// Upgrade to a Nostr WebSocket, or serve the relay's info document: NIP-11
/// JSON for `Accept: application/nostr+json`, the HTML page otherwise.
async fn serve_relay(
    relay: Arc<Relay>,
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    addr: SocketAddr,
    root: bool,
) -> Response {
    if let Some(ws) = ws {
        if let Some(reason) = relay.check_connection(addr.ip()) {
            return (StatusCode::TOO_MANY_REQUESTS, reason).into_response();
        }
        return ws.on_upgrade(move |socket| ws::process(socket, relay, addr.ip()));
    }

    let wants_nostr_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/nostr+json"))
        .unwrap_or(false);

    let mut response = if wants_nostr_json {
        Json(json!({
            "name": relay.info.name,
            "pubkey": relay.info.pubkey,
            "description": relay.info.description,
            "icon": relay.info.icon,
            "software": relay.info.software,
            "version": relay.info.version,
            "supported_nips": [1, 11, 42],
        }))
        .into_response()
    } else {
        Html(render_info_page(&relay)).into_response()
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".parse().unwrap());
    if root {
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, "GET".parse().unwrap());
    }
    response
}

/// Render the shared HTML template for one relay.
fn render_info_page(relay: &Relay) -> String {
    INDEX_TEMPLATE
        .replace("{{RelayName}}", &relay.info.name)
        .replace("{{RelayPubkey}}", &relay.info.pubkey)
        .replace("{{RelayDescription}}", &relay.info.description)
        .replace("{{RelayURL}}", &relay.service_url)
}

/// Serve files from `./static`.
async fn static_asset(axum::extract::Path(path): axum::extract::Path<String>) -> Response {
    if path.contains("..") {
        return StatusCode::NOT_FOUND.into_response();
    }
    let full = Path::new("static").join(&path);
    match tokio::fs::read(&full).await {
        Ok(bytes) => Response::builder()
            .header(header::CONTENT_TYPE, content_type_for(&path))
            .body(Body::from(bytes))
            .unwrap(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Content type by file extension, defaulting to octet-stream.
fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or_default() {
        "html" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_cover_common_assets() {
        assert_eq!(content_type_for("haven.css"), "text/css");
        assert_eq!(content_type_for("logo.png"), "image/png");
        assert_eq!(content_type_for("mystery.bin"), "application/octet-stream");
    }
}
