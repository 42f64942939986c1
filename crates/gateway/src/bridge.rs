//! WebSocket bridge.
//!
//! Per connection: authenticate (for protected routes), dial the backend
//! with the client's offered subprotocols, echo the backend's selected
//! subprotocol on the upgrade response, then pump messages in both
//! directions until either side ends. Message type (text/binary/ping/pong)
//! is preserved.
//!
//! The bridge adds no buffering of its own: a slow reader blocks the pump,
//! and that backpressure propagating to the producer is the contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::http::Request;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::proxy::build_upstream_url;
use crate::route::Route;
use crate::server::AppState;

/// Interval between heartbeat pings to the client.
const HEARTBEAT: Duration = Duration::from_secs(25);

/// Deadline for the best-effort close frames during teardown.
const CLOSE_DEADLINE: Duration = Duration::from_secs(2);

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bridge one client upgrade to the route's backend.
///
/// Authentication has already happened in the route handler; this function
/// starts at the backend dial.
pub async fn handle(
    state: Arc<AppState>,
    route: Arc<Route>,
    params: HashMap<String, String>,
    req: Request<Body>,
) -> Result<Response, GatewayError> {
    let (mut parts, _body) = req.into_parts();
    let upgrade = WebSocketUpgrade::from_request_parts(&mut parts, &())
        .await
        .map_err(|e| GatewayError::Unauthorized(format!("not a websocket upgrade: {e}")))?;

    let url = websocket_url(&build_upstream_url(
        &route,
        parts.uri.path(),
        &params,
        parts.uri.query(),
    )?);

    // Dial the backend before completing the client upgrade so a dial
    // failure can still be answered with an HTTP error.
    let mut backend_req = url
        .as_str()
        .into_client_request()
        .map_err(|e| GatewayError::Internal(format!("bad backend url {url}: {e}")))?;
    if let Some(offered) = parts.headers.get(SEC_WEBSOCKET_PROTOCOL) {
        backend_req
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, offered.clone());
    }

    let (backend, backend_resp) = connect_async(backend_req).await.map_err(|e| {
        state.metrics.increment_ws_dial_failures();
        warn!(url = %url, error = %e, "backend websocket dial failed");
        GatewayError::Upstream(e.to_string())
    })?;

    let selected = backend_resp
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);

    let upgrade = match &selected {
        // The backend picked one of the client's offered subprotocols;
        // echo exactly that one on the client upgrade.
        Some(protocol) => upgrade.protocols([protocol.clone()]),
        None => upgrade,
    };

    state.metrics.increment_ws_sessions();
    let route_path = route.path.clone();
    Ok(upgrade.on_upgrade(move |client| async move {
        pump(client, backend, &route_path).await;
    }))
}

/// Normalize an upstream URL to a websocket scheme.
fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_owned()
    }
}

/// Copy messages in both directions until either side ends, then close both.
async fn pump(client: WebSocket, backend: BackendSocket, route_path: &str) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let mut heartbeat =
        tokio::time::interval_at(tokio::time::Instant::now() + HEARTBEAT, HEARTBEAT);

    loop {
        tokio::select! {
            msg = client_rx.next() => match msg {
                Some(Ok(ClientMessage::Close(frame))) => {
                    debug!(route = route_path, "client sent close");
                    let _ = tokio::time::timeout(
                        CLOSE_DEADLINE,
                        backend_tx.send(BackendMessage::Close(frame.map(close_to_backend))),
                    )
                    .await;
                    break;
                }
                Some(Ok(msg)) => {
                    if backend_tx.send(client_to_backend(msg)).await.is_err() {
                        debug!(route = route_path, "backend write failed");
                        break;
                    }
                }
                Some(Err(e)) => {
                    log_pump_end(route_path, "client read", &e.to_string());
                    break;
                }
                None => {
                    debug!(route = route_path, "client eof");
                    break;
                }
            },
            msg = backend_rx.next() => match msg {
                Some(Ok(BackendMessage::Close(frame))) => {
                    debug!(route = route_path, "backend sent close");
                    let _ = tokio::time::timeout(
                        CLOSE_DEADLINE,
                        client_tx.send(ClientMessage::Close(frame.map(close_to_client))),
                    )
                    .await;
                    break;
                }
                Some(Ok(msg)) => {
                    let Some(converted) = backend_to_client(msg) else {
                        continue;
                    };
                    if client_tx.send(converted).await.is_err() {
                        debug!(route = route_path, "client write failed");
                        break;
                    }
                }
                Some(Err(e)) => {
                    log_pump_end(route_path, "backend read", &e.to_string());
                    break;
                }
                None => {
                    debug!(route = route_path, "backend eof");
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if client_tx.send(ClientMessage::Ping(Vec::new().into())).await.is_err() {
                    debug!(route = route_path, "heartbeat failed, peer gone");
                    break;
                }
            }
        }
    }

    // Best-effort graceful close on both sockets, normal closure.
    let _ = tokio::time::timeout(
        CLOSE_DEADLINE,
        client_tx.send(ClientMessage::Close(Some(CloseFrame {
            code: axum::extract::ws::close_code::NORMAL,
            reason: "".into(),
        }))),
    )
    .await;
    let _ = tokio::time::timeout(
        CLOSE_DEADLINE,
        backend_tx.send(BackendMessage::Close(Some(
            tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            },
        ))),
    )
    .await;
}

/// Whether an error message describes an ordinary connection end rather
/// than a fault: normal close, going away, missing close handshake, or
/// writes against an already-closed socket.
fn is_benign_termination(error: &str) -> bool {
    let error = error.to_lowercase();
    [
        "connection closed normally",
        "connection reset without closing handshake",
        "trying to work with closed connection",
        "connection closed",
        "going away",
        "broken pipe",
    ]
    .iter()
    .any(|b| error.contains(b))
}

/// Benign terminations log at debug; anything else warns.
fn log_pump_end(route_path: &str, direction: &str, error: &str) {
    if is_benign_termination(error) {
        debug!(route = route_path, direction, error, "websocket ended");
    } else {
        warn!(route = route_path, direction, error, "websocket pump error");
    }
}

fn client_to_backend(msg: ClientMessage) -> BackendMessage {
    match msg {
        ClientMessage::Text(t) => BackendMessage::Text(t.to_string().into()),
        ClientMessage::Binary(b) => BackendMessage::Binary(b.to_vec().into()),
        ClientMessage::Ping(d) => BackendMessage::Ping(d.to_vec().into()),
        ClientMessage::Pong(d) => BackendMessage::Pong(d.to_vec().into()),
        // Close frames are handled before conversion.
        ClientMessage::Close(_) => BackendMessage::Close(None),
    }
}

/// Convert a backend message for the client. Raw frames have no client
/// equivalent and are skipped.
fn backend_to_client(msg: BackendMessage) -> Option<ClientMessage> {
    match msg {
        BackendMessage::Text(t) => Some(ClientMessage::Text(t.to_string().into())),
        BackendMessage::Binary(b) => Some(ClientMessage::Binary(b.to_vec().into())),
        BackendMessage::Ping(d) => Some(ClientMessage::Ping(d.to_vec().into())),
        BackendMessage::Pong(d) => Some(ClientMessage::Pong(d.to_vec().into())),
        BackendMessage::Close(_) => Some(ClientMessage::Close(None)),
        BackendMessage::Frame(_) => None,
    }
}

fn close_to_backend(
    frame: CloseFrame,
) -> tokio_tungstenite::tungstenite::protocol::CloseFrame {
    tokio_tungstenite::tungstenite::protocol::CloseFrame {
        code: CloseCode::from(frame.code),
        reason: frame.reason.to_string().into(),
    }
}

fn close_to_client(
    frame: tokio_tungstenite::tungstenite::protocol::CloseFrame,
) -> CloseFrame {
    CloseFrame {
        code: frame.code.into(),
        reason: frame.reason.to_string().into(),
    }
}
