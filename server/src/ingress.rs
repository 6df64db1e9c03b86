//! Public ingress: control-channel registration, routing policy, and the
//! one-shot HTTP relay. SSE, WebSocket, and TCP relays live in their own
//! modules and share the stream plumbing set up here.

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::header::{HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use burrow_shared::protocol::{
    generate_stream_id, generate_tunnel_id, Frame, FrameType, Headers, MAX_MESSAGE_SIZE,
};
use burrow_shared::slots::RESPONSE_SLOT_CAPACITY;
use burrow_shared::{Error, Result};

use crate::manager::Manager;
use crate::metrics::Metrics;
use crate::tunnel::Tunnel;
use crate::{sse, ws};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Response headers recomputed by this hop rather than copied from the frame
const HOP_BY_HOP: [&str; 4] = ["transfer-encoding", "connection", "keep-alive", "content-length"];

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub metrics: Metrics,
    pub private_use: bool,
}

pub async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({"status": "ok"}))
}

pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render(state.manager.count().await)
}

/// GET /ws: upgrade the control endpoint and wait for registration
pub async fn control_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_control(socket, state))
}

async fn handle_control(mut socket: WebSocket, state: AppState) {
    debug!("new control connection");

    // nothing is wired up until the client registers
    let register = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                Ok(frame) if frame.frame_type == FrameType::Register => break frame,
                Ok(frame) if frame.frame_type == FrameType::Pong => {
                    // keepalive for an earlier incarnation of this tunnel
                    if let Some(id) = frame.tunnel_id.as_deref() {
                        if let Some(tunnel) = state.manager.get(id).await {
                            tunnel.handle_inbound(frame).await;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("malformed frame before registration: {}", e),
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("control channel error before registration: {}", e);
                return;
            }
        }
    };

    let id = match register.tunnel_id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => generate_tunnel_id(),
    };

    let tunnel = Tunnel::spawn(id.clone(), socket);
    state.manager.register(tunnel.clone()).await;

    // ack echoes the assigned id so the client can adopt a generated one
    if tunnel.send(Frame::register_ack(&id)).await.is_err() {
        state.manager.remove(&id).await;
    }
}

/// ANY /tunnel/{tunnel_id}/{*path}: explicit multi-tunnel ingress
pub async fn prefixed_proxy_handler(
    State(state): State<AppState>,
    Path((tunnel_id, path)): Path<(String, String)>,
    req: Request,
) -> Response {
    proxy(state, tunnel_id, format!("/{path}"), req).await
}

/// Fallback ingress: route by the configured selection policy
pub async fn default_proxy_handler(State(state): State<AppState>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    let path = if path.is_empty() { "/".to_string() } else { path };

    match select_tunnel(&state.manager, state.private_use).await {
        Ok(tunnel_id) => proxy(state, tunnel_id, path, req).await,
        Err((status, e)) => json_error(status, &e.to_string()),
    }
}

/// Private use routes to any tunnel; multi-tunnel mode only routes
/// implicitly while exactly one tunnel is connected. Failures carry the
/// status the ingress answers with.
pub async fn select_tunnel(
    manager: &Manager,
    private_use: bool,
) -> std::result::Result<String, (StatusCode, Error)> {
    if private_use {
        return manager.select_any().await.ok_or((
            StatusCode::SERVICE_UNAVAILABLE,
            Error::Routing("no tunnel connected".into()),
        ));
    }
    if let Some(id) = manager.select_single().await {
        return Ok(id);
    }
    if manager.count().await == 0 {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Error::Routing("no tunnel connected".into()),
        ))
    } else {
        Err((
            StatusCode::BAD_REQUEST,
            Error::Routing(
                "use the /tunnel/{tunnel_id}/ prefix or keep a single tunnel connected".into(),
            ),
        ))
    }
}

/// Relay one external request over the chosen tunnel
async fn proxy(state: AppState, tunnel_id: String, path: String, req: Request) -> Response {
    let Some(tunnel) = state.manager.get(&tunnel_id).await else {
        return json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "tunnel not found or not connected",
        );
    };

    let (mut parts, body) = req.into_parts();
    let full_path = full_path(&path, parts.uri.query());
    let method = parts.method.to_string();
    let headers = header_map(&parts.headers);
    let stream_id = generate_stream_id();

    let body = match axum::body::to_bytes(body, MAX_MESSAGE_SIZE).await {
        Ok(bytes) if !bytes.is_empty() => Some(bytes.to_vec()),
        Ok(_) => None,
        Err(e) => {
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("reading request body: {e}"),
            )
        }
    };

    if is_sse_request(&parts.headers) {
        state.metrics.sse_stream_opened();
        let frame = Frame::request(&stream_id, &method, &full_path, headers, body);
        return sse::handle_sse_proxy(tunnel, frame).await;
    }

    if is_websocket_request(&parts.headers) {
        state.metrics.ws_session_opened();
        let frame = Frame::ws_upgrade(&stream_id, &method, &full_path, headers);
        return ws::handle_ws_proxy(tunnel, frame, &mut parts).await;
    }

    let frame = Frame::request(&stream_id, &method, &full_path, headers, body);
    let response = forward_http(&tunnel, frame).await;
    state.metrics.record_response(response.status().as_u16());
    response
}

/// One-shot request/response relay with the 30s deadline
async fn forward_http(tunnel: &Arc<Tunnel>, frame: Frame) -> Response {
    match relay_request(tunnel, frame).await {
        Ok(reply) => build_response(reply),
        // upstream failures carry the private side's error text verbatim
        Err(Error::Upstream(text)) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &text),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// Send the request frame and wait for its correlated reply
async fn relay_request(tunnel: &Arc<Tunnel>, frame: Frame) -> Result<Frame> {
    let stream_id = frame.id.clone().unwrap_or_default();

    let mut slot = tunnel.register_slot(&stream_id, RESPONSE_SLOT_CAPACITY).await?;

    if let Err(e) = tunnel.send(frame).await {
        tunnel.unregister_slot(&stream_id).await;
        return Err(e);
    }

    let reply = tokio::time::timeout(REQUEST_TIMEOUT, slot.recv()).await;
    tunnel.unregister_slot(&stream_id).await;

    match reply {
        Ok(Some(reply)) => match reply.frame_type {
            FrameType::Response => Ok(reply),
            FrameType::Error => Err(Error::Upstream(
                reply.error.unwrap_or_else(|| "upstream error".into()),
            )),
            other => Err(Error::Protocol(format!("unexpected {other:?} frame from tunnel"))),
        },
        Ok(None) => Err(Error::Transport("tunnel closed".into())),
        Err(_) => Err(Error::Timeout("request")),
    }
}

/// Copy a response frame back to the external caller
pub(crate) fn build_response(frame: Frame) -> Response {
    let status =
        StatusCode::from_u16(frame.status.unwrap_or(200)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);

    if let (Some(map), Some(frame_headers)) = (builder.headers_mut(), frame.headers.as_ref()) {
        for (name, values) in frame_headers {
            if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    map.append(name.clone(), value);
                }
            }
        }
    }

    builder
        .body(Body::from(frame.body.unwrap_or_default()))
        .unwrap_or_else(|_| {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "building response failed")
        })
}

pub(crate) fn json_error(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(serde_json::json!({"error": message}))).into_response()
}

/// Query strings ride inside the framed path; the client never re-parses them
pub(crate) fn full_path(path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("{path}?{query}"),
        _ => path.to_string(),
    }
}

/// Multi-value header map as carried inside frames
pub(crate) fn header_map(headers: &HeaderMap) -> Headers {
    let mut map = Headers::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

/// SSE requests advertise text/event-stream in any Accept value
pub(crate) fn is_sse_request(headers: &HeaderMap) -> bool {
    headers
        .get_all(hyper::header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/event-stream"))
}

/// WebSocket requests carry Connection: upgrade and Upgrade: websocket
pub(crate) fn is_websocket_request(headers: &HeaderMap) -> bool {
    let wants_upgrade = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case("upgrade")));

    let to_websocket = headers
        .get_all(hyper::header::UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.eq_ignore_ascii_case("websocket"));

    wants_upgrade && to_websocket
}

/// Extract the upgrade handle once a request is known to be a WebSocket one
pub(crate) async fn extract_upgrade(parts: &mut Parts) -> Option<WebSocketUpgrade> {
    use axum::extract::FromRequestParts;
    WebSocketUpgrade::from_request_parts(parts, &()).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_path_preserves_query() {
        assert_eq!(full_path("/q", Some("x=1&y=two")), "/q?x=1&y=two");
        assert_eq!(full_path("/q", None), "/q");
        assert_eq!(full_path("/", Some("")), "/");
    }

    #[test]
    fn test_sse_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_sse_request(&headers));

        headers.insert("accept", "text/html, text/event-stream".parse().unwrap());
        assert!(is_sse_request(&headers));
    }

    #[test]
    fn test_websocket_detection() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive, Upgrade".parse().unwrap());
        assert!(!is_websocket_request(&headers));

        headers.insert("upgrade", "WebSocket".parse().unwrap());
        assert!(is_websocket_request(&headers));

        headers.insert("connection", "close".parse().unwrap());
        assert!(!is_websocket_request(&headers));
    }

    #[tokio::test]
    async fn test_selection_policy() {
        let manager = Manager::new();

        let (status, e) = select_tunnel(&manager, true).await.unwrap_err();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(matches!(e, Error::Routing(_)));
        let (status, _) = select_tunnel(&manager, false).await.unwrap_err();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (a, _oa) = Tunnel::new("tunnel-a".into());
        manager.register(a).await;
        assert_eq!(select_tunnel(&manager, false).await.unwrap(), "tunnel-a");

        let (b, _ob) = Tunnel::new("tunnel-b".into());
        manager.register(b).await;
        let (status, e) = select_tunnel(&manager, false).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(matches!(e, Error::Routing(_)));
        assert!(select_tunnel(&manager, true).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_answers_500() {
        let (tunnel, _outbox) = Tunnel::new("tunnel-test".into());
        let frame = Frame::request("req-1", "GET", "/slow", Headers::new(), None);

        // no reply ever arrives; the 30s deadline elapses under paused time
        let response = forward_http(&tunnel, frame).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("request timed out"));

        // the slot is released on the timeout path
        assert!(tunnel.register_slot("req-1", 1).await.is_ok());
    }

    #[test]
    fn test_build_response_filters_hop_by_hop() {
        let mut headers = Headers::new();
        headers.insert("x-test".into(), vec!["1".into()]);
        headers.insert("Transfer-Encoding".into(), vec!["chunked".into()]);
        let frame = Frame::response("req-1", 201, headers, Some(b"ok".to_vec()));

        let response = build_response(frame);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-test").unwrap(), "1");
        assert!(response.headers().get("transfer-encoding").is_none());
    }
}
