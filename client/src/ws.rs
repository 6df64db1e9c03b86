//! WebSocket bridging between the tunnel and the local target.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};

use burrow_shared::protocol::{Frame, FrameType, Headers, WS_BINARY, WS_TEXT};
use burrow_shared::slots::STREAM_SLOT_CAPACITY;

use crate::tunnel::TunnelHandle;

/// Hop-by-hop and handshake headers regenerated for the local dial
const STRIPPED_HEADERS: [&str; 7] = [
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
];

/// Service one websocket upgrade frame: dial the local target, confirm
/// with a 101 response frame, then bridge until either side closes.
pub async fn handle_upgrade(handle: Arc<TunnelHandle>, target_url: String, frame: Frame) {
    let stream_id = frame.id.clone().unwrap_or_default();
    let url = rewrite_ws_url(&target_url, frame.path.as_deref().unwrap_or("/"));

    let request = match build_upgrade_request(&url, frame.headers.as_ref()) {
        Ok(request) => request,
        Err(e) => {
            let _ = handle.send(Frame::error(&stream_id, e)).await;
            return;
        }
    };

    debug!("dialing local websocket {} for stream {}", url, stream_id);
    let local = match connect_async(request).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            let _ = handle
                .send(Frame::error(&stream_id, format!("websocket dial failed: {e}")))
                .await;
            return;
        }
    };

    // slot first so no data frame can slip past the bridge
    let slot = match handle.register_slot(&stream_id, STREAM_SLOT_CAPACITY).await {
        Ok(slot) => slot,
        Err(e) => {
            warn!("websocket stream {}: {}", stream_id, e);
            return;
        }
    };

    let mut headers = Headers::new();
    headers.insert("Upgrade".into(), vec!["websocket".into()]);
    headers.insert("Connection".into(), vec!["Upgrade".into()]);
    if handle
        .send(Frame::response(&stream_id, 101, headers, None))
        .await
        .is_err()
    {
        handle.unregister_slot(&stream_id).await;
        return;
    }

    bridge(local, &handle, &stream_id, slot).await;
    handle.unregister_slot(&stream_id).await;
}

type LocalSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Pump messages between the local socket and the tunnel stream
async fn bridge(
    local: LocalSocket,
    handle: &Arc<TunnelHandle>,
    stream_id: &str,
    mut slot: mpsc::Receiver<Frame>,
) {
    let (mut sink, mut stream) = local.split();
    debug!("websocket bridge started for stream {}", stream_id);

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let frame = Frame::ws_data(stream_id, text.as_bytes().to_vec(), WS_TEXT);
                    if handle.send(frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    let frame = Frame::ws_data(stream_id, data.to_vec(), WS_BINARY);
                    if handle.send(frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    // tell the server so it can drop the external leg
                    let _ = handle
                        .send(Frame::error(stream_id, "websocket closed by local service"))
                        .await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = handle
                        .send(Frame::error(stream_id, format!("websocket read failed: {e}")))
                        .await;
                    break;
                }
            },
            frame = slot.recv() => match frame {
                Some(frame) => match frame.frame_type {
                    FrameType::WebsocketData => {
                        let data = frame.ws_data.unwrap_or_default();
                        let msg = if frame.ws_message_type == Some(WS_BINARY) {
                            Message::Binary(data.into())
                        } else {
                            Message::Text(String::from_utf8_lossy(&data).into_owned().into())
                        };
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    FrameType::Error => {
                        debug!(
                            "websocket stream {}: closed by server side: {}",
                            stream_id,
                            frame.error.as_deref().unwrap_or("")
                        );
                        break;
                    }
                    _ => {}
                },
                None => break,
            },
        }
    }

    debug!("websocket bridge ended for stream {}", stream_id);
}

/// Point the tunneled path at the local target over the ws scheme
pub(crate) fn rewrite_ws_url(target_url: &str, path: &str) -> String {
    let base = target_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{base}{path}")
}

fn build_upgrade_request(
    url: &str,
    headers: Option<&Headers>,
) -> Result<http::Request<()>, String> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e| format!("invalid websocket url {url}: {e}"))?;
    let host = uri.host().unwrap_or("localhost");
    let host = match uri.port_u16() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut builder = http::Request::builder()
        .uri(url)
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Key", generate_key())
        .header("Sec-WebSocket-Version", "13");

    for (name, value) in forwarded_headers(headers) {
        builder = builder.header(name, value);
    }

    builder
        .body(())
        .map_err(|e| format!("building upgrade request: {e}"))
}

/// External request headers minus the handshake machinery
pub(crate) fn forwarded_headers(headers: Option<&Headers>) -> Vec<(String, String)> {
    let Some(headers) = headers else {
        return Vec::new();
    };
    headers
        .iter()
        .filter(|(name, _)| !STRIPPED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)))
        .flat_map(|(name, values)| values.iter().map(move |v| (name.clone(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_ws_url() {
        assert_eq!(
            rewrite_ws_url("http://localhost:3000", "/socket?room=1"),
            "ws://localhost:3000/socket?room=1"
        );
        assert_eq!(
            rewrite_ws_url("https://internal.example.com", "/ws"),
            "wss://internal.example.com/ws"
        );
    }

    #[test]
    fn test_handshake_headers_are_stripped() {
        let mut headers = Headers::new();
        headers.insert("Sec-Websocket-Key".into(), vec!["abc".into()]);
        headers.insert("Connection".into(), vec!["Upgrade".into()]);
        headers.insert("Upgrade".into(), vec!["websocket".into()]);
        headers.insert("Host".into(), vec!["public.example.com".into()]);
        headers.insert("Authorization".into(), vec!["Bearer tok".into()]);
        headers.insert("X-Custom".into(), vec!["1".into()]);

        let forwarded = forwarded_headers(Some(&headers));
        let names: Vec<&str> = forwarded.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(forwarded.len(), 2);
        assert!(names.contains(&"Authorization"));
        assert!(names.contains(&"X-Custom"));
    }

    #[test]
    fn test_upgrade_request_carries_forwarded_headers() {
        let mut headers = Headers::new();
        headers.insert("Authorization".into(), vec!["Bearer tok".into()]);

        let request = build_upgrade_request("ws://localhost:9001/ws", Some(&headers)).unwrap();
        assert_eq!(request.headers().get("Host").unwrap(), "localhost:9001");
        assert_eq!(request.headers().get("Authorization").unwrap(), "Bearer tok");
        assert_eq!(request.headers().get("Sec-WebSocket-Version").unwrap(), "13");
    }
}
