//! WebSocket relay.
//!
//! The external upgrade is only accepted after the private client has
//! dialed its local target and confirmed with a 101 response frame;
//! afterwards the two legs are bridged frame by frame.

use axum::extract::ws::{Message, WebSocket};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use burrow_shared::protocol::{Frame, FrameType, WS_BINARY, WS_TEXT};
use burrow_shared::slots::STREAM_SLOT_CAPACITY;
use burrow_shared::Error;

use crate::ingress::{extract_upgrade, json_error};
use crate::tunnel::Tunnel;

const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay one WebSocket session across the tunnel
pub async fn handle_ws_proxy(tunnel: Arc<Tunnel>, frame: Frame, parts: &mut Parts) -> Response {
    let Some(upgrade) = extract_upgrade(parts).await else {
        return json_error(StatusCode::BAD_REQUEST, "invalid websocket upgrade request");
    };
    let stream_id = frame.id.clone().unwrap_or_default();

    let slot = match negotiate_upgrade(&tunnel, frame).await {
        Ok(slot) => slot,
        Err(rejection) => return rejection,
    };

    upgrade.on_upgrade(move |socket| bridge_external(socket, tunnel, stream_id, slot))
}

/// Send the upgrade frame and hold the external upgrade until the private
/// side confirms its local dial with a 101 response. Every failure path
/// releases the stream's slot and yields the rejection to answer with.
async fn negotiate_upgrade(
    tunnel: &Arc<Tunnel>,
    frame: Frame,
) -> Result<mpsc::Receiver<Frame>, Response> {
    let stream_id = frame.id.clone().unwrap_or_default();

    let mut slot = match tunnel.register_slot(&stream_id, STREAM_SLOT_CAPACITY).await {
        Ok(slot) => slot,
        Err(e) => return Err(json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())),
    };

    if let Err(e) = tunnel.send(frame).await {
        tunnel.unregister_slot(&stream_id).await;
        return Err(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("forwarding upgrade: {e}"),
        ));
    }

    let rejection = match tokio::time::timeout(UPGRADE_TIMEOUT, slot.recv()).await {
        Ok(Some(reply)) => match reply.frame_type {
            FrameType::Response if reply.status == Some(101) => return Ok(slot),
            FrameType::Response => {
                let status = StatusCode::from_u16(reply.status.unwrap_or(500))
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                json_error(status, "websocket upgrade failed")
            }
            FrameType::Error => json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                reply.error.as_deref().unwrap_or("websocket upgrade failed"),
            ),
            _ => json_error(StatusCode::INTERNAL_SERVER_ERROR, "unexpected frame from tunnel"),
        },
        Ok(None) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "tunnel closed"),
        Err(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &Error::Timeout("websocket upgrade").to_string(),
        ),
    };

    tunnel.unregister_slot(&stream_id).await;
    Err(rejection)
}

/// Pump messages between the external socket and the tunnel stream until
/// either leg closes; closing one side tears the other down.
async fn bridge_external(
    socket: WebSocket,
    tunnel: Arc<Tunnel>,
    stream_id: String,
    mut slot: mpsc::Receiver<Frame>,
) {
    let (mut sink, mut stream) = socket.split();
    debug!("websocket bridge started for stream {}", stream_id);

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let frame = Frame::ws_data(&stream_id, text.as_bytes().to_vec(), WS_TEXT);
                    if tunnel.send(frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    let frame = Frame::ws_data(&stream_id, data.to_vec(), WS_BINARY);
                    if tunnel.send(frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    // tell the private side so it can drop its local leg
                    let _ = tunnel
                        .send(Frame::error(&stream_id, "websocket closed by external client"))
                        .await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("websocket stream {}: external read error: {}", stream_id, e);
                    let _ = tunnel
                        .send(Frame::error(&stream_id, "websocket closed by external client"))
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
                            "websocket stream {}: closed by private side: {}",
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

    tunnel.unregister_slot(&stream_id).await;
    debug!("websocket bridge ended for stream {}", stream_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::WebSocketUpgrade;
    use axum::routing::get;
    use axum::Router;
    use burrow_shared::protocol::Headers;
    use std::future::IntoFuture;
    use tokio::sync::Mutex;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn upgrade_frame(id: &str) -> Frame {
        Frame::ws_upgrade(id, "GET", "/chat", Headers::new())
    }

    #[tokio::test]
    async fn test_negotiation_accepts_101() {
        let (tunnel, mut outbox) = Tunnel::new("tunnel-test".into());

        let pending = tokio::spawn({
            let tunnel = tunnel.clone();
            async move { negotiate_upgrade(&tunnel, upgrade_frame("req-ws")).await }
        });

        let sent = outbox.recv().await.unwrap();
        assert_eq!(sent.frame_type, FrameType::Websocket);
        assert_eq!(sent.path.as_deref(), Some("/chat"));
        tunnel
            .handle_inbound(Frame::response("req-ws", 101, Headers::new(), None))
            .await;

        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_non_101_status_propagates() {
        let (tunnel, mut outbox) = Tunnel::new("tunnel-test".into());

        let pending = tokio::spawn({
            let tunnel = tunnel.clone();
            async move { negotiate_upgrade(&tunnel, upgrade_frame("req-ws")).await }
        });

        outbox.recv().await.unwrap();
        tunnel
            .handle_inbound(Frame::response("req-ws", 502, Headers::new(), None))
            .await;

        let rejection = pending.await.unwrap().unwrap_err();
        assert_eq!(rejection.status(), StatusCode::BAD_GATEWAY);
        assert!(tunnel.register_slot("req-ws", 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_send_failure_unregisters_slot() {
        let (tunnel, outbox) = Tunnel::new("tunnel-test".into());
        drop(outbox); // transport already gone

        let rejection = negotiate_upgrade(&tunnel, upgrade_frame("req-ws"))
            .await
            .unwrap_err();
        assert_eq!(rejection.status(), StatusCode::INTERNAL_SERVER_ERROR);

        // slot must be free for a retry with the same stream id
        assert!(tunnel.register_slot("req-ws", 1).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_timeout_unregisters_slot() {
        let (tunnel, _outbox) = Tunnel::new("tunnel-test".into());

        // no confirmation ever arrives; the 10s deadline elapses
        let rejection = negotiate_upgrade(&tunnel, upgrade_frame("req-ws"))
            .await
            .unwrap_err();
        assert_eq!(rejection.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(rejection.into_body(), 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("websocket upgrade timed out"));
        assert!(tunnel.register_slot("req-ws", 1).await.is_ok());
    }

    /// Full relay through `bridge_external` over a real upgraded socket:
    /// external messages become websocket_data frames, tunnel frames come
    /// back out, and an external close is relayed as a stream error.
    #[tokio::test]
    async fn test_bridge_round_trip() {
        let (tunnel, mut outbox) = Tunnel::new("tunnel-test".into());
        let slot = tunnel
            .register_slot("req-ws", STREAM_SLOT_CAPACITY)
            .await
            .unwrap();

        let session = Arc::new(Mutex::new(Some((tunnel.clone(), slot))));
        let app = Router::new().route(
            "/chat",
            get({
                let session = session.clone();
                move |upgrade: WebSocketUpgrade| {
                    let session = session.clone();
                    async move {
                        let (tunnel, slot) = session.lock().await.take().unwrap();
                        upgrade.on_upgrade(move |socket| {
                            bridge_external(socket, tunnel, "req-ws".to_string(), slot)
                        })
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, app).into_future());

        let (mut external, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/chat"))
            .await
            .unwrap();

        external.send(WsMessage::Text("ping".into())).await.unwrap();
        let frame = outbox.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::WebsocketData);
        assert_eq!(frame.ws_data.as_deref(), Some(&b"ping"[..]));
        assert_eq!(frame.ws_message_type, Some(WS_TEXT));

        tunnel
            .handle_inbound(Frame::ws_data("req-ws", b"pong".to_vec(), WS_TEXT))
            .await;
        match external.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => assert_eq!(text.as_str(), "pong"),
            other => panic!("unexpected message: {other:?}"),
        }

        external.close(None).await.unwrap();
        let frame = outbox.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Error);
    }
}
