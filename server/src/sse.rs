//! Server-sent-event relay.
//!
//! The request frame goes down the tunnel as usual, but instead of one
//! response the adapter streams every SSE frame for the stream ID into
//! the external response body until the client errors, the 5 minute cap
//! elapses, or the external reader goes away.

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::Response;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use burrow_shared::protocol::{Frame, FrameType};
use burrow_shared::slots::STREAM_SLOT_CAPACITY;

use crate::ingress::json_error;
use crate::tunnel::Tunnel;

const SSE_MAX_DURATION: Duration = Duration::from_secs(5 * 60);

/// Relay one SSE request and stream its lines back to the caller
pub async fn handle_sse_proxy(tunnel: Arc<Tunnel>, frame: Frame) -> Response {
    let stream_id = frame.id.clone().unwrap_or_default();

    let slot = match tunnel.register_slot(&stream_id, STREAM_SLOT_CAPACITY).await {
        Ok(slot) => slot,
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    if let Err(e) = tunnel.send(frame).await {
        tunnel.unregister_slot(&stream_id).await;
        return json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("forwarding request: {e}"),
        );
    }

    let (line_tx, line_rx) = mpsc::channel::<Result<Bytes, Infallible>>(STREAM_SLOT_CAPACITY);
    tokio::spawn(forward_lines(tunnel, stream_id, slot, line_tx));

    Response::builder()
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(ReceiverStream::new(line_rx)))
        .unwrap_or_else(|_| json_error(StatusCode::INTERNAL_SERVER_ERROR, "building response failed"))
}

/// Drain the stream's slot into the external response body
async fn forward_lines(
    tunnel: Arc<Tunnel>,
    stream_id: String,
    mut slot: mpsc::Receiver<Frame>,
    line_tx: mpsc::Sender<Result<Bytes, Infallible>>,
) {
    let deadline = tokio::time::Instant::now() + SSE_MAX_DURATION;

    loop {
        let frame = match tokio::time::timeout_at(deadline, slot.recv()).await {
            Ok(Some(frame)) => frame,
            // stream closed under us, or the wall-clock cap elapsed
            Ok(None) | Err(_) => break,
        };

        match frame.frame_type {
            FrameType::Sse => {
                let line = frame.sse_data.unwrap_or_default();
                // send fails when the external client disconnected
                if line_tx.send(Ok(Bytes::from(format!("{line}\n")))).await.is_err() {
                    debug!("sse stream {}: external reader gone", stream_id);
                    break;
                }
            }
            FrameType::Error => {
                let text = frame.error.unwrap_or_default();
                let _ = line_tx
                    .send(Ok(Bytes::from(format!("event: error\ndata: {text}\n\n"))))
                    .await;
                break;
            }
            _ => {}
        }
    }

    tunnel.unregister_slot(&stream_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_shared::protocol::Headers;

    #[tokio::test]
    async fn test_sse_lines_stream_in_order() {
        let (tunnel, mut outbox) = Tunnel::new("tunnel-test".into());
        let frame = Frame::request("req-sse", "GET", "/events", Headers::new(), None);

        let response = handle_sse_proxy(tunnel.clone(), frame).await;
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        // the request frame reached the transport
        let sent = outbox.recv().await.unwrap();
        assert_eq!(sent.frame_type, FrameType::Request);

        for line in ["a", "b", "c"] {
            tunnel.handle_inbound(Frame::sse_line("req-sse", line)).await;
        }
        tunnel
            .handle_inbound(Frame::error("req-sse", "upstream done"))
            .await;

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("a\nb\nc\n"));
        assert!(text.contains("event: error\ndata: upstream done"));
    }

    #[tokio::test]
    async fn test_send_failure_unregisters_slot() {
        let (tunnel, outbox) = Tunnel::new("tunnel-test".into());
        drop(outbox); // transport already gone

        let frame = Frame::request("req-sse", "GET", "/events", Headers::new(), None);
        let response = handle_sse_proxy(tunnel.clone(), frame).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        // slot must be free for a retry with the same stream id
        assert!(tunnel.register_slot("req-sse", 1).await.is_ok());
    }
}
