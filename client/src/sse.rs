//! Line-by-line SSE forwarding from the local target into the tunnel.

use futures_util::TryStreamExt;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use burrow_shared::protocol::Frame;

use crate::proxy::{forwardable_headers, join_target, LocalProxy};
use crate::tunnel::TunnelHandle;

/// Per-line read buffer; SSE lines can carry large JSON payloads
const LINE_BUFFER_SIZE: usize = 1024 * 1024;

/// Issue the local SSE request and forward each non-empty line as an
/// sse frame. Read failures become an error frame; EOF ends silently.
pub async fn stream_events(proxy: &LocalProxy, handle: Arc<TunnelHandle>, frame: Frame) {
    let stream_id = frame.id.clone().unwrap_or_default();
    let url = join_target(&proxy.target_url, frame.path.as_deref().unwrap_or("/"));
    let method = reqwest::Method::from_bytes(frame.method.as_deref().unwrap_or("GET").as_bytes())
        .unwrap_or(reqwest::Method::GET);

    debug!("opening sse stream {} -> {}", stream_id, url);

    let mut request = proxy.streaming.request(method, &url);
    for (name, value) in forwardable_headers(frame.headers.as_ref()) {
        request = request.header(name, value);
    }
    let request = request
        .header("Accept", "text/event-stream")
        .header("Cache-Control", "no-cache");

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = handle
                .send(Frame::error(&stream_id, format!("request failed: {e}")))
                .await;
            return;
        }
    };

    let body = response.bytes_stream().map_err(std::io::Error::other);
    let reader = BufReader::with_capacity(LINE_BUFFER_SIZE, StreamReader::new(body));
    let mut lines = reader.lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                if handle.send(Frame::sse_line(&stream_id, line)).await.is_err() {
                    warn!("sse stream {}: control connection gone", stream_id);
                    return;
                }
            }
            Ok(None) => {
                debug!("sse stream {} ended", stream_id);
                return;
            }
            Err(e) => {
                let _ = handle
                    .send(Frame::error(&stream_id, format!("reading event stream: {e}")))
                    .await;
                return;
            }
        }
    }
}
