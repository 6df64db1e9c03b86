//! Local HTTP forwarding for tunneled requests.

use reqwest::header::{HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use burrow_shared::protocol::{Frame, Headers};
use burrow_shared::{Error, Result};

use crate::sse;
use crate::tunnel::TunnelHandle;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request headers this hop recomputes instead of forwarding
const RECOMPUTED_HEADERS: [&str; 2] = ["host", "content-length"];

/// Forwards tunneled requests to the configured local targets
pub struct LocalProxy {
    /// One-shot requests, bounded by the relay deadline
    pub(crate) http: reqwest::Client,
    /// Long-lived SSE reads, no client timeout
    pub(crate) streaming: reqwest::Client,
    pub target_url: String,
    pub tcp_target: Option<String>,
}

impl LocalProxy {
    pub fn new(target_url: String, tcp_target: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Upstream(e.to_string()))?;
        let streaming = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Upstream(e.to_string()))?;
        Ok(Self {
            http,
            streaming,
            target_url,
            tcp_target,
        })
    }

    /// Service one request frame, replying with a response or error frame
    pub async fn handle_request(&self, handle: Arc<TunnelHandle>, frame: Frame) {
        if wants_event_stream(frame.headers.as_ref()) {
            sse::stream_events(self, handle, frame).await;
            return;
        }

        let stream_id = frame.id.clone().unwrap_or_default();
        let reply = match self.forward(&frame).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("request {} failed locally: {}", stream_id, e);
                Frame::error(&stream_id, e.to_string())
            }
        };
        if let Err(e) = handle.send(reply).await {
            warn!("failed to send response for {}: {}", stream_id, e);
        }
    }

    /// One HTTP round trip against the local target
    async fn forward(&self, frame: &Frame) -> Result<Frame> {
        let stream_id = frame.id.as_deref().unwrap_or_default();
        let url = join_target(&self.target_url, frame.path.as_deref().unwrap_or("/"));
        let method = reqwest::Method::from_bytes(
            frame.method.as_deref().unwrap_or("GET").as_bytes(),
        )
        .map_err(|e| Error::Upstream(format!("invalid method: {e}")))?;

        debug!("proxying {} {}", method, url);

        let mut request = self.http.request(method, &url);
        for (name, value) in forwardable_headers(frame.headers.as_ref()) {
            request = request.header(name, value);
        }
        if let Some(body) = &frame.body {
            request = request.body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("request failed: {e}")))?;

        let status = response.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Upstream(format!("reading response: {e}")))?;
        let body = (!body.is_empty()).then(|| body.to_vec());

        Ok(Frame::response(stream_id, status, headers, body))
    }
}

/// The framed path already carries the query string, so the target URL is
/// a plain concatenation
pub(crate) fn join_target(target_url: &str, path: &str) -> String {
    format!("{target_url}{path}")
}

/// Frame headers as (name, value) pairs reqwest will accept
pub(crate) fn forwardable_headers(headers: Option<&Headers>) -> Vec<(HeaderName, HeaderValue)> {
    let Some(headers) = headers else {
        return Vec::new();
    };
    let mut pairs = Vec::new();
    for (name, values) in headers {
        if RECOMPUTED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                pairs.push((name.clone(), value));
            }
        }
    }
    pairs
}

/// SSE requests advertise text/event-stream in any Accept value
pub(crate) fn wants_event_stream(headers: Option<&Headers>) -> bool {
    let Some(headers) = headers else {
        return false;
    };
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("accept"))
        .flat_map(|(_, values)| values)
        .any(|value| value.contains("text/event-stream"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_target_keeps_query_intact() {
        assert_eq!(
            join_target("http://localhost:3000", "/q?x=1&y=two"),
            "http://localhost:3000/q?x=1&y=two"
        );
    }

    #[test]
    fn test_event_stream_detection_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.insert("Accept".into(), vec!["text/event-stream".into()]);
        assert!(wants_event_stream(Some(&headers)));

        let mut headers = Headers::new();
        headers.insert("accept".into(), vec!["text/html".into(), "text/event-stream; q=0.9".into()]);
        assert!(wants_event_stream(Some(&headers)));

        let mut headers = Headers::new();
        headers.insert("accept".into(), vec!["application/json".into()]);
        assert!(!wants_event_stream(Some(&headers)));
        assert!(!wants_event_stream(None));
    }

    #[test]
    fn test_forwardable_headers_skips_recomputed() {
        let mut headers = Headers::new();
        headers.insert("Host".into(), vec!["public.example.com".into()]);
        headers.insert("x-custom".into(), vec!["a".into(), "b".into()]);

        let pairs = forwardable_headers(Some(&headers));
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|(name, _)| name == "x-custom"));
    }
}
