//! Ingress metrics with a Prometheus-compatible /metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Server-wide counters
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    requests_total: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    sse_streams_total: AtomicU64,
    ws_sessions_total: AtomicU64,
    tcp_sessions_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed HTTP relay by response status class
    pub fn record_response(&self, status: u16) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        let counter = match status / 100 {
            2 => &self.inner.status_2xx,
            3 => &self.inner.status_3xx,
            4 => &self.inner.status_4xx,
            _ => &self.inner.status_5xx,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sse_stream_opened(&self) {
        self.inner.sse_streams_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ws_session_opened(&self) {
        self.inner.ws_sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tcp_session_opened(&self) {
        self.inner.tcp_sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Render Prometheus-format metrics text
    pub fn render(&self, active_tunnels: usize) -> String {
        format!(
            r#"# HELP burrow_requests_total HTTP requests relayed through tunnels
# TYPE burrow_requests_total counter
burrow_requests_total {}

# HELP burrow_requests_by_status Relayed requests by status class
# TYPE burrow_requests_by_status counter
burrow_requests_by_status{{status="2xx"}} {}
burrow_requests_by_status{{status="3xx"}} {}
burrow_requests_by_status{{status="4xx"}} {}
burrow_requests_by_status{{status="5xx"}} {}

# HELP burrow_active_tunnels Registered tunnel connections
# TYPE burrow_active_tunnels gauge
burrow_active_tunnels {}

# HELP burrow_streams_total Long-lived streams opened, by adapter
# TYPE burrow_streams_total counter
burrow_streams_total{{kind="sse"}} {}
burrow_streams_total{{kind="websocket"}} {}
burrow_streams_total{{kind="tcp"}} {}
"#,
            self.inner.requests_total.load(Ordering::Relaxed),
            self.inner.status_2xx.load(Ordering::Relaxed),
            self.inner.status_3xx.load(Ordering::Relaxed),
            self.inner.status_4xx.load(Ordering::Relaxed),
            self.inner.status_5xx.load(Ordering::Relaxed),
            active_tunnels,
            self.inner.sse_streams_total.load(Ordering::Relaxed),
            self.inner.ws_sessions_total.load(Ordering::Relaxed),
            self.inner.tcp_sessions_total.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        let metrics = Metrics::new();
        metrics.record_response(200);
        metrics.record_response(204);
        metrics.record_response(404);
        metrics.record_response(502);

        let text = metrics.render(3);
        assert!(text.contains("burrow_requests_total 4"));
        assert!(text.contains(r#"burrow_requests_by_status{status="2xx"} 2"#));
        assert!(text.contains(r#"burrow_requests_by_status{status="4xx"} 1"#));
        assert!(text.contains(r#"burrow_requests_by_status{status="5xx"} 1"#));
        assert!(text.contains("burrow_active_tunnels 3"));
    }

    #[test]
    fn test_stream_counters() {
        let metrics = Metrics::new();
        metrics.sse_stream_opened();
        metrics.ws_session_opened();
        metrics.tcp_session_opened();
        metrics.tcp_session_opened();

        let text = metrics.render(0);
        assert!(text.contains(r#"burrow_streams_total{kind="sse"} 1"#));
        assert!(text.contains(r#"burrow_streams_total{kind="tcp"} 2"#));
    }
}
