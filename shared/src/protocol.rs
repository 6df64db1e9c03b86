//! Frame types carried on the burrow control channel.
//!
//! Every message after the control-channel upgrade is a single JSON
//! object sent as one text frame. Binary payloads (`body`, `ws_data`)
//! travel as base64 strings so the whole channel stays text.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Maximum buffered message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Chunk size for raw TCP reads on both sides of the tunnel
pub const TCP_CHUNK_SIZE: usize = 32 * 1024;

/// WebSocket frame kind carried in `ws_message_type`
pub const WS_TEXT: i32 = 1;
pub const WS_BINARY: i32 = 2;

/// Frame discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    /// Client registration (client -> server)
    Register,
    /// Request forwarded to the private side (server -> client)
    Request,
    /// Response to a request, also the register ack (client -> server)
    Response,
    /// One line of a server-sent-event stream (client -> server)
    Sse,
    /// Open a raw TCP stream (server -> client)
    TcpInit,
    /// Raw TCP payload chunk (both directions)
    TcpData,
    /// Raw TCP stream closed (both directions)
    TcpClose,
    /// WebSocket upgrade request (server -> client)
    Websocket,
    /// WebSocket payload (both directions)
    WebsocketData,
    /// Stream-scoped error (both directions)
    Error,
    /// Liveness probe (server -> client)
    Ping,
    /// Liveness reply, repurposed as client-originated keepalive
    Pong,
    /// Discriminators this build does not know; logged and dropped
    #[serde(other)]
    Unknown,
}

/// Multi-value HTTP headers as carried on the wire
pub type Headers = HashMap<String, Vec<String>>;

/// One message on the control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    /// Per-stream correlation ID, absent on register/ping/pong
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request path with the query string already appended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub body: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub ws_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_message_type: Option<i32>,
}

impl Frame {
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            id: None,
            tunnel_id: None,
            method: None,
            path: None,
            headers: None,
            body: None,
            status: None,
            error: None,
            sse_data: None,
            ws_data: None,
            ws_message_type: None,
        }
    }

    pub fn register(tunnel_id: Option<&str>) -> Self {
        Self {
            tunnel_id: tunnel_id.map(str::to_string),
            ..Self::new(FrameType::Register)
        }
    }

    /// Registration ack: a response frame carrying the assigned tunnel ID
    pub fn register_ack(tunnel_id: &str) -> Self {
        Self {
            tunnel_id: Some(tunnel_id.to_string()),
            ..Self::new(FrameType::Response)
        }
    }

    pub fn request(
        id: &str,
        method: &str,
        path: &str,
        headers: Headers,
        body: Option<Vec<u8>>,
    ) -> Self {
        Self {
            id: Some(id.to_string()),
            method: Some(method.to_string()),
            path: Some(path.to_string()),
            headers: Some(headers),
            body,
            ..Self::new(FrameType::Request)
        }
    }

    pub fn response(id: &str, status: u16, headers: Headers, body: Option<Vec<u8>>) -> Self {
        Self {
            id: Some(id.to_string()),
            status: Some(status),
            headers: Some(headers),
            body,
            ..Self::new(FrameType::Response)
        }
    }

    pub fn error(id: &str, message: impl Into<String>) -> Self {
        Self {
            id: Some(id.to_string()),
            error: Some(message.into()),
            ..Self::new(FrameType::Error)
        }
    }

    pub fn sse_line(id: &str, line: impl Into<String>) -> Self {
        Self {
            id: Some(id.to_string()),
            sse_data: Some(line.into()),
            ..Self::new(FrameType::Sse)
        }
    }

    pub fn tcp_init(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::new(FrameType::TcpInit)
        }
    }

    pub fn tcp_data(id: &str, data: Vec<u8>) -> Self {
        Self {
            id: Some(id.to_string()),
            body: Some(data),
            ..Self::new(FrameType::TcpData)
        }
    }

    pub fn tcp_close(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::new(FrameType::TcpClose)
        }
    }

    pub fn ws_upgrade(id: &str, method: &str, path: &str, headers: Headers) -> Self {
        Self {
            id: Some(id.to_string()),
            method: Some(method.to_string()),
            path: Some(path.to_string()),
            headers: Some(headers),
            ..Self::new(FrameType::Websocket)
        }
    }

    pub fn ws_data(id: &str, data: Vec<u8>, kind: i32) -> Self {
        Self {
            id: Some(id.to_string()),
            ws_data: Some(data),
            ws_message_type: Some(kind),
            ..Self::new(FrameType::WebsocketData)
        }
    }

    pub fn ping() -> Self {
        Self::new(FrameType::Ping)
    }

    pub fn pong(tunnel_id: &str) -> Self {
        Self {
            tunnel_id: Some(tunnel_id.to_string()),
            ..Self::new(FrameType::Pong)
        }
    }

    /// Serialize to the on-wire JSON text
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Protocol(e.to_string()))
    }

    /// Parse one on-wire JSON text message
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Protocol(e.to_string()))
    }
}

/// Fresh tunnel identifier: `tunnel-` + 16 hex chars
pub fn generate_tunnel_id() -> String {
    format!("tunnel-{:016x}", rand::random::<u64>())
}

/// Fresh stream identifier: `req-` + 32 hex chars
pub fn generate_stream_id() -> String {
    format!(
        "req-{:016x}{:016x}",
        rand::random::<u64>(),
        rand::random::<u64>()
    )
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => ser.serialize_str(&BASE64.encode(b)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(de)?;
        match text {
            Some(text) => BASE64
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let mut headers = Headers::new();
        headers.insert("accept".into(), vec!["text/html".into()]);
        let frame = Frame::request("req-1", "POST", "/items?x=1", headers, Some(b"hi".to_vec()));

        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Request);
        assert_eq!(decoded.id.as_deref(), Some("req-1"));
        assert_eq!(decoded.path.as_deref(), Some("/items?x=1"));
        assert_eq!(decoded.body.as_deref(), Some(&b"hi"[..]));
    }

    #[test]
    fn test_body_is_base64_on_the_wire() {
        let frame = Frame::tcp_data("req-2", vec![0x00, 0xff, 0x10]);
        let text = frame.encode().unwrap();
        assert!(text.contains("\"body\":\"AP8Q\""));
        assert!(text.contains("\"type\":\"tcp_data\""));
    }

    #[test]
    fn test_optional_fields_omitted() {
        let text = Frame::ping().encode().unwrap();
        assert_eq!(text, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_snake_case_discriminators() {
        for (frame, tag) in [
            (Frame::tcp_init("a"), "tcp_init"),
            (Frame::tcp_close("a"), "tcp_close"),
            (Frame::ws_data("a", vec![], WS_TEXT), "websocket_data"),
            (Frame::sse_line("a", "x"), "sse"),
        ] {
            assert!(frame
                .encode()
                .unwrap()
                .contains(&format!("\"type\":\"{tag}\"")));
        }
    }

    #[test]
    fn test_unknown_discriminator_is_accepted() {
        let frame = Frame::decode(r#"{"type":"flow_control","id":"req-9"}"#).unwrap();
        assert_eq!(frame.frame_type, FrameType::Unknown);
        assert_eq!(frame.id.as_deref(), Some("req-9"));
    }

    #[test]
    fn test_malformed_json_is_a_protocol_error() {
        assert!(Frame::decode("{nope").is_err());
    }

    #[test]
    fn test_id_formats() {
        let tunnel = generate_tunnel_id();
        assert!(tunnel.starts_with("tunnel-"));
        assert_eq!(tunnel.len(), "tunnel-".len() + 16);

        let stream = generate_stream_id();
        assert!(stream.starts_with("req-"));
        assert_eq!(stream.len(), "req-".len() + 32);
        assert!(stream[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
