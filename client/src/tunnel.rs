//! Client-side tunnel connection handle.
//!
//! Adapter tasks queue outbound frames into the main loop's outbox and
//! receive stream-addressed frames (WebSocket data, stream errors)
//! through the same slot mechanism the server uses. Local TCP bridges
//! keep their write halves in a per-stream table.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use burrow_shared::protocol::Frame;
use burrow_shared::slots::SlotTable;
use burrow_shared::{Error, Result};

use crate::tcp::TcpConn;

const OUTBOX_CAPACITY: usize = 256;

/// Shared handle to the live control connection
pub struct TunnelHandle {
    pub tunnel_id: String,
    outbox: mpsc::Sender<Frame>,
    slots: SlotTable,
    /// stream ID -> local TCP connection
    pub(crate) tcp_conns: DashMap<String, TcpConn>,
}

impl TunnelHandle {
    /// The caller (the main loop) drains the returned outbox onto the wire.
    pub fn new(tunnel_id: String) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let handle = Arc::new(Self {
            tunnel_id,
            outbox,
            slots: SlotTable::new(),
            tcp_conns: DashMap::new(),
        });
        (handle, outbox_rx)
    }

    /// Queue one frame for the control channel
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.outbox
            .send(frame)
            .await
            .map_err(|_| Error::Transport("control connection closed".into()))
    }

    pub async fn register_slot(
        &self,
        stream_id: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Frame>> {
        self.slots.register(stream_id, capacity).await
    }

    pub async fn unregister_slot(&self, stream_id: &str) {
        self.slots.unregister(stream_id).await;
    }

    /// Hand a stream-addressed frame to whichever bridge is waiting on it
    pub async fn dispatch(&self, frame: Frame) {
        self.slots.dispatch(frame).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_shared::protocol::{FrameType, WS_TEXT};

    #[tokio::test]
    async fn test_send_reaches_outbox() {
        let (handle, mut outbox) = TunnelHandle::new("tunnel-a".into());
        handle.send(Frame::pong("tunnel-a")).await.unwrap();

        let frame = outbox.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Pong);
        assert_eq!(frame.tunnel_id.as_deref(), Some("tunnel-a"));
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_bridge_slot() {
        let (handle, _outbox) = TunnelHandle::new("tunnel-a".into());
        let mut slot = handle.register_slot("req-ws", 4).await.unwrap();

        handle
            .dispatch(Frame::ws_data("req-ws", b"ping".to_vec(), WS_TEXT))
            .await;

        let frame = slot.recv().await.unwrap();
        assert_eq!(frame.ws_data.as_deref(), Some(&b"ping"[..]));
    }

    #[tokio::test]
    async fn test_send_fails_after_main_loop_exit() {
        let (handle, outbox) = TunnelHandle::new("tunnel-a".into());
        drop(outbox);
        assert!(handle.send(Frame::ping()).await.is_err());
    }
}
