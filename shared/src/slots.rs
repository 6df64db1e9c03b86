//! Per-stream delivery slots.
//!
//! The dispatcher hands inbound frames to waiting adapter tasks through
//! bounded channels keyed by stream ID. Delivery is non-blocking: a full
//! slot drops the newest frame, a missing slot drops it outright.

use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::Frame;

/// Capacity for one-shot request/response slots
pub const RESPONSE_SLOT_CAPACITY: usize = 1;

/// Capacity for streaming slots (SSE, WebSocket, TCP); overflow still drops
pub const STREAM_SLOT_CAPACITY: usize = 64;

/// Stream ID -> delivery slot table for one tunnel
#[derive(Default)]
pub struct SlotTable {
    slots: RwLock<HashMap<String, mpsc::Sender<Frame>>>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a delivery slot for a stream. Fails if the ID is taken.
    pub async fn register(&self, id: &str, capacity: usize) -> Result<mpsc::Receiver<Frame>> {
        let mut slots = self.slots.write().await;
        if slots.contains_key(id) {
            return Err(Error::Protocol(format!("stream {id} already registered")));
        }
        let (tx, rx) = mpsc::channel(capacity);
        slots.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Remove a slot and release its waiter. Idempotent.
    pub async fn unregister(&self, id: &str) {
        // dropping the sender closes the channel, waking any receiver
        self.slots.write().await.remove(id);
    }

    /// Deliver a frame to the slot matching its stream ID, without blocking.
    /// Returns whether the frame was handed off.
    pub async fn dispatch(&self, frame: Frame) -> bool {
        let Some(id) = frame.id.clone() else {
            debug!("dropping frame without stream id: {:?}", frame.frame_type);
            return false;
        };
        let slots = self.slots.read().await;
        match slots.get(&id) {
            Some(tx) => match tx.try_send(frame) {
                Ok(()) => true,
                Err(_) => {
                    debug!("slot full, dropping frame for stream {}", id);
                    false
                }
            },
            None => {
                debug!("no slot for stream {}, dropping frame", id);
                false
            }
        }
    }

    /// Close every slot; receivers observe end-of-stream.
    pub async fn clear(&self) {
        self.slots.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameType;

    #[tokio::test]
    async fn test_dispatch_delivers_to_registered_slot() {
        let table = SlotTable::new();
        let mut rx = table.register("req-a", RESPONSE_SLOT_CAPACITY).await.unwrap();

        assert!(table.dispatch(Frame::error("req-a", "boom")).await);
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Error);
        assert_eq!(frame.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let table = SlotTable::new();
        let _rx = table.register("req-a", 1).await.unwrap();
        assert!(table.register("req-a", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_unregister_closes_slot_and_is_idempotent() {
        let table = SlotTable::new();
        let mut rx = table.register("req-a", 1).await.unwrap();

        table.unregister("req-a").await;
        table.unregister("req-a").await;
        assert!(rx.recv().await.is_none());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_full_slot_drops_newest_frame() {
        let table = SlotTable::new();
        let mut rx = table.register("req-a", 1).await.unwrap();

        assert!(table.dispatch(Frame::sse_line("req-a", "first")).await);
        assert!(!table.dispatch(Frame::sse_line("req-a", "second")).await);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.sse_data.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_unknown_stream_dropped() {
        let table = SlotTable::new();
        assert!(!table.dispatch(Frame::tcp_close("req-missing")).await);
        assert!(!table.dispatch(Frame::ping()).await);
    }

    #[tokio::test]
    async fn test_clear_closes_all_slots() {
        let table = SlotTable::new();
        let mut rx1 = table.register("req-a", 1).await.unwrap();
        let mut rx2 = table.register("req-b", 1).await.unwrap();

        table.clear().await;
        assert!(rx1.recv().await.is_none());
        assert!(rx2.recv().await.is_none());
    }
}
