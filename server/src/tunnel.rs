//! Per-tunnel connection state.
//!
//! One pump task per tunnel owns the control socket: it demultiplexes
//! inbound frames into per-stream slots and drains an outbox of outbound
//! frames. Funneling every writer through the outbox is what keeps
//! framed messages from interleaving on the transport.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use burrow_shared::protocol::{Frame, FrameType};
use burrow_shared::slots::SlotTable;
use burrow_shared::{Error, Result};

const OUTBOX_CAPACITY: usize = 256;

/// An active tunnel to one private client
pub struct Tunnel {
    pub id: String,
    outbox: mpsc::Sender<Frame>,
    slots: SlotTable,
    last_seen: RwLock<Instant>,
    shutdown: CancellationToken,
}

impl Tunnel {
    /// Build the tunnel state without a transport; the caller drains the
    /// returned outbox. Used directly by tests, via `spawn` in production.
    pub fn new(id: String) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let tunnel = Arc::new(Self {
            id,
            outbox,
            slots: SlotTable::new(),
            last_seen: RwLock::new(Instant::now()),
            shutdown: CancellationToken::new(),
        });
        (tunnel, outbox_rx)
    }

    /// Wire a freshly upgraded control socket to a new tunnel and start
    /// its pump task.
    pub fn spawn(id: String, socket: WebSocket) -> Arc<Self> {
        let (tunnel, outbox_rx) = Self::new(id);
        tokio::spawn(pump(socket, tunnel.clone(), outbox_rx));
        tunnel
    }

    /// Queue one frame for the transport. Fails once the pump has exited.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.outbox
            .send(frame)
            .await
            .map_err(|_| Error::Transport(format!("tunnel {} is closed", self.id)))
    }

    /// Create the delivery slot for a new stream
    pub async fn register_slot(
        &self,
        stream_id: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Frame>> {
        self.slots.register(stream_id, capacity).await
    }

    /// Tear down a stream's slot; any waiter observes closure. Idempotent.
    pub async fn unregister_slot(&self, stream_id: &str) {
        self.slots.unregister(stream_id).await;
    }

    /// Route one inbound frame: pong refreshes liveness, unknown types are
    /// dropped, everything else goes to the slot for its stream ID.
    pub async fn handle_inbound(&self, frame: Frame) {
        match frame.frame_type {
            FrameType::Pong => {
                *self.last_seen.write().await = Instant::now();
            }
            FrameType::Unknown => {
                warn!("tunnel {}: unhandled frame type, dropping", self.id);
            }
            _ => {
                self.slots.dispatch(frame).await;
            }
        }
    }

    pub async fn last_seen(&self) -> Instant {
        *self.last_seen.read().await
    }

    /// Ask the pump to drop the transport
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close every open stream; called when the pump exits
    async fn close_streams(&self) {
        self.slots.clear().await;
    }

    /// Number of streams holding a registered slot
    #[cfg(test)]
    pub(crate) async fn open_streams(&self) -> usize {
        self.slots.len().await
    }
}

/// The single reader/writer task for one tunnel. Terminates on transport
/// error, close, or cancellation, then cascades closure to all streams.
async fn pump(socket: WebSocket, tunnel: Arc<Tunnel>, mut outbox_rx: mpsc::Receiver<Frame>) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                    Ok(frame) => tunnel.handle_inbound(frame).await,
                    Err(e) => warn!("tunnel {}: dropping malformed frame: {}", tunnel.id, e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!("tunnel {}: control channel closed", tunnel.id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("tunnel {}: transport read error: {}", tunnel.id, e);
                    break;
                }
            },
            frame = outbox_rx.recv() => match frame {
                Some(frame) => {
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("tunnel {}: failed to encode frame: {}", tunnel.id, e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        debug!("tunnel {}: transport write error", tunnel.id);
                        break;
                    }
                }
                None => break,
            },
            _ = tunnel.shutdown.cancelled() => {
                debug!("tunnel {}: closed by registry", tunnel.id);
                break;
            }
        }
    }

    tunnel.shutdown.cancel();
    tunnel.close_streams().await;
}
