//! Local TCP bridging.
//!
//! tcp_init opens a local connection and spawns a reader for the
//! local-to-server direction. Inbound tcp_data is written from the main
//! loop itself, never from a spawned task, so byte order on the local
//! socket matches frame order exactly.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use burrow_shared::protocol::{Frame, TCP_CHUNK_SIZE};

use crate::tunnel::TunnelHandle;

/// One bridged local TCP connection
pub struct TcpConn {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    reader: AbortHandle,
}

/// Dial the local target for a new tunnel stream
pub async fn handle_init(handle: Arc<TunnelHandle>, tcp_target: Option<String>, frame: Frame) {
    let stream_id = frame.id.clone().unwrap_or_default();

    let Some(target) = tcp_target else {
        let _ = handle
            .send(Frame::error(&stream_id, "tcp_target is not configured"))
            .await;
        return;
    };

    let socket = match TcpStream::connect(&target).await {
        Ok(socket) => socket,
        Err(e) => {
            let _ = handle
                .send(Frame::error(&stream_id, format!("connecting {target}: {e}")))
                .await;
            return;
        }
    };
    debug!("tcp stream {} connected to {}", stream_id, target);

    let (mut read_half, write_half) = socket.into_split();

    // local -> server
    let reader = {
        let handle = handle.clone();
        let stream_id = stream_id.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; TCP_CHUNK_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        let _ = handle.send(Frame::tcp_close(&stream_id)).await;
                        break;
                    }
                    Ok(n) => {
                        if handle
                            .send(Frame::tcp_data(&stream_id, buf[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("tcp stream {}: local read error: {}", stream_id, e);
                        let _ = handle.send(Frame::tcp_close(&stream_id)).await;
                        break;
                    }
                }
            }
            handle.tcp_conns.remove(&stream_id);
        })
    };

    handle.tcp_conns.insert(
        stream_id,
        TcpConn {
            writer: Arc::new(Mutex::new(write_half)),
            reader: reader.abort_handle(),
        },
    );
}

/// Write one tcp_data frame to the local socket. Called from the main
/// loop directly; handing this to a task would reorder bytes.
pub async fn handle_data(handle: &TunnelHandle, frame: &Frame) {
    let Some(stream_id) = frame.id.as_deref() else {
        return;
    };
    let Some(data) = frame.body.as_deref() else {
        return;
    };

    // clone out of the table so no map guard is held across the write
    let writer = handle
        .tcp_conns
        .get(stream_id)
        .map(|conn| conn.writer.clone());

    if let Some(writer) = writer {
        if writer.lock().await.write_all(data).await.is_err() {
            warn!("tcp stream {}: local write failed, closing", stream_id);
            handle_close(handle, frame);
        }
    }
}

/// Drop the local connection for a closed stream. Idempotent.
pub fn handle_close(handle: &TunnelHandle, frame: &Frame) {
    let Some(stream_id) = frame.id.as_deref() else {
        return;
    };
    if let Some((_, conn)) = handle.tcp_conns.remove(stream_id) {
        conn.reader.abort();
        debug!("tcp stream {} closed", stream_id);
    }
}
