//! Raw TCP ingress.
//!
//! Each accepted public connection becomes one tunnel stream: public
//! reads are chunked into tcp_data frames, and frames from the private
//! side are written straight back to the public socket.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use burrow_shared::protocol::{generate_stream_id, Frame, FrameType, TCP_CHUNK_SIZE};
use burrow_shared::slots::STREAM_SLOT_CAPACITY;

use crate::ingress::{select_tunnel, AppState};
use crate::tunnel::Tunnel;

/// Accept loop for the public TCP port
pub async fn run_tcp_ingress(port: u16, state: AppState) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind tcp ingress port {}: {}", port, e);
            return;
        }
    };
    info!("tcp ingress listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!("tcp connection from {}", peer);
                tokio::spawn(handle_connection(socket, state.clone()));
            }
            Err(e) => warn!("tcp accept failed: {}", e),
        }
    }
}

async fn handle_connection(socket: TcpStream, state: AppState) {
    // same selection policy as HTTP ingress
    let tunnel_id = match select_tunnel(&state.manager, state.private_use).await {
        Ok(id) => id,
        Err((_, e)) => {
            warn!("rejecting tcp connection: {}", e);
            return;
        }
    };
    let Some(tunnel) = state.manager.get(&tunnel_id).await else {
        return;
    };

    state.metrics.tcp_session_opened();
    bridge(socket, tunnel).await;
}

/// Bridge one public socket to one tunnel stream
async fn bridge(socket: TcpStream, tunnel: Arc<Tunnel>) {
    let stream_id = generate_stream_id();

    let mut slot = match tunnel.register_slot(&stream_id, STREAM_SLOT_CAPACITY).await {
        Ok(slot) => slot,
        Err(e) => {
            warn!("tcp stream {}: {}", stream_id, e);
            return;
        }
    };

    if let Err(e) = tunnel.send(Frame::tcp_init(&stream_id)).await {
        warn!("tcp stream {}: init failed: {}", stream_id, e);
        tunnel.unregister_slot(&stream_id).await;
        return;
    }

    let (mut read_half, mut write_half) = socket.into_split();

    // public -> tunnel
    let outbound = {
        let tunnel = tunnel.clone();
        let stream_id = stream_id.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; TCP_CHUNK_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        let _ = tunnel.send(Frame::tcp_close(&stream_id)).await;
                        break;
                    }
                    Ok(n) => {
                        if tunnel
                            .send(Frame::tcp_data(&stream_id, buf[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("tcp stream {}: public read error: {}", stream_id, e);
                        let _ = tunnel.send(Frame::tcp_close(&stream_id)).await;
                        break;
                    }
                }
            }
        })
    };

    // tunnel -> public
    while let Some(frame) = slot.recv().await {
        match frame.frame_type {
            FrameType::TcpData => {
                let data = frame.body.unwrap_or_default();
                if write_half.write_all(&data).await.is_err() {
                    debug!("tcp stream {}: public write error", stream_id);
                    break;
                }
            }
            FrameType::TcpClose | FrameType::Error => break,
            _ => {}
        }
    }

    outbound.abort();
    // harmless if the private side already closed; required if we broke
    // on a public write error
    let _ = tunnel.send(Frame::tcp_close(&stream_id)).await;
    tunnel.unregister_slot(&stream_id).await;
    debug!("tcp stream {} closed", stream_id);
}
