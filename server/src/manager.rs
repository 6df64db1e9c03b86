//! Tunnel registry and heartbeat scanning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use burrow_shared::protocol::Frame;

use crate::tunnel::Tunnel;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Registry of live tunnels keyed by tunnel ID
#[derive(Default)]
pub struct Manager {
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tunnel. A collision closes the previous tunnel's transport
    /// before the new one takes the slot.
    pub async fn register(&self, tunnel: Arc<Tunnel>) {
        let mut tunnels = self.tunnels.write().await;
        if let Some(old) = tunnels.insert(tunnel.id.clone(), tunnel.clone()) {
            warn!("tunnel {} re-registered, closing previous connection", old.id);
            old.close();
        }
        info!("tunnel registered: {}", tunnel.id);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.read().await.get(id).cloned()
    }

    /// Close the tunnel's transport and forget it. Idempotent.
    pub async fn remove(&self, id: &str) {
        if let Some(tunnel) = self.tunnels.write().await.remove(id) {
            tunnel.close();
            info!("tunnel removed: {}", id);
        }
    }

    /// The sole tunnel's ID, only when exactly one is registered
    pub async fn select_single(&self) -> Option<String> {
        let tunnels = self.tunnels.read().await;
        if tunnels.len() != 1 {
            return None;
        }
        tunnels.keys().next().cloned()
    }

    /// An arbitrary tunnel's ID, if any exist
    pub async fn select_any(&self) -> Option<String> {
        self.tunnels.read().await.keys().next().cloned()
    }

    pub async fn count(&self) -> usize {
        self.tunnels.read().await.len()
    }

    /// Probe every tunnel each interval and evict the ones whose last
    /// liveness update is older than the silence limit.
    pub fn start_heartbeat(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let tunnels: Vec<Arc<Tunnel>> =
                    self.tunnels.read().await.values().cloned().collect();

                for tunnel in tunnels {
                    if let Err(e) = tunnel.send(Frame::ping()).await {
                        warn!("heartbeat failed for tunnel {}: {}", tunnel.id, e);
                        self.remove(&tunnel.id).await;
                        continue;
                    }
                    if tunnel.last_seen().await.elapsed() > LIVENESS_TIMEOUT {
                        warn!("tunnel {} silent for over {:?}, removing", tunnel.id, LIVENESS_TIMEOUT);
                        self.remove(&tunnel.id).await;
                    }
                }
            }
        });
    }
}
