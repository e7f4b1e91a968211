//! Device-keyed channel table with heartbeat and fan-out.
//!
//! Each vault has a map of `device_id -> channel`. A new connection for an
//! existing device displaces the old one; the table mutex stays held for
//! the whole close-then-insert so the replacement is observable to the
//! next broadcast. Dropping a channel's sender ends its socket loop.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::ChannelMessage;

/// Seconds between heartbeat sweeps.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Channels idle longer than this are evicted by the sweep.
pub const STALE_AFTER_SECS: i64 = 60;

/// Origin id used for frames the server itself produces.
pub const SERVER_DEVICE_ID: &str = "server";

struct DeviceChannel {
    conn_id: String,
    sender: mpsc::UnboundedSender<ChannelMessage>,
    last_seen: i64,
}

/// Snapshot for `GET /ws/status`.
#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    pub connected_vaults: usize,
    pub clients_by_vault: HashMap<String, usize>,
}

/// All live channels, grouped by vault.
#[derive(Default)]
pub struct ChannelHub {
    vaults: Mutex<HashMap<String, HashMap<String, DeviceChannel>>>,
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel for `(vault, device)`, displacing any prior
    /// channel with the same device id. Returns the connection id (used to
    /// unregister without racing a replacement) and the outbound receiver.
    pub async fn register(
        &self,
        vault: &str,
        device: &str,
    ) -> (String, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let conn_id = Uuid::new_v4().to_string();

        let mut vaults = self.vaults.lock().await;
        let devices = vaults.entry(vault.to_string()).or_default();
        if devices.remove(device).is_some() {
            info!(vault, device, "displacing existing channel");
        }
        devices.insert(
            device.to_string(),
            DeviceChannel {
                conn_id: conn_id.clone(),
                sender,
                last_seen: now_secs(),
            },
        );

        (conn_id, receiver)
    }

    /// Remove a channel, but only if it is still the registered connection
    /// for the device; a displaced connection must not evict its
    /// replacement.
    pub async fn unregister(&self, vault: &str, device: &str, conn_id: &str) {
        let mut vaults = self.vaults.lock().await;
        if let Some(devices) = vaults.get_mut(vault) {
            let matches = devices
                .get(device)
                .map(|c| c.conn_id == conn_id)
                .unwrap_or(false);
            if matches {
                devices.remove(device);
            }
            if devices.is_empty() {
                vaults.remove(vault);
            }
        }
    }

    /// Refresh a channel's liveness on inbound traffic.
    pub async fn touch(&self, vault: &str, device: &str) {
        let mut vaults = self.vaults.lock().await;
        if let Some(channel) = vaults.get_mut(vault).and_then(|d| d.get_mut(device)) {
            channel.last_seen = now_secs();
        }
    }

    /// Send a frame to every other device of the vault. Channels whose
    /// receiver is gone are dropped from the table.
    pub async fn broadcast(&self, vault: &str, origin_device: &str, msg: &ChannelMessage) {
        let mut vaults = self.vaults.lock().await;
        let Some(devices) = vaults.get_mut(vault) else {
            return;
        };
        let mut dead = Vec::new();
        for (device, channel) in devices.iter() {
            if device == origin_device {
                continue;
            }
            if channel.sender.send(msg.clone()).is_err() {
                warn!(vault, device, "broadcast delivery failed; closing channel");
                dead.push(device.clone());
            }
        }
        for device in dead {
            devices.remove(&device);
        }
        if devices.is_empty() {
            vaults.remove(vault);
        }
    }

    /// Send a frame to one device. Returns false when the channel is gone.
    pub async fn send_to(&self, vault: &str, device: &str, msg: ChannelMessage) -> bool {
        let vaults = self.vaults.lock().await;
        match vaults.get(vault).and_then(|d| d.get(device)) {
            Some(channel) => channel.sender.send(msg).is_ok(),
            None => false,
        }
    }

    /// Heartbeat sweep: evict channels idle past the threshold, ping the
    /// rest.
    pub async fn sweep(&self) {
        let cutoff = now_secs() - STALE_AFTER_SECS;
        let mut vaults = self.vaults.lock().await;
        vaults.retain(|vault, devices| {
            devices.retain(|device, channel| {
                if channel.last_seen < cutoff {
                    debug!(vault, device, "evicting stale channel");
                    return false;
                }
                if channel
                    .sender
                    .send(ChannelMessage::ping(vault, SERVER_DEVICE_ID))
                    .is_err()
                {
                    debug!(vault, device, "channel receiver gone");
                    return false;
                }
                true
            });
            !devices.is_empty()
        });
    }

    pub async fn status(&self) -> HubStatus {
        let vaults = self.vaults.lock().await;
        HubStatus {
            connected_vaults: vaults.len(),
            clients_by_vault: vaults
                .iter()
                .map(|(vault, devices)| (vault.clone(), devices.len()))
                .collect(),
        }
    }
}
