//! Handshake tracking and the connection log

use crate::backend::PeerDump;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionEvent {
    /// A new handshake was observed
    Handshake,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionLog {
    pub id: u64,
    pub peer_id: u64,
    pub peer_name: String,
    pub public_key: String,
    pub event: ConnectionEvent,
    pub endpoint: Option<String>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Identity of a configured peer, used to label events
#[derive(Debug, Clone)]
pub struct PeerLabel {
    pub id: u64,
    pub name: String,
    pub public_key: String,
}

#[derive(Default)]
struct MonitorState {
    live: HashMap<String, PeerDump>,
    last_handshake: HashMap<String, DateTime<Utc>>,
    online: HashMap<String, bool>,
    logs: VecDeque<ConnectionLog>,
    next_log_id: u64,
}

impl MonitorState {
    fn record(&mut self, capacity: usize, label: &PeerLabel, event: ConnectionEvent, dump: Option<&PeerDump>) {
        self.next_log_id += 1;
        let entry = ConnectionLog {
            id: self.next_log_id,
            peer_id: label.id,
            peer_name: label.name.clone(),
            public_key: label.public_key.clone(),
            event,
            endpoint: dump.and_then(|d| d.endpoint.clone()),
            rx_bytes: dump.map(|d| d.rx_bytes).unwrap_or(0),
            tx_bytes: dump.map(|d| d.tx_bytes).unwrap_or(0),
            created_at: Utc::now(),
        };
        debug!(peer = %label.name, event = ?event, "connection event");
        if self.logs.len() >= capacity {
            self.logs.pop_front();
        }
        self.logs.push_back(entry);
    }
}

/// Live peer counters plus a bounded log of connection events
pub struct HandshakeMonitor {
    online_window: Duration,
    capacity: usize,
    state: Mutex<MonitorState>,
}

impl HandshakeMonitor {
    pub fn new(online_window: Duration, capacity: usize) -> Self {
        Self {
            online_window,
            capacity: capacity.max(1),
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn is_online(&self, last_handshake: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_handshake {
            Some(at) => now
                .signed_duration_since(at)
                .to_std()
                .map(|age| age < self.online_window)
                .unwrap_or(true),
            None => false,
        }
    }

    /// Replace the live view with a fresh dump and record transitions
    pub async fn observe(&self, dump: Vec<PeerDump>, peers: &[PeerLabel]) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.live = dump.into_iter().map(|d| (d.public_key.clone(), d)).collect();

        for label in peers {
            let current = state.live.get(&label.public_key).cloned();
            let handshake = current.as_ref().and_then(|d| d.last_handshake);
            let now_online = self.is_online(handshake, now);
            let was_online = state.online.get(&label.public_key).copied().unwrap_or(false);

            if let Some(at) = handshake {
                if state.last_handshake.get(&label.public_key) != Some(&at) {
                    state.record(self.capacity, label, ConnectionEvent::Handshake, current.as_ref());
                    state.last_handshake.insert(label.public_key.clone(), at);
                }
                if now_online && !was_online {
                    info!(peer = %label.name, "peer connected");
                    state.record(self.capacity, label, ConnectionEvent::Connected, current.as_ref());
                }
            }
            if was_online && !now_online {
                info!(peer = %label.name, "peer disconnected");
                state.record(self.capacity, label, ConnectionEvent::Disconnected, current.as_ref());
            }
            state.online.insert(label.public_key.clone(), now_online);
        }

        let known: std::collections::HashSet<&str> =
            peers.iter().map(|p| p.public_key.as_str()).collect();
        state.online.retain(|key, _| known.contains(key.as_str()));
        state.last_handshake.retain(|key, _| known.contains(key.as_str()));
    }

    /// The tunnel went down: every online peer is now disconnected
    pub async fn clear(&self, peers: &[PeerLabel]) {
        let mut state = self.state.lock().await;
        for label in peers {
            if state.online.get(&label.public_key).copied().unwrap_or(false) {
                let dump = state.live.get(&label.public_key).cloned();
                state.record(self.capacity, label, ConnectionEvent::Disconnected, dump.as_ref());
            }
        }
        state.live.clear();
        state.online.clear();
    }

    pub async fn live(&self) -> HashMap<String, PeerDump> {
        self.state.lock().await.live.clone()
    }

    /// Newest events first, optionally for one peer only
    pub async fn logs(&self, peer_id: Option<u64>, limit: usize) -> Vec<ConnectionLog> {
        let state = self.state.lock().await;
        state
            .logs
            .iter()
            .rev()
            .filter(|log| peer_id.map_or(true, |id| log.peer_id == id))
            .take(limit)
            .cloned()
            .collect()
    }
}
