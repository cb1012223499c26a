use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub type ConnId = String;

/// How run events reach a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Every run's events, whoever started it.
    #[default]
    Broadcast,
    /// Only runs this connection started or was replayed on attach.
    Unicast,
}

/// Work item for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Ping,
    Close,
}

struct Connection {
    sender: mpsc::UnboundedSender<Outbound>,
    mode: DeliveryMode,
    connected_at: DateTime<Utc>,
}

/// The set of attached observers.
///
/// Each connection gets its own unbounded queue drained by its own writer
/// task, so pushing to one never waits on another.
#[derive(Default)]
pub struct ConnectionManager {
    connections: RwLock<HashMap<ConnId, Connection>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn_id: ConnId, mode: DeliveryMode) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection { sender: tx, mode, connected_at: Utc::now() };
        self.connections.write().insert(conn_id, conn);
        rx
    }

    /// Returns how many connections remain.
    pub fn remove(&self, conn_id: &str) -> usize {
        let mut conns = self.connections.write();
        if let Some(conn) = conns.remove(conn_id) {
            let lifetime = Utc::now() - conn.connected_at;
            tracing::debug!(conn_id, seconds = lifetime.num_seconds(), "connection removed");
        }
        conns.len()
    }

    pub fn mode_of(&self, conn_id: &str) -> Option<DeliveryMode> {
        self.connections.read().get(conn_id).map(|c| c.mode)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn send_to(&self, conn_id: &str, frames: &[String]) -> bool {
        let conns = self.connections.read();
        let Some(conn) = conns.get(conn_id) else {
            return false;
        };
        push_frames(conn_id, conn, frames)
    }

    /// Deliver run frames: broadcast connections always, unicast connections
    /// only when they observe the run. Returns the number of recipients.
    pub fn deliver(&self, frames: &[String], observers: &HashSet<ConnId>) -> usize {
        if frames.is_empty() {
            return 0;
        }
        let conns = self.connections.read();
        let mut delivered = 0;
        for (conn_id, conn) in conns.iter() {
            let wanted = conn.mode == DeliveryMode::Broadcast || observers.contains(conn_id);
            if wanted && push_frames(conn_id, conn, frames) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Every connection regardless of mode.
    pub fn broadcast(&self, frames: &[String]) -> usize {
        let conns = self.connections.read();
        conns
            .iter()
            .filter(|(conn_id, conn)| push_frames(conn_id, conn, frames))
            .count()
    }

    pub fn close(&self, conn_id: &str) {
        if let Some(conn) = self.connections.read().get(conn_id) {
            let _ = conn.sender.send(Outbound::Close);
        }
    }

    pub fn ping_all(&self) {
        for conn in self.connections.read().values() {
            let _ = conn.sender.send(Outbound::Ping);
        }
    }

    pub fn shutdown_all(&self) {
        let mut conns = self.connections.write();
        let count = conns.len();
        for conn in conns.values() {
            let _ = conn.sender.send(Outbound::Close);
        }
        conns.clear();
        tracing::info!(count, "closed all connections");
    }
}

fn push_frames(conn_id: &str, conn: &Connection, frames: &[String]) -> bool {
    for frame in frames {
        if conn.sender.send(Outbound::Frame(frame.clone())).is_err() {
            // Writer already gone; the receive loop will detach it.
            tracing::warn!(conn_id, "dropping frames for closed connection");
            return false;
        }
    }
    true
}

/// Periodic ping so idle sockets behind proxies stay open and dead ones are
/// noticed by their writer task.
pub fn start_heartbeat(
    connections: Arc<ConnectionManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tracing::trace!(count = connections.connection_count(), "heartbeat");
            connections.ping_all();
        }
    })
}
