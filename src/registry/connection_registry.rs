//! # Connection Registry
//!
//! Per-client connection lifecycle and subscription bookkeeping.
//!
//! A connection moves `connected -> disconnected` on network loss. A client
//! that comes back registers again and gets a fresh record with an empty
//! subscription set; reconciliation through `last_event_id` bridges the gap,
//! not identity continuity.

use crate::constants::ConnectionStatus;
use crate::logging::log_connection_operation;
use crate::messaging::transport::ClientTransport;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct Connection {
    pub client_id: String,
    pub status: ConnectionStatus,
    pub metadata: Value,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub disconnect_reason: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub subscriptions: BTreeSet<String>,
    transport: Arc<dyn ClientTransport>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("status", &self.status)
            .field("metadata", &self.metadata)
            .field("connected_at", &self.connected_at)
            .field("disconnected_at", &self.disconnected_at)
            .field("disconnect_reason", &self.disconnect_reason)
            .field("subscriptions", &self.subscriptions)
            .field("transport", &"<Arc<dyn ClientTransport>>".to_string())
            .finish()
    }
}

impl Connection {
    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            client_id: self.client_id.clone(),
            status: self.status,
            metadata: self.metadata.clone(),
            connected_at: self.connected_at,
            disconnected_at: self.disconnected_at,
            disconnect_reason: self.disconnect_reason.clone(),
            last_activity: self.last_activity,
            subscriptions: self.subscriptions.iter().cloned().collect(),
        }
    }
}

/// Transport-free view of a connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub client_id: String,
    pub status: ConnectionStatus,
    pub metadata: Value,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub disconnect_reason: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub total: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub subscriptions: usize,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Connection>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connected client. Returns `false` if the id is already connected.
    pub fn register_connection(
        &self,
        client_id: &str,
        transport: Arc<dyn ClientTransport>,
        metadata: Value,
    ) -> bool {
        let now = Utc::now();
        let connection = Connection {
            client_id: client_id.to_string(),
            status: ConnectionStatus::Connected,
            metadata,
            connected_at: now,
            disconnected_at: None,
            disconnect_reason: None,
            last_activity: now,
            subscriptions: BTreeSet::new(),
            transport,
        };

        match self.connections.entry(client_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if existing.get().status.is_connected() {
                    warn!(client_id = %client_id, "Client is already connected");
                    return false;
                }
                existing.insert(connection);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(connection);
            }
        }

        log_connection_operation("register_connection", client_id, "connected", None);
        true
    }

    /// Mark a connection disconnected. Returns `false` for unknown clients.
    pub fn handle_disconnection(&self, client_id: &str, reason: &str) -> bool {
        let Some(mut connection) = self.connections.get_mut(client_id) else {
            warn!(client_id = %client_id, "Attempted to handle disconnection for unknown client");
            return false;
        };

        let now = Utc::now();
        connection.status = ConnectionStatus::Disconnected;
        connection.disconnected_at = Some(now);
        connection.disconnect_reason = Some(reason.to_string());
        let connected_for_ms = (now - connection.connected_at).num_milliseconds();
        drop(connection);

        log_connection_operation(
            "handle_disconnection",
            client_id,
            "disconnected",
            Some(&format!("reason={reason} connected_for_ms={connected_for_ms}")),
        );
        true
    }

    pub fn get_connection_status(&self, client_id: &str) -> Option<ConnectionStatus> {
        self.connections.get(client_id).map(|c| c.status)
    }

    pub fn connection(&self, client_id: &str) -> Option<ConnectionSnapshot> {
        self.connections.get(client_id).map(|c| c.snapshot())
    }

    /// Add a task to the client's subscriptions (idempotent). `false` for unknown clients.
    pub fn subscribe(&self, client_id: &str, task_id: &str) -> bool {
        let Some(mut connection) = self.connections.get_mut(client_id) else {
            warn!(client_id = %client_id, task_id = %task_id, "Subscribe from unknown client");
            return false;
        };
        if connection.subscriptions.insert(task_id.to_string()) {
            debug!(client_id = %client_id, task_id = %task_id, "Subscribed");
        }
        connection.last_activity = Utc::now();
        true
    }

    /// Remove a task from the client's subscriptions (idempotent). `false` for unknown clients.
    pub fn unsubscribe(&self, client_id: &str, task_id: &str) -> bool {
        let Some(mut connection) = self.connections.get_mut(client_id) else {
            return false;
        };
        if connection.subscriptions.remove(task_id) {
            debug!(client_id = %client_id, task_id = %task_id, "Unsubscribed");
        }
        connection.last_activity = Utc::now();
        true
    }

    pub fn is_subscribed(&self, client_id: &str, task_id: &str) -> bool {
        self.connections
            .get(client_id)
            .is_some_and(|c| c.subscriptions.contains(task_id))
    }

    /// Connected clients subscribed to `task_id`, with their transports
    pub fn subscribers_for(&self, task_id: &str) -> Vec<(String, Arc<dyn ClientTransport>)> {
        let mut subscribers: Vec<(String, Arc<dyn ClientTransport>)> = self
            .connections
            .iter()
            .filter(|c| c.status.is_connected() && c.subscriptions.contains(task_id))
            .map(|c| (c.client_id.clone(), Arc::clone(&c.transport)))
            .collect();
        subscribers.sort_by(|a, b| a.0.cmp(&b.0));
        subscribers
    }

    /// Transport of a connected client; `None` once it has disconnected
    pub fn transport_for(&self, client_id: &str) -> Option<Arc<dyn ClientTransport>> {
        self.connections
            .get(client_id)
            .filter(|c| c.status.is_connected())
            .map(|c| Arc::clone(&c.transport))
    }

    pub fn update_activity(&self, client_id: &str) {
        if let Some(mut connection) = self.connections.get_mut(client_id) {
            connection.last_activity = Utc::now();
        }
    }

    pub fn active_connections(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .iter()
            .filter(|c| c.status.is_connected())
            .map(|c| c.snapshot())
            .collect()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.connections
            .iter()
            .fold(ConnectionStats::default(), |mut stats, c| {
                stats.total += 1;
                match c.status {
                    ConnectionStatus::Connected => stats.connected += 1,
                    ConnectionStatus::Disconnected => stats.disconnected += 1,
                }
                stats.subscriptions += c.subscriptions.len();
                stats
            })
    }

    /// Remove disconnected connections idle longer than `threshold`; returns their ids
    pub fn cleanup_inactive(&self, threshold: Duration) -> Vec<String> {
        let Some(cutoff) = chrono::Duration::from_std(threshold)
            .ok()
            .and_then(|threshold| Utc::now().checked_sub_signed(threshold))
        else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        self.connections.retain(|client_id, c| {
            let idle_since = c.disconnected_at.unwrap_or(c.last_activity).max(c.last_activity);
            let stale = !c.status.is_connected() && idle_since <= cutoff;
            if stale {
                removed.push(client_id.clone());
            }
            !stale
        });

        for client_id in &removed {
            log_connection_operation("cleanup_inactive", client_id, "removed", None);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
