//! # System Constants
//!
//! Core constants and status enums that define the operational boundaries of
//! the progress relay: log capacity, retry limits, and the task and connection
//! lifecycle states shared by the registries and the wire protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of events retained globally by the event log
pub const MAX_EVENTS: usize = 1000;

/// Failed redelivery attempts after which a buffered event is dropped
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Maximum number of buffered events held per client
pub const MAX_BUFFERED_EVENTS_PER_CLIENT: usize = 1000;

/// Backoff base and ceiling for buffered redelivery (1s, 2s, 4s, 8s, 16s)
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const RETRY_MAX_DELAY_MS: u64 = 16_000;

/// Tasks with no update for this long are failed by the sweeper
pub const TASK_TIMEOUT_SECS: u64 = 300;

/// Finished tasks are kept this long before they are purged
pub const TASK_RETENTION_SECS: u64 = 3_600;

/// Well-known error codes attached to error events
pub mod error_codes {
    pub const TASK_TIMEOUT: &str = "TASK_TIMEOUT";
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
    pub const FETCH_EVENTS_ERROR: &str = "FETCH_EVENTS_ERROR";
}

/// Disconnect reasons with special handling
pub mod disconnect_reasons {
    /// The client closed the session on purpose; its buffered events are dropped
    pub const CLIENT_TERMINATED: &str = "client_terminated";
    pub const SERVER_TERMINATED: &str = "server_terminated";
    pub const TRANSPORT_CLOSED: &str = "transport_closed";
}

/// Lifecycle status of a tracked OCR task.
///
/// Transitions are not validated: any status may overwrite any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Initialized,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Check if the task has reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(Self::Initialized),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// Connection lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}
