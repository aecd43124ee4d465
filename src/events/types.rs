//! Event data model shared by the log, the broadcaster and the wire protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Global sequence id assigned by the event log; doubles as the reconciliation cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl EventId {
    pub fn sequence(&self) -> i64 {
        self.0
    }

    /// Parse a client-supplied cursor. Empty or malformed cursors yield `None`,
    /// which reconciliation treats as "replay everything retained".
    pub fn parse_cursor(cursor: &str) -> Option<EventId> {
        cursor.trim().parse::<i64>().ok().map(EventId)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(sequence: i64) -> Self {
        EventId(sequence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Progress,
    Completed,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "progress" => Ok(Self::Progress),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid event type: {s}")),
        }
    }
}

/// An event before the log has sequenced it
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub task_id: String,
    pub data: Value,
}

impl NewEvent {
    pub fn new(event_type: EventType, task_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_type,
            task_id: task_id.into(),
            data,
        }
    }
}

/// Immutable, sequenced record as stored in the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub task_id: String,
    pub data: Value,
}
