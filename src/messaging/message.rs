//! # Wire Messages
//!
//! Client-to-server requests and server-to-client pushes for the progress
//! channel, plus the typed producer payloads stored as event data.

use crate::constants::TaskStatus;
use crate::error::RelayResult;
use crate::events::types::{Event, EventId, EventType};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Requests a client may send over its duplex channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        task_id: String,
        /// Last event id the client saw; accepted as a string or a number
        #[serde(
            default,
            deserialize_with = "deserialize_cursor",
            skip_serializing_if = "Option::is_none"
        )]
        last_event_id: Option<String>,
    },
    Unsubscribe {
        task_id: String,
    },
}

fn deserialize_cursor<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(cursor)) => Some(cursor),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

/// Messages pushed to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ProgressEvent {
        event_id: EventId,
        task_id: String,
        progress: u8,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    CompletedEvent {
        event_id: EventId,
        task_id: String,
        result: Value,
    },
    ErrorEvent {
        event_id: EventId,
        task_id: String,
        message: String,
        code: String,
        recoverable: bool,
    },
    /// Ordered reconciliation batch, sent once per subscribe-with-cursor
    MissedEvents {
        task_id: String,
        events: Vec<Event>,
        /// The cursor predates the oldest retained event; some history is gone
        data_unavailable: bool,
    },
    /// Request-level failure reported back to the client
    Error { message: String, code: String },
}

impl ServerMessage {
    /// Render a stored event as the live push for its type
    pub fn from_event(event: &Event) -> RelayResult<Self> {
        let message = match event.event_type {
            EventType::Progress => {
                let data: ProgressData = serde_json::from_value(event.data.clone())?;
                ServerMessage::ProgressEvent {
                    event_id: event.id,
                    task_id: event.task_id.clone(),
                    progress: data.progress,
                    status: data.status,
                    message: data.message,
                }
            }
            EventType::Completed => {
                let data: CompletedData = serde_json::from_value(event.data.clone())?;
                ServerMessage::CompletedEvent {
                    event_id: event.id,
                    task_id: event.task_id.clone(),
                    result: data.result,
                }
            }
            EventType::Error => {
                let data: ErrorData = serde_json::from_value(event.data.clone())?;
                ServerMessage::ErrorEvent {
                    event_id: event.id,
                    task_id: event.task_id.clone(),
                    message: data.message,
                    code: data.code,
                    recoverable: data.recoverable,
                }
            }
        };
        Ok(message)
    }

    /// Task the message concerns, if any
    pub fn task_id(&self) -> Option<&str> {
        match self {
            ServerMessage::ProgressEvent { task_id, .. }
            | ServerMessage::CompletedEvent { task_id, .. }
            | ServerMessage::ErrorEvent { task_id, .. }
            | ServerMessage::MissedEvents { task_id, .. } => Some(task_id),
            ServerMessage::Error { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    pub progress: u8,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressData {
    pub fn new(progress: u8, status: TaskStatus, message: impl Into<String>) -> Self {
        Self {
            progress: progress.min(100),
            status,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedData {
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
    pub code: String,
    #[serde(default)]
    pub recoverable: bool,
}
