#![allow(dead_code)]

pub mod strategies;

use progress_relay::config::{EventLogConfig, RelayConfig};
use progress_relay::messaging::{ProgressData, ServerMessage};
use progress_relay::{ProgressServer, TaskStatus};
use tokio::sync::mpsc;

/// Server over an in-memory event log with the given retention cap
pub async fn test_server(max_events: usize) -> ProgressServer {
    progress_relay::logging::init_structured_logging();
    let config = RelayConfig {
        event_log: EventLogConfig {
            max_events,
            ..EventLogConfig::in_memory()
        },
        ..RelayConfig::default()
    };
    ProgressServer::new(config)
        .await
        .expect("in-memory server should open")
}

pub fn progress(value: u8, message: &str) -> ProgressData {
    ProgressData::new(value, TaskStatus::Processing, message)
}

/// Everything currently queued on a client channel
pub fn drain(receiver: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = receiver.try_recv() {
        messages.push(message);
    }
    messages
}

/// Task ids of the live pushes in `messages`, ignoring reconciliation batches
pub fn live_task_ids(messages: &[ServerMessage]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| !matches!(m, ServerMessage::MissedEvents { .. }))
        .filter_map(|m| m.task_id().map(str::to_string))
        .collect()
}
