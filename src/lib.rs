#![allow(clippy::doc_markdown)] // Allow technical terms like SQLite, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Progress Relay
//!
//! Durable, ordered delivery of long-running OCR task progress to connected
//! clients.
//!
//! ## Overview
//!
//! An OCR pipeline reports progress for its tasks; clients subscribe to the
//! tasks they care about and receive `progress`, `completed` and `error`
//! events as they happen. Clients that drop off briefly catch up on
//! reconnect: they subscribe again with the last event id they saw and get
//! everything after it as one `missed_events` batch.
//!
//! ## Architecture
//!
//! ```text
//! producer ──emit_*──▶ EventBroadcaster ──store_event──▶ EventLog (SQLite, capped)
//!                          │
//!                          ├──push──▶ subscribed connections (ConnectionRegistry)
//!                          └──failed push──▶ RecoveryBuffer ──retry driver──┘
//! ```
//!
//! ## Key Features
//!
//! - **Global ordering**: every event gets a strictly increasing sequence id,
//!   which is also the reconciliation cursor
//! - **Per-task FIFO**: one connection sees a task's events in storage order,
//!   across live pushes, reconciliation batches and retries
//! - **Bounded retention**: the log keeps the newest `max_events` events globally
//! - **Bounded retries**: failed pushes back off exponentially and are dropped
//!   after `max_attempts`
//!
//! ## Module Organization
//!
//! - [`events`] - Event model, event log and broadcaster
//! - [`registry`] - Task and connection registries
//! - [`resilience`] - Recovery buffer, backoff and delay queue
//! - [`messaging`] - Wire messages and client transports
//! - [`server`] - Composition and background workers
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use progress_relay::config::{EventLogConfig, RelayConfig};
//! use progress_relay::messaging::ClientMessage;
//! use progress_relay::registry::{TaskOptions, TaskUpdate};
//! use progress_relay::{ProgressServer, TaskStatus};
//!
//! # async fn example() -> progress_relay::RelayResult<()> {
//! let config = RelayConfig {
//!     event_log: EventLogConfig::in_memory(),
//!     ..RelayConfig::default()
//! };
//! let server = ProgressServer::new(config).await?;
//! server.start();
//!
//! let task_id = server.initialize_task(TaskOptions::new().with_filename("card.jpg"));
//! let mut inbox = server
//!     .connect_channel("client-1", serde_json::Value::Null)
//!     .expect("fresh client id");
//! server
//!     .handle_client_message(
//!         "client-1",
//!         ClientMessage::Subscribe { task_id: task_id.clone(), last_event_id: None },
//!     )
//!     .await?;
//!
//! server
//!     .report_progress(&task_id, TaskUpdate::new(50, TaskStatus::Processing, "Reading image"))
//!     .await?;
//! println!("{:?}", inbox.recv().await);
//!
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod logging;
pub mod messaging;
pub mod registry;
pub mod resilience;
pub mod server;

pub use config::RelayConfig;
pub use constants::{ConnectionStatus, TaskStatus};
pub use error::{RelayError, RelayResult};
pub use events::{Event, EventBroadcaster, EventId, EventLog, EventType};
pub use messaging::{ClientMessage, ClientTransport, ServerMessage};
pub use registry::{ConnectionRegistry, TaskRegistry};
pub use resilience::RecoveryBuffer;
pub use server::ProgressServer;
