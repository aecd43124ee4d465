//! # Resilience Module
//!
//! Recovery for pushes that fail on a live connection.
//!
//! ## Architecture
//!
//! - **RecoveryBuffer**: per-client queues of undeliverable events
//! - **BackoffPolicy**: exponential retry delays with a bounded attempt count
//! - **DelayQueue**: keyed deadline scheduler on tokio's clock, so tests can
//!   advance virtual time deterministically
//!
//! ## Usage
//!
//! ```rust,no_run
//! use progress_relay::config::RetryConfig;
//! use progress_relay::events::types::{Event, EventId, EventType};
//! use progress_relay::resilience::RecoveryBuffer;
//!
//! let buffer = RecoveryBuffer::new(&RetryConfig::default());
//! let event = Event {
//!     id: EventId(1),
//!     timestamp: 0,
//!     event_type: EventType::Progress,
//!     task_id: "task1".to_string(),
//!     data: serde_json::json!({"progress": 10, "status": "processing"}),
//! };
//! buffer.buffer_event("client-1", event);
//! assert_eq!(buffer.get_buffered_events_for_client("client-1").len(), 1);
//! ```

pub mod backoff;
pub mod delay_queue;
pub mod recovery_buffer;

pub use backoff::BackoffPolicy;
pub use delay_queue::DelayQueue;
pub use recovery_buffer::{BufferedEvent, DueRun, RecoveryBuffer, RecoveryStats, RetryOutcome};
