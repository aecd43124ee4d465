//! # Events
//!
//! The durable event log, the event data model and the broadcaster that fans
//! stored events out to subscribed connections.

pub mod broadcaster;
pub mod event_log;
pub mod types;

// Re-export key types for convenience
pub use broadcaster::{EventBroadcaster, RetrySummary};
pub use event_log::EventLog;
pub use types::{Event, EventId, EventType, NewEvent};
