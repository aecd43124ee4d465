//! # Registries
//!
//! In-memory state for the two kinds of live entity the relay tracks.
//!
//! ## Available Registries
//!
//! - **TaskRegistry**: OCR task status, progress, step history and errors
//! - **ConnectionRegistry**: client connections, their status and task subscriptions
//!
//! Both are keyed by id in a `DashMap`, so operations on different entities do
//! not contend and operations on one entity are serialized by its shard lock.

pub mod connection_registry;
pub mod task_registry;

pub use connection_registry::{
    Connection, ConnectionRegistry, ConnectionSnapshot, ConnectionStats,
};
pub use task_registry::{Task, TaskErrorRecord, TaskOptions, TaskRegistry, TaskStep, TaskUpdate};
