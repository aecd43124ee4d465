//! # Messaging Module
//!
//! The transport-agnostic client protocol: request/push message formats and
//! the `ClientTransport` seam connections are registered with.

pub mod errors;
pub mod message;
pub mod transport;

pub use errors::TransportError;
pub use message::{ClientMessage, CompletedData, ErrorData, ProgressData, ServerMessage};
pub use transport::{ChannelTransport, ClientTransport, JsonLinesTransport};
