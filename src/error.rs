//! Error types for the progress relay.
//!

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RelayError {
    /// The event log could not durably record (or read) an event.
    #[error("Persistence error: {0}")]
    PersistenceError(String),
    /// A push to one connection failed; recovered through the retry buffer.
    #[error("Transient delivery error for client {client_id}: {reason}")]
    TransientDeliveryError { client_id: String, reason: String },
    /// A buffered event ran out of redelivery attempts and was dropped.
    #[error("Retry exhausted for event {event_id} to client {client_id} after {attempts} attempts")]
    RetryExhaustedError {
        event_id: i64,
        client_id: String,
        attempts: u32,
    },
    #[error("Unknown task: {0}")]
    UnknownTask(String),
    #[error("Unknown client: {0}")]
    UnknownClient(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for RelayError {
    fn from(err: sqlx::Error) -> Self {
        RelayError::PersistenceError(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(error: serde_json::Error) -> Self {
        RelayError::SerializationError(format!("JSON serialization error: {error}"))
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(error: config::ConfigError) -> Self {
        RelayError::ConfigurationError(error.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = RelayError::RetryExhaustedError {
            event_id: 42,
            client_id: "client-1".to_string(),
            attempts: 5,
        };
        assert_eq!(
            err.to_string(),
            "Retry exhausted for event 42 to client client-1 after 5 attempts"
        );

        let err = RelayError::PersistenceError("disk full".to_string());
        assert_eq!(err.to_string(), "Persistence error: disk full");
    }

    #[test]
    fn test_json_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: RelayError = parse_err.into();
        assert!(matches!(err, RelayError::SerializationError(_)));
    }
}
