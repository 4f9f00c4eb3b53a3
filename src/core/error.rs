//! Error types for the MCP transport bridge
//!
//! Module defines all error kinds that can surface from the bridge engine
//! and its transports, providing structured error handling with context.

use thiserror::Error;

/// The main error type for the bridge
///
/// Variants map one-to-one onto the failure kinds the bridge distinguishes:
/// configuration problems are surfaced from construction, transport faults
/// are routed through the `on_transport_error` callback.
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// A required configuration key is missing or malformed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unknown transport kind requested
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Underlying transport could not be constructed
    #[error("Transport creation failed: {0}")]
    TransportCreate(String),

    /// Error observed on an inbound stream or during send
    #[error("Transport I/O error: {0}")]
    TransportIo(String),

    /// Send invoked after the transport closed
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// Bounded reconnection attempts hit the ceiling
    #[error("Reconnection attempts exhausted: {0}")]
    ReconnectExhausted(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors from the standard library
    #[error("I/O error: {0}")]
    Io(String),

    /// HTTP-level errors from the SSE transports
    #[error("HTTP error: {0}")]
    Http(String),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(String),
}

// Manual From implementations for types that don't implement Clone
impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

impl From<url::ParseError> for BridgeError {
    fn from(err: url::ParseError) -> Self {
        BridgeError::Url(err.to_string())
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        BridgeError::Http(err.to_string())
    }
}

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Create a new invalid-configuration error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a new unsupported-transport error
    pub fn unsupported_transport<S: Into<String>>(kind: S) -> Self {
        Self::UnsupportedTransport(kind.into())
    }

    /// Create a new transport-creation error
    pub fn transport_create<S: Into<String>>(message: S) -> Self {
        Self::TransportCreate(message.into())
    }

    /// Create a new transport I/O error
    pub fn transport_io<S: Into<String>>(message: S) -> Self {
        Self::TransportIo(message.into())
    }

    /// Create a new transport-closed error
    pub fn transport_closed<S: Into<String>>(message: S) -> Self {
        Self::TransportClosed(message.into())
    }

    /// Create a new reconnect-exhausted error
    pub fn reconnect_exhausted<S: Into<String>>(message: S) -> Self {
        Self::ReconnectExhausted(message.into())
    }

    /// Check if this error is recoverable by retrying
    pub fn is_recoverable(&self) -> bool {
        match self {
            BridgeError::InvalidConfig(_) => false,
            BridgeError::UnsupportedTransport(_) => false,
            BridgeError::TransportCreate(_) => true,
            BridgeError::TransportIo(_) => true,
            BridgeError::TransportClosed(_) => false,
            BridgeError::ReconnectExhausted(_) => false,
            BridgeError::Serialization(_) => false,
            BridgeError::Io(_) => true,
            BridgeError::Http(_) => true,
            BridgeError::Url(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            BridgeError::InvalidConfig(_) => "config",
            BridgeError::UnsupportedTransport(_) => "config",
            BridgeError::TransportCreate(_) => "transport_create",
            BridgeError::TransportIo(_) => "transport_io",
            BridgeError::TransportClosed(_) => "transport_closed",
            BridgeError::ReconnectExhausted(_) => "reconnect",
            BridgeError::Serialization(_) => "serialization",
            BridgeError::Io(_) => "io",
            BridgeError::Http(_) => "http",
            BridgeError::Url(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = BridgeError::transport_create("bind refused");
        assert_eq!(error.to_string(), "Transport creation failed: bind refused");
        assert_eq!(error.category(), "transport_create");
        assert!(error.is_recoverable());
    }

    #[test]
    fn test_error_recovery() {
        assert!(BridgeError::transport_io("broken pipe").is_recoverable());
        assert!(!BridgeError::invalid_config("missing command").is_recoverable());
        assert!(!BridgeError::transport_closed("send after close").is_recoverable());
        assert!(!BridgeError::reconnect_exhausted("3 attempts").is_recoverable());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            BridgeError::unsupported_transport("grpc").category(),
            "config"
        );
        assert_eq!(
            BridgeError::transport_closed("closed").category(),
            "transport_closed"
        );
        assert_eq!(
            BridgeError::reconnect_exhausted("cap hit").category(),
            "reconnect"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let error: BridgeError = io.into();
        assert!(matches!(error, BridgeError::Io(_)));
        assert!(error.to_string().contains("pipe gone"));
    }
}
