use std::time::Duration;

use crate::packet::CorrelationId;

/// Reason a connection to the cloud node went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly shutdown requested by either side
    Normal,
    /// Peer stopped answering
    Timeout,
    /// Transport failure
    Error(String),
    /// Torn down without a handshake
    Forced,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Normal => write!(f, "normal"),
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::Error(reason) => write!(f, "error: {}", reason),
            CloseReason::Forced => write!(f, "forced"),
        }
    }
}

/// Failures reported by the transport collaborator
#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    /// Connection related failure
    #[error("Connection error: {reason} (retryable: {retryable})")]
    Connection {
        reason: String,
        retryable: bool,
    },

    /// Peer violated the frame protocol
    #[error("Protocol error ({protocol}): {reason}")]
    Protocol {
        protocol: String,
        reason: String,
    },

    /// Transport was configured with unusable values
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration {
        field: String,
        reason: String,
    },

    /// Operation did not finish in time
    #[error("Operation '{operation}' timeout after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },
}

impl TransportError {
    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection { retryable, .. } => *retryable,
            TransportError::Protocol { .. } => true,
            TransportError::Configuration { .. } => false,
            TransportError::Timeout { .. } => true,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::Connection { .. } => "CONNECTION_ERROR",
            TransportError::Protocol { .. } => "PROTOCOL_ERROR",
            TransportError::Configuration { .. } => "CONFIG_ERROR",
            TransportError::Timeout { .. } => "TIMEOUT_ERROR",
        }
    }

    pub fn connection_error(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn protocol_error(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }

    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        let retryable = matches!(
            error.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
        );

        TransportError::Connection {
            reason: format!("IO error: {}", error),
            retryable,
        }
    }
}

/// Errors surfaced by the client API
///
/// Validation failures are returned synchronously from the call that caused
/// them. Everything that happens after a request left the client (remote
/// failures, timeouts, the connection closing underneath an invocation) is
/// delivered through the returned future instead.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ClientError {
    /// A required argument was missing
    #[error("Required argument '{argument}' is missing")]
    NullArgument { argument: &'static str },

    /// Operation attempted at or after close
    #[error("Connection has been closed")]
    ConnectionClosed,

    /// Message type does not declare a usable channel or service name
    #[error("Invalid message type {type_name}: {reason}")]
    InvalidMessageType {
        type_name: &'static str,
        reason: String,
    },

    /// A callback is already registered for the service on this client
    #[error("Service '{service}' is already registered")]
    DuplicateRegistration { service: String },

    /// Target has no registration for the invoked service
    #[error("Service '{service}' not found")]
    ServiceNotFound { service: String },

    /// The remote callback reported a failure
    #[error("Remote invocation of '{service}' failed: {message}")]
    Remote { service: String, message: String },

    /// No outcome within the allotted window
    #[error("Operation '{operation}' timeout after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// The connection dropped while the operation was in flight
    #[error("Disconnected: {reason}")]
    Disconnected { reason: String },

    /// A pending invocation was resolved more than once
    #[error("Invocation {correlation_id} already resolved")]
    AlreadyResolved { correlation_id: CorrelationId },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error in field '{field}': {reason}")]
    Configuration { field: String, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout { .. } | ClientError::Transport(TransportError::Timeout { .. })
        )
    }

    /// Whether the failure was caused by losing the connection rather than by the peer
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionClosed
                | ClientError::Disconnected { .. }
                | ClientError::Transport(TransportError::Connection { .. })
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ClientError::NullArgument { .. } => "NULL_ARGUMENT",
            ClientError::ConnectionClosed => "CONNECTION_CLOSED",
            ClientError::InvalidMessageType { .. } => "INVALID_MESSAGE_TYPE",
            ClientError::DuplicateRegistration { .. } => "DUPLICATE_REGISTRATION",
            ClientError::ServiceNotFound { .. } => "SERVICE_NOT_FOUND",
            ClientError::Remote { .. } => "REMOTE_ERROR",
            ClientError::Timeout { .. } => "TIMEOUT_ERROR",
            ClientError::Disconnected { .. } => "DISCONNECTED",
            ClientError::AlreadyResolved { .. } => "ALREADY_RESOLVED",
            ClientError::Serialization(_) => "SERIALIZATION_ERROR",
            ClientError::Configuration { .. } => "CONFIG_ERROR",
            ClientError::Transport(e) => e.error_code(),
        }
    }

    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(error: serde_json::Error) -> Self {
        ClientError::Serialization(error.to_string())
    }
}
