//! Error types for the broker client

use thiserror::Error;

/// How the scheduler should react to a broker failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// Credentials rejected; the account needs operator attention
    Authorization,
    /// The call itself was malformed; retrying the same call will not help
    BadRequest,
    /// Network, timeout or remote server trouble; retry on the next cycle
    Transient,
    /// The broker answered with a payload we could not interpret
    Malformed,
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Unauthorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Broker server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Request timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed broker response for {context}: {message}")]
    Malformed { context: String, message: String, payload: Option<String> },

    #[error("Invalid credentials: {message}")]
    Credentials { message: String },
}

impl BrokerError {
    /// Classify the failure
    pub fn kind(&self) -> BrokerErrorKind {
        match self {
            BrokerError::Unauthorized { .. } | BrokerError::Credentials { .. } => {
                BrokerErrorKind::Authorization
            }
            BrokerError::BadRequest { .. } => BrokerErrorKind::BadRequest,
            BrokerError::Server { .. } | BrokerError::Timeout { .. } => BrokerErrorKind::Transient,
            BrokerError::Http(e) if e.is_decode() => BrokerErrorKind::Malformed,
            BrokerError::Http(_) => BrokerErrorKind::Transient,
            BrokerError::Malformed { .. } => BrokerErrorKind::Malformed,
        }
    }

    /// Map a non-success HTTP status onto the error taxonomy
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => BrokerError::Unauthorized { status, message: body },
            400 | 404 | 422 => BrokerError::BadRequest { message: format!("{} - {}", status, body) },
            _ => BrokerError::Server { status, message: body },
        }
    }

    pub fn malformed(context: impl Into<String>, message: impl Into<String>) -> Self {
        BrokerError::Malformed { context: context.into(), message: message.into(), payload: None }
    }

    pub fn is_authorization(&self) -> bool {
        self.kind() == BrokerErrorKind::Authorization
    }
}
