use thiserror::Error;

/// Substrings that mark a remote failure as transient.
const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "connection refused",
    "connection reset",
    "temporary failure",
    "rate limit",
    "502",
    "503",
    "504",
];

/// Substrings that mark a remote failure as an authorization problem.
const CREDENTIAL_PATTERNS: &[&str] = &[
    "401",
    "Invalid Credentials",
    "invalid_grant",
    "Token has been expired or revoked",
];

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Remote credentials rejected: {0}")]
    CredentialsInvalid(String),

    #[error("Change cursor rejected: {0}")]
    InvalidCursor(String),

    #[error("Remote call timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Remote resource not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether retrying the same call may succeed.
    ///
    /// Timeouts, connection failures, rate limiting and gateway errors
    /// (502/503/504) are transient. Opaque `OperationFailed` messages are
    /// classified by their text.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Timeout(_) | BridgeError::Connection(_) | BridgeError::RateLimited(_) => {
                true
            }
            BridgeError::Http { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            BridgeError::OperationFailed(message) => is_retryable_message(message),
            BridgeError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// Whether the failure means the stored remote credentials are no longer
    /// usable. Such failures must not be retried.
    pub fn is_credential_error(&self) -> bool {
        match self {
            BridgeError::CredentialsInvalid(_) => true,
            BridgeError::Http { status: 401, .. } => true,
            BridgeError::Http { message, .. } | BridgeError::OperationFailed(message) => {
                CREDENTIAL_PATTERNS.iter().any(|p| message.contains(p))
            }
            _ => false,
        }
    }

    /// Whether the remote store rejected a change cursor.
    pub fn is_invalid_cursor(&self) -> bool {
        matches!(self, BridgeError::InvalidCursor(_))
    }
}

/// Classify a free-form error message as transient.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

pub type Result<T> = std::result::Result<T, BridgeError>;
