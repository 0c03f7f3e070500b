use std::error::Error;
use std::fmt;
use std::sync::PoisonError;

#[derive(Debug)]
pub enum RelayError {
    // Client input errors
    InvalidInput(String),
    Precondition(String),
    NotFound(String),
    RateLimited,
    Oversize(usize),

    // Invite errors
    AllocationExhausted,

    // Backend errors
    Backend(String),

    // System errors
    ConfigError(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "{}", msg),
            Self::Precondition(msg) => write!(f, "{}", msg),
            Self::NotFound(msg) => write!(f, "{}", msg),
            Self::RateLimited => write!(f, "Too many messages"),
            Self::Oversize(size) => write!(f, "Message too large: {} bytes", size),
            Self::AllocationExhausted => write!(f, "Could not allocate an invite code"),
            Self::Backend(msg) => write!(f, "Backend error: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for RelayError {}

impl RelayError {
    /// The message surfaced to the client in an `error` event. Backend
    /// failures collapse to a generic message so internals never leak.
    pub fn client_message(&self) -> String {
        match self {
            Self::Backend(_) | Self::ConfigError(_) => {
                "Service temporarily unavailable".to_string()
            }
            Self::Oversize(_) => "Message too large".to_string(),
            other => other.to_string(),
        }
    }
}

// Converting from PoisonError to facilitate poisoned mutex handling
impl<T> From<PoisonError<T>> for RelayError {
    fn from(err: PoisonError<T>) -> Self {
        RelayError::Backend(format!("Mutex poisoned: {}", err))
    }
}

// Generic result type for the relay
pub type Result<T> = std::result::Result<T, RelayError>;
