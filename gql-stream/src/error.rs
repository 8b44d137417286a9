//! Error types for the gql-stream crate.

use socket_channel::ChannelError;

/// Errors surfaced by subscription setup and configuration.
///
/// Failures while a subscription is running are not returned to the caller;
/// they end the session and show up in its state and outcome.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The underlying channel failed
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A frame could not be encoded or decoded
    #[error("Encode error: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for SubscriptionError {
    fn from(err: serde_json::Error) -> Self {
        SubscriptionError::Encode(err.to_string())
    }
}

/// Error type returned by event callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by event callbacks.
pub type CallbackResult = std::result::Result<(), CallbackError>;

/// Convenience type alias for Results using SubscriptionError.
pub type Result<T> = std::result::Result<T, SubscriptionError>;
