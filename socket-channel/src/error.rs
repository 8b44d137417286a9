//! Error types for the socket-channel crate.

/// Errors raised by channel providers and open channels.
///
/// Every variant carries a rendered message rather than the source error so
/// the type stays `Clone` and can be broadcast to several readers of a shared
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The endpoint could not be parsed or uses an unsupported scheme
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The connection could not be established
    #[error("Connection failed: {0}")]
    Connect(String),

    /// An outbound frame could not be written
    #[error("Send failed: {0}")]
    Send(String),

    /// The transport reported an error while reading
    #[error("Transport error: {0}")]
    Transport(String),

    /// The channel was already closed
    #[error("Channel closed")]
    Closed,

    /// An outbound value could not be encoded
    #[error("Encode failed: {0}")]
    Encode(String),

    /// An operation did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Encode(err.to_string())
    }
}

/// Convenience type alias for Results using ChannelError.
pub type Result<T> = std::result::Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_display() {
        let error = ChannelError::InvalidEndpoint("http://localhost".to_string());
        assert_eq!(error.to_string(), "Invalid endpoint: http://localhost");

        let error = ChannelError::Connect("connection refused".to_string());
        assert_eq!(error.to_string(), "Connection failed: connection refused");

        let error = ChannelError::Send("broken pipe".to_string());
        assert_eq!(error.to_string(), "Send failed: broken pipe");

        let error = ChannelError::Transport("reset by peer".to_string());
        assert_eq!(error.to_string(), "Transport error: reset by peer");

        assert_eq!(ChannelError::Closed.to_string(), "Channel closed");

        let error = ChannelError::Timeout("open".to_string());
        assert_eq!(error.to_string(), "Timed out: open");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: ChannelError = json_error.into();
        assert!(matches!(error, ChannelError::Encode(_)));
    }
}
