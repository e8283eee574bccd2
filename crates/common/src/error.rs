//! Common error types for ChatRelay
//!
//! Errors fall in two classes: transport errors on the control connection,
//! which tear the connection down and trigger a reconnect, and everything
//! else, which fails at most the assignment being served.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Main error type for ChatRelay
#[derive(Error, Debug)]
pub enum ChatRelayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Control connection could not be established
    #[error("Connection error: {0}")]
    Connection(String),

    /// WebSocket protocol or transport errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Control connection closed by the peer
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// HTTP transport errors talking to the inference server
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Inference server answered with a non-success status
    #[error("Inference server returned {status}: {body}")]
    InferenceStatus { status: u16, body: String },

    /// Inference server reported an error inside the event stream
    #[error("Inference error: {0}")]
    Inference(String),

    /// Event stream could not be decoded
    #[error("Stream error: {0}")]
    Stream(String),

    /// Event payload did not match any known shape
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Event stream ended before a completion event
    #[error("Incomplete generation: {0}")]
    IncompleteGeneration(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio_util::codec::LinesCodecError> for ChatRelayError {
    fn from(err: tokio_util::codec::LinesCodecError) -> Self {
        ChatRelayError::Stream(err.to_string())
    }
}

impl ChatRelayError {
    /// Whether this error invalidates the control connection
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChatRelayError::Connection(_)
                | ChatRelayError::WebSocket(_)
                | ChatRelayError::ConnectionClosed(_)
                | ChatRelayError::Io(_)
        )
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ChatRelayError::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        ChatRelayError::Connection(msg.into())
    }

    /// Create a connection closed error
    pub fn closed(msg: impl Into<String>) -> Self {
        ChatRelayError::ConnectionClosed(msg.into())
    }

    /// Create a malformed event error
    pub fn malformed(msg: impl Into<String>) -> Self {
        ChatRelayError::MalformedEvent(msg.into())
    }

    /// Create an incomplete generation error
    pub fn incomplete(msg: impl Into<String>) -> Self {
        ChatRelayError::IncompleteGeneration(msg.into())
    }
}

/// Result type alias for ChatRelay operations
pub type Result<T> = std::result::Result<T, ChatRelayError>;
