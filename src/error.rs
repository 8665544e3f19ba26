//! Error types for the Huddle client.

use thiserror::Error;

/// Errors that can occur when using the Huddle client.
#[derive(Debug, Error)]
pub enum HuddleError {
    /// Writing a frame to the realtime channel failed.
    #[error("could not send frame: {0}")]
    TransportSend(String),

    /// Reading from the realtime channel failed.
    #[error("could not receive frame: {0}")]
    TransportReceive(String),

    /// The realtime channel is already closed.
    #[error("realtime channel closed")]
    TransportClosed,

    /// A frame or REST body did not match the protocol types.
    #[error("invalid JSON payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The session loop has exited; the handle can no longer issue commands.
    #[error("session is not running")]
    NotConnected,

    /// A REST directory call failed.
    #[error("directory error: {message}")]
    Directory {
        /// HTTP status code, when the server answered at all.
        status: Option<u16>,
        /// Human-readable description of the failure.
        message: String,
    },

    /// A REST call or handshake ran past its deadline.
    #[error("request timed out")]
    Timeout,

    /// Socket or file I/O failed.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl HuddleError {
    /// Returns `true` if this is a directory error the server answered with
    /// `401 Unauthorized`.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Directory { status: Some(401), .. })
    }
}

/// A specialized [`Result`] type for Huddle client operations.
pub type Result<T> = std::result::Result<T, HuddleError>;
