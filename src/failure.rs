//! Failure taxonomy for the Huddle session.
//!
//! Every failure the session can observe is classified into a [`FailureKind`].
//! The kind decides whether the failure is retried, whether it invalidates the
//! stored credentials, and which notice text the host is shown.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failure observed by the session.
///
/// Kinds serialize as `SCREAMING_SNAKE_CASE` strings (e.g. `"SEND_FAILURE"`)
/// so hosts can persist or forward them unchanged.
///
/// Use [`description()`](FailureKind::description) for a human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    // Credential and authentication failures
    MalformedCredential,
    AuthRejectedRetryable,
    AuthRejectedFatal,
    BootstrapFailure,

    // Connection failures
    TransportFailure,
    ServerInitiatedDrop,

    // Room and messaging failures
    HistoryFetchFailure,
    SendFailure,
    GroupCreateFailure,
    GroupJoinFailure,
}

impl FailureKind {
    /// Returns `true` if an escalated failure of this kind clears the stored
    /// token and sends the host back to the login flow.
    pub fn invalidates_credentials(&self) -> bool {
        matches!(
            self,
            Self::MalformedCredential
                | Self::AuthRejectedRetryable
                | Self::AuthRejectedFatal
                | Self::BootstrapFailure
        )
    }

    /// Returns `true` if the failure only produces a dismissible notice and
    /// leaves the connection and room state as it was.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::HistoryFetchFailure
                | Self::SendFailure
                | Self::GroupCreateFailure
                | Self::GroupJoinFailure
        )
    }

    /// Returns a human-readable description of this failure kind.
    pub fn description(&self) -> &'static str {
        match self {
            Self::MalformedCredential => {
                "The stored token is missing or malformed. Please sign in again."
            }
            Self::AuthRejectedRetryable => {
                "The server could not authenticate this session. Please sign in again."
            }
            Self::AuthRejectedFatal => "The server rejected this session. Please sign in again.",
            Self::BootstrapFailure => {
                "The session could not load the user profile or group list. Please sign in again."
            }
            Self::TransportFailure => {
                "The connection to the server failed and automatic reconnection gave up."
            }
            Self::ServerInitiatedDrop => {
                "The server closed the connection. Reconnecting automatically."
            }
            Self::HistoryFetchFailure => "Failed to load messages for this group.",
            Self::SendFailure => "Failed to send the message. Your text has been kept.",
            Self::GroupCreateFailure => "Failed to create the group.",
            Self::GroupJoinFailure => "Failed to join the group.",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
