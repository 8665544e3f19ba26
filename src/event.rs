//! Events delivered from the session loop to the host.

use uuid::Uuid;

use crate::connection::{ConnectionState, DisconnectReason};
use crate::failure::FailureKind;
use crate::protocol::{ChatMessage, Group, GroupId, User};

/// What a [`Notice`] is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// Someone joined or left the active group.
    Presence,
    /// Something failed.
    Failure(FailureKind),
}

/// A transient, dismissible message for the user.
///
/// Notices never carry state: dismissing one changes nothing but the
/// snapshot's `last_notice`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: Uuid,
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
        }
    }

    /// Returns the failure kind, if this notice reports a failure.
    pub fn failure(&self) -> Option<FailureKind> {
        match self.kind {
            NoticeKind::Failure(kind) => Some(kind),
            NoticeKind::Presence => None,
        }
    }
}

/// Events emitted by [`HuddleSession`](crate::HuddleSession).
#[derive(Debug, Clone, PartialEq)]
pub enum HuddleEvent {
    /// The connection state machine moved to a new state.
    ConnectionStateChanged { state: ConnectionState },
    /// The server confirmed our identity.
    Authenticated { user: User },
    /// The group list changed (bootstrap load, creation, or broadcast).
    GroupsChanged { groups: Vec<Group> },
    /// A different group became active; its transcript is being loaded.
    ActiveGroupChanged { group_id: GroupId },
    /// History for the active group replaced the transcript.
    TranscriptLoaded {
        group_id: GroupId,
        message_count: usize,
    },
    /// A message was appended to the active transcript.
    MessageReceived {
        group_id: GroupId,
        message: ChatMessage,
    },
    /// A background group's unread counter changed.
    UnreadChanged { group_id: GroupId, count: u32 },
    /// The server acknowledged a sent message.
    MessageSent { group_id: GroupId },
    /// A create/join completed on both the REST and the realtime side.
    RoomJoined { group_id: GroupId },
    /// A transient notice for the user.
    Notice(Notice),
    /// The transport went away.
    Disconnected { reason: DisconnectReason },
    /// Credentials are gone; the host should show its login flow.
    ///
    /// Always delivered, even when the event channel is congested.
    RedirectToLogin,
}
