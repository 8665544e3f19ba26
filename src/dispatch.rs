//! Outbound request correlation.
//!
//! Every acknowledged request gets a fresh [`AckId`]. The [`Dispatcher`] keeps
//! what each id was for until it is resolved by an ack, expired by a timer, or
//! dropped with the transport. Removal is the only way out of the table, so
//! each request resolves exactly once.

use std::collections::HashMap;

use tracing::debug;

use crate::protocol::{AckId, ClientFrame, ClientMessage, GroupId};

/// What an outstanding acknowledged request was for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRequest {
    Authenticate,
    Send { group_id: GroupId, content: String },
    Join { group_id: GroupId },
}

/// Result of submitting a chat message for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing to send: the group or the trimmed content is empty.
    Skipped,
    /// A frame is ready to go out under `ack_id`.
    Ready { ack_id: AckId, frame: ClientFrame },
}

/// How an outstanding request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub request: PendingRequest,
    pub success: bool,
    pub error: Option<String>,
}

/// Correlation table for acknowledged requests.
#[derive(Debug, Default)]
pub struct Dispatcher {
    next_ack: AckId,
    pending: HashMap<AckId, PendingRequest>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an acknowledged `group_message` frame.
    ///
    /// Content is sent as typed. An empty group, or content that is empty
    /// once trimmed, is skipped without consuming an id. The message is not
    /// added to any transcript: the server echo is the only source of truth.
    pub fn prepare_send(&mut self, group_id: &str, content: &str) -> SendOutcome {
        if group_id.is_empty() || content.trim().is_empty() {
            debug!(group_id, "send skipped: nothing to send");
            return SendOutcome::Skipped;
        }
        let message = ClientMessage::GroupMessage {
            group_id: group_id.to_owned(),
            content: content.to_owned(),
        };
        let (ack_id, frame) = self.request(
            PendingRequest::Send {
                group_id: group_id.to_owned(),
                content: content.to_owned(),
            },
            message,
        );
        SendOutcome::Ready { ack_id, frame }
    }

    /// Register `request` and wrap `message` in a frame carrying its ack id.
    pub fn request(
        &mut self,
        request: PendingRequest,
        message: ClientMessage,
    ) -> (AckId, ClientFrame) {
        self.next_ack += 1;
        let ack_id = self.next_ack;
        self.pending.insert(ack_id, request);
        (ack_id, ClientFrame::acknowledged(ack_id, message))
    }

    /// Resolve `ack_id` from a server ack. A positive ack requires
    /// `success == Some(true)`.
    ///
    /// Returns `None` for ids that are unknown or already resolved.
    pub fn resolve(
        &mut self,
        ack_id: AckId,
        success: Option<bool>,
        error: Option<String>,
    ) -> Option<Resolution> {
        let Some(request) = self.pending.remove(&ack_id) else {
            debug!(ack_id, "ack for unknown or settled request");
            return None;
        };
        Some(Resolution {
            request,
            success: success == Some(true),
            error,
        })
    }

    /// Give up on `ack_id` after its timeout elapsed.
    pub fn expire(&mut self, ack_id: AckId) -> Option<Resolution> {
        let request = self.pending.remove(&ack_id)?;
        debug!(ack_id, "request expired");
        Some(Resolution {
            request,
            success: false,
            error: Some("no acknowledgement received".into()),
        })
    }

    /// Drop every outstanding request and return them.
    ///
    /// Used when the transport is replaced, since acks never cross
    /// connections.
    pub fn drain(&mut self) -> Vec<(AckId, PendingRequest)> {
        let mut drained: Vec<_> = self.pending.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    pub fn is_pending(&self, ack_id: AckId) -> bool {
        self.pending.contains_key(&ack_id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn empty_content_is_skipped() {
        let mut dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.prepare_send("g1", "   \n"), SendOutcome::Skipped);
        assert_eq!(dispatcher.prepare_send("", "hello"), SendOutcome::Skipped);
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[test]
    fn content_is_sent_as_typed() {
        let mut dispatcher = Dispatcher::new();
        let SendOutcome::Ready { ack_id, frame } = dispatcher.prepare_send("g1", "  hi  ") else {
            panic!("expected a frame");
        };
        assert_eq!(frame.ack_id, Some(ack_id));
        assert_eq!(
            frame.message,
            ClientMessage::GroupMessage {
                group_id: "g1".into(),
                content: "  hi  ".into(),
            }
        );
        assert!(dispatcher.is_pending(ack_id));
    }

    #[test]
    fn ack_ids_are_unique() {
        let mut dispatcher = Dispatcher::new();
        let (a, _) = dispatcher.request(
            PendingRequest::Authenticate,
            ClientMessage::Authenticate {
                token: "a.b.c".into(),
            },
        );
        let (b, _) = dispatcher.request(
            PendingRequest::Join {
                group_id: "g1".into(),
            },
            ClientMessage::JoinGroup {
                group_id: "g1".into(),
            },
        );
        assert_ne!(a, b);
        assert_eq!(dispatcher.pending_len(), 2);
    }

    #[test]
    fn resolves_exactly_once() {
        let mut dispatcher = Dispatcher::new();
        let SendOutcome::Ready { ack_id, .. } = dispatcher.prepare_send("g1", "hi") else {
            panic!("expected a frame");
        };
        let first = dispatcher.resolve(ack_id, Some(true), None).unwrap();
        assert!(first.success);
        assert!(dispatcher.resolve(ack_id, Some(true), None).is_none());
        assert!(dispatcher.expire(ack_id).is_none());
    }

    #[test]
    fn timeout_then_late_ack_resolves_once() {
        let mut dispatcher = Dispatcher::new();
        let SendOutcome::Ready { ack_id, .. } = dispatcher.prepare_send("g1", "hi") else {
            panic!("expected a frame");
        };
        let expired = dispatcher.expire(ack_id).unwrap();
        assert!(!expired.success);
        assert!(dispatcher.resolve(ack_id, Some(true), None).is_none());
    }

    #[test]
    fn missing_success_flag_is_negative() {
        let mut dispatcher = Dispatcher::new();
        let SendOutcome::Ready { ack_id, .. } = dispatcher.prepare_send("g1", "hi") else {
            panic!("expected a frame");
        };
        let resolution = dispatcher
            .resolve(ack_id, None, Some("rate limited".into()))
            .unwrap();
        assert!(!resolution.success);
        assert_eq!(resolution.error.as_deref(), Some("rate limited"));
    }

    #[test]
    fn drain_empties_table_in_id_order() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.prepare_send("g1", "one");
        dispatcher.prepare_send("g1", "two");
        let drained = dispatcher.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained[0].0 < drained[1].0);
        assert_eq!(dispatcher.pending_len(), 0);
    }
}
