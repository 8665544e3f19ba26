//! Room multiplexing: which group is active, its transcript, and the unread
//! counters of every other group.
//!
//! [`RoomState::reduce`] is a pure reducer. Routing decisions are made against
//! the state at the moment an event is reduced, never against state captured
//! when the triggering request was issued: an inbound message tagged with a
//! group that is no longer active counts as unread, and a history response for
//! a group the user already left is dropped.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::event::NoticeKind;
use crate::failure::FailureKind;
use crate::protocol::{ChatMessage, Group, GroupId};

/// Inputs to the room reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// The bootstrap group list arrived.
    GroupsLoaded(Vec<Group>),
    /// The host wants `group` to become active.
    ///
    /// `established` is whether the connection is authenticated at this
    /// moment. `confirm_join` requests an acknowledged join.
    Activate {
        group: Group,
        established: bool,
        confirm_join: bool,
    },
    /// History for `request` arrived.
    HistoryLoaded {
        group_id: GroupId,
        request: u64,
        messages: Vec<ChatMessage>,
    },
    /// History for `request` could not be fetched.
    HistoryFailed {
        group_id: GroupId,
        request: u64,
        reason: String,
    },
    /// `new_group_message` arrived.
    MessageReceived {
        group_id: GroupId,
        message: ChatMessage,
    },
    /// `user_joined` arrived.
    UserJoined { group_id: GroupId },
    /// `user_left` arrived.
    UserLeft { group_id: GroupId },
    /// A group was created, by anyone.
    GroupAnnounced(Group),
}

/// Work and observations produced by the room reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEffect {
    /// Fetch history for the newly active group.
    FetchHistory { group_id: GroupId, request: u64 },
    /// Send `join_group` for the newly active group.
    Join { group_id: GroupId, confirm: bool },
    ActiveGroupChanged { group_id: GroupId },
    TranscriptLoaded { group_id: GroupId, count: usize },
    MessageAppended {
        group_id: GroupId,
        message: ChatMessage,
    },
    UnreadChanged { group_id: GroupId, count: u32 },
    GroupsChanged,
    Notify { kind: NoticeKind, message: String },
}

/// Groups, the active group, its transcript, and the unread index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomState {
    groups: Vec<Group>,
    active: Option<Group>,
    transcript: Vec<ChatMessage>,
    unread: HashMap<GroupId, u32>,
    /// Latest history request issued for the active group, while unanswered.
    pending_history: Option<u64>,
    next_request: u64,
}

impl RoomState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn active(&self) -> Option<&Group> {
        self.active.as_ref()
    }

    pub fn active_id(&self) -> Option<&GroupId> {
        self.active.as_ref().map(|g| &g.id)
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn unread(&self) -> &HashMap<GroupId, u32> {
        &self.unread
    }

    /// Unread count for `group_id`, 0 when absent.
    pub fn unread_for(&self, group_id: &str) -> u32 {
        self.unread.get(group_id).copied().unwrap_or(0)
    }

    /// Returns `true` while history for the active group is outstanding.
    pub fn history_pending(&self) -> bool {
        self.pending_history.is_some()
    }

    /// Apply one event and return the next state plus its effects.
    pub fn reduce(mut self, event: RoomEvent) -> (Self, Vec<RoomEffect>) {
        let effects = match event {
            RoomEvent::GroupsLoaded(groups) => {
                self.groups = groups;
                vec![RoomEffect::GroupsChanged]
            }
            RoomEvent::Activate {
                group,
                established,
                confirm_join,
            } => self.activate(group, established, confirm_join),
            RoomEvent::HistoryLoaded {
                group_id,
                request,
                messages,
            } => self.history_loaded(group_id, request, messages),
            RoomEvent::HistoryFailed {
                group_id,
                request,
                reason,
            } => self.history_failed(&group_id, request, &reason),
            RoomEvent::MessageReceived { group_id, message } => {
                self.message_received(group_id, message)
            }
            RoomEvent::UserJoined { group_id } => {
                self.presence(&group_id, "A user joined the chat")
            }
            RoomEvent::UserLeft { group_id } => self.presence(&group_id, "A user left the chat"),
            RoomEvent::GroupAnnounced(group) => {
                if self.groups.iter().any(|g| g.id == group.id) {
                    debug!(group_id = %group.id, "group already listed");
                    Vec::new()
                } else {
                    self.groups.insert(0, group);
                    vec![RoomEffect::GroupsChanged]
                }
            }
        };
        (self, effects)
    }

    fn activate(&mut self, group: Group, established: bool, confirm_join: bool) -> Vec<RoomEffect> {
        if !established {
            debug!(group_id = %group.id, "room switch ignored: connection not established");
            return Vec::new();
        }
        self.next_request += 1;
        let request = self.next_request;
        let group_id = group.id.clone();

        self.active = Some(group);
        self.transcript.clear();
        self.pending_history = Some(request);
        self.unread.insert(group_id.clone(), 0);

        debug!(group_id = %group_id, request, "room activated");
        vec![
            RoomEffect::ActiveGroupChanged {
                group_id: group_id.clone(),
            },
            RoomEffect::FetchHistory {
                group_id: group_id.clone(),
                request,
            },
            RoomEffect::Join {
                group_id,
                confirm: confirm_join,
            },
        ]
    }

    fn is_current(&self, group_id: &str, request: u64) -> bool {
        self.pending_history == Some(request) && self.active_id().map(String::as_str) == Some(group_id)
    }

    fn history_loaded(
        &mut self,
        group_id: GroupId,
        request: u64,
        messages: Vec<ChatMessage>,
    ) -> Vec<RoomEffect> {
        if !self.is_current(&group_id, request) {
            debug!(group_id = %group_id, request, "dropping stale history");
            return Vec::new();
        }
        self.pending_history = None;

        let known: HashSet<_> = messages.iter().filter_map(|m| m.id.clone()).collect();
        let live = std::mem::take(&mut self.transcript);
        let mut transcript: Vec<ChatMessage> = messages
            .into_iter()
            .map(|mut message| {
                if message.group_id.is_empty() {
                    message.group_id = group_id.clone();
                }
                message
            })
            .collect();
        // Echoes that arrived while the history was in flight.
        transcript.extend(
            live.into_iter()
                .filter(|m| m.id.as_ref().is_none_or(|id| !known.contains(id))),
        );
        self.transcript = transcript;
        self.unread.insert(group_id.clone(), 0);

        vec![RoomEffect::TranscriptLoaded {
            group_id,
            count: self.transcript.len(),
        }]
    }

    fn history_failed(&mut self, group_id: &str, request: u64, reason: &str) -> Vec<RoomEffect> {
        if !self.is_current(group_id, request) {
            debug!(group_id, request, "dropping stale history failure");
            return Vec::new();
        }
        self.pending_history = None;
        debug!(group_id, reason, "history fetch failed");
        vec![RoomEffect::Notify {
            kind: NoticeKind::Failure(FailureKind::HistoryFetchFailure),
            message: "Failed to load messages".into(),
        }]
    }

    fn message_received(&mut self, group_id: GroupId, message: ChatMessage) -> Vec<RoomEffect> {
        if self.active_id() == Some(&group_id) {
            self.transcript.push(message.clone());
            return vec![RoomEffect::MessageAppended { group_id, message }];
        }
        let count = self.unread.entry(group_id.clone()).or_insert(0);
        *count += 1;
        vec![RoomEffect::UnreadChanged {
            group_id,
            count: *count,
        }]
    }

    fn presence(&self, group_id: &str, text: &str) -> Vec<RoomEffect> {
        if self.active_id().map(String::as_str) != Some(group_id) {
            return Vec::new();
        }
        vec![RoomEffect::Notify {
            kind: NoticeKind::Presence,
            message: text.to_owned(),
        }]
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

    fn msg(id: &str, group: &str) -> ChatMessage {
        ChatMessage {
            id: Some(id.into()),
            group_id: group.into(),
            sender_id: "u2".into(),
            sender_display: "bob".into(),
            content: format!("content of {id}"),
            timestamp: "2026-01-01T00:00:00Z".into(),
        }
    }

    fn activate(state: RoomState, id: &str) -> (RoomState, u64) {
        let (state, effects) = state.reduce(RoomEvent::Activate {
            group: Group::new(id, id),
            established: true,
            confirm_join: false,
        });
        let request = effects
            .iter()
            .find_map(|e| match e {
                RoomEffect::FetchHistory { request, .. } => Some(*request),
                _ => None,
            })
            .expect("activation should fetch history");
        (state, request)
    }

    #[test]
    fn activation_before_authentication_is_ignored() {
        let (state, effects) = RoomState::new().reduce(RoomEvent::Activate {
            group: Group::new("g1", "general"),
            established: false,
            confirm_join: false,
        });
        assert!(effects.is_empty());
        assert!(state.active().is_none());
    }

    #[test]
    fn activation_fetches_history_and_joins_independently() {
        let (_, effects) = RoomState::new().reduce(RoomEvent::Activate {
            group: Group::new("g1", "general"),
            established: true,
            confirm_join: true,
        });
        assert!(effects.contains(&RoomEffect::FetchHistory {
            group_id: "g1".into(),
            request: 1,
        }));
        assert!(effects.contains(&RoomEffect::Join {
            group_id: "g1".into(),
            confirm: true,
        }));
    }

    #[test]
    fn history_replaces_transcript_in_returned_order() {
        let (state, request) = activate(RoomState::new(), "g1");
        let (state, effects) = state.reduce(RoomEvent::HistoryLoaded {
            group_id: "g1".into(),
            request,
            messages: vec![msg("m2", "g1"), msg("m1", "g1")],
        });
        let ids: Vec<_> = state
            .transcript()
            .iter()
            .map(|m| m.id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["m2", "m1"]);
        assert_eq!(state.unread_for("g1"), 0);
        assert!(!state.history_pending());
        assert_eq!(
            effects,
            vec![RoomEffect::TranscriptLoaded {
                group_id: "g1".into(),
                count: 2,
            }]
        );
    }

    #[test]
    fn history_fills_missing_group_id() {
        let (state, request) = activate(RoomState::new(), "g1");
        let (state, _) = state.reduce(RoomEvent::HistoryLoaded {
            group_id: "g1".into(),
            request,
            messages: vec![msg("m1", "")],
        });
        assert_eq!(state.transcript()[0].group_id, "g1");
    }

    #[test]
    fn message_for_background_group_increments_unread() {
        let (state, request) = activate(RoomState::new(), "g1");
        let (state, _) = state.reduce(RoomEvent::HistoryLoaded {
            group_id: "g1".into(),
            request,
            messages: vec![msg("m0", "g1")],
        });
        let before = state.transcript().to_vec();

        let (state, effects) = state.reduce(RoomEvent::MessageReceived {
            group_id: "g2".into(),
            message: msg("m1", "g2"),
        });
        assert_eq!(state.unread_for("g2"), 1);
        assert_eq!(state.transcript(), before.as_slice());
        assert_eq!(
            effects,
            vec![RoomEffect::UnreadChanged {
                group_id: "g2".into(),
                count: 1,
            }]
        );
    }

    #[test]
    fn message_routing_follows_receiver_state_after_switch() {
        let (state, _) = activate(RoomState::new(), "a");
        // The user switches to B before the message tagged A arrives.
        let (state, _) = activate(state, "b");
        let (state, _) = state.reduce(RoomEvent::MessageReceived {
            group_id: "a".into(),
            message: msg("m1", "a"),
        });
        assert_eq!(state.unread_for("a"), 1);
        assert!(state.transcript().is_empty());
        assert_eq!(state.active_id().map(String::as_str), Some("b"));
    }

    #[test]
    fn message_for_active_group_appends_in_arrival_order() {
        let (state, request) = activate(RoomState::new(), "g1");
        let (state, _) = state.reduce(RoomEvent::HistoryLoaded {
            group_id: "g1".into(),
            request,
            messages: vec![],
        });
        let (state, _) = state.reduce(RoomEvent::MessageReceived {
            group_id: "g1".into(),
            message: msg("late", "g1"),
        });
        let (state, _) = state.reduce(RoomEvent::MessageReceived {
            group_id: "g1".into(),
            message: msg("early", "g1"),
        });
        let ids: Vec<_> = state
            .transcript()
            .iter()
            .map(|m| m.id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["late", "early"]);
        assert_eq!(state.unread_for("g1"), 0);
    }

    #[test]
    fn stale_history_is_dropped() {
        let (state, first) = activate(RoomState::new(), "g1");
        let (state, _) = activate(state, "g2");
        let (state, effects) = state.reduce(RoomEvent::HistoryLoaded {
            group_id: "g1".into(),
            request: first,
            messages: vec![msg("m1", "g1")],
        });
        assert!(effects.is_empty());
        assert!(state.transcript().is_empty());
        assert!(state.history_pending());
    }

    #[test]
    fn superseded_request_for_same_group_is_dropped() {
        let (state, first) = activate(RoomState::new(), "g1");
        let (state, second) = activate(state, "g1");
        assert_ne!(first, second);
        let (state, effects) = state.reduce(RoomEvent::HistoryLoaded {
            group_id: "g1".into(),
            request: first,
            messages: vec![msg("old", "g1")],
        });
        assert!(effects.is_empty());
        assert!(state.transcript().is_empty());
    }

    #[test]
    fn live_messages_survive_history_load_without_duplicates() {
        let (state, request) = activate(RoomState::new(), "g1");
        let (state, _) = state.reduce(RoomEvent::MessageReceived {
            group_id: "g1".into(),
            message: msg("m2", "g1"),
        });
        let (state, _) = state.reduce(RoomEvent::MessageReceived {
            group_id: "g1".into(),
            message: msg("m3", "g1"),
        });
        let (state, _) = state.reduce(RoomEvent::HistoryLoaded {
            group_id: "g1".into(),
            request,
            messages: vec![msg("m1", "g1"), msg("m2", "g1")],
        });
        let ids: Vec<_> = state
            .transcript()
            .iter()
            .map(|m| m.id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn history_failure_leaves_transcript_empty_with_notice() {
        let (state, request) = activate(RoomState::new(), "g1");
        let (state, effects) = state.reduce(RoomEvent::HistoryFailed {
            group_id: "g1".into(),
            request,
            reason: "500".into(),
        });
        assert!(state.transcript().is_empty());
        assert!(!state.history_pending());
        assert!(matches!(
            effects.as_slice(),
            [RoomEffect::Notify {
                kind: NoticeKind::Failure(FailureKind::HistoryFetchFailure),
                ..
            }]
        ));
    }

    #[test]
    fn activating_clears_that_groups_unread() {
        let (state, _) = activate(RoomState::new(), "g1");
        let (state, _) = state.reduce(RoomEvent::MessageReceived {
            group_id: "g2".into(),
            message: msg("m1", "g2"),
        });
        assert_eq!(state.unread_for("g2"), 1);
        let (state, _) = activate(state, "g2");
        assert_eq!(state.unread_for("g2"), 0);
    }

    #[test]
    fn presence_only_for_active_group_and_never_mutates() {
        let (state, _) = activate(RoomState::new(), "g1");
        let snapshot = state.clone();
        let (state, effects) = state.reduce(RoomEvent::UserJoined {
            group_id: "g1".into(),
        });
        assert_eq!(state, snapshot);
        assert!(matches!(
            effects.as_slice(),
            [RoomEffect::Notify {
                kind: NoticeKind::Presence,
                ..
            }]
        ));

        let (state, effects) = state.reduce(RoomEvent::UserLeft {
            group_id: "other".into(),
        });
        assert!(effects.is_empty());
        assert_eq!(state, snapshot);
    }

    #[test]
    fn announced_groups_are_prepended_once() {
        let (state, _) = RoomState::new().reduce(RoomEvent::GroupsLoaded(vec![Group::new(
            "g1", "general",
        )]));
        let (state, _) = activate(state, "g1");
        let (state, effects) = state.reduce(RoomEvent::GroupAnnounced(Group::new("g2", "new")));
        assert_eq!(effects, vec![RoomEffect::GroupsChanged]);
        assert_eq!(state.groups()[0].id, "g2");
        assert_eq!(state.active_id().map(String::as_str), Some("g1"));

        let (state, effects) = state.reduce(RoomEvent::GroupAnnounced(Group::new("g2", "new")));
        assert!(effects.is_empty());
        assert_eq!(state.groups().len(), 2);
    }
}
