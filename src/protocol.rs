//! Wire protocol types for the Huddle realtime messaging server.
//!
//! Messages travel as JSON text, adjacently tagged as
//! `{"type": "<snake_case_name>", "data": {…}}`. Field names are camelCase and
//! server-side ids arrive as `_id` (plain `id` is accepted as well).
//!
//! Outbound messages are wrapped in a [`ClientFrame`] so that a request can
//! carry an [`AckId`]; the server answers such requests with
//! [`ServerMessage::Ack`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

// ── Type aliases ────────────────────────────────────────────────────

/// Server-assigned identifier of a group (room).
pub type GroupId = String;

/// Server-assigned identifier of a user.
pub type UserId = String;

/// Server-assigned identifier of a message.
pub type MessageId = String;

/// Client-assigned correlation id for request/acknowledgement exchanges.
pub type AckId = u64;

// ── Data model ──────────────────────────────────────────────────────

/// Identity of the authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id", alias = "id")]
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// A named multi-member chat channel.
///
/// The member set is display-only; it is not kept consistent with the server
/// between joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    #[serde(rename = "_id", alias = "id")]
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default, alias = "members")]
    pub member_ids: HashSet<UserId>,
}

impl Group {
    /// Create a group with the given id and name and no other details.
    pub fn new(id: impl Into<GroupId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            image_url: None,
            is_public: true,
            member_ids: HashSet::new(),
        }
    }
}

/// A chat message delivered to a group.
///
/// `id` is absent only for messages the server has not confirmed. Messages
/// are never mutated after delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(
        rename = "_id",
        alias = "id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<MessageId>,
    /// History responses may omit the group id; it is filled in on load.
    #[serde(default)]
    pub group_id: GroupId,
    pub sender_id: UserId,
    #[serde(default)]
    pub sender_display: String,
    pub content: String,
    /// ISO 8601 timestamp assigned by the server.
    #[serde(default)]
    pub timestamp: String,
}

/// A group together with its message history, as returned by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDetail {
    #[serde(flatten)]
    pub group: Group,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

// ── Messages ────────────────────────────────────────────────────────

/// Message types sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate the connection with the bearer token. Always acknowledged.
    Authenticate { token: String },
    /// Subscribe this connection to a group's realtime events.
    JoinGroup {
        #[serde(rename = "groupId")]
        group_id: GroupId,
    },
    /// Post a chat message to a group. Always acknowledged.
    GroupMessage {
        #[serde(rename = "groupId")]
        group_id: GroupId,
        content: String,
    },
}

/// Envelope for an outbound [`ClientMessage`].
///
/// When `ack_id` is set the server must answer with a matching
/// [`ServerMessage::Ack`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<AckId>,
    pub message: ClientMessage,
}

impl ClientFrame {
    /// A frame that expects no acknowledgement.
    pub fn unacknowledged(message: ClientMessage) -> Self {
        Self {
            ack_id: None,
            message,
        }
    }

    /// A frame the server must acknowledge with `ack_id`.
    pub fn acknowledged(ack_id: AckId, message: ClientMessage) -> Self {
        Self {
            ack_id: Some(ack_id),
            message,
        }
    }
}

/// Message types sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The server confirmed the identity carried by the token.
    Authenticated { user: User },
    /// The credentials were refused for good. Never retried.
    Unauthorized {
        #[serde(default)]
        message: String,
    },
    /// The server could not authenticate right now. Retried a bounded number of times.
    AuthError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Answer to an acknowledged [`ClientFrame`].
    Ack {
        #[serde(rename = "ackId")]
        ack_id: AckId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        success: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A chat message was posted to a group (including our own, echoed back).
    NewGroupMessage {
        #[serde(rename = "groupId")]
        group_id: GroupId,
        message: ChatMessage,
    },
    /// Someone joined a group.
    UserJoined {
        #[serde(rename = "groupId")]
        group_id: GroupId,
        #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
    },
    /// Someone left a group.
    UserLeft {
        #[serde(rename = "groupId")]
        group_id: GroupId,
        #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
    },
    /// Any client created a new group.
    NewGroupCreated(Group),
    /// The server is closing this connection.
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
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
    fn client_frame_wire_format() {
        let frame = ClientFrame::acknowledged(
            7,
            ClientMessage::GroupMessage {
                group_id: "g1".into(),
                content: "hi".into(),
            },
        );
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "ackId": 7,
                "message": {
                    "type": "group_message",
                    "data": { "groupId": "g1", "content": "hi" }
                }
            })
        );
    }

    #[test]
    fn unacknowledged_frame_omits_ack_id() {
        let frame = ClientFrame::unacknowledged(ClientMessage::JoinGroup {
            group_id: "g1".into(),
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert!(value.get("ackId").is_none());
        assert_eq!(value["message"]["type"], "join_group");
        assert_eq!(value["message"]["data"]["groupId"], "g1");
    }

    #[test]
    fn parses_server_new_group_message() {
        let json = r#"{
            "type": "new_group_message",
            "data": {
                "groupId": "g2",
                "message": {
                    "_id": "m1",
                    "groupId": "g2",
                    "senderId": "u2",
                    "senderDisplay": "bob",
                    "content": "hello",
                    "timestamp": "2026-01-01T00:00:00Z"
                }
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        match msg {
            ServerMessage::NewGroupMessage { group_id, message } => {
                assert_eq!(group_id, "g2");
                assert_eq!(message.id.as_deref(), Some("m1"));
                assert_eq!(message.sender_display, "bob");
            }
            other => panic!("expected NewGroupMessage, got {other:?}"),
        }
    }

    #[test]
    fn parses_authenticated_with_plain_id() {
        let json = r#"{"type":"authenticated","data":{"user":{"id":"u1"}}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Authenticated {
                user: User {
                    id: "u1".into(),
                    username: String::new(),
                    avatar_url: None,
                }
            }
        );
    }

    #[test]
    fn parses_auth_error_with_empty_payload() {
        let json = r#"{"type":"auth_error","data":{}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg, ServerMessage::AuthError { message: None });
    }

    #[test]
    fn parses_new_group_created_from_mongo_shape() {
        let json = r#"{
            "type": "new_group_created",
            "data": {
                "_id": "g9",
                "name": "rustaceans",
                "description": "crabs only",
                "imageUrl": "/uploads/g9.png",
                "isPublic": false,
                "members": ["u1", "u2", "u1"]
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        let ServerMessage::NewGroupCreated(group) = msg else {
            panic!("expected NewGroupCreated");
        };
        assert_eq!(group.id, "g9");
        assert!(!group.is_public);
        assert_eq!(group.member_ids.len(), 2);
        assert_eq!(group.image_url.as_deref(), Some("/uploads/g9.png"));
    }

    #[test]
    fn group_detail_flattens_group_fields() {
        let json = r#"{
            "_id": "g1",
            "name": "general",
            "messages": [
                {"_id": "m1", "senderId": "u1", "content": "a"},
                {"_id": "m2", "senderId": "u2", "content": "b"}
            ]
        }"#;
        let detail: GroupDetail = serde_json::from_str(json).unwrap();
        assert_eq!(detail.group.id, "g1");
        assert_eq!(detail.messages.len(), 2);
        assert_eq!(detail.messages[0].group_id, "");
    }

    #[test]
    fn ack_defaults_are_absent() {
        let json = r#"{"type":"ack","data":{"ackId":3}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Ack {
                ack_id: 3,
                success: None,
                error: None,
            }
        );
    }
}
