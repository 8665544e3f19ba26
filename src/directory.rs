//! The REST side of the chat server: identity, group listing, history, group
//! creation and membership.
//!
//! The session never talks HTTP itself; it calls a [`GroupDirectory`] from
//! spawned tasks and posts the outcome back to its loop. Every call carries
//! the bearer token the session is currently using.

use async_trait::async_trait;

use crate::error::HuddleError;
use crate::protocol::{Group, GroupDetail, GroupId, User};

/// An image attached to a new group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupImage {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Request body for creating a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGroup {
    pub name: String,
    pub description: String,
    pub is_public: bool,
    pub image: Option<GroupImage>,
}

impl NewGroup {
    /// A public group with no description and no image.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            is_public: true,
            image: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_visibility(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }

    #[must_use]
    pub fn with_image(mut self, image: GroupImage) -> Self {
        self.image = Some(image);
        self
    }
}

/// REST operations the session depends on.
///
/// Errors with `status: Some(401)` are treated as an expired session during
/// bootstrap.
#[async_trait]
pub trait GroupDirectory: Send + Sync + 'static {
    /// Profile of the token's owner.
    async fn current_user(&self, token: &str) -> Result<User, HuddleError>;

    /// Every group visible to the user.
    async fn list_groups(&self, token: &str) -> Result<Vec<Group>, HuddleError>;

    /// A group and its message history, oldest first.
    async fn group_detail(&self, token: &str, group_id: &str) -> Result<GroupDetail, HuddleError>;

    /// Create a group; the server returns the stored group.
    async fn create_group(&self, token: &str, group: NewGroup) -> Result<Group, HuddleError>;

    /// Add the user to `group_id` and return the joined group.
    async fn join_group(&self, token: &str, group_id: &GroupId) -> Result<Group, HuddleError>;
}
