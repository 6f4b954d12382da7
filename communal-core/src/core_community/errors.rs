//! Error types for community governance operations

use thiserror::Error;

use super::types::Clock;

/// Result type for community operations
pub type CommunityResult<T> = Result<T, CommunityError>;

/// Errors surfaced synchronously by community operations
///
/// Transport and key-delivery failures never appear here; they are
/// logged and retried by the scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommunityError {
    /// The local identity lacks a role allowing this action
    #[error("not authorized")]
    NotAuthorized,

    /// The action requires the control node's signing key
    #[error("not the control node")]
    NotControlNode,

    #[error("chat not found: {0}")]
    ChatNotFound(String),

    #[error("chat already exists: {0}")]
    ChatAlreadyExists(String),

    #[error("chat name already in use: {0}")]
    DuplicatedChatName(String),

    #[error("category not found: {0}")]
    CategoryNotFound(String),

    #[error("category already exists: {0}")]
    CategoryAlreadyExists(String),

    /// Incoming description is older than the one already applied
    #[error("community description clock outdated: incoming {incoming}, current {current}")]
    InvalidCommunityDescriptionClockOutdated { incoming: Clock, current: Clock },

    #[error("cannot remove an owner or admin")]
    CannotRemoveOwnerOrAdmin,

    #[error("cannot ban an owner or admin")]
    CannotBanOwnerOrAdmin,

    #[error("token permission not found: {0}")]
    TokenPermissionNotFound(String),

    #[error("member not found")]
    MemberNotFound,

    #[error("member is banned")]
    MemberBanned,

    #[error("already a member")]
    AlreadyMember,

    #[error("member is not banned")]
    BannedMemberNotFound,

    #[error("community not found: {0}")]
    OrgNotFound(String),

    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    #[error("grant expired")]
    GrantExpired,

    #[error("invalid community event: {0}")]
    InvalidEvent(String),

    /// An event for the same action and target was already applied at or after this clock
    #[error("community event already applied: clock {clock}, last applied {last_applied}")]
    EventAlreadyApplied { clock: Clock, last_applied: Clock },

    #[error("invalid chat: {0}")]
    InvalidChat(String),

    #[error("invalid token permission: {0}")]
    InvalidTokenPermission(String),

    #[error("invalid community description: {0}")]
    InvalidDescription(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("membership filter error: {0}")]
    MembershipFilter(String),
}

impl From<serde_json::Error> for CommunityError {
    fn from(e: serde_json::Error) -> Self {
        CommunityError::Codec(e.to_string())
    }
}

impl From<bincode::Error> for CommunityError {
    fn from(e: bincode::Error) -> Self {
        CommunityError::Codec(e.to_string())
    }
}

impl CommunityError {
    /// Whether the caller may keep processing side-channel data after this error
    pub fn is_stale(&self) -> bool {
        matches!(self, CommunityError::InvalidCommunityDescriptionClockOutdated { .. })
    }
}
