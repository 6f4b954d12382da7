//! Errors raised by the sync layer

use thiserror::Error;

use crate::core_community::{CommunityError, CommunityId, MemberKey};

pub type SyncResult<T> = Result<T, SyncError>;

/// Failures of the sync layer and its collaborators
///
/// Collaborators report `anyhow::Error`; the manager converts those into
/// the matching variant before they reach its callers.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Community(#[from] CommunityError),

    #[error("community not registered: {0}")]
    CommunityNotFound(CommunityId),

    #[error("message from unexpected sender {0}")]
    UnexpectedSender(MemberKey),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("encryption failure: {0}")]
    Encryption(String),

    #[error("collaborator failure: {0}")]
    Collaborator(String),
}

impl SyncError {
    pub fn transport(e: anyhow::Error) -> Self {
        SyncError::Transport(format!("{:#}", e))
    }

    pub fn persistence(e: anyhow::Error) -> Self {
        SyncError::Persistence(format!("{:#}", e))
    }

    pub fn encryption(e: anyhow::Error) -> Self {
        SyncError::Encryption(format!("{:#}", e))
    }

    pub fn collaborator(e: anyhow::Error) -> Self {
        SyncError::Collaborator(format!("{:#}", e))
    }

    /// Whether this wraps a stale description rejection
    pub fn is_stale(&self) -> bool {
        matches!(self, SyncError::Community(e) if e.is_stale())
    }
}
