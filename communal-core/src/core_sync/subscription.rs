//! Notification broadcasting
//!
//! Fans out what the sync layer observed (merged descriptions, requests
//! to join, received keys and grants) to any number of subscribers.

use tokio::sync::broadcast;

use crate::core_community::{ChatId, Clock, CommunityChanges, CommunityId, KeyScope, MemberKey, Shard};

use super::persistence::RequestToJoin;

#[derive(Debug, Clone, PartialEq)]
pub enum CommunityNotification {
    /// A description was merged or applied locally
    DescriptionUpdated {
        community_id: CommunityId,
        clock: Clock,
        changes: Box<CommunityChanges>,
    },
    /// The control node published a description
    Published { community_id: CommunityId, clock: Clock },
    RequestToJoinReceived {
        community_id: CommunityId,
        request: RequestToJoin,
    },
    RequestToJoinResolved {
        community_id: CommunityId,
        member: MemberKey,
        accepted: bool,
    },
    /// The local member was removed from an encrypted community
    MemberKicked { community_id: CommunityId },
    ShardUpdated {
        community_id: CommunityId,
        shard: Option<Shard>,
    },
    GrantReceived {
        community_id: CommunityId,
        chat_id: ChatId,
        clock: Clock,
    },
    EncryptionKeyReceived {
        community_id: CommunityId,
        scope: KeyScope,
    },
    SharedAddresses {
        community_id: CommunityId,
        member: MemberKey,
        addresses: Vec<String>,
    },
}

impl CommunityNotification {
    pub fn community_id(&self) -> CommunityId {
        match self {
            CommunityNotification::DescriptionUpdated { community_id, .. }
            | CommunityNotification::Published { community_id, .. }
            | CommunityNotification::RequestToJoinReceived { community_id, .. }
            | CommunityNotification::RequestToJoinResolved { community_id, .. }
            | CommunityNotification::MemberKicked { community_id }
            | CommunityNotification::ShardUpdated { community_id, .. }
            | CommunityNotification::GrantReceived { community_id, .. }
            | CommunityNotification::EncryptionKeyReceived { community_id, .. }
            | CommunityNotification::SharedAddresses { community_id, .. } => *community_id,
        }
    }
}

/// Broadcaster for [`CommunityNotification`]s
#[derive(Debug, Clone)]
pub struct CommunityNotifier {
    tx: broadcast::Sender<CommunityNotification>,
}

impl CommunityNotifier {
    /// Create a notifier buffering `capacity` notifications per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Number of subscribers that received the notification
    pub fn emit(&self, notification: CommunityNotification) -> usize {
        self.tx.send(notification).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CommunityNotification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for CommunityNotifier {
    fn default() -> Self {
        Self::new(100)
    }
}
