//! Pub/sub transport seam
//!
//! The core never speaks a wire protocol itself. It hands typed messages
//! to a [`Transport`] together with a [`Destination`] and receives inbound
//! messages through `SyncManager::handle_message`, with the sender already
//! authenticated by the transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core_community::{ChatId, CommunityEventsMessage, CommunityId, KeyScope, MemberKey};

use super::key_distributor::SealedKey;

/// Where a message is delivered
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Public channel keyed by community id
    Community(CommunityId),
    /// Pubsub topic of a shard
    Shard(String),
    /// Private delivery to one identity
    Member(MemberKey),
}

/// Messages exchanged between community participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Signed description; `signer` names the key that produced the signature
    CommunityDescription {
        community_id: CommunityId,
        signer: MemberKey,
        data: Vec<u8>,
    },
    CommunityEvents(CommunityEventsMessage),
    RequestToJoin {
        community_id: CommunityId,
        revealed_addresses: Vec<String>,
    },
    /// Signed privileged user sync payload
    PrivilegedUserSync {
        community_id: CommunityId,
        data: Vec<u8>,
    },
    EncryptionKeysRequest {
        community_id: CommunityId,
        chat_ids: Vec<ChatId>,
    },
    EncryptionKeys {
        community_id: CommunityId,
        scope: KeyScope,
        key: SealedKey,
    },
    SharedAddressesRequest {
        community_id: CommunityId,
        member: MemberKey,
    },
    SharedAddressesResponse {
        community_id: CommunityId,
        member: MemberKey,
        addresses: Vec<String>,
    },
    PublicShardInfo {
        community_id: CommunityId,
        data: Vec<u8>,
    },
    ShardKey {
        community_id: CommunityId,
        data: Vec<u8>,
    },
    Grant {
        community_id: CommunityId,
        data: Vec<u8>,
    },
    UserKicked {
        community_id: CommunityId,
    },
}

impl WireMessage {
    pub fn community_id(&self) -> CommunityId {
        match self {
            WireMessage::CommunityDescription { community_id, .. }
            | WireMessage::RequestToJoin { community_id, .. }
            | WireMessage::PrivilegedUserSync { community_id, .. }
            | WireMessage::EncryptionKeysRequest { community_id, .. }
            | WireMessage::EncryptionKeys { community_id, .. }
            | WireMessage::SharedAddressesRequest { community_id, .. }
            | WireMessage::SharedAddressesResponse { community_id, .. }
            | WireMessage::PublicShardInfo { community_id, .. }
            | WireMessage::ShardKey { community_id, .. }
            | WireMessage::Grant { community_id, .. }
            | WireMessage::UserKicked { community_id } => *community_id,
            WireMessage::CommunityEvents(message) => message.community_id,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::CommunityDescription { .. } => "community_description",
            WireMessage::CommunityEvents(_) => "community_events",
            WireMessage::RequestToJoin { .. } => "request_to_join",
            WireMessage::PrivilegedUserSync { .. } => "privileged_user_sync",
            WireMessage::EncryptionKeysRequest { .. } => "encryption_keys_request",
            WireMessage::EncryptionKeys { .. } => "encryption_keys",
            WireMessage::SharedAddressesRequest { .. } => "shared_addresses_request",
            WireMessage::SharedAddressesResponse { .. } => "shared_addresses_response",
            WireMessage::PublicShardInfo { .. } => "public_shard_info",
            WireMessage::ShardKey { .. } => "shard_key",
            WireMessage::Grant { .. } => "grant",
            WireMessage::UserKicked { .. } => "user_kicked",
        }
    }
}

/// Pub/sub transport bridge
///
/// In production this wraps the messaging layer. In tests it records
/// what was sent.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` to `destination`
    ///
    /// Private destinations imply resend semantics on the transport side;
    /// the core only retries key deliveries itself.
    async fn send(&self, destination: Destination, message: WireMessage) -> anyhow::Result<()>;
}
