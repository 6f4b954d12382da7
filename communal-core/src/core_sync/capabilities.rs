//! Narrow collaborator capabilities injected into the sync manager

use async_trait::async_trait;

use crate::core_community::{CommunityId, MemberKey};

/// Answers who owns the owner token of a community
///
/// Consulted when a description arrives signed by a key other than the
/// current control node. How ownership is verified is up to the
/// implementation.
#[async_trait]
pub trait OwnershipOracle: Send + Sync {
    async fn token_owner(&self, community_id: &CommunityId) -> anyhow::Result<Option<MemberKey>>;
}

/// Counts members active since a point in time
#[async_trait]
pub trait ActiveMembersSource: Send + Sync {
    /// Active members of `community_id` since `since_millis`
    async fn active_members_count(&self, community_id: &CommunityId, since_millis: u64) -> anyhow::Result<u64>;
}
