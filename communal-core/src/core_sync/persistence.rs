//! Persistence seam
//!
//! The core calls narrow save/get/delete methods and never embeds a
//! storage engine. [`MemoryCommunityStore`] backs tests and embedders
//! without durable storage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::core_community::{Clock, CommunityId, MemberKey};

/// Per-community settings persisted alongside the description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunitySettings {
    pub community_id: CommunityId,
    pub history_archive_support_enabled: bool,
    pub clock: Clock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestToJoinState {
    Pending,
    Accepted,
    Declined,
}

/// A request to join a community
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestToJoin {
    pub id: String,
    pub community_id: CommunityId,
    pub public_key: MemberKey,
    pub clock: Clock,
    pub state: RequestToJoinState,
    pub revealed_addresses: Vec<String>,
}

impl RequestToJoin {
    pub fn new(community_id: CommunityId, public_key: MemberKey, clock: Clock) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            community_id,
            public_key,
            clock,
            state: RequestToJoinState::Pending,
            revealed_addresses: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == RequestToJoinState::Pending
    }
}

/// Storage for everything that travels outside the signed description
#[async_trait]
pub trait CommunityStore: Send + Sync {
    async fn save_settings(&self, settings: CommunitySettings) -> anyhow::Result<()>;

    async fn get_settings(&self, community_id: &CommunityId) -> anyhow::Result<Option<CommunitySettings>>;

    async fn delete_settings(&self, community_id: &CommunityId) -> anyhow::Result<()>;

    /// Insert or replace the request of `request.public_key`
    async fn save_request_to_join(&self, request: RequestToJoin) -> anyhow::Result<()>;

    async fn get_requests_to_join(&self, community_id: &CommunityId) -> anyhow::Result<Vec<RequestToJoin>>;

    async fn has_pending_request(
        &self,
        community_id: &CommunityId,
        member: &MemberKey,
    ) -> anyhow::Result<bool> {
        Ok(self
            .get_requests_to_join(community_id)
            .await?
            .iter()
            .any(|r| &r.public_key == member && r.is_pending()))
    }

    async fn save_revealed_addresses(
        &self,
        community_id: &CommunityId,
        member: &MemberKey,
        addresses: Vec<String>,
    ) -> anyhow::Result<()>;

    async fn get_revealed_addresses(
        &self,
        community_id: &CommunityId,
        member: &MemberKey,
    ) -> anyhow::Result<Vec<String>>;
}

/// In-memory [`CommunityStore`]
#[derive(Debug, Default)]
pub struct MemoryCommunityStore {
    settings: RwLock<HashMap<CommunityId, CommunitySettings>>,
    requests: RwLock<HashMap<(CommunityId, MemberKey), RequestToJoin>>,
    addresses: RwLock<HashMap<(CommunityId, MemberKey), Vec<String>>>,
}

impl MemoryCommunityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommunityStore for MemoryCommunityStore {
    async fn save_settings(&self, settings: CommunitySettings) -> anyhow::Result<()> {
        self.settings
            .write()
            .await
            .insert(settings.community_id, settings);
        Ok(())
    }

    async fn get_settings(&self, community_id: &CommunityId) -> anyhow::Result<Option<CommunitySettings>> {
        Ok(self.settings.read().await.get(community_id).cloned())
    }

    async fn delete_settings(&self, community_id: &CommunityId) -> anyhow::Result<()> {
        self.settings.write().await.remove(community_id);
        Ok(())
    }

    async fn save_request_to_join(&self, request: RequestToJoin) -> anyhow::Result<()> {
        self.requests
            .write()
            .await
            .insert((request.community_id, request.public_key), request);
        Ok(())
    }

    async fn get_requests_to_join(&self, community_id: &CommunityId) -> anyhow::Result<Vec<RequestToJoin>> {
        let mut requests: Vec<_> = self
            .requests
            .read()
            .await
            .values()
            .filter(|r| &r.community_id == community_id)
            .cloned()
            .collect();
        requests.sort_by_key(|r| (r.clock, r.public_key));
        Ok(requests)
    }

    async fn save_revealed_addresses(
        &self,
        community_id: &CommunityId,
        member: &MemberKey,
        addresses: Vec<String>,
    ) -> anyhow::Result<()> {
        self.addresses
            .write()
            .await
            .insert((*community_id, *member), addresses);
        Ok(())
    }

    async fn get_revealed_addresses(
        &self,
        community_id: &CommunityId,
        member: &MemberKey,
    ) -> anyhow::Result<Vec<String>> {
        Ok(self
            .addresses
            .read()
            .await
            .get(&(*community_id, *member))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_identity;

    fn community() -> CommunityId {
        CommunityId::from(test_identity(1).public_key())
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let store = MemoryCommunityStore::new();
        let settings = CommunitySettings {
            community_id: community(),
            history_archive_support_enabled: true,
            clock: 42,
        };
        store.save_settings(settings.clone()).await.unwrap();
        assert_eq!(store.get_settings(&community()).await.unwrap(), Some(settings));

        store.delete_settings(&community()).await.unwrap();
        assert_eq!(store.get_settings(&community()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_request_to_join_replaced_per_member() {
        let store = MemoryCommunityStore::new();
        let member = test_identity(5).public_key();
        let mut request = RequestToJoin::new(community(), member, 10);
        store.save_request_to_join(request.clone()).await.unwrap();
        assert!(store.has_pending_request(&community(), &member).await.unwrap());

        request.state = RequestToJoinState::Declined;
        store.save_request_to_join(request).await.unwrap();
        let requests = store.get_requests_to_join(&community()).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!store.has_pending_request(&community(), &member).await.unwrap());
    }

    #[tokio::test]
    async fn test_revealed_addresses_default_empty() {
        let store = MemoryCommunityStore::new();
        let member = test_identity(6).public_key();
        assert!(store
            .get_revealed_addresses(&community(), &member)
            .await
            .unwrap()
            .is_empty());

        store
            .save_revealed_addresses(&community(), &member, vec!["0x01".to_string()])
            .await
            .unwrap();
        assert_eq!(
            store.get_revealed_addresses(&community(), &member).await.unwrap(),
            vec!["0x01".to_string()]
        );
    }
}
