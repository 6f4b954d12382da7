//! In-memory collaborators for sync tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use crate::core_community::{CommunityId, MemberKey};
use crate::core_sync::{ActiveMembersSource, Destination, OwnershipOracle, Transport, WireMessage};

/// Transport that records every message and can be told to fail
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Destination, WireMessage)>>,
    failing: Mutex<HashSet<MemberKey>>,
    fail_all: Mutex<bool>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail private deliveries to `member`
    pub async fn fail_for(&self, member: MemberKey) {
        self.failing.lock().await.insert(member);
    }

    /// Fail every send
    pub async fn fail_all(&self, fail: bool) {
        *self.fail_all.lock().await = fail;
    }

    pub async fn clear_failures(&self) {
        self.failing.lock().await.clear();
        *self.fail_all.lock().await = false;
    }

    pub async fn sent(&self) -> Vec<(Destination, WireMessage)> {
        self.sent.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }

    /// Messages of the given kind, in send order
    pub async fn sent_of_kind(&self, kind: &str) -> Vec<(Destination, WireMessage)> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(_, m)| m.kind() == kind)
            .cloned()
            .collect()
    }

    /// Recipients of private deliveries, in send order
    pub async fn private_recipients(&self) -> Vec<MemberKey> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(|(d, _)| match d {
                Destination::Member(key) => Some(*key),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, destination: Destination, message: WireMessage) -> anyhow::Result<()> {
        if *self.fail_all.lock().await {
            anyhow::bail!("transport offline");
        }
        if let Destination::Member(key) = &destination {
            if self.failing.lock().await.contains(key) {
                anyhow::bail!("peer {} unreachable", key);
            }
        }
        self.sent.lock().await.push((destination, message));
        Ok(())
    }
}

/// Ownership oracle answering from a fixed table
#[derive(Debug, Default)]
pub struct StaticOwnershipOracle {
    owners: Mutex<HashMap<CommunityId, MemberKey>>,
}

impl StaticOwnershipOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_owner(&self, community_id: CommunityId, owner: MemberKey) {
        self.owners.lock().await.insert(community_id, owner);
    }
}

#[async_trait]
impl OwnershipOracle for StaticOwnershipOracle {
    async fn token_owner(&self, community_id: &CommunityId) -> anyhow::Result<Option<MemberKey>> {
        Ok(self.owners.lock().await.get(community_id).copied())
    }
}

/// Active member source returning a fixed count
#[derive(Debug)]
pub struct FixedActiveMembers(pub u64);

#[async_trait]
impl ActiveMembersSource for FixedActiveMembers {
    async fn active_members_count(&self, _community_id: &CommunityId, _since_millis: u64) -> anyhow::Result<u64> {
        Ok(self.0)
    }
}
