//! Transport routing coordinates and their signed announcements

use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::{CommunityError, CommunityResult};
use super::types::{open_signed_payload, Clock, CommunityId, Identity};

/// Cluster used when a community does not pin one
pub const MAIN_CLUSTER: u16 = 16;

/// Shard used for announcements that must reach everyone
pub const DEFAULT_SHARD_INDEX: u16 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shard {
    pub cluster: u16,
    pub index: u16,
}

impl Shard {
    pub fn new(cluster: u16, index: u16) -> Self {
        Self { cluster, index }
    }

    pub fn default_shard() -> Self {
        Self::new(MAIN_CLUSTER, DEFAULT_SHARD_INDEX)
    }

    pub fn pubsub_topic(&self) -> String {
        format!("/communal/rs/{}/{}", self.cluster, self.index)
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.index)
    }
}

/// Announcement of where a community's traffic is routed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicShardInfo {
    pub community_id: CommunityId,
    pub shard: Option<Shard>,
    pub clock: Clock,
}

impl PublicShardInfo {
    /// Sign with the community key, producing `signature || payload`
    pub fn sign(&self, community_key: &Identity) -> CommunityResult<Vec<u8>> {
        Ok(community_key.sign_payload(&serde_json::to_vec(self)?))
    }

    /// Open a signed announcement and check it was made by the community key
    pub fn open(data: &[u8], community_id: &CommunityId) -> CommunityResult<Self> {
        let payload = open_signed_payload(data, &community_id.public_key())?;
        let info: Self = serde_json::from_slice(payload)?;
        if &info.community_id != community_id {
            return Err(CommunityError::InvalidDescription(
                "shard info for another community".to_string(),
            ));
        }
        Ok(info)
    }
}

/// Private topic key for a protected shard, sent only to members
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKey {
    pub community_id: CommunityId,
    pub shard: Shard,
    pub private_key: Vec<u8>,
    pub clock: Clock,
}

impl fmt::Debug for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardKey")
            .field("community_id", &self.community_id)
            .field("shard", &self.shard)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
