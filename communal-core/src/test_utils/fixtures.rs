//! Test fixtures for creating common test objects
//!
//! Provides a builder for a control node community plus replicas of it as
//! seen by other members.

use std::sync::Arc;

use crate::core_community::{
    ChannelRole, Community, CommunityChat, CommunityConfig, CommunityIdentity, CommunityMetadata,
    CommunityOptions, FixedTimeSource, Identity, LocalState, MemberKey, MemberRole,
};

/// Wall clock every fixture starts at, in milliseconds
pub const FIXTURE_START_MILLIS: u64 = 1_700_000_000_000;

/// Deterministic identity derived from a single byte
pub fn test_identity(seed: u8) -> Identity {
    Identity::from_seed([seed; 32])
}

pub fn test_metadata(name: &str) -> CommunityMetadata {
    CommunityMetadata {
        identity: CommunityIdentity {
            display_name: name.to_string(),
            description: format!("{} community", name),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A community held by its control node, with helpers to add members and
/// build the views other members hold
pub struct CommunityFixture {
    pub community_key: Identity,
    pub owner: Identity,
    pub time: Arc<FixedTimeSource>,
    pub control: Community,
}

impl CommunityFixture {
    pub fn new() -> Self {
        let community_key = test_identity(1);
        let owner = test_identity(2);
        let time = Arc::new(FixedTimeSource::new(FIXTURE_START_MILLIS));
        let options = CommunityOptions::default().with_time_source(time.clone());
        let control = Community::create(
            community_key.clone(),
            owner.clone(),
            test_metadata("fixture"),
            options,
        )
        .expect("fixture community");
        Self {
            community_key,
            owner,
            time,
            control,
        }
    }

    pub fn options(&self) -> CommunityOptions {
        CommunityOptions::default().with_time_source(self.time.clone())
    }

    /// Add `identity` with `role` through the control node
    pub fn with_member(mut self, identity: &Identity, role: MemberRole) -> Self {
        self.control
            .add_member(identity.public_key(), role)
            .expect("add fixture member");
        self
    }

    /// Create a public chat through the control node
    pub fn with_chat(mut self, chat_id: &str) -> Self {
        self.control
            .create_chat(chat_id.to_string(), CommunityChat::new(chat_id))
            .expect("create fixture chat");
        self
    }

    pub fn member_in_chat(&mut self, key: MemberKey, chat_id: &str) {
        self.control
            .add_member_to_chat(key, chat_id, ChannelRole::Poster)
            .expect("add fixture member to chat");
    }

    /// The community as held by `identity`, built from the latest signed description
    pub fn replica(&mut self, identity: &Identity) -> Community {
        let raw = self.control.signed_description().expect("sign fixture description");
        Community::new(
            CommunityConfig {
                id: self.control.id(),
                member_identity: identity.clone(),
                control_node: Some(self.control.control_node()),
                control_node_key: None,
                description: self.control.description().clone(),
                raw_description: raw,
                local: LocalState {
                    joined: true,
                    ..Default::default()
                },
            },
            self.options(),
        )
    }

    /// Sign the current description and merge it into `replica`
    pub fn publish_to(&mut self, replica: &mut Community) -> crate::core_community::CommunityChanges {
        let raw = self.control.signed_description().expect("sign fixture description");
        replica
            .update_from_signed(&raw, None)
            .expect("merge fixture description")
    }
}

impl Default for CommunityFixture {
    fn default() -> Self {
        Self::new()
    }
}
