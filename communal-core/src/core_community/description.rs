//! The replicated community description
//!
//! Everything in this module is serialized and sent to peers. Local-only
//! state lives on [`Community`](super::community::Community).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::membership_filter::MembershipFilter;
use super::permissions::{community_encrypted, TokenPermission};
use super::roles::{effective_role, ChannelRole, MemberRole, RoleSet};
use super::shard::Shard;
use super::types::{ChatId, Clock, MemberKey};

/// How join requests are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    #[default]
    AutoAccept,
    ManualAccept,
}

/// Display metadata of a community
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityIdentity {
    pub display_name: String,
    pub description: String,
    pub color: String,
    pub emoji: String,
    pub intro_message: String,
    pub outro_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityPermissions {
    pub access: AccessMode,
    pub ens_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSettings {
    pub pin_message_all_members_enabled: bool,
}

/// Editable community metadata, used by community edit events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityMetadata {
    pub identity: CommunityIdentity,
    pub permissions: CommunityPermissions,
    pub admin_settings: AdminSettings,
    pub tags: Vec<String>,
}

/// A member entry, either community-wide or inside one chat
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityMember {
    pub roles: RoleSet,
    pub channel_role: ChannelRole,
    pub last_update_clock: Clock,
}

impl CommunityMember {
    pub fn with_role(role: MemberRole) -> Self {
        let mut roles = RoleSet::new();
        if role != MemberRole::None {
            roles.insert(role);
        }
        Self {
            roles,
            ..Default::default()
        }
    }

    pub fn role(&self) -> MemberRole {
        effective_role(&self.roles)
    }

    pub fn is_privileged(&self) -> bool {
        self.role().is_privileged()
    }
}

/// Ban metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanInfo {
    pub delete_all_messages: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatIdentity {
    pub display_name: String,
    pub description: String,
    pub emoji: String,
    pub color: String,
    /// Unix seconds of the first message, zero when unknown
    pub first_message_timestamp: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatPermissions {
    pub access: AccessMode,
}

/// A channel of the community
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityChat {
    pub identity: ChatIdentity,
    pub permissions: ChatPermissions,
    /// Populated only for channels the member can see
    pub members: BTreeMap<MemberKey, CommunityMember>,
    pub category_id: String,
    pub position: i32,
    pub viewers_can_post_reactions: bool,
    pub hide_if_permissions_not_met: bool,
    /// Bloom filter over the true member set, for estimation by non-privileged members
    pub members_list: Option<MembershipFilter>,
}

impl CommunityChat {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            identity: ChatIdentity {
                display_name: display_name.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.category_id = category_id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.identity.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityCategory {
    pub category_id: String,
    pub name: String,
    pub position: i32,
}

/// Metadata of a token deployed for the community
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenMetadata {
    pub contract_addresses: BTreeMap<u64, String>,
    pub symbol: String,
    pub name: String,
    pub description: String,
    pub decimals: u32,
}

/// The full replicated description of a community
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityDescription {
    pub clock: Clock,
    pub identity: CommunityIdentity,
    pub permissions: CommunityPermissions,
    pub members: BTreeMap<MemberKey, CommunityMember>,
    pub chats: BTreeMap<ChatId, CommunityChat>,
    pub categories: BTreeMap<String, CommunityCategory>,
    pub tags: Vec<String>,
    pub token_permissions: BTreeMap<String, TokenPermission>,
    /// Legacy ban list, kept alongside `banned_members`
    pub ban_list: BTreeSet<MemberKey>,
    pub banned_members: BTreeMap<MemberKey, BanInfo>,
    pub admin_settings: AdminSettings,
    pub active_members_count: u64,
    pub tokens_metadata: Vec<TokenMetadata>,
    pub shard: Option<Shard>,
    pub archive_magnetlink_clock: Clock,
    /// Clock of the last delegated event applied, keyed by [`CommunityEvent::applied_key`]
    ///
    /// [`CommunityEvent::applied_key`]: super::events::CommunityEvent::applied_key
    pub last_applied_events: BTreeMap<String, Clock>,
}

impl CommunityDescription {
    pub fn has_member(&self, key: &MemberKey) -> bool {
        self.members.contains_key(key)
    }

    pub fn is_banned(&self, key: &MemberKey) -> bool {
        self.ban_list.contains(key) || self.banned_members.contains_key(key)
    }

    pub fn role_of(&self, key: &MemberKey) -> MemberRole {
        self.members
            .get(key)
            .map(CommunityMember::role)
            .unwrap_or(MemberRole::None)
    }

    pub fn is_encrypted(&self) -> bool {
        community_encrypted(&self.token_permissions)
    }

    pub fn metadata(&self) -> CommunityMetadata {
        CommunityMetadata {
            identity: self.identity.clone(),
            permissions: self.permissions.clone(),
            admin_settings: self.admin_settings.clone(),
            tags: self.tags.clone(),
        }
    }

    pub fn apply_metadata(&mut self, metadata: CommunityMetadata) {
        self.identity = metadata.identity;
        self.permissions = metadata.permissions;
        self.admin_settings = metadata.admin_settings;
        self.tags = metadata.tags;
    }

    /// Chats of a category ordered by position
    pub fn chats_in_category(&self, category_id: &str) -> Vec<(&ChatId, &CommunityChat)> {
        let mut chats: Vec<_> = self
            .chats
            .iter()
            .filter(|(_, c)| c.category_id == category_id)
            .collect();
        chats.sort_by_key(|(id, c)| (c.position, (*id).clone()));
        chats
    }

    /// Check that no banned identity holds membership
    pub fn ban_exclusivity_holds(&self) -> bool {
        self.members.keys().all(|k| !self.is_banned(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_community::types::Identity;

    #[test]
    fn test_member_role_collapses_role_set() {
        let member = CommunityMember::with_role(MemberRole::Admin);
        assert_eq!(member.role(), MemberRole::Admin);
        assert!(member.is_privileged());

        let plain = CommunityMember::with_role(MemberRole::None);
        assert!(plain.roles.is_empty());
        assert_eq!(plain.role(), MemberRole::None);
    }

    #[test]
    fn test_description_json_tolerates_missing_fields() {
        let description: CommunityDescription = serde_json::from_str(r#"{"clock": 42}"#).unwrap();
        assert_eq!(description.clock, 42);
        assert!(description.members.is_empty());
        assert!(description.shard.is_none());
    }

    #[test]
    fn test_ban_exclusivity() {
        let key = Identity::generate().public_key();
        let mut description = CommunityDescription::default();
        description.members.insert(key, CommunityMember::default());
        assert!(description.ban_exclusivity_holds());

        description.banned_members.insert(key, BanInfo::default());
        assert!(!description.ban_exclusivity_holds());
    }

    #[test]
    fn test_chats_in_category_sorted() {
        let mut description = CommunityDescription::default();
        let mut a = CommunityChat::new("a").with_category("cat");
        a.position = 1;
        let mut b = CommunityChat::new("b").with_category("cat");
        b.position = 0;
        description.chats.insert("a".to_string(), a);
        description.chats.insert("b".to_string(), b);
        description.chats.insert("c".to_string(), CommunityChat::new("c"));

        let ids: Vec<_> = description
            .chats_in_category("cat")
            .into_iter()
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
    }
}
