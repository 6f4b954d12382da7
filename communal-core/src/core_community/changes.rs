//! Structured diff between two description snapshots

use std::collections::BTreeMap;

use super::description::{
    CommunityCategory, CommunityChat, CommunityDescription, CommunityMember,
};
use super::permissions::TokenPermission;
use super::types::{ChatId, CommunityId, MemberKey};

/// Changes to a single chat that exists in both snapshots
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatChanges {
    pub members_added: BTreeMap<MemberKey, CommunityMember>,
    pub members_removed: BTreeMap<MemberKey, CommunityMember>,
    pub category_modified: Option<String>,
    pub position_modified: Option<i32>,
    pub first_message_timestamp_modified: Option<u32>,
    pub identity_modified: bool,
    pub permissions_modified: bool,
}

impl ChatChanges {
    pub fn is_empty(&self) -> bool {
        self == &ChatChanges::default()
    }
}

/// What changed between two snapshots of a community
#[derive(Debug, Clone, PartialEq)]
pub struct CommunityChanges {
    pub community_id: CommunityId,
    pub member_identity: MemberKey,

    pub members_added: BTreeMap<MemberKey, CommunityMember>,
    pub members_removed: BTreeMap<MemberKey, CommunityMember>,
    /// Members whose roles or channel role changed
    pub members_modified: BTreeMap<MemberKey, CommunityMember>,

    pub token_permissions_added: BTreeMap<String, TokenPermission>,
    pub token_permissions_modified: BTreeMap<String, TokenPermission>,
    pub token_permissions_removed: BTreeMap<String, TokenPermission>,

    pub chats_added: BTreeMap<ChatId, CommunityChat>,
    pub chats_removed: BTreeMap<ChatId, CommunityChat>,
    pub chats_modified: BTreeMap<ChatId, ChatChanges>,

    pub categories_added: BTreeMap<String, CommunityCategory>,
    pub categories_removed: BTreeMap<String, CommunityCategory>,
    pub categories_modified: BTreeMap<String, CommunityCategory>,

    /// Set when the authoritative signer changed
    pub control_node_changed: Option<MemberKey>,

    /// The local member was added while a join request was pending
    pub should_member_join: bool,
    /// The local member was removed without the option to re-request
    pub member_kicked: bool,
    /// The local member was removed from a token-gated community and may re-request
    pub member_soft_kicked: bool,

    pub banned: BTreeMap<MemberKey, bool>,
    pub unbanned: Vec<MemberKey>,
}

impl CommunityChanges {
    pub fn empty(community_id: CommunityId, member_identity: MemberKey) -> Self {
        Self {
            community_id,
            member_identity,
            members_added: BTreeMap::new(),
            members_removed: BTreeMap::new(),
            members_modified: BTreeMap::new(),
            token_permissions_added: BTreeMap::new(),
            token_permissions_modified: BTreeMap::new(),
            token_permissions_removed: BTreeMap::new(),
            chats_added: BTreeMap::new(),
            chats_removed: BTreeMap::new(),
            chats_modified: BTreeMap::new(),
            categories_added: BTreeMap::new(),
            categories_removed: BTreeMap::new(),
            categories_modified: BTreeMap::new(),
            control_node_changed: None,
            should_member_join: false,
            member_kicked: false,
            member_soft_kicked: false,
            banned: BTreeMap::new(),
            unbanned: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::empty(self.community_id, self.member_identity)
    }

    pub fn has_member_left(&self, key: &MemberKey) -> bool {
        self.members_removed.contains_key(key)
    }

    pub fn has_member_joined(&self, key: &MemberKey) -> bool {
        self.members_added.contains_key(key)
    }

    pub fn is_member_banned(&self, key: &MemberKey) -> bool {
        self.banned.contains_key(key)
    }

    pub fn is_member_unbanned(&self, key: &MemberKey) -> bool {
        self.unbanned.contains(key)
    }

    /// Record a chat member addition, creating the chat entry if needed
    pub fn add_chat_member(&mut self, chat_id: &str, key: MemberKey, member: CommunityMember) {
        self.chats_modified
            .entry(chat_id.to_string())
            .or_default()
            .members_added
            .insert(key, member);
    }

    pub fn remove_chat_member(&mut self, chat_id: &str, key: MemberKey, member: CommunityMember) {
        self.chats_modified
            .entry(chat_id.to_string())
            .or_default()
            .members_removed
            .insert(key, member);
    }
}

/// Inputs to the evaluator that are not part of the descriptions
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext {
    pub community_id: CommunityId,
    pub member_identity: MemberKey,
    /// A join request from the local member is pending
    pub requested_to_join: bool,
}

fn diff_maps<K: Ord + Clone, V: Clone + PartialEq>(
    old: &BTreeMap<K, V>,
    new: &BTreeMap<K, V>,
) -> (BTreeMap<K, V>, BTreeMap<K, V>, BTreeMap<K, V>) {
    let mut added = BTreeMap::new();
    let mut modified = BTreeMap::new();
    let mut removed = BTreeMap::new();
    for (key, value) in new {
        match old.get(key) {
            None => {
                added.insert(key.clone(), value.clone());
            }
            Some(previous) if previous != value => {
                modified.insert(key.clone(), value.clone());
            }
            Some(_) => {}
        }
    }
    for (key, value) in old {
        if !new.contains_key(key) {
            removed.insert(key.clone(), value.clone());
        }
    }
    (added, modified, removed)
}

pub(crate) fn chat_changes(old: &CommunityChat, new: &CommunityChat) -> ChatChanges {
    let (members_added, _, members_removed) = diff_maps(&old.members, &new.members);
    ChatChanges {
        members_added,
        members_removed,
        category_modified: (old.category_id != new.category_id).then(|| new.category_id.clone()),
        position_modified: (old.position != new.position).then_some(new.position),
        first_message_timestamp_modified: (old.identity.first_message_timestamp
            != new.identity.first_message_timestamp)
            .then_some(new.identity.first_message_timestamp),
        identity_modified: old.identity.display_name != new.identity.display_name
            || old.identity.description != new.identity.description
            || old.identity.emoji != new.identity.emoji
            || old.identity.color != new.identity.color,
        permissions_modified: old.permissions != new.permissions
            || old.viewers_can_post_reactions != new.viewers_can_post_reactions
            || old.hide_if_permissions_not_met != new.hide_if_permissions_not_met,
    }
}

/// Evaluate the changes from `old` to `new`
///
/// Pure and deterministic: evaluating the same pair twice yields identical
/// results and `evaluate_community_changes(x, x, ..)` is empty.
pub fn evaluate_community_changes(
    old: &CommunityDescription,
    new: &CommunityDescription,
    ctx: &EvaluationContext,
) -> CommunityChanges {
    let mut changes = CommunityChanges::empty(ctx.community_id, ctx.member_identity);

    let (members_added, members_modified, members_removed) = diff_maps(&old.members, &new.members);
    changes.members_added = members_added;
    changes.members_modified = members_modified;
    changes.members_removed = members_removed;

    let (added, modified, removed) = diff_maps(&old.token_permissions, &new.token_permissions);
    changes.token_permissions_added = added;
    changes.token_permissions_modified = modified;
    changes.token_permissions_removed = removed;

    let (added, modified, removed) = diff_maps(&old.categories, &new.categories);
    changes.categories_added = added;
    changes.categories_modified = modified;
    changes.categories_removed = removed;

    for (chat_id, chat) in &new.chats {
        match old.chats.get(chat_id) {
            None => {
                changes.chats_added.insert(chat_id.clone(), chat.clone());
            }
            Some(previous) => {
                let chat_diff = chat_changes(previous, chat);
                if !chat_diff.is_empty() {
                    changes.chats_modified.insert(chat_id.clone(), chat_diff);
                }
            }
        }
    }
    for (chat_id, chat) in &old.chats {
        if !new.chats.contains_key(chat_id) {
            changes.chats_removed.insert(chat_id.clone(), chat.clone());
        }
    }

    for (key, info) in &new.banned_members {
        if !old.banned_members.contains_key(key) {
            changes.banned.insert(*key, info.delete_all_messages);
        }
    }
    for key in &new.ban_list {
        if !old.is_banned(key) {
            changes.banned.entry(*key).or_insert(false);
        }
    }
    changes.unbanned = old
        .banned_members
        .keys()
        .chain(old.ban_list.iter())
        .filter(|k| !new.is_banned(k))
        .copied()
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    let me = ctx.member_identity;
    if changes.members_added.contains_key(&me) && ctx.requested_to_join {
        changes.should_member_join = true;
    }
    if changes.members_removed.contains_key(&me) {
        if !new.is_banned(&me) && new.is_encrypted() {
            changes.member_soft_kicked = true;
        } else {
            changes.member_kicked = true;
        }
    }

    changes
}
