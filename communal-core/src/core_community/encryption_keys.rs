//! Encryption key action evaluation
//!
//! Decides, from two snapshots of a community, which keys must be
//! generated, rotated, shared with new members or dropped. The decision is
//! pure; delivery lives in `core_sync::key_distributor`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::description::{CommunityDescription, CommunityMember};
use super::permissions::channel_encrypted;
use super::types::{ChatId, CommunityId, MemberKey};

/// What to do with a key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EncryptionKeyActionType {
    #[default]
    None,
    /// Encryption was switched on: generate the first key for all members
    Add,
    /// Encryption was switched off
    Remove,
    /// Members were removed, or the key is too old: rotate
    Rekey,
    /// Members were added: share the current key with them only
    SendToMembers,
}

/// Scope a key protects
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyScope {
    Community,
    Channel(ChatId),
}

impl KeyScope {
    /// Group identifier used by the encryptor
    pub fn group_id(&self, community_id: &CommunityId) -> Vec<u8> {
        match self {
            KeyScope::Community => community_id.as_bytes().to_vec(),
            KeyScope::Channel(chat_id) => community_id.chat_id(chat_id).into_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncryptionKeyAction {
    pub action_type: EncryptionKeyActionType,
    /// Recipients of the (new or current) key
    pub members: BTreeMap<MemberKey, CommunityMember>,
    /// Members that must not receive the key
    pub removed_members: BTreeMap<MemberKey, CommunityMember>,
}

impl EncryptionKeyAction {
    fn none() -> Self {
        Self::default()
    }

    fn with(
        action_type: EncryptionKeyActionType,
        members: BTreeMap<MemberKey, CommunityMember>,
    ) -> Self {
        Self {
            action_type,
            members,
            removed_members: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncryptionKeyActions {
    pub community_key_action: EncryptionKeyAction,
    pub channel_keys_actions: BTreeMap<ChatId, EncryptionKeyAction>,
}

impl EncryptionKeyActions {
    /// Every scope with an action other than `None`
    pub fn scoped(&self) -> impl Iterator<Item = (KeyScope, &EncryptionKeyAction)> {
        std::iter::once((KeyScope::Community, &self.community_key_action))
            .chain(
                self.channel_keys_actions
                    .iter()
                    .map(|(id, a)| (KeyScope::Channel(id.clone()), a)),
            )
            .filter(|(_, a)| a.action_type != EncryptionKeyActionType::None)
    }
}

/// Evaluate key actions going from `origin` to `modified`
pub fn evaluate_encryption_key_actions(
    origin: &CommunityDescription,
    modified: &CommunityDescription,
) -> EncryptionKeyActions {
    let community_key_action = evaluate_action(
        origin.is_encrypted(),
        modified.is_encrypted(),
        &origin.members,
        &modified.members,
    );

    let mut channel_keys_actions = BTreeMap::new();
    let empty = BTreeMap::new();
    for (chat_id, chat) in &modified.chats {
        let origin_chat = origin.chats.get(chat_id);
        let action = evaluate_action(
            origin_chat.is_some() && channel_encrypted(&origin.token_permissions, chat_id),
            channel_encrypted(&modified.token_permissions, chat_id),
            origin_chat.map(|c| &c.members).unwrap_or(&empty),
            &chat.members,
        );
        channel_keys_actions.insert(chat_id.clone(), action);
    }
    for chat_id in origin.chats.keys() {
        if !modified.chats.contains_key(chat_id)
            && channel_encrypted(&origin.token_permissions, chat_id)
        {
            channel_keys_actions.insert(
                chat_id.clone(),
                EncryptionKeyAction::with(EncryptionKeyActionType::Remove, BTreeMap::new()),
            );
        }
    }

    EncryptionKeyActions {
        community_key_action,
        channel_keys_actions,
    }
}

fn evaluate_action(
    origin_encrypted: bool,
    modified_encrypted: bool,
    origin_members: &BTreeMap<MemberKey, CommunityMember>,
    modified_members: &BTreeMap<MemberKey, CommunityMember>,
) -> EncryptionKeyAction {
    match (origin_encrypted, modified_encrypted) {
        (false, false) => EncryptionKeyAction::none(),
        (false, true) => {
            EncryptionKeyAction::with(EncryptionKeyActionType::Add, modified_members.clone())
        }
        (true, false) => EncryptionKeyAction::with(EncryptionKeyActionType::Remove, BTreeMap::new()),
        (true, true) => {
            let removed: BTreeMap<_, _> = origin_members
                .iter()
                .filter(|(k, _)| !modified_members.contains_key(*k))
                .map(|(k, v)| (*k, v.clone()))
                .collect();
            if !removed.is_empty() {
                return EncryptionKeyAction {
                    action_type: EncryptionKeyActionType::Rekey,
                    members: modified_members.clone(),
                    removed_members: removed,
                };
            }
            let added: BTreeMap<_, _> = modified_members
                .iter()
                .filter(|(k, _)| !origin_members.contains_key(*k))
                .map(|(k, v)| (*k, v.clone()))
                .collect();
            if added.is_empty() {
                EncryptionKeyAction::none()
            } else {
                EncryptionKeyAction::with(EncryptionKeyActionType::SendToMembers, added)
            }
        }
    }
}

/// Whether a key distributed at `distributed_at` (ms) must be rotated at `now` (ms)
pub fn rekey_due(distributed_at: Option<u64>, now: u64, interval: Duration) -> bool {
    match distributed_at {
        None => true,
        Some(at) => now.saturating_sub(at) >= interval.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_community::description::CommunityChat;
    use crate::core_community::permissions::{PermissionType, TokenPermission};
    use crate::core_community::types::Identity;

    fn gated(keys: &[MemberKey]) -> CommunityDescription {
        let mut description = CommunityDescription::default();
        description.token_permissions.insert(
            "member".to_string(),
            TokenPermission::new("member", PermissionType::BecomeMember),
        );
        for key in keys {
            description.members.insert(*key, CommunityMember::default());
        }
        description
    }

    #[test]
    fn test_removal_triggers_rekey() {
        let alice = Identity::generate().public_key();
        let bob = Identity::generate().public_key();
        let carol = Identity::generate().public_key();
        let origin = gated(&[alice, bob]);
        let modified = gated(&[alice, carol]);

        let actions = evaluate_encryption_key_actions(&origin, &modified);
        let action = &actions.community_key_action;
        assert_eq!(action.action_type, EncryptionKeyActionType::Rekey);
        assert!(action.removed_members.contains_key(&bob));
        assert!(!action.members.contains_key(&bob));
        assert!(action.members.contains_key(&carol));
    }

    #[test]
    fn test_addition_sends_to_new_members_only() {
        let alice = Identity::generate().public_key();
        let bob = Identity::generate().public_key();
        let actions = evaluate_encryption_key_actions(&gated(&[alice]), &gated(&[alice, bob]));
        let action = &actions.community_key_action;
        assert_eq!(action.action_type, EncryptionKeyActionType::SendToMembers);
        assert_eq!(action.members.keys().collect::<Vec<_>>(), vec![&bob]);
    }

    #[test]
    fn test_encryption_toggle() {
        let alice = Identity::generate().public_key();
        let mut open = gated(&[alice]);
        open.token_permissions.clear();

        let on = evaluate_encryption_key_actions(&open, &gated(&[alice]));
        assert_eq!(on.community_key_action.action_type, EncryptionKeyActionType::Add);

        let off = evaluate_encryption_key_actions(&gated(&[alice]), &open);
        assert_eq!(off.community_key_action.action_type, EncryptionKeyActionType::Remove);

        let none = evaluate_encryption_key_actions(&open, &open);
        assert_eq!(none.scoped().count(), 0);
    }

    #[test]
    fn test_channel_rekey_on_member_removal() {
        let alice = Identity::generate().public_key();
        let bob = Identity::generate().public_key();
        let mut origin = gated(&[alice, bob]);
        origin.token_permissions.insert(
            "view".to_string(),
            TokenPermission::new("view", PermissionType::CanViewChannel)
                .with_criteria(Default::default())
                .with_chats(vec!["vip".to_string()]),
        );
        let mut chat = CommunityChat::new("vip");
        chat.members.insert(alice, CommunityMember::default());
        chat.members.insert(bob, CommunityMember::default());
        origin.chats.insert("vip".to_string(), chat);

        let mut modified = origin.clone();
        modified.chats.get_mut("vip").unwrap().members.remove(&bob);

        let actions = evaluate_encryption_key_actions(&origin, &modified);
        assert_eq!(
            actions.channel_keys_actions["vip"].action_type,
            EncryptionKeyActionType::Rekey
        );
        assert_eq!(actions.community_key_action.action_type, EncryptionKeyActionType::None);
    }

    #[test]
    fn test_rekey_due() {
        let interval = Duration::from_secs(48 * 3600);
        assert!(rekey_due(None, 10, interval));
        assert!(!rekey_due(Some(1_000), 1_000 + 1_000, interval));
        assert!(rekey_due(Some(0), interval.as_millis() as u64, interval));
    }

    #[test]
    fn test_key_scope_group_ids() {
        let id = CommunityId::from_bytes([3; 32]);
        assert_eq!(KeyScope::Community.group_id(&id), vec![3; 32]);
        let channel = KeyScope::Channel("general".to_string()).group_id(&id);
        assert!(channel.ends_with(b"general"));
    }
}
