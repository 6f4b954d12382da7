//! Token-gated permissions attached to a community or its channels

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::ChatId;

/// What a token permission grants to holders of the matching tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PermissionType {
    BecomeMember,
    BecomeAdmin,
    CanViewChannel,
    CanViewAndPostChannel,
    BecomeTokenMaster,
    BecomeTokenOwner,
}

impl PermissionType {
    /// Permission types that apply to channels rather than the community
    pub fn is_channel_permission(&self) -> bool {
        matches!(
            self,
            PermissionType::CanViewChannel | PermissionType::CanViewAndPostChannel
        )
    }

    /// Permission types that promote a member to a privileged role
    pub fn is_privileged(&self) -> bool {
        matches!(
            self,
            PermissionType::BecomeAdmin
                | PermissionType::BecomeTokenMaster
                | PermissionType::BecomeTokenOwner
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    #[default]
    Erc20,
    Erc721,
    Ens,
}

/// A single token requirement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenCriteria {
    /// Chain id to contract address
    pub contract_addresses: BTreeMap<u64, String>,
    pub kind: TokenKind,
    pub symbol: String,
    pub name: String,
    /// Decimal amount required, kept as a string to avoid float rounding
    pub amount: String,
    pub token_ids: Vec<u64>,
    pub ens_pattern: String,
    pub decimals: u64,
}

/// A typed, token-gated permission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenPermission {
    pub id: String,
    pub permission_type: PermissionType,
    pub token_criteria: Vec<TokenCriteria>,
    /// Local channel ids this permission applies to
    pub chat_ids: Vec<ChatId>,
    pub is_private: bool,
}

impl Default for TokenPermission {
    fn default() -> Self {
        Self {
            id: String::new(),
            permission_type: PermissionType::BecomeMember,
            token_criteria: Vec::new(),
            chat_ids: Vec::new(),
            is_private: false,
        }
    }
}

impl TokenPermission {
    pub fn new(id: impl Into<String>, permission_type: PermissionType) -> Self {
        Self {
            id: id.into(),
            permission_type,
            ..Default::default()
        }
    }

    pub fn with_criteria(mut self, criteria: TokenCriteria) -> Self {
        self.token_criteria.push(criteria);
        self
    }

    pub fn with_chats(mut self, chat_ids: impl IntoIterator<Item = ChatId>) -> Self {
        self.chat_ids.extend(chat_ids);
        self
    }

    pub fn applies_to_chat(&self, chat_id: &str) -> bool {
        self.chat_ids.iter().any(|c| c == chat_id)
    }

    /// A channel permission without criteria makes the channel public
    pub fn is_open_to_everyone(&self) -> bool {
        self.permission_type == PermissionType::CanViewChannel && self.token_criteria.is_empty()
    }
}

/// Pending state of a token permission as seen through the event overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenPermissionState {
    Approved,
    AdditionPending,
    UpdatePending,
    RemovalPending,
}

/// A permission together with its overlay state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionView {
    pub permission: TokenPermission,
    pub state: TokenPermissionState,
}

/// The community is encrypted when membership is token gated
pub fn community_encrypted(permissions: &BTreeMap<String, TokenPermission>) -> bool {
    permissions
        .values()
        .any(|p| p.permission_type == PermissionType::BecomeMember)
}

/// A channel is encrypted when some permission gates it and none opens it to everyone
pub fn channel_encrypted(permissions: &BTreeMap<String, TokenPermission>, chat_id: &str) -> bool {
    let mut gated = false;
    for permission in permissions.values().filter(|p| p.applies_to_chat(chat_id)) {
        if permission.is_open_to_everyone() {
            return false;
        }
        gated = true;
    }
    gated
}

/// Permissions of `permission_type` that reference `chat_id`
pub fn channel_permissions<'a>(
    permissions: &'a BTreeMap<String, TokenPermission>,
    chat_id: &'a str,
) -> impl Iterator<Item = &'a TokenPermission> + 'a {
    permissions
        .values()
        .filter(move |p| p.permission_type.is_channel_permission() && p.applies_to_chat(chat_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria() -> TokenCriteria {
        TokenCriteria {
            symbol: "SNT".to_string(),
            amount: "10".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_community_encrypted_requires_become_member() {
        let mut permissions = BTreeMap::new();
        assert!(!community_encrypted(&permissions));

        permissions.insert(
            "admin".to_string(),
            TokenPermission::new("admin", PermissionType::BecomeAdmin).with_criteria(criteria()),
        );
        assert!(!community_encrypted(&permissions));

        permissions.insert(
            "member".to_string(),
            TokenPermission::new("member", PermissionType::BecomeMember).with_criteria(criteria()),
        );
        assert!(community_encrypted(&permissions));
    }

    #[test]
    fn test_channel_encrypted() {
        let mut permissions = BTreeMap::new();
        permissions.insert(
            "view".to_string(),
            TokenPermission::new("view", PermissionType::CanViewChannel)
                .with_criteria(criteria())
                .with_chats(vec!["general".to_string()]),
        );
        assert!(channel_encrypted(&permissions, "general"));
        assert!(!channel_encrypted(&permissions, "random"));

        permissions.insert(
            "open".to_string(),
            TokenPermission::new("open", PermissionType::CanViewChannel)
                .with_chats(vec!["general".to_string()]),
        );
        assert!(!channel_encrypted(&permissions, "general"));
    }

    #[test]
    fn test_channel_permissions_filter() {
        let mut permissions = BTreeMap::new();
        permissions.insert(
            "a".to_string(),
            TokenPermission::new("a", PermissionType::CanViewAndPostChannel)
                .with_chats(vec!["x".to_string()]),
        );
        permissions.insert(
            "b".to_string(),
            TokenPermission::new("b", PermissionType::BecomeMember),
        );
        assert_eq!(channel_permissions(&permissions, "x").count(), 1);
    }
}
