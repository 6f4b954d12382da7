//! Member roles and channel roles

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::permissions::PermissionType;

/// Community-wide role of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemberRole {
    /// Regular member without privileges
    None,
    /// Holder of the owner token
    Owner,
    /// Administrator
    Admin,
    /// Holder of a token master token
    TokenMaster,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::None => "none",
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::TokenMaster => "token_master",
        }
    }

    /// Whether the role grants any governance privilege
    pub fn is_privileged(&self) -> bool {
        !matches!(self, MemberRole::None)
    }

    /// Role implied by a privileged token permission, if any
    pub fn from_permission_type(permission_type: PermissionType) -> Option<Self> {
        match permission_type {
            PermissionType::BecomeAdmin => Some(MemberRole::Admin),
            PermissionType::BecomeTokenMaster => Some(MemberRole::TokenMaster),
            PermissionType::BecomeTokenOwner => Some(MemberRole::Owner),
            _ => None,
        }
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role of a member inside one channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelRole {
    #[default]
    Poster,
    Viewer,
}

/// Role set as stored on a member
///
/// The current API keeps exactly one role in the set. The deprecated
/// additive path may leave more than one.
pub type RoleSet = BTreeSet<MemberRole>;

/// Collapse a role set into its effective role, highest privilege first
pub fn effective_role(roles: &RoleSet) -> MemberRole {
    [MemberRole::Owner, MemberRole::TokenMaster, MemberRole::Admin]
        .into_iter()
        .find(|r| roles.contains(r))
        .unwrap_or(MemberRole::None)
}

/// Whether `role` may create or edit a token permission of `permission_type`
pub fn can_role_modify_permission(role: MemberRole, permission_type: PermissionType) -> bool {
    use PermissionType::*;
    match role {
        MemberRole::Owner => permission_type != BecomeTokenOwner,
        MemberRole::TokenMaster => matches!(
            permission_type,
            BecomeMember | BecomeAdmin | CanViewChannel | CanViewAndPostChannel
        ),
        MemberRole::Admin => matches!(
            permission_type,
            BecomeMember | CanViewChannel | CanViewAndPostChannel
        ),
        MemberRole::None => false,
    }
}

/// Whether a proposer holding `proposer` may act on a member holding `target`
pub fn can_role_target(proposer: MemberRole, target: MemberRole) -> bool {
    match proposer {
        MemberRole::Owner => target != MemberRole::Owner,
        MemberRole::TokenMaster | MemberRole::Admin => target == MemberRole::None,
        MemberRole::None => false,
    }
}
