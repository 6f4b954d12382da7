//! Provisional governance actions proposed by delegated members
//!
//! A privileged member without the control node's key cannot sign a new
//! description. Instead it signs a [`CommunityEvent`] and broadcasts it.
//! The control node validates the event against the authorization matrix
//! and replays it into the authoritative record. Until then other
//! privileged members render the event as a pending overlay.

use serde::{Deserialize, Serialize};

use super::description::{CommunityCategory, CommunityChat, CommunityMetadata, TokenMetadata};
use super::errors::{CommunityError, CommunityResult};
use super::permissions::TokenPermission;
use super::roles::{can_role_modify_permission, can_role_target, MemberRole};
use super::types::{open_signed_payload, ChatId, Clock, CommunityId, Identity, MemberKey};

/// How far past the control node's clock an event clock may run
pub const MAX_EVENT_CLOCK_LEAD: Clock = 10_000;

/// Event discriminant used by the authorization matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommunityEventType {
    CommunityEdit,
    TokenPermissionChange,
    TokenPermissionDelete,
    CategoryCreate,
    CategoryEdit,
    CategoryDelete,
    CategoryReorder,
    ChannelCreate,
    ChannelEdit,
    ChannelDelete,
    ChannelReorder,
    RequestToJoinAccept,
    RequestToJoinReject,
    MemberKick,
    MemberBan,
    MemberUnban,
    DeleteBannedMemberMessages,
    TokenAdd,
}

impl CommunityEventType {
    /// Events acting on another member, subject to the target-role check
    pub fn targets_member(&self) -> bool {
        matches!(
            self,
            CommunityEventType::MemberKick
                | CommunityEventType::MemberBan
                | CommunityEventType::MemberUnban
                | CommunityEventType::DeleteBannedMemberMessages
        )
    }
}

/// Role to event-type authorization
pub fn role_can_perform(role: MemberRole, event_type: CommunityEventType) -> bool {
    match role {
        MemberRole::Owner => true,
        MemberRole::TokenMaster => {
            event_type == CommunityEventType::TokenAdd || admin_event(event_type)
        }
        MemberRole::Admin => admin_event(event_type),
        MemberRole::None => false,
    }
}

fn admin_event(event_type: CommunityEventType) -> bool {
    use CommunityEventType::*;
    matches!(
        event_type,
        CommunityEdit
            | TokenPermissionChange
            | TokenPermissionDelete
            | CategoryCreate
            | CategoryEdit
            | CategoryDelete
            | CategoryReorder
            | ChannelCreate
            | ChannelEdit
            | ChannelDelete
            | ChannelReorder
            | RequestToJoinAccept
            | RequestToJoinReject
            | MemberKick
            | MemberBan
            | MemberUnban
            | DeleteBannedMemberMessages
    )
}

/// The full event authorization matrix: proposer role, target role and event
pub fn roles_authorized_to_perform_event(
    proposer: MemberRole,
    target: MemberRole,
    event: &CommunityEvent,
) -> bool {
    let event_type = event.event_type();
    if !role_can_perform(proposer, event_type) {
        return false;
    }
    if event_type.targets_member() && !can_role_target(proposer, target) {
        return false;
    }
    match event.token_permission() {
        Some(permission) => can_role_modify_permission(proposer, permission.permission_type),
        None => true,
    }
}

/// Payload of a community event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommunityEventKind {
    CommunityEdit { metadata: CommunityMetadata },
    TokenPermissionChange { permission: TokenPermission },
    TokenPermissionDelete { permission: TokenPermission },
    CategoryCreate { category: CommunityCategory, chat_ids: Vec<ChatId> },
    CategoryEdit { category: CommunityCategory, chat_ids: Vec<ChatId> },
    CategoryDelete { category_id: String },
    CategoryReorder { category_id: String, position: i32 },
    ChannelCreate { chat_id: ChatId, chat: CommunityChat },
    ChannelEdit { chat_id: ChatId, chat: CommunityChat },
    ChannelDelete { chat_id: ChatId },
    ChannelReorder { chat_id: ChatId, category_id: String, position: i32 },
    RequestToJoinAccept { member: MemberKey },
    RequestToJoinReject { member: MemberKey },
    MemberKick { member: MemberKey },
    MemberBan { member: MemberKey, delete_all_messages: bool },
    MemberUnban { member: MemberKey },
    DeleteBannedMemberMessages { member: MemberKey },
    TokenAdd { metadata: TokenMetadata },
}

/// A provisional action
///
/// `clock` is strictly greater than the clock of the description the event
/// was built against and than every event its proposer recorded before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityEvent {
    pub clock: Clock,
    pub kind: CommunityEventKind,
}

impl CommunityEvent {
    pub fn new(clock: Clock, kind: CommunityEventKind) -> Self {
        Self { clock, kind }
    }

    pub fn event_type(&self) -> CommunityEventType {
        use CommunityEventKind as K;
        use CommunityEventType as T;
        match &self.kind {
            K::CommunityEdit { .. } => T::CommunityEdit,
            K::TokenPermissionChange { .. } => T::TokenPermissionChange,
            K::TokenPermissionDelete { .. } => T::TokenPermissionDelete,
            K::CategoryCreate { .. } => T::CategoryCreate,
            K::CategoryEdit { .. } => T::CategoryEdit,
            K::CategoryDelete { .. } => T::CategoryDelete,
            K::CategoryReorder { .. } => T::CategoryReorder,
            K::ChannelCreate { .. } => T::ChannelCreate,
            K::ChannelEdit { .. } => T::ChannelEdit,
            K::ChannelDelete { .. } => T::ChannelDelete,
            K::ChannelReorder { .. } => T::ChannelReorder,
            K::RequestToJoinAccept { .. } => T::RequestToJoinAccept,
            K::RequestToJoinReject { .. } => T::RequestToJoinReject,
            K::MemberKick { .. } => T::MemberKick,
            K::MemberBan { .. } => T::MemberBan,
            K::MemberUnban { .. } => T::MemberUnban,
            K::DeleteBannedMemberMessages { .. } => T::DeleteBannedMemberMessages,
            K::TokenAdd { .. } => T::TokenAdd,
        }
    }

    /// Member the event acts on, if any
    pub fn target_member(&self) -> Option<MemberKey> {
        use CommunityEventKind as K;
        match &self.kind {
            K::RequestToJoinAccept { member }
            | K::RequestToJoinReject { member }
            | K::MemberKick { member }
            | K::MemberBan { member, .. }
            | K::MemberUnban { member }
            | K::DeleteBannedMemberMessages { member } => Some(*member),
            _ => None,
        }
    }

    /// Identifies the action and its target for replay protection
    ///
    /// Two events share a key when a later one would overwrite the effect
    /// of an earlier one.
    pub fn applied_key(&self) -> String {
        use CommunityEventKind as K;
        let target = match &self.kind {
            K::CommunityEdit { .. } => String::new(),
            K::TokenPermissionChange { permission } | K::TokenPermissionDelete { permission } => {
                permission.id.clone()
            }
            K::CategoryCreate { category, .. } | K::CategoryEdit { category, .. } => {
                category.category_id.clone()
            }
            K::CategoryDelete { category_id } | K::CategoryReorder { category_id, .. } => {
                category_id.clone()
            }
            K::ChannelCreate { chat_id, .. }
            | K::ChannelEdit { chat_id, .. }
            | K::ChannelDelete { chat_id }
            | K::ChannelReorder { chat_id, .. } => chat_id.clone(),
            K::TokenAdd { metadata } => metadata
                .contract_addresses
                .iter()
                .map(|(chain, address)| format!("{}:{}", chain, address))
                .collect::<Vec<_>>()
                .join(","),
            K::RequestToJoinAccept { member }
            | K::RequestToJoinReject { member }
            | K::MemberKick { member }
            | K::MemberBan { member, .. }
            | K::MemberUnban { member }
            | K::DeleteBannedMemberMessages { member } => member.to_hex(),
        };
        format!("{:?}/{}", self.event_type(), target)
    }

    pub fn token_permission(&self) -> Option<&TokenPermission> {
        match &self.kind {
            CommunityEventKind::TokenPermissionChange { permission }
            | CommunityEventKind::TokenPermissionDelete { permission } => Some(permission),
            _ => None,
        }
    }

    /// Check the event is self-consistent
    pub fn validate(&self) -> CommunityResult<()> {
        use CommunityEventKind as K;
        if self.clock == 0 {
            return Err(CommunityError::InvalidEvent("clock is zero".to_string()));
        }
        let missing = |what: &str| -> CommunityResult<()> {
            Err(CommunityError::InvalidEvent(format!("missing {}", what)))
        };
        match &self.kind {
            K::TokenPermissionChange { permission } | K::TokenPermissionDelete { permission } => {
                if permission.id.is_empty() {
                    return missing("token permission id");
                }
            }
            K::CategoryCreate { category, .. } | K::CategoryEdit { category, .. } => {
                if category.category_id.is_empty() {
                    return missing("category id");
                }
                if category.name.is_empty() {
                    return missing("category name");
                }
            }
            K::CategoryDelete { category_id } | K::CategoryReorder { category_id, .. } => {
                if category_id.is_empty() {
                    return missing("category id");
                }
            }
            K::ChannelCreate { chat_id, chat } | K::ChannelEdit { chat_id, chat } => {
                if chat_id.is_empty() {
                    return missing("chat id");
                }
                if chat.identity.display_name.is_empty() {
                    return missing("chat display name");
                }
            }
            K::ChannelDelete { chat_id } | K::ChannelReorder { chat_id, .. } => {
                if chat_id.is_empty() {
                    return missing("chat id");
                }
            }
            K::CommunityEdit { metadata } => {
                if metadata.identity.display_name.is_empty() {
                    return missing("community display name");
                }
            }
            K::TokenAdd { metadata } => {
                if metadata.contract_addresses.is_empty() {
                    return missing("token contract address");
                }
            }
            K::RequestToJoinAccept { .. }
            | K::RequestToJoinReject { .. }
            | K::MemberKick { .. }
            | K::MemberBan { .. }
            | K::MemberUnban { .. }
            | K::DeleteBannedMemberMessages { .. } => {}
        }
        Ok(())
    }

    /// Sign the event as `proposer`
    pub fn sign(&self, proposer: &Identity) -> CommunityResult<SignedCommunityEvent> {
        Ok(SignedCommunityEvent {
            signer: proposer.public_key(),
            data: proposer.sign_payload(&serde_json::to_vec(self)?),
        })
    }
}

/// An event together with its proposer and `signature || payload`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCommunityEvent {
    pub signer: MemberKey,
    pub data: Vec<u8>,
}

impl SignedCommunityEvent {
    /// Check the signature and decode the event
    pub fn open(&self) -> CommunityResult<CommunityEvent> {
        let payload = open_signed_payload(&self.data, &self.signer)?;
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Batch of events published by a delegated member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityEventsMessage {
    pub community_id: CommunityId,
    /// Signed description the events were computed against
    pub events_base_description: Vec<u8>,
    pub events: Vec<SignedCommunityEvent>,
}

/// Pending events and the description snapshot they apply to
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventsData {
    pub base_clock: Clock,
    pub events_base_description: Vec<u8>,
    pub events: Vec<CommunityEvent>,
}

impl EventsData {
    pub fn new(base_clock: Clock, events_base_description: Vec<u8>) -> Self {
        Self {
            base_clock,
            events_base_description,
            events: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
