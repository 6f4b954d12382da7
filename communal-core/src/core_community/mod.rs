//! Community Governance Core
//!
//! The replicated record of a community (members, roles, chats, categories,
//! token permissions, bans) and every operation that changes it.
//!
//! ## Authority
//!
//! - **Control node**: holds the community signing key, applies changes
//!   directly and publishes signed descriptions with a Lamport clock
//! - **Delegated members**: Owners, TokenMasters and Admins propose changes
//!   as [`CommunityEvent`]s that the control node later replays
//!
//! ## Key Design Principles
//!
//! 1. Validate first, apply second
//! 2. Descriptions older than the current record are rejected
//! 3. A banned identity is never a member
//! 4. Pending events are pruned once reflected in a newer description

pub mod changes;
pub mod clock;
pub mod codec;
pub mod community;
pub mod crypto;
pub mod description;
pub mod encryption_keys;
pub mod errors;
pub mod events;
pub mod grant;
pub mod handle;
pub mod membership_filter;
mod mutator;
pub mod overlay;
pub mod permissions;
pub mod roles;
pub mod shard;
pub mod types;
pub mod validation;

pub use changes::{evaluate_community_changes, ChatChanges, CommunityChanges, EvaluationContext};
pub use clock::{next_clock, FixedTimeSource, SystemTimeSource, TimeSource};
pub use codec::{open_description, sign_description, BincodeCodec, DescriptionCodec, JsonCodec};
pub use community::{
    Community, CommunityConfig, CommunityOptions, CommunitySnapshot, EventsOutcome, LocalState,
    MessageKind, DEFAULT_BLOOM_FALSE_POSITIVE_RATE,
};
pub use description::{
    AccessMode, AdminSettings, BanInfo, ChatIdentity, ChatPermissions, CommunityCategory,
    CommunityChat, CommunityDescription, CommunityIdentity, CommunityMember, CommunityMetadata,
    CommunityPermissions, TokenMetadata,
};
pub use encryption_keys::{
    evaluate_encryption_key_actions, rekey_due, EncryptionKeyAction, EncryptionKeyActionType,
    EncryptionKeyActions, KeyScope,
};
pub use errors::{CommunityError, CommunityResult};
pub use events::{
    CommunityEvent, CommunityEventKind, CommunityEventType, CommunityEventsMessage, EventsData,
    SignedCommunityEvent,
};
pub use grant::{Grant, GRANT_EXPIRATION};
pub use handle::CommunityHandle;
pub use membership_filter::MembershipFilter;
pub use overlay::{FirstEventWins, LatestClockWins, MemberState, PendingResolution};
pub use permissions::{
    PermissionType, PermissionView, TokenCriteria, TokenKind, TokenPermission,
    TokenPermissionState,
};
pub use roles::{ChannelRole, MemberRole, RoleSet};
pub use shard::{PublicShardInfo, Shard, ShardKey};
pub use types::{ChatId, Clock, CommunityId, Identity, MemberKey};
