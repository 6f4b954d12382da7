//! Community Sync Layer
//!
//! Connects [`Community`](crate::core_community::Community) state machines to
//! the outside world through narrow, injected collaborators:
//!
//! - [`Transport`]: authenticated delivery of [`WireMessage`]s
//! - [`CommunityStore`]: settings, join requests and revealed addresses
//! - [`KeyEncryptor`]: per-scope encryption keys and their sealed delivery
//! - [`OwnershipOracle`] and [`ActiveMembersSource`]: optional lookups
//!
//! [`SyncManager`] owns the registry of communities and handles inbound
//! messages; [`PublicationScheduler`] drives its periodic work.

pub mod capabilities;
pub mod errors;
pub mod key_distributor;
pub mod manager;
pub mod persistence;
pub mod privileged_sync;
pub mod scheduler;
pub mod subscription;
pub mod transport;

pub use capabilities::{ActiveMembersSource, OwnershipOracle};
pub use errors::{SyncError, SyncResult};
pub use key_distributor::{
    CommunityKeyDistributor, DefaultKeyEncryptor, DistributionReport, KeyEncryptor, SealedKey,
};
pub use manager::{SyncCollaborators, SyncManager};
pub use persistence::{
    CommunitySettings, CommunityStore, MemoryCommunityStore, RequestToJoin, RequestToJoinState,
};
pub use privileged_sync::PrivilegedUserSync;
pub use scheduler::PublicationScheduler;
pub use subscription::{CommunityNotification, CommunityNotifier};
pub use transport::{Destination, Transport, WireMessage};
