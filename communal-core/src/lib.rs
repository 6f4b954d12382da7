//! Communal: replicated community descriptions with delegated governance
//!
//! - [`core_community`]: the community record and every operation on it
//! - [`core_sync`]: publication, inbound handling, keys and grants
//! - [`config`], [`logging`], [`metrics`], [`shutdown`]: ambient services

pub mod config;
pub mod core_community;
pub mod core_sync;
pub mod logging;
pub mod metrics;
pub mod shutdown;

#[cfg(test)]
pub mod test_utils;

pub use config::Config;
pub use core_community::{Community, CommunityError, CommunityHandle, CommunityId, Identity, MemberKey};
pub use core_sync::{PublicationScheduler, SyncCollaborators, SyncError, SyncManager};
pub use logging::{init_logging, LogLevel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = Config::default();
    }
}
