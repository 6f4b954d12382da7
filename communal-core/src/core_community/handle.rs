//! Serialized access to a single community

use std::sync::Arc;
use tokio::sync::Mutex;

use super::community::{Community, CommunitySnapshot};
use super::types::CommunityId;

/// Cloneable handle to a community guarded by one async mutex
///
/// All reads and writes of a community go through this lock. Callers must
/// not hold it across transport calls; take a snapshot or return the data
/// to publish from the closure instead.
#[derive(Debug, Clone)]
pub struct CommunityHandle {
    id: CommunityId,
    inner: Arc<Mutex<Community>>,
}

impl CommunityHandle {
    pub fn new(community: Community) -> Self {
        Self {
            id: community.id(),
            inner: Arc::new(Mutex::new(community)),
        }
    }

    pub fn id(&self) -> CommunityId {
        self.id
    }

    /// Run `f` with exclusive access to the community
    pub async fn mutate<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut Community) -> R,
    {
        let mut guard = self.inner.lock().await;
        f(&mut guard)
    }

    pub async fn read<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&Community) -> R,
    {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    /// Deep copy of the current state
    pub async fn snapshot(&self) -> CommunitySnapshot {
        self.read(Community::snapshot).await
    }
}
