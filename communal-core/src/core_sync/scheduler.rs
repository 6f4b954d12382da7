//! Background loops driving a [`SyncManager`]
//!
//! Four independent loops, each registered with the shutdown coordinator:
//!
//! - **publication**: publishes controlled communities with unpublished
//!   changes, re-advertises the rest and retries failed key deliveries
//! - **rekey**: rotates keys older than the rekey interval
//! - **active members**: refreshes the active member count of one
//!   community per tick
//! - **grants**: reissues grants right away, then on every refresh interval

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::shutdown::{ShutdownCoordinator, ShutdownHandler};

use super::manager::SyncManager;

pub struct PublicationScheduler {
    manager: Arc<SyncManager>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl PublicationScheduler {
    pub fn new(manager: Arc<SyncManager>, coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self {
            manager,
            coordinator,
        }
    }

    /// Spawn every loop; they stop when the coordinator signals shutdown
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let config = self.manager.scheduler_config().clone();
        info!(
            publish_interval = ?config.publish_interval,
            rekey_tick = ?config.effective_rekey_tick(),
            "Starting community sync loops"
        );

        vec![
            self.spawn_loop("publication_loop", config.publish_interval, |manager| async move {
                let published = manager.publish_pending().await;
                let report = manager.retry_key_deliveries().await;
                if published > 0 || report.delivered > 0 {
                    debug!(published, redelivered = report.delivered, "Publication round complete");
                }
            }),
            self.spawn_loop("rekey_loop", config.effective_rekey_tick(), |manager| async move {
                let rotated = manager.rekey_overdue().await;
                if rotated > 0 {
                    info!(rotated, "Rotated encryption keys");
                }
            }),
            self.spawn_loop("active_members_loop", config.active_members_tick, |manager| async move {
                if let Err(e) = manager.update_active_members().await {
                    warn!(error = %e, "Failed to update active members count");
                }
            }),
            self.spawn_loop("grants_loop", config.grant_refresh_interval, |manager| async move {
                manager.refresh_grants().await;
            }),
        ]
    }

    fn spawn_loop<F, Fut>(&self, name: &'static str, period: Duration, round: F) -> JoinHandle<()>
    where
        F: Fn(Arc<SyncManager>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let manager = self.manager.clone();
        let handler = ShutdownHandler::new(self.coordinator.clone(), name);

        tokio::spawn(async move {
            handler
                .run(|| async move {
                    // The first tick completes immediately
                    let mut tick = interval(period);
                    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tick.tick().await;
                        round(manager.clone()).await;
                    }
                })
                .await;
        })
    }
}
