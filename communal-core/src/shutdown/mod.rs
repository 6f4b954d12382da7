//! Graceful shutdown of background sync loops

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{error, info, warn};

/// Shutdown signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Graceful shutdown coordinator
///
/// Components register through [`ShutdownHandler`]. A graceful shutdown
/// broadcasts the signal and waits until every running component has
/// returned, or until the timeout elapses.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: Arc<RwLock<ShutdownState>>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    running_tx: watch::Sender<usize>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        let (running_tx, _) = watch::channel(0);

        Self {
            state: Arc::new(RwLock::new(ShutdownState::Running)),
            shutdown_tx,
            running_tx,
            timeout,
        }
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Number of components currently running
    pub fn running_components(&self) -> usize {
        *self.running_tx.borrow()
    }

    fn component_started(&self) {
        self.running_tx.send_modify(|n| *n += 1);
    }

    fn component_stopped(&self) {
        self.running_tx.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Initiate graceful shutdown and wait for components to stop
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown");

        let mut state = self.state.write().await;
        if *state != ShutdownState::Running {
            warn!("Shutdown already in progress");
            return;
        }
        *state = ShutdownState::ShuttingDown;
        drop(state);

        if self.shutdown_tx.send(ShutdownSignal::Graceful).is_err() {
            info!("No component subscribed to shutdown");
        }

        let mut running = self.running_tx.subscribe();
        let drained = tokio::time::timeout(self.timeout, running.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|r| r.is_ok());
        if !drained {
            warn!(
                running = self.running_components(),
                "Shutdown timeout elapsed with components still running"
            );
        }

        *self.state.write().await = ShutdownState::Shutdown;
        info!("Shutdown complete");
    }

    /// Initiate immediate shutdown
    pub async fn shutdown_immediately(&self) {
        warn!("Initiating immediate shutdown");

        *self.state.write().await = ShutdownState::Shutdown;

        if self.shutdown_tx.send(ShutdownSignal::Immediate).is_err() {
            info!("No component subscribed to shutdown");
        }
    }

    /// Check if shutdown is in progress
    pub async fn is_shutting_down(&self) -> bool {
        let state = self.state.read().await;
        *state == ShutdownState::ShuttingDown || *state == ShutdownState::Shutdown
    }

    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }

    /// Wait for shutdown signal
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        let _ = rx.recv().await;
    }
}

/// Runs one component until it finishes or shutdown is signalled
#[derive(Debug, Clone)]
pub struct ShutdownHandler {
    coordinator: Arc<ShutdownCoordinator>,
    component_name: String,
}

impl ShutdownHandler {
    pub fn new(coordinator: Arc<ShutdownCoordinator>, component_name: impl Into<String>) -> Self {
        Self {
            coordinator,
            component_name: component_name.into(),
        }
    }

    pub fn component_name(&self) -> &str {
        &self.component_name
    }

    /// Run a component with graceful shutdown support
    pub async fn run<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        // Subscribe before registering so a concurrent shutdown is not missed
        let mut shutdown_rx = self.coordinator.subscribe();
        self.coordinator.component_started();
        info!(component = %self.component_name, "Starting component");

        tokio::select! {
            _ = f() => {
                info!(component = %self.component_name, "Component completed normally");
            }
            signal = shutdown_rx.recv() => {
                match signal {
                    Ok(ShutdownSignal::Graceful) => {
                        info!(component = %self.component_name, "Component received graceful shutdown signal");
                    }
                    Ok(ShutdownSignal::Immediate) => {
                        warn!(component = %self.component_name, "Component received immediate shutdown signal");
                    }
                    Err(e) => {
                        error!(component = %self.component_name, error = %e, "Shutdown channel error");
                    }
                }
            }
        }

        self.coordinator.component_stopped();
        info!(component = %self.component_name, "Component shutdown complete");
    }
}

/// Install signal handlers for graceful shutdown
#[cfg(unix)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                coordinator.shutdown().await;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                coordinator.shutdown().await;
            }
        }
    });
}

/// Install signal handlers for graceful shutdown (Windows)
#[cfg(windows)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            return;
        }
        info!("Received Ctrl+C");
        coordinator.shutdown().await;
    });
}
