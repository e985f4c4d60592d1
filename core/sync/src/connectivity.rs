//! Network reachability tracking and edge-triggered sync.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::coordinator::SyncCoordinator;
use crate::state::SyncState;

/// Platform source of "connected" signals.
pub trait ReachabilitySource: Send + Sync {
    /// Initial probe, used once at engine start.
    fn is_reachable(&self) -> bool;

    /// Stream of connectivity signals. Repeated values are allowed.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<bool>;
}

/// Reachability fed by the host application (OS callbacks, tests, CLI flags).
#[derive(Debug)]
pub struct ManualReachability {
    connected: Mutex<bool>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<bool>>>,
}

impl ManualReachability {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: Mutex::new(connected),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Publish a signal to every live subscriber.
    pub fn set_connected(&self, connected: bool) {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner) = connected;
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(connected).is_ok());
    }

    /// Number of subscribers still listening.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

impl ReachabilitySource for ManualReachability {
    fn is_reachable(&self) -> bool {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<bool> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }
}

/// Single writer of `is_online`.
///
/// Every signal is recorded; only an offline→online edge triggers a sync pass.
pub struct ConnectivityMonitor {
    task: JoinHandle<()>,
}

impl ConnectivityMonitor {
    /// Probe the source, record the initial state and start listening.
    pub fn start(
        source: &dyn ReachabilitySource,
        state: Arc<SyncState>,
        coordinator: Arc<SyncCoordinator>,
    ) -> Self {
        let mut signals = source.subscribe();
        let initial = source.is_reachable();
        state.set_online(initial);
        info!("Connectivity monitor started (online: {})", initial);

        let task = tokio::spawn(async move {
            while let Some(online) = signals.recv().await {
                let was_online = state.set_online(online);
                match (was_online, online) {
                    (false, true) => {
                        info!("Connectivity restored, triggering sync");
                        let coordinator = coordinator.clone();
                        tokio::spawn(async move {
                            coordinator.trigger().await;
                        });
                    }
                    (true, false) => info!("Connectivity lost"),
                    _ => debug!("Connectivity unchanged (online: {})", online),
                }
            }
            debug!("Connectivity signal source closed");
        });

        Self { task }
    }

    /// Unsubscribe from the signal source.
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
