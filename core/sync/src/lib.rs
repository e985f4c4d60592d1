//! Offsync Sync Engine
//!
//! This module replays locally queued mutations against the remote service:
//! - Connectivity monitoring with offline→online edge detection
//! - A single-flight sync coordinator with per-mutation retry accounting
//! - Exponential backoff for pass-level failures
//! - HTTP and scripted transports
//! - The [`OfflineEngine`] façade tying storage and sync together

pub mod connectivity;
pub mod coordinator;
pub mod engine;
pub mod retry;
pub mod state;
pub mod transport;

// Re-export main types
pub use connectivity::{ConnectivityMonitor, ManualReachability, ReachabilitySource};
pub use coordinator::{CoordinatorConfig, SyncCoordinator, SyncEvent, SyncOutcome, SyncReport};
pub use engine::{OfflineConfig, OfflineEngine, OfflineStats};
pub use retry::BackoffConfig;
pub use state::{PassGuard, SyncPhase, SyncState};
pub use transport::{HttpTransport, MockReply, MockTransport, Transport, DEFAULT_REQUEST_TIMEOUT};
