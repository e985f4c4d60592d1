//! Local durable storage for the offline engine.
//!
//! One embedded SQLite database holds three kinds of state:
//! - entity-mirror tables (`entity_<name>`) with opaque JSON payloads
//! - the `sync_queue` table of outbound mutations
//! - the `cache` table of time-bounded responses
//!
//! # Design Principles
//! - Single handle: every component shares one [`LocalStore`]
//! - Async surface: statements run on the blocking pool
//! - Idempotent schema: opening an existing database never fails on DDL

pub mod cache;
pub mod clock;
pub mod database;
pub mod entity;
pub mod queue;
pub mod schema;

pub use cache::ResponseCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use database::LocalStore;
pub use entity::{EntityRecord, EntitySyncStatus};
pub use queue::{HttpMethod, MutationQueue, MutationStatus, QueuedMutation, DEFAULT_MAX_RETRIES};
