//! Offline-first synchronization core for the Aula mobile client
//!
//! Provides:
//! - Local SQLite queue of pending user actions, replayed when connectivity
//!   returns
//! - A per-scope synchronization engine with single-flight locking, throttled
//!   automatic resyncs and at-most-once delivery
//! - Attempt collision reconciliation for tracked learning sessions
//! - A polling loop that merges confirmed server items with pending local ones

pub mod action;
pub mod collision;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod poller;
pub mod store;
pub mod tracks;

pub use action::{ActionKind, PendingAction, ScopeKey, SyncOutcome};
pub use collision::{snapshot_equals, AttemptBackend, AttemptSyncer};
pub use engine::{EngineConfig, ScopeAdapter, SyncEngine, SYNC_COMPLETED_EVENT};
pub use error::{SyncError, SyncResult};
pub use gateway::{AlwaysOnline, Connectivity, HttpSiteClient, HttpSiteConfig, SiteClient};
pub use poller::{merge_thread, PollerConfig, RecentWindow, RefreshLoop, SendGuard, ThreadFetcher, ThreadItem};
pub use store::{ActionStore, LocalStoreConfig};
pub use tracks::{StateMap, StoredTrack, TrackEntry, TrackFilter, TrackStore};
