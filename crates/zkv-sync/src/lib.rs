//! zkv-sync: naming-layer sync coordinator and vault write path
//!
//! - `naming`: signed mutable records and the `NamingLayer` backends
//! - `coordinator`: publish/resolve with optimistic-concurrency conflict detection
//! - `state`: persisted last-observed sequence cache
//! - `content`: content-addressed blob store over opendal
//! - `cleanup`: best-effort, queued-for-retry unpins
//! - `engine`: folder/file operations tying keys, records and publishing together

pub mod cleanup;
pub mod coordinator;
pub mod content;
pub mod engine;
pub mod naming;
pub mod state;

pub use cleanup::{CleanupQueue, CleanupReport};
pub use coordinator::{BatchItem, PublishResult, ResolvedRecord, RetryPolicy, SyncCoordinator};
pub use content::{build_operator, ContentStore, OpendalContentStore};
pub use engine::VaultEngine;
pub use naming::{MemoryNamingLayer, NamingLayer, ObjectStoreNamingLayer, SignedRecord};
pub use state::SequenceCache;
