//! slotfill-core: gap detection and backfill for time-sliced post archives
//!
//! An archive stores one NDJSON artifact per fixed time slot. Outages and
//! rate limiting leave slots missing, truncated, or filled with captured
//! error bodies. This crate finds those slots and refills them from a
//! newest-first search API by walking its anchors backward.
//!
//! # Architecture
//!
//! ```text
//! Slot Model → Inventory Cache → Gap Detector
//!                                     ↓
//!                  Backward Paginator (search / timeline)
//!                                     ↓
//!                        Merge/Writer → Verifier → RunReport
//! ```
//!
//! # Modules
//!
//! - `slot`: slot enumeration and key/object-key derivation
//! - `record`: fetched records and NDJSON artifacts
//! - `anchor`: aid and timestamp pagination anchors
//! - `storage`: storage backend trait with filesystem and in-memory backends
//! - `inventory`: per-run snapshot of what every area holds
//! - `gap`: record-count classification and the gap list
//! - `search`: the upstream page capability
//! - `paginator`: the backward walk and its termination policy
//! - `token_bucket` / `retry`: shared rate gate and backoff
//! - `merge`: dedup and persistence into the output area
//! - `verify`: post-run coverage checks and slot inspection
//! - `pipeline` / `report`: run orchestration and its summary
//! - `config` / `logging` / `error`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod anchor;
pub mod config;
pub mod error;
pub mod gap;
pub mod inventory;
pub mod language;
pub mod logging;
pub mod merge;
pub mod paginator;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod retry;
pub mod search;
pub mod slot;
pub mod storage;
pub mod token_bucket;
pub mod verify;

pub use error::{ApiError, Error, Result, StorageError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
