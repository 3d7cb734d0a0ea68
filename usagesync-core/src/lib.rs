//! # usagesync-core
//!
//! Core library for usagesync - counts user-initiated requests to tracked
//! hosts and synchronizes the counts with a remote counter service.
//!
//! This library provides:
//! - Request classification against host-scoped allow/deny rules
//! - Per-scope debouncing of duplicate observations
//! - Crash-safe pending counts in a SQLite key-value store
//! - A sequence-fenced sync protocol (handshake, flush, conflict realignment)
//! - A tracking service that ties it all together behind a cloneable handle
//!
//! ## Data flow
//!
//! ```text
//! Observation → classify → debounce → pending (durable) → scheduler → flush → server
//! ```
//!
//! Counts are never lost by a crash or a failed flush: they stay pending until
//! the server confirms the flush that carried them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use usagesync_core::{Config, HttpTransport, Observation, RuleSet, SqliteStore, Tracker};
//!
//! # async fn run() -> usagesync_core::Result<()> {
//! let config = Config::load()?;
//! let store = Arc::new(SqliteStore::open(&Config::store_path())?);
//! let transport = Arc::new(HttpTransport::new(&config.collector)?);
//! let rules = RuleSet::load(config.rules.as_ref())?;
//!
//! let tracker = Tracker::start(&config.tracking, store, transport, rules)?;
//! tracker
//!     .observe(Observation::new("POST", "https://chatgpt.com/backend-api/conversation", "tab-1"))
//!     .await?;
//! tracker.shutdown().await?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use classifier::RuleSet;
pub use config::Config;
pub use engine::{FlushOutcome, HandshakeOutcome, SyncEngine};
pub use error::{Error, Result};
pub use pending::PendingAggregator;
pub use service::Tracker;
pub use store::{KvStore, MemoryStore, SqliteStore};
pub use transport::{CounterTransport, HttpTransport, Ledger, MemoryTransport};
pub use types::*;

// Public modules
pub mod classifier;
pub mod config;
pub mod debounce;
pub mod debug_log;
pub mod engine;
pub mod error;
pub mod logging;
pub mod pending;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transport;
pub mod types;
