//! Counter service protocol
//!
//! Three exchanges make up the wire contract:
//!
//! - `GET /status?client_id=..` → `{ "last_seq": n }`, used by the startup handshake
//! - `POST /add` with `{ client_id, seq, deltas, ts }` → `{ "last_seq": n }` when
//!   applied, HTTP 409 `{ "expected_next": n }` when `seq` is not the next one
//! - `GET /counters?client_id=..` → `{ "counters": { host: total } }`, display only
//!
//! The server applies an `add` only when `seq == last_seq + 1` for that client.
//! That fence is the whole idempotency mechanism.

mod http;
mod ledger;

pub use http::HttpTransport;
pub use ledger::{Ledger, MemoryTransport};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::PendingCounts;

/// Body of `POST /add`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRequest {
    pub client_id: String,
    /// Candidate sequence number: local seq + 1
    pub seq: u64,
    /// Strictly positive per-host deltas
    pub deltas: PendingCounts,
    /// Client timestamp, milliseconds since epoch
    pub ts: i64,
}

/// Server answer to an `add`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Deltas applied; `last_seq` is the newly applied sequence number
    Applied { last_seq: u64 },
    /// `seq` was not the next one; the server would have accepted `expected_next`
    Conflict { expected_next: u64 },
}

/// `{ "last_seq": n }`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LastSeqResponse {
    pub last_seq: u64,
}

/// `{ "expected_next": n }`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConflictResponse {
    pub expected_next: u64,
}

/// `{ "counters": { .. } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountersResponse {
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
}

/// Connection to a counter service
///
/// Any failure other than a sequence conflict (network, timeout, unexpected
/// status, malformed body) is an `Err`; callers treat it as transient.
#[async_trait]
pub trait CounterTransport: Send + Sync {
    /// Last sequence number the server applied for this client
    async fn last_applied(&self, client_id: &str) -> Result<u64>;

    /// Submit one flush
    async fn add(&self, request: &AddRequest) -> Result<AddOutcome>;

    /// Server-side totals, for display only
    async fn counters(&self, client_id: &str) -> Result<BTreeMap<String, u64>>;
}
