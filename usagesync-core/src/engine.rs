//! Sync protocol engine
//!
//! Owns the durable `(client_id, seq)` pair and runs the two exchanges with
//! the counter service:
//!
//! - **Handshake** (every process start): adopt the server's last applied
//!   seq. On failure keep the stored value; the conflict path corrects it
//!   on the next flush.
//! - **Flush**: send the pending snapshot under `seq + 1`.
//!   - applied: reconcile exactly the sent snapshot, then store the returned seq
//!   - conflict: realign `seq` to `expected_next - 1`, leave pending untouched,
//!     and let the caller retry
//!   - anything else: change nothing
//!
//! ```text
//! Uninitialized → Handshaking → Idle ⇄ Flushing
//! ```
//!
//! Transport failures are outcomes, not errors. Store failures are errors:
//! losing a seq or pending write would break counting, so they propagate.
//! Store writes made while an exchange is running go through
//! [`store::blocking`].
//!
//! The engine does not serialize callers. The service runs at most one
//! handshake or flush at a time and never flushes before the handshake.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::error::Result;
use crate::pending::PendingAggregator;
use crate::store::{self, KvStore, CLIENT_ID_KEY, SEQ_KEY};
use crate::transport::{AddOutcome, AddRequest, CounterTransport};
use crate::types::PendingCounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Handshaking,
    Idle,
    Flushing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Local seq now equals the server's last applied seq
    Synced { last_seq: u64, previous: u64 },
    /// Server unreachable or answered badly; local seq kept
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing pending, nothing sent
    Empty,
    /// Server applied the snapshot
    Applied { seq: u64, sent: PendingCounts },
    /// Server expected another seq; local seq realigned, pending untouched
    Conflict { expected_next: u64, realigned_seq: u64 },
    /// Transient failure; nothing changed
    Failed { reason: String },
}

pub struct SyncEngine {
    store: Arc<dyn KvStore>,
    transport: Arc<dyn CounterTransport>,
    client_id: String,
    seq: AtomicU64,
    state: Mutex<EngineState>,
}

impl SyncEngine {
    /// Load the client identity (creating it on first run) and the last
    /// stored seq
    pub fn open(store: Arc<dyn KvStore>, transport: Arc<dyn CounterTransport>) -> Result<Self> {
        let client_id = match store::get_json::<String>(&*store, CLIENT_ID_KEY)? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                store::set_json(&*store, CLIENT_ID_KEY, &id)?;
                tracing::info!(client_id = %id, "Created client identity");
                id
            }
        };

        let seq = store::get_json::<u64>(&*store, SEQ_KEY)?.unwrap_or(0);

        Ok(Self {
            store,
            transport,
            client_id,
            seq: AtomicU64::new(seq),
            state: Mutex::new(EngineState::Uninitialized),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Last sequence number the server acknowledged
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> EngineState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(EngineState::Idle)
    }

    fn set_state(&self, next: EngineState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    /// Persist first so memory never runs ahead of the store
    async fn set_seq(&self, seq: u64) -> Result<()> {
        let kv = self.store.clone();
        store::blocking(move || store::set_json(&*kv, SEQ_KEY, &seq)).await?;
        self.seq.store(seq, Ordering::SeqCst);
        Ok(())
    }

    /// Adopt the server's last applied seq
    pub async fn handshake(&self) -> Result<HandshakeOutcome> {
        self.set_state(EngineState::Handshaking);
        let result = self.run_handshake().await;
        self.set_state(EngineState::Idle);
        result
    }

    async fn run_handshake(&self) -> Result<HandshakeOutcome> {
        let previous = self.seq();

        match self.transport.last_applied(&self.client_id).await {
            Ok(last_seq) => {
                self.set_seq(last_seq).await?;
                tracing::info!(
                    client_id = %self.client_id,
                    last_seq,
                    previous,
                    "Handshake complete"
                );
                Ok(HandshakeOutcome::Synced { last_seq, previous })
            }
            Err(e) => {
                tracing::warn!(
                    client_id = %self.client_id,
                    seq = previous,
                    error = %e,
                    "Handshake failed, keeping stored seq"
                );
                Ok(HandshakeOutcome::Failed {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Send the current pending snapshot once
    pub async fn flush(&self, pending: &Arc<PendingAggregator>) -> Result<FlushOutcome> {
        let snapshot = pending.snapshot()?;
        if snapshot.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        self.set_state(EngineState::Flushing);
        let result = self.run_flush(pending, snapshot).await;
        self.set_state(EngineState::Idle);
        result
    }

    async fn run_flush(
        &self,
        pending: &Arc<PendingAggregator>,
        snapshot: PendingCounts,
    ) -> Result<FlushOutcome> {
        let request = AddRequest {
            client_id: self.client_id.clone(),
            seq: self.seq() + 1,
            deltas: snapshot,
            ts: Utc::now().timestamp_millis(),
        };

        match self.transport.add(&request).await {
            Ok(AddOutcome::Applied { last_seq }) => {
                // Reconcile before advancing seq: a crash in between leaves a
                // stale seq, which the server fences, instead of re-sendable counts
                let aggregator = pending.clone();
                let sent = request.deltas.clone();
                store::blocking(move || aggregator.reconcile(&sent)).await?;
                self.set_seq(last_seq).await?;
                tracing::info!(
                    seq = last_seq,
                    hosts = request.deltas.len(),
                    total = request.deltas.values().sum::<u64>(),
                    "Flush applied"
                );
                Ok(FlushOutcome::Applied {
                    seq: last_seq,
                    sent: request.deltas,
                })
            }
            Ok(AddOutcome::Conflict { expected_next }) => {
                let realigned_seq = expected_next.saturating_sub(1);
                self.set_seq(realigned_seq).await?;
                tracing::warn!(
                    sent_seq = request.seq,
                    expected_next,
                    realigned_seq,
                    "Sequence conflict, realigned"
                );
                Ok(FlushOutcome::Conflict {
                    expected_next,
                    realigned_seq,
                })
            }
            Err(e) => {
                tracing::warn!(seq = request.seq, error = %e, "Flush failed");
                Ok(FlushOutcome::Failed {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Server totals for display; never used for protocol decisions
    pub async fn server_counters(&self) -> Result<BTreeMap<String, u64>> {
        self.transport.counters(&self.client_id).await
    }
}
