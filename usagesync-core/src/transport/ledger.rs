//! In-process counter service
//!
//! [`Ledger`] holds the server side of the protocol: per-client last applied
//! sequence numbers and per-host totals. [`MemoryTransport`] serves a ledger
//! through [`CounterTransport`] and can inject transient failures and lost
//! acknowledgements.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::{AddOutcome, AddRequest, CounterTransport};

/// Server-side counter state with strict sequence fencing
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    totals: BTreeMap<String, u64>,
    clients: HashMap<String, u64>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last applied sequence number for a client (0 if never seen)
    pub fn last_seq(&self, client_id: &str) -> u64 {
        self.clients.get(client_id).copied().unwrap_or(0)
    }

    /// Apply a flush if and only if its seq is exactly last applied + 1.
    /// Replays and gaps both answer with the expected next seq.
    pub fn apply(&mut self, request: &AddRequest) -> AddOutcome {
        let last_seq = self.last_seq(&request.client_id);

        if request.seq != last_seq + 1 {
            return AddOutcome::Conflict {
                expected_next: last_seq + 1,
            };
        }

        for (host, delta) in &request.deltas {
            if *delta > 0 {
                *self.totals.entry(host.clone()).or_insert(0) += delta;
            }
        }
        self.clients.insert(request.client_id.clone(), request.seq);

        AddOutcome::Applied {
            last_seq: request.seq,
        }
    }

    /// Force a client's last applied seq (e.g. to model another writer)
    pub fn set_last_seq(&mut self, client_id: &str, seq: u64) {
        self.clients.insert(client_id.to_string(), seq);
    }

    pub fn totals(&self) -> &BTreeMap<String, u64> {
        &self.totals
    }

    pub fn total(&self, host: &str) -> u64 {
        self.totals.get(host).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_status: u32,
    failing_adds: u32,
    lost_acks: u32,
}

/// [`CounterTransport`] backed by an in-process [`Ledger`]
#[derive(Debug, Default)]
pub struct MemoryTransport {
    ledger: Mutex<Ledger>,
    faults: Mutex<Faults>,
    requests: Mutex<Vec<AddRequest>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ledger(ledger: Ledger) -> Self {
        Self {
            ledger: Mutex::new(ledger),
            ..Default::default()
        }
    }

    fn ledger_guard(&self) -> Result<MutexGuard<'_, Ledger>> {
        self.ledger
            .lock()
            .map_err(|_| Error::Transport("ledger lock poisoned".to_string()))
    }

    fn faults_guard(&self) -> Result<MutexGuard<'_, Faults>> {
        self.faults
            .lock()
            .map_err(|_| Error::Transport("fault table lock poisoned".to_string()))
    }

    /// Copy of the current server state
    pub fn ledger(&self) -> Result<Ledger> {
        Ok(self.ledger_guard()?.clone())
    }

    /// Mutate the server state directly
    pub fn with_ledger_mut<R>(&self, f: impl FnOnce(&mut Ledger) -> R) -> Result<R> {
        Ok(f(&mut *self.ledger_guard()?))
    }

    /// Every `add` received, in order, including failed ones
    pub fn requests(&self) -> Result<Vec<AddRequest>> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .map_err(|_| Error::Transport("request log lock poisoned".to_string()))
    }

    /// Fail the next `n` status queries before they reach the ledger
    pub fn fail_next_status(&self, n: u32) -> Result<()> {
        self.faults_guard()?.failing_status = n;
        Ok(())
    }

    /// Fail the next `n` adds before they reach the ledger
    pub fn fail_next_adds(&self, n: u32) -> Result<()> {
        self.faults_guard()?.failing_adds = n;
        Ok(())
    }

    /// Apply the next `n` adds but report a transport failure to the client
    pub fn lose_next_acks(&self, n: u32) -> Result<()> {
        self.faults_guard()?.lost_acks = n;
        Ok(())
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl CounterTransport for MemoryTransport {
    async fn last_applied(&self, client_id: &str) -> Result<u64> {
        if Self::take_fault(&mut self.faults_guard()?.failing_status) {
            return Err(Error::Transport("simulated status failure".to_string()));
        }
        Ok(self.ledger_guard()?.last_seq(client_id))
    }

    async fn add(&self, request: &AddRequest) -> Result<AddOutcome> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let (fail, lose_ack) = {
            let mut faults = self.faults_guard()?;
            let fail = Self::take_fault(&mut faults.failing_adds);
            let lose_ack = !fail && Self::take_fault(&mut faults.lost_acks);
            (fail, lose_ack)
        };

        if fail {
            return Err(Error::Transport("simulated add failure".to_string()));
        }

        let outcome = self.ledger_guard()?.apply(request);

        if lose_ack {
            return Err(Error::Transport("simulated lost acknowledgement".to_string()));
        }
        Ok(outcome)
    }

    async fn counters(&self, _client_id: &str) -> Result<BTreeMap<String, u64>> {
        Ok(self.ledger_guard()?.totals().clone())
    }
}
