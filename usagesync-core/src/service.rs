//! Tracking service
//!
//! A single task owns every piece of mutable tracking state (debounce table,
//! push scheduler, debug log) and handles commands sent through a [`Tracker`]
//! handle. The handshake and each flush run as separate tasks that report back
//! over a completion channel, so observations keep flowing while a flush is on
//! the wire.
//!
//! Ordering guarantees:
//! - the startup handshake holds the flight slot, so no flush starts before it
//!   completes (successfully or not)
//! - at most one handshake or flush executes at a time
//! - triggers that arrive during a flight fold into a single follow-up flush

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use url::Url;

use crate::classifier::RuleSet;
use crate::config::TrackingConfig;
use crate::debounce::DebounceFilter;
use crate::debug_log::{DebugLog, DebugRecord};
use crate::engine::{FlushOutcome, HandshakeOutcome, SyncEngine};
use crate::error::{Error, Result};
use crate::pending::PendingAggregator;
use crate::scheduler::PushScheduler;
use crate::store::{self, KvStore};
use crate::transport::CounterTransport;
use crate::types::{Decision, Observation, Status, Verdict};

enum Command {
    Observe {
        observation: Observation,
        reply: oneshot::Sender<Result<Decision>>,
    },
    ForceFlush(oneshot::Sender<()>),
    ClearPending(oneshot::Sender<Result<()>>),
    Status(oneshot::Sender<Result<Status>>),
    Shutdown(oneshot::Sender<Result<Status>>),
}

/// Completion of a handshake or flush task
enum Flight {
    Handshake(Result<HandshakeOutcome>),
    Flush(Result<FlushOutcome>),
}

/// Cloneable handle to a running tracking service
#[derive(Clone)]
pub struct Tracker {
    commands: mpsc::Sender<Command>,
    engine: Arc<SyncEngine>,
}

impl Tracker {
    /// Open local state and spawn the service task. The startup handshake
    /// begins immediately. Must be called within a Tokio runtime.
    pub fn start(
        config: &TrackingConfig,
        store: Arc<dyn KvStore>,
        transport: Arc<dyn CounterTransport>,
        rules: RuleSet,
    ) -> Result<Self> {
        config.validate()?;

        let engine = Arc::new(SyncEngine::open(store.clone(), transport)?);
        let pending = Arc::new(PendingAggregator::load(store)?);

        let worker = Worker {
            engine: engine.clone(),
            pending,
            rules,
            debounce: DebounceFilter::new(config.debounce_window()),
            scheduler: PushScheduler::new(config.coalesce_delay()),
            debug: DebugLog::new(config.debug_capacity),
            max_conflict_retries: config.max_conflict_retries,
            conflict_retries: 0,
        };

        let (commands, receiver) = mpsc::channel(config.channel_capacity);
        tokio::spawn(worker.run(receiver));

        tracing::info!(client_id = %engine.client_id(), seq = engine.seq(), "Tracker started");

        Ok(Self { commands, engine })
    }

    pub fn client_id(&self) -> &str {
        self.engine.client_id()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::ServiceStopped)?;
        response.await.map_err(|_| Error::ServiceStopped)
    }

    /// Feed one observed request. Returns what happened to it; an `Err` means
    /// the count could not be persisted.
    pub async fn observe(&self, observation: Observation) -> Result<Decision> {
        self.request(|reply| Command::Observe { observation, reply })
            .await?
    }

    /// Flush as soon as the flight slot is free, skipping the coalescing delay
    pub async fn force_flush(&self) -> Result<()> {
        self.request(Command::ForceFlush).await
    }

    /// Discard all pending counts
    pub async fn clear_pending(&self) -> Result<()> {
        self.request(Command::ClearPending).await?
    }

    pub async fn status(&self) -> Result<Status> {
        self.request(Command::Status).await?
    }

    /// Server totals for display; `None` when the server cannot be reached
    pub async fn server_counters(&self) -> Option<BTreeMap<String, u64>> {
        match self.engine.server_counters().await {
            Ok(counters) => Some(counters),
            Err(e) => {
                tracing::warn!(error = %e, "Server counters unavailable");
                None
            }
        }
    }

    /// Stop accepting commands, finish the in-flight exchange, attempt one
    /// last flush, and return the final local state
    pub async fn shutdown(&self) -> Result<Status> {
        self.request(Command::Shutdown).await?
    }
}

struct Worker {
    engine: Arc<SyncEngine>,
    pending: Arc<PendingAggregator>,
    rules: RuleSet,
    debounce: DebounceFilter,
    scheduler: PushScheduler,
    debug: DebugLog,
    max_conflict_retries: u32,
    /// Consecutive conflicts answered with an immediate retry
    conflict_retries: u32,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let (done_tx, mut done_rx) = mpsc::channel::<Flight>(1);

        self.scheduler.begin();
        self.spawn_handshake(done_tx.clone());

        let mut draining = false;
        let mut shutdown_reply: Option<oneshot::Sender<Result<Status>>> = None;

        loop {
            let deadline = self.scheduler.deadline();

            tokio::select! {
                Some(flight) = done_rx.recv() => self.on_complete(flight),
                _ = async {
                    if let Some(deadline) = deadline {
                        tokio::time::sleep_until(deadline).await;
                    }
                }, if deadline.is_some() => {}
                command = commands.recv(), if !draining => match command {
                    Some(Command::Shutdown(reply)) => {
                        tracing::info!("Shutdown requested, draining");
                        shutdown_reply = Some(reply);
                        draining = true;
                        self.scheduler.flush_now(Instant::now());
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        tracing::debug!("All tracker handles dropped, draining");
                        draining = true;
                        self.scheduler.flush_now(Instant::now());
                    }
                },
            }

            if self.scheduler.begin_if_due(Instant::now()) {
                self.spawn_flush(done_tx.clone());
            }

            if draining && self.scheduler.is_idle() {
                break;
            }
        }

        let status = self.status();
        if let Some(reply) = shutdown_reply {
            if reply.send(status).is_err() {
                tracing::debug!("Shutdown reply channel closed");
            }
        }
        tracing::info!("Tracker stopped");
    }

    fn spawn_handshake(&self, done: mpsc::Sender<Flight>) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let result = engine.handshake().await;
            if done.send(Flight::Handshake(result)).await.is_err() {
                tracing::debug!("Tracker gone before handshake completed");
            }
        });
    }

    fn spawn_flush(&self, done: mpsc::Sender<Flight>) {
        let engine = self.engine.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            let result = engine.flush(&pending).await;
            if done.send(Flight::Flush(result)).await.is_err() {
                tracing::debug!("Tracker gone before flush completed");
            }
        });
    }

    fn on_complete(&mut self, flight: Flight) {
        let now = Instant::now();
        self.scheduler.complete(now);

        match flight {
            Flight::Handshake(result) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Handshake could not persist seq");
                }
                // Push whatever a previous run left behind
                match self.pending.is_empty() {
                    Ok(false) => self.scheduler.flush_now(now),
                    Ok(true) => {}
                    Err(e) => tracing::error!(error = %e, "Failed to read pending counts"),
                }
            }
            Flight::Flush(Ok(FlushOutcome::Conflict { expected_next, .. })) => {
                if self.conflict_retries < self.max_conflict_retries {
                    self.conflict_retries += 1;
                    self.scheduler.flush_now(now);
                } else {
                    tracing::warn!(
                        expected_next,
                        retries = self.conflict_retries,
                        "Giving up on conflict retries until the next trigger"
                    );
                    self.conflict_retries = 0;
                }
            }
            Flight::Flush(Ok(_)) => self.conflict_retries = 0,
            Flight::Flush(Err(e)) => {
                tracing::error!(error = %e, "Flush could not update local state");
                self.conflict_retries = 0;
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Observe { observation, reply } => {
                let result = self.observe(&observation).await;
                if reply.send(result).is_err() {
                    tracing::debug!("Observe reply channel closed");
                }
            }
            Command::ForceFlush(reply) => {
                self.scheduler.flush_now(Instant::now());
                if reply.send(()).is_err() {
                    tracing::debug!("Force flush reply channel closed");
                }
            }
            Command::ClearPending(reply) => {
                let pending = self.pending.clone();
                let result = store::blocking(move || pending.clear()).await;
                match &result {
                    Ok(()) => tracing::info!("Pending counts cleared"),
                    Err(e) => tracing::error!(error = %e, "Failed to clear pending counts"),
                }
                if reply.send(result).is_err() {
                    tracing::debug!("Clear reply channel closed");
                }
            }
            Command::Status(reply) => {
                if reply.send(self.status()).is_err() {
                    tracing::debug!("Status reply channel closed");
                }
            }
            // Intercepted by the run loop
            Command::Shutdown(_) => {}
        }
    }

    async fn observe(&mut self, observation: &Observation) -> Result<Decision> {
        let now = Instant::now();

        let url = match Url::parse(&observation.url) {
            Ok(url) => url,
            Err(e) => {
                self.record(
                    Decision::NotAllowlisted,
                    observation,
                    "",
                    &observation.url,
                    Some(format!("invalid url: {}", e)),
                );
                return Ok(Decision::NotAllowlisted);
            }
        };
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let path = url.path();

        let verdict = self.rules.classify(&observation.method, &url);
        if verdict != Verdict::Counted {
            self.record(verdict.into(), observation, &host, path, None);
            return Ok(verdict.into());
        }

        if !self.debounce.admit(&observation.scope, &host, path, now) {
            let reason = format!("within {}ms", self.debounce.window().as_millis());
            self.record(Decision::Debounced, observation, &host, path, Some(reason));
            return Ok(Decision::Debounced);
        }

        let pending = self.pending.clone();
        let key = host.clone();
        if let Err(e) = store::blocking(move || pending.increment(&key, 1)).await {
            tracing::error!(host = %host, error = %e, "Failed to persist pending count");
            return Err(e);
        }
        self.scheduler.notify(now);
        self.record(Decision::Counted, observation, &host, path, None);

        Ok(Decision::Counted)
    }

    fn record(
        &mut self,
        decision: Decision,
        observation: &Observation,
        host: &str,
        path: &str,
        reason: Option<String>,
    ) {
        self.debug.push(DebugRecord {
            ts: Utc::now(),
            decision,
            method: observation.method.clone(),
            scope: observation.scope.clone(),
            host: host.to_string(),
            path: path.to_string(),
            reason,
        });
    }

    fn status(&self) -> Result<Status> {
        Ok(Status {
            client_id: self.engine.client_id().to_string(),
            seq: self.engine.seq(),
            pending: self.pending.snapshot()?,
            debug: self.debug.records(),
        })
    }
}
