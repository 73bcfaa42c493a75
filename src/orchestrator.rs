//! Pipeline orchestration: lifecycle, hydration, crediting, and retry.
//!
//! [`PulseOrchestrator`] wires the device client, the duplicate guard, and
//! the persistence layer together and owns the background tasks (the read
//! loop via [`PulseDeviceClient`], the persist worker, and the retry drain
//! loop). It is built for explicit dependency injection: construct one at the
//! application's composition root and hand references to collaborators; there
//! is no global instance.
//!
//! # Per-event path
//!
//! ```text
//! PulseEvent --> guard.evaluate (one critical section)
//!                    |-- skip: debug log, done
//!                    |-- credit: broadcast CreditDelta (synchronous)
//!                                  \-- unique id? channel to persist worker
//!                                         \-- failure? bounded retry queue
//! ```
//!
//! The credit broadcast is never delayed or blocked by storage latency, and a
//! persistence failure never reverses a credit already emitted. Persistence
//! runs on a supervised worker task rather than untracked spawns, so
//! [`shutdown`](PulseOrchestrator::shutdown) can drain in-flight saves with a
//! bounded grace instead of silently losing them.

use crate::config::PulseConfig;
use crate::device::{ActivityMarker, PulseDeviceClient};
use crate::error::{PulseError, PulseResult};
use crate::event::{CreditDelta, ProcessedIdRecord, PulseEvent};
use crate::guard::DuplicateGuard;
use crate::retry::{RetryItem, RetryQueue};
use crate::serial::{open_acceptor_port, DynSerial};
use crate::store::ProcessedIdStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    Uninitialized,
    Ready,
}

/// One active transport session.
struct Session {
    port_name: String,
    device: PulseDeviceClient,
    pump: JoinHandle<()>,
}

/// Supervised retry drain task.
struct RetryTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Supervised persistence worker. Closing `tx` lets the worker drain whatever
/// is still queued before exiting, which is how shutdown avoids losing
/// in-flight saves.
struct PersistWorker {
    tx: mpsc::UnboundedSender<ProcessedIdRecord>,
    handle: JoinHandle<()>,
}

/// Public-facing service coordinating the whole ingestion pipeline.
///
/// Lifecycle: `new` -> [`initialize`](Self::initialize) (one-time, idempotent)
/// -> [`start`](Self::start) / [`stop`](Self::stop) cycles ->
/// [`shutdown`](Self::shutdown).
pub struct PulseOrchestrator {
    config: PulseConfig,
    store: Arc<dyn ProcessedIdStore>,
    /// Dedup state. One lock; each crediting decision is a single critical
    /// section. Never held across an await point.
    guard: Arc<parking_lot::Mutex<DuplicateGuard>>,
    /// Retry queue behind its own lock, so the slow retry path never contends
    /// with the hot per-event path on the dedup lock.
    retry: Arc<parking_lot::Mutex<RetryQueue>>,
    credit_tx: broadcast::Sender<CreditDelta>,
    last_data: ActivityMarker,
    /// Guards the one-time initialization; a concurrent second call waits on
    /// this lock instead of racing.
    init: tokio::sync::Mutex<InitState>,
    session: tokio::sync::Mutex<Option<Session>>,
    retry_task: parking_lot::Mutex<Option<RetryTask>>,
    persist: parking_lot::Mutex<Option<PersistWorker>>,
}

impl PulseOrchestrator {
    /// Construct the orchestrator over a persistence backend.
    pub fn new(config: PulseConfig, store: Arc<dyn ProcessedIdStore>) -> Self {
        let (credit_tx, _) = broadcast::channel(config.credit_channel_capacity.max(1));
        let retry = RetryQueue::new(config.retry_capacity);
        Self {
            store,
            guard: Arc::new(parking_lot::Mutex::new(DuplicateGuard::new())),
            retry: Arc::new(parking_lot::Mutex::new(retry)),
            credit_tx,
            last_data: Arc::new(parking_lot::Mutex::new(None)),
            init: tokio::sync::Mutex::new(InitState::Uninitialized),
            session: tokio::sync::Mutex::new(None),
            retry_task: parking_lot::Mutex::new(None),
            persist: parking_lot::Mutex::new(None),
            config,
        }
    }

    /// One-time initialization: hydrate the dedup memory from the store,
    /// kick off best-effort cleanup of expired records, and start the retry
    /// drain task.
    ///
    /// Idempotent: a second call while already ready is a no-op, and a
    /// concurrent call during initialization waits for the first to finish.
    ///
    /// # Errors
    ///
    /// Fails only if the initial hydration load fails; cleanup failures are
    /// logged, not escalated.
    pub async fn initialize(&self) -> PulseResult<()> {
        let mut state = self.init.lock().await;
        if *state == InitState::Ready {
            return Ok(());
        }

        let ids = self.store.load_processed_ids().await?;
        let hydrated = ids.len();
        self.guard.lock().hydrate(ids);
        tracing::info!(hydrated, "dedup memory hydrated from store");

        // Best-effort cleanup; failure is an operational concern only.
        let store = self.store.clone();
        let keep_days = self.config.retention_days;
        tokio::spawn(async move {
            if let Err(e) = store.cleanup_old_ids(keep_days).await {
                tracing::warn!(error = %e, keep_days, "processed-id cleanup failed");
            }
        });

        self.spawn_persist_worker();
        self.spawn_retry_task();

        *state = InitState::Ready;
        Ok(())
    }

    /// Open the controller port and begin ingesting events from it.
    ///
    /// # Errors
    ///
    /// Blank port names and starting a second port while one is active are
    /// contract violations reported synchronously; opening the port may also
    /// fail with a transport error.
    pub async fn start(&self, port_name: &str) -> PulseResult<()> {
        if port_name.trim().is_empty() {
            return Err(PulseError::InvalidPortName);
        }
        let transport = open_acceptor_port(port_name, &self.config.serial).await?;
        self.start_with_transport(port_name, Box::new(transport))
            .await
    }

    /// Begin ingesting from an already-open transport.
    ///
    /// This is the seam the integration tests use to drive the pipeline over
    /// in-memory duplex streams instead of hardware.
    ///
    /// # Errors
    ///
    /// Same contract checks as [`start`](Self::start), minus port opening.
    pub async fn start_with_transport(
        &self,
        port_name: &str,
        transport: DynSerial,
    ) -> PulseResult<()> {
        if port_name.trim().is_empty() {
            return Err(PulseError::InvalidPortName);
        }
        {
            let state = self.init.lock().await;
            if *state != InitState::Ready {
                return Err(PulseError::Configuration(
                    "initialize() must complete before start()".to_string(),
                ));
            }
        }

        let mut session = self.session.lock().await;
        if let Some(active) = session.as_ref() {
            return Err(PulseError::PortAlreadyActive {
                port: active.port_name.clone(),
            });
        }

        // The worker outlives sessions; it is gone only after shutdown().
        let persist_tx = self
            .persist
            .lock()
            .as_ref()
            .map(|worker| worker.tx.clone())
            .ok_or_else(|| {
                PulseError::Configuration("orchestrator already shut down".to_string())
            })?;

        // Health checks distinguish "port open" from "device talking" off
        // this timestamp; reset it so a fresh start reads as alive.
        *self.last_data.lock() = Some(Instant::now());

        let (event_tx, event_rx) = mpsc::channel(self.config.event_channel_capacity.max(1));
        let device = PulseDeviceClient::spawn(
            transport,
            event_tx,
            self.config.serial.read_timeout,
            self.last_data.clone(),
        );
        let pump = tokio::spawn(pump_loop(
            event_rx,
            self.guard.clone(),
            self.credit_tx.clone(),
            persist_tx,
            self.retry.clone(),
        ));

        *session = Some(Session {
            port_name: port_name.to_string(),
            device,
            pump,
        });
        tracing::info!(port = port_name, "ingestion started");
        Ok(())
    }

    /// Stop the active session, waiting at most `timeout` for the read loop
    /// to exit.
    ///
    /// Clears the legacy per-accepter counters and the liveness marker; the
    /// unique-id dedup memory survives stop/start cycles by design. On
    /// timeout the read task is abandoned with a warning rather than joined
    /// forever, and cleanup proceeds regardless. Stopping with no active
    /// session is a no-op.
    pub async fn stop(&self, timeout: Duration) {
        let session = { self.session.lock().await.take() };
        let Some(session) = session else {
            return;
        };

        session.device.stop(timeout).await;

        let pump_abort = session.pump.abort_handle();
        if tokio::time::timeout(timeout, session.pump).await.is_err() {
            tracing::warn!(?timeout, "event pump did not exit in time, aborting");
            pump_abort.abort();
        }

        self.guard.lock().clear_session_counters();
        // With no session there is no device to be live; without this the
        // marker keeps reporting stale liveness for the staleness window.
        *self.last_data.lock() = None;
        tracing::info!(port = %session.port_name, "ingestion stopped");
    }

    /// Dispose of the orchestrator: stop the session, drain the persist
    /// worker, and cancel the retry drain task, each bounded by `grace`.
    ///
    /// The persist worker is joined before the retry task so a save that
    /// fails during the drain still lands in the retry queue first.
    pub async fn shutdown(&self, grace: Duration) {
        self.stop(grace).await;

        let worker = { self.persist.lock().take() };
        if let Some(worker) = worker {
            // Closing the channel tells the worker to finish queued saves and
            // exit; the session is already stopped, so no new sends arrive.
            drop(worker.tx);
            let abort = worker.handle.abort_handle();
            if tokio::time::timeout(grace, worker.handle).await.is_err() {
                tracing::warn!(?grace, "persist worker did not exit in time, aborting");
                abort.abort();
            }
        }

        let task = { self.retry_task.lock().take() };
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            let abort = task.handle.abort_handle();
            if tokio::time::timeout(grace, task.handle).await.is_err() {
                tracing::warn!(?grace, "retry task did not exit in time, aborting");
                abort.abort();
            }
        }
    }

    /// Subscribe to emitted credits.
    ///
    /// Consumers apply the amount to a balance and are responsible for their
    /// own idempotence if they re-subscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<CreditDelta> {
        self.credit_tx.subscribe()
    }

    /// Whether data arrived recently enough for the device to be considered
    /// live (within the configured staleness window, 60 s by default). A
    /// liveness heuristic for health checks, not a correctness mechanism.
    pub fn is_receiving_data(&self) -> bool {
        self.last_data
            .lock()
            .is_some_and(|at| at.elapsed() <= self.config.stale_after)
    }

    /// Name of the currently active port, if any.
    pub async fn active_port(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.port_name.clone())
    }

    /// Number of persistence retries currently queued.
    pub fn pending_retries(&self) -> usize {
        self.retry.lock().len()
    }

    /// Administrative reset of the dedup state, both tiers. Never invoked by
    /// normal stop/start cycles.
    pub fn reset_dedup_state(&self) {
        self.guard.lock().clear_all();
        tracing::warn!("dedup state administratively reset");
    }

    fn spawn_retry_task(&self) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(retry_loop(
            self.store.clone(),
            self.retry.clone(),
            self.config.retry_interval,
            shutdown_rx,
        ));
        *self.retry_task.lock() = Some(RetryTask { shutdown, handle });
    }

    fn spawn_persist_worker(&self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(persist_loop(self.store.clone(), self.retry.clone(), rx));
        *self.persist.lock() = Some(PersistWorker { tx, handle });
    }
}

impl Drop for PulseOrchestrator {
    fn drop(&mut self) {
        // Callers should prefer shutdown(); this is the bounded-cleanup
        // backstop so dropped orchestrators never leak running tasks.
        if let Some(task) = self.retry_task.lock().take() {
            let _ = task.shutdown.send(true);
            task.handle.abort();
        }
        if let Some(worker) = self.persist.lock().take() {
            worker.handle.abort();
        }
        if let Ok(mut session) = self.session.try_lock() {
            if let Some(session) = session.take() {
                session.device.abort();
                session.pump.abort();
            }
        }
    }
}

/// Consume decoded events in wire order and run the crediting path for each.
async fn pump_loop(
    mut events: mpsc::Receiver<PulseEvent>,
    guard: Arc<parking_lot::Mutex<DuplicateGuard>>,
    credit_tx: broadcast::Sender<CreditDelta>,
    persist_tx: mpsc::UnboundedSender<ProcessedIdRecord>,
    retry: Arc<parking_lot::Mutex<RetryQueue>>,
) {
    while let Some(event) = events.recv().await {
        process_event(&event, &guard, &credit_tx, &persist_tx, &retry);
    }
    tracing::debug!("event pump exited");
}

/// The synchronous per-event crediting path.
fn process_event(
    event: &PulseEvent,
    guard: &Arc<parking_lot::Mutex<DuplicateGuard>>,
    credit_tx: &broadcast::Sender<CreditDelta>,
    persist_tx: &mpsc::UnboundedSender<ProcessedIdRecord>,
    retry: &Arc<parking_lot::Mutex<RetryQueue>>,
) {
    // Membership check, insertion, and counter update under one lock.
    let decision = guard.lock().evaluate(event);
    if !decision.should_credit {
        return;
    }

    let delta = CreditDelta {
        accepter: event.accepter,
        amount: decision.amount,
        raw_count: event.raw_count,
        unique_id: event.unique_id,
        timestamp: event.captured_at,
    };
    tracing::info!(
        accepter = %delta.accepter,
        amount = delta.amount,
        raw_count = delta.raw_count,
        "credit emitted"
    );
    // No subscribers is benign; the credit is still recorded below.
    let _ = credit_tx.send(delta);

    if !event.has_unique_id() {
        return;
    }

    // Persistence is handed to the supervised worker: the credit path never
    // waits on storage. Failures land in the bounded retry queue.
    let record = ProcessedIdRecord {
        unique_id_hex: event.unique_id_hex(),
        accepter: event.accepter.name().to_string(),
        pulse_count: event.raw_count,
        amount_credited: decision.amount,
        recorded_at: event.captured_at,
    };
    if let Err(mpsc::error::SendError(record)) = persist_tx.send(record) {
        // Worker already gone (shutdown raced the pump); keep the record
        // recoverable instead of dropping it.
        tracing::warn!(
            unique_id = %record.unique_id_hex,
            "persist worker unavailable, queueing for retry"
        );
        retry.lock().push(RetryItem::new(record));
    }
}

/// Save records in arrival order; failures land in the retry queue. Runs
/// until every sender is dropped, at which point the remaining backlog is
/// drained before exiting.
async fn persist_loop(
    store: Arc<dyn ProcessedIdStore>,
    retry: Arc<parking_lot::Mutex<RetryQueue>>,
    mut records: mpsc::UnboundedReceiver<ProcessedIdRecord>,
) {
    while let Some(record) = records.recv().await {
        if let Err(e) = store.save_processed_id(&record).await {
            tracing::warn!(
                unique_id = %record.unique_id_hex,
                error = %e,
                "persist failed, queueing for retry"
            );
            retry.lock().push(RetryItem::new(record));
        }
    }
    tracing::debug!("persist worker exited");
}

/// Wake on a fixed interval, drain the whole retry queue, and re-enqueue
/// whatever still fails.
async fn retry_loop(
    store: Arc<dyn ProcessedIdStore>,
    retry: Arc<parking_lot::Mutex<RetryQueue>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                tracing::debug!("retry task shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                let items = { retry.lock().drain() };
                if items.is_empty() {
                    continue;
                }
                tracing::debug!(count = items.len(), "draining persistence retry queue");
                for item in items {
                    if let Err(e) = store.save_processed_id(&item.record).await {
                        tracing::warn!(
                            unique_id = %item.record.unique_id_hex,
                            error = %e,
                            "persistence retry failed"
                        );
                        retry.lock().push(item);
                    }
                }
            }
        }
    }
}
