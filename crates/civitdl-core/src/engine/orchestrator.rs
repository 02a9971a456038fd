//! Orchestrator - owns the lifecycle of a download run
//!
//! The first run resets orphaned claims, then every run drives one enumerator
//! and a fixed pool of transfer workers connected by the bounded task queue.
//! Only one run may be active per orchestrator. Counters are shared atomics;
//! each run gets its own cancellation token observed by every task.

use crate::api::ApiClient;
use crate::engine::enumerator::{EnumerationReport, Enumerator, EnumeratorSettings};
use crate::engine::persistence::StateStore;
use crate::engine::progress::ProgressCounters;
use crate::engine::rate_limiter::RateLimiter;
use crate::engine::retry::RetryPolicy;
use crate::engine::transfer_worker::{RunContext, TransferWorker, WorkerReport};
use crate::error::CivitdlError;
use crate::queue::task_queue;
use crate::transport::Transport;
use civitdl_types::{Config, EngineEvent, Layout, ProgressSnapshot, RunSummary, Selection};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Tasks buffered per worker before the enumerator has to wait
const QUEUE_DEPTH_PER_WORKER: usize = 2;

/// Run parameters that do not change between runs
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Cap on simultaneous transfers; defaults to the worker count
    pub max_concurrent_transfers: Option<usize>,
    /// Global bytes/sec cap
    pub speed_limit: Option<u64>,
    pub retry: RetryPolicy,
    pub url_ttl: chrono::Duration,
    pub layout: Layout,
    pub page_size: u32,
    pub max_items: Option<u64>,
    pub page_retries: u32,
    pub verify_completed: bool,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_transfers: config.max_concurrent_transfers.map(|n| n as usize),
            speed_limit: config.speed_limit,
            retry: RetryPolicy::from_config(config),
            url_ttl: chrono::Duration::seconds(config.url_ttl_secs as i64),
            layout: config.layout,
            page_size: config.page_size,
            max_items: config.max_items,
            page_retries: config.enumeration_retries,
            verify_completed: config.verify_completed,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

enum Finished {
    Enumerator(Result<EnumerationReport, CivitdlError>),
    Worker(Result<WorkerReport, CivitdlError>),
}

/// Coordinates enumeration, the worker pool, and shutdown
pub struct Orchestrator {
    store: StateStore,
    api: Arc<dyn ApiClient>,
    transport: Arc<dyn Transport>,
    options: RunOptions,
    event_tx: broadcast::Sender<EngineEvent>,
    /// Token of the active run, if any
    current: Mutex<Option<CancellationToken>>,
    /// Held for the whole of a run; the flag records that orphans were reset
    run_guard: tokio::sync::Mutex<bool>,
    /// Counters of the current (or last) run
    counters: Mutex<Arc<ProgressCounters>>,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        api: Arc<dyn ApiClient>,
        transport: Arc<dyn Transport>,
        options: RunOptions,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        Self {
            store,
            api,
            transport,
            options,
            event_tx,
            current: Mutex::new(None),
            run_guard: tokio::sync::Mutex::new(false),
            counters: Mutex::new(Arc::new(ProgressCounters::new())),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Counters of the current run
    pub fn progress(&self) -> ProgressSnapshot {
        self.counters.lock().snapshot()
    }

    /// Ask the running download to stop. In-flight transfers are parked at
    /// their next suspension point; queued tasks stay `Pending`. Later runs
    /// are unaffected.
    pub fn cancel(&self) {
        match self.current.lock().as_ref() {
            Some(token) if !token.is_cancelled() => {
                info!("Cancellation requested");
                token.cancel();
            }
            Some(_) => {}
            None => debug!("Cancel requested with no active run"),
        }
    }

    /// Whether a run is currently active
    pub fn is_running(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Download everything matched by `selection` into `destination_root`
    /// using `concurrency` workers.
    ///
    /// Fails with [`CivitdlError::RunInProgress`] while another run on this
    /// orchestrator is still active.
    pub async fn run(
        &self,
        selection: &Selection,
        concurrency: usize,
        destination_root: &Path,
    ) -> Result<RunSummary, CivitdlError> {
        if concurrency == 0 {
            return Err(CivitdlError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let mut orphans_reset = self
            .run_guard
            .try_lock()
            .map_err(|_| CivitdlError::RunInProgress)?;

        // Claims left by a previous process; our own runs never overlap
        if !*orphans_reset {
            self.store.reset_orphans().await?;
            *orphans_reset = true;
        }

        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        *self.current.lock() = Some(cancel.clone());
        let counters = Arc::new(ProgressCounters::new());
        *self.counters.lock() = counters.clone();

        info!(
            "Starting run {} with {} workers into {:?}",
            run_id, concurrency, destination_root
        );
        let result = self
            .drive(run_id, selection, concurrency, destination_root, &cancel, &counters)
            .await;
        *self.current.lock() = None;
        result
    }

    async fn drive(
        &self,
        run_id: Uuid,
        selection: &Selection,
        concurrency: usize,
        destination_root: &Path,
        cancel: &CancellationToken,
        counters: &Arc<ProgressCounters>,
    ) -> Result<RunSummary, CivitdlError> {
        let transfer_limit = self
            .options
            .max_concurrent_transfers
            .unwrap_or(concurrency)
            .clamp(1, concurrency);

        let ctx = Arc::new(RunContext {
            run_id,
            store: self.store.clone(),
            api: self.api.clone(),
            transport: self.transport.clone(),
            rate_limiter: RateLimiter::new(self.options.speed_limit),
            transfer_slots: Arc::new(Semaphore::new(transfer_limit)),
            counters: counters.clone(),
            events: self.event_tx.clone(),
            retry: self.options.retry.clone(),
            url_ttl: self.options.url_ttl,
            cancel: cancel.clone(),
        });

        let (sender, receiver) = task_queue(concurrency * QUEUE_DEPTH_PER_WORKER);
        let settings = EnumeratorSettings {
            destination_root: destination_root.to_path_buf(),
            layout: self.options.layout,
            page_size: self.options.page_size,
            max_items: self.options.max_items,
            page_retries: self.options.page_retries,
            verify_completed: self.options.verify_completed,
        };

        let mut tasks = JoinSet::new();
        let enumerator = Enumerator::new(ctx.clone(), settings, sender);
        let selection = selection.clone();
        tasks.spawn(async move { Finished::Enumerator(enumerator.run(&selection).await) });

        for index in 0..concurrency {
            let worker = TransferWorker::new(index, ctx.clone(), receiver.clone());
            tasks.spawn(async move { Finished::Worker(worker.run().await) });
        }

        let mut fatal: Option<CivitdlError> = None;
        let mut summary = RunSummary {
            run_id,
            ..Default::default()
        };

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(Finished::Enumerator(Ok(report))) => {
                    info!("Enumerator queued {} assets", report.queued);
                    Ok(())
                }
                Ok(Finished::Enumerator(Err(CivitdlError::Cancelled))) => Ok(()),
                Ok(Finished::Enumerator(Err(e))) => Err(e),
                Ok(Finished::Worker(Ok(report))) => {
                    summary.parked += report.parked;
                    summary.failures.extend(report.failures);
                    Ok(())
                }
                Ok(Finished::Worker(Err(e))) => Err(e),
                Err(e) => Err(CivitdlError::from(e)),
            };

            if let Err(e) = outcome {
                if fatal.is_none() {
                    error!("Run {} aborting: {}", run_id, e);
                    cancel.cancel();
                    fatal = Some(e);
                } else {
                    warn!("Additional error during shutdown: {}", e);
                }
            }
        }

        // Anything still queued was never claimed and is `Pending` in the store
        let unclaimed = receiver.close_and_drain().await;
        summary.parked += unclaimed.len() as u64;

        if let Some(e) = fatal {
            return Err(e);
        }

        let snapshot = counters.snapshot();
        summary.completed = snapshot.completed;
        summary.failed = snapshot.failed;
        summary.skipped = snapshot.skipped;
        summary.bytes_transferred = snapshot.bytes_transferred;
        summary.cancelled = cancel.is_cancelled();
        summary.failures.sort_by(|a, b| a.id.cmp(&b.id));

        info!("Run {} finished: {}", run_id, summary);
        let _ = self.event_tx.send(EngineEvent::RunFinished {
            summary: summary.clone(),
        });

        Ok(summary)
    }
}
