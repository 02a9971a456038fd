//! Transfer worker - pulls tasks from the queue and downloads one asset at a time
//!
//! Each asset is streamed into a `.part` sibling of its destination, verified,
//! and only then renamed into place. Partial files survive interruptions and
//! are resumed with a range request on the next attempt.

use crate::api::ApiClient;
use crate::engine::checksum::{checksums_match, sha256_file};
use crate::engine::persistence::{ClaimOutcome, StateStore};
use crate::engine::progress::ProgressCounters;
use crate::engine::rate_limiter::RateLimiter;
use crate::engine::retry::RetryPolicy;
use crate::error::{CivitdlError, ErrorKind};
use crate::queue::TaskReceiver;
use crate::transport::Transport;
use chrono::Utc;
use civitdl_types::{DownloadTask, EngineEvent, FailedAsset};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often a transfer emits a progress event
const PROGRESS_INTERVAL: Duration = Duration::from_millis(300);

/// Everything the enumerator and workers of one run share
pub struct RunContext {
    pub run_id: Uuid,
    pub store: StateStore,
    pub api: Arc<dyn ApiClient>,
    pub transport: Arc<dyn Transport>,
    pub rate_limiter: RateLimiter,
    /// Caps simultaneous transfers across the pool
    pub transfer_slots: Arc<Semaphore>,
    pub counters: Arc<ProgressCounters>,
    pub events: broadcast::Sender<EngineEvent>,
    pub retry: RetryPolicy,
    pub url_ttl: chrono::Duration,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

/// What happened to one dequeued task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed { path: PathBuf, size: u64 },
    /// Another worker or run owns the asset
    Discarded,
    /// Out of attempts, or a permanent source error
    Failed(FailedAsset),
    /// Cancelled; the asset is `Pending` again and any partial file is kept
    Parked,
}

/// Per-worker tally returned when the worker exits
#[derive(Debug, Default)]
pub struct WorkerReport {
    pub failures: Vec<FailedAsset>,
    pub parked: u64,
}

/// A verified file that has been moved into place
struct Published {
    path: PathBuf,
    size: u64,
    checksum: String,
}

pub struct TransferWorker {
    index: usize,
    ctx: Arc<RunContext>,
    queue: TaskReceiver,
}

impl TransferWorker {
    pub fn new(index: usize, ctx: Arc<RunContext>, queue: TaskReceiver) -> Self {
        Self { index, ctx, queue }
    }

    /// Process tasks until the queue ends or the run is cancelled.
    ///
    /// Per-asset failures are recorded and reported; only state store
    /// errors end the worker with `Err`.
    pub async fn run(self) -> Result<WorkerReport, CivitdlError> {
        debug!("Worker {} started", self.index);
        let mut report = WorkerReport::default();

        while let Some(task) = self.queue.pop(&self.ctx.cancel).await {
            match self.process(task).await? {
                TaskOutcome::Failed(failure) => report.failures.push(failure),
                TaskOutcome::Parked => report.parked += 1,
                TaskOutcome::Completed { .. } | TaskOutcome::Discarded => {}
            }
        }

        debug!("Worker {} finished", self.index);
        Ok(report)
    }

    /// Claim a task and drive it to a final outcome, retrying with backoff
    pub async fn process(&self, mut task: DownloadTask) -> Result<TaskOutcome, CivitdlError> {
        let ctx = &self.ctx;
        let id = task.asset.id.clone();

        loop {
            let claimed = match ctx.store.claim(&id, ctx.run_id).await? {
                ClaimOutcome::Claimed(asset) => asset,
                ClaimOutcome::AlreadyClaimed => {
                    debug!("Asset {} already claimed, discarding task", id);
                    return Ok(TaskOutcome::Discarded);
                }
            };

            // The store row is authoritative except for a URL this run resolved
            let resolved_url = task.resolved_at.and(task.asset.download_url.take());
            task.asset = claimed;
            match resolved_url {
                Some(url) => task.asset.download_url = Some(url),
                None => task.resolved_at = None,
            }

            match self.attempt(&mut task).await {
                Ok(published) => {
                    if let Err(e) = ctx
                        .store
                        .complete(&id, &published.path, &published.checksum, published.size)
                        .await
                    {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        // The row moved on under us; report it rather than abort the run
                        error!("Could not record {} as completed: {}", id, e);
                        return Ok(self.report_failure(&task, e.to_string(), task.asset.attempts));
                    }
                    ctx.counters.record_completed();
                    info!("Completed {} ({} bytes) -> {:?}", id, published.size, published.path);
                    ctx.emit(EngineEvent::AssetCompleted {
                        id: id.clone(),
                        path: published.path.clone(),
                        size: published.size,
                    });
                    return Ok(TaskOutcome::Completed {
                        path: published.path,
                        size: published.size,
                    });
                }
                Err(CivitdlError::Cancelled) => {
                    info!("Parking {} for a later resume", id);
                    ctx.store.release(&id).await?;
                    return Ok(TaskOutcome::Parked);
                }
                Err(e) if e.is_fatal() => {
                    error!("Fatal error while downloading {}: {}", id, e);
                    return Err(e);
                }
                Err(e) => {
                    if e.kind() == ErrorKind::Integrity {
                        discard_partial(&task).await;
                    }

                    let message = e.to_string();
                    let outcome = match ctx.store.fail(&id, &message, e.is_retryable()).await {
                        Ok(outcome) => outcome,
                        Err(store_error) if store_error.is_fatal() => return Err(store_error),
                        Err(store_error) => {
                            error!("Could not record failure of {}: {}", id, store_error);
                            return Ok(self.report_failure(&task, message, task.asset.attempts));
                        }
                    };

                    if !outcome.will_retry() {
                        error!("Giving up on {} after {} attempts: {}", id, outcome.attempts, message);
                        return Ok(self.report_failure(&task, message, outcome.attempts));
                    }

                    let delay = ctx.retry.delay_for_attempt(outcome.attempts);
                    warn!(
                        "Download of {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        id,
                        outcome.attempts,
                        ctx.store.max_attempts(),
                        message,
                        delay
                    );
                    ctx.emit(EngineEvent::AssetRetrying {
                        id: id.clone(),
                        attempt: outcome.attempts,
                        delay_ms: delay.as_millis() as u64,
                        error: message,
                    });

                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Ok(TaskOutcome::Parked),
                        _ = tokio::time::sleep(delay) => {}
                    }

                    // Download URLs may have expired in the meantime
                    task.resolved_at = None;
                    task.asset.download_url = None;
                }
            }
        }
    }

    /// Count and announce an asset this run is giving up on
    fn report_failure(&self, task: &DownloadTask, error: String, attempts: u32) -> TaskOutcome {
        self.ctx.counters.record_failed();
        self.ctx.emit(EngineEvent::AssetFailed {
            id: task.asset.id.clone(),
            error: error.clone(),
        });
        TaskOutcome::Failed(FailedAsset {
            id: task.asset.id.clone(),
            filename: task.asset.filename.clone(),
            error,
            attempts,
        })
    }

    /// One transfer attempt for a claimed asset
    async fn attempt(&self, task: &mut DownloadTask) -> Result<Published, CivitdlError> {
        let ctx = &self.ctx;

        if !task.has_fresh_url(ctx.url_ttl) {
            let resolved = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(CivitdlError::Cancelled),
                resolved = ctx.api.resolve_download_url(&task.asset.id) => resolved?,
            };
            debug!("Resolved download url for {}", task.asset.id);
            task.asset.download_url = Some(resolved.url);
            if resolved.checksum.is_some() {
                task.asset.checksum = resolved.checksum;
            }
            if resolved.expected_size.is_some() {
                task.asset.expected_size = resolved.expected_size;
            }
            task.resolved_at = Some(Utc::now());
        }

        let _slot = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(CivitdlError::Cancelled),
            slot = ctx.transfer_slots.clone().acquire_owned() => {
                slot.map_err(|_| CivitdlError::Cancelled)?
            }
        };

        self.transfer(task).await?;
        self.verify_and_publish(task).await
    }

    /// Stream the asset into its temporary file, resuming when possible
    async fn transfer(&self, task: &mut DownloadTask) -> Result<(), CivitdlError> {
        let ctx = &self.ctx;
        let asset = &mut task.asset;
        let url = asset
            .download_url
            .clone()
            .ok_or_else(|| CivitdlError::InvalidUrl(format!("no download url for {}", asset.id)))?;

        let temp_path = asset.temp_path();
        if let Some(parent) = temp_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(false)
            .open(&temp_path)
            .await?;

        let mut existing = file.metadata().await?.len();
        if let Some(expected) = asset.expected_size {
            if existing > expected {
                warn!("Partial file for {} is larger than expected, restarting", asset.id);
                file.set_len(0).await?;
                existing = 0;
            } else if existing == expected && expected > 0 {
                debug!("Partial file for {} is already complete", asset.id);
                return Ok(());
            }
        }

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(CivitdlError::Cancelled),
            response = ctx.transport.open_range(&url, existing) => response?,
        };

        if response.offset != existing {
            if existing > 0 {
                info!("Range not honored for {}, restarting from 0", asset.id);
            }
            file.set_len(0).await?;
            existing = 0;
        } else if response.resumed() {
            info!("Resuming {} from byte {}", asset.id, existing);
        }
        file.seek(std::io::SeekFrom::Start(existing)).await?;

        match (asset.expected_size, response.total) {
            (Some(expected), Some(total)) if expected != total => {
                return Err(CivitdlError::Integrity(format!(
                    "source reports {} bytes, expected {}",
                    total, expected
                )));
            }
            (None, Some(total)) => asset.expected_size = Some(total),
            _ => {}
        }

        let _active = ctx.counters.start_transfer();
        ctx.emit(EngineEvent::TransferStarted {
            id: asset.id.clone(),
            filename: asset.filename.clone(),
            resume_from: existing,
            total: asset.expected_size,
        });

        let mut stream = response.stream;
        let mut downloaded = existing;
        let mut last_event = tokio::time::Instant::now();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    file.flush().await?;
                    file.sync_all().await?;
                    return Err(CivitdlError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };

            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    // Keep what we have for the next attempt
                    file.flush().await?;
                    return Err(e);
                }
                None => break,
            };

            let len = chunk.len() as u64;
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    file.flush().await?;
                    file.sync_all().await?;
                    return Err(CivitdlError::Cancelled);
                }
                _ = ctx.rate_limiter.acquire(len) => {}
            }

            file.write_all(&chunk).await?;
            downloaded += len;
            ctx.counters.add_bytes(len);

            if let Some(expected) = asset.expected_size {
                if downloaded > expected {
                    return Err(CivitdlError::Integrity(format!(
                        "received {} bytes, more than the expected {}",
                        downloaded, expected
                    )));
                }
            }

            if last_event.elapsed() >= PROGRESS_INTERVAL {
                ctx.emit(EngineEvent::TransferProgress {
                    id: asset.id.clone(),
                    downloaded,
                    total: asset.expected_size,
                });
                last_event = tokio::time::Instant::now();
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Check size and checksum of the temporary file, then rename it into place
    async fn verify_and_publish(&self, task: &DownloadTask) -> Result<Published, CivitdlError> {
        let asset = &task.asset;
        let temp_path = asset.temp_path();
        let actual = tokio::fs::metadata(&temp_path).await?.len();

        if let Some(expected) = asset.expected_size {
            if actual < expected {
                // Short read; the partial file is resumable
                return Err(CivitdlError::TransientNetwork(format!(
                    "transfer ended early at {} of {} bytes",
                    actual, expected
                )));
            }
            if actual > expected {
                return Err(CivitdlError::Integrity(format!(
                    "file is {} bytes, expected {}",
                    actual, expected
                )));
            }
        }
        if actual == 0 {
            return Err(CivitdlError::Integrity("downloaded file is empty".to_string()));
        }

        let digest = sha256_file(&temp_path).await?;
        if let Some(expected) = &asset.checksum {
            if !checksums_match(expected, &digest) {
                return Err(CivitdlError::Integrity(format!(
                    "checksum mismatch: expected {}, got {}",
                    expected, digest
                )));
            }
        }

        tokio::fs::rename(&temp_path, &asset.destination_path).await?;

        Ok(Published {
            path: asset.destination_path.clone(),
            size: actual,
            checksum: digest,
        })
    }
}

/// Remove a partial file that cannot be resumed
async fn discard_partial(task: &DownloadTask) {
    let temp_path = task.asset.temp_path();
    match tokio::fs::remove_file(&temp_path).await {
        Ok(()) => debug!("Removed corrupt partial file {:?}", temp_path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {:?}: {}", temp_path, e),
    }
}
