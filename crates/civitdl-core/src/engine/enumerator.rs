//! Enumerator - turns a selection into download tasks
//!
//! Pages through the API client, reconciles every listed asset with the state
//! store, and feeds whatever still needs downloading into the task queue.

use crate::engine::checksum::{checksums_match, sha256_file};
use crate::engine::transfer_worker::RunContext;
use crate::error::CivitdlError;
use crate::queue::{PushError, TaskSender};
use civitdl_types::{
    disambiguated_path, AssetStatus, AssetVersion, DownloadTask, EngineEvent, Layout, RemoteAsset,
    Selection,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-run enumeration parameters
#[derive(Debug, Clone)]
pub struct EnumeratorSettings {
    pub destination_root: PathBuf,
    pub layout: Layout,
    pub page_size: u32,
    pub max_items: Option<u64>,
    /// Retries for a single failing page before the run is aborted
    pub page_retries: u32,
    pub verify_completed: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnumerationReport {
    pub pages: u64,
    pub seen: u64,
    pub queued: u64,
    pub skipped: u64,
}

/// What to do with one listed asset
enum Decision {
    Enqueue(AssetVersion),
    Skip(String),
}

pub struct Enumerator {
    ctx: Arc<RunContext>,
    settings: EnumeratorSettings,
    sender: TaskSender,
}

impl Enumerator {
    pub fn new(ctx: Arc<RunContext>, settings: EnumeratorSettings, sender: TaskSender) -> Self {
        Self {
            ctx,
            settings,
            sender,
        }
    }

    /// Enumerate the whole selection. Dropping `self` at the end closes the
    /// queue, which lets the workers drain and exit.
    pub async fn run(self, selection: &Selection) -> Result<EnumerationReport, CivitdlError> {
        let mut report = EnumerationReport::default();
        let mut seen = HashSet::new();
        let mut page: Option<String> = None;

        'pages: loop {
            if self.ctx.cancel.is_cancelled() {
                info!("Enumeration cancelled after {} pages", report.pages);
                break;
            }

            let listing = self.fetch_page(selection, page.as_deref()).await?;
            report.pages += 1;
            debug!(
                "Page {} returned {} assets",
                report.pages,
                listing.assets.len()
            );

            for remote in listing.assets {
                if self.limit_reached(&report) {
                    info!("Reached max items ({}), stopping enumeration", report.seen);
                    break 'pages;
                }
                // Listings can shift between pages; duplicates are ignored
                if !seen.insert(remote.id.clone()) {
                    debug!("Asset {} listed twice, ignoring duplicate", remote.id);
                    continue;
                }
                report.seen += 1;

                match self.reconcile(&remote).await? {
                    Decision::Skip(reason) => {
                        debug!("Skipping {}: {}", remote.id, reason);
                        report.skipped += 1;
                        self.ctx.counters.record_skipped();
                        self.ctx.emit(EngineEvent::AssetSkipped {
                            id: remote.id.clone(),
                            reason,
                        });
                    }
                    Decision::Enqueue(asset) => {
                        let filename = asset.filename.clone();
                        match self.sender.push(DownloadTask::new(asset), &self.ctx.cancel).await {
                            Ok(()) => {
                                report.queued += 1;
                                self.ctx.counters.record_queued();
                                self.ctx.emit(EngineEvent::AssetQueued {
                                    id: remote.id.clone(),
                                    filename,
                                });
                            }
                            Err(PushError::Cancelled) | Err(PushError::Closed) => {
                                info!("Queue closed, stopping enumeration");
                                break 'pages;
                            }
                        }
                    }
                }
            }

            match listing.next_page {
                Some(next) if !self.limit_reached(&report) => page = Some(next),
                _ => break,
            }
        }

        info!(
            "Enumeration finished: {} seen, {} queued, {} skipped over {} pages",
            report.seen, report.queued, report.skipped, report.pages
        );
        Ok(report)
    }

    fn limit_reached(&self, report: &EnumerationReport) -> bool {
        self.settings
            .max_items
            .is_some_and(|max| report.seen >= max)
    }

    /// Fetch one page, retrying transient failures with backoff
    async fn fetch_page(
        &self,
        selection: &Selection,
        page: Option<&str>,
    ) -> Result<civitdl_types::AssetPage, CivitdlError> {
        let mut retries = 0;
        loop {
            let result = tokio::select! {
                _ = self.ctx.cancel.cancelled() => return Err(CivitdlError::Cancelled),
                result = self.ctx.api.list_assets(selection, page, self.settings.page_size) => result,
            };

            match result {
                Ok(listing) => return Ok(listing),
                Err(e) if e.is_retryable() && retries < self.settings.page_retries => {
                    retries += 1;
                    let delay = self.ctx.retry.delay_for_attempt(retries);
                    warn!(
                        "Listing page {:?} failed ({}), retry {}/{} in {:?}",
                        page, e, retries, self.settings.page_retries, delay
                    );
                    tokio::select! {
                        _ = self.ctx.cancel.cancelled() => return Err(CivitdlError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    return Err(CivitdlError::Enumeration(format!(
                        "listing page {:?} failed after {} retries: {}",
                        page, retries, e
                    )))
                }
            }
        }
    }

    /// Compare a listed asset with its stored record and persist the result
    async fn reconcile(&self, remote: &RemoteAsset) -> Result<Decision, CivitdlError> {
        let store = &self.ctx.store;
        let mut destination = self
            .settings
            .layout
            .destination(&self.settings.destination_root, remote);
        // Different versions often share a filename; the first one keeps it
        if let Some(owner) = store.destination_owner(&destination, &remote.id).await? {
            debug!(
                "{:?} belongs to asset {}, adding the id for {}",
                destination, owner, remote.id
            );
            destination = disambiguated_path(&destination, &remote.id);
        }
        let mut fresh = AssetVersion::from_remote(remote, destination);
        let existing = store.lookup(&remote.id).await?;

        if let Some(row) = &existing {
            match row.status {
                AssetStatus::Completed => {
                    if self.completed_file_is_intact(row, remote).await {
                        return Ok(Decision::Skip("already downloaded".to_string()));
                    }
                    warn!(
                        "Completed asset {} is missing or damaged at {:?}, downloading again",
                        row.id, row.destination_path
                    );
                }
                AssetStatus::Failed if row.attempts >= store.max_attempts() => {
                    return Ok(Decision::Skip(format!(
                        "permanently failed: {}",
                        row.last_error.as_deref().unwrap_or("unknown error")
                    )));
                }
                // Orphans were reset before the run, so someone else holds it
                AssetStatus::InProgress => {
                    return Ok(Decision::Skip("in progress elsewhere".to_string()))
                }
                AssetStatus::Pending | AssetStatus::Failed | AssetStatus::Skipped => {
                    fresh.attempts = row.attempts;
                    fresh.last_error = row.last_error.clone();
                    fresh.created_at = row.created_at;
                }
            }
        }

        if let Some(reason) = &remote.skip_reason {
            fresh.status = AssetStatus::Skipped;
            fresh.last_error = Some(reason.clone());
            store.upsert(&fresh).await?;
            return Ok(Decision::Skip(reason.clone()));
        }

        if !store.upsert(&fresh).await? {
            debug!("Asset {} was claimed while enumerating", fresh.id);
        }
        Ok(Decision::Enqueue(fresh))
    }

    async fn completed_file_is_intact(&self, row: &AssetVersion, remote: &RemoteAsset) -> bool {
        let path = &row.destination_path;
        let len = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return false,
        };
        if len == 0 || row.size.is_some_and(|size| size != len) {
            return false;
        }
        if !self.settings.verify_completed {
            return true;
        }

        let Some(expected) = remote.checksum.as_deref().or(row.checksum.as_deref()) else {
            return true;
        };
        match sha256_file(path).await {
            Ok(actual) => checksums_match(expected, &actual),
            Err(e) => {
                warn!("Could not hash {:?}: {}", path, e);
                false
            }
        }
    }
}
