//! Run-wide progress counters
//!
//! Workers and the enumerator only ever increment these; readers take a
//! [`ProgressSnapshot`].

use civitdl_types::ProgressSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ProgressCounters {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    bytes_transferred: AtomicU64,
    active_transfers: AtomicU64,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::AcqRel);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Count a transfer as active until the returned guard is dropped
    pub fn start_transfer(&self) -> ActiveTransfer<'_> {
        self.active_transfers.fetch_add(1, Ordering::AcqRel);
        ActiveTransfer { counters: self }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            queued: self.queued.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            skipped: self.skipped.load(Ordering::Acquire),
            bytes_transferred: self.bytes_transferred.load(Ordering::Acquire),
            active_transfers: self.active_transfers.load(Ordering::Acquire),
        }
    }
}

pub struct ActiveTransfer<'a> {
    counters: &'a ProgressCounters,
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        self.counters.active_transfers.fetch_sub(1, Ordering::AcqRel);
    }
}
