//! Download Engine - The heart of civitdl
//!
//! This module implements a resumable batch download engine with:
//! - Atomic per-asset bookkeeping (SQLite)
//! - Paged enumeration feeding a bounded queue
//! - A fixed worker pool with range resume and checksum verification
//! - Token bucket rate limiting and a transfer cap shared by all workers
//! - Cooperative cancellation that parks work for the next run

mod checksum;
mod enumerator;
mod orchestrator;
mod persistence;
mod progress;
mod rate_limiter;
mod retry;
mod transfer_worker;

pub use checksum::*;
pub use enumerator::*;
pub use orchestrator::*;
pub use persistence::*;
pub use progress::*;
pub use rate_limiter::*;
pub use retry::*;
pub use transfer_worker::*;
