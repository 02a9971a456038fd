//! Shared types for civitdl
//!
//! This crate contains the data structures shared between the download
//! engine and the CLI: asset records, selection criteria, engine events,
//! run summaries and configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Asset Types
// ============================================================================

/// One downloadable file from the remote source, plus its bookkeeping state.
///
/// This is both the unit of work and the unit of persisted state: the state
/// store keeps exactly one record per `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetVersion {
    /// Stable identifier from the remote source (the model-version id)
    pub id: String,
    pub model_id: Option<u64>,
    pub model_name: Option<String>,
    pub model_type: Option<String>,
    pub filename: String,
    /// Resolved transfer location; may expire and is re-resolved on retry
    pub download_url: Option<String>,
    pub destination_path: PathBuf,
    /// Exact byte length, when known ahead of the transfer
    pub expected_size: Option<u64>,
    /// Hex encoded SHA-256 of the content, when supplied by the source
    pub checksum: Option<String>,
    /// Verified byte length of the published file
    pub size: Option<u64>,
    pub status: AssetStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Run that currently holds the claim on this asset
    pub claimed_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AssetVersion {
    /// Build a fresh `Pending` record for a remote asset.
    pub fn from_remote(remote: &RemoteAsset, destination_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: remote.id.clone(),
            model_id: remote.model_id,
            model_name: remote.model_name.clone(),
            model_type: remote.model_type.clone(),
            filename: remote.filename.clone(),
            download_url: remote.download_url.clone(),
            destination_path,
            expected_size: remote.expected_size,
            checksum: remote.checksum.clone(),
            size: None,
            status: AssetStatus::Pending,
            attempts: 0,
            last_error: None,
            claimed_by: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Temporary sibling the worker streams into before publishing.
    pub fn temp_path(&self) -> PathBuf {
        temp_path_for(&self.destination_path, &self.id)
    }
}

/// Path of the `.part` file that sits next to `destination` while an asset
/// is being transferred.
pub fn temp_path_for(destination: &Path, id: &str) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    destination.with_file_name(format!("{}.{}.part", name, sanitize_component(id)))
}

/// `destination` with the asset id inserted before the extension. Used when
/// another asset already owns the plain path.
pub fn disambiguated_path(destination: &Path, id: &str) -> PathBuf {
    let id = sanitize_component(id);
    let name = match (destination.file_stem(), destination.extension()) {
        (Some(stem), Some(ext)) => format!(
            "{}.{}.{}",
            stem.to_string_lossy(),
            id,
            ext.to_string_lossy()
        ),
        (Some(stem), None) => format!("{}.{}", stem.to_string_lossy(), id),
        _ => id,
    };
    destination.with_file_name(name)
}

/// Download status of an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl AssetStatus {
    pub const ALL: [AssetStatus; 5] = [
        AssetStatus::Pending,
        AssetStatus::InProgress,
        AssetStatus::Completed,
        AssetStatus::Failed,
        AssetStatus::Skipped,
    ];

    /// Name used in the database and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Pending => "pending",
            AssetStatus::InProgress => "in_progress",
            AssetStatus::Completed => "completed",
            AssetStatus::Failed => "failed",
            AssetStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(AssetStatus::Pending),
            "in_progress" | "inprogress" => Ok(AssetStatus::InProgress),
            "completed" => Ok(AssetStatus::Completed),
            "failed" => Ok(AssetStatus::Failed),
            "skipped" => Ok(AssetStatus::Skipped),
            other => Err(format!("Invalid status: {}", other)),
        }
    }
}

/// Number of records per status in the state store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.failed + self.skipped
    }
}

// ============================================================================
// Remote API Types
// ============================================================================

/// An asset as listed by the remote API, before it is known to the state store.
///
/// Every field the API may omit is optional here; the enumerator decides the
/// fallback when building an [`AssetVersion`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteAsset {
    pub id: String,
    pub model_id: Option<u64>,
    pub model_name: Option<String>,
    pub model_type: Option<String>,
    pub filename: String,
    /// `None` when the listing does not carry one; resolved before transfer
    pub download_url: Option<String>,
    pub expected_size: Option<u64>,
    pub checksum: Option<String>,
    /// Set when there is nothing to download (no file, unknown id, ...);
    /// such assets are recorded as `Skipped`
    pub skip_reason: Option<String>,
}

/// One page of a remote listing
#[derive(Debug, Clone, Default)]
pub struct AssetPage {
    pub assets: Vec<RemoteAsset>,
    /// Token for the following page, `None` when the listing is exhausted
    pub next_page: Option<String>,
}

/// Fresh transfer location for an asset
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDownload {
    pub url: String,
    pub expected_size: Option<u64>,
    pub checksum: Option<String>,
}

// ============================================================================
// Selection Types
// ============================================================================

/// What to download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Selection {
    /// Everything matching a search query
    Query(AssetQuery),
    /// Versions of the given models
    Models { ids: Vec<u64>, latest_only: bool },
    /// Explicit model-version ids
    Versions { ids: Vec<u64> },
}

/// Search filters for [`Selection::Query`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetQuery {
    pub query: Option<String>,
    pub username: Option<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub base_models: Vec<String>,
    pub sort: Option<String>,
    pub period: Option<String>,
    pub nsfw: Option<bool>,
    /// Only take the newest version of each model
    #[serde(default)]
    pub latest_only: bool,
}

// ============================================================================
// Engine Types
// ============================================================================

/// A unit of work travelling through the task queue
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub asset: AssetVersion,
    /// When `asset.download_url` was resolved, if it was resolved by this run
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DownloadTask {
    pub fn new(asset: AssetVersion) -> Self {
        Self {
            asset,
            resolved_at: None,
        }
    }

    /// Whether the carried URL can be used without asking the API again
    pub fn has_fresh_url(&self, ttl: chrono::Duration) -> bool {
        match (&self.asset.download_url, self.resolved_at) {
            (Some(_), Some(at)) => Utc::now() - at < ttl,
            // URLs from a listing are fresh as of the listing itself
            (Some(_), None) => self.asset.attempts == 0,
            (None, _) => false,
        }
    }
}

/// A permanently failed asset, as reported in the run summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAsset {
    pub id: String,
    pub filename: String,
    pub error: String,
    pub attempts: u32,
}

/// Final outcome of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub bytes_transferred: u64,
    /// Tasks that were queued but never claimed because the run was cancelled
    pub parked: u64,
    pub cancelled: bool,
    pub failures: Vec<FailedAsset>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "completed={} failed={} skipped={} bytes={}",
            self.completed, self.failed, self.skipped, self.bytes_transferred
        )?;
        if self.cancelled {
            write!(f, " (cancelled, {} parked)", self.parked)?;
        }
        Ok(())
    }
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub bytes_transferred: u64,
    pub active_transfers: u64,
}

/// Events emitted by the engine for progress reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    AssetQueued {
        id: String,
        filename: String,
    },
    AssetSkipped {
        id: String,
        reason: String,
    },
    TransferStarted {
        id: String,
        filename: String,
        resume_from: u64,
        total: Option<u64>,
    },
    TransferProgress {
        id: String,
        downloaded: u64,
        total: Option<u64>,
    },
    AssetCompleted {
        id: String,
        path: PathBuf,
        size: u64,
    },
    AssetRetrying {
        id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    AssetFailed {
        id: String,
        error: String,
    },
    RunFinished {
        summary: RunSummary,
    },
}

// ============================================================================
// Configuration
// ============================================================================

/// How downloaded files are arranged under the destination root
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// `<root>/<filename>`
    Flat,
    /// `<root>/<model type>/<model name>/<filename>`
    #[default]
    ByModel,
}

impl Layout {
    /// Final on-disk location for a remote asset
    pub fn destination(&self, root: &Path, asset: &RemoteAsset) -> PathBuf {
        let filename = sanitize_component(&asset.filename);
        match self {
            Layout::Flat => root.join(filename),
            Layout::ByModel => {
                let model_type = asset.model_type.as_deref().unwrap_or("Other");
                let model_name = asset
                    .model_name
                    .clone()
                    .or_else(|| asset.model_id.map(|id| id.to_string()))
                    .unwrap_or_else(|| "unknown".to_string());
                root.join(sanitize_component(model_type))
                    .join(sanitize_component(&model_name))
                    .join(filename)
            }
        }
    }
}

impl FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "flat" => Ok(Layout::Flat),
            "by_model" | "bymodel" => Ok(Layout::ByModel),
            other => Err(format!("Invalid layout: {}", other)),
        }
    }
}

/// Replace characters that are not allowed in a single path component.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Application configuration, persisted as `config.json` in the data directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub download_root: PathBuf,
    /// Number of transfer workers
    pub concurrency: u32,
    /// Cap on simultaneous transfers across the pool (None = one per worker)
    pub max_concurrent_transfers: Option<u32>,
    /// Attempts per asset before it is marked permanently failed
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Retries for a single failing listing page
    pub enumeration_retries: u32,
    /// Global speed limit in bytes/sec (None = unlimited)
    pub speed_limit: Option<u64>,
    pub page_size: u32,
    pub max_items: Option<u64>,
    /// How long a resolved download URL is trusted
    pub url_ttl_secs: u64,
    /// Re-hash completed files before skipping them
    pub verify_completed: bool,
    pub layout: Layout,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        let download_root = dirs::download_dir()
            .map(|d| d.join("civitai"))
            .unwrap_or_else(|| PathBuf::from("civitai"));

        Self {
            api_base_url: "https://civitai.com".to_string(),
            api_key: None,
            download_root,
            concurrency: 4,
            max_concurrent_transfers: None,
            max_attempts: 5,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            enumeration_retries: 3,
            speed_limit: None,
            page_size: 100,
            max_items: None,
            url_ttl_secs: 600,
            verify_completed: false,
            layout: Layout::ByModel,
            user_agent: format!("civitdl/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Config {
    /// Check values that would make the engine unusable
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be at least 1".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.max_concurrent_transfers == Some(0) {
            return Err("max_concurrent_transfers must be at least 1".to_string());
        }
        if self.page_size == 0 {
            return Err("page_size must be at least 1".to_string());
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err("retry_max_delay_ms must not be below retry_base_delay_ms".to_string());
        }
        Ok(())
    }
}
