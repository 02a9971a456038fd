//! In-memory stand-ins for the remote API and the byte transport

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use civitdl_core::{
    ApiClient, CivitdlError, Orchestrator, RangeResponse, RetryPolicy, RunOptions, StateStore,
    Transport,
};
use civitdl_types::{AssetPage, Layout, RemoteAsset, ResolvedDownload, Selection, AssetQuery};
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const CHUNK: usize = 1024;

pub fn content_for(id: &str, len: usize) -> Vec<u8> {
    id.bytes().cycle().take(len).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn url_for(id: &str) -> String {
    format!("https://files.example/{}", id)
}

pub fn remote(id: &str) -> RemoteAsset {
    RemoteAsset {
        id: id.to_string(),
        model_id: Some(1),
        model_name: Some("Model".to_string()),
        model_type: Some("Checkpoint".to_string()),
        filename: format!("{}.safetensors", id),
        ..Default::default()
    }
}

pub fn any_selection() -> Selection {
    Selection::Query(AssetQuery::default())
}

// ============================================================================
// Fake API
// ============================================================================

/// Lists a fixed set of assets, `page_size` at a time, and resolves URLs
/// to the fake transport.
pub struct FakeApi {
    assets: Mutex<Vec<RemoteAsset>>,
    checksums: Mutex<HashMap<String, String>>,
    page_failures: Mutex<VecDeque<CivitdlError>>,
    pub list_calls: AtomicU64,
    pub resolve_calls: AtomicU64,
}

impl FakeApi {
    pub fn new(assets: Vec<RemoteAsset>) -> Self {
        Self {
            assets: Mutex::new(assets),
            checksums: Mutex::new(HashMap::new()),
            page_failures: Mutex::new(VecDeque::new()),
            list_calls: AtomicU64::new(0),
            resolve_calls: AtomicU64::new(0),
        }
    }

    /// Report `checksum` for `id` when its URL is resolved
    pub fn set_checksum(&self, id: &str, checksum: String) {
        self.checksums
            .lock()
            .unwrap()
            .insert(id.to_string(), checksum);
    }

    /// Make the next listing calls fail with these errors, in order
    pub fn fail_pages(&self, errors: Vec<CivitdlError>) {
        self.page_failures.lock().unwrap().extend(errors);
    }
}

#[async_trait]
impl ApiClient for FakeApi {
    async fn list_assets(
        &self,
        _selection: &Selection,
        page: Option<&str>,
        page_size: u32,
    ) -> Result<AssetPage, CivitdlError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.page_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let assets = self.assets.lock().unwrap().clone();
        let start: usize = page.map(|p| p.parse().unwrap()).unwrap_or(0);
        let end = (start + page_size as usize).min(assets.len());
        Ok(AssetPage {
            assets: assets[start..end].to_vec(),
            next_page: (end < assets.len()).then(|| end.to_string()),
        })
    }

    async fn resolve_download_url(&self, asset_id: &str) -> Result<ResolvedDownload, CivitdlError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ResolvedDownload {
            url: url_for(asset_id),
            expected_size: None,
            checksum: self.checksums.lock().unwrap().get(asset_id).cloned(),
        })
    }
}

// ============================================================================
// Fake transport
// ============================================================================

/// A scripted misbehaviour for one request
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail before any byte is sent
    Refuse,
    /// Send this many bytes, then drop the connection
    CutAfter(usize),
    /// Serve different bytes than the real content
    Corrupt,
    /// Return 404
    NotFound,
    /// Send this many bytes, then fail the way a full disk does
    DiskFull(usize),
}

/// Serves in-memory files with range support and records every request
pub struct FakeTransport {
    files: Mutex<HashMap<String, Vec<u8>>>,
    faults: Mutex<HashMap<String, VecDeque<Fault>>>,
    honor_ranges: bool,
    /// Delay between chunks, to keep transfers in flight
    chunk_delay: Duration,
    pub requests: Mutex<Vec<(String, u64)>>,
    pub bytes_served: AtomicU64,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            honor_ranges: true,
            chunk_delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            bytes_served: AtomicU64::new(0),
        }
    }

    pub fn ignoring_ranges() -> Self {
        Self {
            honor_ranges: false,
            ..Self::new()
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn serve(&self, id: &str, data: Vec<u8>) {
        self.files.lock().unwrap().insert(url_for(id), data);
    }

    pub fn fault(&self, id: &str, fault: Fault) {
        self.faults
            .lock()
            .unwrap()
            .entry(url_for(id))
            .or_default()
            .push_back(fault);
    }

    pub fn requests_for(&self, id: &str) -> Vec<u64> {
        let url = url_for(id);
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| *u == url)
            .map(|(_, start)| *start)
            .collect()
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::SeqCst)
    }

    fn stream_of(&self, data: Vec<u8>, error: Option<CivitdlError>) -> civitdl_core::ByteStream {
        self.bytes_served
            .fetch_add(data.len() as u64, Ordering::SeqCst);
        let delay = self.chunk_delay;
        let chunks: Vec<Result<Bytes, CivitdlError>> = data
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .chain(error.map(Err))
            .collect();
        stream::iter(chunks)
            .then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                chunk
            })
            .boxed()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_range(&self, url: &str, start: u64) -> Result<RangeResponse, CivitdlError> {
        self.requests.lock().unwrap().push((url.to_string(), start));

        let data = self
            .files
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| CivitdlError::from_status(404, "no such file"))?;
        let total = data.len() as u64;
        let offset = if self.honor_ranges { start.min(total) } else { 0 };
        let body = data[offset as usize..].to_vec();

        let fault = self
            .faults
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|queue| queue.pop_front());

        let stream = match fault {
            None => self.stream_of(body, None),
            Some(Fault::Refuse) => {
                return Err(CivitdlError::TransientNetwork("connection refused".into()))
            }
            Some(Fault::NotFound) => return Err(CivitdlError::from_status(404, "gone")),
            Some(Fault::CutAfter(n)) => {
                let n = n.min(body.len());
                self.stream_of(
                    body[..n].to_vec(),
                    Some(CivitdlError::TransientNetwork("connection reset".into())),
                )
            }
            Some(Fault::DiskFull(n)) => {
                let n = n.min(body.len());
                self.stream_of(
                    body[..n].to_vec(),
                    Some(CivitdlError::Filesystem(std::io::Error::from_raw_os_error(28))),
                )
            }
            Some(Fault::Corrupt) => {
                let garbage = body.iter().map(|b| b.wrapping_add(1)).collect();
                self.stream_of(garbage, None)
            }
        };

        Ok(RangeResponse {
            offset,
            total: Some(total),
            stream,
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub api: Arc<FakeApi>,
    pub transport: Arc<FakeTransport>,
    pub max_attempts: u32,
    pub options: RunOptions,
}

impl Harness {
    pub fn new(api: FakeApi, transport: FakeTransport) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            api: Arc::new(api),
            transport: Arc::new(transport),
            max_attempts: 3,
            options: fast_options(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("state.db")
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    pub fn destination(&self, id: &str) -> PathBuf {
        self.options.layout.destination(&self.root(), &remote(id))
    }

    pub async fn store(&self) -> StateStore {
        StateStore::open(self.db_path(), self.max_attempts)
            .await
            .unwrap()
    }

    pub async fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.store().await,
            self.api.clone(),
            self.transport.clone(),
            self.options.clone(),
        )
    }
}

/// Defaults with millisecond backoff so retry tests stay fast
pub fn fast_options() -> RunOptions {
    RunOptions {
        retry: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
        layout: Layout::Flat,
        page_size: 2,
        ..RunOptions::default()
    }
}

pub async fn read(path: &Path) -> Vec<u8> {
    tokio::fs::read(path).await.unwrap()
}
