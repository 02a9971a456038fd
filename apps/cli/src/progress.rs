//! Progress bar utilities for CLI downloads

use console::style;
use civitdl_types::EngineEvent;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Manages one progress bar per active transfer
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: Arc<RwLock<HashMap<String, ProgressBar>>>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg:30!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  ")
    }

    /// Create (or reuse) the progress bar for an asset
    async fn add_transfer(&self, id: &str, filename: &str, resume_from: u64, total: Option<u64>) {
        let mut bars = self.bars.write().await;
        let pb = bars
            .entry(id.to_string())
            .or_insert_with(|| {
                let pb = self.multi.add(ProgressBar::new(0));
                pb.set_style(Self::bar_style());
                pb
            })
            .clone();

        pb.set_message(filename.to_string());
        pb.set_length(total.unwrap_or(0));
        pb.set_position(resume_from);
    }

    /// Update the bars from an event. Returns true once the run has finished.
    pub async fn handle_event(&self, event: &EngineEvent) -> bool {
        match event {
            EngineEvent::TransferStarted {
                id,
                filename,
                resume_from,
                total,
            } => self.add_transfer(id, filename, *resume_from, *total).await,

            EngineEvent::TransferProgress {
                id,
                downloaded,
                total,
            } => {
                let bars = self.bars.read().await;
                if let Some(pb) = bars.get(id) {
                    if let Some(total) = total {
                        pb.set_length(*total);
                    }
                    pb.set_position(*downloaded);
                }
            }

            EngineEvent::AssetCompleted { id, path, .. } => {
                if let Some(pb) = self.bars.write().await.remove(id) {
                    pb.finish_and_clear();
                }
                let _ = self.multi.println(format!(
                    "{} {}",
                    style("✓").green().bold(),
                    path.display()
                ));
            }

            EngineEvent::AssetRetrying {
                id,
                attempt,
                error,
                ..
            } => {
                let bars = self.bars.read().await;
                if let Some(pb) = bars.get(id) {
                    pb.set_message(format!("{} retry {} ({})", style("↻").yellow(), attempt, error));
                }
            }

            EngineEvent::AssetFailed { id, error } => {
                if let Some(pb) = self.bars.write().await.remove(id) {
                    pb.abandon_with_message(format!(
                        "{} Failed: {}",
                        style("✗").red().bold(),
                        error
                    ));
                } else {
                    let _ = self.multi.println(format!(
                        "{} {} failed: {}",
                        style("✗").red().bold(),
                        id,
                        error
                    ));
                }
            }

            EngineEvent::RunFinished { .. } => return true,

            EngineEvent::AssetQueued { .. } | EngineEvent::AssetSkipped { .. } => {}
        }
        false
    }

    /// Clear all progress bars
    pub async fn clear(&self) {
        for (_, pb) in self.bars.write().await.drain() {
            pb.finish_and_clear();
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}
