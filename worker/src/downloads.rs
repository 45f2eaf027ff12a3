//! Downloads watcher and archive extraction.
//!
//! Watches the downloads folder for new `.zip` files. Browsers create the file
//! before they finish writing it, so an archive is only picked up once it has
//! been quiet for the settle delay. Each archive is unpacked into its own
//! staging folder and handed to the pipeline as
//! [`PipelineEvent::FilesExtracted`].

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{ExtractedArchive, PipelineEvent};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);
const SCAN_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("failed to watch downloads folder: {0}")]
    Watch(#[from] notify::Error),

    #[error("extraction task failed: {0}")]
    Join(String),
}

pub trait ArchiveExtractor: Send + Sync {
    /// Unpack `archive` into `destination`, returning the extracted files.
    fn extract(&self, archive: &Path, destination: &Path) -> Result<Vec<PathBuf>, ExtractError>;
}

pub struct ZipExtractor;

impl ArchiveExtractor for ZipExtractor {
    fn extract(&self, archive: &Path, destination: &Path) -> Result<Vec<PathBuf>, ExtractError> {
        let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
        std::fs::create_dir_all(destination)?;

        let mut extracted = Vec::new();
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            // Rejects absolute paths and `..` components.
            let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
                tracing::warn!(entry = %entry.name(), "Skipping archive entry outside the staging folder");
                continue;
            };

            let target = destination.join(relative);
            if entry.is_dir() {
                std::fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            std::io::copy(&mut entry, &mut out)?;
            extracted.push(target);
        }
        Ok(extracted)
    }
}

pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

pub struct DownloadsWatcher {
    downloads_dir: PathBuf,
    staging_dir: PathBuf,
    extractor: Arc<dyn ArchiveExtractor>,
    settle_delay: Duration,
}

impl DownloadsWatcher {
    pub fn new(downloads_dir: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
            staging_dir: staging_dir.into(),
            extractor: Arc::new(ZipExtractor),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Start watching. The returned task owns the OS watcher and runs until
    /// `cancel` fires.
    pub fn spawn(
        self,
        events: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, ExtractError> {
        std::fs::create_dir_all(&self.downloads_dir)?;
        std::fs::create_dir_all(&self.staging_dir)?;

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => tracing::warn!(error = %e, "Downloads watcher error"),
            })?;
        watcher.watch(&self.downloads_dir, RecursiveMode::NonRecursive)?;

        tracing::info!(dir = %self.downloads_dir.display(), "Watching downloads folder");
        Ok(tokio::spawn(self.run(watcher, raw_rx, events, cancel)))
    }

    async fn run(
        self,
        _watcher: RecommendedWatcher,
        mut raw: mpsc::UnboundedReceiver<notify::Event>,
        events: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) {
        // Archive path -> time of the last filesystem activity on it.
        let mut settling: HashMap<PathBuf, Instant> = HashMap::new();
        let mut ticker = tokio::time::interval(SCAN_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = raw.recv() => match event {
                    Some(event) => note_activity(&mut settling, &event),
                    None => break,
                },
                _ = ticker.tick() => {
                    let ready: Vec<PathBuf> = settling
                        .iter()
                        .filter(|(_, seen)| seen.elapsed() >= self.settle_delay)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for archive in ready {
                        settling.remove(&archive);
                        if let Some(extracted) = self.process_archive(&archive).await {
                            if events.send(PipelineEvent::FilesExtracted(extracted)).await.is_err() {
                                tracing::debug!("Pipeline closed; stopping downloads watcher");
                                return;
                            }
                        }
                    }
                }
            }
        }
        tracing::debug!("Downloads watcher stopped");
    }

    /// Extract one archive. Failures are logged and yield `None`.
    pub async fn process_archive(&self, archive: &Path) -> Option<ExtractedArchive> {
        if !archive.is_file() {
            return None;
        }

        let task_id = ulid::Ulid::new().to_string();
        let stem = archive
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".to_string());
        let destination = self.staging_dir.join(format!("{stem}-{task_id}"));

        let extractor = Arc::clone(&self.extractor);
        let source = archive.to_path_buf();
        let target = destination.clone();
        let result = tokio::task::spawn_blocking(move || extractor.extract(&source, &target))
            .await
            .map_err(|e| ExtractError::Join(e.to_string()))
            .and_then(|inner| inner);

        match result {
            Ok(files) if files.is_empty() => {
                tracing::warn!(archive = %archive.display(), "Archive contained no files");
                None
            }
            Ok(files) => {
                tracing::info!(
                    task_id = %task_id,
                    archive = %archive.display(),
                    files = files.len(),
                    "Extracted archive"
                );
                Some(ExtractedArchive {
                    task_id,
                    archive: archive.to_path_buf(),
                    files,
                })
            }
            Err(e) => {
                tracing::error!(archive = %archive.display(), error = %e, "Extraction failed");
                None
            }
        }
    }
}

fn note_activity(settling: &mut HashMap<PathBuf, Instant>, event: &notify::Event) {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)) => {
            for path in event.paths.iter().filter(|p| is_archive(p)) {
                settling.insert(path.clone(), Instant::now());
            }
        }
        EventKind::Modify(_) => {
            // Still being written; push the deadline out.
            for path in &event.paths {
                if let Some(seen) = settling.get_mut(path) {
                    *seen = Instant::now();
                }
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                settling.remove(path);
            }
        }
        _ => {}
    }
}
