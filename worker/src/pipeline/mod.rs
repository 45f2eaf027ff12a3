//! File event pipeline - from extracted archive to installed mods
//!
//! Consumes [`PipelineEvent`]s from the downloads watcher and the bus:
//!
//! - `FilesExtracted`: when install-all is on every file is installed at
//!   once. Otherwise a `select_files` request goes out on `/install` and the
//!   task waits for a `user_selection` or the timeout.
//! - `Bus`: `user_selection` replies resolve the matching pending task.
//!
//! Each archive is handled on its own task so a slow user never blocks the
//! next download.

pub mod installer;
pub mod selection;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use shared_types::{
    Endpoint, Envelope, InstallSummary, MessageKind, SelectFilesRequest, UserSelection,
    STATUS_IN_PROGRESS, STATUS_SELECT_FILES, STATUS_USER_SELECTION,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::{Broadcaster, InboundMessage};
use crate::persistence::InstallRecorder;
use crate::settings::SettingsStore;

use self::installer::Installer;
use self::selection::{PendingSelections, SelectionOutcome};

pub const DEFAULT_SELECTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Files extracted from one downloaded archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedArchive {
    pub task_id: String,
    pub archive: PathBuf,
    pub files: Vec<PathBuf>,
}

impl ExtractedArchive {
    pub fn display_name(&self) -> String {
        self.archive
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.archive.display().to_string())
    }
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    FilesExtracted(ExtractedArchive),
    Bus(InboundMessage),
}

pub struct FileEventPipeline {
    bus: Arc<dyn Broadcaster>,
    settings: Arc<SettingsStore>,
    installer: Arc<dyn Installer>,
    recorder: Arc<dyn InstallRecorder>,
    pending: PendingSelections,
    selection_timeout: Duration,
}

impl FileEventPipeline {
    pub fn new(
        bus: Arc<dyn Broadcaster>,
        settings: Arc<SettingsStore>,
        installer: Arc<dyn Installer>,
        recorder: Arc<dyn InstallRecorder>,
    ) -> Self {
        Self {
            bus,
            settings,
            installer,
            recorder,
            pending: PendingSelections::new(),
            selection_timeout: DEFAULT_SELECTION_TIMEOUT,
        }
    }

    pub fn with_selection_timeout(mut self, timeout: Duration) -> Self {
        self.selection_timeout = timeout;
        self
    }

    pub fn pending(&self) -> &PendingSelections {
        &self.pending
    }

    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<PipelineEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(PipelineEvent::FilesExtracted(archive)) => {
                        let pipeline = Arc::clone(&self);
                        tokio::spawn(async move {
                            pipeline.handle_extracted(archive).await;
                        });
                    }
                    Some(PipelineEvent::Bus(message)) => {
                        self.handle_bus_message(message);
                    }
                    None => break,
                }
            }
        }
        tracing::debug!("File event pipeline stopped");
    }

    /// Resolve a pending selection from a `user_selection` envelope.
    ///
    /// Returns true when a waiting task received the selection.
    pub fn handle_bus_message(&self, message: InboundMessage) -> bool {
        let envelope = message.envelope;
        if envelope.status != STATUS_USER_SELECTION {
            tracing::debug!(endpoint = %message.endpoint, status = %envelope.status, "Ignoring bus message");
            return false;
        }

        let selection: UserSelection = match envelope.payload() {
            Ok(selection) => selection,
            Err(e) => {
                tracing::warn!(task_id = %envelope.task_id, error = %e, "Malformed user selection");
                return false;
            }
        };

        if self.pending.resolve(&envelope.task_id, selection.files) {
            tracing::info!(task_id = %envelope.task_id, "User selection received");
            true
        } else {
            tracing::warn!(task_id = %envelope.task_id, "Selection for unknown or finished task; dropping");
            false
        }
    }

    pub async fn handle_extracted(&self, archive: ExtractedArchive) -> InstallSummary {
        let settings = self.settings.snapshot();
        tracing::info!(
            task_id = %archive.task_id,
            archive = %archive.display_name(),
            files = archive.files.len(),
            install_all = settings.install_all,
            "Processing extracted archive"
        );

        let (selected, timed_out) = if settings.install_all {
            (archive.files.clone(), false)
        } else {
            self.request_selection(&archive).await
        };

        let mut summary = self.install_files(&archive, &selected).await;
        summary.timed_out = timed_out;

        if settings.auto_delete_unselected {
            summary.deleted = self.delete_unselected(&archive, &selected).await;
        }

        self.publish_summary(&archive, &summary).await;
        summary
    }

    /// Ask the UI which files to install. Returns the chosen files and
    /// whether the request timed out.
    async fn request_selection(&self, archive: &ExtractedArchive) -> (Vec<PathBuf>, bool) {
        let ticket = match self.pending.register(&archive.task_id) {
            Ok(ticket) => ticket,
            Err(e) => {
                tracing::warn!(error = %e, "Selection already in progress");
                return (Vec::new(), false);
            }
        };

        let request = SelectFilesRequest {
            archive: archive.display_name(),
            files: archive
                .files
                .iter()
                .map(|file| file.display().to_string())
                .collect(),
        };
        let envelope = match Envelope::new(MessageKind::Status, STATUS_SELECT_FILES)
            .with_task_id(&archive.task_id)
            .with_title(format!("Select files to install from {}", request.archive))
            .with_payload(&request)
        {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode selection request");
                return (Vec::new(), false);
            }
        };

        let reached = self.bus.broadcast(Endpoint::Install, envelope).await;
        if reached == 0 {
            tracing::warn!(task_id = %archive.task_id, "No UI connected to answer the selection request");
        }

        match ticket.wait(self.selection_timeout).await {
            SelectionOutcome::Selected(chosen) => {
                // Only files we offered are eligible.
                let chosen: HashSet<String> = chosen.into_iter().collect();
                let selected = archive
                    .files
                    .iter()
                    .filter(|file| chosen.contains(&file.display().to_string()))
                    .cloned()
                    .collect();
                (selected, false)
            }
            SelectionOutcome::TimedOut => {
                tracing::warn!(
                    task_id = %archive.task_id,
                    timeout = ?self.selection_timeout,
                    "Selection timed out; installing nothing"
                );
                (Vec::new(), true)
            }
        }
    }

    async fn install_files(&self, archive: &ExtractedArchive, files: &[PathBuf]) -> InstallSummary {
        let mut summary = InstallSummary {
            archive: archive.display_name(),
            ..InstallSummary::default()
        };

        for (index, file) in files.iter().enumerate() {
            match self.installer.install(file).await {
                Ok(installed) => {
                    tracing::info!(file = %installed.name, "Installed mod");
                    self.recorder
                        .record_install(
                            &installed.name,
                            serde_json::json!({
                                "archive": summary.archive,
                                "task_id": archive.task_id,
                            }),
                        )
                        .await;
                    summary.installed.push(installed.name);
                }
                Err(e) => {
                    tracing::error!(file = %file.display(), error = %e, "Install failed");
                    summary.failed.push(file.display().to_string());
                }
            }

            let progress = ((index + 1) * 100 / files.len()) as u8;
            let update = Envelope::new(MessageKind::Progress, STATUS_IN_PROGRESS)
                .with_task_id(&archive.task_id)
                .with_message(file.display().to_string())
                .with_progress(progress);
            self.bus.broadcast(Endpoint::Status, update).await;
        }
        summary
    }

    async fn delete_unselected(&self, archive: &ExtractedArchive, selected: &[PathBuf]) -> usize {
        let mut deleted = 0;
        for file in archive.files.iter().filter(|f| !selected.contains(f)) {
            match tokio::fs::remove_file(file).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %e, "Failed to delete unselected file");
                }
            }
        }
        deleted
    }

    async fn publish_summary(&self, archive: &ExtractedArchive, summary: &InstallSummary) {
        let envelope = match Envelope::status(summary.status(), "")
            .with_task_id(&archive.task_id)
            .with_title(format!("Finished {}", summary.archive))
            .with_progress(100)
            .with_payload(summary)
        {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode install summary");
                return;
            }
        };
        self.bus.broadcast(Endpoint::Install, envelope).await;
    }
}
