//! File event pipeline integration tests

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shared_types::{
    Endpoint, Envelope, InstallSummary, MessageKind, SelectFilesRequest, UserSelection,
    STATUS_COMPLETED, STATUS_SELECT_FILES, STATUS_USER_SELECTION,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

use worker::bus::{Broadcaster, InboundMessage};
use worker::persistence::InstallRecorder;
use worker::pipeline::installer::{InstallError, InstalledMod, Installer};
use worker::pipeline::{ExtractedArchive, FileEventPipeline};
use worker::settings::{Settings, SettingsStore};

/// Records every broadcast and forwards `select_files` requests to the test.
struct RecordingBus {
    sent: Mutex<Vec<(Endpoint, Envelope)>>,
    selections: mpsc::UnboundedSender<Envelope>,
}

#[async_trait]
impl Broadcaster for RecordingBus {
    async fn broadcast(&self, endpoint: Endpoint, envelope: Envelope) -> usize {
        if envelope.status == STATUS_SELECT_FILES {
            let _ = self.selections.send(envelope.clone());
        }
        self.sent.lock().unwrap().push((endpoint, envelope));
        1
    }
}

/// Pretends to install; fails for files whose name contains "bad".
#[derive(Default)]
struct FakeInstaller {
    installed: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn install(&self, file: &Path) -> Result<InstalledMod, InstallError> {
        let name = file.file_name().unwrap().to_string_lossy().into_owned();
        if name.contains("bad") {
            return Err(InstallError::Io {
                path: file.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, "corrupt"),
            });
        }
        self.installed.lock().unwrap().push(file.to_path_buf());
        Ok(InstalledMod {
            name,
            destination: PathBuf::from("/mods").join(file.file_name().unwrap()),
        })
    }
}

#[derive(Default)]
struct FakeRecorder {
    names: Mutex<Vec<String>>,
}

#[async_trait]
impl InstallRecorder for FakeRecorder {
    async fn record_install(&self, name: &str, _payload: serde_json::Value) {
        self.names.lock().unwrap().push(name.to_string());
    }
}

struct Harness {
    pipeline: Arc<FileEventPipeline>,
    bus: Arc<RecordingBus>,
    installer: Arc<FakeInstaller>,
    recorder: Arc<FakeRecorder>,
    selections: mpsc::UnboundedReceiver<Envelope>,
}

fn harness(settings: Settings, selection_timeout: Duration) -> Harness {
    let (tx, selections) = mpsc::unbounded_channel();
    let bus = Arc::new(RecordingBus {
        sent: Mutex::new(Vec::new()),
        selections: tx,
    });
    let installer = Arc::new(FakeInstaller::default());
    let recorder = Arc::new(FakeRecorder::default());
    let pipeline = Arc::new(
        FileEventPipeline::new(
            bus.clone(),
            SettingsStore::in_memory(settings),
            installer.clone(),
            recorder.clone(),
        )
        .with_selection_timeout(selection_timeout),
    );

    Harness {
        pipeline,
        bus,
        installer,
        recorder,
        selections,
    }
}

fn archive(task_id: &str, files: &[PathBuf]) -> ExtractedArchive {
    ExtractedArchive {
        task_id: task_id.to_string(),
        archive: PathBuf::from("/downloads/pack.zip"),
        files: files.to_vec(),
    }
}

fn selection_reply(task_id: &str, files: &[&str]) -> InboundMessage {
    let envelope = Envelope::new(MessageKind::Status, STATUS_USER_SELECTION)
        .with_task_id(task_id)
        .with_payload(&UserSelection {
            files: files.iter().map(|f| f.to_string()).collect(),
        })
        .unwrap();
    InboundMessage {
        endpoint: Endpoint::Install,
        envelope,
    }
}

fn last_summary(bus: &RecordingBus) -> (Endpoint, Envelope, InstallSummary) {
    let sent = bus.sent.lock().unwrap();
    let (endpoint, envelope) = sent.last().cloned().expect("Nothing broadcast");
    let summary = envelope.payload().expect("Last broadcast is not a summary");
    (endpoint, envelope, summary)
}

#[tokio::test]
async fn test_install_all_skips_selection() {
    let settings = Settings {
        install_all: true,
        ..Settings::default()
    };
    let h = harness(settings, Duration::from_secs(5));
    let files = vec![PathBuf::from("/staging/a.pak"), PathBuf::from("/staging/b.pak")];

    let summary = h.pipeline.handle_extracted(archive("t-1", &files)).await;

    assert_eq!(summary.installed, vec!["a.pak", "b.pak"]);
    assert_eq!(*h.installer.installed.lock().unwrap(), files);
    assert_eq!(*h.recorder.names.lock().unwrap(), vec!["a.pak", "b.pak"]);

    let sent = h.bus.sent.lock().unwrap();
    assert!(sent.iter().all(|(_, e)| e.status != STATUS_SELECT_FILES));
    drop(sent);

    let (endpoint, envelope, _) = last_summary(&h.bus);
    assert_eq!(endpoint, Endpoint::Install);
    assert_eq!(envelope.status, STATUS_COMPLETED);
    assert_eq!(envelope.progress, Some(100));
    assert_eq!(envelope.task_id, "t-1");
}

#[tokio::test]
async fn test_user_selection_drives_install() {
    let mut h = harness(Settings::default(), Duration::from_secs(5));
    let files = vec![
        PathBuf::from("/staging/a.pak"),
        PathBuf::from("/staging/b.pak"),
        PathBuf::from("/staging/c.pak"),
    ];

    let pipeline = Arc::clone(&h.pipeline);
    let task = tokio::spawn(async move { pipeline.handle_extracted(archive("t-2", &files)).await });

    let request = timeout(Duration::from_secs(2), h.selections.recv())
        .await
        .expect("No select_files request")
        .unwrap();
    assert_eq!(request.task_id, "t-2");
    let body: SelectFilesRequest = request.payload().unwrap();
    assert_eq!(body.archive, "pack.zip");
    assert_eq!(body.files.len(), 3);

    assert!(h
        .pipeline
        .handle_bus_message(selection_reply("t-2", &["/staging/a.pak", "/staging/c.pak"])));

    let summary = task.await.unwrap();
    assert_eq!(summary.installed, vec!["a.pak", "c.pak"]);
    assert!(!summary.timed_out);
    assert!(h.pipeline.pending().is_empty());
}

#[tokio::test]
async fn test_selection_timeout_installs_nothing_and_cleans_up() {
    let h = harness(Settings::default(), Duration::from_millis(50));
    let files = vec![PathBuf::from("/staging/a.pak"), PathBuf::from("/staging/b.pak")];

    let summary = h.pipeline.handle_extracted(archive("t-3", &files)).await;

    assert!(summary.timed_out);
    assert!(summary.installed.is_empty());
    assert!(h.installer.installed.lock().unwrap().is_empty());
    assert!(!h.pipeline.pending().is_pending("t-3"));

    // A late reply finds nothing; the id can be used again.
    assert!(!h.pipeline.handle_bus_message(selection_reply("t-3", &["/staging/a.pak"])));
    assert!(h.pipeline.pending().register("t-3").is_ok());
}

#[tokio::test]
async fn test_unknown_task_selection_is_dropped() {
    let h = harness(Settings::default(), Duration::from_secs(5));
    assert!(!h.pipeline.handle_bus_message(selection_reply("nope", &["/staging/a.pak"])));
}

#[tokio::test]
async fn test_non_selection_messages_are_ignored() {
    let h = harness(Settings::default(), Duration::from_secs(5));
    let message = InboundMessage {
        endpoint: Endpoint::Status,
        envelope: Envelope::status(STATUS_COMPLETED, "hello"),
    };
    assert!(!h.pipeline.handle_bus_message(message));
}

#[tokio::test]
async fn test_files_not_offered_are_never_installed() {
    let mut h = harness(Settings::default(), Duration::from_secs(5));
    let files = vec![PathBuf::from("/staging/a.pak"), PathBuf::from("/staging/b.pak")];

    let pipeline = Arc::clone(&h.pipeline);
    let task = tokio::spawn(async move { pipeline.handle_extracted(archive("t-4", &files)).await });
    timeout(Duration::from_secs(2), h.selections.recv())
        .await
        .unwrap()
        .unwrap();

    h.pipeline
        .handle_bus_message(selection_reply("t-4", &["/etc/passwd", "/staging/b.pak"]));

    let summary = task.await.unwrap();
    assert_eq!(summary.installed, vec!["b.pak"]);
}

#[tokio::test]
async fn test_install_failures_do_not_abort_the_run() {
    let settings = Settings {
        install_all: true,
        ..Settings::default()
    };
    let h = harness(settings, Duration::from_secs(5));
    let files = vec![PathBuf::from("/staging/bad.pak"), PathBuf::from("/staging/good.pak")];

    let summary = h.pipeline.handle_extracted(archive("t-5", &files)).await;

    assert_eq!(summary.installed, vec!["good.pak"]);
    assert_eq!(summary.failed, vec!["/staging/bad.pak"]);
    assert_eq!(*h.recorder.names.lock().unwrap(), vec!["good.pak"]);
    let (_, envelope, _) = last_summary(&h.bus);
    assert_eq!(envelope.status, STATUS_COMPLETED);
}

#[tokio::test]
async fn test_auto_delete_removes_unselected_files() {
    let dir = tempfile::tempdir().unwrap();
    let keep = dir.path().join("keep.pak");
    let drop_me = dir.path().join("drop.pak");
    std::fs::write(&keep, b"k").unwrap();
    std::fs::write(&drop_me, b"d").unwrap();

    let settings = Settings {
        auto_delete_unselected: true,
        ..Settings::default()
    };
    let mut h = harness(settings, Duration::from_secs(5));
    let files = vec![keep.clone(), drop_me.clone()];

    let pipeline = Arc::clone(&h.pipeline);
    let task = tokio::spawn(async move { pipeline.handle_extracted(archive("t-6", &files)).await });
    timeout(Duration::from_secs(2), h.selections.recv())
        .await
        .unwrap()
        .unwrap();
    let keep_name = keep.display().to_string();
    assert!(h
        .pipeline
        .handle_bus_message(selection_reply("t-6", &[keep_name.as_str()])));

    let summary = task.await.unwrap();
    assert_eq!(summary.deleted, 1);
    assert!(keep.exists());
    assert!(!drop_me.exists());
}

#[tokio::test]
async fn test_run_loop_routes_bus_and_file_events() {
    let mut h = harness(Settings::default(), Duration::from_secs(5));
    let (tx, rx) = mpsc::channel(8);
    let cancel = tokio_util::sync::CancellationToken::new();
    let runner = tokio::spawn(Arc::clone(&h.pipeline).run(rx, cancel.clone()));

    let files = vec![PathBuf::from("/staging/a.pak"), PathBuf::from("/staging/b.pak")];
    tx.send(worker::pipeline::PipelineEvent::FilesExtracted(archive("t-7", &files)))
        .await
        .unwrap();
    timeout(Duration::from_secs(2), h.selections.recv())
        .await
        .unwrap()
        .unwrap();

    tx.send(worker::pipeline::PipelineEvent::Bus(selection_reply(
        "t-7",
        &["/staging/a.pak"],
    )))
    .await
    .unwrap();

    timeout(Duration::from_secs(2), async {
        while h.recorder.names.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Install did not happen");
    assert_eq!(*h.recorder.names.lock().unwrap(), vec!["a.pak"]);

    cancel.cancel();
    runner.await.unwrap();
}
