// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task manager and facade behavior against a scripted engine.
//!
//! The scripted engine records every call and hands back the event sinks it
//! was given, so each test drives engine events by hand and then uses
//! `Downloader::flush` to wait for them to be applied and delivered.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stagedl::{
    DownloadHints, DownloadObserver, Downloader, DownloaderConfig, EventSink, TaskState,
    TransferEngine, TransferRequest,
};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::time::timeout;

const TEST_TIMEOUT_SECS: u64 = 5;

// =============================================================================
// FIXTURES
// =============================================================================

/// Engine that only records what it was asked to do.
#[derive(Default)]
struct ScriptedEngine {
    calls: Mutex<Vec<String>>,
    started: Mutex<Vec<(TransferRequest, EventSink)>>,
    cap: Mutex<Option<usize>>,
}

impl ScriptedEngine {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn starts(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    /// Sink of the most recent transfer started for `locator`.
    fn sink(&self, locator: &str) -> EventSink {
        self.started
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(request, _)| request.locator == locator)
            .map(|(_, sink)| sink.clone())
            .expect("transfer was started")
    }

    fn request(&self, locator: &str) -> TransferRequest {
        self.started
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(request, _)| request.locator == locator)
            .map(|(request, _)| request.clone())
            .expect("transfer was started")
    }
}

impl TransferEngine for ScriptedEngine {
    fn start(&self, request: TransferRequest, sink: EventSink) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("start:{}", request.locator));
        self.started.lock().unwrap().push((request, sink));
    }

    fn pause(&self, locator: &str) {
        self.calls.lock().unwrap().push(format!("pause:{}", locator));
    }

    fn resume(&self, locator: &str) {
        self.calls.lock().unwrap().push(format!("resume:{}", locator));
    }

    fn cancel(&self, locator: &str) {
        self.calls.lock().unwrap().push(format!("cancel:{}", locator));
    }

    fn set_concurrency_cap(&self, cap: usize) {
        *self.cap.lock().unwrap() = Some(cap);
    }

    fn set_timeout(&self, _timeout: Option<Duration>) {}
}

/// Observer that writes every callback down as a short string.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    file_name: Option<String>,
}

impl Recorder {
    fn naming(name: &str) -> Self {
        Self {
            file_name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn push(&self, entry: String) {
        self.events.lock().unwrap().push(entry);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, entry: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == entry).count()
    }

    /// Events about `locator`, in delivery order.
    fn events_for(&self, locator: &str) -> Vec<String> {
        let suffix = format!(":{}", locator);
        self.events()
            .into_iter()
            .filter(|e| e.ends_with(&suffix))
            .collect()
    }
}

impl DownloadObserver for Recorder {
    fn will_start(&self, locator: &str) {
        self.push(format!("will_start:{}", locator));
    }
    fn did_start(&self, locator: &str) {
        self.push(format!("did_start:{}", locator));
    }
    fn on_progress(&self, locator: &str, fraction: f64) {
        self.push(format!("progress:{}:{}", fraction, locator));
    }
    fn on_size_known(&self, locator: &str, total_bytes: u64) {
        self.push(format!("size:{}:{}", total_bytes, locator));
    }
    fn on_staging_path_known(&self, locator: &str, _path: &Path) {
        self.push(format!("staging:{}", locator));
    }
    fn on_finished(&self, locator: &str, _path: &Path) {
        self.push(format!("finished:{}", locator));
    }
    fn on_paused(&self, locator: &str) {
        self.push(format!("paused:{}", locator));
    }
    fn on_paused_all(&self) {
        self.push("paused_all".to_string());
    }
    fn on_resumed(&self, locator: &str) {
        self.push(format!("resumed:{}", locator));
    }
    fn on_resumed_all(&self) {
        self.push("resumed_all".to_string());
    }
    fn on_cancelled(&self, locator: &str) {
        self.push(format!("cancelled:{}", locator));
    }
    fn on_cancelled_all(&self) {
        self.push("cancelled_all".to_string());
    }
    fn on_unfinished_deleted(&self, locators: &[String]) {
        self.push(format!("deleted:{}", locators.join(",")));
    }
    fn resolve_file_name(&self, _locator: &str) -> Option<String> {
        self.file_name.clone()
    }
}

struct Harness {
    downloader: Downloader,
    engine: Arc<ScriptedEngine>,
    recorder: Arc<Recorder>,
    dir: TempDir,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = DownloaderConfig {
        staging_dir: Some(dir.path().join("staging")),
        cache_dir: Some(dir.path().join("cache")),
        ..Default::default()
    };
    let engine = Arc::new(ScriptedEngine::default());
    let downloader = Downloader::new(engine.clone(), &config);
    let recorder = Arc::new(Recorder::default());
    downloader.add_observer(&recorder);

    Harness {
        downloader,
        engine,
        recorder,
        dir,
    }
}

const A: &str = "https://example.com/a.bin";
const B: &str = "https://example.com/b.bin";

// =============================================================================
// QUERIES
// =============================================================================

#[tokio::test]
async fn test_untracked_locator_queries() {
    let h = harness();
    assert!(!h.downloader.has_task(A).await);
    assert!(!h.downloader.is_paused(A).await);
    assert_eq!(h.downloader.staging_path_for(A).await, None);
    assert_eq!(h.downloader.state_of(A).await, None);
    assert!(h.downloader.current_locators().await.is_empty());
}

#[tokio::test]
async fn test_untracked_controls_are_silent() {
    let h = harness();
    h.downloader.pause(A);
    h.downloader.resume(A);
    h.downloader.cancel(A);
    h.downloader.flush().await;

    assert!(h.recorder.events().is_empty());
    assert!(h.engine.calls().is_empty());
}

// =============================================================================
// ADMISSION
// =============================================================================

#[tokio::test]
async fn test_duplicate_download_is_ignored() {
    let h = harness();
    h.downloader.download(A);
    h.downloader.download(A);
    h.downloader.flush().await;

    assert_eq!(h.engine.starts(), 1);
    assert_eq!(h.downloader.current_locators().await, vec![A.to_string()]);

    h.engine.sink(A).size_known(100, None);
    h.downloader.flush().await;

    assert_eq!(h.recorder.count(&format!("will_start:{}", A)), 2);
    assert_eq!(h.recorder.count(&format!("did_start:{}", A)), 1);
}

#[tokio::test]
async fn test_size_known_event_order() {
    let h = harness();
    let staging = h.dir.path().join("staging").join("a.bin.part");
    h.downloader.download(A);
    h.downloader.flush().await;

    h.engine.sink(A).size_known(2048, Some(staging.clone()));
    h.downloader.flush().await;

    assert_eq!(
        h.recorder.events_for(A),
        vec![
            format!("will_start:{}", A),
            format!("did_start:{}", A),
            format!("size:2048:{}", A),
            format!("staging:{}", A),
        ]
    );
    assert_eq!(h.downloader.state_of(A).await, Some(TaskState::Downloading));
    assert_eq!(h.downloader.staging_path_for(A).await, Some(staging));
}

#[tokio::test]
async fn test_locators_listed_in_admission_order() {
    let h = harness();
    h.downloader.download(B);
    h.downloader.download(A);
    assert_eq!(
        h.downloader.current_locators().await,
        vec![B.to_string(), A.to_string()]
    );
}

#[tokio::test]
async fn test_file_name_resolution() {
    let h = harness();
    let namer = Arc::new(Recorder::naming("song.mp3"));
    h.downloader.add_observer(&namer);

    h.downloader.download(A);
    h.downloader
        .download_with(B, DownloadHints::default().with_file_name("given.bin"));
    h.downloader.flush().await;

    let a = h.engine.request(A);
    assert_eq!(a.hints.file_name.as_deref(), Some("song.mp3"));
    assert_eq!(a.hints.staging_dir, Some(h.dir.path().join("staging")));
    assert_eq!(a.hints.dest_dir, Some(h.dir.path().join("cache")));

    let b = h.engine.request(B);
    assert_eq!(b.hints.file_name.as_deref(), Some("given.bin"));
}

#[tokio::test]
async fn test_explicit_dirs_override_defaults() {
    let h = harness();
    let staging = h.dir.path().join("elsewhere/staging");
    let dest = h.dir.path().join("elsewhere/out");

    h.downloader.download_with(
        A,
        DownloadHints::default()
            .with_file_name("a.bin")
            .with_staging_dir(&staging)
            .with_dest_dir(&dest),
    );
    h.downloader
        .download_with(B, DownloadHints::default().with_dest_dir(&dest));
    h.downloader.flush().await;

    let a = h.engine.request(A);
    assert_eq!(a.hints.staging_dir, Some(staging));
    assert_eq!(a.hints.dest_dir, Some(dest.clone()));

    let b = h.engine.request(B);
    assert_eq!(b.hints.staging_dir, Some(h.dir.path().join("staging")));
    assert_eq!(b.hints.dest_dir, Some(dest));
}

#[tokio::test]
async fn test_unnamed_download_gets_fallback_name() {
    let h = harness();
    h.downloader.download(A);
    h.downloader.flush().await;

    let name = h.engine.request(A).hints.file_name.unwrap();
    assert!(name.ends_with("_unnamed_file"));
}

// =============================================================================
// PAUSE / RESUME
// =============================================================================

#[tokio::test]
async fn test_pause_resume_events_mirror_calls() {
    let h = harness();
    h.downloader.download(A);
    h.downloader.flush().await;
    h.engine.sink(A).size_known(10, None);

    h.downloader.pause(A);
    h.downloader.pause(A);
    h.downloader.resume(A);
    h.downloader.pause(A);
    h.downloader.resume(A);
    h.downloader.flush().await;

    let controls: Vec<String> = h
        .recorder
        .events_for(A)
        .into_iter()
        .filter(|e| e.starts_with("paused") || e.starts_with("resumed"))
        .collect();
    assert_eq!(
        controls,
        vec![
            format!("paused:{}", A),
            format!("paused:{}", A),
            format!("resumed:{}", A),
            format!("paused:{}", A),
            format!("resumed:{}", A),
        ]
    );
    assert_eq!(h.downloader.state_of(A).await, Some(TaskState::Downloading));
}

#[tokio::test]
async fn test_pause_before_size_known_stays_paused() {
    let h = harness();
    h.downloader.download(A);
    h.downloader.pause(A);
    h.downloader.flush().await;
    assert!(h.downloader.is_paused(A).await);

    h.engine.sink(A).size_known(10, None);
    h.downloader.flush().await;
    assert!(h.downloader.is_paused(A).await);

    h.downloader.resume(A);
    assert_eq!(h.downloader.state_of(A).await, Some(TaskState::Downloading));
}

#[tokio::test]
async fn test_pause_all_and_resume_all_emit_one_event() {
    let h = harness();
    h.downloader.download(A);
    h.downloader.download(B);
    h.downloader.pause_all();
    h.downloader.flush().await;

    assert!(h.downloader.is_paused(A).await);
    assert!(h.downloader.is_paused(B).await);
    assert_eq!(h.recorder.count("paused_all"), 1);
    assert!(h.recorder.events_for(A).iter().all(|e| !e.starts_with("paused")));

    h.downloader.resume_all();
    h.downloader.flush().await;
    assert!(!h.downloader.is_paused(A).await);
    assert_eq!(h.recorder.count("resumed_all"), 1);

    let calls = h.engine.calls();
    assert!(calls.contains(&format!("pause:{}", A)));
    assert!(calls.contains(&format!("resume:{}", B)));
}

// =============================================================================
// CANCEL / DELETE
// =============================================================================

#[tokio::test]
async fn test_cancel_all_clears_every_task() {
    let h = harness();
    h.downloader.download(A);
    h.downloader.download(B);
    h.downloader.cancel_all();
    h.downloader.flush().await;

    assert!(!h.downloader.has_task(A).await);
    assert!(!h.downloader.has_task(B).await);
    assert_eq!(h.recorder.count("cancelled_all"), 1);
    assert_eq!(h.recorder.count(&format!("cancelled:{}", A)), 0);
}

#[tokio::test]
async fn test_cancel_all_with_nothing_tracked_still_notifies() {
    let h = harness();
    h.downloader.cancel_all();
    h.downloader.flush().await;
    assert_eq!(h.recorder.events(), vec!["cancelled_all".to_string()]);
}

#[tokio::test]
async fn test_cancel_removes_paused_task() {
    let h = harness();
    h.downloader.download(A);
    h.downloader.pause(A);
    h.downloader.cancel(A);
    h.downloader.flush().await;

    assert!(!h.downloader.has_task(A).await);
    assert_eq!(h.recorder.count(&format!("cancelled:{}", A)), 1);
    assert!(h.engine.calls().contains(&format!("cancel:{}", A)));
}

#[tokio::test]
async fn test_delete_unfinished_tasks() {
    let h = harness();
    let staging_dir = h.dir.path().join("staging");
    std::fs::create_dir_all(&staging_dir).unwrap();
    let staged = staging_dir.join("a.bin.part");
    std::fs::write(&staged, b"partial").unwrap();

    h.downloader.download(A);
    h.downloader.flush().await;
    h.engine.sink(A).size_known(100, Some(staged.clone()));
    h.downloader.flush().await;

    let (done_tx, done) = oneshot::channel();
    let recorder = Arc::clone(&h.recorder);
    h.downloader.delete_unfinished_tasks(
        vec![A.to_string(), B.to_string()],
        Some(Box::new(move || {
            recorder.push("complete".to_string());
            let _ = done_tx.send(());
        })),
    );
    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), done)
        .await
        .expect("completion callback should run")
        .unwrap();

    assert!(!staged.exists());
    assert!(!h.downloader.has_task(A).await);

    let events = h.recorder.events();
    let tail: Vec<&str> = events.iter().rev().take(3).rev().map(String::as_str).collect();
    assert_eq!(
        tail,
        vec![
            format!("cancelled:{}", A).as_str(),
            format!("deleted:{},{}", A, B).as_str(),
            "complete",
        ]
    );
    assert_eq!(h.recorder.count(&format!("cancelled:{}", B)), 0);
}

#[tokio::test]
async fn test_delete_with_missing_file_still_completes() {
    let h = harness();
    h.downloader.download(A);
    h.downloader.flush().await;
    h.engine
        .sink(A)
        .size_known(1, Some(PathBuf::from("/nonexistent/stagedl/a.part")));

    let (done_tx, done) = oneshot::channel();
    h.downloader.delete_unfinished_tasks(
        vec![A.to_string()],
        Some(Box::new(move || {
            let _ = done_tx.send(());
        })),
    );
    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), done)
        .await
        .expect("completion callback should run")
        .unwrap();
    assert_eq!(h.recorder.count(&format!("deleted:{}", A)), 1);
}

// =============================================================================
// ENGINE EVENTS
// =============================================================================

#[tokio::test]
async fn test_progress_never_decreases() {
    let h = harness();
    h.downloader.download(A);
    h.downloader.flush().await;

    let sink = h.engine.sink(A);
    sink.size_known(100, None);
    for fraction in [0.2, 0.5, 0.3, 0.9, 1.4] {
        sink.progress(fraction);
    }
    h.downloader.flush().await;

    let progress: Vec<String> = h
        .recorder
        .events_for(A)
        .into_iter()
        .filter(|e| e.starts_with("progress"))
        .collect();
    assert_eq!(
        progress,
        vec![
            format!("progress:0.2:{}", A),
            format!("progress:0.5:{}", A),
            format!("progress:0.9:{}", A),
            format!("progress:1:{}", A),
        ]
    );
    let record = h.downloader.records().await.remove(0);
    assert_eq!(record.progress, 1.0);
}

#[tokio::test]
async fn test_success_removes_task() {
    let h = harness();
    h.downloader.download(A);
    h.downloader.flush().await;

    let sink = h.engine.sink(A);
    sink.size_known(3, None);
    sink.succeeded(h.dir.path().join("cache").join("a.bin"));
    h.downloader.flush().await;

    assert!(!h.downloader.has_task(A).await);
    assert_eq!(h.recorder.count(&format!("finished:{}", A)), 1);
}

#[tokio::test]
async fn test_failure_reported_as_cancel() {
    let h = harness();
    h.downloader.download(A);
    h.downloader.flush().await;

    h.engine.sink(A).failed(Some("server responded with status 500".into()));
    h.downloader.flush().await;

    assert!(!h.downloader.has_task(A).await);
    assert_eq!(h.recorder.count(&format!("cancelled:{}", A)), 1);
    // The engine ended the transfer itself; nothing to cancel.
    assert!(!h.engine.calls().contains(&format!("cancel:{}", A)));
}

#[tokio::test]
async fn test_stale_events_after_redownload_are_ignored() {
    let h = harness();
    h.downloader.download(A);
    h.downloader.flush().await;
    let first = h.engine.sink(A);

    h.downloader.cancel(A);
    h.downloader.download(A);
    h.downloader.flush().await;
    let second = h.engine.sink(A);
    assert_ne!(first.id(), second.id());

    first.size_known(10, None);
    first.progress(0.7);
    first.succeeded(PathBuf::from("/tmp/a.bin"));
    h.downloader.flush().await;

    assert!(h.downloader.has_task(A).await);
    assert_eq!(h.downloader.state_of(A).await, Some(TaskState::Requested));
    assert_eq!(h.recorder.count(&format!("finished:{}", A)), 0);

    second.size_known(10, None);
    h.downloader.flush().await;
    assert_eq!(h.downloader.state_of(A).await, Some(TaskState::Downloading));
}

#[tokio::test]
async fn test_later_command_wins() {
    let h = harness();
    h.downloader.download(A);
    h.downloader.cancel(A);
    h.downloader.download(A);
    assert!(h.downloader.has_task(A).await);

    h.downloader.cancel(A);
    assert!(!h.downloader.has_task(A).await);
    assert_eq!(
        h.engine.calls(),
        vec![
            format!("start:{}", A),
            format!("cancel:{}", A),
            format!("start:{}", A),
            format!("cancel:{}", A),
        ]
    );
}

// =============================================================================
// OBSERVERS
// =============================================================================

#[tokio::test]
async fn test_observer_added_twice_receives_once() {
    let h = harness();
    h.downloader.add_observer(&h.recorder);
    h.downloader.download(A);
    h.downloader.flush().await;

    assert_eq!(h.recorder.count(&format!("will_start:{}", A)), 1);
}

#[tokio::test]
async fn test_removed_and_dropped_observers_receive_nothing() {
    let h = harness();
    let removed = Arc::new(Recorder::default());
    let dropped = Arc::new(Recorder::default());
    h.downloader.add_observer(&removed);
    h.downloader.add_observer(&dropped);
    let witness = Arc::downgrade(&dropped);

    h.downloader.remove_observer(&removed);
    drop(dropped);
    assert!(witness.upgrade().is_none());

    h.downloader.download(A);
    h.downloader.flush().await;
    assert!(removed.events().is_empty());
    assert_eq!(h.recorder.count(&format!("will_start:{}", A)), 1);
}

#[tokio::test]
async fn test_independent_downloaders() {
    let first = harness();
    let second = harness();
    first.downloader.download(A);

    assert!(first.downloader.has_task(A).await);
    assert!(!second.downloader.has_task(A).await);
    assert!(second.recorder.events().is_empty());
}

// =============================================================================
// SETTINGS
// =============================================================================

#[tokio::test]
async fn test_concurrency_cap_passes_through() {
    let h = harness();
    assert_eq!(*h.engine.cap.lock().unwrap(), Some(1));

    h.downloader.set_concurrency_cap(4);
    assert_eq!(*h.engine.cap.lock().unwrap(), Some(4));

    h.downloader.set_concurrency_cap(0);
    assert_eq!(*h.engine.cap.lock().unwrap(), Some(1));
}

#[tokio::test]
async fn test_shutdown_pauses_and_stops() {
    let h = harness();
    h.downloader.download(A);
    h.downloader.flush().await;

    h.downloader.shutdown();
    h.downloader.download(B);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.engine.calls().contains(&format!("pause:{}", A)));
    assert_eq!(h.engine.starts(), 1);
    // Queries after shutdown see nothing.
    assert!(!h.downloader.has_task(A).await);
}
