// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP transfer engine built on reqwest streaming.
//!
//! Each transfer is a tokio task steered by a `watch` channel
//! (run / pause / cancel). Bytes go to `<staging_dir>/<name>.part`; on
//! completion the file is moved to `<dest_dir>/<name>`. Resuming, whether
//! after a pause or in a later run, sends `Range: bytes=<staged len>-` and
//! appends when the server answers 206. Any other success status restarts
//! the file from zero; a 416 discards the staged bytes and fetches again.
//!
//! Jobs sharing a staging file run one after another, so a locator that is
//! cancelled and immediately requested again never sees the old job's
//! cleanup.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use super::pool::{SlotGuard, SlotPool};
use super::{EventSink, TransferEngine, TransferRequest};
use crate::config::DownloaderConfig;
use crate::download::types::{fallback_file_name, TransferId};
use crate::error::TransferError;
use crate::locks::{resilient_lock, resilient_read, resilient_write};

/// Connection establishment timeout, independent of the stall timeout.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Suffix of in-progress files.
pub const STAGING_SUFFIX: &str = "part";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

/// How a single fetch attempt ended.
enum Step {
    Finished(PathBuf),
    Paused,
    /// Staged bytes were discarded; fetch again while keeping the slot.
    Restart,
    Cancelled,
}

struct TransferHandle {
    id: TransferId,
    control: watch::Sender<Control>,
}

type Transfers = Arc<RwLock<HashMap<String, TransferHandle>>>;

/// Held by a job for as long as it may touch its staging file.
type StagingLock = Arc<AsyncMutex<()>>;

/// Streams HTTP(S) resources to staging files, at most `concurrency_cap` at
/// a time.
pub struct HttpEngine {
    client: reqwest::Client,
    pool: Arc<SlotPool>,
    transfers: Transfers,
    staging_locks: Mutex<HashMap<PathBuf, StagingLock>>,
    timeout: RwLock<Option<Duration>>,
    staging_dir: PathBuf,
    cache_dir: PathBuf,
}

impl HttpEngine {
    /// Build an engine from the downloader settings.
    pub fn new(config: &DownloaderConfig) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(concat!("stagedl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            pool: SlotPool::new(config.concurrency_cap),
            transfers: Arc::new(RwLock::new(HashMap::new())),
            staging_locks: Mutex::new(HashMap::new()),
            timeout: RwLock::new(config.timeout()),
            staging_dir: config.staging_dir(),
            cache_dir: config.cache_dir(),
        })
    }

    /// Transfers currently holding a slot.
    pub fn active_transfers(&self) -> usize {
        self.pool.active()
    }

    /// Transfers started and not yet finished, including queued and paused ones.
    pub fn tracked_transfers(&self) -> usize {
        resilient_read(&self.transfers).len()
    }

    /// Staging file used for a given name inside a staging directory.
    pub fn staging_path(staging_dir: &Path, file_name: &str) -> PathBuf {
        staging_dir.join(format!("{}.{}", file_name, STAGING_SUFFIX))
    }

    fn staging_lock(&self, staging_path: &Path) -> StagingLock {
        let mut locks = resilient_lock(&self.staging_locks);
        // Entries nobody holds any more belong to finished jobs.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(staging_path.to_path_buf()).or_default())
    }

    fn set_control(&self, locator: &str, from: Control, to: Control) {
        if let Some(handle) = resilient_read(&self.transfers).get(locator) {
            handle.control.send_if_modified(|current| {
                if *current == from {
                    *current = to;
                    true
                } else {
                    false
                }
            });
        }
    }
}

impl TransferEngine for HttpEngine {
    fn start(&self, request: TransferRequest, sink: EventSink) {
        let TransferRequest { id, locator, hints } = request;

        let mut transfers = resilient_write(&self.transfers);
        if transfers.contains_key(&locator) {
            warn!(locator = %locator, "transfer already running; start ignored");
            return;
        }

        let file_name = hints
            .file_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(fallback_file_name);
        let staging_dir = hints.staging_dir.unwrap_or_else(|| self.staging_dir.clone());
        let dest_dir = hints.dest_dir.unwrap_or_else(|| self.cache_dir.clone());

        let (control, control_rx) = watch::channel(Control::Run);
        transfers.insert(locator.clone(), TransferHandle { id, control });
        drop(transfers);

        let staging_path = Self::staging_path(&staging_dir, &file_name);
        let job = TransferJob {
            id,
            staging_lock: self.staging_lock(&staging_path),
            staging_path,
            destination_path: dest_dir.join(&file_name),
            locator,
            client: self.client.clone(),
            pool: Arc::clone(&self.pool),
            transfers: Arc::clone(&self.transfers),
            timeout: *resilient_read(&self.timeout),
        };

        tokio::spawn(job.run(control_rx, sink));
    }

    fn pause(&self, locator: &str) {
        self.set_control(locator, Control::Run, Control::Pause);
    }

    fn resume(&self, locator: &str) {
        self.set_control(locator, Control::Pause, Control::Run);
    }

    fn cancel(&self, locator: &str) {
        if let Some(handle) = resilient_write(&self.transfers).remove(locator) {
            let _ = handle.control.send(Control::Cancel);
        }
    }

    fn set_concurrency_cap(&self, cap: usize) {
        self.pool.set_capacity(cap);
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        *resilient_write(&self.timeout) = timeout;
    }
}

/// One transfer's fixed parameters.
struct TransferJob {
    id: TransferId,
    locator: String,
    staging_path: PathBuf,
    staging_lock: StagingLock,
    destination_path: PathBuf,
    client: reqwest::Client,
    pool: Arc<SlotPool>,
    transfers: Transfers,
    timeout: Option<Duration>,
}

/// What has been reported to the sink so far.
#[derive(Debug, Default)]
struct Reported {
    size: bool,
    fraction: f64,
}

impl TransferJob {
    /// Cleanup (staging removal, map entry, slot) happens before the terminal
    /// event is posted, so a re-request issued from the callback starts clean.
    async fn run(self, mut control: watch::Receiver<Control>, sink: EventSink) {
        // A new job for the same staging file waits here until the previous
        // one has finished with it.
        let staged = tokio::select! {
            guard = Arc::clone(&self.staging_lock).lock_owned() => Some(guard),
            _ = until_cancelled(&mut control) => None,
        };
        let Some(_staged) = staged else {
            self.retire();
            debug!(locator = %self.locator, "transfer cancelled before it started");
            sink.failed(Some("cancelled".to_string()));
            return;
        };

        let mut slot = None;
        let result = self.drive(&mut control, &sink, &mut slot).await;

        if matches!(result, Ok(None)) {
            // A closed control channel means the engine went away; the
            // staged bytes are kept for a later run.
            if *control.borrow() == Control::Cancel {
                remove_quietly(&self.staging_path).await;
                debug!(locator = %self.locator, "transfer cancelled");
            } else {
                debug!(locator = %self.locator, "engine dropped; staging file kept");
            }
        }
        self.retire();
        drop(slot);

        match result {
            Ok(Some(path)) => {
                info!(locator = %self.locator, path = ?path, "transfer finished");
                sink.succeeded(path);
            }
            Ok(None) => sink.failed(Some("cancelled".to_string())),
            Err(e) => {
                // The staging file stays so a later request can resume it.
                warn!(locator = %self.locator, error = %e, "transfer failed");
                sink.failed(Some(e.to_string()));
            }
        }
    }

    /// Drop this job's entry unless a newer transfer already replaced it.
    fn retire(&self) {
        let mut transfers = resilient_write(&self.transfers);
        if transfers.get(&self.locator).map(|h| h.id) == Some(self.id) {
            transfers.remove(&self.locator);
        }
    }

    /// Returns the destination on success, `None` when cancelled. The slot is
    /// left in `slot` so the caller decides when it is released.
    async fn drive(
        &self,
        control: &mut watch::Receiver<Control>,
        sink: &EventSink,
        slot: &mut Option<SlotGuard>,
    ) -> Result<Option<PathBuf>, TransferError> {
        let mut reported = Reported::default();

        loop {
            if wait_while_paused(control).await == Control::Cancel {
                return Ok(None);
            }

            if slot.is_none() {
                let acquired = tokio::select! {
                    acquired = self.pool.acquire() => acquired,
                    changed = control.changed() => {
                        if changed.is_err() {
                            return Ok(None);
                        }
                        continue;
                    }
                };
                *slot = Some(acquired);
                debug!(locator = %self.locator, transfer = %self.id, "transfer admitted");
            }

            match self.fetch(control, sink, &mut reported).await? {
                Step::Finished(path) => return Ok(Some(path)),
                Step::Paused => {
                    *slot = None;
                    debug!(locator = %self.locator, "transfer paused; slot released");
                }
                Step::Restart => {
                    debug!(locator = %self.locator, "staged bytes discarded; fetching from the start");
                }
                Step::Cancelled => return Ok(None),
            }
        }
    }

    async fn fetch(
        &self,
        control: &mut watch::Receiver<Control>,
        sink: &EventSink,
        reported: &mut Reported,
    ) -> Result<Step, TransferError> {
        if let Some(dir) = self.staging_path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let offset = fs::metadata(&self.staging_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);

        let mut request = self.client.get(&self.locator);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            response = self.within(request.send()) => response??,
            step = next_stop(control) => return Ok(step),
        };

        let status = response.status();
        if offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
            // Typically the staged file is already whole, or the resource
            // shrank. Either way the staged bytes cannot be extended.
            debug!(locator = %self.locator, offset, "server rejected staged range");
            drop(response);
            remove_quietly(&self.staging_path).await;
            return Ok(Step::Restart);
        }
        if !status.is_success() {
            return Err(TransferError::Status(status.as_u16()));
        }

        let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let (mut file, mut received) = if resumed {
            debug!(locator = %self.locator, offset, "resuming from staged bytes");
            let file = OpenOptions::new()
                .append(true)
                .open(&self.staging_path)
                .await?;
            (file, offset)
        } else {
            if offset > 0 {
                debug!(
                    locator = %self.locator,
                    offset,
                    status = status.as_u16(),
                    "server ignored range; restarting from zero"
                );
            }
            (File::create(&self.staging_path).await?, 0)
        };

        let total = response.content_length().map(|len| len + received);
        if !reported.size {
            sink.size_known(total.unwrap_or(0), Some(self.staging_path.clone()));
            reported.size = true;
        }

        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                chunk = self.within(stream.next()) => {
                    let Some(chunk) = chunk? else {
                        break;
                    };
                    let chunk = chunk?;
                    file.write_all(&chunk).await?;
                    received += chunk.len() as u64;
                    if let Some(total) = total.filter(|t| *t > 0) {
                        // After a restart from zero, stay quiet until the
                        // new stream passes what was already reported.
                        let fraction = received as f64 / total as f64;
                        if fraction > reported.fraction {
                            sink.progress(fraction);
                            reported.fraction = fraction;
                        }
                    }
                }
                step = next_stop(control) => {
                    file.flush().await?;
                    return Ok(step);
                }
            }
        }

        file.flush().await?;
        drop(file);

        if let Some(dir) = self.destination_path.parent() {
            fs::create_dir_all(dir).await?;
        }
        if let Err(e) = fs::rename(&self.staging_path, &self.destination_path).await {
            // Staging and destination may live on different filesystems.
            debug!(error = %e, "rename failed; copying staged file instead");
            fs::copy(&self.staging_path, &self.destination_path).await?;
            remove_quietly(&self.staging_path).await;
        }

        if total.is_none() {
            sink.progress(1.0);
        }
        Ok(Step::Finished(self.destination_path.clone()))
    }

    async fn within<F: Future>(&self, fut: F) -> Result<F::Output, TransferError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| TransferError::Timeout(limit)),
            None => Ok(fut.await),
        }
    }
}

/// Block while paused. Returns the first non-pause state; a closed channel
/// counts as cancel.
async fn wait_while_paused(control: &mut watch::Receiver<Control>) -> Control {
    loop {
        let current = *control.borrow_and_update();
        if current != Control::Pause {
            return current;
        }
        if control.changed().await.is_err() {
            return Control::Cancel;
        }
    }
}

/// Resolve once the transfer is asked to pause or cancel.
async fn next_stop(control: &mut watch::Receiver<Control>) -> Step {
    loop {
        if control.changed().await.is_err() {
            return Step::Cancelled;
        }
        match *control.borrow_and_update() {
            Control::Pause => return Step::Paused,
            Control::Cancel => return Step::Cancelled,
            Control::Run => {}
        }
    }
}

/// Resolve once the transfer is cancelled or its engine is gone.
async fn until_cancelled(control: &mut watch::Receiver<Control>) {
    loop {
        if *control.borrow_and_update() == Control::Cancel {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = ?path, "staging file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = ?path, error = %e, "could not remove staging file"),
    }
}
