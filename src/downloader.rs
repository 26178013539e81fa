// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Public entry point tying the task manager to the observer registry.
//!
//! A [`Downloader`] is an ordinary value: create as many as needed, each with
//! its own engine, task map, and observers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::config::DownloaderConfig;
use crate::download::events::DownloadEvent;
use crate::download::manager::TaskManager;
use crate::download::types::{DownloadHints, TaskRecord, TaskState};
use crate::engine::{HttpEngine, TransferEngine};
use crate::error::TransferError;
use crate::observer::{DownloadObserver, ObserverRegistry};

/// Callback run on the delivery thread once a bulk delete is complete.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Download manager facade.
///
/// Control methods never block and never fail: they are queued and applied in
/// call order. Queries are `async` and reflect every command issued before
/// them.
pub struct Downloader {
    manager: TaskManager,
    observers: Arc<ObserverRegistry>,
    engine: Arc<dyn TransferEngine>,
    staging_dir: PathBuf,
    cache_dir: PathBuf,
    runtime: Handle,
}

impl Downloader {
    /// Build a downloader over `engine`, applying the cap and timeout from
    /// `config`. Must be called within a Tokio runtime.
    pub fn new(engine: Arc<dyn TransferEngine>, config: &DownloaderConfig) -> Self {
        engine.set_concurrency_cap(config.concurrency_cap.max(1));
        engine.set_timeout(config.timeout());

        let observers = Arc::new(ObserverRegistry::new());
        let manager = TaskManager::new(Arc::clone(&engine), Arc::clone(&observers));

        Self {
            manager,
            observers,
            engine,
            staging_dir: config.staging_dir(),
            cache_dir: config.cache_dir(),
            runtime: Handle::current(),
        }
    }

    /// Build a downloader backed by [`HttpEngine`].
    pub fn with_http(config: &DownloaderConfig) -> Result<Self, TransferError> {
        let engine = HttpEngine::new(config)?;
        Ok(Self::new(Arc::new(engine), config))
    }

    /// Register an observer. Only a weak handle is kept; adding the same
    /// observer twice has no effect.
    pub fn add_observer<O>(&self, observer: &Arc<O>)
    where
        O: DownloadObserver + 'static,
    {
        if !self.observers.add(observer) {
            debug!("observer already registered");
        }
    }

    pub fn remove_observer<O>(&self, observer: &Arc<O>)
    where
        O: DownloadObserver + ?Sized + 'static,
    {
        self.observers.remove(observer);
    }

    /// Download `locator` with default placement.
    pub fn download(&self, locator: impl Into<String>) {
        self.download_with(locator, DownloadHints::default());
    }

    /// Download `locator` with explicit placement hints.
    ///
    /// `will_start` is sent for every call, duplicates included. When the
    /// hints carry no file name, observers are asked for one on this thread.
    pub fn download_with(&self, locator: impl Into<String>, mut hints: DownloadHints) {
        let locator = locator.into();
        self.observers.dispatch(DownloadEvent::WillStart {
            locator: locator.clone(),
        });

        let unnamed = hints
            .file_name
            .as_deref()
            .map_or(true, |name| name.trim().is_empty());
        if unnamed {
            hints.file_name = Some(self.observers.resolve_file_name(&locator));
        }
        hints
            .staging_dir
            .get_or_insert_with(|| self.staging_dir.clone());
        hints.dest_dir.get_or_insert_with(|| self.cache_dir.clone());

        self.manager.download(locator, hints);
    }

    pub fn pause(&self, locator: impl Into<String>) {
        self.manager.pause(locator);
    }

    pub fn resume(&self, locator: impl Into<String>) {
        self.manager.resume(locator);
    }

    pub fn pause_all(&self) {
        self.manager.pause_all();
    }

    pub fn resume_all(&self) {
        self.manager.resume_all();
    }

    pub fn cancel(&self, locator: impl Into<String>) {
        self.manager.cancel(locator);
    }

    pub fn cancel_all(&self) {
        self.manager.cancel_all();
    }

    /// Cancel `locators` and delete whatever they had staged.
    ///
    /// Runs in order: the cancels (with their `on_cancelled` events), the file
    /// deletions, one `on_unfinished_deleted` event listing every requested
    /// locator, then `on_complete` on the delivery thread. Untracked locators
    /// and files that cannot be removed are skipped.
    pub fn delete_unfinished_tasks(
        &self,
        locators: Vec<String>,
        on_complete: Option<CompletionCallback>,
    ) {
        let staged = self.manager.cancel_for_deletion(locators.clone());
        let observers = Arc::clone(&self.observers);

        self.runtime.spawn(async move {
            let paths = staged.await.unwrap_or_default();
            for path in &paths {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    debug!(path = ?path, error = %e, "staging file not deleted");
                }
            }
            debug!(deleted = paths.len(), "unfinished downloads removed");

            observers.dispatch(DownloadEvent::UnfinishedDeleted { locators });
            if let Some(callback) = on_complete {
                observers.run_on_delivery(callback);
            }
        });
    }

    /// Locators currently tracked, in admission order.
    pub async fn current_locators(&self) -> Vec<String> {
        self.manager.current_locators().await
    }

    pub async fn state_of(&self, locator: impl Into<String>) -> Option<TaskState> {
        self.manager.state_of(locator).await
    }

    pub async fn has_task(&self, locator: impl Into<String>) -> bool {
        self.manager.has_task(locator).await
    }

    pub async fn is_paused(&self, locator: impl Into<String>) -> bool {
        self.manager.is_paused(locator).await
    }

    pub async fn staging_path_for(&self, locator: impl Into<String>) -> Option<PathBuf> {
        self.manager.staging_path_for(locator).await
    }

    /// Snapshot of every tracked record.
    pub async fn records(&self) -> Vec<TaskRecord> {
        self.manager.records().await
    }

    /// Stall timeout for transfers started from now on. `None` disables it.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.engine.set_timeout(timeout);
    }

    /// Maximum number of simultaneously active transfers.
    pub fn set_concurrency_cap(&self, cap: usize) {
        if cap == 0 {
            warn!("concurrency cap of 0 raised to 1");
        }
        self.engine.set_concurrency_cap(cap.max(1));
    }

    /// Wait until every command issued so far has been applied and every
    /// resulting event delivered.
    pub async fn flush(&self) {
        self.manager.records().await;
        self.observers.settle().await;
    }

    /// Pause all transfers and stop accepting commands. Staged data is kept.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        self.manager.shutdown();
    }
}
