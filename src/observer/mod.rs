// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Observer interface and the weakly-held registry that feeds it.
//!
//! Observers are registered by `Arc` but only a `Weak` handle is kept, so
//! dropping the last strong reference is all an observer needs to do to stop
//! receiving events. Every callback runs on the registry's single delivery
//! thread, never concurrently with another callback.

pub mod registry;

use std::path::Path;

use crate::download::events::DownloadEvent;

pub use registry::ObserverRegistry;

/// Receives download lifecycle callbacks. Every method defaults to a no-op.
///
/// Observers should not persist anything from inside these callbacks that
/// they could instead look up later; the callbacks are notifications.
#[allow(unused_variables)]
pub trait DownloadObserver: Send + Sync {
    fn will_start(&self, locator: &str) {}
    fn did_start(&self, locator: &str) {}
    fn on_progress(&self, locator: &str, fraction: f64) {}
    fn on_size_known(&self, locator: &str, total_bytes: u64) {}
    /// The path the engine is writing partial data to.
    fn on_staging_path_known(&self, locator: &str, path: &Path) {}
    fn on_finished(&self, locator: &str, path: &Path) {}
    fn on_paused(&self, locator: &str) {}
    fn on_paused_all(&self) {}
    fn on_resumed(&self, locator: &str) {}
    fn on_resumed_all(&self) {}
    /// Sent both for explicit cancels and for failed transfers.
    fn on_cancelled(&self, locator: &str) {}
    fn on_cancelled_all(&self) {}
    /// Staging files have already been removed; drop any reference to them.
    fn on_unfinished_deleted(&self, locators: &[String]) {}

    /// File name (with extension) for a new download. The first observer
    /// returning a non-empty name wins.
    fn resolve_file_name(&self, locator: &str) -> Option<String> {
        None
    }
}

/// Invoke the callback matching `event` on one observer.
pub(crate) fn deliver(event: &DownloadEvent, observer: &dyn DownloadObserver) {
    match event {
        DownloadEvent::WillStart { locator } => observer.will_start(locator),
        DownloadEvent::DidStart { locator } => observer.did_start(locator),
        DownloadEvent::SizeKnown { locator, total_bytes } => {
            observer.on_size_known(locator, *total_bytes)
        }
        DownloadEvent::StagingPathKnown { locator, path } => {
            observer.on_staging_path_known(locator, path)
        }
        DownloadEvent::Progress { locator, fraction } => observer.on_progress(locator, *fraction),
        DownloadEvent::Finished { locator, path } => observer.on_finished(locator, path),
        DownloadEvent::Paused { locator } => observer.on_paused(locator),
        DownloadEvent::PausedAll => observer.on_paused_all(),
        DownloadEvent::Resumed { locator } => observer.on_resumed(locator),
        DownloadEvent::ResumedAll => observer.on_resumed_all(),
        DownloadEvent::Cancelled { locator } => observer.on_cancelled(locator),
        DownloadEvent::CancelledAll => observer.on_cancelled_all(),
        DownloadEvent::UnfinishedDeleted { locators } => observer.on_unfinished_deleted(locators),
    }
}
