// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Normalized lifecycle events broadcast to observers.

use std::path::PathBuf;

/// One notification fanned out by the observer registry.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// A download was requested (sent before admission, even for duplicates)
    WillStart { locator: String },
    /// The engine began transferring bytes
    DidStart { locator: String },
    /// Total size in bytes became known
    SizeKnown { locator: String, total_bytes: u64 },
    /// The in-progress file location became known
    StagingPathKnown { locator: String, path: PathBuf },
    /// Completed fraction changed
    Progress { locator: String, fraction: f64 },
    /// The destination file is in place
    Finished { locator: String, path: PathBuf },
    Paused { locator: String },
    PausedAll,
    Resumed { locator: String },
    ResumedAll,
    /// Cancelled by the caller, or the transfer failed
    Cancelled { locator: String },
    CancelledAll,
    /// Staging files for these locators were deleted
    UnfinishedDeleted { locators: Vec<String> },
}

impl DownloadEvent {
    /// Locator this event is about, if it concerns a single task.
    pub fn locator(&self) -> Option<&str> {
        match self {
            DownloadEvent::WillStart { locator }
            | DownloadEvent::DidStart { locator }
            | DownloadEvent::SizeKnown { locator, .. }
            | DownloadEvent::StagingPathKnown { locator, .. }
            | DownloadEvent::Progress { locator, .. }
            | DownloadEvent::Finished { locator, .. }
            | DownloadEvent::Paused { locator }
            | DownloadEvent::Resumed { locator }
            | DownloadEvent::Cancelled { locator } => Some(locator),
            DownloadEvent::PausedAll
            | DownloadEvent::ResumedAll
            | DownloadEvent::CancelledAll
            | DownloadEvent::UnfinishedDeleted { .. } => None,
        }
    }
}
