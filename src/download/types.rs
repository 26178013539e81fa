// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task records and the lifecycle they move through.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix appended to generated names when no observer supplies one.
pub const UNNAMED_FILE_SUFFIX: &str = "_unnamed_file";

/// Lifecycle state of a task record.
///
/// The terminal states only ever appear on a record that has just been
/// removed from the task map; a tracked locator is always in one of the first
/// three.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    /// Admitted, waiting for the engine to report a size
    Requested,
    /// Bytes are flowing (or queued behind the concurrency cap)
    Downloading,
    /// Paused by the caller
    Paused,
    /// Destination file is in place
    Succeeded,
    /// The engine gave up on the transfer
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl TaskState {
    /// Returns true if the task is over (success, failure, or cancel).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Generation tag for one engine transfer.
///
/// A locator that is cancelled and requested again gets a new id, so late
/// events from the first transfer cannot touch the second record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Optional placement hints passed through to the transfer engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadHints {
    /// Directory for the in-progress file
    pub staging_dir: Option<PathBuf>,
    /// Directory for the finished file
    pub dest_dir: Option<PathBuf>,
    /// File name (including extension) for both
    pub file_name: Option<String>,
}

impl DownloadHints {
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    pub fn with_dest_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dest_dir = Some(dir.into());
        self
    }
}

/// Per-locator state owned by the task manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Source locator; the join key across every component
    pub locator: String,
    /// Engine transfer this record belongs to
    pub transfer_id: TransferId,
    /// In-progress file, once the engine has reported it
    pub staging_path: Option<PathBuf>,
    /// Finished file; only set on success
    pub destination_path: Option<PathBuf>,
    /// Total size reported by the engine
    pub total_bytes: Option<u64>,
    /// Completed fraction in `[0.0, 1.0]`, never decreasing
    pub progress: f64,
    /// Current lifecycle state
    pub state: TaskState,
    /// When the record was admitted
    pub created_at: DateTime<Utc>,
    /// When the state last changed
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a freshly admitted record.
    pub fn new(locator: impl Into<String>, transfer_id: TransferId) -> Self {
        let now = Utc::now();
        Self {
            locator: locator.into(),
            transfer_id,
            staging_path: None,
            destination_path: None,
            total_bytes: None,
            progress: 0.0,
            state: TaskState::Requested,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the state and timestamp.
    pub fn update_state(&mut self, state: TaskState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Record the size and staging path reported by the engine.
    ///
    /// Moves a requested task to downloading. A task paused before its size
    /// arrived stays paused.
    pub fn mark_size_known(&mut self, total_bytes: u64, staging_path: Option<PathBuf>) {
        self.total_bytes = Some(total_bytes);
        if staging_path.is_some() {
            self.staging_path = staging_path;
        }
        if self.state == TaskState::Requested {
            self.update_state(TaskState::Downloading);
        }
    }

    /// State a resumed task returns to.
    pub fn mark_resumed(&mut self) {
        let state = if self.total_bytes.is_some() {
            TaskState::Downloading
        } else {
            TaskState::Requested
        };
        self.update_state(state);
    }

    /// Apply a progress report.
    ///
    /// Returns the accepted fraction, clamped to `[0.0, 1.0]`, or `None` when
    /// the report would move progress backwards (or is not a number).
    pub fn advance_progress(&mut self, fraction: f64) -> Option<f64> {
        if fraction.is_nan() {
            return None;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction < self.progress {
            return None;
        }
        self.progress = fraction;
        Some(fraction)
    }
}

/// Build a unique opaque file name of the form `<hex-id>_unnamed_file`.
pub fn fallback_file_name() -> String {
    let id: [u8; 16] = rand::random();
    format!("{}{}", hex::encode_upper(id), UNNAMED_FILE_SUFFIX)
}
