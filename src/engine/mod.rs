// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer engines: the byte-moving layer the task manager drives.
//!
//! An engine receives a [`TransferRequest`] plus an [`EventSink`] and reports
//! back through the sink. The sink posts onto the task manager's own queue, so
//! engine events are ordered with caller commands and never touch task state
//! directly.
//!
//! Engine contract:
//! - `start` returns immediately; duplicate locators are ignored.
//! - `SizeKnown` is reported at most once per transfer, before any progress.
//! - Exactly one of `Succeeded`/`Failed` ends a transfer.
//! - `cancel` disposes of the staging file.
//! - At most `concurrency_cap` transfers move bytes at once; a paused
//!   transfer gives its slot back.

pub mod http;
pub mod pool;

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

use crate::download::manager::ManagerCommand;
use crate::download::types::{DownloadHints, TransferId};

pub use http::HttpEngine;
pub use pool::{SlotGuard, SlotPool};

/// Everything an engine needs to run one transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Generation tag to stamp on every event for this transfer
    pub id: TransferId,
    /// Source locator
    pub locator: String,
    /// Placement hints; the file name is always resolved by the facade
    pub hints: DownloadHints,
}

/// What happened to a transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEventKind {
    /// Total size is known; `staging_path` is where partial data goes
    SizeKnown {
        total_bytes: u64,
        staging_path: Option<PathBuf>,
    },
    /// Completed fraction
    Progress(f64),
    /// Finished file is at this path
    Succeeded(PathBuf),
    /// Transfer stopped for good, with an optional reason
    Failed(Option<String>),
}

/// An engine report, tagged with the transfer it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub id: TransferId,
    pub locator: String,
    pub kind: EngineEventKind,
}

/// Channel back to the task manager for one transfer.
#[derive(Debug, Clone)]
pub struct EventSink {
    id: TransferId,
    locator: String,
    tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl EventSink {
    pub(crate) fn new(
        id: TransferId,
        locator: impl Into<String>,
        tx: mpsc::UnboundedSender<ManagerCommand>,
    ) -> Self {
        Self {
            id,
            locator: locator.into(),
            tx,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn size_known(&self, total_bytes: u64, staging_path: Option<PathBuf>) {
        self.post(EngineEventKind::SizeKnown {
            total_bytes,
            staging_path,
        });
    }

    pub fn progress(&self, fraction: f64) {
        self.post(EngineEventKind::Progress(fraction));
    }

    pub fn succeeded(&self, path: PathBuf) {
        self.post(EngineEventKind::Succeeded(path));
    }

    pub fn failed(&self, reason: Option<String>) {
        self.post(EngineEventKind::Failed(reason));
    }

    fn post(&self, kind: EngineEventKind) {
        let event = EngineEvent {
            id: self.id,
            locator: self.locator.clone(),
            kind,
        };
        if self.tx.send(ManagerCommand::Engine(event)).is_err() {
            trace!(locator = %self.locator, "task manager stopped; engine event dropped");
        }
    }
}

/// The byte-transfer mechanism consumed by the task manager.
///
/// Every method must return without waiting on the network.
pub trait TransferEngine: Send + Sync {
    /// Begin (or queue) a transfer and report through `sink`.
    fn start(&self, request: TransferRequest, sink: EventSink);

    fn pause(&self, locator: &str);

    fn resume(&self, locator: &str);

    /// Stop the transfer and dispose of its staging file.
    fn cancel(&self, locator: &str);

    /// Maximum number of simultaneously active transfers (at least 1).
    fn set_concurrency_cap(&self, cap: usize);

    /// Stall timeout for transfers started after this call. `None` disables it.
    fn set_timeout(&self, timeout: Option<Duration>);
}
