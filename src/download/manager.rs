// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task manager: the single owner of the task map.
//!
//! Caller commands and engine events share one unbounded queue consumed by a
//! worker task. Every read and write of the map happens on that worker, in
//! submission order, so a `download` racing a `cancel` for the same locator
//! resolves in favor of whichever was queued last. No locks guard the map.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::events::DownloadEvent;
use super::types::{DownloadHints, TaskRecord, TaskState, TransferId};
use crate::engine::{EngineEvent, EngineEventKind, EventSink, TransferEngine, TransferRequest};
use crate::observer::ObserverRegistry;

/// Messages consumed by the worker.
#[derive(Debug)]
pub(crate) enum ManagerCommand {
    Download {
        locator: String,
        hints: DownloadHints,
    },
    Pause {
        locator: String,
    },
    Resume {
        locator: String,
    },
    PauseAll,
    ResumeAll,
    Cancel {
        locator: String,
    },
    CancelAll,
    /// Cancel each locator and reply with the staging paths they had
    CancelForDeletion {
        locators: Vec<String>,
        reply: oneshot::Sender<Vec<PathBuf>>,
    },
    Inspect {
        locator: String,
        reply: oneshot::Sender<Option<TaskRecord>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<TaskRecord>>,
    },
    /// Report from a transfer engine
    Engine(EngineEvent),
    /// Pause every transfer and stop the worker
    Shutdown,
}

/// Handle to the task manager worker. Cheap to clone.
///
/// Control methods enqueue and return immediately; queries are `async`
/// because they are answered by the worker in queue order.
#[derive(Debug, Clone)]
pub struct TaskManager {
    command_tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl TaskManager {
    /// Start the worker. Must be called within a Tokio runtime.
    pub fn new(engine: Arc<dyn TransferEngine>, observers: Arc<ObserverRegistry>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            records: HashMap::new(),
            engine,
            observers,
            inbox: command_tx.downgrade(),
            next_transfer: 0,
        };
        tokio::spawn(worker.run(command_rx));

        Self { command_tx }
    }

    /// Admit a download for `locator`. A locator that is already tracked is
    /// left alone.
    pub fn download(&self, locator: impl Into<String>, hints: DownloadHints) {
        self.send(ManagerCommand::Download {
            locator: locator.into(),
            hints,
        });
    }

    pub fn pause(&self, locator: impl Into<String>) {
        self.send(ManagerCommand::Pause {
            locator: locator.into(),
        });
    }

    pub fn resume(&self, locator: impl Into<String>) {
        self.send(ManagerCommand::Resume {
            locator: locator.into(),
        });
    }

    pub fn pause_all(&self) {
        self.send(ManagerCommand::PauseAll);
    }

    pub fn resume_all(&self) {
        self.send(ManagerCommand::ResumeAll);
    }

    pub fn cancel(&self, locator: impl Into<String>) {
        self.send(ManagerCommand::Cancel {
            locator: locator.into(),
        });
    }

    pub fn cancel_all(&self) {
        self.send(ManagerCommand::CancelAll);
    }

    /// Pause every transfer and stop the worker. Later commands are dropped.
    pub fn shutdown(&self) {
        self.send(ManagerCommand::Shutdown);
    }

    /// Copy of the record for `locator`, if tracked.
    pub async fn inspect(&self, locator: impl Into<String>) -> Option<TaskRecord> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::Inspect {
            locator: locator.into(),
            reply,
        });
        rx.await.ok().flatten()
    }

    /// Copies of every tracked record, in admission order.
    pub async fn records(&self) -> Vec<TaskRecord> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::Snapshot { reply });
        rx.await.unwrap_or_default()
    }

    pub async fn has_task(&self, locator: impl Into<String>) -> bool {
        self.inspect(locator).await.is_some()
    }

    /// False when the locator is not tracked.
    pub async fn is_paused(&self, locator: impl Into<String>) -> bool {
        self.state_of(locator).await == Some(TaskState::Paused)
    }

    pub async fn state_of(&self, locator: impl Into<String>) -> Option<TaskState> {
        self.inspect(locator).await.map(|r| r.state)
    }

    pub async fn staging_path_for(&self, locator: impl Into<String>) -> Option<PathBuf> {
        self.inspect(locator).await.and_then(|r| r.staging_path)
    }

    pub async fn current_locators(&self) -> Vec<String> {
        self.records().await.into_iter().map(|r| r.locator).collect()
    }

    /// Cancel `locators` and receive the staging paths their records held.
    ///
    /// The cancel is queued now, so it is ordered against every command
    /// submitted before and after this call.
    pub(crate) fn cancel_for_deletion(&self, locators: Vec<String>) -> oneshot::Receiver<Vec<PathBuf>> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerCommand::CancelForDeletion { locators, reply });
        rx
    }

    fn send(&self, command: ManagerCommand) {
        if self.command_tx.send(command).is_err() {
            debug!("task manager stopped; command dropped");
        }
    }
}

struct Worker {
    records: HashMap<String, TaskRecord>,
    engine: Arc<dyn TransferEngine>,
    observers: Arc<ObserverRegistry>,
    /// Used to hand engines a sink. Weak so the queue closes once every
    /// handle and in-flight transfer is gone.
    inbox: mpsc::WeakUnboundedSender<ManagerCommand>,
    next_transfer: u64,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ManagerCommand>) {
        while let Some(command) = commands.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        debug!("task manager worker stopped");
    }

    /// Returns false when the worker should stop.
    fn handle(&mut self, command: ManagerCommand) -> bool {
        match command {
            ManagerCommand::Download { locator, hints } => self.admit(locator, hints),
            ManagerCommand::Pause { locator } => self.pause(&locator),
            ManagerCommand::Resume { locator } => self.resume(&locator),
            ManagerCommand::PauseAll => {
                for record in self.records.values_mut() {
                    self.engine.pause(&record.locator);
                    record.update_state(TaskState::Paused);
                }
                self.emit(DownloadEvent::PausedAll);
            }
            ManagerCommand::ResumeAll => {
                for record in self.records.values_mut() {
                    self.engine.resume(&record.locator);
                    record.mark_resumed();
                }
                self.emit(DownloadEvent::ResumedAll);
            }
            ManagerCommand::Cancel { locator } => {
                self.cancel(&locator);
            }
            ManagerCommand::CancelAll => {
                for (locator, _) in self.records.drain() {
                    self.engine.cancel(&locator);
                }
                info!("all downloads cancelled");
                self.emit(DownloadEvent::CancelledAll);
            }
            ManagerCommand::CancelForDeletion { locators, reply } => {
                let staged: Vec<PathBuf> = locators
                    .iter()
                    .filter_map(|locator| self.cancel(locator))
                    .filter_map(|record| record.staging_path)
                    .collect();
                let _ = reply.send(staged);
            }
            ManagerCommand::Inspect { locator, reply } => {
                let _ = reply.send(self.records.get(&locator).cloned());
            }
            ManagerCommand::Snapshot { reply } => {
                let mut records: Vec<TaskRecord> = self.records.values().cloned().collect();
                records.sort_by_key(|r| r.transfer_id);
                let _ = reply.send(records);
            }
            ManagerCommand::Engine(event) => self.apply_engine_event(event),
            ManagerCommand::Shutdown => {
                for locator in self.records.keys() {
                    self.engine.pause(locator);
                }
                info!(tracked = self.records.len(), "task manager shutting down; transfers paused");
                return false;
            }
        }
        true
    }

    fn admit(&mut self, locator: String, hints: DownloadHints) {
        if self.records.contains_key(&locator) {
            warn!(locator = %locator, "duplicate download request ignored");
            return;
        }
        let Some(inbox) = self.inbox.upgrade() else {
            debug!(locator = %locator, "task manager closing; download not admitted");
            return;
        };

        self.next_transfer += 1;
        let id = TransferId(self.next_transfer);
        self.records
            .insert(locator.clone(), TaskRecord::new(&locator, id));
        debug!(locator = %locator, transfer = %id, "download admitted");

        let sink = EventSink::new(id, &locator, inbox);
        self.engine.start(TransferRequest { id, locator, hints }, sink);
    }

    fn pause(&mut self, locator: &str) {
        let Some(record) = self.records.get_mut(locator) else {
            return;
        };
        self.engine.pause(locator);
        record.update_state(TaskState::Paused);
        self.emit(DownloadEvent::Paused {
            locator: locator.to_string(),
        });
    }

    fn resume(&mut self, locator: &str) {
        let Some(record) = self.records.get_mut(locator) else {
            return;
        };
        self.engine.resume(locator);
        record.mark_resumed();
        self.emit(DownloadEvent::Resumed {
            locator: locator.to_string(),
        });
    }

    /// Remove and cancel one record. Absent locators are a silent no-op.
    fn cancel(&mut self, locator: &str) -> Option<TaskRecord> {
        let mut record = self.records.remove(locator)?;
        self.engine.cancel(locator);
        record.update_state(TaskState::Cancelled);
        debug!(locator = %locator, "download cancelled");
        self.emit(DownloadEvent::Cancelled {
            locator: locator.to_string(),
        });
        Some(record)
    }

    fn apply_engine_event(&mut self, event: EngineEvent) {
        let EngineEvent { id, locator, kind } = event;

        let current = self.records.get(&locator).map(|r| r.transfer_id);
        if current != Some(id) {
            debug!(locator = %locator, transfer = %id, "event from untracked transfer dropped");
            return;
        }

        match kind {
            EngineEventKind::SizeKnown {
                total_bytes,
                staging_path,
            } => {
                if let Some(record) = self.records.get_mut(&locator) {
                    record.mark_size_known(total_bytes, staging_path.clone());
                }
                self.emit(DownloadEvent::DidStart {
                    locator: locator.clone(),
                });
                self.emit(DownloadEvent::SizeKnown {
                    locator: locator.clone(),
                    total_bytes,
                });
                if let Some(path) = staging_path {
                    self.emit(DownloadEvent::StagingPathKnown { locator, path });
                }
            }
            EngineEventKind::Progress(fraction) => {
                let accepted = self
                    .records
                    .get_mut(&locator)
                    .and_then(|r| r.advance_progress(fraction));
                match accepted {
                    Some(fraction) => self.emit(DownloadEvent::Progress { locator, fraction }),
                    None => warn!(locator = %locator, fraction, "progress regression dropped"),
                }
            }
            EngineEventKind::Succeeded(path) => {
                if let Some(mut record) = self.records.remove(&locator) {
                    record.destination_path = Some(path.clone());
                    record.update_state(TaskState::Succeeded);
                }
                info!(locator = %locator, path = ?path, "download finished");
                self.emit(DownloadEvent::Finished { locator, path });
            }
            EngineEventKind::Failed(reason) => {
                if let Some(mut record) = self.records.remove(&locator) {
                    record.update_state(TaskState::Failed);
                }
                warn!(
                    locator = %locator,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "download failed"
                );
                self.emit(DownloadEvent::Cancelled { locator });
            }
        }
    }

    fn emit(&self, event: DownloadEvent) {
        self.observers.dispatch(event);
    }
}
