// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Weak observer registry with a single delivery thread.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  Delivery   ┌────────────────────┐
//! │ dispatch()   │────────────▶│ stagedl-delivery   │──▶ observer 1
//! │ (any thread) │   (mpsc)    │ thread (sequential)│──▶ observer 2
//! └──────────────┘             └────────────────────┘
//! ```
//!
//! The entry list is only touched through this type. The delivery thread
//! prunes dead entries and copies the live handles before invoking anyone,
//! so observers added while an event is being delivered only see later ones.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock, Weak};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use super::{deliver, DownloadObserver};
use crate::download::events::DownloadEvent;
use crate::download::types::fallback_file_name;
use crate::locks::{resilient_read, resilient_write};

type Entries = Arc<RwLock<Vec<ObserverEntry>>>;

/// Non-owning handle to one registered observer.
struct ObserverEntry {
    handle: Weak<dyn DownloadObserver>,
}

impl ObserverEntry {
    fn is_alive(&self) -> bool {
        self.handle.strong_count() > 0
    }

    /// Identity is the address of the observer, not its vtable.
    fn refers_to(&self, target: *const ()) -> bool {
        self.handle.as_ptr().cast::<()>() == target
    }
}

/// Work executed on the delivery thread, in submission order.
enum Delivery {
    Event(DownloadEvent),
    Callback(Box<dyn FnOnce() + Send>),
}

/// Deduplicated, weakly-referenced set of observers.
pub struct ObserverRegistry {
    entries: Entries,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
}

impl ObserverRegistry {
    /// Create an empty registry and start its delivery thread.
    ///
    /// The thread exits once the registry is dropped and every queued
    /// delivery has run.
    pub fn new() -> Self {
        let entries: Entries = Arc::new(RwLock::new(Vec::new()));
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        let worker_entries = Arc::clone(&entries);
        let spawned = thread::Builder::new()
            .name("stagedl-delivery".to_string())
            .spawn(move || Self::delivery_loop(worker_entries, delivery_rx));
        if let Err(e) = spawned {
            // The receiver was dropped with the closure, so dispatch turns
            // into a logged no-op instead of a panic.
            error!("Failed to start observer delivery thread: {}", e);
        }

        Self {
            entries,
            delivery_tx,
        }
    }

    /// Register an observer. Adding the same observer twice is a no-op.
    ///
    /// Returns true if the observer was newly added.
    pub fn add<O>(&self, observer: &Arc<O>) -> bool
    where
        O: DownloadObserver + 'static,
    {
        let target = Arc::as_ptr(observer).cast::<()>();
        let mut entries = resilient_write(&self.entries);

        // Prune first so a dead slot can never mask a live duplicate check.
        entries.retain(ObserverEntry::is_alive);
        if entries.iter().any(|e| e.refers_to(target)) {
            return false;
        }

        let weak: Weak<O> = Arc::downgrade(observer);
        let handle: Weak<dyn DownloadObserver> = weak;
        entries.push(ObserverEntry { handle });
        true
    }

    /// Unregister an observer. Returns true if it was registered.
    pub fn remove<O>(&self, observer: &Arc<O>) -> bool
    where
        O: DownloadObserver + ?Sized + 'static,
    {
        let target = Arc::as_ptr(observer).cast::<()>();
        let mut entries = resilient_write(&self.entries);
        entries.retain(ObserverEntry::is_alive);

        match entries.iter().position(|e| e.refers_to(target)) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of live observers. Prunes dead entries.
    pub fn len(&self) -> usize {
        let mut entries = resilient_write(&self.entries);
        entries.retain(ObserverEntry::is_alive);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue an event for every live observer. Never blocks.
    pub fn dispatch(&self, event: DownloadEvent) {
        self.submit(Delivery::Event(event));
    }

    /// Run `callback` on the delivery thread after everything queued so far.
    pub fn run_on_delivery(&self, callback: impl FnOnce() + Send + 'static) {
        self.submit(Delivery::Callback(Box::new(callback)));
    }

    /// Wait until every delivery queued before this call has run.
    pub async fn settle(&self) {
        let (tx, rx) = oneshot::channel();
        self.run_on_delivery(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    /// Ask observers, in registration order, to name the file for `locator`.
    ///
    /// Falls back to a generated `<id>_unnamed_file` name when nobody answers
    /// with a non-empty name. Runs on the caller's thread.
    pub fn resolve_file_name(&self, locator: &str) -> String {
        let handles: Vec<Weak<dyn DownloadObserver>> = resilient_read(&self.entries)
            .iter()
            .map(|e| e.handle.clone())
            .collect();

        handles
            .iter()
            .filter_map(Weak::upgrade)
            .find_map(|observer| {
                observer
                    .resolve_file_name(locator)
                    .filter(|name| !name.trim().is_empty())
            })
            .unwrap_or_else(fallback_file_name)
    }

    fn submit(&self, delivery: Delivery) {
        if self.delivery_tx.send(delivery).is_err() {
            debug!("observer delivery thread is gone; dropping delivery");
        }
    }

    fn delivery_loop(entries: Entries, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = deliveries.blocking_recv() {
            match delivery {
                Delivery::Event(event) => Self::fan_out(&entries, &event),
                Delivery::Callback(callback) => {
                    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                        error!("delivery callback panicked");
                    }
                }
            }
        }
        debug!("observer delivery thread stopped");
    }

    fn fan_out(entries: &Entries, event: &DownloadEvent) {
        let snapshot: Vec<Weak<dyn DownloadObserver>> = {
            let mut entries = resilient_write(entries);
            entries.retain(ObserverEntry::is_alive);
            entries.iter().map(|e| e.handle.clone()).collect()
        };

        for handle in snapshot {
            // Died since the snapshot: skip silently.
            let Some(observer) = handle.upgrade() else {
                continue;
            };
            let delivered = catch_unwind(AssertUnwindSafe(|| deliver(event, observer.as_ref())));
            if delivered.is_err() {
                error!(
                    locator = event.locator().unwrap_or("*"),
                    event = ?event,
                    "observer panicked while handling event"
                );
            }
        }
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
