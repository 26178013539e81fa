// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resizable slot pool enforcing the concurrency cap.
//!
//! A semaphore cannot shrink while permits are out, and the cap is settable
//! at run time, so the pool tracks `active` against `capacity` itself. A
//! shrink takes effect as running transfers give their slots back.
//!
//! Waiters are admitted strictly in arrival order: a freed slot is handed to
//! the oldest waiter rather than raced for.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::locks::resilient_lock;

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Debug)]
struct PoolState {
    capacity: usize,
    active: usize,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
}

impl PoolState {
    /// Hand free slots to queued waiters, oldest first.
    fn admit_waiters(&mut self) {
        while self.active < self.capacity {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            // A waiter whose receiver is gone gave up; skip it.
            if waiter.grant.send(()).is_ok() {
                self.active += 1;
            }
        }
    }
}

/// Admits at most `capacity` holders at once.
#[derive(Debug)]
pub struct SlotPool {
    state: Mutex<PoolState>,
}

/// A held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct SlotGuard {
    pool: Arc<SlotPool>,
}

/// A queued `acquire`. Dropping it before the grant is observed either
/// leaves the queue or returns the slot that was already handed over.
struct Pending {
    pool: Arc<SlotPool>,
    ticket: u64,
    grant: oneshot::Receiver<()>,
    granted: bool,
}

impl SlotPool {
    /// Create a pool; a capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                capacity: capacity.max(1),
                active: 0,
                waiters: VecDeque::new(),
                next_ticket: 0,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        resilient_lock(&self.state).capacity
    }

    /// Number of slots currently held.
    pub fn active(&self) -> usize {
        resilient_lock(&self.state).active
    }

    /// Number of callers waiting in `acquire`.
    pub fn queued(&self) -> usize {
        resilient_lock(&self.state).waiters.len()
    }

    /// Change the cap; a capacity of zero is raised to one.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = resilient_lock(&self.state);
        state.capacity = capacity.max(1);
        state.admit_waiters();
    }

    /// Wait for a free slot. Callers are served in the order they arrive.
    pub async fn acquire(self: &Arc<Self>) -> SlotGuard {
        loop {
            let mut pending = {
                let mut state = resilient_lock(&self.state);
                if state.active < state.capacity && state.waiters.is_empty() {
                    state.active += 1;
                    return SlotGuard {
                        pool: Arc::clone(self),
                    };
                }
                let (grant, receiver) = oneshot::channel();
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                state.waiters.push_back(Waiter { ticket, grant });
                Pending {
                    pool: Arc::clone(self),
                    ticket,
                    grant: receiver,
                    granted: false,
                }
            };

            if (&mut pending.grant).await.is_ok() {
                pending.granted = true;
                return SlotGuard {
                    pool: Arc::clone(self),
                };
            }
        }
    }

    /// Take a slot if one is free right now and nobody is queued ahead.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        let mut state = resilient_lock(&self.state);
        if state.active < state.capacity && state.waiters.is_empty() {
            state.active += 1;
            Some(SlotGuard {
                pool: Arc::clone(self),
            })
        } else {
            None
        }
    }

    fn release(&self) {
        let mut state = resilient_lock(&self.state);
        state.active = state.active.saturating_sub(1);
        state.admit_waiters();
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release();
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        let mut state = resilient_lock(&self.pool.state);
        if let Some(pos) = state.waiters.iter().position(|w| w.ticket == self.ticket) {
            state.waiters.remove(pos);
            return;
        }
        drop(state);
        // Dequeued, so the grant was sent under the lock before we gave up.
        if self.grant.try_recv().is_ok() {
            self.pool.release();
        }
    }
}
