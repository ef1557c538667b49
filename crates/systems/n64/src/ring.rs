//! Bounded slot ring shared by the workload and present queues
//!
//! The ring has three cursors:
//!
//! - `write`: the slot the producer is filling
//! - `thread`: the next slot the consumer will claim
//! - `barrier`: the oldest slot the consumer has not released yet
//!
//! The producer publishes its slot by moving `write` forward, but never onto
//! `barrier`. The consumer claims slots strictly behind `write`, so it never
//! reads the slot being written, and releases them once the GPU no longer
//! needs their contents.

use crate::{lock, HleError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursors {
    write: usize,
    thread: usize,
    barrier: usize,
    producer_blocked: bool,
}

pub struct SlotRing<T> {
    slots: Vec<Mutex<T>>,
    cursors: Mutex<Cursors>,
    changed: Condvar,
    running: AtomicBool,
}

impl<T: Default> SlotRing<T> {
    pub fn new(size: usize) -> Self {
        let size = size.max(2);
        Self {
            slots: (0..size).map(|_| Mutex::new(T::default())).collect(),
            cursors: Mutex::new(Cursors {
                write: 0,
                thread: 0,
                barrier: 0,
                producer_blocked: false,
            }),
            changed: Condvar::new(),
            running: AtomicBool::new(true),
        }
    }
}

impl<T> SlotRing<T> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Index of the slot the producer is filling.
    pub fn write_index(&self) -> usize {
        lock(&self.cursors).write
    }

    /// Lock the producer's current slot.
    pub fn current(&self) -> MutexGuard<'_, T> {
        let index = self.write_index();
        lock(&self.slots[index])
    }

    /// Lock slot `index`. Consumers only lock indices returned by [`claim`].
    ///
    /// [`claim`]: SlotRing::claim
    pub fn slot(&self, index: usize) -> MutexGuard<'_, T> {
        lock(&self.slots[index % self.slots.len()])
    }

    /// Publish the current slot and move to the next one, blocking while the
    /// next slot has not been released by the consumer.
    pub fn advance(&self) -> Result<usize, HleError> {
        let mut cursors = lock(&self.cursors);
        let next = (cursors.write + 1) % self.slots.len();
        while next == cursors.barrier && self.is_running() {
            cursors.producer_blocked = true;
            cursors = self
                .changed
                .wait(cursors)
                .unwrap_or_else(|e| e.into_inner());
        }
        cursors.producer_blocked = false;
        if !self.is_running() {
            return Err(HleError::QueueStopped);
        }
        let published = cursors.write;
        cursors.write = next;
        self.changed.notify_all();
        Ok(published)
    }

    /// Wait for a published slot and return its index, or `None` once the
    /// ring is stopped.
    pub fn claim(&self) -> Option<usize> {
        let mut cursors = lock(&self.cursors);
        while cursors.thread == cursors.write && self.is_running() {
            cursors = self
                .changed
                .wait(cursors)
                .unwrap_or_else(|e| e.into_inner());
        }
        if !self.is_running() {
            return None;
        }
        Some(cursors.thread)
    }

    /// Mark the claimed slot `index` as consumed.
    pub fn finish(&self, index: usize) {
        let mut cursors = lock(&self.cursors);
        debug_assert_eq!(cursors.thread, index);
        cursors.thread = (index + 1) % self.slots.len();
        self.changed.notify_all();
    }

    /// Allow the producer to reuse every slot up to and including `index`.
    pub fn release_through(&self, index: usize) {
        let mut cursors = lock(&self.cursors);
        cursors.barrier = (index + 1) % self.slots.len();
        self.changed.notify_all();
    }

    /// Published slots not yet claimed, including one being processed.
    pub fn backlog(&self) -> usize {
        let cursors = lock(&self.cursors);
        (cursors.write + self.slots.len() - cursors.thread) % self.slots.len()
    }

    /// True while the producer waits for the consumer to release a slot.
    pub fn producer_blocked(&self) -> bool {
        lock(&self.cursors).producer_blocked
    }

    pub fn stop(&self) {
        // Take the lock so a waiter cannot miss the wakeup between its check
        // and its wait.
        let _cursors = lock(&self.cursors);
        self.running.store(false, Ordering::SeqCst);
        self.changed.notify_all();
    }
}
