//! In-memory holding area for events awaiting a flush.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::event::Event;

/// Unbounded, append-only event buffer shared by the server and the flush
/// coordinator.
///
/// Pushes never touch storage and never fail. [`IngestBuffer::take_all`]
/// swaps the whole contents out under the lock, so an event pushed during a
/// drain lands in exactly one drain: the current one or the next.
#[derive(Debug, Default)]
pub struct IngestBuffer {
    events: Mutex<Vec<Event>>,
}

impl IngestBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the Vec half-written, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an event and returns the buffer length after the push.
    pub fn push(&self, event: Event) -> usize {
        let mut events = self.lock();
        events.push(event);
        events.len()
    }

    /// Removes and returns everything buffered so far.
    pub fn take_all(&self) -> Vec<Event> {
        std::mem::take(&mut *self.lock())
    }

    /// Puts events back in front of anything pushed since they were taken.
    pub fn requeue(&self, mut events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut current = self.lock();
        events.append(&mut current);
        *current = events;
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
