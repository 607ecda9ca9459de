//! One-shot timers owned by the reactor

use std::collections::BTreeMap;
use std::fmt;
use tokio::time::Instant;

/// Handle to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

#[derive(Debug)]
struct Entry<T> {
    deadline: Instant,
    tag: T,
}

/// Timer registry keyed by id
#[derive(Debug)]
pub(crate) struct Timers<T> {
    entries: BTreeMap<TimerId, Entry<T>>,
    next_id: u64,
}

impl<T> Timers<T> {
    pub(crate) fn new() -> Self {
        Timers {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn add(&mut self, deadline: Instant, tag: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, Entry { deadline, tag });
        id
    }

    pub(crate) fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.entries.remove(&id).map(|entry| entry.tag)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }

    /// Remove and return the earliest timer whose deadline is not after `now`.
    /// Ties go to the older timer.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, T)> {
        let id = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .min_by_key(|(id, entry)| (entry.deadline, **id))
            .map(|(id, _)| *id)?;
        self.entries.remove(&id).map(|entry| (id, entry.tag))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
