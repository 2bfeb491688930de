//! Joins the two halves of a kernel rename into a single `Moved` event.
//!
//! inotify reports a rename as a `move-from` in the old directory and a
//! `move-to` in the new one, correlated by a cookie. The two halves arrive
//! separately; when the destination is outside every watched tree the
//! second half never arrives at all. This state machine holds unmatched
//! `move-from` halves for a bounded window and resolves them:
//!
//! * a matching `move-to` within the window yields one `Moved` event,
//! * window expiry yields a `Deleted` event for the vanished source,
//! * a `move-to` with an unknown cookie yields a `Created` event.
//!
//! The pending table is bounded; at capacity the oldest entry is resolved
//! early as `Deleted`. The grouper runs on the backend's pump thread and
//! takes explicit timestamps, which also keeps it deterministic under test.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::{Event, EventKind};

#[derive(Debug)]
struct PendingMove {
    path: PathBuf,
    is_directory: bool,
    /// Watched sub-directories that vanish with the source if the move
    /// turns out to leave the observed scope.
    descendants: Vec<PathBuf>,
    deadline: Instant,
}

#[derive(Debug)]
pub(crate) struct MoveGrouper {
    window: Duration,
    capacity: usize,
    pending: HashMap<u32, PendingMove>,
    /// Cookies in arrival order; may contain cookies already resolved.
    arrivals: VecDeque<u32>,
}

impl MoveGrouper {
    pub(crate) fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            pending: HashMap::new(),
            arrivals: VecDeque::new(),
        }
    }

    /// Registers the `move-from` half of a rename.
    ///
    /// Returns the events produced by evicting older entries when the
    /// pending table is at capacity.
    pub(crate) fn moved_from(
        &mut self,
        cookie: u32,
        path: PathBuf,
        is_directory: bool,
        descendants: Vec<PathBuf>,
        now: Instant,
    ) -> Vec<Event> {
        let mut evicted = Vec::new();
        while self.pending.len() >= self.capacity {
            match self.pop_oldest() {
                Some(entry) => evicted.extend(resolve_as_deleted(entry)),
                None => break,
            }
        }

        self.arrivals.push_back(cookie);
        let replaced = self.pending.insert(
            cookie,
            PendingMove {
                path,
                is_directory,
                descendants,
                deadline: now + self.window,
            },
        );
        if let Some(stale) = replaced {
            // Cookie re-use before the old entry resolved; the old source
            // is gone for good.
            evicted.extend(resolve_as_deleted(stale));
        }
        evicted
    }

    /// Resolves the `move-to` half of a rename into a single event.
    pub(crate) fn moved_to(&mut self, cookie: u32, path: PathBuf, is_directory: bool) -> Event {
        match self.pending.remove(&cookie) {
            Some(pending) if pending.path != path => {
                Event::moved(pending.path, path).set_directory(is_directory)
            }
            Some(_) => {
                // The kernel reported a rename that did not change the path;
                // surface it as a modification rather than a degenerate move.
                Event::new(EventKind::Modified, path).set_directory(is_directory)
            }
            None => Event::new(EventKind::Created, path).set_directory(is_directory),
        }
    }

    /// Resolves every pending entry whose window has lapsed.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<Event> {
        let mut resolved = Vec::new();
        while let Some(&cookie) = self.arrivals.front() {
            match self.pending.get(&cookie) {
                None => {
                    self.arrivals.pop_front();
                }
                Some(pending) if pending.deadline <= now => {
                    self.arrivals.pop_front();
                    if let Some(entry) = self.pending.remove(&cookie) {
                        resolved.extend(resolve_as_deleted(entry));
                    }
                }
                // Arrival order implies deadline order.
                Some(_) => break,
            }
        }
        resolved
    }

    /// The instant the next pending entry lapses, if any.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&cookie) = self.arrivals.front() {
            match self.pending.get(&cookie) {
                Some(pending) => return Some(pending.deadline),
                None => {
                    self.arrivals.pop_front();
                }
            }
        }
        None
    }

    /// Resolves every pending entry immediately; called on backend stop.
    pub(crate) fn flush(&mut self) -> Vec<Event> {
        let mut resolved = Vec::new();
        while let Some(entry) = self.pop_oldest() {
            resolved.extend(resolve_as_deleted(entry));
        }
        resolved
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn pop_oldest(&mut self) -> Option<PendingMove> {
        while let Some(cookie) = self.arrivals.pop_front() {
            if let Some(entry) = self.pending.remove(&cookie) {
                return Some(entry);
            }
        }
        None
    }
}

/// A `move-from` that never met its `move-to`: the source left the observed
/// scope. Watched descendants go with it.
fn resolve_as_deleted(entry: PendingMove) -> Vec<Event> {
    let mut events = Vec::with_capacity(1 + entry.descendants.len());
    for descendant in entry.descendants {
        events.push(
            Event::new(EventKind::Deleted, descendant)
                .into_directory()
                .into_synthetic(),
        );
    }
    events.push(Event::new(EventKind::Deleted, entry.path).set_directory(entry.is_directory));
    events
}
