//! Routing of queued events to registered handlers.
//!
//! The registry maps watches to their handlers behind a single mutex that is
//! held only across table mutation, never across a handler invocation or
//! kernel I/O. The dispatcher thread pops the event queue and, for every
//! (watch, handler) pair whose scope contains the event, runs the handler's
//! filter predicate and callback synchronously. A handler that panics is
//! logged and does not disturb the observer or its peers.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::observer::{ObservedWatch, Shared, WatchId};
use crate::queue::{EventQueue, Pop, Slot};
use crate::{Error, Event, EventHandler, Result};

/// Handle identifying one handler attachment within an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

type HandlerCell = Arc<Mutex<Box<dyn EventHandler>>>;

struct HandlerEntry {
    id: HandlerId,
    handler: HandlerCell,
}

struct WatchEntry {
    watch: ObservedWatch,
    handlers: Vec<HandlerEntry>,
}

#[derive(Default)]
struct RegistryInner {
    /// Keyed by watch id; ids are allocated monotonically, so iteration
    /// yields watches in registration order.
    watches: BTreeMap<WatchId, WatchEntry>,
    next_handler: usize,
}

/// The watch and handler table shared by the facade and the dispatcher.
#[derive(Default)]
pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry::default()
    }

    /// Finds an existing watch equivalent to (path, recursive).
    pub(crate) fn find_equivalent(&self, path: &Path, recursive: bool) -> Option<ObservedWatch> {
        let inner = self.lock();
        inner
            .watches
            .values()
            .find(|entry| entry.watch.path() == path && entry.watch.recursive() == recursive)
            .map(|entry| entry.watch.clone())
    }

    /// Registers a new watch with no handlers yet.
    pub(crate) fn add_watch(&self, watch: ObservedWatch) {
        let mut inner = self.lock();
        inner.watches.insert(
            watch.id(),
            WatchEntry {
                watch,
                handlers: Vec::new(),
            },
        );
    }

    /// Attaches a handler to a registered watch.
    pub(crate) fn attach(
        &self,
        watch_id: WatchId,
        handler: Box<dyn EventHandler>,
    ) -> Result<HandlerId> {
        let mut inner = self.lock();
        let id = HandlerId(inner.next_handler);
        inner.next_handler += 1;
        let entry = inner
            .watches
            .get_mut(&watch_id)
            .ok_or_else(Error::watch_not_found)?;
        entry.handlers.push(HandlerEntry {
            id,
            handler: Arc::new(Mutex::new(handler)),
        });
        Ok(id)
    }

    /// Detaches a handler. Returns `true` when the watch has no handlers
    /// left and should be unregistered from the backend.
    pub(crate) fn detach(&self, watch_id: WatchId, handler_id: HandlerId) -> Result<bool> {
        let mut inner = self.lock();
        let entry = inner
            .watches
            .get_mut(&watch_id)
            .ok_or_else(Error::watch_not_found)?;
        let before = entry.handlers.len();
        entry.handlers.retain(|h| h.id != handler_id);
        if entry.handlers.len() == before {
            return Err(Error::watch_not_found());
        }
        Ok(entry.handlers.is_empty())
    }

    /// Removes a watch and all its handlers.
    pub(crate) fn remove_watch(&self, watch_id: WatchId) -> Option<ObservedWatch> {
        let mut inner = self.lock();
        inner.watches.remove(&watch_id).map(|entry| entry.watch)
    }

    /// Removes every watch, returning them in registration order.
    pub(crate) fn drain(&self) -> Vec<ObservedWatch> {
        let mut inner = self.lock();
        let watches = std::mem::take(&mut inner.watches);
        watches.into_values().map(|entry| entry.watch).collect()
    }

    /// Active watches in registration order.
    pub(crate) fn watches(&self) -> Vec<ObservedWatch> {
        let inner = self.lock();
        inner
            .watches
            .values()
            .map(|entry| entry.watch.clone())
            .collect()
    }

    /// Clones the routing table so handlers can be invoked without holding
    /// the registry lock.
    fn routes(&self) -> Vec<(ObservedWatch, Vec<HandlerCell>)> {
        let inner = self.lock();
        inner
            .watches
            .values()
            .map(|entry| {
                (
                    entry.watch.clone(),
                    entry.handlers.iter().map(|h| Arc::clone(&h.handler)).collect(),
                )
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Whether `path` falls inside the scope of `watch`.
fn scope_contains(watch: &ObservedWatch, path: &Path) -> bool {
    if path == watch.path() {
        return true;
    }
    if watch.recursive() {
        path.starts_with(watch.path())
    } else {
        path.parent() == Some(watch.path())
    }
}

fn event_in_scope(watch: &ObservedWatch, event: &Event) -> bool {
    scope_contains(watch, event.path())
        || event.dest().is_some_and(|dest| scope_contains(watch, dest))
}

fn with_handler(cell: &HandlerCell, f: impl FnOnce(&mut dyn EventHandler)) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut guard = cell
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(guard.as_mut());
    }));
    if result.is_err() {
        log::warn!("event handler panicked; continuing to dispatch");
    }
}

/// The dispatcher thread body: pops the queue until it closes or a terminal
/// fault arrives, routing each slot to the handlers in scope.
pub(crate) fn run(
    queue: Arc<EventQueue>,
    registry: Arc<Registry>,
    shared: Arc<Shared>,
    timeout: std::time::Duration,
) {
    loop {
        match queue.pop(timeout) {
            Pop::Slot(Slot::Event { event, .. }) => {
                for (watch, handlers) in registry.routes() {
                    if !event_in_scope(&watch, &event) {
                        continue;
                    }
                    for cell in &handlers {
                        with_handler(cell, |handler| {
                            if handler.accepts(&event) {
                                handler.on_event(&event);
                            }
                        });
                    }
                }
            }
            Pop::Slot(Slot::Overflow) => {
                log::debug!("delivering queue overflow signal to all handlers");
                for (_, handlers) in registry.routes() {
                    for cell in &handlers {
                        with_handler(cell, |handler| handler.on_queue_overflow());
                    }
                }
            }
            Pop::Slot(Slot::Fault(error)) => {
                log::error!("terminal backend fault, stopping observer: {error}");
                shared.record_fault(error);
                queue.close();
                return;
            }
            Pop::TimedOut => {
                if shared.is_stopping() {
                    return;
                }
            }
            Pop::Closed => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn watch(id: usize, path: &str, recursive: bool) -> ObservedWatch {
        ObservedWatch::test(WatchId::test(id), PathBuf::from(path), recursive)
    }

    #[test]
    fn scope_contains_respects_recursion() {
        let recursive = watch(1, "/w", true);
        assert!(scope_contains(&recursive, Path::new("/w")));
        assert!(scope_contains(&recursive, Path::new("/w/a")));
        assert!(scope_contains(&recursive, Path::new("/w/a/b/c")));
        assert!(!scope_contains(&recursive, Path::new("/x/a")));

        let flat = watch(2, "/w", false);
        assert!(scope_contains(&flat, Path::new("/w")));
        assert!(scope_contains(&flat, Path::new("/w/a")));
        assert!(!scope_contains(&flat, Path::new("/w/a/b")));
    }

    #[test]
    fn sibling_prefix_paths_are_not_in_scope() {
        // "/w-other" shares a string prefix with "/w" but is not inside it.
        let recursive = watch(1, "/w", true);
        assert!(!scope_contains(&recursive, Path::new("/w-other/file")));
    }

    #[test]
    fn moves_match_on_either_end() {
        let w = watch(1, "/w", true);
        let inbound = Event::moved("/elsewhere/a", "/w/a");
        let outbound = Event::moved("/w/a", "/elsewhere/a");
        assert!(event_in_scope(&w, &inbound));
        assert!(event_in_scope(&w, &outbound));
        assert!(!event_in_scope(&w, &Event::moved("/x/a", "/y/b")));
    }

    fn run_dispatcher(
        queue: Arc<EventQueue>,
        registry: Arc<Registry>,
        shared: Arc<Shared>,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || run(queue, registry, shared, Duration::from_millis(20)))
    }

    #[test]
    fn handlers_run_in_registration_order_with_the_same_event() {
        let queue = Arc::new(EventQueue::new(None));
        let registry = Arc::new(Registry::new());
        let shared = Arc::new(Shared::new());

        let w = watch(1, "/w", true);
        registry.add_watch(w.clone());
        let (tx, rx) = mpsc::channel::<(u8, Event)>();
        let tx1 = tx.clone();
        registry
            .attach(w.id(), Box::new(move |event: &Event| {
                tx1.send((1, event.clone())).unwrap();
            }))
            .unwrap();
        registry
            .attach(w.id(), Box::new(move |event: &Event| {
                tx.send((2, event.clone())).unwrap();
            }))
            .unwrap();

        queue.put(Event::new(EventKind::Created, "/w/x"), w.id());
        let thread = run_dispatcher(Arc::clone(&queue), registry, shared);

        let (first_tag, first_event) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let (second_tag, second_event) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!((first_tag, second_tag), (1, 2));
        assert_eq!(first_event, second_event);

        queue.close();
        thread.join().unwrap();
    }

    #[test]
    fn out_of_scope_events_are_not_delivered() {
        let queue = Arc::new(EventQueue::new(None));
        let registry = Arc::new(Registry::new());
        let shared = Arc::new(Shared::new());

        let w = watch(1, "/w/sub", false);
        registry.add_watch(w.clone());
        let (tx, rx) = mpsc::channel::<Event>();
        registry
            .attach(w.id(), Box::new(move |event: &Event| {
                tx.send(event.clone()).unwrap();
            }))
            .unwrap();

        queue.put(Event::new(EventKind::Created, "/w/sub/a/b"), w.id());
        queue.put(Event::new(EventKind::Created, "/w/sub/direct"), w.id());
        let thread = run_dispatcher(Arc::clone(&queue), registry, shared);

        let delivered = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(delivered.path(), Path::new("/w/sub/direct"));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        queue.close();
        thread.join().unwrap();
    }

    #[test]
    fn filter_predicate_gates_delivery() {
        struct OnlyDirs(mpsc::Sender<Event>);
        impl EventHandler for OnlyDirs {
            fn on_event(&mut self, event: &Event) {
                self.0.send(event.clone()).unwrap();
            }
            fn accepts(&self, event: &Event) -> bool {
                event.is_directory
            }
        }

        let queue = Arc::new(EventQueue::new(None));
        let registry = Arc::new(Registry::new());
        let shared = Arc::new(Shared::new());

        let w = watch(1, "/w", true);
        registry.add_watch(w.clone());
        let (tx, rx) = mpsc::channel();
        registry.attach(w.id(), Box::new(OnlyDirs(tx))).unwrap();

        queue.put(Event::new(EventKind::Created, "/w/file"), w.id());
        queue.put(
            Event::new(EventKind::Created, "/w/dir").into_directory(),
            w.id(),
        );
        let thread = run_dispatcher(Arc::clone(&queue), registry, shared);

        let delivered = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(delivered.path(), Path::new("/w/dir"));

        queue.close();
        thread.join().unwrap();
    }

    #[test]
    fn a_panicking_handler_does_not_stop_dispatch() {
        let queue = Arc::new(EventQueue::new(None));
        let registry = Arc::new(Registry::new());
        let shared = Arc::new(Shared::new());

        let w = watch(1, "/w", true);
        registry.add_watch(w.clone());
        let panics = Arc::new(AtomicUsize::new(0));
        let panics_seen = Arc::clone(&panics);
        registry
            .attach(w.id(), Box::new(move |_: &Event| {
                panics_seen.fetch_add(1, Ordering::SeqCst);
                panic!("handler bug");
            }))
            .unwrap();
        let (tx, rx) = mpsc::channel::<Event>();
        registry
            .attach(w.id(), Box::new(move |event: &Event| {
                tx.send(event.clone()).unwrap();
            }))
            .unwrap();

        queue.put(Event::new(EventKind::Created, "/w/a"), w.id());
        queue.put(Event::new(EventKind::Created, "/w/b"), w.id());
        let thread = run_dispatcher(Arc::clone(&queue), registry, shared);

        // The survivor sees both events, the panicker was invoked twice.
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap().path(),
            Path::new("/w/a")
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap().path(),
            Path::new("/w/b")
        );
        assert_eq!(panics.load(Ordering::SeqCst), 2);

        queue.close();
        thread.join().unwrap();
    }

    #[test]
    fn overflow_is_broadcast_to_every_handler() {
        struct CountOverflow(Arc<AtomicUsize>);
        impl EventHandler for CountOverflow {
            fn on_event(&mut self, _event: &Event) {}
            fn on_queue_overflow(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let queue = Arc::new(EventQueue::new(None));
        let registry = Arc::new(Registry::new());
        let shared = Arc::new(Shared::new());

        let w1 = watch(1, "/w", true);
        let w2 = watch(2, "/v", true);
        registry.add_watch(w1.clone());
        registry.add_watch(w2.clone());
        let overflows = Arc::new(AtomicUsize::new(0));
        registry
            .attach(w1.id(), Box::new(CountOverflow(Arc::clone(&overflows))))
            .unwrap();
        registry
            .attach(w2.id(), Box::new(CountOverflow(Arc::clone(&overflows))))
            .unwrap();

        queue.mark_overflow();
        let thread = run_dispatcher(Arc::clone(&queue), registry, shared);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while overflows.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(overflows.load(Ordering::SeqCst), 2);

        queue.close();
        thread.join().unwrap();
    }

    #[test]
    fn a_fault_records_the_terminal_error_and_stops() {
        let queue = Arc::new(EventQueue::new(None));
        let registry = Arc::new(Registry::new());
        let shared = Arc::new(Shared::new());

        queue.fault(Error::generic("kernel went away"));
        let thread = run_dispatcher(Arc::clone(&queue), Arc::clone(&registry), Arc::clone(&shared));
        thread.join().unwrap();

        assert!(shared.is_stopping());
        let error = shared.take_terminal_error().expect("terminal error");
        assert!(error.to_string().contains("kernel went away"));
    }

    #[test]
    fn detach_reports_when_the_watch_is_unreferenced() {
        let registry = Registry::new();
        let w = watch(1, "/w", true);
        registry.add_watch(w.clone());
        let first = registry.attach(w.id(), Box::new(|_: &Event| {})).unwrap();
        let second = registry.attach(w.id(), Box::new(|_: &Event| {})).unwrap();

        assert!(!registry.detach(w.id(), first).unwrap());
        assert!(registry.detach(w.id(), second).unwrap());
        assert!(registry.detach(w.id(), second).is_err());
    }
}
