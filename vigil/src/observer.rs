//! The observer facade: watch lifecycle, thread lifecycle, backend glue.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::dispatch::{self, HandlerId, Registry};
use crate::queue::EventQueue;
use crate::{Config, Error, Event, EventHandler, RecursiveMode, Result};

/// Handle uniquely identifying a watch within one observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId(usize);

impl WatchId {
    /// Attribution placeholder for events whose producing watch is no
    /// longer known (for example a rename half resolved after its watch
    /// was removed). Routing is by scope, so this is informational only.
    pub(crate) const UNATTRIBUTED: WatchId = WatchId(0);

    #[cfg(test)]
    pub(crate) fn test(raw: usize) -> Self {
        WatchId(raw)
    }
}

/// A registered request to observe a path.
///
/// Cheap to clone; equality is by [`WatchId`].
#[derive(Debug, Clone)]
pub struct ObservedWatch {
    id: WatchId,
    path: Arc<PathBuf>,
    recursive: bool,
}

impl ObservedWatch {
    fn new(id: WatchId, path: PathBuf, recursive: bool) -> Self {
        Self {
            id,
            path: Arc::new(path),
            recursive,
        }
    }

    #[cfg(test)]
    pub(crate) fn test(id: WatchId, path: PathBuf, recursive: bool) -> Self {
        Self::new(id, path, recursive)
    }

    /// The identifier of this watch.
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// The absolute path the watch was registered for.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether descendants of the path are observed.
    pub fn recursive(&self) -> bool {
        self.recursive
    }
}

impl PartialEq for ObservedWatch {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for ObservedWatch {}

const STATE_CREATED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// State shared between the facade, the dispatcher and the backends.
pub(crate) struct Shared {
    state: AtomicU8,
    terminal_error: Mutex<Option<Error>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CREATED),
            terminal_error: Mutex::new(None),
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_STOPPED
    }

    /// Records a terminal backend fault and moves the observer to stopped.
    pub(crate) fn record_fault(&self, error: Error) {
        let mut slot = self
            .terminal_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the first fault is terminal; later ones are echoes of the
        // same pump teardown.
        if slot.is_none() {
            *slot = Some(error);
        }
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
    }

    pub(crate) fn take_terminal_error(&self) -> Option<Error> {
        self.terminal_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// The capability set every platform backend provides.
///
/// A backend owns its kernel resources and its pump thread; the observer
/// holds it polymorphically and never sees platform types.
pub(crate) trait Backend: Send {
    /// Registers a watch with the kernel. The path exists at call time.
    fn add_watch(&mut self, watch: &ObservedWatch) -> Result<()>;

    /// Deregisters a watch and every kernel resource derived from it.
    fn remove_watch(&mut self, watch: &ObservedWatch) -> Result<()>;

    /// Asks the pump to exit. Must not block; idempotent.
    fn shutdown(&mut self);
}

/// Where backends deliver their normalized output.
#[derive(Clone)]
pub(crate) struct EventSink {
    queue: Arc<EventQueue>,
}

impl EventSink {
    pub(crate) fn new(queue: Arc<EventQueue>) -> Self {
        Self { queue }
    }

    pub(crate) fn send(&self, watch_id: WatchId, event: Event) {
        log::trace!("event: {event}");
        self.queue.put(event, watch_id);
    }

    pub(crate) fn send_all(&self, watch_id: WatchId, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.send(watch_id, event);
        }
    }

    /// Signals that the kernel dropped events.
    pub(crate) fn overflow(&self) {
        log::debug!("kernel reported event overflow");
        self.queue.mark_overflow();
    }

    /// Reports a terminal pump failure.
    pub(crate) fn fault(&self, error: Error) {
        self.queue.fault(error);
    }
}

/// Acknowledges pump-thread exit when dropped, so the observer can bound
/// how long `stop` waits even if the pump panics.
pub(crate) struct PumpGuard(Option<crossbeam_channel::Sender<()>>);

impl PumpGuard {
    pub(crate) fn pair() -> (Self, crossbeam_channel::Receiver<()>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (PumpGuard(Some(tx)), rx)
    }
}

impl Drop for PumpGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// The backend implementations an observer can be built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ObserverKind {
    /// inotify backend (Linux).
    Inotify,
    /// FSEvents backend (macOS).
    FsEvent,
    /// kqueue backend (BSD, optionally macOS).
    Kqueue,
    /// ReadDirectoryChangesW backend (Windows).
    ReadDirectoryChanges,
    /// Snapshot-polling backend (any platform).
    Poll,
    /// Inert backend for testing the facade machinery.
    Null,
}

struct DispatcherHandle {
    thread: Option<thread::JoinHandle<()>>,
    done: Option<crossbeam_channel::Receiver<()>>,
}

/// Observes filesystem changes and dispatches them to handlers.
///
/// An observer binds one platform backend to one dispatcher. Its lifecycle
/// is *created → started → stopped*: watches may be scheduled at any point,
/// but handlers only run between [`start`](Observer::start) and
/// [`stop`](Observer::stop). All methods take `&self` and are safe to call
/// from any thread.
pub struct Observer {
    kind: ObserverKind,
    config: Config,
    shared: Arc<Shared>,
    queue: Arc<EventQueue>,
    registry: Arc<Registry>,
    backend: Mutex<Box<dyn Backend>>,
    pump_done: crossbeam_channel::Receiver<()>,
    dispatcher: Mutex<DispatcherHandle>,
    next_watch_id: AtomicUsize,
    teardown: std::sync::Once,
}

impl Observer {
    /// Creates an observer on the best backend for the current platform.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_kind(default_kind(), config)
    }

    /// Creates an observer on an explicitly chosen backend.
    ///
    /// Fails when the backend is not available on the current platform.
    pub fn with_kind(kind: ObserverKind, config: Config) -> Result<Self> {
        let queue = Arc::new(EventQueue::new(config.queue_capacity()));
        let sink = EventSink::new(Arc::clone(&queue));
        let (guard, pump_done) = PumpGuard::pair();
        let backend = make_backend(kind, sink, guard, &config)?;
        Ok(Self {
            kind,
            config,
            shared: Arc::new(Shared::new()),
            queue,
            registry: Arc::new(Registry::new()),
            backend: Mutex::new(backend),
            pump_done,
            dispatcher: Mutex::new(DispatcherHandle {
                thread: None,
                done: None,
            }),
            next_watch_id: AtomicUsize::new(1),
            teardown: std::sync::Once::new(),
        })
    }

    /// The backend this observer runs on.
    pub fn kind(&self) -> ObserverKind {
        self.kind
    }

    /// Starts the dispatcher; handler callbacks begin after this returns.
    pub fn start(&self) -> Result<()> {
        match self.shared.state.compare_exchange(
            STATE_CREATED,
            STATE_STARTED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_STARTED) => return Err(Error::generic("observer already started")),
            Err(_) => return Err(Error::generic("observer has been stopped")),
        }

        let queue = Arc::clone(&self.queue);
        let registry = Arc::clone(&self.registry);
        let shared = Arc::clone(&self.shared);
        let timeout = self.config.queue_timeout();
        let (guard, done) = PumpGuard::pair();
        let thread = thread::Builder::new()
            .name("vigil dispatcher".to_string())
            .spawn(move || {
                let _guard = guard;
                dispatch::run(queue, registry, shared, timeout);
            })
            .map_err(Error::io)?;

        let mut handle = self.lock_dispatcher();
        handle.thread = Some(thread);
        handle.done = Some(done);
        Ok(())
    }

    /// Stops both threads, waiting up to the configured grace period for
    /// each before abandoning it with a warning. Idempotent.
    pub fn stop(&self) -> Result<()> {
        self.teardown.call_once(|| {
            self.shared.state.store(STATE_STOPPED, Ordering::SeqCst);
            self.lock_backend().shutdown();
            self.queue.close();

            let grace = self.config.stop_grace();
            if self.pump_done.recv_timeout(grace).is_err() {
                log::warn!("backend pump did not exit within {grace:?}; abandoning it");
            }

            let mut handle = self.lock_dispatcher();
            if let Some(done) = handle.done.take() {
                match done.recv_timeout(grace) {
                    Ok(()) => {
                        if let Some(thread) = handle.thread.take() {
                            let _ = thread.join();
                        }
                    }
                    Err(_) => {
                        handle.thread.take();
                        log::warn!("dispatcher did not exit within {grace:?}; abandoning it");
                    }
                }
            }
        });
        Ok(())
    }

    /// Schedules `handler` to observe `path`.
    ///
    /// An equivalent existing watch (same path, same mode) is reused and the
    /// handler attached to it; otherwise the backend registers a new kernel
    /// watch. The handler scheduled here lives until the watch is
    /// unscheduled; use [`add_handler_for_watch`](Self::add_handler_for_watch)
    /// when individual removal is needed.
    pub fn schedule<H: EventHandler>(
        &self,
        handler: H,
        path: impl AsRef<Path>,
        mode: RecursiveMode,
    ) -> Result<ObservedWatch> {
        if self.shared.is_stopping() {
            return Err(Error::generic("observer has been stopped"));
        }
        let path = absolutize(path.as_ref())?;
        if !path.exists() {
            return Err(Error::path_does_not_exist().add_path(path));
        }
        // Kernel mechanisms report resolved paths (FSEvents in particular);
        // scope containment needs the watch path in the same form.
        let path = std::fs::canonicalize(&path).unwrap_or(path);
        let recursive = mode.is_recursive();

        if let Some(watch) = self.registry.find_equivalent(&path, recursive) {
            self.registry.attach(watch.id(), Box::new(handler))?;
            return Ok(watch);
        }

        let id = WatchId(self.next_watch_id.fetch_add(1, Ordering::SeqCst));
        let watch = ObservedWatch::new(id, path, recursive);
        self.lock_backend().add_watch(&watch)?;
        self.registry.add_watch(watch.clone());
        self.registry.attach(watch.id(), Box::new(handler))?;
        Ok(watch)
    }

    /// Removes a watch, its kernel registration, and all its handlers.
    pub fn unschedule(&self, watch: &ObservedWatch) -> Result<()> {
        let watch = self
            .registry
            .remove_watch(watch.id())
            .ok_or_else(|| Error::watch_not_found().add_path(watch.path().into()))?;
        self.lock_backend().remove_watch(&watch)
    }

    /// Removes every watch and handler.
    pub fn unschedule_all(&self) -> Result<()> {
        let mut backend = self.lock_backend();
        for watch in self.registry.drain() {
            if let Err(err) = backend.remove_watch(&watch) {
                log::warn!("unable to remove watch for {:?}: {err}", watch.path());
            }
        }
        Ok(())
    }

    /// Attaches another handler to an existing watch.
    pub fn add_handler_for_watch<H: EventHandler>(
        &self,
        handler: H,
        watch: &ObservedWatch,
    ) -> Result<HandlerId> {
        self.registry.attach(watch.id(), Box::new(handler))
    }

    /// Detaches a handler. Removing the last handler of a watch removes the
    /// watch itself, including its kernel registration.
    pub fn remove_handler_for_watch(
        &self,
        watch: &ObservedWatch,
        handler: HandlerId,
    ) -> Result<()> {
        let unreferenced = self.registry.detach(watch.id(), handler)?;
        if unreferenced {
            if let Some(watch) = self.registry.remove_watch(watch.id()) {
                self.lock_backend().remove_watch(&watch)?;
            }
        }
        Ok(())
    }

    /// Active watches, in registration order.
    pub fn watches(&self) -> Vec<ObservedWatch> {
        self.registry.watches()
    }

    /// Number of events dropped to the queue capacity bound so far.
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped()
    }

    /// The fault that terminally stopped this observer, if one occurred.
    ///
    /// One-shot: the error is handed out once.
    pub fn terminal_error(&self) -> Option<Error> {
        self.shared.take_terminal_error()
    }

    fn lock_backend(&self) -> MutexGuard<'_, Box<dyn Backend>> {
        self.backend
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_dispatcher(&self) -> MutexGuard<'_, DispatcherHandle> {
        self.dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("kind", &self.kind)
            .field("watches", &self.registry.watches().len())
            .finish()
    }
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_owned())
    } else {
        Ok(env::current_dir().map_err(Error::io)?.join(path))
    }
}

/// Picks the best backend available on the current platform.
pub(crate) fn default_kind() -> ObserverKind {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    return ObserverKind::Inotify;
    #[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
    return ObserverKind::FsEvent;
    #[cfg(all(
        target_os = "macos",
        feature = "macos_kqueue",
        not(feature = "macos_fsevent")
    ))]
    return ObserverKind::Kqueue;
    #[cfg(any(
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))]
    return ObserverKind::Kqueue;
    #[cfg(target_os = "windows")]
    return ObserverKind::ReadDirectoryChanges;
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        all(
            target_os = "macos",
            any(feature = "macos_fsevent", feature = "macos_kqueue")
        ),
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly",
        target_os = "windows"
    )))]
    return ObserverKind::Poll;
}

fn make_backend(
    kind: ObserverKind,
    sink: EventSink,
    guard: PumpGuard,
    config: &Config,
) -> Result<Box<dyn Backend>> {
    match kind {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        ObserverKind::Inotify => Ok(Box::new(crate::inotify::InotifyBackend::new(
            sink, guard, config,
        )?)),
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        ObserverKind::Inotify => Err(Error::generic("the inotify backend requires Linux")),

        #[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
        ObserverKind::FsEvent => Ok(Box::new(crate::fsevent::FsEventBackend::new(
            sink, guard, config,
        )?)),
        #[cfg(not(all(target_os = "macos", feature = "macos_fsevent")))]
        ObserverKind::FsEvent => Err(Error::generic(
            "the FSEvents backend requires macOS and the macos_fsevent feature",
        )),

        #[cfg(any(
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly",
            all(target_os = "macos", feature = "macos_kqueue")
        ))]
        ObserverKind::Kqueue => Ok(Box::new(crate::kqueue::KqueueBackend::new(
            sink, guard, config,
        )?)),
        #[cfg(not(any(
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly",
            all(target_os = "macos", feature = "macos_kqueue")
        )))]
        ObserverKind::Kqueue => Err(Error::generic("the kqueue backend requires a BSD or macOS")),

        #[cfg(target_os = "windows")]
        ObserverKind::ReadDirectoryChanges => Ok(Box::new(
            crate::windows::ReadDirectoryChangesBackend::new(sink, guard, config)?,
        )),
        #[cfg(not(target_os = "windows"))]
        ObserverKind::ReadDirectoryChanges => Err(Error::generic(
            "the ReadDirectoryChangesW backend requires Windows",
        )),

        ObserverKind::Poll => Ok(Box::new(crate::poll::PollBackend::new(
            sink, guard, config,
        )?)),
        ObserverKind::Null => Ok(Box::new(crate::null::NullBackend::new(sink, guard))),
    }
}
