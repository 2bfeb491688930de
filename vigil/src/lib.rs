//! Cross-platform filesystem observation library.
//!
//! `vigil` reports changes to files and directories (creation, deletion,
//! modification, moves, attribute changes) in near-real time, using the
//! best native mechanism available on each operating system and falling
//! back to polling everywhere else.
//!
//! An [`Observer`] binds one platform backend to one dispatcher thread.
//! Handlers are scheduled against paths; every event whose path falls
//! inside a watch's scope is passed to that watch's handlers, in
//! registration order, on the dispatcher thread.
//!
//! ```no_run
//! use vigil::{Config, Event, Observer, RecursiveMode};
//!
//! fn main() -> vigil::Result<()> {
//!     let observer = Observer::new(Config::default())?;
//!     observer.schedule(
//!         |event: &Event| println!("{event}"),
//!         "/tmp/watched",
//!         RecursiveMode::Recursive,
//!     )?;
//!     observer.start()?;
//!     // ... run until done ...
//!     observer.stop()?;
//!     Ok(())
//! }
//! ```
//!
//! # Backend capabilities
//!
//! | Backend                 | Platform       | `Moved` pairing   | `Opened`/`Closed*` | Notes |
//! |-------------------------|----------------|-------------------|--------------------|-------|
//! | inotify                 | Linux, Android | cookie grouping   | yes                | recursion maintained in userspace |
//! | FSEvents                | macOS          | adjacent event ids| no                 | stream latency configurable |
//! | kqueue                  | BSDs, macOS    | listing re-diff   | no                 | one descriptor per watched entry |
//! | ReadDirectoryChangesW   | Windows        | in-buffer pairing | no                 | file watches via parent directory |
//! | polling                 | any            | snapshot identity | no                 | events are synthetic |
//!
//! Backends that cannot pair both halves of a rename degrade it to a
//! `Deleted` followed by a `Created`; every delivered `Moved` event carries
//! both paths. Open/close notifications exist only where the kernel
//! provides them (inotify); on other platforms those kinds are simply never
//! emitted.
//!
//! # Event loss
//!
//! Kernel queues and the internal event queue are bounded. When events are
//! lost, handlers receive a single queue-overflow signal before the next
//! delivery ([`EventHandler::on_queue_overflow`]). Handlers that need
//! completeness should respond by re-scanning with a [`DirSnapshot`] and
//! diffing against their previous state.
//!
//! # Known limits
//!
//! Events that occur before an observation begins or after it stops are not
//! captured. A rename may surface as one `Moved` or as `Deleted` +
//! `Created` depending on what the kernel reports and on watch scope.

#![deny(missing_docs)]

pub use config::{Config, RecursiveMode};
pub use dispatch::HandlerId;
pub use error::{Error, ErrorKind, Result};
pub use observer::{ObservedWatch, Observer, ObserverKind, WatchId};
pub use snapshot::{DirSnapshot, EntryInfo};
pub use vigil_types::event::{Event, EventKind};

mod config;
mod dispatch;
mod error;
mod grouper;
mod observer;
mod queue;
pub mod snapshot;

mod null;
mod poll;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod inotify;

#[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
mod fsevent;

#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    all(target_os = "macos", feature = "macos_kqueue")
))]
mod kqueue;

#[cfg(target_os = "windows")]
mod windows;

#[cfg(test)]
mod testutil;

/// The set of requirements for observer event handlers.
///
/// A handler is an opaque callback plus a filter predicate. Handlers run
/// synchronously on the observer's dispatcher thread: they must not assume
/// reentrancy, and a long-running handler delays every other handler of the
/// same observer. A panicking handler is caught and logged; it never stops
/// the observer.
///
/// # Example implementation
///
/// ```no_run
/// use vigil::{Event, EventHandler};
///
/// /// Prints received events.
/// struct EventPrinter;
///
/// impl EventHandler for EventPrinter {
///     fn on_event(&mut self, event: &Event) {
///         println!("{event}");
///     }
/// }
/// ```
pub trait EventHandler: Send + 'static {
    /// Called for every event inside the watch's scope that passes
    /// [`accepts`](EventHandler::accepts).
    fn on_event(&mut self, event: &Event);

    /// Filter predicate consulted before [`on_event`](EventHandler::on_event).
    /// Defaults to accepting everything.
    fn accepts(&self, _event: &Event) -> bool {
        true
    }

    /// Called when events were lost between the previous delivery and the
    /// next one. Defaults to doing nothing.
    fn on_queue_overflow(&mut self) {}
}

impl<F> EventHandler for F
where
    F: FnMut(&Event) + Send + 'static,
{
    fn on_event(&mut self, event: &Event) {
        (self)(event);
    }
}

impl EventHandler for std::sync::mpsc::Sender<Event> {
    fn on_event(&mut self, event: &Event) {
        let _ = self.send(event.clone());
    }
}

impl EventHandler for crossbeam_channel::Sender<Event> {
    fn on_event(&mut self, event: &Event) {
        let _ = self.send(event.clone());
    }
}

/// Creates an [`Observer`] on the best backend for the current platform
/// with the default configuration.
pub fn recommended_observer() -> Result<Observer> {
    Observer::new(Config::default())
}

/// Creates an [`Observer`] on the polling backend.
///
/// Available on every platform; also useful on filesystems where the native
/// mechanism is unreliable (network mounts, some pseudo-filesystems).
pub fn polling_observer(config: Config) -> Result<Observer> {
    Observer::with_kind(ObserverKind::Poll, config)
}

/// Creates an [`Observer`] on the inert null backend, which accepts watches
/// and never emits events. Intended for tests.
pub fn null_observer(config: Config) -> Result<Observer> {
    Observer::with_kind(ObserverKind::Null, config)
}

/// Creates an [`Observer`] on the inotify backend.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn inotify_observer(config: Config) -> Result<Observer> {
    Observer::with_kind(ObserverKind::Inotify, config)
}

/// Creates an [`Observer`] on the FSEvents backend.
#[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
pub fn fsevent_observer(config: Config) -> Result<Observer> {
    Observer::with_kind(ObserverKind::FsEvent, config)
}

/// Creates an [`Observer`] on the kqueue backend.
#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    all(target_os = "macos", feature = "macos_kqueue")
))]
pub fn kqueue_observer(config: Config) -> Result<Observer> {
    Observer::with_kind(ObserverKind::Kqueue, config)
}

/// Creates an [`Observer`] on the ReadDirectoryChangesW backend.
#[cfg(target_os = "windows")]
pub fn read_directory_changes_observer(config: Config) -> Result<Observer> {
    Observer::with_kind(ObserverKind::ReadDirectoryChanges, config)
}
