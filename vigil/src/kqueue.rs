//! Backend for the kqueue API (BSDs, and macOS as a fallback).
//!
//! kqueue observes open file descriptors, not paths: every watched file and
//! directory holds one descriptor, and a vnode event only says that
//! *something* happened to it. To find out what, this backend keeps a
//! non-recursive child listing per watched directory and re-captures it on
//! every directory event; the listing diff yields the creations, deletions
//! and renames kqueue itself cannot report.

use std::collections::HashMap;
use std::fs::metadata;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use kqueue::{EventData, EventFilter, FilterFlag, Ident, Vnode};
use walkdir::WalkDir;

use crate::observer::{Backend, EventSink, ObservedWatch, PumpGuard, WatchId};
use crate::snapshot::DirSnapshot;
use crate::{Config, Error, Event, EventKind, Result};

const KQUEUE: mio::Token = mio::Token(0);
const MESSAGE: mio::Token = mio::Token(1);

struct KWatch {
    owner: WatchId,
    is_recursive: bool,
    is_dir: bool,
    /// The path the observed watch was scheduled on, as opposed to an
    /// entry registered while expanding it.
    is_root: bool,
}

enum EventLoopMsg {
    AddWatch(ObservedWatch, Sender<Result<()>>),
    RemoveWatch(ObservedWatch, Sender<Result<()>>),
    Shutdown,
}

struct EventLoop {
    running: bool,
    poll: mio::Poll,
    event_loop_waker: Arc<mio::Waker>,
    event_loop_tx: Sender<EventLoopMsg>,
    event_loop_rx: Receiver<EventLoopMsg>,
    kqueue: kqueue::Watcher,
    sink: EventSink,
    follow_symlinks: bool,
    watches: HashMap<PathBuf, KWatch>,
    /// Child listing per watched directory, the diff basis for deriving
    /// what a directory event actually was.
    listings: HashMap<PathBuf, DirSnapshot>,
}

impl EventLoop {
    fn new(kqueue: kqueue::Watcher, sink: EventSink, config: &Config) -> Result<Self> {
        let (event_loop_tx, event_loop_rx) = unbounded::<EventLoopMsg>();
        let poll = mio::Poll::new().map_err(Error::io)?;
        let event_loop_waker =
            Arc::new(mio::Waker::new(poll.registry(), MESSAGE).map_err(Error::io)?);

        let kqueue_fd = kqueue.as_raw_fd();
        let mut evented_kqueue = mio::unix::SourceFd(&kqueue_fd);
        poll.registry()
            .register(&mut evented_kqueue, KQUEUE, mio::Interest::READABLE)
            .map_err(Error::io)?;

        Ok(EventLoop {
            running: true,
            poll,
            event_loop_waker,
            event_loop_tx,
            event_loop_rx,
            kqueue,
            sink,
            follow_symlinks: config.follow_symlinks(),
            watches: HashMap::new(),
            listings: HashMap::new(),
        })
    }

    fn run(self, guard: PumpGuard) -> Result<()> {
        thread::Builder::new()
            .name("vigil kqueue loop".to_string())
            .spawn(move || {
                let _guard = guard;
                self.event_loop_thread()
            })
            .map_err(Error::io)?;
        Ok(())
    }

    fn event_loop_thread(mut self) {
        let mut events = mio::Events::with_capacity(16);
        loop {
            match self.poll.poll(&mut events, None) {
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.sink.fault(Error::io(e));
                    break;
                }
                Ok(()) => {}
            }

            for event in &events {
                match event.token() {
                    MESSAGE => self.handle_messages(),
                    KQUEUE => self.handle_kqueue(),
                    _ => unreachable!(),
                }
            }

            if !self.running {
                break;
            }
        }
    }

    fn handle_messages(&mut self) {
        while let Ok(msg) = self.event_loop_rx.try_recv() {
            match msg {
                EventLoopMsg::AddWatch(watch, tx) => {
                    let _ = tx.send(self.add_root(&watch));
                }
                EventLoopMsg::RemoveWatch(watch, tx) => {
                    let _ = tx.send(self.remove_subtree(watch.path(), true));
                }
                EventLoopMsg::Shutdown => {
                    self.running = false;
                    break;
                }
            }
        }
    }

    fn handle_kqueue(&mut self) {
        while let Some(event) = self.kqueue.poll(None) {
            log::trace!("kqueue event: {event:?}");

            let kqueue::Event {
                data: EventData::Vnode(data),
                ident: Ident::Filename(_, path),
            } = event
            else {
                // Only EVFILT_VNODE filters are registered.
                continue;
            };
            let path = PathBuf::from(path);

            match data {
                Vnode::Write | Vnode::Link if self.listings.contains_key(&path) => {
                    self.rediff_directory(&path);
                }
                Vnode::Write => {
                    let owner = self.owner_of(&path);
                    self.sink
                        .send(owner, Event::new(EventKind::Modified, path));
                }
                // Extend and Truncate are two names for the same size
                // change; Extend is FreeBSD, Truncate everywhere else.
                Vnode::Extend | Vnode::Truncate => {
                    let owner = self.owner_of(&path);
                    self.sink
                        .send(owner, Event::new(EventKind::Modified, path));
                }
                Vnode::Attrib => {
                    let owner = self.owner_of(&path);
                    let is_dir = self.watches.get(&path).is_some_and(|w| w.is_dir);
                    self.sink.send(
                        owner,
                        Event::new(EventKind::Modified, path).set_directory(is_dir),
                    );
                }
                Vnode::Delete | Vnode::Revoke => {
                    self.entry_vanished(&path);
                }
                Vnode::Rename => {
                    self.entry_renamed(&path);
                }
                Vnode::Link => {
                    // Link events on plain files (hard-link count changes)
                    // surface as metadata modification.
                    let owner = self.owner_of(&path);
                    self.sink
                        .send(owner, Event::new(EventKind::Modified, path));
                }
                #[allow(unreachable_patterns)]
                _ => {}
            }
        }
    }

    /// Re-lists a watched directory and emits whatever changed since the
    /// previous listing, adjusting descriptors along the way.
    fn rediff_directory(&mut self, dir: &Path) {
        let Some(watch) = self.watches.get(dir) else {
            return;
        };
        let owner = watch.owner;
        let is_recursive = watch.is_recursive;

        let fresh = match DirSnapshot::capture(dir, false, self.follow_symlinks) {
            Ok(snapshot) => snapshot,
            Err(_) => DirSnapshot::empty(),
        };
        let old = self.listings.insert(dir.to_owned(), fresh.clone());
        let events = old.unwrap_or_default().diff(&fresh);

        for event in &events {
            match event.kind {
                EventKind::Created => {
                    let created = event.path().to_owned();
                    if event.is_directory && is_recursive {
                        if let Err(err) = self.add_subtree(created, owner, true, false) {
                            log::warn!("unable to expand kqueue watch: {err}");
                        }
                    } else if let Err(err) = self.add_single_watch(created, owner, false, false) {
                        log::warn!("unable to watch new entry: {err}");
                    }
                }
                EventKind::Deleted => {
                    let _ = self.remove_subtree(event.path(), false);
                }
                EventKind::Moved => {
                    let _ = self.remove_subtree(event.path(), false);
                    if let Some(dest) = event.dest() {
                        let expand = event.is_directory && is_recursive;
                        let result = if expand {
                            self.add_subtree(dest.to_owned(), owner, true, false)
                        } else {
                            self.add_single_watch(dest.to_owned(), owner, false, false)
                        };
                        if let Err(err) = result {
                            log::warn!("unable to re-watch renamed entry: {err}");
                        }
                    }
                }
                _ => {}
            }
        }

        // Commit whatever descriptors the loop above registered.
        if let Err(err) = self.kqueue.watch() {
            log::warn!("unable to commit kqueue registrations: {err}");
        }

        self.sink.send_all(owner, events);
    }

    /// A watched entry was deleted or revoked under our descriptor.
    fn entry_vanished(&mut self, path: &Path) {
        let Some(watch) = self.watches.get(path) else {
            return;
        };
        // When a watched parent directory covers this entry, its listing
        // diff reports the deletion; emitting here too would double it.
        let covered = path
            .parent()
            .is_some_and(|parent| self.listings.contains_key(parent));
        if watch.is_root && !covered {
            self.sink.send(
                watch.owner,
                Event::new(EventKind::Deleted, path.to_owned()).set_directory(watch.is_dir),
            );
        }
        let _ = self.remove_subtree(path, false);
    }

    /// A watched entry was renamed. kqueue does not say where it went; if a
    /// watched parent covers it the listing diff reconstructs the rename,
    /// otherwise the entry left the observed scope.
    fn entry_renamed(&mut self, path: &Path) {
        let Some(watch) = self.watches.get(path) else {
            return;
        };
        let covered = path
            .parent()
            .is_some_and(|parent| self.listings.contains_key(parent));
        if watch.is_root && !covered {
            let owner = watch.owner;
            let is_dir = watch.is_dir;
            let mut descendants: Vec<PathBuf> = self
                .watches
                .keys()
                .filter(|candidate| candidate.as_path() != path && candidate.starts_with(path))
                .cloned()
                .collect();
            descendants.sort();
            for descendant in descendants {
                let descendant_is_dir =
                    self.watches.get(&descendant).is_some_and(|w| w.is_dir);
                self.sink.send(
                    owner,
                    Event::new(EventKind::Deleted, descendant)
                        .set_directory(descendant_is_dir)
                        .into_synthetic(),
                );
            }
            self.sink.send(
                owner,
                Event::new(EventKind::Deleted, path.to_owned()).set_directory(is_dir),
            );
        }
        let _ = self.remove_subtree(path, false);
    }

    fn owner_of(&self, path: &Path) -> WatchId {
        let mut cursor = Some(path);
        while let Some(candidate) = cursor {
            if let Some(watch) = self.watches.get(candidate) {
                return watch.owner;
            }
            cursor = candidate.parent();
        }
        WatchId::UNATTRIBUTED
    }

    fn add_root(&mut self, watch: &ObservedWatch) -> Result<()> {
        self.add_subtree(
            watch.path().to_owned(),
            watch.id(),
            watch.recursive(),
            true,
        )?;
        // A single kevent syscall registers everything added above.
        self.kqueue.watch().map_err(Error::io)?;
        Ok(())
    }

    /// Registers `path` and, for directories, its children: direct children
    /// for non-recursive watches, the whole tree otherwise.
    fn add_subtree(
        &mut self,
        path: PathBuf,
        owner: WatchId,
        is_recursive: bool,
        is_root: bool,
    ) -> Result<()> {
        if !metadata(&path).map_err(Error::io_watch)?.is_dir() {
            return self.add_single_watch(path, owner, is_recursive, is_root);
        }

        let max_depth = if is_recursive { usize::MAX } else { 1 };
        let mut first = true;
        for entry in WalkDir::new(&path)
            .follow_links(self.follow_symlinks)
            .max_depth(max_depth)
        {
            let entry = entry.map_err(map_walkdir_error)?;
            let entry_path = entry.into_path();
            self.add_single_watch(entry_path, owner, is_recursive, is_root && first)?;
            first = false;
        }
        Ok(())
    }

    /// Registers a single descriptor. The caller must follow up with
    /// `self.kqueue.watch()` to commit pending registrations.
    fn add_single_watch(
        &mut self,
        path: PathBuf,
        owner: WatchId,
        is_recursive: bool,
        is_root: bool,
    ) -> Result<()> {
        let event_filter = EventFilter::EVFILT_VNODE;
        let filter_flags = FilterFlag::NOTE_DELETE
            | FilterFlag::NOTE_WRITE
            | FilterFlag::NOTE_EXTEND
            | FilterFlag::NOTE_ATTRIB
            | FilterFlag::NOTE_LINK
            | FilterFlag::NOTE_RENAME
            | FilterFlag::NOTE_REVOKE;

        log::trace!("adding kqueue watch: {}", path.display());

        self.kqueue
            .add_filename(&path, event_filter, filter_flags)
            .map_err(|e| Error::io_watch(e).add_path(path.clone()))?;

        let is_dir = metadata(&path).map(|m| m.is_dir()).unwrap_or(false);
        if is_dir {
            let listing = DirSnapshot::capture(&path, false, self.follow_symlinks)
                .unwrap_or_else(|_| DirSnapshot::empty());
            self.listings.insert(path.clone(), listing);
        }
        self.watches.insert(
            path,
            KWatch {
                owner,
                is_recursive,
                is_dir,
                is_root,
            },
        );
        Ok(())
    }

    /// Drops the descriptors for `path` and everything below it, children
    /// before the parent so no descriptor outlives its watch.
    fn remove_subtree(&mut self, path: &Path, must_exist: bool) -> Result<()> {
        if !self.watches.contains_key(path) {
            return if must_exist {
                Err(Error::watch_not_found().add_path(path.into()))
            } else {
                Ok(())
            };
        }

        let mut doomed: Vec<PathBuf> = self
            .watches
            .keys()
            .filter(|candidate| candidate.starts_with(path))
            .cloned()
            .collect();
        // Deepest first: children close before their parent.
        doomed.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

        for entry in doomed {
            log::trace!("removing kqueue watch: {}", entry.display());
            if let Err(err) = self
                .kqueue
                .remove_filename(&entry, EventFilter::EVFILT_VNODE)
            {
                log::info!("unable to remove kqueue filename: {err:?}");
            }
            self.watches.remove(&entry);
            self.listings.remove(&entry);
        }

        self.kqueue.watch().map_err(Error::io)?;
        Ok(())
    }
}

fn map_walkdir_error(e: walkdir::Error) -> Error {
    if e.io_error().is_some() {
        // safe to unwrap, the branch above checked for it
        Error::io_watch(e.into_io_error().unwrap())
    } else {
        Error::generic(&e.to_string())
    }
}

/// kqueue-based `Backend` implementation.
pub(crate) struct KqueueBackend {
    channel: Sender<EventLoopMsg>,
    waker: Arc<mio::Waker>,
}

impl KqueueBackend {
    pub(crate) fn new(sink: EventSink, guard: PumpGuard, config: &Config) -> Result<Self> {
        let kqueue = kqueue::Watcher::new().map_err(Error::io)?;
        let event_loop = EventLoop::new(kqueue, sink, config)?;
        let channel = event_loop.event_loop_tx.clone();
        let waker = event_loop.event_loop_waker.clone();
        event_loop.run(guard)?;
        Ok(KqueueBackend { channel, waker })
    }

    fn request(&self, msg: EventLoopMsg, rx: Receiver<Result<()>>) -> Result<()> {
        self.channel.send(msg)?;
        self.waker.wake().map_err(Error::io)?;
        rx.recv()?
    }
}

impl Backend for KqueueBackend {
    fn add_watch(&mut self, watch: &ObservedWatch) -> Result<()> {
        let (tx, rx) = unbounded();
        self.request(EventLoopMsg::AddWatch(watch.clone(), tx), rx)
    }

    fn remove_watch(&mut self, watch: &ObservedWatch) -> Result<()> {
        let (tx, rx) = unbounded();
        self.request(EventLoopMsg::RemoveWatch(watch.clone(), tx), rx)
    }

    fn shutdown(&mut self) {
        if self.channel.send(EventLoopMsg::Shutdown).is_ok() {
            let _ = self.waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use crate::{ObserverKind, RecursiveMode};

    #[test]
    fn watch_and_unwatch_recursively() {
        let tmpdir = testdir();
        std::fs::create_dir(tmpdir.path().join("sub")).unwrap();

        let observer = crate::kqueue_observer(Config::default()).unwrap();
        let watch = observer
            .schedule(|_: &Event| {}, tmpdir.path(), RecursiveMode::Recursive)
            .unwrap();
        observer.unschedule(&watch).expect("unwatch");
    }

    #[test]
    fn create_file() {
        let tmpdir = testdir();
        let root = tmpdir.path().canonicalize().expect("canonicalize");
        let (observer, mut rx) = observer_channel(ObserverKind::Kqueue);
        observer
            .schedule(rx.handler(), &root, RecursiveMode::Recursive)
            .unwrap();
        observer.start().unwrap();

        let path = root.join("entry");
        std::fs::File::create_new(&path).expect("create");

        let event = rx.recv_where(|e| e.kind == EventKind::Created);
        assert_eq!(event.path(), path);
    }

    #[test]
    fn write_file() {
        let tmpdir = testdir();
        let root = tmpdir.path().canonicalize().expect("canonicalize");
        let path = root.join("entry");
        std::fs::write(&path, b"").expect("create");

        let (observer, mut rx) = observer_channel(ObserverKind::Kqueue);
        observer
            .schedule(rx.handler(), &root, RecursiveMode::Recursive)
            .unwrap();
        observer.start().unwrap();

        std::fs::write(&path, b"123").expect("write");

        let event = rx.recv_where(|e| e.kind == EventKind::Modified && e.path() == path);
        assert!(!event.is_directory);
    }

    #[test]
    fn rename_within_a_watched_directory_is_reconstructed() {
        let tmpdir = testdir();
        let root = tmpdir.path().canonicalize().expect("canonicalize");
        let path = root.join("entry");
        std::fs::write(&path, b"x").expect("create");

        let (observer, mut rx) = observer_channel(ObserverKind::Kqueue);
        observer
            .schedule(rx.handler(), &root, RecursiveMode::Recursive)
            .unwrap();
        observer.start().unwrap();

        let new_path = root.join("renamed");
        std::fs::rename(&path, &new_path).expect("rename");

        let event = rx.recv_where(|e| e.kind == EventKind::Moved);
        assert_eq!(event.path(), path);
        assert_eq!(event.dest(), Some(new_path.as_path()));
    }

    #[test]
    fn delete_file() {
        let tmpdir = testdir();
        let root = tmpdir.path().canonicalize().expect("canonicalize");
        let file = root.join("file");
        std::fs::write(&file, "").expect("write");

        let (observer, mut rx) = observer_channel(ObserverKind::Kqueue);
        observer
            .schedule(rx.handler(), &root, RecursiveMode::NonRecursive)
            .unwrap();
        observer.start().unwrap();

        std::fs::remove_file(&file).expect("remove");

        let event = rx.recv_where(|e| e.kind == EventKind::Deleted);
        assert_eq!(event.path(), file);
    }
}
