//! Backend for the inotify Linux API.
//!
//! inotify monitors directories, not trees: a recursive watch is maintained
//! in userspace by registering every sub-directory and following creations,
//! deletions and moves as they happen. Renames arrive as separate
//! `move-from` / `move-to` notifications correlated by a cookie; the
//! [`MoveGrouper`] joins them into single `Moved` events on this backend's
//! pump thread.

use std::collections::HashMap;
use std::fs::metadata;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use walkdir::WalkDir;

use crate::grouper::MoveGrouper;
use crate::observer::{Backend, EventSink, ObservedWatch, PumpGuard, WatchId};
use crate::{Config, Error, ErrorKind, Event, EventKind, Result};

const INOTIFY: mio::Token = mio::Token(0);
const MESSAGE: mio::Token = mio::Token(1);

/// Everything a directory watch subscribes to. Roots additionally watch
/// their own deletion and movement.
fn base_watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::ATTRIB
        | WatchMask::MODIFY
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::CLOSE_WRITE
        | WatchMask::CLOSE_NOWRITE
        | WatchMask::OPEN
}

struct Watch {
    wd: WatchDescriptor,
    mask: WatchMask,
    /// The observed watch this kernel registration was created for.
    owner: WatchId,
    is_recursive: bool,
    is_dir: bool,
}

enum EventLoopMsg {
    AddWatch(ObservedWatch, Sender<Result<()>>),
    RemoveWatch(ObservedWatch, Sender<Result<()>>),
    Shutdown,
}

// The event loop waits on a mio::Poll for two things: the inotify
// descriptor becoming readable, and the waker that accompanies messages on
// the command channel. The poll timeout doubles as the move-grouper timer.
struct EventLoop {
    running: bool,
    poll: mio::Poll,
    event_loop_waker: Arc<mio::Waker>,
    event_loop_tx: Sender<EventLoopMsg>,
    event_loop_rx: Receiver<EventLoopMsg>,
    inotify: Option<Inotify>,
    sink: EventSink,
    grouper: MoveGrouper,
    follow_symlinks: bool,
    watches: HashMap<PathBuf, Watch>,
    paths: HashMap<WatchDescriptor, PathBuf>,
}

impl EventLoop {
    fn new(inotify: Inotify, sink: EventSink, config: &Config) -> Result<Self> {
        let (event_loop_tx, event_loop_rx) = unbounded::<EventLoopMsg>();
        let poll = mio::Poll::new().map_err(Error::io)?;

        let event_loop_waker =
            Arc::new(mio::Waker::new(poll.registry(), MESSAGE).map_err(Error::io)?);

        let inotify_fd = inotify.as_raw_fd();
        let mut evented_inotify = mio::unix::SourceFd(&inotify_fd);
        poll.registry()
            .register(&mut evented_inotify, INOTIFY, mio::Interest::READABLE)
            .map_err(Error::io)?;

        Ok(EventLoop {
            running: true,
            poll,
            event_loop_waker,
            event_loop_tx,
            event_loop_rx,
            inotify: Some(inotify),
            sink,
            grouper: MoveGrouper::new(config.move_window(), config.move_pending_capacity()),
            follow_symlinks: config.follow_symlinks(),
            watches: HashMap::new(),
            paths: HashMap::new(),
        })
    }

    fn run(self, guard: PumpGuard) -> Result<()> {
        thread::Builder::new()
            .name("vigil inotify loop".to_string())
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
            // Wake up for kernel events, messages, or the next pending
            // rename lapsing.
            let timeout = self
                .grouper
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            match self.poll.poll(&mut events, timeout) {
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    // System call was interrupted, retry.
                }
                Err(e) => {
                    self.sink.fault(Error::io(e));
                    break;
                }
                Ok(()) => {}
            }

            for event in &events {
                match event.token() {
                    MESSAGE => self.handle_messages(),
                    INOTIFY => self.handle_inotify(),
                    _ => unreachable!(),
                }
            }

            let now = Instant::now();
            for lapsed in self.grouper.expire(now) {
                let owner = self.owner_of(lapsed.path());
                self.sink.send(owner, lapsed);
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
                    let _ = tx.send(self.add_watch(
                        watch.path().to_owned(),
                        watch.id(),
                        watch.recursive(),
                        true,
                    ));
                }
                EventLoopMsg::RemoveWatch(watch, tx) => {
                    let _ = tx.send(self.remove_watch(watch.path().to_owned(), false));
                }
                EventLoopMsg::Shutdown => {
                    for resolved in self.grouper.flush() {
                        let owner = self.owner_of(resolved.path());
                        self.sink.send(owner, resolved);
                    }
                    let _ = self.remove_all_watches();
                    if let Some(inotify) = self.inotify.take() {
                        let _ = inotify.close();
                    }
                    self.running = false;
                    break;
                }
            }
        }
    }

    fn handle_inotify(&mut self) {
        let mut add_watches = Vec::new();
        let mut remove_watches = Vec::new();
        let mut remove_watches_no_syscall = Vec::new();
        let mut out = Vec::new();

        if let Some(ref mut inotify) = self.inotify {
            let mut buffer = [0; 4096];
            loop {
                match inotify.read_events(&mut buffer) {
                    Ok(events) => {
                        let mut num_events = 0;
                        for event in events {
                            log::trace!("inotify event: {event:?}");
                            num_events += 1;

                            if event.mask.contains(EventMask::Q_OVERFLOW) {
                                self.sink.overflow();
                            }

                            let path = match event.name {
                                Some(name) => {
                                    self.paths.get(&event.wd).map(|root| root.join(name))
                                }
                                None => self.paths.get(&event.wd).cloned(),
                            };
                            let path = match path {
                                Some(path) => path,
                                None => {
                                    log::debug!(
                                        "inotify event with unknown descriptor: {event:?}"
                                    );
                                    continue;
                                }
                            };

                            let owner = Self::owner_in(&self.watches, &path);
                            let is_dir = event.mask.contains(EventMask::ISDIR);

                            if event.mask.contains(EventMask::MOVED_FROM) {
                                // If this was a watched directory, it takes
                                // its registrations with it; whether its
                                // contents survive is decided when (if) the
                                // matching move-to arrives.
                                let descendants = descendants_in(&self.watches, &path);
                                if self.watches.contains_key(&path) {
                                    remove_watches.push(path.clone());
                                }
                                for resolved in self.grouper.moved_from(
                                    event.cookie,
                                    path.clone(),
                                    is_dir,
                                    descendants,
                                    Instant::now(),
                                ) {
                                    out.push((owner, resolved));
                                }
                            } else if event.mask.contains(EventMask::MOVED_TO) {
                                let resolved =
                                    self.grouper.moved_to(event.cookie, path.clone(), is_dir);
                                out.push((owner, resolved));
                                if is_dir && parent_recursive_in(&self.watches, &path) {
                                    add_watches.push(path.clone());
                                }
                            }
                            if event.mask.contains(EventMask::CREATE) {
                                out.push((
                                    owner,
                                    Event::new(EventKind::Created, path.clone())
                                        .set_directory(is_dir),
                                ));
                                if is_dir && parent_recursive_in(&self.watches, &path) {
                                    add_watches.push(path.clone());
                                }
                            }
                            if event.mask.contains(EventMask::DELETE) {
                                out.push((
                                    owner,
                                    Event::new(EventKind::Deleted, path.clone())
                                        .set_directory(is_dir),
                                ));
                                if self.watches.contains_key(&path) {
                                    remove_watches.push(path.clone());
                                }
                            }
                            if event.mask.contains(EventMask::DELETE_SELF) {
                                // Sub-directory registrations never carry
                                // DELETE_SELF; this is a scheduled root
                                // going away.
                                if let Some(watch) = self.watches.get(&path) {
                                    out.push((
                                        watch.owner,
                                        Event::new(EventKind::Deleted, path.clone())
                                            .set_directory(watch.is_dir),
                                    ));
                                    remove_watches.push(path.clone());
                                }
                            }
                            if event.mask.contains(EventMask::MOVE_SELF) {
                                // A scheduled root moved. Where it went is
                                // unknowable from here: the root and every
                                // watched descendant leave the observed
                                // scope.
                                if let Some(watch) = self.watches.get(&path) {
                                    let root_owner = watch.owner;
                                    let root_is_dir = watch.is_dir;
                                    for descendant in descendants_in(&self.watches, &path) {
                                        out.push((
                                            root_owner,
                                            Event::new(EventKind::Deleted, descendant)
                                                .into_directory()
                                                .into_synthetic(),
                                        ));
                                    }
                                    out.push((
                                        root_owner,
                                        Event::new(EventKind::Deleted, path.clone())
                                            .set_directory(root_is_dir),
                                    ));
                                    remove_watches.push(path.clone());
                                }
                            }
                            if event.mask.contains(EventMask::UNMOUNT) {
                                out.push((
                                    owner,
                                    Event::new(EventKind::Deleted, path.clone())
                                        .set_directory(self.watches.get(&path).is_some_and(|w| w.is_dir)),
                                ));
                                // The kernel already dropped this watch and
                                // will emit IGNORED; clean up internal state
                                // without inotify_rm_watch.
                                if self.watches.contains_key(&path) {
                                    remove_watches_no_syscall.push(path.clone());
                                }
                            }
                            if event.mask.contains(EventMask::MODIFY) {
                                out.push((
                                    owner,
                                    Event::new(EventKind::Modified, path.clone())
                                        .set_directory(is_dir),
                                ));
                            }
                            if event.mask.contains(EventMask::ATTRIB) {
                                out.push((
                                    owner,
                                    Event::new(EventKind::Modified, path.clone())
                                        .set_directory(is_dir),
                                ));
                            }
                            if event.mask.contains(EventMask::OPEN) {
                                out.push((
                                    owner,
                                    Event::new(EventKind::Opened, path.clone())
                                        .set_directory(is_dir),
                                ));
                            }
                            if event.mask.contains(EventMask::CLOSE_WRITE) {
                                out.push((
                                    owner,
                                    Event::new(EventKind::ClosedWrite, path.clone())
                                        .set_directory(is_dir),
                                ));
                            }
                            if event.mask.contains(EventMask::CLOSE_NOWRITE) {
                                out.push((
                                    owner,
                                    Event::new(EventKind::ClosedNoWrite, path).set_directory(is_dir),
                                ));
                            }
                        }

                        if num_events == 0 {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        break;
                    }
                    Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                        // The buffer cannot hold the next record; events
                        // were lost as far as the consumer is concerned.
                        self.sink.overflow();
                        break;
                    }
                    Err(e) => {
                        self.sink.fault(Error::io(e));
                        self.running = false;
                        break;
                    }
                }
            }
        }

        for (owner, event) in out {
            self.sink.send(owner, event);
        }

        for path in remove_watches_no_syscall {
            if let Err(err) = self.remove_watch_without_os_call(path, true) {
                log::warn!("unable to remove the path from the watches: {err:?}");
            }
        }

        for path in remove_watches {
            if let Err(err) = self.remove_watch(path, true) {
                log::warn!("unable to remove the path from the watches: {err:?}");
            }
        }

        for path in add_watches {
            let owner = Self::owner_in(&self.watches, &path);
            if let Err(add_watch_error) = self.add_watch(path, owner, true, false) {
                // Tell the consumer when the watch limit is hit; a
                // recursive watch that silently stops covering new
                // directories would look healthy while missing events.
                if let ErrorKind::MaxFilesWatch = add_watch_error.kind {
                    self.sink.fault(add_watch_error);
                    self.running = false;
                    break;
                }
            }
        }
    }

    fn owner_of(&self, path: &Path) -> WatchId {
        Self::owner_in(&self.watches, path)
    }

    /// Attributes `path` to the nearest registered ancestor watch.
    fn owner_in(watches: &HashMap<PathBuf, Watch>, path: &Path) -> WatchId {
        let mut cursor = Some(path);
        while let Some(candidate) = cursor {
            if let Some(watch) = watches.get(candidate) {
                return watch.owner;
            }
            cursor = candidate.parent();
        }
        WatchId::UNATTRIBUTED
    }

    fn add_watch(
        &mut self,
        path: PathBuf,
        owner: WatchId,
        is_recursive: bool,
        watch_self: bool,
    ) -> Result<()> {
        // A non-recursive watch, or a plain file, is a single registration.
        if !is_recursive || !metadata(&path).map_err(Error::io_watch)?.is_dir() {
            return self.add_single_watch(path, owner, false, true);
        }

        // Walk first, register after: listing a directory opens it, and
        // registering mid-walk would make the walk observe itself.
        let entries: Vec<PathBuf> = WalkDir::new(path)
            .follow_links(self.follow_symlinks)
            .into_iter()
            .filter_map(filter_dir)
            .map(|entry| entry.into_path())
            .collect();

        let mut watch_self = watch_self;
        for entry_path in entries {
            match self.add_single_watch(entry_path, owner, is_recursive, watch_self) {
                Ok(()) => {}
                // TOCTOU: a subdirectory can disappear between walkdir
                // listing it and the inotify_add_watch call. That must not
                // fail the overall recursive registration.
                Err(err)
                    if !watch_self
                        && matches!(err.kind, ErrorKind::WatchPathDoesNotExist) => {}
                Err(err) => return Err(err),
            }
            watch_self = false;
        }
        Ok(())
    }

    fn add_single_watch(
        &mut self,
        path: PathBuf,
        owner: WatchId,
        is_recursive: bool,
        watch_self: bool,
    ) -> Result<()> {
        let mut watchmask = base_watch_mask();
        if watch_self {
            watchmask.insert(WatchMask::DELETE_SELF);
            watchmask.insert(WatchMask::MOVE_SELF);
        }

        if let Some(existing) = self.watches.get(&path) {
            watchmask.insert(existing.mask);
            watchmask.insert(WatchMask::MASK_ADD);
        }

        let Some(ref mut inotify) = self.inotify else {
            return Ok(());
        };

        log::trace!("adding inotify watch: {}", path.display());
        match inotify.watches().add(&path, watchmask) {
            Err(e) => Err(if e.raw_os_error() == Some(libc::ENOSPC) {
                // The watch limit shares an errno with "no space left on
                // device"; report it as its own kind.
                Error::new(ErrorKind::MaxFilesWatch)
            } else if e.kind() == std::io::ErrorKind::NotFound {
                Error::path_does_not_exist()
            } else {
                Error::io(e)
            }
            .add_path(path)),
            Ok(wd) => {
                watchmask.remove(WatchMask::MASK_ADD);
                let is_dir = match metadata(&path) {
                    Ok(metadata) => metadata.is_dir(),
                    Err(e) => {
                        // Avoid leaking the registration if the entry was
                        // deleted between add and stat.
                        let _ = inotify.watches().remove(wd.clone());
                        return Err(Error::io_watch(e).add_path(path));
                    }
                };
                self.watches.insert(
                    path.clone(),
                    Watch {
                        wd: wd.clone(),
                        mask: watchmask,
                        owner,
                        is_recursive,
                        is_dir,
                    },
                );
                self.paths.insert(wd, path);
                Ok(())
            }
        }
    }

    fn remove_watch(&mut self, path: PathBuf, remove_recursive: bool) -> Result<()> {
        match self.watches.remove(&path) {
            None => return Err(Error::watch_not_found().add_path(path)),
            Some(watch) => {
                if let Some(ref mut inotify) = self.inotify {
                    let mut inotify_watches = inotify.watches();
                    log::trace!(
                        "removing inotify watch for {path:?}, remove_recursive: {remove_recursive:?}"
                    );

                    Self::remove_single_descriptor(&mut inotify_watches, watch.wd.clone());
                    self.paths.remove(&watch.wd);

                    if watch.is_recursive || remove_recursive {
                        let mut remove_list = Vec::new();
                        for (wd, p) in &self.paths {
                            if p.starts_with(&path) {
                                Self::remove_single_descriptor(&mut inotify_watches, wd.clone());
                                self.watches.remove(p);
                                remove_list.push(wd.clone());
                            }
                        }
                        for wd in remove_list {
                            self.paths.remove(&wd);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn remove_watch_without_os_call(
        &mut self,
        path: PathBuf,
        remove_recursive: bool,
    ) -> Result<()> {
        match self.watches.remove(&path) {
            None => return Err(Error::watch_not_found().add_path(path)),
            Some(watch) => {
                self.paths.remove(&watch.wd);

                if watch.is_recursive || remove_recursive {
                    let mut remove_list = Vec::new();
                    for (wd, p) in &self.paths {
                        if p.starts_with(&path) {
                            self.watches.remove(p);
                            remove_list.push(wd.clone());
                        }
                    }
                    for wd in remove_list {
                        self.paths.remove(&wd);
                    }
                }
            }
        }
        Ok(())
    }

    /// `inotify_rm_watch` may fail with EBADF or EINVAL when the kernel has
    /// already invalidated the descriptor (a racing delete, an unmount).
    /// In every such case the descriptor is already unwatched, which is the
    /// outcome being asked for, so the failure is only logged.
    fn remove_single_descriptor(watches: &mut inotify::Watches, wd: WatchDescriptor) {
        if let Err(err) = watches.remove(wd) {
            log::info!("unable to remove watch descriptor from inotify: {err:?}");
        }
    }

    fn remove_all_watches(&mut self) -> Result<()> {
        if let Some(ref mut inotify) = self.inotify {
            let mut inotify_watches = inotify.watches();
            for (wd, p) in &self.paths {
                inotify_watches
                    .remove(wd.clone())
                    .map_err(|e| Error::io(e).add_path(p.into()))?;
            }
            self.watches.clear();
            self.paths.clear();
        }
        Ok(())
    }
}

/// Watched sub-directories strictly below `path`.
fn descendants_in(watches: &HashMap<PathBuf, Watch>, path: &Path) -> Vec<PathBuf> {
    let mut descendants: Vec<PathBuf> = watches
        .keys()
        .filter(|candidate| candidate.as_path() != path && candidate.starts_with(path))
        .cloned()
        .collect();
    descendants.sort();
    descendants
}

fn parent_recursive_in(watches: &HashMap<PathBuf, Watch>, path: &Path) -> bool {
    path.parent()
        .and_then(|parent| watches.get(parent))
        .is_some_and(|watch| watch.is_recursive)
}

/// Keeps directories only, without following the walk into errors.
fn filter_dir(e: walkdir::Result<walkdir::DirEntry>) -> Option<walkdir::DirEntry> {
    if let Ok(e) = e {
        if let Ok(metadata) = e.metadata() {
            if metadata.is_dir() {
                return Some(e);
            }
        }
    }
    None
}

/// inotify-based `Backend` implementation.
pub(crate) struct InotifyBackend {
    channel: Sender<EventLoopMsg>,
    waker: Arc<mio::Waker>,
}

impl InotifyBackend {
    pub(crate) fn new(sink: EventSink, guard: PumpGuard, config: &Config) -> Result<Self> {
        let inotify = Inotify::init().map_err(Error::io)?;
        let event_loop = EventLoop::new(inotify, sink, config)?;
        let channel = event_loop.event_loop_tx.clone();
        let waker = event_loop.event_loop_waker.clone();
        event_loop.run(guard)?;
        Ok(InotifyBackend { channel, waker })
    }

    fn request(&self, msg: EventLoopMsg, rx: Receiver<Result<()>>) -> Result<()> {
        self.channel.send(msg)?;
        self.waker.wake().map_err(Error::io)?;
        rx.recv()?
    }
}

impl Backend for InotifyBackend {
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
    use crate::queue::EventQueue;
    use crate::testutil::*;
    use crate::{ObserverKind, RecursiveMode};

    fn event_loop() -> EventLoop {
        let sink = EventSink::new(std::sync::Arc::new(EventQueue::new(None)));
        let inotify = Inotify::init().unwrap();
        EventLoop::new(inotify, sink, &Config::default()).unwrap()
    }

    #[test]
    fn missing_path_is_reported_before_any_state_changes() {
        let observer = crate::inotify_observer(Config::default()).unwrap();
        let result = observer.schedule(
            |_: &Event| {},
            "/some/non/existent/path",
            RecursiveMode::NonRecursive,
        );
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::WatchPathDoesNotExist,
                ..
            })
        ));
        assert!(observer.watches().is_empty());
    }

    #[test]
    fn recursive_add_tolerates_a_vanishing_subdir() {
        let tmpdir = testdir();
        let root = tmpdir.path().to_path_buf();
        let disappearing = root.join("disappearing");
        std::fs::create_dir(&disappearing).unwrap();
        std::fs::remove_dir_all(&disappearing).unwrap();

        let mut event_loop = event_loop();
        // Simulate the TOCTOU: the walk listed a subdirectory that is gone
        // by the time inotify_add_watch runs.
        event_loop
            .add_single_watch(root, WatchId::test(1), true, true)
            .expect("root registration");
        let result = event_loop.add_single_watch(disappearing, WatchId::test(1), true, false);
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::WatchPathDoesNotExist,
                ..
            })
        ));
    }

    #[test]
    fn remove_watch_without_os_call_removes_internal_state() {
        let tmpdir = testdir();
        let watched = tmpdir.path().join("watched");
        std::fs::create_dir(&watched).unwrap();

        let mut event_loop = event_loop();
        event_loop
            .add_watch(watched.clone(), WatchId::test(1), false, true)
            .expect("add_watch");
        event_loop
            .remove_watch_without_os_call(watched.clone(), true)
            .expect("remove_watch_without_os_call");

        let result = event_loop.remove_watch(watched, false);
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::WatchNotFound,
                ..
            })
        ));
    }

    #[test]
    fn create_file() {
        let tmpdir = testdir();
        let root = tmpdir.path().canonicalize().expect("canonicalize");
        let (observer, mut rx) = observer_channel(ObserverKind::Inotify);
        observer
            .schedule(rx.handler(), &root, RecursiveMode::Recursive)
            .unwrap();
        observer.start().unwrap();

        let path = root.join("entry");
        std::fs::File::create_new(&path).expect("create");

        let event = rx.recv_where(|e| e.kind == EventKind::Created);
        assert_eq!(event.path(), path);
        assert!(!event.is_directory);
    }

    #[test]
    fn write_file_delivers_modify_and_close() {
        let tmpdir = testdir();
        let root = tmpdir.path().canonicalize().expect("canonicalize");
        let path = root.join("entry");
        std::fs::File::create_new(&path).expect("create");

        let (observer, mut rx) = observer_channel(ObserverKind::Inotify);
        observer
            .schedule(rx.handler(), &root, RecursiveMode::Recursive)
            .unwrap();
        observer.start().unwrap();

        std::fs::write(&path, b"123").expect("write");

        let opened = rx.recv_where(|e| e.kind == EventKind::Opened);
        assert_eq!(opened.path(), path);
        let modified = rx.recv_where(|e| e.kind == EventKind::Modified);
        assert_eq!(modified.path(), path);
        let closed = rx.recv_where(|e| e.kind == EventKind::ClosedWrite);
        assert_eq!(closed.path(), path);
    }

    #[test]
    fn chmod_surfaces_as_modified() {
        let tmpdir = testdir();
        let root = tmpdir.path().canonicalize().expect("canonicalize");
        let path = root.join("entry");
        let file = std::fs::File::create_new(&path).expect("create");
        let mut permissions = file.metadata().expect("metadata").permissions();
        permissions.set_readonly(true);

        let (observer, mut rx) = observer_channel(ObserverKind::Inotify);
        observer
            .schedule(rx.handler(), &root, RecursiveMode::Recursive)
            .unwrap();
        observer.start().unwrap();

        file.set_permissions(permissions).expect("set_permissions");

        let event = rx.recv_where(|e| e.kind == EventKind::Modified);
        assert_eq!(event.path(), path);
    }

    #[test]
    fn rename_within_scope_is_one_moved_event() {
        let tmpdir = testdir();
        let root = tmpdir.path().canonicalize().expect("canonicalize");
        let path = root.join("entry");
        std::fs::File::create_new(&path).expect("create");

        let (observer, mut rx) = observer_channel(ObserverKind::Inotify);
        observer
            .schedule(rx.handler(), &root, RecursiveMode::Recursive)
            .unwrap();
        observer.start().unwrap();

        let new_path = root.join("renamed");
        std::fs::rename(&path, &new_path).expect("rename");

        let event = rx.recv_where(|e| e.kind == EventKind::Moved);
        assert_eq!(event.path(), path);
        assert_eq!(event.dest(), Some(new_path.as_path()));
        // Waiting past the grouper window must not produce a late delete.
        rx.assert_no_event_where(
            |e| e.kind == EventKind::Deleted,
            std::time::Duration::from_millis(700),
        );
    }

    #[test]
    fn move_out_of_scope_resolves_as_deleted() {
        let tmpdir = testdir();
        let root = tmpdir.path().canonicalize().expect("canonicalize");
        let subdir = root.join("subdir");
        let path = subdir.join("entry");
        std::fs::create_dir_all(&subdir).expect("create_dir_all");
        std::fs::File::create_new(&path).expect("create");

        let (observer, mut rx) = observer_channel_with_config(
            ObserverKind::Inotify,
            Config::default().with_move_window(std::time::Duration::from_millis(100)),
        );
        observer
            .schedule(rx.handler(), &subdir, RecursiveMode::Recursive)
            .unwrap();
        observer.start().unwrap();

        let new_path = root.join("entry");
        std::fs::rename(&path, &new_path).expect("rename");

        let event = rx.recv_where(|e| e.kind == EventKind::Deleted);
        assert_eq!(event.path(), path);
    }

    #[test]
    fn move_into_scope_resolves_as_created() {
        let tmpdir = testdir();
        let root = tmpdir.path().canonicalize().expect("canonicalize");
        let subdir = root.join("subdir");
        let outside = root.join("entry");
        std::fs::create_dir_all(&subdir).expect("create_dir_all");
        std::fs::File::create_new(&outside).expect("create");

        let (observer, mut rx) = observer_channel(ObserverKind::Inotify);
        observer
            .schedule(rx.handler(), &subdir, RecursiveMode::Recursive)
            .unwrap();
        observer.start().unwrap();

        let inside = subdir.join("entry");
        std::fs::rename(&outside, &inside).expect("rename");

        let event = rx.recv_where(|e| e.kind == EventKind::Created);
        assert_eq!(event.path(), inside);
    }

    #[test]
    fn delete_file() {
        let tmpdir = testdir();
        let root = tmpdir.path().canonicalize().expect("canonicalize");
        let file = root.join("file");
        std::fs::write(&file, "").expect("write");

        let (observer, mut rx) = observer_channel(ObserverKind::Inotify);
        observer
            .schedule(rx.handler(), &root, RecursiveMode::NonRecursive)
            .unwrap();
        observer.start().unwrap();

        std::fs::remove_file(&file).expect("remove");

        let event = rx.recv_where(|e| e.kind == EventKind::Deleted);
        assert_eq!(event.path(), file);
    }

    #[test]
    fn delete_watched_file_root() {
        let tmpdir = testdir();
        let root = tmpdir.path().canonicalize().expect("canonicalize");
        let file = root.join("file");
        std::fs::write(&file, "").expect("write");

        let (observer, mut rx) = observer_channel(ObserverKind::Inotify);
        observer
            .schedule(rx.handler(), &file, RecursiveMode::NonRecursive)
            .unwrap();
        observer.start().unwrap();

        std::fs::remove_file(&file).expect("remove");

        let event = rx.recv_where(|e| e.kind == EventKind::Deleted);
        assert_eq!(event.path(), file);
    }

    #[test]
    fn new_subdirectories_are_tracked_under_a_recursive_watch() {
        let tmpdir = testdir();
        let root = tmpdir.path().canonicalize().expect("canonicalize");
        let (observer, mut rx) = observer_channel(ObserverKind::Inotify);
        observer
            .schedule(rx.handler(), &root, RecursiveMode::Recursive)
            .unwrap();
        observer.start().unwrap();

        let subdir = root.join("subdir");
        std::fs::create_dir(&subdir).expect("create subdir");
        let created = rx.recv_where(|e| e.kind == EventKind::Created);
        assert!(created.is_directory);

        // Give the loop a moment to register the new directory.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let file = subdir.join("file");
        std::fs::write(&file, b"1").expect("write");
        let event = rx.recv_where(|e| e.kind == EventKind::Created);
        assert_eq!(event.path(), file);
    }

    #[test]
    fn unschedule_stops_delivery() {
        let tmpdir = testdir();
        let (observer, mut rx) = observer_channel(ObserverKind::Inotify);
        let watch = observer
            .schedule(rx.handler(), tmpdir.path(), RecursiveMode::Recursive)
            .unwrap();
        observer.start().unwrap();

        observer.unschedule(&watch).unwrap();

        std::fs::write(tmpdir.path().join("entry"), b"1").expect("write");
        rx.assert_quiet(std::time::Duration::from_millis(200));
    }

    #[test]
    fn stop_within_the_grace_period_invokes_no_handlers() {
        let tmpdir = testdir();
        let (observer, rx) = observer_channel(ObserverKind::Inotify);
        observer.start().unwrap();
        observer
            .schedule(rx.handler(), tmpdir.path(), RecursiveMode::Recursive)
            .unwrap();
        let started = std::time::Instant::now();
        observer.stop().unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(rx.is_empty());
    }
}
