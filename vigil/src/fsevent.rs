//! Backend for Darwin's FSEvents API.
//!
//! FSEvents delivers batched per-path flag masks on a run-loop thread that
//! the system manages. A single mask can coalesce several changes; it is
//! expanded into uniform events in a fixed order (delete, move, create,
//! modify). Renames carry no correlation cookie, but the two halves of one
//! rename arrive as consecutive records with adjacent event ids, which is
//! what the pairing state below keys on.
//!
//! Non-recursive watches are synthesized: the stream always observes the
//! whole tree under each root, and records deeper than one level are
//! filtered out before they reach the queue.

#![allow(non_upper_case_globals)]

use objc2_core_foundation as cf;
use objc2_core_services as fs;
use std::collections::HashMap;
use std::ffi::CStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::Mutex;
use std::thread;

use crate::observer::{Backend, EventSink, ObservedWatch, PumpGuard, WatchId};
use crate::{Config, Error, Event, EventKind, Result};

bitflags::bitflags! {
  #[repr(C)]
  #[derive(Debug, Clone, Copy)]
  struct StreamFlags: u32 {
    const NONE = fs::kFSEventStreamEventFlagNone;
    const MUST_SCAN_SUBDIRS = fs::kFSEventStreamEventFlagMustScanSubDirs;
    const USER_DROPPED = fs::kFSEventStreamEventFlagUserDropped;
    const KERNEL_DROPPED = fs::kFSEventStreamEventFlagKernelDropped;
    const IDS_WRAPPED = fs::kFSEventStreamEventFlagEventIdsWrapped;
    const HISTORY_DONE = fs::kFSEventStreamEventFlagHistoryDone;
    const ROOT_CHANGED = fs::kFSEventStreamEventFlagRootChanged;
    const MOUNT = fs::kFSEventStreamEventFlagMount;
    const UNMOUNT = fs::kFSEventStreamEventFlagUnmount;
    const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
    const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
    const INODE_META_MOD = fs::kFSEventStreamEventFlagItemInodeMetaMod;
    const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
    const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
    const FINDER_INFO_MOD = fs::kFSEventStreamEventFlagItemFinderInfoMod;
    const ITEM_CHANGE_OWNER = fs::kFSEventStreamEventFlagItemChangeOwner;
    const ITEM_XATTR_MOD = fs::kFSEventStreamEventFlagItemXattrMod;
    const IS_FILE = fs::kFSEventStreamEventFlagItemIsFile;
    const IS_DIR = fs::kFSEventStreamEventFlagItemIsDir;
    const IS_SYMLINK = fs::kFSEventStreamEventFlagItemIsSymlink;
    const OWN_EVENT = fs::kFSEventStreamEventFlagOwnEvent;
    const IS_HARDLINK = fs::kFSEventStreamEventFlagItemIsHardlink;
    const IS_LAST_HARDLINK = fs::kFSEventStreamEventFlagItemIsLastHardlink;
    const ITEM_CLONED = fs::kFSEventStreamEventFlagItemCloned;
  }
}

/// The unmatched `renamed` half waiting for its sibling record.
#[derive(Default)]
struct RenamePairing {
    pending: Option<(fs::FSEventStreamEventId, PathBuf, bool)>,
}

impl RenamePairing {
    /// Feeds one `renamed` record; `existing` tells which half it is.
    fn feed(
        &mut self,
        event_id: fs::FSEventStreamEventId,
        path: PathBuf,
        is_dir: bool,
        existing: bool,
        out: &mut Vec<Event>,
    ) {
        if let Some((from_id, from_path, from_dir)) = self.pending.take() {
            if existing && event_id == from_id.wrapping_add(1) && from_path != path {
                out.push(Event::moved(from_path, path).set_directory(is_dir));
                return;
            }
            // Not the sibling record; the held half left the observed scope.
            out.push(Event::new(EventKind::Deleted, from_path).set_directory(from_dir));
        }
        if existing {
            // A rename target with no known source: something moved in.
            out.push(Event::new(EventKind::Created, path).set_directory(is_dir));
        } else {
            self.pending = Some((event_id, path, is_dir));
        }
    }

    /// Resolves a half still pending at the end of a callback batch.
    fn flush(&mut self, out: &mut Vec<Event>) {
        if let Some((_, path, is_dir)) = self.pending.take() {
            out.push(Event::new(EventKind::Deleted, path).set_directory(is_dir));
        }
    }
}

/// Expands one coalesced flag mask into uniform events, in the fixed order
/// delete, move (handled by the pairing state), create, modify.
fn expand_flags(
    flags: StreamFlags,
    event_id: fs::FSEventStreamEventId,
    path: &Path,
    pairing: &mut RenamePairing,
    out: &mut Vec<Event>,
) {
    // Sentinel closing the "historical" portion of a stream created with a
    // sinceWhen value; carries no filesystem change.
    if flags.contains(StreamFlags::HISTORY_DONE) {
        return;
    }

    let is_dir = flags.contains(StreamFlags::IS_DIR);

    if flags.contains(StreamFlags::UNMOUNT) {
        out.push(Event::new(EventKind::Deleted, path).into_directory());
    }

    if flags.contains(StreamFlags::ROOT_CHANGED) {
        // The watched root itself was renamed or removed; either way it is
        // no longer at the observed path.
        out.push(Event::new(EventKind::Deleted, path).into_directory());
    }

    if flags.contains(StreamFlags::ITEM_REMOVED) {
        out.push(Event::new(EventKind::Deleted, path).set_directory(is_dir));
    }

    if flags.contains(StreamFlags::ITEM_RENAMED) {
        pairing.feed(event_id, path.to_owned(), is_dir, path.exists(), out);
    }

    if flags.contains(StreamFlags::MOUNT) {
        out.push(Event::new(EventKind::Created, path).into_directory());
    }

    if flags.contains(StreamFlags::ITEM_CREATED) && !flags.contains(StreamFlags::ITEM_RENAMED) {
        out.push(Event::new(EventKind::Created, path).set_directory(is_dir));
    }

    if flags.intersects(
        StreamFlags::ITEM_MODIFIED
            | StreamFlags::INODE_META_MOD
            | StreamFlags::FINDER_INFO_MOD
            | StreamFlags::ITEM_CHANGE_OWNER
            | StreamFlags::ITEM_XATTR_MOD,
    ) {
        out.push(Event::new(EventKind::Modified, path).set_directory(is_dir));
    }
}

struct StreamContextInfo {
    sink: EventSink,
    /// Watch roots with their owner and recursion flag, keys canonical.
    recursive_info: HashMap<PathBuf, (WatchId, bool)>,
    pairing: Mutex<RenamePairing>,
}

// Free the context when the stream created by `FSEventStreamCreate` is
// released.
unsafe extern "C-unwind" fn release_context(info: *const libc::c_void) {
    // Safety: `release` is called exactly once, when the stream is
    // deallocated, so the box can be reclaimed here.
    unsafe {
        drop(Box::from_raw(
            info as *const StreamContextInfo as *mut StreamContextInfo,
        ));
    }
}

/// FSEvents-based `Backend` implementation.
pub(crate) struct FsEventBackend {
    paths: cf::CFRetained<cf::CFMutableArray<cf::CFString>>,
    since_when: fs::FSEventStreamEventId,
    latency: cf::CFTimeInterval,
    flags: fs::FSEventStreamCreateFlags,
    sink: EventSink,
    runloop: Option<(cf::CFRetained<cf::CFRunLoop>, thread::JoinHandle<()>)>,
    recursive_info: HashMap<PathBuf, (WatchId, bool)>,
    pump_guard: Option<PumpGuard>,
}

impl fmt::Debug for FsEventBackend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FsEventBackend")
            .field("since_when", &self.since_when)
            .field("latency", &self.latency)
            .field("recursive_info", &self.recursive_info)
            .finish()
    }
}

// The CF pointers are only touched from methods taking `&mut self`, and the
// run-loop thread owns its own retained references.
unsafe impl Send for FsEventBackend {}

impl FsEventBackend {
    pub(crate) fn new(sink: EventSink, guard: PumpGuard, config: &Config) -> Result<Self> {
        Ok(FsEventBackend {
            paths: cf::CFMutableArray::empty(),
            since_when: fs::kFSEventStreamEventIdSinceNow,
            latency: config.stream_latency().as_secs_f64(),
            flags: fs::kFSEventStreamCreateFlagFileEvents | fs::kFSEventStreamCreateFlagNoDefer,
            sink,
            runloop: None,
            recursive_info: HashMap::new(),
            pump_guard: Some(guard),
        })
    }

    #[inline]
    fn is_running(&self) -> bool {
        self.runloop.is_some()
    }

    fn stop(&mut self) {
        if !self.is_running() {
            return;
        }

        if let Some((runloop, thread_handle)) = self.runloop.take() {
            while !runloop.is_waiting() {
                thread::yield_now();
            }

            runloop.stop();

            // Wait for the run-loop thread to shut down.
            let _ = thread_handle.join();
        }
    }

    fn append_path(&mut self, path: &Path, owner: WatchId, recursive: bool) -> Result<()> {
        if !path.exists() {
            return Err(Error::path_does_not_exist().add_path(path.into()));
        }
        let canonical_path = path.to_path_buf().canonicalize().map_err(Error::io_watch)?;
        let mut err: *mut cf::CFError = ptr::null_mut();
        let Some(cf_path) = (unsafe { path_to_cfstring_ref(path, &mut err) }) else {
            if let Some(err) = NonNull::new(err) {
                let _ = unsafe { cf::CFRetained::from_raw(err) };
            }
            // Most likely the directory was deleted, or permissions changed,
            // while the above code was running.
            return Err(Error::path_does_not_exist().add_path(path.into()));
        };
        self.paths.append(&cf_path);

        self.recursive_info.insert(canonical_path, (owner, recursive));
        Ok(())
    }

    fn remove_path(&mut self, path: &Path) -> Result<()> {
        let mut err: *mut cf::CFError = ptr::null_mut();
        let Some(cf_path) = (unsafe { path_to_cfstring_ref(path, &mut err) }) else {
            if let Some(err) = NonNull::new(err) {
                let _ = unsafe { cf::CFRetained::from_raw(err) };
            }
            return Err(Error::watch_not_found().add_path(path.into()));
        };

        let mut to_remove = Vec::new();
        for (idx, item) in self.paths.iter().enumerate() {
            if item.compare(
                Some(&cf_path),
                cf::CFStringCompareFlags::CompareCaseInsensitive,
            ) == cf::CFComparisonResult::CompareEqualTo
            {
                to_remove.push(idx as cf::CFIndex);
            }
        }

        for idx in to_remove.iter().rev() {
            unsafe {
                cf::CFMutableArray::remove_value_at_index(Some(self.paths.as_opaque()), *idx)
            };
        }

        let p = if let Ok(canonicalized_path) = path.canonicalize() {
            canonicalized_path
        } else {
            path.to_owned()
        };
        match self.recursive_info.remove(&p) {
            Some(_) => Ok(()),
            None => Err(Error::watch_not_found()),
        }
    }

    fn run(&mut self) -> Result<()> {
        if self.paths.is_empty() {
            return Ok(());
        }

        // The context is owned by the stream and freed by `release_context`
        // when the stream is released.
        let context = Box::into_raw(Box::new(StreamContextInfo {
            sink: self.sink.clone(),
            recursive_info: self.recursive_info.clone(),
            pairing: Mutex::new(RenamePairing::default()),
        }));

        let stream_context = fs::FSEventStreamContext {
            version: 0,
            info: context as *mut libc::c_void,
            retain: None,
            release: Some(release_context),
            copyDescription: None,
        };

        let stream = unsafe {
            fs::FSEventStreamCreate(
                cf::kCFAllocatorDefault,
                Some(callback),
                &stream_context as *const _ as *mut _,
                self.paths.as_opaque(),
                self.since_when,
                self.latency,
                self.flags,
            )
        };

        // Wrapper to help send CFRunLoop types across threads.
        struct CFRunLoopSendWrapper(cf::CFRetained<cf::CFRunLoop>);

        // Safety: Apple documents CFRunLoop as safe to move across threads.
        unsafe impl Send for CFRunLoopSendWrapper {}

        // Wrapper to help send FSEventStreamRef types across threads.
        struct FSEventStreamSendWrapper(fs::FSEventStreamRef);

        // Safety: the stream is only used from the run-loop thread after
        // this send.
        unsafe impl Send for FSEventStreamSendWrapper {}

        let stream = FSEventStreamSendWrapper(stream);

        let (rl_tx, rl_rx) = crossbeam_channel::bounded(1);

        let thread_handle = thread::Builder::new()
            .name("vigil fsevents loop".to_string())
            .spawn(move || {
                let _ = &stream;
                let stream = stream.0;

                unsafe {
                    let cur_runloop = cf::CFRunLoop::current().expect("current runloop");

                    #[allow(deprecated)]
                    fs::FSEventStreamScheduleWithRunLoop(
                        stream,
                        &cur_runloop,
                        cf::kCFRunLoopDefaultMode.expect("default runloop mode"),
                    );
                    if !fs::FSEventStreamStart(stream) {
                        fs::FSEventStreamInvalidate(stream);
                        fs::FSEventStreamRelease(stream);
                        rl_tx
                            .send(Err(Error::generic("unable to start FSEvent stream")))
                            .expect("send FSEventStreamStart error");
                        return;
                    }

                    // CFRunLoopRun returns once stop() calls CFRunLoopStop.
                    rl_tx
                        .send(Ok(CFRunLoopSendWrapper(cur_runloop)))
                        .expect("send runloop to backend");

                    cf::CFRunLoop::run();
                    fs::FSEventStreamStop(stream);
                    // Even after a stream is stopped its callback can still
                    // fire for pending events; purging prevents that.
                    let event_id = fs::FSEventsGetCurrentEventId();
                    let device = fs::FSEventStreamGetDeviceBeingWatched(stream);
                    fs::FSEventsPurgeEventsForDeviceUpToEventId(device, event_id);
                    fs::FSEventStreamInvalidate(stream);
                    fs::FSEventStreamRelease(stream);
                }
            })
            .map_err(Error::io)?;

        // Block until the run loop has been sent back.
        let runloop_wrapper = rl_rx.recv()??;
        self.runloop = Some((runloop_wrapper.0, thread_handle));

        Ok(())
    }
}

unsafe extern "C-unwind" fn callback(
    stream_ref: fs::ConstFSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,                          // size_t numEvents
    event_paths: NonNull<libc::c_void>,                // void *eventPaths
    event_flags: NonNull<fs::FSEventStreamEventFlags>, // const FSEventStreamEventFlags eventFlags[]
    event_ids: NonNull<fs::FSEventStreamEventId>,      // const FSEventStreamEventId eventIds[]
) {
    unsafe {
        callback_impl(
            stream_ref,
            info,
            num_events,
            event_paths,
            event_flags,
            event_ids,
        )
    }
}

unsafe fn callback_impl(
    _stream_ref: fs::ConstFSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,
    event_paths: NonNull<libc::c_void>,
    event_flags: NonNull<fs::FSEventStreamEventFlags>,
    event_ids: NonNull<fs::FSEventStreamEventId>,
) {
    let event_paths = event_paths.as_ptr() as *const *const libc::c_char;
    let info = info as *const StreamContextInfo;
    let sink = &(*info).sink;

    let mut pairing = (*info)
        .pairing
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    for p in 0..num_events {
        let Ok(path) = CStr::from_ptr(*event_paths.add(p)).to_str() else {
            log::warn!("FSEvents delivered a non-UTF-8 path; skipping");
            continue;
        };
        let path = PathBuf::from(path);

        let raw_flag = *event_flags.as_ptr().add(p);
        let flag = StreamFlags::from_bits_truncate(raw_flag);
        let event_id = *event_ids.as_ptr().add(p);

        if flag.contains(StreamFlags::MUST_SCAN_SUBDIRS) {
            // The kernel or the client dropped events under this path.
            sink.overflow();
        }

        // Match the record against a watch root, honouring synthesized
        // non-recursive watches by depth-filtering.
        let mut owner = None;
        for (root, (id, recursive)) in &(*info).recursive_info {
            if path.starts_with(root) {
                if *recursive || &path == root {
                    owner = Some(*id);
                    break;
                } else if path.parent() == Some(root) {
                    owner = Some(*id);
                    break;
                }
            }
        }
        let Some(owner) = owner else {
            continue;
        };

        log::trace!("FSEvent: path = `{}`, flag = {flag:?}", path.display());

        let mut out = Vec::new();
        expand_flags(flag, event_id, &path, &mut pairing, &mut out);
        for event in out {
            sink.send(owner, event);
        }
    }

    // A pending rename half whose sibling was not in this batch will not
    // find it later; resolve it now.
    let mut out = Vec::new();
    pairing.flush(&mut out);
    for event in out {
        sink.send(WatchId::UNATTRIBUTED, event);
    }
}

impl Backend for FsEventBackend {
    fn add_watch(&mut self, watch: &ObservedWatch) -> Result<()> {
        self.stop();
        let result = self.append_path(watch.path(), watch.id(), watch.recursive());
        self.run()?;
        result
    }

    fn remove_watch(&mut self, watch: &ObservedWatch) -> Result<()> {
        self.stop();
        let result = self.remove_path(watch.path());
        self.run()?;
        result
    }

    fn shutdown(&mut self) {
        self.stop();
        self.pump_guard.take();
    }
}

impl Drop for FsEventBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Converts a path that may no longer exist into a `CFString`, resolving
/// whatever prefix of it is still reachable.
unsafe fn path_to_cfstring_ref(
    source: &Path,
    err: &mut *mut cf::CFError,
) -> Option<cf::CFRetained<cf::CFString>> {
    let url = cf::CFURL::from_file_path(source)?;

    let mut placeholder = url.absolute_url()?;

    let imaginary = cf::CFMutableArray::empty();

    while !unsafe { placeholder.resource_is_reachable(err) } {
        if let Some(child) = placeholder.last_path_component() {
            imaginary.insert(0, &*child);
        }

        placeholder = cf::CFURL::new_copy_deleting_last_path_component(None, Some(&placeholder))?;
    }

    let url = unsafe { cf::CFURL::new_file_reference_url(None, Some(&placeholder), err) }?;

    let mut placeholder = unsafe { cf::CFURL::new_file_path_url(None, Some(&url), err) }?;

    if !imaginary.is_empty() {
        for part in imaginary.iter() {
            placeholder = cf::CFURL::new_copy_appending_path_component(
                None,
                Some(&placeholder),
                Some(&part),
                false,
            )?;
        }
    }

    placeholder.string()
}
