//! Backend for Windows' directory management APIs.
//!
//! One overlapped `ReadDirectoryChangesW` request is kept in flight per
//! watched directory; completion routines decode the variable-length record
//! buffer and immediately re-issue the read. A rename arrives as a
//! `RENAMED_OLD_NAME` record followed by its `RENAMED_NEW_NAME` in the same
//! buffer; the two are paired into one `Moved` event, and a mismatch
//! degrades into independent deletion and creation. A zero-length
//! completion means the kernel's buffer overflowed and events were lost.
//!
//! Single files are watched by observing the parent directory and filtering
//! the decoded records to the exact path.
//!
//! For more information see the [ReadDirectoryChangesW reference][ref1]
//! and the [ReadDirectoryChangesExW reference][ref2].
//!
//! [ref1]: https://learn.microsoft.com/en-us/windows/win32/api/winbase/nf-winbase-readdirectorychangesw
//! [ref2]: https://learn.microsoft.com/en-us/windows/win32/api/winbase/nf-winbase-readdirectorychangesexw

use std::alloc;
use std::collections::HashMap;
use std::ffi::OsString;
use std::os::raw::c_void;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;
use std::ptr;
use std::slice;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_OPERATION_ABORTED, ERROR_SUCCESS, HANDLE, HMODULE,
    INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesExW, ReadDirectoryChangesW,
    ReadDirectoryNotifyExtendedInformation, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_ATTRIBUTE_DIRECTORY, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED,
    FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_DIR_NAME,
    FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY,
    FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_EXTENDED_INFORMATION, FILE_NOTIFY_INFORMATION,
    FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows_sys::Win32::System::Threading::{
    CreateSemaphoreW, ReleaseSemaphore, WaitForSingleObjectEx, INFINITE,
};
use windows_sys::Win32::System::IO::{CancelIo, OVERLAPPED};

use crate::observer::{Backend, EventSink, ObservedWatch, PumpGuard, WatchId};
use crate::{Config, Error, Event, EventKind, Result};

const BUF_SIZE: u32 = 16384;

#[derive(Clone, Copy)]
enum DirectoryReaderKind {
    Standard,
    Extended,
}

#[derive(Clone)]
struct ReadData {
    dir: PathBuf,          // directory that is being watched
    file: Option<PathBuf>, // if a file is being watched, this is its full path
    owner: WatchId,
    directory_reader: DirectoryReaderKind,
    complete_sem: HANDLE,
    is_recursive: bool,
}

struct ReadDirectoryRequest {
    sink: EventSink,
    buffer: [u8; BUF_SIZE as usize],
    handle: HANDLE,
    data: ReadData,
    action_tx: Sender<Action>,
}

impl ReadDirectoryRequest {
    fn unwatch(&self) {
        let _ = self.action_tx.send(Action::Unwatch(self.data.dir.clone()));
    }
}

enum Action {
    Watch(ObservedWatch, Sender<Result<()>>),
    Unwatch(PathBuf),
    Stop,
}

struct WatchState {
    dir_handle: HANDLE,
    complete_sem: HANDLE,
}

struct ReadDirectoryChangesServer {
    tx: Sender<Action>,
    rx: Receiver<Action>,
    sink: EventSink,
    watches: HashMap<PathBuf, WatchState>,
    reader_kind: DirectoryReaderKind,
    wakeup_sem: HANDLE,
}

impl ReadDirectoryChangesServer {
    fn start(sink: EventSink, guard: PumpGuard, wakeup_sem: HANDLE) -> Sender<Action> {
        let (action_tx, action_rx) = unbounded();
        // it is, in fact, ok to send the semaphore across threads
        let sem_temp = wakeup_sem as u64;
        let _ = thread::Builder::new()
            .name("vigil windows loop".to_string())
            .spawn({
                let tx = action_tx.clone();
                move || {
                    let _guard = guard;
                    let wakeup_sem = sem_temp as HANDLE;
                    let server = ReadDirectoryChangesServer {
                        tx,
                        rx: action_rx,
                        sink,
                        watches: HashMap::new(),
                        reader_kind: available_directory_reader_kind(),
                        wakeup_sem,
                    };
                    server.run();
                }
            });
        action_tx
    }

    fn run(mut self) {
        loop {
            // Process all available actions first.
            let mut stopped = false;

            while let Ok(action) = self.rx.try_recv() {
                match action {
                    Action::Watch(watch, tx) => {
                        let _ = tx.send(self.add_watch(&watch));
                    }
                    Action::Unwatch(path) => self.remove_watch(path),
                    Action::Stop => {
                        stopped = true;
                        for ws in self.watches.values() {
                            stop_watch(ws);
                        }
                        break;
                    }
                }
            }

            if stopped {
                break;
            }

            unsafe {
                // Wait with the alertable flag so completion routines fire.
                let waitres = WaitForSingleObjectEx(self.wakeup_sem, 100, 1);
                if waitres == WAIT_OBJECT_0 {
                    // Woken explicitly; loop around for actions.
                }
            }
        }

        // The facade may already be gone; the semaphore is cleaned up here.
        unsafe {
            CloseHandle(self.wakeup_sem);
        }
    }

    fn add_watch(&mut self, watch: &ObservedWatch) -> Result<()> {
        let path = watch.path().to_owned();
        // The path must exist and be either a file or a directory.
        if !path.is_dir() && !path.is_file() {
            return Err(Error::path_does_not_exist().add_path(path));
        }

        let (watching_file, dir_target) = {
            if path.is_dir() {
                (false, path.clone())
            } else {
                // Watch single files through their parent directory.
                (true, path.parent().unwrap().to_path_buf())
            }
        };

        let encoded_path: Vec<u16> = dir_target
            .as_os_str()
            .encode_wide()
            .chain(Some(0))
            .collect();
        let handle;
        unsafe {
            handle = CreateFileW(
                encoded_path.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_DELETE | FILE_SHARE_WRITE,
                ptr::null_mut(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            );

            if handle == INVALID_HANDLE_VALUE {
                return Err(if watching_file {
                    Error::generic(
                        "You attempted to watch a single file, but parent \
                         directory could not be opened.",
                    )
                    .add_path(path)
                } else {
                    Error::io(std::io::Error::last_os_error()).add_path(path)
                });
            }
        }
        let wf = if watching_file { Some(path.clone()) } else { None };
        // Every watch gets its own semaphore to signal in-flight-read
        // completion on teardown.
        let semaphore = unsafe { CreateSemaphoreW(ptr::null_mut(), 0, 1, ptr::null_mut()) };
        if semaphore.is_null() || semaphore == INVALID_HANDLE_VALUE {
            unsafe {
                CloseHandle(handle);
            }
            return Err(Error::generic("Failed to create semaphore for watch.").add_path(path));
        }
        let rd = ReadData {
            dir: dir_target,
            file: wf,
            owner: watch.id(),
            directory_reader: self.reader_kind,
            complete_sem: semaphore,
            is_recursive: watch.recursive(),
        };
        let ws = WatchState {
            dir_handle: handle,
            complete_sem: semaphore,
        };
        self.watches.insert(path, ws);
        start_read(&rd, self.sink.clone(), handle, self.tx.clone());
        Ok(())
    }

    fn remove_watch(&mut self, path: PathBuf) {
        if let Some(ws) = self.watches.remove(&path) {
            stop_watch(&ws);
        }
    }
}

fn stop_watch(ws: &WatchState) {
    unsafe {
        let cio = CancelIo(ws.dir_handle);
        let ch = CloseHandle(ws.dir_handle);
        // Wait for the in-flight read, otherwise its request allocation
        // leaks.
        if cio != 0 && ch != 0 {
            while WaitForSingleObjectEx(ws.complete_sem, INFINITE, 1) != WAIT_OBJECT_0 {
                // Drain the APC queue until the completion routine has run.
            }
        }
        CloseHandle(ws.complete_sem);
    }
}

fn available_directory_reader_kind() -> DirectoryReaderKind {
    unsafe {
        let module: HMODULE = GetModuleHandleW(windows_sys::w!("kernel32.dll"));
        if module.is_null() {
            return DirectoryReaderKind::Standard;
        }

        let func_ptr = GetProcAddress(module, windows_sys::s!("ReadDirectoryChangesExW"));
        if func_ptr.is_some() {
            DirectoryReaderKind::Extended
        } else {
            DirectoryReaderKind::Standard
        }
    }
}

fn start_read(rd: &ReadData, sink: EventSink, handle: HANDLE, action_tx: Sender<Action>) {
    let request = Box::new(ReadDirectoryRequest {
        sink,
        handle,
        buffer: [0u8; BUF_SIZE as usize],
        data: rd.clone(),
        action_tx,
    });

    let flags = FILE_NOTIFY_CHANGE_FILE_NAME
        | FILE_NOTIFY_CHANGE_DIR_NAME
        | FILE_NOTIFY_CHANGE_ATTRIBUTES
        | FILE_NOTIFY_CHANGE_SIZE
        | FILE_NOTIFY_CHANGE_LAST_WRITE
        | FILE_NOTIFY_CHANGE_SECURITY;

    let monitor_subdir = if request.data.file.is_none() && request.data.is_recursive {
        1
    } else {
        0
    };

    unsafe {
        let overlapped = alloc::alloc_zeroed(alloc::Layout::new::<OVERLAPPED>()) as *mut OVERLAPPED;
        // With completion-routine based requests the hEvent member is free
        // for application use.
        let request = Box::leak(request);
        (*overlapped).hEvent = request as *mut _ as _;

        let ret = match rd.directory_reader {
            DirectoryReaderKind::Extended => ReadDirectoryChangesExW(
                handle,
                request.buffer.as_mut_ptr() as *mut c_void,
                BUF_SIZE,
                monitor_subdir,
                flags,
                &mut 0u32 as *mut u32, // not used for async requests
                overlapped,
                Some(handle_extended_event),
                ReadDirectoryNotifyExtendedInformation,
            ),
            DirectoryReaderKind::Standard => ReadDirectoryChangesW(
                handle,
                request.buffer.as_mut_ptr() as *mut c_void,
                BUF_SIZE,
                monitor_subdir,
                flags,
                &mut 0u32 as *mut u32, // not used for async requests
                overlapped,
                Some(handle_event),
            ),
        };

        if ret == 0 {
            // The read failed synchronously: ownership of the allocations
            // was never passed to the kernel, so reclaim and drop them.
            let _overlapped = Box::from_raw(overlapped);
            let request = Box::from_raw(request);
            ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
        }
    }
}

/// Checks a completion and either recovers the request for another read or
/// tears it down. Returns the request when decoding should proceed.
unsafe fn begin_completion(
    error_code: u32,
    overlapped: *mut OVERLAPPED,
) -> Option<Box<ReadDirectoryRequest>> {
    let overlapped: Box<OVERLAPPED> = Box::from_raw(overlapped);
    let request: Box<ReadDirectoryRequest> = Box::from_raw(overlapped.hEvent as *mut _);

    match error_code {
        ERROR_OPERATION_ABORTED => {
            // The directory was unwatched or the server is shutting down;
            // drop-clean the allocations and signal the waiter.
            ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
            None
        }
        ERROR_ACCESS_DENIED => {
            // Raised when the watched directory itself was deleted or
            // trashed; verify before treating it as fatal for the watch.
            if !request.data.dir.exists() {
                request.unwatch();
                ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
                None
            } else {
                Some(request)
            }
        }
        ERROR_SUCCESS => Some(request),
        _ => {
            log::error!(
                "unknown error in directory-change read for {}: {}",
                request.data.dir.display(),
                error_code
            );
            request.unwatch();
            ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
            None
        }
    }
}

/// Translates one decoded record into events, pairing renames.
///
/// A `RENAMED_OLD_NAME` is held until the `RENAMED_NEW_NAME` that follows
/// it in the same buffer; a mismatch on either side degrades into the two
/// independent halves.
fn handle_action(
    action: u32,
    path: PathBuf,
    is_dir: bool,
    pending_rename: &mut Option<(PathBuf, bool)>,
    emit: &mut impl FnMut(Event),
) {
    if action != FILE_ACTION_RENAMED_NEW_NAME {
        if let Some((old_path, old_is_dir)) = pending_rename.take() {
            emit(Event::new(EventKind::Deleted, old_path).set_directory(old_is_dir));
        }
    }

    match action {
        FILE_ACTION_RENAMED_OLD_NAME => {
            *pending_rename = Some((path, is_dir));
        }
        FILE_ACTION_RENAMED_NEW_NAME => match pending_rename.take() {
            Some((old_path, _)) if old_path != path => {
                emit(Event::moved(old_path, path).set_directory(is_dir));
            }
            Some(_) => {
                // A rename that did not change the path; report the entry
                // as modified rather than fabricating a degenerate move.
                emit(Event::new(EventKind::Modified, path).set_directory(is_dir));
            }
            None => {
                emit(Event::new(EventKind::Created, path).set_directory(is_dir));
            }
        },
        FILE_ACTION_ADDED => {
            emit(Event::new(EventKind::Created, path).set_directory(is_dir));
        }
        FILE_ACTION_REMOVED => {
            emit(Event::new(EventKind::Deleted, path).set_directory(is_dir));
        }
        FILE_ACTION_MODIFIED => {
            emit(Event::new(EventKind::Modified, path).set_directory(is_dir));
        }
        _ => {}
    }
}

fn finish_buffer(pending_rename: &mut Option<(PathBuf, bool)>, emit: &mut impl FnMut(Event)) {
    // An old-name record whose new name never followed: the entry moved
    // somewhere this watch cannot see.
    if let Some((old_path, old_is_dir)) = pending_rename.take() {
        emit(Event::new(EventKind::Deleted, old_path).set_directory(old_is_dir));
    }
}

unsafe extern "system" fn handle_extended_event(
    error_code: u32,
    bytes_written: u32,
    overlapped: *mut OVERLAPPED,
) {
    let Some(request) = begin_completion(error_code, overlapped) else {
        return;
    };

    // Queue the next request as soon as possible.
    start_read(
        &request.data,
        request.sink.clone(),
        request.handle,
        request.action_tx.clone(),
    );

    // A zero-length completion means the kernel buffer overflowed and the
    // change list was discarded.
    if bytes_written == 0 {
        request.sink.overflow();
        return;
    }

    let owner = request.data.owner;
    let mut pending_rename: Option<(PathBuf, bool)> = None;
    let mut emit = |event: Event| request.sink.send(owner, event);

    // FILE_NOTIFY_EXTENDED_INFORMATION records are variable-length; each
    // carries the offset of the next. Wine packs them on 16-bit boundaries
    // rather than the required 32-bit ones, hence `read_unaligned`.
    let mut cur_offset: *const u8 = request.buffer.as_ptr();
    let mut cur_entry = ptr::read_unaligned(cur_offset as *const FILE_NOTIFY_EXTENDED_INFORMATION);
    loop {
        // The filename length is in bytes, so / 2.
        let len = cur_entry.FileNameLength as usize / 2;
        let encoded_path: &[u16] = slice::from_raw_parts(
            cur_offset
                .offset(std::mem::offset_of!(FILE_NOTIFY_EXTENDED_INFORMATION, FileName) as isize)
                as _,
            len,
        );
        // Prepend the root to get a full path.
        let path = request
            .data
            .dir
            .join(PathBuf::from(OsString::from_wide(encoded_path)));

        // When watching a single file, ignore records about its siblings.
        let skip = match request.data.file {
            None => false,
            Some(ref watch_path) => *watch_path != path,
        };

        if !skip {
            log::trace!(
                "windows event: path = `{}`, action = {:?}",
                path.display(),
                cur_entry.Action
            );
            let is_dir = (cur_entry.FileAttributes & FILE_ATTRIBUTE_DIRECTORY) != 0;
            handle_action(cur_entry.Action, path, is_dir, &mut pending_rename, &mut emit);
        }

        if cur_entry.NextEntryOffset == 0 {
            break;
        }
        cur_offset = cur_offset.offset(cur_entry.NextEntryOffset as isize);
        cur_entry = ptr::read_unaligned(cur_offset as *const FILE_NOTIFY_EXTENDED_INFORMATION);
    }

    finish_buffer(&mut pending_rename, &mut emit);
}

unsafe extern "system" fn handle_event(
    error_code: u32,
    bytes_written: u32,
    overlapped: *mut OVERLAPPED,
) {
    let Some(request) = begin_completion(error_code, overlapped) else {
        return;
    };

    // Queue the next request as soon as possible.
    start_read(
        &request.data,
        request.sink.clone(),
        request.handle,
        request.action_tx.clone(),
    );

    if bytes_written == 0 {
        request.sink.overflow();
        return;
    }

    let owner = request.data.owner;
    let mut pending_rename: Option<(PathBuf, bool)> = None;
    let mut emit = |event: Event| request.sink.send(owner, event);

    // FILE_NOTIFY_INFORMATION records are variable-length; each carries the
    // offset of the next. Wine packs them on 16-bit boundaries rather than
    // the required 32-bit ones, hence `read_unaligned`.
    let mut cur_offset: *const u8 = request.buffer.as_ptr();
    let mut cur_entry = ptr::read_unaligned(cur_offset as *const FILE_NOTIFY_INFORMATION);
    loop {
        let len = cur_entry.FileNameLength as usize / 2;
        let encoded_path: &[u16] = slice::from_raw_parts(
            cur_offset.offset(std::mem::offset_of!(FILE_NOTIFY_INFORMATION, FileName) as isize)
                as _,
            len,
        );
        let path = request
            .data
            .dir
            .join(PathBuf::from(OsString::from_wide(encoded_path)));

        let skip = match request.data.file {
            None => false,
            Some(ref watch_path) => *watch_path != path,
        };

        if !skip {
            log::trace!(
                "windows event: path = `{}`, action = {:?}",
                path.display(),
                cur_entry.Action
            );
            // The basic record form carries no attributes; a best-effort
            // stat answers for entries that still exist.
            let is_dir = path.is_dir();
            handle_action(cur_entry.Action, path, is_dir, &mut pending_rename, &mut emit);
        }

        if cur_entry.NextEntryOffset == 0 {
            break;
        }
        cur_offset = cur_offset.offset(cur_entry.NextEntryOffset as isize);
        cur_entry = ptr::read_unaligned(cur_offset as *const FILE_NOTIFY_INFORMATION);
    }

    finish_buffer(&mut pending_rename, &mut emit);
}

/// ReadDirectoryChangesW-based `Backend` implementation.
pub(crate) struct ReadDirectoryChangesBackend {
    tx: Sender<Action>,
    wakeup_sem: HANDLE,
}

// Not Send automatically because of the semaphore handle; sending handles
// across threads is explicitly supported by the platform.
unsafe impl Send for ReadDirectoryChangesBackend {}

impl ReadDirectoryChangesBackend {
    pub(crate) fn new(sink: EventSink, guard: PumpGuard, _config: &Config) -> Result<Self> {
        let wakeup_sem = unsafe { CreateSemaphoreW(ptr::null_mut(), 0, 1, ptr::null_mut()) };
        if wakeup_sem.is_null() || wakeup_sem == INVALID_HANDLE_VALUE {
            return Err(Error::generic("Failed to create wakeup semaphore."));
        }

        let tx = ReadDirectoryChangesServer::start(sink, guard, wakeup_sem);

        Ok(ReadDirectoryChangesBackend { tx, wakeup_sem })
    }

    fn wakeup_server(&self) {
        // Break the server out of its wait state so actions are handled
        // without the 100 ms tick latency.
        unsafe {
            ReleaseSemaphore(self.wakeup_sem, 1, ptr::null_mut());
        }
    }
}

impl Backend for ReadDirectoryChangesBackend {
    fn add_watch(&mut self, watch: &ObservedWatch) -> Result<()> {
        let (tx, rx) = unbounded();
        self.tx.send(Action::Watch(watch.clone(), tx))?;
        self.wakeup_server();
        rx.recv()?
    }

    fn remove_watch(&mut self, watch: &ObservedWatch) -> Result<()> {
        self.tx.send(Action::Unwatch(watch.path().to_owned()))?;
        self.wakeup_server();
        Ok(())
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(Action::Stop);
        self.wakeup_server();
    }
}
