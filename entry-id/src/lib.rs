//! Stable identity for filesystem entries.
//!
//! Filesystems assign each entry an identifier that survives renames: the
//! inode number on Linux and macOS, the file index on Windows. Paired with
//! the device id (or volume serial number), an [`EntryId`] identifies an
//! entry on a single machine at a given time, which is what lets a snapshot
//! diff tell a rename apart from a delete-and-create.
//!
//! Identifiers can be re-used by the operating system after an entry is
//! deleted; an `EntryId` is only meaningful while the entry exists.
//!
//! ## Example
//!
//! ```
//! let file = tempfile::NamedTempFile::new().unwrap();
//!
//! let id = entry_id::get_entry_id(file.path()).unwrap();
//! println!("{id:?}");
//! ```

use std::{io, path::Path};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Identity of a filesystem entry, unique per machine while the entry lives.
///
/// Ordered and hashable so it can key maps and produce deterministic
/// orderings in diffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EntryId {
    /// Device id and inode number, available on Unix systems.
    #[cfg_attr(feature = "serde", serde(rename = "inode"))]
    Inode {
        /// Device id.
        #[cfg_attr(feature = "serde", serde(rename = "device"))]
        device: u64,

        /// Inode number.
        #[cfg_attr(feature = "serde", serde(rename = "inode"))]
        inode: u64,
    },

    /// Volume serial number and file index, available on Windows.
    ///
    /// Details: <https://learn.microsoft.com/en-us/windows/win32/api/fileapi/nf-fileapi-getfileinformationbyhandle>.
    #[cfg_attr(feature = "serde", serde(rename = "index"))]
    Index {
        /// Volume serial number.
        #[cfg_attr(feature = "serde", serde(rename = "volume"))]
        volume: u32,

        /// File index.
        #[cfg_attr(feature = "serde", serde(rename = "index"))]
        index: u64,
    },
}

impl EntryId {
    /// Builds an inode-based identity.
    pub fn new_inode(device: u64, inode: u64) -> Self {
        EntryId::Inode { device, inode }
    }

    /// Builds a file-index-based identity.
    pub fn new_index(volume: u32, index: u64) -> Self {
        EntryId::Index { volume, index }
    }
}

/// Reads the [`EntryId`] of the entry at `path`, following symlinks.
#[cfg(target_family = "unix")]
pub fn get_entry_id(path: impl AsRef<Path>) -> io::Result<EntryId> {
    use std::os::unix::fs::MetadataExt;

    let metadata = std::fs::metadata(path.as_ref())?;

    Ok(EntryId::new_inode(metadata.dev(), metadata.ino()))
}

/// Reads the [`EntryId`] of the entry at `path` without following the final
/// symlink.
#[cfg(target_family = "unix")]
pub fn get_entry_id_no_follow(path: impl AsRef<Path>) -> io::Result<EntryId> {
    use std::os::unix::fs::MetadataExt;

    let metadata = std::fs::symlink_metadata(path.as_ref())?;

    Ok(EntryId::new_inode(metadata.dev(), metadata.ino()))
}

/// Reads the [`EntryId`] of the entry at `path`.
#[cfg(target_family = "windows")]
pub fn get_entry_id(path: impl AsRef<Path>) -> io::Result<EntryId> {
    let file = open_entry(path)?;

    unsafe { get_entry_info(&file) }
}

/// Reads the [`EntryId`] of the entry at `path`.
///
/// Windows resolves reparse points when the handle is opened; there is no
/// cheaper non-following variant, so this is an alias of [`get_entry_id`].
#[cfg(target_family = "windows")]
pub fn get_entry_id_no_follow(path: impl AsRef<Path>) -> io::Result<EntryId> {
    get_entry_id(path)
}

#[cfg(target_family = "windows")]
unsafe fn get_entry_info(file: &std::fs::File) -> io::Result<EntryId> {
    use std::{mem, os::windows::prelude::*};
    use windows_sys::Win32::{
        Foundation::HANDLE,
        Storage::FileSystem::{GetFileInformationByHandle, BY_HANDLE_FILE_INFORMATION},
    };

    let mut info: BY_HANDLE_FILE_INFORMATION = mem::zeroed();
    let ret = GetFileInformationByHandle(file.as_raw_handle() as HANDLE, &mut info);
    if ret == 0 {
        return Err(io::Error::last_os_error());
    };

    Ok(EntryId::new_index(
        info.dwVolumeSerialNumber,
        ((info.nFileIndexHigh as u64) << 32) | (info.nFileIndexLow as u64),
    ))
}

#[cfg(target_family = "windows")]
fn open_entry<P: AsRef<Path>>(path: P) -> io::Result<std::fs::File> {
    use std::{fs::OpenOptions, os::windows::fs::OpenOptionsExt};
    use windows_sys::Win32::Storage::FileSystem::FILE_FLAG_BACKUP_SEMANTICS;

    OpenOptions::new()
        .access_mode(0)
        .custom_flags(FILE_FLAG_BACKUP_SEMANTICS)
        .open(path)
}
