//! Point-in-time inventories of directory trees and their differences.
//!
//! A [`DirSnapshot`] records every entry under a root, keyed by its stable
//! [`EntryId`] so that a later snapshot can be compared against it:
//! an identity present on one side only is a creation or deletion, an
//! identity whose path changed is a move, and an identity whose metadata
//! changed in place is a modification. The polling backend is built on this
//! diff, and handlers can use it to recover after a queue overflow.

use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use entry_id::EntryId;
use filetime::FileTime;
use walkdir::WalkDir;

use crate::{Error, Event, EventKind, Result};

/// Metadata retained for a single snapshot entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    path: PathBuf,
    mtime: FileTime,
    size: u64,
    is_directory: bool,
}

impl EntryInfo {
    /// The path of the entry at capture time.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last modification time at capture time.
    pub fn mtime(&self) -> FileTime {
        self.mtime
    }

    /// Size in bytes at capture time.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the entry was a directory.
    pub fn is_directory(&self) -> bool {
        self.is_directory
    }
}

/// A point-in-time inventory of a directory tree (or a single file).
#[derive(Clone, Debug, Default)]
pub struct DirSnapshot {
    entries: BTreeMap<EntryId, EntryInfo>,
    by_path: BTreeMap<PathBuf, EntryId>,
}

impl DirSnapshot {
    /// Captures the state of the tree rooted at `root`.
    ///
    /// With `recursive` unset only the root and its immediate children are
    /// recorded. Symlinked directories are descended into only when
    /// `follow_symlinks` is set; otherwise the link itself is recorded.
    /// Entries that vanish while the walk is in progress are skipped; a
    /// missing root is an error.
    pub fn capture(root: &Path, recursive: bool, follow_symlinks: bool) -> Result<Self> {
        if !root.exists() {
            return Err(Error::path_does_not_exist().add_path(root.into()));
        }

        let mut snapshot = DirSnapshot::default();
        let max_depth = if recursive { usize::MAX } else { 1 };
        for entry in WalkDir::new(root)
            .follow_links(follow_symlinks)
            .max_depth(max_depth)
        {
            let entry = match entry {
                Ok(entry) => entry,
                // Racy deletion mid-walk, or an unreadable subtree; the
                // next capture will pick up whatever remains.
                Err(err) => {
                    log::debug!("snapshot skipping entry: {err}");
                    continue;
                }
            };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let Ok(id) = entry_identity(entry.path(), &metadata) else {
                continue;
            };
            snapshot.insert(id, entry.into_path(), &metadata);
        }
        Ok(snapshot)
    }

    /// An empty snapshot, used as the "after" image of a vanished root.
    pub fn empty() -> Self {
        DirSnapshot::default()
    }

    fn insert(&mut self, id: EntryId, path: PathBuf, metadata: &Metadata) {
        self.by_path.insert(path.clone(), id);
        self.entries.insert(
            id,
            EntryInfo {
                path,
                mtime: FileTime::from_last_modification_time(metadata),
                size: metadata.len(),
                is_directory: metadata.is_dir(),
            },
        );
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot records nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an entry by path.
    pub fn entry_at(&self, path: &Path) -> Option<&EntryInfo> {
        self.by_path.get(path).and_then(|id| self.entries.get(id))
    }

    /// Iterates over recorded paths in lexicographic order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.by_path.keys().map(PathBuf::as_path)
    }

    /// Computes the synthetic events that transform `self` into `new`.
    ///
    /// The result is deterministic: deletions, then moves, then creations,
    /// then modifications, each group ordered by path (moves by their
    /// source path). Every produced event is flagged synthetic.
    pub fn diff(&self, new: &DirSnapshot) -> Vec<Event> {
        let mut deleted = Vec::new();
        let mut moved = Vec::new();
        let mut created = Vec::new();
        let mut modified = Vec::new();

        for (id, old_info) in &self.entries {
            match new.entries.get(id) {
                None => deleted.push(
                    Event::new(EventKind::Deleted, old_info.path.clone())
                        .set_directory(old_info.is_directory)
                        .into_synthetic(),
                ),
                Some(new_info) if new_info.path != old_info.path => moved.push(
                    Event::moved(old_info.path.clone(), new_info.path.clone())
                        .set_directory(new_info.is_directory)
                        .into_synthetic(),
                ),
                Some(new_info) => {
                    if new_info.mtime != old_info.mtime || new_info.size != old_info.size {
                        modified.push(
                            Event::new(EventKind::Modified, new_info.path.clone())
                                .set_directory(new_info.is_directory)
                                .into_synthetic(),
                        );
                    }
                }
            }
        }

        for (id, new_info) in &new.entries {
            if !self.entries.contains_key(id) {
                created.push(
                    Event::new(EventKind::Created, new_info.path.clone())
                        .set_directory(new_info.is_directory)
                        .into_synthetic(),
                );
            }
        }

        deleted.sort_by(|a, b| a.src_path.cmp(&b.src_path));
        moved.sort_by(|a, b| a.src_path.cmp(&b.src_path));
        created.sort_by(|a, b| a.src_path.cmp(&b.src_path));
        modified.sort_by(|a, b| a.src_path.cmp(&b.src_path));

        let mut events = deleted;
        events.append(&mut moved);
        events.append(&mut created);
        events.append(&mut modified);
        events
    }
}

#[cfg(unix)]
fn entry_identity(_path: &Path, metadata: &Metadata) -> std::io::Result<EntryId> {
    use std::os::unix::fs::MetadataExt;
    Ok(EntryId::new_inode(metadata.dev(), metadata.ino()))
}

#[cfg(windows)]
fn entry_identity(path: &Path, _metadata: &Metadata) -> std::io::Result<EntryId> {
    entry_id::get_entry_id(path)
}
