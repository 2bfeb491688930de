//! The `Event` record delivered to handlers and its `EventKind` descriptor.

use std::fmt;
use std::path::{Path, PathBuf};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// What happened to a filesystem entry.
///
/// The `Opened`, `ClosedWrite` and `ClosedNoWrite` kinds describe access to
/// file handles rather than mutation; only some platforms are capable of
/// generating them. Consult the capability table in the `vigil` crate docs
/// before relying on them.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum EventKind {
    /// An entry came into existence at `src_path`.
    Created,

    /// The entry at `src_path` was removed.
    Deleted,

    /// The content or attributes of the entry at `src_path` changed.
    Modified,

    /// The entry moved from `src_path` to `dest_path`.
    ///
    /// Both ends are known; an event of this kind always carries a
    /// destination path. Renames where only one side is inside the observed
    /// scope surface as `Created` or `Deleted` instead.
    Moved,

    /// A handle to the entry was opened.
    Opened,

    /// A handle opened for writing was closed.
    #[cfg_attr(feature = "serde", serde(rename = "closed"))]
    ClosedWrite,

    /// A handle opened read-only was closed.
    ClosedNoWrite,
}

impl EventKind {
    /// The stable string token for this kind.
    ///
    /// These tokens are part of the public interface and will not change:
    /// `"created"`, `"deleted"`, `"modified"`, `"moved"`, `"opened"`,
    /// `"closed"`, `"closed_no_write"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Deleted => "deleted",
            EventKind::Modified => "modified",
            EventKind::Moved => "moved",
            EventKind::Opened => "opened",
            EventKind::ClosedWrite => "closed",
            EventKind::ClosedNoWrite => "closed_no_write",
        }
    }

    /// Indicates whether this kind describes handle access rather than
    /// mutation.
    pub fn is_access(&self) -> bool {
        matches!(
            self,
            EventKind::Opened | EventKind::ClosedWrite | EventKind::ClosedNoWrite
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observed filesystem change.
///
/// Events are immutable value records. `dest_path` is present exactly when
/// `kind` is [`EventKind::Moved`]; `src_path` is always non-empty and
/// absolute once an event leaves an observer.
#[derive(Clone, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Event {
    /// Kind of the change.
    pub kind: EventKind,

    /// The path the change happened at. For moves, the source.
    pub src_path: PathBuf,

    /// The destination of a move; `None` for every other kind.
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub dest_path: Option<PathBuf>,

    /// Whether the entry is a directory.
    pub is_directory: bool,

    /// Whether this event was derived from comparing snapshots rather than
    /// from a live kernel notification.
    #[cfg_attr(feature = "serde", serde(default))]
    pub is_synthetic: bool,
}

impl Event {
    /// Creates an event of the given kind at `src_path`.
    ///
    /// For move events use [`Event::moved`], which takes both ends.
    pub fn new(kind: EventKind, src_path: impl Into<PathBuf>) -> Self {
        debug_assert!(kind != EventKind::Moved, "moves carry two paths");
        Self {
            kind,
            src_path: src_path.into(),
            dest_path: None,
            is_directory: false,
            is_synthetic: false,
        }
    }

    /// Creates a move event from `src_path` to `dest_path`.
    pub fn moved(src_path: impl Into<PathBuf>, dest_path: impl Into<PathBuf>) -> Self {
        let src_path = src_path.into();
        let dest_path = dest_path.into();
        debug_assert_ne!(src_path, dest_path, "a move must change the path");
        Self {
            kind: EventKind::Moved,
            src_path,
            dest_path: Some(dest_path),
            is_directory: false,
            is_synthetic: false,
        }
    }

    /// Marks the event as concerning a directory.
    pub fn into_directory(mut self) -> Self {
        self.is_directory = true;
        self
    }

    /// Sets the directory flag from a caller-determined value.
    pub fn set_directory(mut self, is_directory: bool) -> Self {
        self.is_directory = is_directory;
        self
    }

    /// Marks the event as snapshot-derived.
    pub fn into_synthetic(mut self) -> Self {
        self.is_synthetic = true;
        self
    }

    /// The path the change happened at.
    pub fn path(&self) -> &Path {
        &self.src_path
    }

    /// The destination path, for move events.
    pub fn dest(&self) -> Option<&Path> {
        self.dest_path.as_deref()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Event");
        d.field("kind", &self.kind).field("src_path", &self.src_path);
        if let Some(dest) = &self.dest_path {
            d.field("dest_path", dest);
        }
        d.field("is_directory", &self.is_directory);
        if self.is_synthetic {
            d.field("is_synthetic", &self.is_synthetic);
        }
        d.finish()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dest_path {
            Some(dest) => write!(
                f,
                "{}({} -> {})",
                self.kind,
                self.src_path.display(),
                dest.display()
            ),
            None => write!(f, "{}({})", self.kind, self.src_path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tokens_are_stable() {
        assert_eq!(EventKind::Created.as_str(), "created");
        assert_eq!(EventKind::Deleted.as_str(), "deleted");
        assert_eq!(EventKind::Modified.as_str(), "modified");
        assert_eq!(EventKind::Moved.as_str(), "moved");
        assert_eq!(EventKind::Opened.as_str(), "opened");
        assert_eq!(EventKind::ClosedWrite.as_str(), "closed");
        assert_eq!(EventKind::ClosedNoWrite.as_str(), "closed_no_write");
    }

    #[test]
    fn moved_carries_both_paths() {
        let event = Event::moved("/w/a", "/w/b");
        assert_eq!(event.kind, EventKind::Moved);
        assert_eq!(event.path(), Path::new("/w/a"));
        assert_eq!(event.dest(), Some(Path::new("/w/b")));
    }

    #[test]
    fn plain_events_have_no_dest() {
        let event = Event::new(EventKind::Created, "/w/a");
        assert_eq!(event.dest(), None);
        assert!(!event.is_directory);
        assert!(!event.is_synthetic);
    }

    #[test]
    fn refinements_keep_the_rest_of_the_record() {
        let event = Event::new(EventKind::Deleted, "/w/dir")
            .into_directory()
            .into_synthetic();
        assert_eq!(event.kind, EventKind::Deleted);
        assert!(event.is_directory);
        assert!(event.is_synthetic);
    }

    #[test]
    fn access_kinds() {
        assert!(EventKind::Opened.is_access());
        assert!(EventKind::ClosedWrite.is_access());
        assert!(EventKind::ClosedNoWrite.is_access());
        assert!(!EventKind::Created.is_access());
        assert!(!EventKind::Moved.is_access());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serializes_with_stable_tokens() {
        let event = Event::moved("/w/a", "/w/b");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"moved\""), "json: {json}");
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
