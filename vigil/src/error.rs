//! Error types.

use std::{error::Error as StdError, fmt, io, path::PathBuf, result};

/// Type alias to use this library's `Error` type in a `Result`.
pub type Result<T> = result::Result<T, Error>;

/// The kind of an observation error.
#[derive(Debug)]
pub enum ErrorKind {
    /// A failure not covered by a more specific kind.
    Generic(String),

    /// A kernel-level observation failure: descriptor exhaustion, permission
    /// denied, an unsupported filesystem, or any other I/O fault raised by
    /// the native notification mechanism.
    OsObservation(io::Error),

    /// The target path did not exist when the watch was registered.
    WatchPathDoesNotExist,

    /// The backend could not coalesce a duplicate registration for a path
    /// it already watches.
    WatchAlreadyExists,

    /// The watch being operated on is not registered with this observer.
    WatchNotFound,

    /// The per-user limit on watched entries was reached (Linux).
    ///
    /// Reported distinctly so callers do not confuse the inotify limit with
    /// an actual out-of-space condition, which shares an errno with it.
    MaxFilesWatch,
}

/// An observation error, with the paths it concerns when known.
#[derive(Debug)]
pub struct Error {
    /// The kind of the error.
    pub kind: ErrorKind,

    /// The paths involved in the error, if any.
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Creates a new error of the given kind, without paths.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            paths: Vec::new(),
        }
    }

    /// Creates a generic error from a message.
    pub fn generic(msg: &str) -> Self {
        Self::new(ErrorKind::Generic(msg.into()))
    }

    /// Creates an error from a kernel I/O failure.
    pub fn io(err: io::Error) -> Self {
        Self::new(ErrorKind::OsObservation(err))
    }

    /// Creates an error from an I/O failure raised while inspecting a watch
    /// target, mapping "not found" to [`ErrorKind::WatchPathDoesNotExist`].
    pub fn io_watch(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::path_does_not_exist()
        } else {
            Self::io(err)
        }
    }

    /// Creates a [`ErrorKind::WatchPathDoesNotExist`] error.
    pub fn path_does_not_exist() -> Self {
        Self::new(ErrorKind::WatchPathDoesNotExist)
    }

    /// Creates a [`ErrorKind::WatchAlreadyExists`] error.
    pub fn watch_already_exists() -> Self {
        Self::new(ErrorKind::WatchAlreadyExists)
    }

    /// Creates a [`ErrorKind::WatchNotFound`] error.
    pub fn watch_not_found() -> Self {
        Self::new(ErrorKind::WatchNotFound)
    }

    /// Attaches a path to the error.
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// Sets the paths of the error.
    pub fn set_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match &self.kind {
            ErrorKind::Generic(msg) => msg.clone(),
            ErrorKind::OsObservation(err) => format!("OS observation error: {err}"),
            ErrorKind::WatchPathDoesNotExist => "path to watch does not exist".into(),
            ErrorKind::WatchAlreadyExists => "watch already exists".into(),
            ErrorKind::WatchNotFound => "watch not found".into(),
            ErrorKind::MaxFilesWatch => "limit of watched entries reached".into(),
        };
        if self.paths.is_empty() {
            write!(f, "{reason}")
        } else {
            write!(f, "{reason} about {:?}", self.paths)
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.kind {
            ErrorKind::OsObservation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err)
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        match err.into_io_error() {
            Some(io_err) => Error::io(io_err),
            None => Error::generic("filesystem walk hit a symlink loop"),
        }
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(_: crossbeam_channel::SendError<T>) -> Self {
        Error::generic("internal channel disconnected")
    }
}

impl From<crossbeam_channel::RecvError> for Error {
    fn from(_: crossbeam_channel::RecvError) -> Self {
        Error::generic("internal channel disconnected")
    }
}
