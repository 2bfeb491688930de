//! Configuration types.

use std::time::Duration;

/// Indicates whether only the provided directory or its sub-directories as
/// well should be observed.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum RecursiveMode {
    /// Observe all sub-directories as well, including directories created
    /// after installing the watch.
    Recursive,

    /// Observe only the provided directory.
    NonRecursive,
}

impl RecursiveMode {
    pub(crate) fn is_recursive(&self) -> bool {
        match *self {
            RecursiveMode::Recursive => true,
            RecursiveMode::NonRecursive => false,
        }
    }
}

/// Observer configuration.
///
/// Most settings concern one backend only; collecting them here lets callers
/// configure every backend correctly regardless of which one the platform
/// factory selects at runtime.
///
/// ```rust
/// # use std::time::Duration;
/// # use vigil::Config;
/// let config = Config::default()
///     .with_poll_interval(Duration::from_millis(250))
///     .with_queue_capacity(Some(4096));
/// ```
///
/// None of the options can be changed after the observer is created.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Config {
    poll_interval: Duration,
    move_window: Duration,
    move_pending_capacity: usize,
    queue_capacity: Option<usize>,
    queue_timeout: Duration,
    stream_latency: Duration,
    follow_symlinks: bool,
    stop_grace: Duration,
}

impl Config {
    /// For the polling backend: the interval between re-scans of watched
    /// trees. Re-scans stat every entry, so large trees warrant a longer
    /// interval. Defaults to 1 second.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Returns current setting.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// For the inotify backend: how long the two halves of a rename may be
    /// separated and still be joined into a single `Moved` event. A pending
    /// half older than this surfaces as `Deleted`. Defaults to 500 ms.
    pub fn with_move_window(mut self, window: Duration) -> Self {
        self.move_window = window;
        self
    }

    /// Returns current setting.
    pub fn move_window(&self) -> Duration {
        self.move_window
    }

    /// For the inotify backend: the maximum number of unmatched rename
    /// halves held at once. When the table is full the oldest entry is
    /// resolved as `Deleted` to make room. Defaults to 8192.
    pub fn with_move_pending_capacity(mut self, capacity: usize) -> Self {
        self.move_pending_capacity = capacity.max(1);
        self
    }

    /// Returns current setting.
    pub fn move_pending_capacity(&self) -> usize {
        self.move_pending_capacity
    }

    /// Bounds the event queue between the backend and the dispatcher.
    /// When the queue is full the oldest event is discarded and handlers
    /// receive a queue-overflow signal before the next delivery.
    /// `None` (the default) leaves the queue unbounded.
    pub fn with_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.queue_capacity = capacity.map(|c| c.max(1));
        self
    }

    /// Returns current setting.
    pub fn queue_capacity(&self) -> Option<usize> {
        self.queue_capacity
    }

    /// How long the dispatcher waits on an idle queue before re-checking
    /// for shutdown. Defaults to 1 second.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Returns current setting.
    pub fn queue_timeout(&self) -> Duration {
        self.queue_timeout
    }

    /// For the FSEvents backend: the latency the stream is created with.
    /// Defaults to 1 ms.
    pub fn with_stream_latency(mut self, latency: Duration) -> Self {
        self.stream_latency = latency;
        self
    }

    /// Returns current setting.
    pub fn stream_latency(&self) -> Duration {
        self.stream_latency
    }

    /// Whether recursive registration and snapshots descend into symlinked
    /// directories. Off by default; a symlinked directory is then observed
    /// as the symlink itself.
    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Returns current setting.
    pub fn follow_symlinks(&self) -> bool {
        self.follow_symlinks
    }

    /// How long `stop` waits for the pump and dispatcher threads to exit
    /// before abandoning them with a warning. Defaults to 5 seconds.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Returns current setting.
    pub fn stop_grace(&self) -> Duration {
        self.stop_grace
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            move_window: Duration::from_millis(500),
            move_pending_capacity: 8192,
            queue_capacity: None,
            queue_timeout: Duration::from_secs(1),
            stream_latency: Duration::from_millis(1),
            follow_symlinks: false,
            stop_grace: Duration::from_secs(5),
        }
    }
}
