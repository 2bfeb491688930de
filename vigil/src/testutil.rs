#![allow(dead_code)] // not all helpers are used on all targets

use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::{Config, Event, Observer, ObserverKind};

pub(crate) fn testdir() -> tempfile::TempDir {
    tempfile::tempdir().expect("tempdir")
}

/// Collects events delivered to a channel-backed handler, with timeouts
/// tuned for tests.
pub(crate) struct TestReceiver {
    tx: mpsc::Sender<Event>,
    rx: mpsc::Receiver<Event>,
    timeout: Duration,
}

impl TestReceiver {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// A handler delivering into this receiver; clonable, so several
    /// watches can share one receiver.
    pub(crate) fn handler(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }

    /// The next event, or a panic after the timeout.
    pub(crate) fn recv(&mut self) -> Event {
        self.rx
            .recv_timeout(self.timeout)
            .unwrap_or_else(|e| panic!("no event within {:?}: {e:?}", self.timeout))
    }

    /// The next event matching `pred`, skipping others (platform noise such
    /// as open/close notifications or directory mtime updates).
    pub(crate) fn recv_where(&mut self, pred: impl Fn(&Event) -> bool) -> Event {
        let deadline = Instant::now() + self.timeout;
        let mut seen = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(event) if pred(&event) => return event,
                Ok(event) => seen.push(event),
                Err(_) => panic!(
                    "no matching event within {:?}; saw instead: {seen:#?}",
                    self.timeout
                ),
            }
        }
    }

    /// Asserts that no event matching `pred` arrives within `window`.
    pub(crate) fn assert_no_event_where(
        &mut self,
        pred: impl Fn(&Event) -> bool,
        window: Duration,
    ) {
        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match self.rx.recv_timeout(remaining) {
                Ok(event) if pred(&event) => panic!("unexpected event: {event:#?}"),
                Ok(_) => {}
                Err(_) => return,
            }
        }
    }

    /// Asserts that nothing at all arrives within `window`.
    pub(crate) fn assert_quiet(&mut self, window: Duration) {
        if let Ok(event) = self.rx.recv_timeout(window) {
            panic!("expected quiet, got: {event:#?}");
        }
    }

    /// Whether nothing is currently buffered.
    pub(crate) fn is_empty(&self) -> bool {
        self.rx.try_recv().is_err()
    }
}

/// An observer on `kind` plus a receiver its handlers can deliver into.
pub(crate) fn observer_channel(kind: ObserverKind) -> (Observer, TestReceiver) {
    observer_channel_with_config(kind, Config::default())
}

pub(crate) fn observer_channel_with_config(
    kind: ObserverKind,
    config: Config,
) -> (Observer, TestReceiver) {
    let observer = Observer::with_kind(kind, config).expect("unable to create observer");
    (observer, TestReceiver::new())
}

/// Polls `check` every few milliseconds until it returns true or `timeout`
/// lapses.
#[must_use]
pub(crate) fn sleep_until<F: FnMut() -> bool>(mut check: F, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout {
            return false;
        }
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
