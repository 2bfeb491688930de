//! Facade-level scenarios exercised through the platform-independent
//! backends (null and polling), so they run everywhere.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use vigil::{
    Config, ErrorKind, Event, EventHandler, EventKind, Observer, ObserverKind, RecursiveMode,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn poll_config() -> Config {
    Config::default().with_poll_interval(Duration::from_millis(100))
}

fn recv_where(rx: &mpsc::Receiver<Event>, pred: impl Fn(&Event) -> bool) -> Event {
    let deadline = Instant::now() + RECV_TIMEOUT;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(event) if pred(&event) => return event,
            Ok(event) => seen.push(event),
            Err(err) => panic!("no matching event: {err:?}; saw {seen:#?}"),
        }
    }
}

#[test]
fn schedule_missing_path_fails_without_mutating_state() {
    let observer = Observer::with_kind(ObserverKind::Null, Config::default()).unwrap();

    let result = observer.schedule(
        |_: &Event| {},
        "/does/not/exist",
        RecursiveMode::Recursive,
    );

    assert!(matches!(
        result,
        Err(vigil::Error {
            kind: ErrorKind::WatchPathDoesNotExist,
            ..
        })
    ));
    assert!(observer.watches().is_empty());
}

#[test]
fn equivalent_watches_are_reused() {
    let tmpdir = tempfile::tempdir().unwrap();
    let observer = Observer::with_kind(ObserverKind::Null, Config::default()).unwrap();

    let first = observer
        .schedule(|_: &Event| {}, tmpdir.path(), RecursiveMode::Recursive)
        .unwrap();
    let second = observer
        .schedule(|_: &Event| {}, tmpdir.path(), RecursiveMode::Recursive)
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(observer.watches().len(), 1);

    // A different mode is a different watch.
    let third = observer
        .schedule(|_: &Event| {}, tmpdir.path(), RecursiveMode::NonRecursive)
        .unwrap();
    assert_ne!(first, third);
    assert_eq!(observer.watches().len(), 2);

    observer.unschedule_all().unwrap();
    assert!(observer.watches().is_empty());
}

#[test]
fn removing_the_last_handler_removes_the_watch() {
    let tmpdir = tempfile::tempdir().unwrap();
    let observer = Observer::with_kind(ObserverKind::Null, Config::default()).unwrap();

    let watch = observer
        .schedule(|_: &Event| {}, tmpdir.path(), RecursiveMode::Recursive)
        .unwrap();
    let extra = observer
        .add_handler_for_watch(|_: &Event| {}, &watch)
        .unwrap();

    observer.remove_handler_for_watch(&watch, extra).unwrap();
    assert_eq!(observer.watches().len(), 1, "one handler still references it");

    // The handler installed by schedule has no separate handle; removing
    // the watch itself is the way to drop it.
    observer.unschedule(&watch).unwrap();
    assert!(observer.watches().is_empty());
    assert!(matches!(
        observer.unschedule(&watch),
        Err(vigil::Error {
            kind: ErrorKind::WatchNotFound,
            ..
        })
    ));
}

#[test]
fn fast_start_stop_invokes_no_handlers() {
    let tmpdir = tempfile::tempdir().unwrap();
    let observer = Observer::with_kind(ObserverKind::Null, Config::default()).unwrap();
    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invoked);

    observer.start().unwrap();
    observer
        .schedule(
            move |_: &Event| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            tmpdir.path(),
            RecursiveMode::Recursive,
        )
        .unwrap();

    let begun = Instant::now();
    observer.stop().unwrap();

    assert!(begun.elapsed() < Duration::from_secs(5));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[test]
fn start_twice_is_an_error_and_stop_is_idempotent() {
    let observer = Observer::with_kind(ObserverKind::Null, Config::default()).unwrap();
    observer.start().unwrap();
    assert!(observer.start().is_err());
    observer.stop().unwrap();
    observer.stop().unwrap();
    assert!(observer.start().is_err(), "stopped observers do not restart");
}

#[test]
fn polling_reports_a_created_file() {
    let tmpdir = tempfile::tempdir().unwrap();
    let observer = Observer::with_kind(ObserverKind::Poll, poll_config()).unwrap();
    let (tx, rx) = mpsc::channel();
    observer
        .schedule(tx, tmpdir.path(), RecursiveMode::Recursive)
        .unwrap();
    observer.start().unwrap();

    let path = tmpdir.path().join("a.txt");
    std::fs::write(&path, b"contents").unwrap();

    let event = recv_where(&rx, |e| e.kind == EventKind::Created);
    assert_eq!(event.path(), path.canonicalize().unwrap());
    assert!(!event.is_directory);
    assert!(event.is_synthetic);

    // Exactly one creation for one touch.
    let deadline = Instant::now() + Duration::from_millis(400);
    while let Ok(event) = rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        assert_ne!(event.kind, EventKind::Created, "duplicate: {event:#?}");
    }
}

#[test]
fn polling_reports_deletion_and_rename() {
    let tmpdir = tempfile::tempdir().unwrap();
    let doomed = tmpdir.path().join("doomed");
    let before = tmpdir.path().join("before");
    std::fs::write(&doomed, b"x").unwrap();
    std::fs::write(&before, b"x").unwrap();

    let observer = Observer::with_kind(ObserverKind::Poll, poll_config()).unwrap();
    let (tx, rx) = mpsc::channel();
    observer
        .schedule(tx, tmpdir.path(), RecursiveMode::Recursive)
        .unwrap();
    observer.start().unwrap();

    let canonical = tmpdir.path().canonicalize().unwrap();
    std::fs::remove_file(&doomed).unwrap();
    let after = tmpdir.path().join("after");
    std::fs::rename(&before, &after).unwrap();

    let deleted = recv_where(&rx, |e| e.kind == EventKind::Deleted);
    assert_eq!(deleted.path(), canonical.join("doomed"));

    let moved = recv_where(&rx, |e| e.kind == EventKind::Moved);
    assert_eq!(moved.path(), canonical.join("before"));
    assert_eq!(moved.dest(), Some(canonical.join("after").as_path()));
}

#[test]
fn non_recursive_polling_ignores_nested_changes() {
    let tmpdir = tempfile::tempdir().unwrap();
    let sub = tmpdir.path().join("sub");
    std::fs::create_dir(&sub).unwrap();

    let observer = Observer::with_kind(ObserverKind::Poll, poll_config()).unwrap();
    let (tx, rx) = mpsc::channel();
    observer
        .schedule(tx, tmpdir.path(), RecursiveMode::NonRecursive)
        .unwrap();
    observer.start().unwrap();

    std::fs::write(sub.join("nested"), b"x").unwrap();

    let deadline = Instant::now() + Duration::from_millis(500);
    while let Ok(event) = rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        assert_ne!(
            event.path().file_name().and_then(|n| n.to_str()),
            Some("nested"),
            "nested change leaked: {event:#?}"
        );
    }
}

#[test]
fn two_handlers_receive_the_same_event_in_registration_order() {
    let tmpdir = tempfile::tempdir().unwrap();
    let observer = Observer::with_kind(ObserverKind::Poll, poll_config()).unwrap();

    let sequence: Arc<Mutex<Vec<(u8, Event)>>> = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&sequence);
    let second = Arc::clone(&sequence);

    let watch = observer
        .schedule(
            move |event: &Event| first.lock().unwrap().push((1, event.clone())),
            tmpdir.path(),
            RecursiveMode::Recursive,
        )
        .unwrap();
    observer
        .add_handler_for_watch(
            move |event: &Event| second.lock().unwrap().push((2, event.clone())),
            &watch,
        )
        .unwrap();
    observer.start().unwrap();

    std::fs::write(tmpdir.path().join("x"), b"x").unwrap();

    let deadline = Instant::now() + RECV_TIMEOUT;
    loop {
        {
            let seen = sequence.lock().unwrap();
            let created: Vec<_> = seen
                .iter()
                .filter(|(_, e)| e.kind == EventKind::Created)
                .collect();
            if created.len() >= 2 {
                assert_eq!(created[0].0, 1);
                assert_eq!(created[1].0, 2);
                assert_eq!(created[0].1, created[1].1, "handlers saw different events");
                break;
            }
        }
        assert!(Instant::now() < deadline, "handlers were not both invoked");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// A handler that records whether an overflow signal preceded any event.
struct OverflowProbe {
    order: Arc<Mutex<Vec<&'static str>>>,
}

impl EventHandler for OverflowProbe {
    fn on_event(&mut self, _event: &Event) {
        self.order.lock().unwrap().push("event");
    }

    fn on_queue_overflow(&mut self) {
        self.order.lock().unwrap().push("overflow");
    }
}

#[test]
fn overflowing_the_queue_signals_handlers_before_later_events() {
    let tmpdir = tempfile::tempdir().unwrap();
    let config = poll_config().with_queue_capacity(Some(4));
    let observer = Observer::with_kind(ObserverKind::Poll, config).unwrap();

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    observer
        .schedule(
            OverflowProbe {
                order: Arc::clone(&order),
            },
            tmpdir.path(),
            RecursiveMode::Recursive,
        )
        .unwrap();

    // Fill the queue while the dispatcher is not yet running.
    for n in 0..30 {
        std::fs::write(tmpdir.path().join(format!("file-{n:02}")), b"x").unwrap();
    }
    let scanned = wait_until(Duration::from_secs(5), || observer.dropped_events() > 0);
    assert!(scanned, "the poll scan never overflowed the queue");

    observer.start().unwrap();

    let delivered = wait_until(Duration::from_secs(5), || !order.lock().unwrap().is_empty());
    assert!(delivered, "nothing was dispatched");
    // Let the dispatcher drain what survived in the queue.
    std::thread::sleep(Duration::from_millis(300));

    let seen = order.lock().unwrap();
    assert_eq!(seen[0], "overflow", "sequence: {seen:?}");
    assert!(seen.len() > 1, "queued events should follow the signal");
    // At most one signal per loss window: never two signals back to back.
    for pair in seen.windows(2) {
        assert!(
            !(pair[0] == "overflow" && pair[1] == "overflow"),
            "repeated signal without a delivery between: {seen:?}"
        );
    }
}

#[test]
fn overflow_recovery_via_snapshot_diff() {
    // The documented recovery pattern: on overflow, re-scan and diff.
    let tmpdir = tempfile::tempdir().unwrap();
    let root: &Path = tmpdir.path();
    let old = vigil::DirSnapshot::capture(root, true, false).unwrap();

    std::fs::write(root.join("appeared"), b"x").unwrap();
    let new = vigil::DirSnapshot::capture(root, true, false).unwrap();

    let events = old.diff(&new);
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::Created
            && e.path().file_name().and_then(|n| n.to_str()) == Some("appeared")));
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}
