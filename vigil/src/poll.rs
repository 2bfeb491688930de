//! Backend based on periodic re-scanning.
//!
//! Works on every platform the standard library supports. Each watch keeps
//! a [`DirSnapshot`]; at every poll interval the tree is re-captured and the
//! difference is emitted as synthetic events. This is expensive for large
//! trees, so the interval should be tuned to the tree size.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::observer::{Backend, EventSink, ObservedWatch, PumpGuard, WatchId};
use crate::snapshot::DirSnapshot;
use crate::{Config, Error, Result};

enum PollMsg {
    AddWatch(ObservedWatch, Sender<Result<()>>),
    RemoveWatch(WatchId, Sender<Result<()>>),
    Shutdown,
}

struct WatchState {
    watch: ObservedWatch,
    snapshot: DirSnapshot,
}

struct PollLoop {
    rx: Receiver<PollMsg>,
    sink: EventSink,
    interval: Duration,
    follow_symlinks: bool,
    watches: HashMap<WatchId, WatchState>,
}

impl PollLoop {
    fn run(mut self, guard: PumpGuard) {
        let _guard = guard;
        loop {
            match self.rx.recv_timeout(self.interval) {
                Ok(PollMsg::AddWatch(watch, tx)) => {
                    let _ = tx.send(self.add_watch(watch));
                }
                Ok(PollMsg::RemoveWatch(id, tx)) => {
                    let _ = tx.send(self.remove_watch(id));
                }
                Ok(PollMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => self.scan(),
            }
        }
    }

    fn add_watch(&mut self, watch: ObservedWatch) -> Result<()> {
        let snapshot =
            DirSnapshot::capture(watch.path(), watch.recursive(), self.follow_symlinks)?;
        log::trace!(
            "poll backend: watching {:?} ({} entries)",
            watch.path(),
            snapshot.len()
        );
        self.watches
            .insert(watch.id(), WatchState { watch, snapshot });
        Ok(())
    }

    fn remove_watch(&mut self, id: WatchId) -> Result<()> {
        match self.watches.remove(&id) {
            Some(_) => Ok(()),
            None => Err(Error::watch_not_found()),
        }
    }

    fn scan(&mut self) {
        for state in self.watches.values_mut() {
            let fresh = match DirSnapshot::capture(
                state.watch.path(),
                state.watch.recursive(),
                self.follow_symlinks,
            ) {
                Ok(snapshot) => snapshot,
                // The root vanished; everything it contained is gone. The
                // watch stays registered in case the root reappears.
                Err(_) => DirSnapshot::empty(),
            };
            let events = state.snapshot.diff(&fresh);
            state.snapshot = fresh;
            self.sink.send_all(state.watch.id(), events);
        }
    }
}

/// Polling-based `Backend` implementation.
pub(crate) struct PollBackend {
    channel: Sender<PollMsg>,
}

impl PollBackend {
    pub(crate) fn new(sink: EventSink, guard: PumpGuard, config: &Config) -> Result<Self> {
        let (tx, rx) = unbounded();
        let poll_loop = PollLoop {
            rx,
            sink,
            interval: config.poll_interval(),
            follow_symlinks: config.follow_symlinks(),
            watches: HashMap::new(),
        };
        thread::Builder::new()
            .name("vigil poll loop".to_string())
            .spawn(move || poll_loop.run(guard))
            .map_err(Error::io)?;
        Ok(Self { channel: tx })
    }

    fn request<T>(
        &self,
        make: impl FnOnce(Sender<Result<T>>) -> PollMsg,
    ) -> Result<T> {
        let (tx, rx) = unbounded();
        self.channel.send(make(tx))?;
        rx.recv()?
    }
}

impl Backend for PollBackend {
    fn add_watch(&mut self, watch: &ObservedWatch) -> Result<()> {
        self.request(|tx| PollMsg::AddWatch(watch.clone(), tx))
    }

    fn remove_watch(&mut self, watch: &ObservedWatch) -> Result<()> {
        self.request(|tx| PollMsg::RemoveWatch(watch.id(), tx))
    }

    fn shutdown(&mut self) {
        let _ = self.channel.send(PollMsg::Shutdown);
    }
}
