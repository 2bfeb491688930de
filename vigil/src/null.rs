//! An inert backend that accepts watches and emits nothing.
//!
//! Useful to exercise the queue, dispatcher and facade machinery in tests
//! without touching the kernel, and as a stand-in where observation is
//! intentionally disabled.

use crate::observer::{Backend, EventSink, ObservedWatch, PumpGuard};
use crate::Result;

pub(crate) struct NullBackend {
    _sink: EventSink,
}

impl NullBackend {
    pub(crate) fn new(sink: EventSink, guard: PumpGuard) -> Self {
        // There is no pump thread; acknowledge its "exit" immediately so
        // stop() never waits on the grace period.
        drop(guard);
        Self { _sink: sink }
    }
}

impl Backend for NullBackend {
    fn add_watch(&mut self, watch: &ObservedWatch) -> Result<()> {
        log::trace!("null backend: accepting watch for {:?}", watch.path());
        Ok(())
    }

    fn remove_watch(&mut self, _watch: &ObservedWatch) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) {}
}
