//! Value types used by the [vigil](https://docs.rs/vigil) crate.
//!
//! The types in this crate are deliberately free of any platform plumbing so
//! that consumers of an event stream (loggers, test harnesses, IPC bridges)
//! can depend on them without pulling in the observation machinery.

#![deny(missing_docs)]

pub mod event;

pub use event::{Event, EventKind};
