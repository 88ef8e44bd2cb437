//! Event definitions for the supervision loop.
//!
//! The config poller and the primary process's exit watcher report into one
//! channel per run of the primary command. Host signals arrive on their own
//! channel, which outlives every run.

use crate::process::ExitState;

/// Signals the supervisor forwards to its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
}

impl ProcessSignal {
    pub fn name(self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
        }
    }
}

/// Represents an event in the supervision loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A poll tick found the recomputed environment differs from the live one.
    Restart { changed: Vec<String> },
    /// The primary process exited.
    ProcessExited { state: ExitState },
}
