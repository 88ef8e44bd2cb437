//! Envrack: a config-driven process supervisor.
//!
//! A directive file describes an environment: values computed by shell
//! commands, services, one-shot tasks, rendered templates and teardown steps.
//! The supervisor builds that environment, runs a primary command inside it
//! and restarts the command whenever the computed values drift.

pub mod compile;
pub mod config;
pub mod environment;
pub mod events;
pub mod logging;
pub mod output;
pub mod process;
pub mod runner;
pub mod store;
pub mod supervisor;
pub mod template;
pub mod watch;
