//! Structured logging initialization shared by every binary in the workspace.
//!
//! A single place to turn on `tracing-subscriber`, so the daemon and CLI
//! entrypoints agree on format and `RUST_LOG` handling rather than each
//! rolling their own.

pub mod logging;
