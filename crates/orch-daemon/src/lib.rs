//! Daemon-side wiring for the orchestrator: the dependency-aware unit
//! scheduler, the engine driver that wires it to Discovery/Worker/Review,
//! and the optional unix-socket event forwarder. Both the `at-daemon` and
//! `at-cli` binaries depend on this crate as a library and call
//! [`orchestrator::run`] directly — there is no HTTP server or API client
//! split, since this engine has nothing to serve but the task tree itself.

pub mod forwarder;
pub mod orchestrator;
pub mod scheduler;
pub mod supervisor;
