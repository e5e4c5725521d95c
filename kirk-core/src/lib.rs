//! Core execution engine for the kirk Linux kernel/userspace test orchestrator.
//!
//! Wires together a [`sut::Sut`] transport (host process, SSH, QEMU serial console, or the LTX
//! binary protocol), a [`framework::Framework`] adapter (LTP, kselftest, liburing), and the
//! [`scheduler`] that runs tests through them and reboots the SUT when the kernel panics, taints,
//! or stops responding. [`session::Session`] is the top-level driver the CLI talks to.

pub mod async_file;
pub mod data;
pub mod errors;
pub mod event_bus;
pub mod export;
pub mod framework;
pub mod monitor;
pub mod plugin;
pub mod results;
pub mod scheduler;
pub mod session;
pub mod signal;
pub mod sut;
pub mod tempdir;
