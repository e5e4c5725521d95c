//! Errors produced by the kirk execution engine.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while a [`crate::sut::Sut`] transport is communicating with its target.
#[derive(Debug, Error)]
pub enum CommunicationError {
    /// The transport could not be reached at all (connection refused, process failed to
    /// spawn, etc).
    #[error("failed to communicate with SUT: {0}")]
    Unreachable(String),

    /// The transport replied but its output could not be parsed into the expected shape.
    #[error("could not parse SUT reply: {0}")]
    Protocol(String),

    /// A command was issued while the transport was not running.
    #[error("SUT is not running")]
    NotRunning,

    /// The transport was already running when `start` was called again.
    #[error("SUT is already running")]
    AlreadyRunning,

    /// The transport observed the kernel panic marker mid-command.
    #[error("kernel panic detected")]
    Panic,
}

/// Kernel-health events surfaced by the [`crate::scheduler::TestScheduler`].
///
/// These are not really "errors" in the Rust sense, but signal flow out of the test
/// scheduler that the suite scheduler reacts to by rebooting the SUT and retrying.
#[derive(Debug, Error)]
pub enum KernelEvent {
    /// The test's stdout contained the kernel panic marker.
    #[error("kernel panic detected")]
    Panic,

    /// The `/proc/sys/kernel/tainted` bitfield changed across a test run.
    #[error("kernel tainted: {0:?}")]
    Tainted(Vec<String>),

    /// The SUT stopped responding to `ping` after a test timed out.
    #[error("kernel stopped responding")]
    Timeout,
}

/// Raised by a [`crate::framework::Framework`] implementation.
#[derive(Debug, Error)]
pub enum FrameworkError {
    #[error("{0}")]
    Generic(String),

    #[error("suite `{0}` doesn't exist")]
    SuiteNotFound(String),

    #[error("install directory doesn't exist inside SUT: {0}")]
    InstallDirMissing(Utf8PathBuf),
}

/// Raised if the OS refuses to let us install a signal handler.
#[derive(Debug, Error)]
#[error("failed to set up signal handler: {0}")]
pub struct SignalHandlerSetupError(#[from] pub std::io::Error);

/// Raised when a Scheduler is misused by its caller (a programmer error, not a runtime
/// condition the user can be expected to recover from).
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("jobs list is empty")]
    EmptyJobs,
}

/// Raised when writing a report fails.
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("report target already exists: {0}")]
    AlreadyExists(Utf8PathBuf),

    #[error("no results to export")]
    NoResults,

    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Raised by the plugin registry.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("duplicate plugin name: {0}")]
    Duplicate(String),

    #[error("no plugin named `{0}` (known: {1})")]
    NotFound(String, String),
}

/// Raised by a [`crate::session::Session`] run.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Communication(#[from] CommunicationError),

    #[error(transparent)]
    Framework(#[from] FrameworkError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Exporter(#[from] ExporterError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("command timed out: {0:?}")]
    CommandTimeout(String),

    #[error("no tests selected")]
    NoTestsSelected,

    #[error("can't find suites: {0:?}")]
    SuitesNotFound(Vec<String>),

    #[error("{0}")]
    Other(String),
}

/// The umbrella error type returned out of the test/suite scheduling loop.
///
/// Mirrors the three kernel-health branches plus the catch-all communication error that a
/// transport can raise mid-run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Kernel(#[from] KernelEvent),

    #[error(transparent)]
    Communication(#[from] CommunicationError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
