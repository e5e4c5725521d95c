//! Framework adapter: translates a testing project's on-disk layout (runtest files, Makefile
//! targets, directory conventions) into [`Suite`]/[`Test`] descriptors and interprets a test's
//! stdout/return code into a [`TestResult`].

pub mod kselftest;
pub mod liburing;
pub mod ltp;

use async_trait::async_trait;

use crate::data::{Suite, Test};
use crate::errors::FrameworkError;
use crate::plugin::Plugin;
use crate::results::TestResult;
use crate::sut::Sut;

/// Capability set every supported testing project implements.
#[async_trait]
pub trait Framework: Plugin + Send + Sync {
    /// Names of the suites available inside the SUT.
    async fn get_suites(&self, sut: &(dyn Sut)) -> Result<Vec<String>, FrameworkError>;

    /// Resolves one named suite into its full test list.
    async fn find_suite(&self, sut: &(dyn Sut), name: &str) -> Result<Suite, FrameworkError>;

    /// Wraps a one-off shell command into a [`Test`], so the same scheduler path runs both
    /// suites and ad hoc commands.
    async fn find_command(&self, sut: &(dyn Sut), command: &str) -> Result<Test, FrameworkError>;

    /// Interprets a finished test's raw output into pass/fail/skip/broken counts.
    async fn read_result(&self, test: &Test, stdout: &str, return_code: i32, exec_time: f64) -> TestResult;
}
