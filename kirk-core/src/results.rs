//! Result aggregation: per-test and per-suite outcomes.

use crate::data::{Suite, Test};

/// Overall status of a single test.
///
/// Values match the historical LTP return-code convention so that status and numeric return
/// code stay in lockstep: `PASS=0`, `BROK=2`, `WARN=4`, `FAIL=16`, `CONF=32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum ResultStatus {
    Pass = 0,
    Broken = 2,
    Warning = 4,
    Failed = 16,
    Conf = 32,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Pass => "pass",
            ResultStatus::Broken => "brok",
            ResultStatus::Warning => "warn",
            ResultStatus::Failed => "fail",
            ResultStatus::Conf => "conf",
        }
    }
}

/// The outcome of running a single [`Test`].
///
/// Invariant: if `return_code == -1` then `status == Broken` and `broken >= 1` (see
/// [`TestResult::new`], which is the only constructor and enforces it).
#[derive(Clone, Debug)]
pub struct TestResult {
    test: Test,
    passed: u32,
    failed: u32,
    broken: u32,
    skipped: u32,
    warnings: u32,
    exec_time: f64,
    status: ResultStatus,
    return_code: i32,
    stdout: String,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub broken: u32,
    pub skipped: u32,
    pub warnings: u32,
}

impl TestResult {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        test: Test,
        counts: TestCounts,
        exec_time: f64,
        status: ResultStatus,
        return_code: i32,
        stdout: String,
    ) -> Self {
        let mut counts = counts;
        if return_code == -1 {
            debug_assert!(
                status == ResultStatus::Broken,
                "return_code -1 must carry status Broken"
            );
            if counts.broken == 0 {
                counts.broken = 1;
            }
        }

        Self {
            test,
            passed: counts.passed,
            failed: counts.failed,
            broken: counts.broken,
            skipped: counts.skipped,
            warnings: counts.warnings,
            exec_time: exec_time.max(0.0),
            status,
            return_code,
            stdout,
        }
    }

    /// Synthesizes a broken result for a test that never produced a usable process result
    /// (SUT call failed, panic, unresponsive kernel).
    pub fn broken(test: Test, stdout: String, exec_time: f64) -> Self {
        Self::new(
            test,
            TestCounts {
                broken: 1,
                ..Default::default()
            },
            exec_time,
            ResultStatus::Broken,
            -1,
            stdout,
        )
    }

    /// Synthesizes a skipped (CONF) result used to fill in tests that never ran because
    /// their suite overran its timeout budget.
    pub fn skipped_overrun(test: Test) -> Self {
        Self::new(
            test,
            TestCounts {
                skipped: 1,
                ..Default::default()
            },
            0.0,
            ResultStatus::Conf,
            32,
            String::new(),
        )
    }

    pub fn test(&self) -> &Test {
        &self.test
    }

    pub fn passed(&self) -> u32 {
        self.passed
    }

    pub fn failed(&self) -> u32 {
        self.failed
    }

    pub fn broken(&self) -> u32 {
        self.broken
    }

    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    pub fn warnings(&self) -> u32 {
        self.warnings
    }

    pub fn exec_time(&self) -> f64 {
        self.exec_time
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    pub fn return_code(&self) -> i32 {
        self.return_code
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }
}

/// Best-effort snapshot of the SUT's identity, captured once per suite start.
///
/// Unresolved subfields default to the literal string `"unknown"`, never to an empty string
/// or `None` — downstream report consumers rely on every field being present.
#[derive(Clone, Debug)]
pub struct SutInfo {
    pub distro: String,
    pub distro_ver: String,
    pub kernel: String,
    pub arch: String,
    pub cpu: String,
    pub ram: String,
    pub swap: String,
}

impl Default for SutInfo {
    fn default() -> Self {
        let unknown = || "unknown".to_string();
        Self {
            distro: unknown(),
            distro_ver: unknown(),
            kernel: unknown(),
            arch: unknown(),
            cpu: unknown(),
            ram: unknown(),
            swap: unknown(),
        }
    }
}

/// Aggregate of every [`TestResult`] produced while running one [`Suite`], plus the SUT
/// snapshot taken at suite start.
#[derive(Clone, Debug)]
pub struct SuiteResult {
    pub suite_name: String,
    pub tests: Vec<TestResult>,
    pub info: SutInfo,
}

impl SuiteResult {
    pub fn new(suite: &Suite, tests: Vec<TestResult>, info: SutInfo) -> Self {
        Self {
            suite_name: suite.name.clone(),
            tests,
            info,
        }
    }

    pub fn passed(&self) -> u32 {
        self.tests.iter().map(TestResult::passed).sum()
    }

    pub fn failed(&self) -> u32 {
        self.tests.iter().map(TestResult::failed).sum()
    }

    pub fn broken(&self) -> u32 {
        self.tests.iter().map(TestResult::broken).sum()
    }

    pub fn skipped(&self) -> u32 {
        self.tests.iter().map(TestResult::skipped).sum()
    }

    pub fn warnings(&self) -> u32 {
        self.tests.iter().map(TestResult::warnings).sum()
    }

    pub fn exec_time(&self) -> f64 {
        self.tests.iter().map(TestResult::exec_time).sum()
    }
}
