//! Linux kernel selftests. Only the `cgroup` suite is wired up: its tests are individually
//! built `test_*.c` binaries enumerated at runtime, unlike LTP's declarative runtest files.

use async_trait::async_trait;
use camino::Utf8PathBuf;

use crate::data::{Suite, Test};
use crate::errors::FrameworkError;
use crate::framework::Framework;
use crate::plugin::Plugin;
use crate::results::{ResultStatus, TestCounts, TestResult};
use crate::sut::Sut;

#[derive(Clone, Debug)]
pub struct KselftestConfig {
    pub root: Utf8PathBuf,
}

impl Default for KselftestConfig {
    fn default() -> Self {
        Self { root: Utf8PathBuf::from("/opt/linux/tools/testing/selftests") }
    }
}

pub struct KselftestFramework {
    config: KselftestConfig,
}

impl KselftestFramework {
    pub fn new(config: KselftestConfig) -> Self {
        Self { config }
    }

    async fn read_cgroup_suite(&self, sut: &(dyn Sut)) -> Result<Suite, FrameworkError> {
        let cgroup_dir = self.config.root.join("cgroup");

        let check = sut
            .run(&format!("test -d {cgroup_dir}"), None, None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?;
        if check.return_code != 0 {
            return Err(FrameworkError::Generic(format!("cgroup folder is not available: {cgroup_dir}")));
        }

        let listing = sut
            .run("basename -s .c -- test_*.c", Some(cgroup_dir.as_str()), None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?;
        if listing.return_code != 0 || listing.stdout.is_empty() {
            return Err(FrameworkError::Generic("can't read cgroup tests".into()));
        }

        let tests = listing
            .stdout
            .lines()
            .filter(|name| !name.is_empty())
            .map(|name| {
                Test::new(name, cgroup_dir.join(name).as_str())
                    .with_cwd(cgroup_dir.as_str())
                    .with_parallelizable(false)
            })
            .collect();

        Ok(Suite::new("cgroup", tests))
    }
}

#[async_trait]
impl Plugin for KselftestFramework {
    fn name(&self) -> &str {
        "kselftest"
    }

    fn config_help(&self) -> Vec<(&'static str, &'static str)> {
        vec![("root", "kselftest folder")]
    }
}

#[async_trait]
impl Framework for KselftestFramework {
    async fn get_suites(&self, _sut: &(dyn Sut)) -> Result<Vec<String>, FrameworkError> {
        Ok(vec!["cgroup".to_string()])
    }

    async fn find_suite(&self, sut: &(dyn Sut), name: &str) -> Result<Suite, FrameworkError> {
        if name.is_empty() {
            return Err(FrameworkError::Generic("name is empty".into()));
        }

        let check = sut
            .run(&format!("test -d {}", self.config.root), None, None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?;
        if check.return_code != 0 {
            return Err(FrameworkError::InstallDirMissing(self.config.root.clone()));
        }

        match name {
            "cgroup" => self.read_cgroup_suite(sut).await,
            other => Err(FrameworkError::SuiteNotFound(other.to_string())),
        }
    }

    async fn find_command(&self, _sut: &(dyn Sut), command: &str) -> Result<Test, FrameworkError> {
        if command.is_empty() {
            return Err(FrameworkError::Generic("command is empty".into()));
        }
        let args = shell_words::split(command)
            .map_err(|e| FrameworkError::Generic(format!("invalid command: {e}")))?;
        let Some((name, rest)) = args.split_first() else {
            return Err(FrameworkError::Generic("command is empty".into()));
        };
        Ok(Test::new(name.clone(), name.clone()).with_arguments(rest.to_vec()))
    }

    async fn read_result(&self, test: &Test, stdout: &str, return_code: i32, exec_time: f64) -> TestResult {
        let error = return_code == -1;
        let mut counts = TestCounts::default();

        match return_code {
            0 => counts.passed = 1,
            4 => counts.skipped = 1,
            _ if !error => counts.failed = 1,
            _ => {}
        }
        if error {
            counts.broken = 1;
        }

        let status = if counts.broken > 0 {
            ResultStatus::Broken
        } else if counts.failed > 0 {
            ResultStatus::Failed
        } else if counts.skipped > 0 {
            ResultStatus::Conf
        } else {
            ResultStatus::Pass
        };

        TestResult::new(test.clone(), counts, exec_time, status, return_code, stdout.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retcode_zero_is_a_pass() {
        let framework = KselftestFramework::new(KselftestConfig::default());
        let test = Test::new("test_memcg", "test_memcg");
        let result = framework.read_result(&test, "", 0, 0.2).await;
        assert_eq!(result.passed(), 1);
        assert_eq!(result.status(), ResultStatus::Pass);
    }

    #[tokio::test]
    async fn retcode_four_is_skipped() {
        let framework = KselftestFramework::new(KselftestConfig::default());
        let test = Test::new("test_memcg", "test_memcg");
        let result = framework.read_result(&test, "", 4, 0.2).await;
        assert_eq!(result.skipped(), 1);
        assert_eq!(result.status(), ResultStatus::Conf);
    }
}
