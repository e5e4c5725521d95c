//! Linux Test Project: reads `runtest/<suite>` declaration files, augmented by
//! `metadata/ltp.json` when present to decide which tests are safe to run concurrently.

use std::collections::BTreeMap;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use regex::Regex;
use serde::Deserialize;

use crate::data::{Suite, Test};
use crate::errors::FrameworkError;
use crate::framework::Framework;
use crate::plugin::Plugin;
use crate::results::{ResultStatus, TestCounts, TestResult};
use crate::sut::Sut;

/// Any of these keys present in a test's metadata entry rules out parallel execution: each
/// names a resource (root, a device, a mount point, a save/restore state file...) that two
/// concurrent instances of the test would fight over.
const PARALLEL_BLACKLIST: [&str; 8] = [
    "needs_root",
    "needs_device",
    "mount_device",
    "mntpoint",
    "resource_file",
    "format_device",
    "save_restore",
    "max_runtime",
];

#[derive(Clone, Debug)]
pub struct LtpConfig {
    pub root: Utf8PathBuf,
    pub env: BTreeMap<String, String>,
    pub max_runtime: Option<f64>,
}

impl Default for LtpConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("LTPROOT".to_string(), "/opt/ltp".to_string());
        env.insert("TMPDIR".to_string(), "/tmp".to_string());
        env.insert("LTP_COLORIZE_OUTPUT".to_string(), "1".to_string());
        Self { root: Utf8PathBuf::from("/opt/ltp"), env, max_runtime: None }
    }
}

#[derive(Deserialize)]
struct LtpMetadata {
    tests: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

pub struct LtpFramework {
    config: LtpConfig,
    tc_folder: Utf8PathBuf,
}

impl LtpFramework {
    pub fn new(config: LtpConfig) -> Self {
        let tc_folder = config.root.join("testcases").join("bin");
        Self { config, tc_folder }
    }

    async fn read_path(&self, sut: &(dyn Sut)) -> Result<BTreeMap<String, String>, FrameworkError> {
        let mut env = self.config.env.clone();
        if let Some(path) = env.get("PATH").cloned() {
            env.insert("PATH".to_string(), format!("{path}:{}", self.tc_folder));
        } else {
            let out = sut
                .run("echo -n $PATH", None, None, None)
                .await
                .map_err(|e| FrameworkError::Generic(e.to_string()))?;
            if out.return_code != 0 {
                return Err(FrameworkError::Generic("can't read PATH variable".into()));
            }
            env.insert("PATH".to_string(), format!("{}:{}", out.stdout.trim(), self.tc_folder));
        }
        Ok(env)
    }

    fn is_addable(&self, params: &BTreeMap<String, serde_json::Value>) -> bool {
        let Some(max_runtime) = self.config.max_runtime else {
            return true;
        };
        match params.get("max_runtime").and_then(serde_json::Value::as_f64) {
            Some(runtime) if runtime >= max_runtime => false,
            _ => true,
        }
    }

    fn read_runtest(
        &self,
        suite_name: &str,
        content: &str,
        metadata: Option<&LtpMetadata>,
        env: &BTreeMap<String, String>,
    ) -> Result<Suite, FrameworkError> {
        let mut tests = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parts = shell_words::split(line)
                .map_err(|e| FrameworkError::Generic(format!("invalid runtest line `{line}`: {e}")))?;
            if parts.len() < 2 {
                return Err(FrameworkError::Generic("runtest file is not defining test command".into()));
            }

            let test_name = &parts[0];
            let test_cmd = &parts[1];
            let test_args = &parts[2..];

            let parallelizable = match metadata.and_then(|m| m.tests.get(test_name)) {
                None => false,
                Some(params) => {
                    if !self.is_addable(params) {
                        continue;
                    }
                    !PARALLEL_BLACKLIST.iter().any(|key| params.contains_key(*key))
                }
            };

            let test = Test::new(test_name.clone(), test_cmd.clone())
                .with_arguments(test_args.to_vec())
                .with_cwd(self.tc_folder.as_str())
                .with_env(env.clone())
                .with_parallelizable(parallelizable);

            tests.push(test);
        }

        Ok(Suite::new(suite_name, tests))
    }
}

#[async_trait]
impl Plugin for LtpFramework {
    fn name(&self) -> &str {
        "ltp"
    }

    fn config_help(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("root", "LTP install folder"),
            ("max_runtime", "filter out all tests above this time value"),
        ]
    }
}

#[async_trait]
impl Framework for LtpFramework {
    async fn get_suites(&self, sut: &(dyn Sut)) -> Result<Vec<String>, FrameworkError> {
        let root_check = sut
            .run(&format!("test -d {}", self.config.root), None, None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?;
        if root_check.return_code != 0 {
            return Err(FrameworkError::InstallDirMissing(self.config.root.clone()));
        }

        let runtest_dir = self.config.root.join("runtest");
        let dir_check = sut
            .run(&format!("test -d {runtest_dir}"), None, None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?;
        if dir_check.return_code != 0 {
            return Err(FrameworkError::Generic(format!("'{runtest_dir}' doesn't exist inside SUT")));
        }

        let listing = sut
            .run(&format!("ls --format=single-column {runtest_dir}"), None, None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?;
        if listing.return_code != 0 {
            return Err(FrameworkError::Generic(format!("command failed with: {}", listing.stdout)));
        }

        Ok(listing.stdout.lines().filter(|l| !l.is_empty()).map(String::from).collect())
    }

    async fn find_suite(&self, sut: &(dyn Sut), name: &str) -> Result<Suite, FrameworkError> {
        if name.is_empty() {
            return Err(FrameworkError::Generic("name is empty".into()));
        }

        let root_check = sut
            .run(&format!("test -d {}", self.config.root), None, None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?;
        if root_check.return_code != 0 {
            return Err(FrameworkError::InstallDirMissing(self.config.root.clone()));
        }

        let suite_path = self.config.root.join("runtest").join(name);
        let suite_check = sut
            .run(&format!("test -f {suite_path}"), None, None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?;
        if suite_check.return_code != 0 {
            return Err(FrameworkError::SuiteNotFound(name.to_string()));
        }

        let runtest_bytes =
            sut.fetch(suite_path.as_str()).await.map_err(|e| FrameworkError::Generic(e.to_string()))?;
        let runtest_str = String::from_utf8_lossy(&runtest_bytes).into_owned();

        let metadata_path = self.config.root.join("metadata").join("ltp.json");
        let metadata_check = sut
            .run(&format!("test -f {metadata_path}"), None, None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?;

        let metadata = if metadata_check.return_code == 0 {
            let bytes = sut
                .fetch(metadata_path.as_str())
                .await
                .map_err(|e| FrameworkError::Generic(e.to_string()))?;
            Some(
                serde_json::from_slice::<LtpMetadata>(&bytes)
                    .map_err(|e| FrameworkError::Generic(format!("invalid ltp.json: {e}")))?,
            )
        } else {
            None
        };

        let env = self.read_path(sut).await?;
        self.read_runtest(name, &runtest_str, metadata.as_ref(), &env)
    }

    async fn find_command(&self, sut: &(dyn Sut), command: &str) -> Result<Test, FrameworkError> {
        if command.is_empty() {
            return Err(FrameworkError::Generic("command is empty".into()));
        }

        let args = shell_words::split(command)
            .map_err(|e| FrameworkError::Generic(format!("invalid command: {e}")))?;
        let Some((name, rest)) = args.split_first() else {
            return Err(FrameworkError::Generic("command is empty".into()));
        };

        let tc_check = sut
            .run(&format!("test -d {}", self.tc_folder), None, None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?;

        let mut test = Test::new(name.clone(), name.clone()).with_arguments(rest.to_vec());
        if tc_check.return_code == 0 {
            let env = self.read_path(sut).await?;
            test = test.with_cwd(self.tc_folder.as_str()).with_env(env);
        }
        Ok(test)
    }

    async fn read_result(&self, test: &Test, stdout: &str, return_code: i32, exec_time: f64) -> TestResult {
        let clean = strip_ansi(stdout);

        let summary = Regex::new(
            r"Summary:\npassed\s*(?P<passed>\d+)\nfailed\s*(?P<failed>\d+)\nbroken\s*(?P<broken>\d+)\nskipped\s*(?P<skipped>\d+)\nwarnings\s*(?P<warnings>\d+)\n",
        )
        .unwrap();

        let error = return_code == -1;
        let mut counts = TestCounts::default();

        if let Some(caps) = summary.captures(&clean) {
            counts.passed = caps["passed"].parse().unwrap_or(0);
            counts.failed = caps["failed"].parse().unwrap_or(0);
            counts.broken = caps["broken"].parse().unwrap_or(0);
            counts.skipped = caps["skipped"].parse().unwrap_or(0);
            counts.warnings = caps["warnings"].parse().unwrap_or(0);
        } else {
            counts.passed = clean.matches("TPASS").count() as u32;
            counts.failed = clean.matches("TFAIL").count() as u32;
            counts.skipped = clean.matches("TSKIP").count() as u32;
            counts.broken = clean.matches("TBROK").count() as u32;
            counts.warnings = clean.matches("TWARN").count() as u32;

            let all_zero = counts.passed == 0
                && counts.failed == 0
                && counts.skipped == 0
                && counts.broken == 0
                && counts.warnings == 0;

            if all_zero {
                match return_code {
                    0 => counts.passed = 1,
                    4 => counts.warnings = 1,
                    32 => counts.skipped = 1,
                    _ if !error => counts.failed = 1,
                    _ => {}
                }
            }
        }

        let status = match return_code {
            2 | -1 => ResultStatus::Broken,
            4 => ResultStatus::Warning,
            32 => ResultStatus::Conf,
            _ if counts.passed > 0 => ResultStatus::Pass,
            _ => ResultStatus::Failed,
        };

        if error {
            counts.broken = counts.broken.max(1);
        }

        TestResult::new(test.clone(), counts, exec_time, status, return_code, clean)
    }
}

fn strip_ansi(text: &str) -> String {
    let ansi = Regex::new("\u{1b}\\[[0-9;]+[a-zA-Z]").unwrap();
    ansi.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_summary_block_when_present() {
        let framework = LtpFramework::new(LtpConfig::default());
        let test = Test::new("test01", "test01");
        let stdout = "tst_test.c:1234: INFO\nSummary:\npassed 3\nfailed 1\nbroken 0\nskipped 2\nwarnings 0\n";
        let result = framework.read_result(&test, stdout, 1, 0.5).await;
        assert_eq!(result.passed(), 3);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.skipped(), 2);
        assert_eq!(result.status(), ResultStatus::Failed);
    }

    #[tokio::test]
    async fn counts_tpass_tokens_when_no_summary_block() {
        let framework = LtpFramework::new(LtpConfig::default());
        let test = Test::new("test01", "test01");
        let stdout = "TPASS: ok\nTPASS: ok\nTFAIL: bad\n";
        let result = framework.read_result(&test, stdout, 1, 0.5).await;
        assert_eq!(result.passed(), 2);
        assert_eq!(result.failed(), 1);
    }

    #[tokio::test]
    async fn zero_retcode_with_no_tokens_counts_as_one_pass() {
        let framework = LtpFramework::new(LtpConfig::default());
        let test = Test::new("test01", "test01");
        let result = framework.read_result(&test, "plain output\n", 0, 0.1).await;
        assert_eq!(result.passed(), 1);
        assert_eq!(result.status(), ResultStatus::Pass);
    }

    #[tokio::test]
    async fn sut_error_forces_broken_status() {
        let framework = LtpFramework::new(LtpConfig::default());
        let test = Test::new("test01", "test01");
        let result = framework.read_result(&test, "", -1, 0.0).await;
        assert_eq!(result.status(), ResultStatus::Broken);
        assert!(result.broken() >= 1);
    }

    #[test]
    fn read_runtest_marks_non_metadata_tests_as_not_parallelizable() {
        let framework = LtpFramework::new(LtpConfig::default());
        let env = BTreeMap::new();
        let suite = framework
            .read_runtest("example01", "test01 /opt/ltp/testcases/bin/test01 -i 5\n", None, &env)
            .unwrap();
        assert_eq!(suite.tests.len(), 1);
        assert!(!suite.tests[0].parallelizable());
    }
}
