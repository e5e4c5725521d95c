//! liburing test suite: test binaries are read from the project's `Makefile` rather than a
//! declaration file, and parallel-safety is inferred by grepping each test's source for
//! socket/thread/file usage.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use regex::Regex;

use crate::data::{Suite, Test};
use crate::errors::FrameworkError;
use crate::framework::Framework;
use crate::plugin::Plugin;
use crate::results::{ResultStatus, TestCounts, TestResult};
use crate::sut::Sut;

#[derive(Clone, Debug)]
pub struct LiburingConfig {
    pub root: Utf8PathBuf,
}

impl Default for LiburingConfig {
    fn default() -> Self {
        Self { root: Utf8PathBuf::from("/opt/liburing/test") }
    }
}

pub struct LiburingFramework {
    config: LiburingConfig,
}

impl LiburingFramework {
    pub fn new(config: LiburingConfig) -> Self {
        Self { config }
    }

    async fn read_tests(&self, sut: &(dyn Sut)) -> Result<Vec<String>, FrameworkError> {
        let check = sut
            .run(&format!("test -d {}", self.config.root), None, None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?;
        if check.return_code != 0 {
            return Err(FrameworkError::InstallDirMissing(self.config.root.clone()));
        }

        let out = sut
            .run(
                r"make -pnB | grep -E '^test_targets\s:?=\s'",
                Some(self.config.root.as_str()),
                None,
                None,
            )
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?;
        if out.return_code != 0 {
            return Err(FrameworkError::Generic(format!("can't read liburing tests list: {}", out.stdout)));
        }

        let re = Regex::new(r"test_targets\s:?=\s(?P<tests>.*)").unwrap();
        let Some(caps) = re.captures(&out.stdout) else {
            return Err(FrameworkError::Generic(format!("can't read liburing tests list: {}", out.stdout)));
        };

        Ok(caps["tests"].trim().split(' ').filter(|t| !t.is_empty()).map(String::from).collect())
    }

    async fn is_parallelizable(&self, sut: &(dyn Sut), cmd: &str) -> Result<bool, FrameworkError> {
        let mut test_src = format!("{cmd}.c");
        if sut
            .run(&format!("test -f {test_src}"), None, None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?
            .return_code
            != 0
        {
            test_src = format!("{cmd}.cc");
        }

        if sut
            .run(&format!("test -f {test_src}"), None, None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?
            .return_code
            != 0
        {
            return Ok(false);
        }

        let grep = sut
            .run(&format!(r"grep -E 'socket.h|pthread.h|open\(' {test_src}"), None, None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?;

        Ok(grep.return_code != 0)
    }
}

#[async_trait]
impl Plugin for LiburingFramework {
    fn name(&self) -> &str {
        "liburing"
    }

    fn config_help(&self) -> Vec<(&'static str, &'static str)> {
        vec![("root", "liburing test folder")]
    }
}

#[async_trait]
impl Framework for LiburingFramework {
    async fn get_suites(&self, _sut: &(dyn Sut)) -> Result<Vec<String>, FrameworkError> {
        Ok(vec!["default".to_string()])
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

        let names = self.read_tests(sut).await?;
        let mut tests = Vec::new();

        for name in names {
            let cmd = self.config.root.join(&name);
            let exists = sut
                .run(&format!("test -f {cmd}"), None, None, None)
                .await
                .map_err(|e| FrameworkError::Generic(e.to_string()))?;
            if exists.return_code != 0 {
                continue;
            }

            let parallelizable = self.is_parallelizable(sut, cmd.as_str()).await?;

            // The '<cwd>/test' notation is deliberate: some tests share a name with common
            // shell builtins and would otherwise resolve to those instead.
            tests.push(
                Test::new(name, cmd.as_str())
                    .with_cwd(self.config.root.as_str())
                    .with_parallelizable(parallelizable),
            );
        }

        Ok(Suite::new("default", tests))
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

        let check = sut
            .run(&format!("test -d {}", self.config.root), None, None, None)
            .await
            .map_err(|e| FrameworkError::Generic(e.to_string()))?;

        let mut test = Test::new(name.clone(), name.clone()).with_arguments(rest.to_vec());
        if check.return_code == 0 {
            test = test.with_cwd(self.config.root.as_str());
        }
        Ok(test)
    }

    async fn read_result(&self, test: &Test, stdout: &str, return_code: i32, exec_time: f64) -> TestResult {
        let error = return_code == -1;
        let mut counts = TestCounts::default();

        let skip_re = Regex::new(r"[Ss]kip(ped|ping)?").unwrap();
        counts.skipped = skip_re.find_iter(&stdout.to_lowercase()).count() as u32;

        let mut status = ResultStatus::Pass;
        if return_code == 0 {
            counts.passed = 1;
        } else if !error {
            status = ResultStatus::Failed;
            counts.failed = 1;
        }
        if error {
            status = ResultStatus::Broken;
            counts.broken = 1;
        }

        TestResult::new(test.clone(), counts, exec_time, status, return_code, stdout.to_string())
    }
}
