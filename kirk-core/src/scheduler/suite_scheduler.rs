//! Drives a sequence of suites through an inner [`TestScheduler`], rebooting the SUT whenever
//! a kernel event surfaces and resuming with whatever tests of the current suite haven't run
//! yet. A suite that overruns its own timeout has its remaining tests synthesized as skipped
//! (CONF) rather than retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::{timeout, Duration};

use crate::data::Suite;
use crate::errors::{RunError, SchedulerError};
use crate::event_bus::{EventBus, KirkEvent};
use crate::framework::Framework;
use crate::results::{SuiteResult, TestResult};
use crate::scheduler::test_scheduler::{TestScheduler, TestSchedulerConfig};
use crate::scheduler::RedirectSutStdout;
use crate::sut::{IoBuffer, Sut};

#[derive(Clone, Debug)]
pub struct SuiteSchedulerConfig {
    pub suite_timeout: Duration,
    pub exec_timeout: Duration,
    pub max_workers: usize,
    pub force_parallel: bool,
}

impl Default for SuiteSchedulerConfig {
    fn default() -> Self {
        Self {
            suite_timeout: Duration::from_secs(3600),
            exec_timeout: Duration::from_secs(3600),
            max_workers: 1,
            force_parallel: false,
        }
    }
}

pub struct SuiteScheduler {
    sut: Arc<dyn Sut>,
    events: EventBus,
    config: SuiteSchedulerConfig,
    inner: TestScheduler,
    results: AsyncMutex<Vec<SuiteResult>>,
    stop_flag: AtomicBool,
    reboot_lock: AsyncMutex<()>,
    reboot_notify: Notify,
    schedule_lock: AsyncMutex<()>,
}

impl SuiteScheduler {
    pub fn new(sut: Arc<dyn Sut>, framework: Arc<dyn Framework>, events: EventBus, config: SuiteSchedulerConfig) -> Self {
        let inner = TestScheduler::new(
            sut.clone(),
            framework,
            events.clone(),
            TestSchedulerConfig {
                timeout: config.exec_timeout,
                max_workers: config.max_workers,
                force_parallel: config.force_parallel,
            },
        );

        Self {
            sut,
            events,
            config,
            inner,
            results: AsyncMutex::new(Vec::new()),
            stop_flag: AtomicBool::new(false),
            reboot_lock: AsyncMutex::new(()),
            reboot_notify: Notify::new(),
            schedule_lock: AsyncMutex::new(()),
        }
    }

    pub async fn results(&self) -> Vec<SuiteResult> {
        self.results.lock().await.clone()
    }

    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.inner.stop().await;
        let _guard = self.schedule_lock.lock().await;
        self.stop_flag.store(false, Ordering::SeqCst);
    }

    async fn restart_sut(&self) {
        let _guard = self.reboot_lock.lock().await;
        self.events.fire(KirkEvent::SutRestart {
            name: self.sut.name().to_string(),
        });

        self.inner.stop().await;

        let iobuf = RedirectSutStdout::new(self.sut.name().to_string(), self.events.clone());
        let _ = self.sut.stop(Some(&iobuf as &dyn IoBuffer)).await;
        let _ = self.sut.ensure_start(Some(&iobuf as &dyn IoBuffer), 3).await;
    }

    async fn run_suite(&self, suite: Suite) -> SuiteResult {
        self.events.fire(KirkEvent::SuiteStarted { suite: suite.clone() });

        let info = self.sut.get_info().await;
        let mut tests_results: Vec<TestResult> = Vec::new();
        let mut exec_times: Vec<f64> = Vec::new();
        let mut timed_out = false;
        let mut tests_left = suite.tests.clone();

        while !self.stop_flag.load(Ordering::SeqCst) && !tests_left.is_empty() {
            let start = Instant::now();

            match timeout(self.config.suite_timeout, self.inner.schedule(tests_left.clone())).await {
                Err(_elapsed) => {
                    self.events.fire(KirkEvent::SuiteTimeout {
                        suite_name: suite.name.clone(),
                        timeout_secs: self.config.suite_timeout.as_secs_f64(),
                    });
                    timed_out = true;
                }
                Ok(Err(RunError::Kernel(_))) => {
                    if self.reboot_lock.try_lock().is_err() {
                        self.reboot_notify.notified().await;
                    } else {
                        self.restart_sut().await;
                        self.reboot_notify.notify_waiters();
                    }
                }
                Ok(Err(RunError::Scheduler(SchedulerError::EmptyJobs))) | Ok(Ok(())) => {}
                Ok(Err(RunError::Communication(_))) => {}
            }

            exec_times.push(start.elapsed().as_secs_f64());
            tests_results.extend(self.inner.results().await);

            tests_left = suite
                .tests
                .iter()
                .filter(|t| !tests_results.iter().any(|r| r.test().name() == t.name()))
                .cloned()
                .collect();

            if timed_out {
                for test in &tests_left {
                    tests_results.push(TestResult::skipped_overrun(test.clone()));
                }
                tests_left.clear();
            }
        }

        let suite_exec_time = if exec_times.is_empty() {
            self.config.suite_timeout.as_secs_f64()
        } else {
            exec_times.iter().sum()
        };

        let result = SuiteResult::new(&suite, tests_results, info);
        self.events.fire(KirkEvent::SuiteCompleted {
            result: result.clone(),
            exec_time: suite_exec_time,
        });
        result
    }

    /// Runs each suite in `jobs` to completion, in order. Suites are never run concurrently
    /// with each other; within a suite, parallelism is whatever the inner scheduler provides.
    pub async fn schedule(&self, jobs: Vec<Suite>) -> Result<(), RunError> {
        if jobs.is_empty() {
            return Err(RunError::Scheduler(SchedulerError::EmptyJobs));
        }

        let _guard = self.schedule_lock.lock().await;
        self.results.lock().await.clear();

        for suite in jobs {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            let result = self.run_suite(suite).await;
            self.results.lock().await.push(result);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::data::Test;
    use crate::errors::{CommunicationError, FrameworkError};
    use crate::plugin::Plugin;
    use crate::results::{ResultStatus, TestCounts};
    use crate::sut::{RunOutcome, TaintedCache};

    struct OkSut {
        tainted: TaintedCache,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Plugin for OkSut {
        fn name(&self) -> &str {
            "ok"
        }
    }

    #[async_trait]
    impl Sut for OkSut {
        fn parallel_ok(&self) -> bool {
            true
        }

        async fn is_running(&self) -> bool {
            true
        }

        async fn start(&self, _iobuf: Option<&(dyn IoBuffer)>) -> Result<(), CommunicationError> {
            Ok(())
        }

        async fn stop(&self, _iobuf: Option<&(dyn IoBuffer)>) -> Result<(), CommunicationError> {
            Ok(())
        }

        async fn ping(&self) -> Result<f64, CommunicationError> {
            Ok(0.0)
        }

        async fn run(
            &self,
            command: &str,
            _cwd: Option<&str>,
            _env: Option<&BTreeMap<String, String>>,
            _iobuf: Option<&(dyn IoBuffer)>,
        ) -> Result<RunOutcome, CommunicationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let stdout = if command.contains("kernel/tainted") {
                "0".to_string()
            } else if command.contains("id -u") {
                "1000".to_string()
            } else if command.contains("os-release") || command.contains("uname") || command.contains("meminfo") {
                "unknown".to_string()
            } else {
                "ok\n".to_string()
            };
            Ok(RunOutcome {
                command: command.to_string(),
                return_code: 0,
                stdout,
                exec_time: 0.01,
            })
        }

        async fn fetch(&self, _path: &str) -> Result<Vec<u8>, CommunicationError> {
            Ok(Vec::new())
        }

        fn tainted_cache(&self) -> &TaintedCache {
            &self.tainted
        }
    }

    struct EchoFramework;

    #[async_trait]
    impl Plugin for EchoFramework {
        fn name(&self) -> &str {
            "echo"
        }
    }

    #[async_trait]
    impl Framework for EchoFramework {
        async fn get_suites(&self, _sut: &(dyn Sut)) -> Result<Vec<String>, FrameworkError> {
            Ok(Vec::new())
        }

        async fn find_suite(&self, _sut: &(dyn Sut), _name: &str) -> Result<Suite, FrameworkError> {
            unreachable!()
        }

        async fn find_command(&self, _sut: &(dyn Sut), _command: &str) -> Result<Test, FrameworkError> {
            unreachable!()
        }

        async fn read_result(&self, test: &Test, stdout: &str, return_code: i32, exec_time: f64) -> TestResult {
            TestResult::new(
                test.clone(),
                TestCounts {
                    passed: 1,
                    ..Default::default()
                },
                exec_time,
                ResultStatus::Pass,
                return_code,
                stdout.to_string(),
            )
        }
    }

    #[tokio::test]
    async fn schedule_rejects_empty_job_list() {
        let sut = Arc::new(OkSut {
            tainted: TaintedCache::new(),
            calls: AtomicU32::new(0),
        });
        let scheduler = SuiteScheduler::new(sut, Arc::new(EchoFramework), EventBus::new(), SuiteSchedulerConfig::default());
        let err = scheduler.schedule(Vec::new()).await.unwrap_err();
        assert!(matches!(err, RunError::Scheduler(SchedulerError::EmptyJobs)));
    }

    #[tokio::test]
    async fn schedule_runs_every_suite_and_records_results() {
        let sut = Arc::new(OkSut {
            tainted: TaintedCache::new(),
            calls: AtomicU32::new(0),
        });
        let scheduler = SuiteScheduler::new(sut, Arc::new(EchoFramework), EventBus::new(), SuiteSchedulerConfig::default());

        let suite = Suite::new("s1", vec![Test::new("t1", "true"), Test::new("t2", "true")]);
        scheduler.schedule(vec![suite]).await.unwrap();

        let results = scheduler.results().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tests.len(), 2);
        assert_eq!(results[0].passed(), 2);
    }
}
