//! Worker-pool partitioned execution of a flat test list.
//!
//! Every test runs behind a semaphore sized to 1 (serial) or `max_workers` (parallel). Around
//! each run the scheduler snapshots `/proc/sys/kernel/tainted` before and after, watches for a
//! panic surfacing out of the transport, and escalates a timed-out test into a kernel-timeout
//! verdict if the SUT also fails to answer a follow-up ping.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::time::{timeout, Duration};

use crate::data::Test;
use crate::errors::{CommunicationError, KernelEvent, RunError, SchedulerError};
use crate::event_bus::{EventBus, KirkEvent};
use crate::framework::Framework;
use crate::results::{ResultStatus, TestCounts, TestResult};
use crate::scheduler::RedirectTestStdout;
use crate::sut::{IoBuffer, Sut};

const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct TestSchedulerConfig {
    pub timeout: Duration,
    pub max_workers: usize,
    pub force_parallel: bool,
}

impl Default for TestSchedulerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            max_workers: 1,
            force_parallel: false,
        }
    }
}

pub struct TestScheduler {
    sut: Arc<dyn Sut>,
    framework: Arc<dyn Framework>,
    events: EventBus,
    config: TestSchedulerConfig,
    results: AsyncMutex<Vec<TestResult>>,
    stop_flag: AtomicBool,
    stopped: AtomicBool,
    running_sem: AsyncMutex<Arc<Semaphore>>,
    running_capacity: AtomicUsize,
    schedule_lock: AsyncMutex<()>,
}

impl TestScheduler {
    pub fn new(
        sut: Arc<dyn Sut>,
        framework: Arc<dyn Framework>,
        events: EventBus,
        config: TestSchedulerConfig,
    ) -> Self {
        Self {
            sut,
            framework,
            events,
            config,
            results: AsyncMutex::new(Vec::new()),
            stop_flag: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            running_sem: AsyncMutex::new(Arc::new(Semaphore::new(1))),
            running_capacity: AtomicUsize::new(1),
            schedule_lock: AsyncMutex::new(()),
        }
    }

    pub async fn results(&self) -> Vec<TestResult> {
        self.results.lock().await.clone()
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Requests that the current/next `schedule` call stop launching new tests, then blocks
    /// until every test already running has finished.
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);

        let sem = self.running_sem.lock().await.clone();
        let capacity = self.running_capacity.load(Ordering::SeqCst).max(1) as u32;
        if let Ok(permits) = sem.acquire_many(capacity).await {
            drop(permits);
        }

        let _guard = self.schedule_lock.lock().await;

        self.stop_flag.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn write_kmsg(&self, test: &Test) {
        if !matches!(self.sut.logged_as_root().await, Ok(true)) {
            return;
        }
        let marker = format!("echo 'kirk: starting test {}' > /dev/kmsg", test.name());
        let _ = self.sut.run(&marker, None, None, None).await;
    }

    async fn record(&self, result: TestResult) {
        self.results.lock().await.push(result);
    }

    async fn run_test(&self, test: Test) -> Result<(), RunError> {
        let sem = self.running_sem.lock().await.clone();
        let _permit = sem.acquire().await.expect("semaphore is never closed");

        if self.stop_flag.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.events.fire(KirkEvent::TestStarted { test: test.clone() });
        self.write_kmsg(&test).await;

        let tainted_before = self.sut.get_tainted().await.ok();

        let iobuf = RedirectTestStdout::new(test.name().to_string(), self.events.clone());
        let cmd = test.full_command();
        let env = if test.env().is_empty() { None } else { Some(test.env()) };

        let outcome = timeout(
            self.config.timeout,
            self.sut.run(&cmd, test.cwd(), env, Some(&iobuf as &dyn IoBuffer)),
        )
        .await;

        let result = match outcome {
            Ok(Ok(run_outcome)) => {
                let tainted_after = self.sut.get_tainted().await.ok();
                let result = self
                    .framework
                    .read_result(&test, &run_outcome.stdout, run_outcome.return_code, run_outcome.exec_time)
                    .await;

                if tainted_before.is_some() && tainted_before != tainted_after {
                    let messages = tainted_after.map(|(_, m)| m).unwrap_or_default();
                    self.record(result).await;
                    self.events.fire(KirkEvent::KernelTainted {
                        messages: messages.clone(),
                    });
                    return Err(RunError::Kernel(KernelEvent::Tainted(messages)));
                }

                result
            }
            Ok(Err(CommunicationError::Panic)) => {
                let result = TestResult::broken(test.clone(), String::new(), 0.0);
                self.record(result).await;
                self.events.fire(KirkEvent::KernelPanic);
                return Err(RunError::Kernel(KernelEvent::Panic));
            }
            Ok(Err(err)) => return Err(RunError::Communication(err)),
            Err(_elapsed) => {
                let exec_time = self.config.timeout.as_secs_f64();
                match timeout(PING_TIMEOUT, self.sut.ping()).await {
                    Ok(Ok(_)) => {
                        let result = TestResult::broken(test.clone(), String::new(), exec_time);
                        self.record(result).await;
                        return Err(RunError::Communication(CommunicationError::Protocol(
                            "test timed out".into(),
                        )));
                    }
                    _ => {
                        let result = TestResult::broken(test.clone(), String::new(), exec_time);
                        self.record(result).await;
                        self.events.fire(KirkEvent::SutNotResponding);
                        return Err(RunError::Kernel(KernelEvent::Timeout));
                    }
                }
            }
        };

        self.events.fire(KirkEvent::TestCompleted { result: result.clone() });
        self.record(result).await;
        Ok(())
    }

    async fn run_and_wait(&self, tests: Vec<Test>) -> Result<(), RunError> {
        *self.running_sem.lock().await = Arc::new(Semaphore::new(1));
        self.running_capacity.store(1, Ordering::SeqCst);

        for test in tests {
            self.run_test(test).await?;
        }
        Ok(())
    }

    async fn run_parallel(&self, tests: Vec<Test>) -> Result<(), RunError> {
        let workers = self.config.max_workers.max(1);
        *self.running_sem.lock().await = Arc::new(Semaphore::new(workers));
        self.running_capacity.store(workers, Ordering::SeqCst);

        let results = futures::future::join_all(tests.into_iter().map(|test| self.run_test(test))).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Runs `jobs` to completion. If `force_parallel` every test runs concurrently; otherwise,
    /// when `max_workers > 1`, parallelizable tests run concurrently first and the remainder
    /// run serially afterwards. A kernel event or communication error aborts the batch once
    /// in-flight tests (if any) have drained, but is swallowed (returns `Ok`) if `stop` was
    /// the cause.
    pub async fn schedule(&self, jobs: Vec<Test>) -> Result<(), RunError> {
        if jobs.is_empty() {
            return Err(RunError::Scheduler(SchedulerError::EmptyJobs));
        }

        let _guard = self.schedule_lock.lock().await;
        self.results.lock().await.clear();

        let outcome = if self.config.force_parallel {
            self.run_parallel(jobs).await
        } else if self.config.max_workers > 1 {
            let (parallel, serial): (Vec<Test>, Vec<Test>) =
                jobs.into_iter().partition(|t| t.parallelizable());

            let mut outcome = Ok(());
            if !parallel.is_empty() {
                outcome = self.run_parallel(parallel).await;
            }
            if outcome.is_ok() && !serial.is_empty() {
                outcome = self.run_and_wait(serial).await;
            }
            outcome
        } else {
            self.run_and_wait(jobs).await
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(err) if self.stop_flag.load(Ordering::SeqCst) => {
                let _ = err;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::errors::FrameworkError;
    use crate::plugin::Plugin;
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
            if command.contains("kernel/tainted") {
                return Ok(RunOutcome {
                    command: command.to_string(),
                    return_code: 0,
                    stdout: "0".to_string(),
                    exec_time: 0.0,
                });
            }
            if command.contains("id -u") {
                return Ok(RunOutcome {
                    command: command.to_string(),
                    return_code: 0,
                    stdout: "1000".to_string(),
                    exec_time: 0.0,
                });
            }
            Ok(RunOutcome {
                command: command.to_string(),
                return_code: 0,
                stdout: "ok\n".to_string(),
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

        async fn find_suite(&self, _sut: &(dyn Sut), _name: &str) -> Result<crate::data::Suite, FrameworkError> {
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
        let scheduler = TestScheduler::new(sut, Arc::new(EchoFramework), EventBus::new(), TestSchedulerConfig::default());
        let err = scheduler.schedule(Vec::new()).await.unwrap_err();
        assert!(matches!(err, RunError::Scheduler(SchedulerError::EmptyJobs)));
    }

    #[tokio::test]
    async fn schedule_runs_each_test_and_records_a_pass() {
        let sut = Arc::new(OkSut {
            tainted: TaintedCache::new(),
            calls: AtomicU32::new(0),
        });
        let scheduler = TestScheduler::new(sut, Arc::new(EchoFramework), EventBus::new(), TestSchedulerConfig::default());

        let tests = vec![Test::new("t1", "true"), Test::new("t2", "true")];
        scheduler.schedule(tests).await.unwrap();

        let results = scheduler.results().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status() == ResultStatus::Pass));
    }

    struct TaintsAfterFirstReadSut {
        tainted: TaintedCache,
        tainted_reads: AtomicU32,
    }

    #[async_trait]
    impl Plugin for TaintsAfterFirstReadSut {
        fn name(&self) -> &str {
            "taints-after-first-read"
        }
    }

    #[async_trait]
    impl Sut for TaintsAfterFirstReadSut {
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
            if command.contains("kernel/tainted") {
                let read = self.tainted_reads.fetch_add(1, Ordering::SeqCst);
                let code = if read == 0 { "0" } else { "1" };
                return Ok(RunOutcome {
                    command: command.to_string(),
                    return_code: 0,
                    stdout: code.to_string(),
                    exec_time: 0.0,
                });
            }
            if command.contains("id -u") {
                return Ok(RunOutcome {
                    command: command.to_string(),
                    return_code: 0,
                    stdout: "1000".to_string(),
                    exec_time: 0.0,
                });
            }
            Ok(RunOutcome {
                command: command.to_string(),
                return_code: 7,
                stdout: "real output".to_string(),
                exec_time: 0.02,
            })
        }

        async fn fetch(&self, _path: &str) -> Result<Vec<u8>, CommunicationError> {
            Ok(Vec::new())
        }

        fn tainted_cache(&self) -> &TaintedCache {
            &self.tainted
        }
    }

    #[tokio::test]
    async fn tainted_test_still_records_the_real_parsed_result() {
        let sut = Arc::new(TaintsAfterFirstReadSut {
            tainted: TaintedCache::new(),
            tainted_reads: AtomicU32::new(0),
        });
        let scheduler = TestScheduler::new(sut, Arc::new(EchoFramework), EventBus::new(), TestSchedulerConfig::default());

        let err = scheduler.schedule(vec![Test::new("t1", "true")]).await.unwrap_err();
        assert!(matches!(err, RunError::Kernel(KernelEvent::Tainted(_))));

        let results = scheduler.results().await;
        assert_eq!(results.len(), 1);
        // The real outcome, as parsed by the framework, must survive the taint detection: not a
        // synthesized broken/-1 record.
        assert_eq!(results[0].status(), ResultStatus::Pass);
        assert_eq!(results[0].return_code(), 7);
        assert_eq!(results[0].stdout(), "real output");
    }

    #[tokio::test]
    async fn schedule_partitions_parallel_tests_before_serial_ones() {
        let sut = Arc::new(OkSut {
            tainted: TaintedCache::new(),
            calls: AtomicU32::new(0),
        });
        let config = TestSchedulerConfig {
            max_workers: 4,
            ..TestSchedulerConfig::default()
        };
        let scheduler = TestScheduler::new(sut, Arc::new(EchoFramework), EventBus::new(), config);

        let tests = vec![
            Test::new("par1", "true").with_parallelizable(true),
            Test::new("ser1", "true"),
        ];
        scheduler.schedule(tests).await.unwrap();

        assert_eq!(scheduler.results().await.len(), 2);
    }
}
