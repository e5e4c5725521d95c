//! Top-level driver: starts the SUT, resolves/filters/iterates the requested suites, runs them
//! through a [`SuiteScheduler`], and writes a JSON report when done.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use camino::Utf8PathBuf;
use rand::seq::SliceRandom;
use regex::Regex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Duration;

use crate::data::Suite;
use crate::errors::SessionError;
use crate::event_bus::{EventBus, KirkEvent};
use crate::export::{Exporter, JsonExporter};
use crate::framework::Framework;
use crate::scheduler::{RedirectSutStdout, SuiteScheduler, SuiteSchedulerConfig};
use crate::sut::{IoBuffer, Sut};
use crate::tempdir::TempDir;

struct RedirectCommandStdout {
    events: EventBus,
}

#[async_trait]
impl IoBuffer for RedirectCommandStdout {
    async fn write(&self, data: &str) {
        self.events.fire(KirkEvent::RunCmdStdout { data: data.to_string() });
    }
}

/// Constructor arguments for [`Session`], mirroring [`SuiteSchedulerConfig`] plus the pieces
/// the scheduler doesn't own (tmpdir, framework/sut handles, event bus).
pub struct SessionConfig {
    pub tmpdir: Arc<TempDir>,
    pub framework: Arc<dyn Framework>,
    pub sut: Arc<dyn Sut>,
    pub events: EventBus,
    pub exec_timeout: Duration,
    pub suite_timeout: Duration,
    pub workers: usize,
    pub force_parallel: bool,
}

/// Per-`run` arguments.
#[derive(Default)]
pub struct RunOptions {
    pub command: Option<String>,
    pub suites: Vec<String>,
    pub pattern: Option<String>,
    pub skip_tests: Option<String>,
    pub report_path: Option<Utf8PathBuf>,
    pub restore: Option<Utf8PathBuf>,
    pub suite_iterate: u32,
    pub randomize: bool,
    pub runtime: Option<Duration>,
}

pub struct Session {
    tmpdir: Arc<TempDir>,
    framework: Arc<dyn Framework>,
    sut: Arc<dyn Sut>,
    events: EventBus,
    exec_timeout: Duration,
    scheduler: SuiteScheduler,
    stop: AtomicBool,
    run_lock: AsyncMutex<()>,
    exec_lock: AsyncMutex<()>,
    curr_suite: StdMutex<String>,
    results: AsyncMutex<Vec<crate::results::SuiteResult>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let workers = if config.sut.parallel_ok() {
            config.workers.max(1)
        } else {
            if config.workers > 1 {
                tracing::warn!("SUT doesn't support parallel execution, forcing workers=1");
            }
            1
        };

        let scheduler = SuiteScheduler::new(
            config.sut.clone(),
            config.framework.clone(),
            config.events.clone(),
            SuiteSchedulerConfig {
                suite_timeout: config.suite_timeout,
                exec_timeout: config.exec_timeout,
                max_workers: workers,
                force_parallel: config.force_parallel,
            },
        );

        Self {
            tmpdir: config.tmpdir,
            framework: config.framework,
            sut: config.sut,
            events: config.events,
            exec_timeout: config.exec_timeout,
            scheduler,
            stop: AtomicBool::new(false),
            run_lock: AsyncMutex::new(()),
            exec_lock: AsyncMutex::new(()),
            curr_suite: StdMutex::new(String::new()),
            results: AsyncMutex::new(Vec::new()),
        }
    }

    async fn read_restored_session(path: &camino::Utf8Path) -> BTreeMap<String, Vec<String>> {
        let mut data: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let epath = path.join("executed");
        let Ok(content) =
            crate::async_file::AsyncFile::scoped(&epath, crate::async_file::FileMode::Read, |f| f.read_to_string())
                .await
        else {
            return data;
        };

        for line in content.lines() {
            let Some((suite, test)) = line.split_once("::") else { continue };
            if suite.is_empty() || test.is_empty() {
                continue;
            }
            data.entry(suite.to_string()).or_default().push(test.trim_end().to_string());
        }

        data
    }

    async fn append_executed(&self, suite: &str, test: &str) {
        if self.tmpdir.abspath().is_empty() {
            return;
        }
        let epath = camino::Utf8Path::new(self.tmpdir.abspath()).join("executed");
        let line = format!("{suite}::{test}\n");
        let _ = crate::async_file::AsyncFile::scoped(&epath, crate::async_file::FileMode::Append, |f| async move {
            f.write(&line).await
        })
        .await;
    }

    async fn start_sut(&self) -> Result<(), SessionError> {
        self.events.fire(KirkEvent::SutStart {
            name: self.sut.name().to_string(),
        });
        let iobuf = RedirectSutStdout::new(self.sut.name().to_string(), self.events.clone());
        self.sut.ensure_start(Some(&iobuf as &dyn IoBuffer), 3).await?;
        Ok(())
    }

    async fn stop_sut(&self) -> Result<(), SessionError> {
        if !self.sut.is_running().await {
            return Ok(());
        }
        self.events.fire(KirkEvent::SutStop {
            name: self.sut.name().to_string(),
        });
        let iobuf = RedirectSutStdout::new(self.sut.name().to_string(), self.events.clone());
        self.sut.stop(Some(&iobuf as &dyn IoBuffer)).await?;
        Ok(())
    }

    async fn get_suites_objects(&self, names: &[String]) -> Result<Vec<Suite>, SessionError> {
        if names.is_empty() {
            return Err(SessionError::SuitesNotFound(Vec::new()));
        }

        let futures = names.iter().map(|name| self.framework.find_suite(&*self.sut, name));
        let resolved = futures::future::join_all(futures).await;

        let mut suites = Vec::with_capacity(resolved.len());
        let mut missing = Vec::new();
        for (name, result) in names.iter().zip(resolved) {
            match result {
                Ok(suite) => suites.push(suite),
                Err(_) => missing.push(name.clone()),
            }
        }

        if !missing.is_empty() {
            return Err(SessionError::SuitesNotFound(missing));
        }

        Ok(suites)
    }

    async fn restore_tests(&self, suites: &mut [Suite], restore: Option<&camino::Utf8Path>) {
        let Some(restore) = restore else { return };
        let restored = Self::read_restored_session(restore).await;
        if restored.is_empty() {
            return;
        }

        self.events.fire(KirkEvent::SessionRestore {
            path: restore.to_string(),
        });

        for suite in suites.iter_mut() {
            let Some(done) = restored.get(&suite.name) else { continue };
            suite.tests.retain(|test| !done.contains(&test.name().to_string()));
        }
    }

    fn filter_tests(suites: &mut [Suite], pattern: Option<&str>, when_matching: bool) -> Result<(), SessionError> {
        let Some(pattern) = pattern else { return Ok(()) };
        if pattern.is_empty() {
            return Ok(());
        }
        let matcher = Regex::new(pattern).map_err(|err| SessionError::Other(err.to_string()))?;

        for suite in suites.iter_mut() {
            suite.tests.retain(|test| {
                let matched = matcher.is_match(test.name());
                if when_matching { !matched } else { matched }
            });
        }

        Ok(())
    }

    fn apply_iterate(suites: Vec<Suite>, iterate: u32) -> Vec<Suite> {
        if iterate <= 1 {
            return suites;
        }

        let mut out = Vec::with_capacity(suites.len() * iterate as usize);
        for suite in suites {
            for i in 0..iterate {
                let mut copy = suite.clone();
                copy.name = format!("{}[{i}]", suite.name);
                out.push(copy);
            }
        }
        out
    }

    async fn read_suites(&self, opts: &RunOptions) -> Result<Vec<Suite>, SessionError> {
        let mut suites = self.get_suites_objects(&opts.suites).await?;

        self.restore_tests(&mut suites, opts.restore.as_deref()).await;
        Self::filter_tests(&mut suites, opts.pattern.as_deref(), false)?;
        Self::filter_tests(&mut suites, opts.skip_tests.as_deref(), true)?;

        let num_tests: usize = suites.iter().map(|s| s.tests.len()).sum();
        if num_tests == 0 {
            return Err(SessionError::NoTestsSelected);
        }

        Ok(suites)
    }

    async fn exec_command(&self, command: &str) -> Result<(), SessionError> {
        let _guard = self.exec_lock.lock().await;

        self.events.fire(KirkEvent::RunCmdStart {
            command: command.to_string(),
        });

        let test = self.framework.find_command(&*self.sut, command).await?;
        let iobuf = RedirectCommandStdout { events: self.events.clone() };

        let cmd = test.full_command();
        let env = if test.env().is_empty() { None } else { Some(test.env()) };

        let outcome = tokio::time::timeout(
            self.exec_timeout,
            self.sut.run(&cmd, test.cwd(), env, Some(&iobuf as &dyn IoBuffer)),
        )
        .await
        .map_err(|_| SessionError::CommandTimeout(command.to_string()))??;

        self.events.fire(KirkEvent::RunCmdStop {
            command: command.to_string(),
            stdout: outcome.stdout,
            return_code: outcome.return_code,
        });

        Ok(())
    }

    async fn schedule_once(&self, suites: Vec<Suite>) -> Result<(), SessionError> {
        self.scheduler.schedule(suites).await.map_err(|err| match err {
            crate::errors::RunError::Kernel(_) => SessionError::Other("kernel event interrupted scheduling".into()),
            crate::errors::RunError::Communication(e) => SessionError::Communication(e),
            crate::errors::RunError::Scheduler(e) => SessionError::Scheduler(e),
        })?;
        self.results.lock().await.extend(self.scheduler.results().await);
        Ok(())
    }

    async fn schedule_infinite(&self, suites: Vec<Suite>) -> Result<(), SessionError> {
        let mut count = 1u32;
        let mut next = suites;

        while !self.stop.load(Ordering::SeqCst) {
            self.schedule_once(next.clone()).await?;

            count += 1;
            next = next
                .into_iter()
                .map(|mut suite| {
                    suite.name = format!("{}[{count}]", suite.name);
                    suite
                })
                .collect();
        }

        Ok(())
    }

    async fn run_scheduler(&self, suites: Vec<Suite>, runtime: Option<Duration>) -> Result<(), SessionError> {
        match runtime {
            None => self.schedule_once(suites).await,
            Some(runtime) => match tokio::time::timeout(runtime, self.schedule_infinite(suites)).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    self.scheduler.stop().await;
                    Ok(())
                }
            },
        }
    }

    async fn inner_stop(&self) {
        self.scheduler.stop().await;
        let _ = self.stop_sut().await;
    }

    pub async fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.inner_stop().await;

        let _guard = self.run_lock.lock().await;
        drop(_guard);
        let _guard = self.exec_lock.lock().await;
        drop(_guard);

        self.events.fire(KirkEvent::SessionStopped);
        self.stop.store(false, Ordering::SeqCst);
    }

    pub async fn run(&self, opts: RunOptions) -> Result<(), SessionError> {
        let _run_guard = self.run_lock.lock().await;

        self.events.fire(KirkEvent::SessionStarted {
            tmpdir: self.tmpdir.abspath().to_string(),
        });

        if !self.sut.parallel_ok() {
            self.events.fire(KirkEvent::SessionWarning {
                message: "SUT doesn't support parallel execution".to_string(),
            });
        }

        let run_result = self.run_inner(&opts).await;
        if let Err(err) = &run_result {
            if !self.stop.load(Ordering::SeqCst) {
                self.events.fire(KirkEvent::SessionError {
                    message: err.to_string(),
                });
            }
        }

        let export_result = self.export_results(opts.report_path.as_deref()).await;

        self.inner_stop().await;

        run_result?;
        export_result
    }

    async fn run_inner(&self, opts: &RunOptions) -> Result<(), SessionError> {
        self.start_sut().await?;

        if let Some(command) = &opts.command {
            self.exec_command(command).await?;
        }

        if !opts.suites.is_empty() {
            let suites = self.read_suites(opts).await?;
            let suites = Self::apply_iterate(suites, opts.suite_iterate);
            let mut suites = suites;
            if opts.randomize {
                let mut rng = rand::thread_rng();
                for suite in &mut suites {
                    suite.tests.shuffle(&mut rng);
                }
            }

            self.run_scheduler(suites, opts.runtime).await?;
        }

        Ok(())
    }

    async fn export_results(&self, report_path: Option<&camino::Utf8Path>) -> Result<(), SessionError> {
        let results = self.results.lock().await.clone();
        if results.is_empty() {
            return Ok(());
        }

        let exporter = JsonExporter::new();

        if !self.tmpdir.abspath().is_empty() {
            let path = camino::Utf8Path::new(self.tmpdir.abspath()).join("results.json");
            exporter.save_file(&results, &path).await?;
        }

        if let Some(report_path) = report_path {
            exporter.save_file(&results, report_path).await?;
        }

        self.events.fire(KirkEvent::SessionCompleted { results: results.clone() });

        self.results.lock().await.clear();
        Ok(())
    }

    /// Registers the `executed`-log bookkeeping this session needs: which suite is currently
    /// running, and appending each completed test to the log as it finishes, so a later
    /// `--restore` run can skip it.
    pub fn install_restore_hooks(session: &Arc<Self>) {
        let events = session.events.clone();

        let handler = session.clone();
        events.register("suite_started", "session-restore-suite", true, move |event| {
            let session = handler.clone();
            async move {
                if let KirkEvent::SuiteStarted { suite } = event {
                    *session.curr_suite.lock().unwrap() = suite.name.clone();
                }
                Ok(())
            }
        });

        let handler = session.clone();
        events.register("test_completed", "session-restore-test", true, move |event| {
            let session = handler.clone();
            async move {
                if let KirkEvent::TestCompleted { result } = event {
                    let suite = session.curr_suite.lock().unwrap().clone();
                    session.append_executed(&suite, result.test().name()).await;
                }
                Ok(())
            }
        });
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
    use crate::results::{ResultStatus, TestCounts, TestResult};
    use crate::sut::{RunOutcome, TaintedCache};

    struct OkSut {
        tainted: TaintedCache,
        calls: AtomicU32,
    }

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

    struct FakeFramework;

    impl Plugin for FakeFramework {
        fn name(&self) -> &str {
            "fake"
        }
    }

    #[async_trait]
    impl Framework for FakeFramework {
        async fn get_suites(&self, _sut: &(dyn Sut)) -> Result<Vec<String>, FrameworkError> {
            Ok(vec!["suite1".to_string()])
        }

        async fn find_suite(&self, _sut: &(dyn Sut), name: &str) -> Result<Suite, FrameworkError> {
            if name != "suite1" {
                return Err(FrameworkError::SuiteNotFound(name.to_string()));
            }
            Ok(Suite::new(
                "suite1",
                vec![Test::new("keep_me", "true"), Test::new("drop_me", "true")],
            ))
        }

        async fn find_command(&self, _sut: &(dyn Sut), command: &str) -> Result<Test, FrameworkError> {
            Ok(Test::new("adhoc", command))
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

    fn make_session(tmpdir: Arc<TempDir>) -> Session {
        Session::new(SessionConfig {
            tmpdir,
            framework: Arc::new(FakeFramework),
            sut: Arc::new(OkSut {
                tainted: TaintedCache::new(),
                calls: AtomicU32::new(0),
            }),
            events: EventBus::new(),
            exec_timeout: Duration::from_secs(5),
            suite_timeout: Duration::from_secs(5),
            workers: 1,
            force_parallel: false,
        })
    }

    #[test]
    fn apply_iterate_duplicates_suites_with_index_suffix() {
        let suites = vec![Suite::new("s", vec![Test::new("t", "true")])];
        let out = Session::apply_iterate(suites, 3);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].name, "s[0]");
        assert_eq!(out[2].name, "s[2]");
    }

    #[test]
    fn apply_iterate_is_a_noop_below_two() {
        let suites = vec![Suite::new("s", vec![])];
        let out = Session::apply_iterate(suites, 1);
        assert_eq!(out[0].name, "s");
    }

    #[test]
    fn filter_tests_pattern_keeps_only_matches() {
        let mut suites = vec![Suite::new(
            "s",
            vec![Test::new("keep_me", "true"), Test::new("drop_me", "true")],
        )];
        Session::filter_tests(&mut suites, Some("^keep"), false).unwrap();
        assert_eq!(suites[0].tests.len(), 1);
        assert_eq!(suites[0].tests[0].name(), "keep_me");
    }

    #[test]
    fn filter_tests_skip_removes_matches() {
        let mut suites = vec![Suite::new(
            "s",
            vec![Test::new("keep_me", "true"), Test::new("drop_me", "true")],
        )];
        Session::filter_tests(&mut suites, Some("^drop"), true).unwrap();
        assert_eq!(suites[0].tests.len(), 1);
        assert_eq!(suites[0].tests[0].name(), "keep_me");
    }

    #[tokio::test]
    async fn run_with_no_tests_selected_after_filtering_errors() {
        let dir = camino_tempfile::tempdir().unwrap();
        let tmpdir = Arc::new(TempDir::new(Some(dir.path()), 5).unwrap());
        let session = make_session(tmpdir);

        let err = session
            .run(RunOptions {
                suites: vec!["suite1".to_string()],
                pattern: Some("^nothing_matches_this".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::NoTestsSelected));
    }

    #[tokio::test]
    async fn run_executes_suite_and_writes_report() {
        let dir = camino_tempfile::tempdir().unwrap();
        let tmpdir = Arc::new(TempDir::new(Some(dir.path()), 5).unwrap());
        let tmpdir_path = tmpdir.abspath().to_string();
        let session = Arc::new(make_session(tmpdir));
        Session::install_restore_hooks(&session);

        let bus = session.events.clone();
        let consumer = tokio::spawn(async move { bus.start().await });

        session
            .run(RunOptions {
                suites: vec!["suite1".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        session.events.stop().await;
        consumer.await.unwrap();

        let report = camino::Utf8Path::new(&tmpdir_path).join("results.json");
        assert!(report.exists());

        let executed = camino::Utf8Path::new(&tmpdir_path).join("executed");
        let content = std::fs::read_to_string(executed).unwrap();
        assert!(content.contains("suite1::keep_me"));
        assert!(content.contains("suite1::drop_me"));
    }

    #[tokio::test]
    async fn run_rejects_unknown_suite_name() {
        let dir = camino_tempfile::tempdir().unwrap();
        let tmpdir = Arc::new(TempDir::new(Some(dir.path()), 5).unwrap());
        let session = make_session(tmpdir);

        let err = session
            .run(RunOptions {
                suites: vec!["no-such-suite".to_string()],
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::SuitesNotFound(names) if names == vec!["no-such-suite".to_string()]));
    }
}
