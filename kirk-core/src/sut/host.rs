//! Host transport: runs commands as local subprocesses via `/bin/sh -c`.
//!
//! There is no remote connection to establish, so `start`/`stop` only track whether the
//! transport considers itself active and own the bookkeeping needed to kill in-flight
//! children on `stop`. Parallel-safe: nothing here serializes concurrent `run` calls.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Duration;

use crate::errors::CommunicationError;
use crate::plugin::Plugin;
use crate::sut::{IoBuffer, RunOutcome, Sut, TaintedCache};

const KILL_GRACE: Duration = Duration::from_secs(3);

pub struct HostSut {
    running: AtomicBool,
    children: AsyncMutex<Vec<Arc<AsyncMutex<Option<Child>>>>>,
    tainted: TaintedCache,
}

impl Default for HostSut {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSut {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            children: AsyncMutex::new(Vec::new()),
            tainted: TaintedCache::new(),
        }
    }
}

#[async_trait]
impl Plugin for HostSut {
    fn name(&self) -> &str {
        "host"
    }

    fn config_help(&self) -> Vec<(&'static str, &'static str)> {
        Vec::new()
    }
}

#[async_trait]
impl Sut for HostSut {
    fn parallel_ok(&self) -> bool {
        true
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self, _iobuf: Option<&(dyn IoBuffer)>) -> Result<(), CommunicationError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CommunicationError::AlreadyRunning);
        }
        Ok(())
    }

    async fn stop(&self, _iobuf: Option<&(dyn IoBuffer)>) -> Result<(), CommunicationError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let children = std::mem::take(&mut *self.children.lock().await);
        for handle in children {
            let mut guard = handle.lock().await;
            if let Some(child) = guard.as_mut() {
                kill_with_grace(child).await;
            }
        }

        Ok(())
    }

    async fn ping(&self) -> Result<f64, CommunicationError> {
        if !self.is_running().await {
            return Err(CommunicationError::NotRunning);
        }
        let out = self.run("test .", None, None, None).await?;
        Ok(out.exec_time)
    }

    async fn run(
        &self,
        command: &str,
        cwd: Option<&str>,
        env: Option<&BTreeMap<String, String>>,
        iobuf: Option<&(dyn IoBuffer)>,
    ) -> Result<RunOutcome, CommunicationError> {
        if command.is_empty() {
            return Err(CommunicationError::Protocol("command is empty".into()));
        }
        if !self.is_running().await {
            return Err(CommunicationError::NotRunning);
        }

        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(command);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = env {
            cmd.envs(env.iter());
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| CommunicationError::Unreachable(err.to_string()))?;
        let stdout = child.stdout.take().expect("piped stdout");

        let handle = Arc::new(AsyncMutex::new(Some(child)));
        self.children.lock().await.push(handle.clone());

        let start = Instant::now();
        let mut lines = BufReader::new(stdout).lines();
        let mut collected = String::new();
        let mut first_line = true;

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|err| CommunicationError::Protocol(err.to_string()))?
        {
            if !first_line {
                collected.push('\n');
            }
            first_line = false;
            collected.push_str(&line);
            if let Some(buf) = iobuf {
                buf.write(&format!("{line}\n")).await;
            }
        }

        let exec_time = start.elapsed().as_secs_f64();

        let return_code = {
            let mut guard = handle.lock().await;
            let status = match guard.as_mut() {
                Some(child) => child
                    .wait()
                    .await
                    .map_err(|err| CommunicationError::Protocol(err.to_string()))?,
                None => return Err(CommunicationError::Protocol("child already reaped".into())),
            };
            *guard = None;
            status.code().unwrap_or(-1)
        };

        self.children.lock().await.retain(|c| !Arc::ptr_eq(c, &handle));

        Ok(RunOutcome {
            command: command.to_string(),
            return_code,
            stdout: collected,
            exec_time,
        })
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, CommunicationError> {
        if path.is_empty() {
            return Err(CommunicationError::Protocol("target path is empty".into()));
        }
        if !self.is_running().await {
            return Err(CommunicationError::NotRunning);
        }
        tokio::fs::read(path)
            .await
            .map_err(|err| CommunicationError::Protocol(err.to_string()))
    }

    fn tainted_cache(&self) -> &TaintedCache {
        &self.tainted
    }
}

async fn kill_with_grace(child: &mut Child) {
    let Some(id) = child.id() else { return };
    let pid = Pid::from_raw(id as i32);

    let _ = kill(pid, Signal::SIGTERM);
    let graced = tokio::time::timeout(KILL_GRACE, child.wait()).await;
    if graced.is_err() {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout_and_return_code() {
        let sut = HostSut::new();
        sut.start(None).await.unwrap();

        let out = sut.run("echo hello; exit 3", None, None, None).await.unwrap();
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.return_code, 3);

        sut.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn run_does_not_reintroduce_a_trailing_newline() {
        let sut = HostSut::new();
        sut.start(None).await.unwrap();

        let out = sut.run("echo -n ciao0", None, None, None).await.unwrap();
        assert_eq!(out.stdout, "ciao0");

        sut.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn run_joins_multiple_lines_without_a_final_newline() {
        let sut = HostSut::new();
        sut.start(None).await.unwrap();

        let out = sut.run("printf 'a\\nb\\nc'", None, None, None).await.unwrap();
        assert_eq!(out.stdout, "a\nb\nc");

        sut.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn start_twice_fails_with_already_running() {
        let sut = HostSut::new();
        sut.start(None).await.unwrap();
        let err = sut.start(None).await.unwrap_err();
        assert!(matches!(err, CommunicationError::AlreadyRunning));
        sut.stop(None).await.unwrap();
    }

    #[tokio::test]
    async fn run_before_start_fails_not_running() {
        let sut = HostSut::new();
        let err = sut.run("true", None, None, None).await.unwrap_err();
        assert!(matches!(err, CommunicationError::NotRunning));
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let sut = HostSut::new();
        sut.stop(None).await.unwrap();
    }
}
