//! LTX transport: spawns an `ltx` server process and drives it over its msgpack stdio
//! protocol instead of a shell. Parallel-safe by construction: every execution gets its own
//! reserved slot.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use tokio::sync::Mutex as AsyncMutex;

use crate::errors::CommunicationError;
use crate::plugin::Plugin;
use crate::sut::ltx::client::{LtxClient, SlotTable};
use crate::sut::{IoBuffer, RunOutcome, Sut, TaintedCache};

#[derive(Clone, Debug)]
pub struct LtxConfig {
    /// Path to the `ltx` executable (resolved against `PATH` if relative).
    pub tool: Utf8PathBuf,
    /// Extra arguments passed through to `ltx` on spawn.
    pub args: Vec<String>,
}

impl Default for LtxConfig {
    fn default() -> Self {
        Self { tool: Utf8PathBuf::from("ltx"), args: Vec::new() }
    }
}

pub struct LtxSut {
    config: LtxConfig,
    process: AsyncMutex<Option<tokio::process::Child>>,
    client: AsyncMutex<Option<LtxClient>>,
    slots: SlotTable,
    tainted: TaintedCache,
}

impl LtxSut {
    pub fn new(config: LtxConfig) -> Self {
        Self {
            config,
            process: AsyncMutex::new(None),
            client: AsyncMutex::new(None),
            slots: SlotTable::new(),
            tainted: TaintedCache::new(),
        }
    }
}

#[async_trait]
impl Plugin for LtxSut {
    fn name(&self) -> &str {
        "ltx"
    }

    fn config_help(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("tool", "path to the ltx executable (default: ltx on PATH)"),
            ("args", "extra arguments passed to ltx"),
        ]
    }
}

#[async_trait]
impl Sut for LtxSut {
    fn parallel_ok(&self) -> bool {
        true
    }

    async fn is_running(&self) -> bool {
        match self.client.lock().await.as_ref() {
            Some(client) => client.is_connected(),
            None => false,
        }
    }

    async fn start(&self, _iobuf: Option<&(dyn IoBuffer)>) -> Result<(), CommunicationError> {
        if self.is_running().await {
            return Err(CommunicationError::AlreadyRunning);
        }

        let mut child = tokio::process::Command::new(self.config.tool.as_str())
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| CommunicationError::Unreachable(err.to_string()))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            CommunicationError::Unreachable("ltx process has no stdin pipe".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            CommunicationError::Unreachable("ltx process has no stdout pipe".into())
        })?;

        let client = LtxClient::connect(stdin, stdout);
        client
            .version()
            .await
            .map_err(|err| CommunicationError::Unreachable(format!("handshake failed: {err}")))?;

        *self.process.lock().await = Some(child);
        *self.client.lock().await = Some(client);
        Ok(())
    }

    async fn stop(&self, _iobuf: Option<&(dyn IoBuffer)>) -> Result<(), CommunicationError> {
        if let Some(client) = self.client.lock().await.take() {
            client.disconnect().await;
        }
        if let Some(mut child) = self.process.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<f64, CommunicationError> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(CommunicationError::NotRunning)?;
        let start = Instant::now();
        client.ping().await?;
        Ok(start.elapsed().as_secs_f64())
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

        let slot = self
            .slots
            .reserve()
            .ok_or_else(|| CommunicationError::Protocol("no free LTX execution slots".into()))?;

        let result = async {
            let guard = self.client.lock().await;
            let client = guard.as_ref().ok_or(CommunicationError::NotRunning)?;

            if let Some(cwd) = cwd {
                client.cwd(slot, cwd).await?;
            }
            if let Some(env) = env {
                for (key, value) in env {
                    client.env(slot, key, value).await?;
                }
            }

            let start = Instant::now();
            let (_time_ns, _si_code, si_status, stdout) =
                client.execute(slot, command, iobuf).await?;
            let exec_time = start.elapsed().as_secs_f64();

            Ok(RunOutcome {
                command: command.to_string(),
                return_code: si_status,
                stdout,
                exec_time,
            })
        }
        .await;

        self.slots.release(slot);
        result
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, CommunicationError> {
        if path.is_empty() {
            return Err(CommunicationError::Protocol("target path is empty".into()));
        }
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(CommunicationError::NotRunning)?;
        client.get_file(path).await
    }

    fn tainted_cache(&self) -> &TaintedCache {
        &self.tainted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_resolves_tool_against_path() {
        let config = LtxConfig::default();
        assert_eq!(config.tool, Utf8PathBuf::from("ltx"));
        assert!(config.args.is_empty());
    }

    #[tokio::test]
    async fn run_before_start_fails_not_running() {
        let sut = LtxSut::new(LtxConfig::default());
        let err = sut.run("true", None, None, None).await.unwrap_err();
        assert!(matches!(err, CommunicationError::NotRunning));
    }

    #[tokio::test]
    async fn is_running_is_false_before_start() {
        let sut = LtxSut::new(LtxConfig::default());
        assert!(!sut.is_running().await);
    }
}
