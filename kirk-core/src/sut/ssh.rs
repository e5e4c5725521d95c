//! SSH transport: one persistent connection, sessions multiplexed behind a semaphore sized
//! to the server's `MaxSessions`.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use camino::Utf8PathBuf;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::errors::CommunicationError;
use crate::plugin::Plugin;
use crate::sut::{IoBuffer, RunOutcome, Sut, TaintedCache};

const DEFAULT_MAX_SESSIONS: usize = 10;

/// Configuration accepted by [`SshSut::new`], one-to-one with `config_help`.
#[derive(Clone, Debug)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub key_file: Option<Utf8PathBuf>,
    pub reset_cmd: Option<String>,
    pub sudo: bool,
    /// `None`/empty disables verification, as does the literal path `/dev/null`.
    pub known_hosts: Option<Utf8PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            user: "root".to_string(),
            password: None,
            key_file: None,
            reset_cmd: None,
            sudo: false,
            known_hosts: None,
        }
    }
}

struct ClientHandler {
    known_keys: Option<Vec<Vec<u8>>>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(known) = &self.known_keys else {
            return Ok(true);
        };
        let encoded = server_public_key.public_key_bytes();
        Ok(known.iter().any(|k| k.as_slice() == encoded.as_slice()))
    }
}

pub struct SshSut {
    config: SshConfig,
    conn: AsyncMutex<Option<Handle<ClientHandler>>>,
    session_sem: AsyncMutex<Option<Arc<Semaphore>>>,
    stopping: AtomicBool,
    tainted: TaintedCache,
}

impl SshSut {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            conn: AsyncMutex::new(None),
            session_sem: AsyncMutex::new(None),
            stopping: AtomicBool::new(false),
            tainted: TaintedCache::new(),
        }
    }

    fn create_command(&self, cmd: &str, cwd: Option<&str>, env: Option<&BTreeMap<String, String>>) -> String {
        let mut script = String::new();
        if let Some(cwd) = cwd {
            script.push_str(&format!("cd {cwd} && "));
        }
        if let Some(env) = env {
            for (key, value) in env {
                script.push_str(&format!("export {key}={value} && "));
            }
        }
        script.push_str(cmd);

        if self.config.sudo {
            format!("sudo /bin/sh -c '{script}'")
        } else {
            script
        }
    }

    async fn load_known_keys(&self) -> Option<Vec<Vec<u8>>> {
        let path = self.config.known_hosts.as_ref()?;
        if path.as_str() == "/dev/null" {
            return None;
        }
        let contents = tokio::fs::read_to_string(path).await.ok()?;
        let mut keys = Vec::new();
        for line in contents.lines() {
            if let Some(field) = line.split_whitespace().nth(2) {
                if let Ok(decoded) = BASE64.decode(field.as_bytes()) {
                    keys.push(decoded);
                }
            }
        }
        Some(keys)
    }

    async fn run_reset_cmd(&self, iobuf: Option<&(dyn IoBuffer)>) {
        let Some(reset_cmd) = &self.config.reset_cmd else {
            return;
        };

        tracing::info!(command = %reset_cmd, "executing SSH reset command");

        let Ok(mut child) = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(reset_cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        else {
            return;
        };

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(buf) = iobuf {
                    buf.write(&format!("{line}\n")).await;
                }
            }
        }

        let _ = child.wait().await;
    }
}

#[async_trait]
impl Plugin for SshSut {
    fn name(&self) -> &str {
        "ssh"
    }

    fn config_help(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("host", "IP address of the SUT (default: localhost)"),
            ("port", "TCP port of the service (default: 22)"),
            ("user", "name of the user (default: root)"),
            ("password", "root password"),
            ("key_file", "private key location"),
            ("reset_command", "command to reset the remote SUT"),
            ("sudo", "use sudo to access to root shell (default: 0)"),
        ]
    }
}

#[async_trait]
impl Sut for SshSut {
    fn parallel_ok(&self) -> bool {
        true
    }

    async fn is_running(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn start(&self, _iobuf: Option<&(dyn IoBuffer)>) -> Result<(), CommunicationError> {
        if self.is_running().await {
            return Err(CommunicationError::AlreadyRunning);
        }

        let known_keys = self.load_known_keys().await;
        let handler = ClientHandler { known_keys };
        let config = Arc::new(client::Config::default());

        let mut session = client::connect(config, (self.config.host.as_str(), self.config.port), handler)
            .await
            .map_err(|err| CommunicationError::Unreachable(err.to_string()))?;

        let authenticated = if let Some(key_file) = &self.config.key_file {
            let key_pair = russh_keys::load_secret_key(key_file.as_std_path(), None)
                .map_err(|err| CommunicationError::Unreachable(err.to_string()))?;
            session
                .authenticate_publickey(&self.config.user, Arc::new(key_pair))
                .await
        } else {
            session
                .authenticate_password(&self.config.user, self.config.password.clone().unwrap_or_default())
                .await
        }
        .map_err(|err| CommunicationError::Unreachable(err.to_string()))?;

        if !authenticated {
            return Err(CommunicationError::Unreachable("authentication failed".into()));
        }

        let max_sessions = self.read_max_sessions(&mut session).await.unwrap_or(DEFAULT_MAX_SESSIONS);
        tracing::info!(max_sessions, "established SSH connection");

        *self.session_sem.lock().await = Some(Arc::new(Semaphore::new(max_sessions)));
        *self.conn.lock().await = Some(session);

        Ok(())
    }

    async fn stop(&self, iobuf: Option<&(dyn IoBuffer)>) -> Result<(), CommunicationError> {
        if !self.is_running().await {
            return Ok(());
        }

        self.stopping.store(true, Ordering::SeqCst);

        let session = self.conn.lock().await.take();
        if let Some(session) = session {
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
        }
        *self.session_sem.lock().await = None;

        // Channels are gone with the connection; only now may the reset command run.
        self.run_reset_cmd(iobuf).await;

        self.stopping.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<f64, CommunicationError> {
        if !self.is_running().await {
            return Err(CommunicationError::NotRunning);
        }
        let start = Instant::now();
        let out = self.run("test .", None, None, None).await?;
        if out.return_code != 0 {
            return Err(CommunicationError::Protocol("ping command failed".into()));
        }
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
        if !self.is_running().await {
            return Err(CommunicationError::NotRunning);
        }

        let sem = self
            .session_sem
            .lock()
            .await
            .clone()
            .ok_or(CommunicationError::NotRunning)?;
        let _permit = sem.acquire().await.map_err(|_| CommunicationError::NotRunning)?;

        let script = self.create_command(command, cwd, env);
        let start = Instant::now();

        let mut guard = self.conn.lock().await;
        let session = guard.as_mut().ok_or(CommunicationError::NotRunning)?;

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|err| CommunicationError::Unreachable(err.to_string()))?;
        channel
            .exec(true, script)
            .await
            .map_err(|err| CommunicationError::Unreachable(err.to_string()))?;

        let mut stdout = String::new();
        let mut exit_status = -1i32;
        let mut panic = false;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    if text.contains("Kernel panic") {
                        panic = true;
                    }
                    if let Some(buf) = iobuf {
                        buf.write(&text).await;
                    }
                    stdout.push_str(&text);
                }
                ChannelMsg::ExitStatus { exit_status: code } => {
                    exit_status = code as i32;
                }
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }

        drop(guard);

        if panic {
            return Err(CommunicationError::Panic);
        }

        Ok(RunOutcome {
            command: command.to_string(),
            return_code: exit_status,
            exec_time: start.elapsed().as_secs_f64(),
            stdout,
        })
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, CommunicationError> {
        if path.is_empty() {
            return Err(CommunicationError::Protocol("target path is empty".into()));
        }
        if !self.is_running().await {
            return Err(CommunicationError::NotRunning);
        }

        let out = self.run(&format!("cat {path}"), None, None, None).await?;
        if out.return_code != 0 && !self.stopping.load(Ordering::SeqCst) {
            return Err(CommunicationError::Protocol(format!("can't fetch {path}")));
        }
        Ok(out.stdout.into_bytes())
    }

    fn tainted_cache(&self) -> &TaintedCache {
        &self.tainted
    }
}

impl SshSut {
    async fn read_max_sessions(&self, session: &mut Handle<ClientHandler>) -> Option<usize> {
        let mut channel = session.channel_open_session().await.ok()?;
        channel
            .exec(
                true,
                r#"sed -n "s/^MaxSessions\s*\([[:digit:]]*\)/\1/p" /etc/ssh/sshd_config"#,
            )
            .await
            .ok()?;

        let mut stdout = Vec::new();
        while let Some(msg) = channel.wait().await {
            if let ChannelMsg::Data { data } = msg {
                stdout.extend_from_slice(&data);
            }
            if matches!(msg, ChannelMsg::Eof) {
                break;
            }
        }

        let text = String::from_utf8_lossy(&stdout);
        text.trim().parse().ok()
    }
}
