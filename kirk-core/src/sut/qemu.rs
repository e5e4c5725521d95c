//! QEMU transport: spawns a VM and drives its serial console like an interactive shell.
//!
//! Commands are sent as `<cmd>; echo $?-<nonce>\n` and the reply is read until the nonce
//! sentinel appears on stdout. A "Kernel panic" anywhere in the captured stream sets a sticky
//! panic flag; the session then drains a bounded amount of trailing output before failing.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Duration};

use crate::async_file::{AsyncFile, FileMode};
use crate::errors::CommunicationError;
use crate::plugin::Plugin;
use crate::sut::{IoBuffer, RunOutcome, Sut, TaintedCache};

/// How the VM's second transport channel (used by `fetch`) is wired up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SerialKind {
    Isa,
    VirtIo,
}

#[derive(Clone, Debug)]
pub struct QemuConfig {
    pub tmpdir: Utf8PathBuf,
    pub user: Option<String>,
    pub password: Option<String>,
    pub prompt: String,
    pub image: Option<Utf8PathBuf>,
    pub initrd: Option<Utf8PathBuf>,
    pub kernel: Option<Utf8PathBuf>,
    pub ram: String,
    pub smp: String,
    pub virtfs: Option<Utf8PathBuf>,
    pub serial: SerialKind,
    pub options: Option<String>,
    pub system: String,
}

impl QemuConfig {
    pub fn qemu_command(&self) -> String {
        format!("qemu-system-{}", self.system)
    }
}

struct ChannelHalves {
    stdin: ChildStdin,
    stdout: ChildStdout,
}

pub struct QemuSut {
    config: QemuConfig,
    comm_lock: AsyncMutex<()>,
    cmd_lock: AsyncMutex<()>,
    fetch_lock: AsyncMutex<()>,
    proc: AsyncMutex<Option<Child>>,
    channels: AsyncMutex<Option<ChannelHalves>>,
    stopping: AtomicBool,
    logged_in: AtomicBool,
    panic: AtomicBool,
    last_pos: AtomicU64,
    last_read: AsyncMutex<String>,
    tainted: TaintedCache,
}

impl QemuSut {
    pub fn new(config: QemuConfig) -> Self {
        Self {
            config,
            comm_lock: AsyncMutex::new(()),
            cmd_lock: AsyncMutex::new(()),
            fetch_lock: AsyncMutex::new(()),
            proc: AsyncMutex::new(None),
            channels: AsyncMutex::new(None),
            stopping: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            panic: AtomicBool::new(false),
            last_pos: AtomicU64::new(0),
            last_read: AsyncMutex::new(String::new()),
            tainted: TaintedCache::new(),
        }
    }

    fn transport_device(&self) -> &'static str {
        match self.config.serial {
            SerialKind::Isa => "/dev/ttyS1",
            SerialKind::VirtIo => "/dev/vport1p1",
        }
    }

    fn transport_file(&self) -> Utf8PathBuf {
        self.config.tmpdir.join(format!("transport-{}", std::process::id()))
    }

    fn build_command(&self) -> String {
        let tty_log = self.config.tmpdir.join(format!("ttyS0-{}.log", std::process::id()));
        let mut params = vec![
            "-enable-kvm".to_string(),
            "-display none".to_string(),
            format!("-m {}", self.config.ram),
            format!("-smp {}", self.config.smp),
            "-device virtio-rng-pci".to_string(),
            format!("-chardev stdio,id=tty,logfile={tty_log}"),
        ];

        match self.config.serial {
            SerialKind::Isa => {
                params.push("-serial chardev:tty".to_string());
                params.push("-serial chardev:transport".to_string());
            }
            SerialKind::VirtIo => {
                params.push("-device virtio-serial".to_string());
                params.push("-device virtconsole,chardev=tty".to_string());
                params.push("-device virtserialport,chardev=transport".to_string());
            }
        }

        params.push(format!("-chardev file,id=transport,path={}", self.transport_file()));

        if let Some(virtfs) = &self.config.virtfs {
            params.push(format!(
                "-virtfs local,path={virtfs},mount_tag=host0,security_model=mapped-xattr,readonly=on"
            ));
        }
        if let Some(image) = &self.config.image {
            params.push(format!("-drive if=virtio,cache=unsafe,file={image}"));
        }
        if let Some(initrd) = &self.config.initrd {
            params.push(format!("-initrd {initrd}"));
        }
        if let Some(kernel) = &self.config.kernel {
            let console = match self.config.serial {
                SerialKind::Isa => "ttyS0",
                SerialKind::VirtIo => "hvc0",
            };
            params.push(format!("-append 'console={console} ignore_loglevel'"));
            params.push(format!("-kernel {kernel}"));
        }
        if let Some(opts) = &self.config.options {
            params.push(opts.clone());
        }

        format!("{} {}", self.config.qemu_command(), params.join(" "))
    }

    fn generate_nonce() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect()
    }

    async fn read_stdout_chunk(&self, size: usize, iobuf: Option<&(dyn IoBuffer)>) -> std::io::Result<String> {
        let mut guard = self.channels.lock().await;
        let Some(channels) = guard.as_mut() else {
            return Ok(String::new());
        };
        let mut buf = vec![0u8; size];
        let n = channels.stdout.read(&mut buf).await?;
        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        if let Some(iobuf) = iobuf {
            iobuf.write(&text).await;
        }
        Ok(text)
    }

    async fn write_stdin(&self, data: &str) -> Result<(), CommunicationError> {
        if !self.is_running().await {
            return Ok(());
        }
        let mut guard = self.channels.lock().await;
        if let Some(channels) = guard.as_mut() {
            if let Err(err) = channels.stdin.write_all(data.as_bytes()).await {
                if !self.stopping.load(Ordering::SeqCst) {
                    return Err(CommunicationError::Unreachable(err.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Waits for `message` to appear on stdout, returning everything read up to and including
    /// it stripped of the match. Sets the sticky panic flag (and drains trailing output) if
    /// "Kernel panic" appears first.
    async fn wait_for(&self, message: &str, iobuf: Option<&(dyn IoBuffer)>) -> Result<String, CommunicationError> {
        if !self.is_running().await {
            return Ok(String::new());
        }

        let mut stdout = self.last_read.lock().await.clone();
        self.panic.store(false, Ordering::SeqCst);

        loop {
            if self.stopping.load(Ordering::SeqCst) || self.panic.load(Ordering::SeqCst) {
                break;
            }
            if !self.is_running().await {
                break;
            }

            if let Some(pos) = stdout.find(message) {
                *self.last_read.lock().await = stdout[pos + message.len()..].to_string();
                stdout.truncate(pos);
                break;
            }

            let data = self
                .read_stdout_chunk(1024, iobuf)
                .await
                .map_err(|err| CommunicationError::Protocol(err.to_string()))?;
            if !data.is_empty() {
                stdout.push_str(&data);
            }

            if stdout.contains("Kernel panic") {
                sleep(Duration::from_secs(2)).await;
                let more = self
                    .read_stdout_chunk(1024 * 1024, iobuf)
                    .await
                    .map_err(|err| CommunicationError::Protocol(err.to_string()))?;
                stdout.push_str(&more);
                self.panic.store(true, Ordering::SeqCst);
            }
        }

        if self.panic.load(Ordering::SeqCst) {
            return Err(CommunicationError::Panic);
        }

        Ok(stdout)
    }

    async fn wait_lockers(&self) {
        let _ = self.comm_lock.lock().await;
        let _ = self.cmd_lock.lock().await;
        let _ = self.fetch_lock.lock().await;
    }

    /// Sends `command; echo $?-<nonce>` and parses the reply into (stdout, return_code,
    /// exec_time). Strips at most one leading newline from the captured stdout.
    async fn exec(&self, command: &str, iobuf: Option<&(dyn IoBuffer)>) -> Result<(String, i32, f64), CommunicationError> {
        let nonce = Self::generate_nonce();
        let start = Instant::now();

        self.write_stdin(&format!("{command}; echo $?-{nonce}\n")).await?;
        let raw = self.wait_for(&nonce, iobuf).await?;
        let exec_time = start.elapsed().as_secs_f64();

        if self.stopping.load(Ordering::SeqCst) {
            return Ok((String::new(), -1, exec_time));
        }

        if raw.trim().is_empty() {
            return Ok((String::new(), -1, exec_time));
        }

        let re = Regex::new(&format!(r"(?P<retcode>\d+)-{nonce}")).unwrap();
        let m = re
            .find(&raw)
            .ok_or_else(|| CommunicationError::Protocol(format!("can't read return code from reply {raw:?}")))?;
        let retcode: i32 = re
            .captures(&raw)
            .and_then(|c| c.name("retcode"))
            .and_then(|v| v.as_str().parse().ok())
            .unwrap_or(-1);

        let mut stdout = raw[..m.start()].to_string();
        if stdout.starts_with('\n') {
            stdout.remove(0);
        }

        Ok((stdout, retcode, exec_time))
    }
}

fn command_exists_on_path(cmd: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let Ok(path_var) = std::env::var("PATH") else {
        return false;
    };

    std::env::split_paths(&path_var).any(|dir| {
        let candidate = dir.join(cmd);
        std::fs::metadata(&candidate)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    })
}

#[async_trait]
impl Plugin for QemuSut {
    fn name(&self) -> &str {
        "qemu"
    }

    fn config_help(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("image", "qemu image location"),
            ("kernel", "kernel image location"),
            ("initrd", "initrd image location"),
            ("user", "user name (default: '')"),
            ("password", "user password (default: '')"),
            ("prompt", "prompt string (default: '#')"),
            ("system", "system architecture (default: x86_64)"),
            ("ram", "RAM of the VM (default: 2G)"),
            ("smp", "number of CPUs (default: 2)"),
            ("serial", "type of serial protocol. isa|virtio (default: isa)"),
            ("virtfs", "directory to mount inside VM"),
            ("options", "user defined options"),
        ]
    }
}

#[async_trait]
impl Sut for QemuSut {
    fn parallel_ok(&self) -> bool {
        false
    }

    async fn is_running(&self) -> bool {
        let mut guard = self.proc.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn start(&self, iobuf: Option<&(dyn IoBuffer)>) -> Result<(), CommunicationError> {
        if !command_exists_on_path(&self.config.qemu_command()) {
            return Err(CommunicationError::Unreachable(format!(
                "command not found: {}",
                self.config.qemu_command()
            )));
        }
        if self.is_running().await {
            return Err(CommunicationError::AlreadyRunning);
        }

        let _guard = self.comm_lock.lock().await;
        self.logged_in.store(false, Ordering::SeqCst);

        let cmd = self.build_command();
        tracing::info!(%cmd, "starting virtual machine");

        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| CommunicationError::Unreachable(err.to_string()))?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        *self.channels.lock().await = Some(ChannelHalves { stdin, stdout });
        *self.proc.lock().await = Some(child);

        let result: Result<(), CommunicationError> = async {
            if let Some(user) = self.config.user.clone() {
                self.wait_for("login:", iobuf).await?;
                self.write_stdin(&format!("{user}\n")).await?;

                if let Some(password) = self.config.password.clone() {
                    self.wait_for("Password:", iobuf).await?;
                    self.write_stdin(&format!("{password}\n")).await?;
                }
                sleep(Duration::from_millis(200)).await;
            }

            self.wait_for(&self.config.prompt.clone(), iobuf).await?;
            sleep(Duration::from_millis(200)).await;

            self.write_stdin("stty -echo; stty cols 1024\n").await?;
            self.wait_for(&self.config.prompt.clone(), None).await?;

            self.write_stdin("dmesg -D\n").await?;
            self.wait_for(&self.config.prompt.clone(), None).await?;

            let (_, retcode, _) = self.exec("export PS1=''", None).await?;
            if retcode != 0 {
                return Err(CommunicationError::Protocol("can't setup prompt string".into()));
            }

            if let Some(virtfs) = &self.config.virtfs {
                let _ = virtfs;
                let (_, retcode, _) = self.exec("mount -t 9p -o trans=virtio host0 /mnt", None).await?;
                if retcode != 0 {
                    return Err(CommunicationError::Protocol("failed to mount virtfs".into()));
                }
            }

            self.logged_in.store(true, Ordering::SeqCst);
            Ok(())
        }
        .await;

        if let Err(err) = result {
            if !self.stopping.load(Ordering::SeqCst) {
                self.stop(iobuf).await?;
                return Err(err);
            }
        }

        Ok(())
    }

    async fn stop(&self, iobuf: Option<&(dyn IoBuffer)>) -> Result<(), CommunicationError> {
        if !self.is_running().await {
            return Ok(());
        }

        tracing::info!("shutting down virtual machine");
        self.stopping.store(true, Ordering::SeqCst);

        if !self.panic.load(Ordering::SeqCst) {
            let contended = self.cmd_lock.try_lock().is_err() || self.fetch_lock.try_lock().is_err();
            if contended {
                self.write_stdin("\x03").await?;
                self.wait_lockers().await;
            }

            if self.logged_in.load(Ordering::SeqCst) {
                self.write_stdin("poweroff; poweroff -f\n").await?;
                while self.is_running().await {
                    let _ = self.read_stdout_chunk(1024, iobuf).await;
                }
                if let Some(child) = self.proc.lock().await.as_mut() {
                    let _ = child.wait().await;
                }
            }
        }

        if self.is_running().await {
            tracing::info!("killing virtual machine");
            if let Some(child) = self.proc.lock().await.as_mut() {
                let _ = child.kill().await;
            }
            self.wait_lockers().await;
            if let Some(child) = self.proc.lock().await.as_mut() {
                let _ = child.wait().await;
            }
        }

        *self.proc.lock().await = None;
        *self.channels.lock().await = None;
        self.stopping.store(false, Ordering::SeqCst);

        tracing::info!("qemu process ended");
        Ok(())
    }

    async fn ping(&self) -> Result<f64, CommunicationError> {
        if !self.is_running().await {
            return Err(CommunicationError::NotRunning);
        }
        let (_, _, exec_time) = self.exec("test .", None).await?;
        Ok(exec_time)
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

        let _guard = self.cmd_lock.lock().await;

        if let Some(cwd) = cwd {
            let (stdout, retcode, _) = self.exec(&format!("cd {cwd}"), None).await?;
            if retcode != 0 {
                return Err(CommunicationError::Protocol(format!(
                    "can't setup current working directory: {stdout}"
                )));
            }
        }

        if let Some(env) = env {
            for (key, value) in env {
                let (stdout, retcode, _) = self.exec(&format!("export {key}={value}"), None).await?;
                if retcode != 0 {
                    return Err(CommunicationError::Protocol(format!(
                        "can't setup env {key}={value}: {stdout}"
                    )));
                }
            }
        }

        let (stdout, retcode, exec_time) = self.exec(command, iobuf).await?;

        Ok(RunOutcome {
            command: command.to_string(),
            return_code: retcode,
            stdout,
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

        let _guard = self.fetch_lock.lock().await;

        let (_, retcode, _) = self.exec(&format!("test -f {path}"), None).await?;
        if retcode != 0 {
            return Err(CommunicationError::Protocol(format!("'{path}' doesn't exist")));
        }

        let transport_dev = self.transport_device();
        let transport_path = self.transport_file();

        let (stdout, retcode, _) = self.exec(&format!("cat {path} > {transport_dev}"), None).await?;
        if self.stopping.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        if ![0, 1, 9].contains(&retcode) {
            return Err(CommunicationError::Protocol(format!(
                "can't send file to {transport_dev}: {stdout}"
            )));
        }

        let file_size = tokio::fs::metadata(&transport_path)
            .await
            .map_err(|err| CommunicationError::Protocol(err.to_string()))?
            .len();

        let mut data = Vec::new();
        let file = AsyncFile::new(&transport_path, FileMode::Read);
        file.open().await.map_err(|err| CommunicationError::Protocol(err.to_string()))?;

        while !self.stopping.load(Ordering::SeqCst) && self.last_pos.load(Ordering::SeqCst) < file_size {
            let pos = self.last_pos.load(Ordering::SeqCst);
            file.seek(pos).await.map_err(|err| CommunicationError::Protocol(err.to_string()))?;
            let chunk = file
                .read_to_end()
                .await
                .map_err(|err| CommunicationError::Protocol(err.to_string()))?;
            data.extend_from_slice(&chunk);
            let new_pos = file.tell().await.map_err(|err| CommunicationError::Protocol(err.to_string()))?;
            self.last_pos.store(new_pos, Ordering::SeqCst);
        }
        file.close().await.map_err(|err| CommunicationError::Protocol(err.to_string()))?;

        Ok(data)
    }

    fn tainted_cache(&self) -> &TaintedCache {
        &self.tainted
    }
}
