//! SUT (System Under Test) abstraction: the capability set every transport implements, plus
//! the behavior shared across all of them (info snapshot, tainted-kernel detection, fault
//! injection helpers).

pub mod host;
pub mod ltx;
pub mod qemu;
pub mod ssh;

use std::collections::BTreeMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{timeout, Duration};

use crate::errors::CommunicationError;
use crate::plugin::Plugin;

/// Sink for a transport's live stdout, written to as data streams in.
#[async_trait]
pub trait IoBuffer: Send + Sync {
    async fn write(&self, data: &str);
}

/// Convenience [`IoBuffer`] that discards everything written to it.
pub struct NullBuffer;

#[async_trait]
impl IoBuffer for NullBuffer {
    async fn write(&self, _data: &str) {}
}

/// Outcome of one [`Sut::run`] call.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub command: String,
    pub return_code: i32,
    pub stdout: String,
    pub exec_time: f64,
}

/// Fixed, order-significant dictionary for `/proc/sys/kernel/tainted`: bit *i* (low to high)
/// maps to `TAINTED_MESSAGES[i]`.
pub const TAINTED_MESSAGES: [&str; 18] = [
    "proprietary module was loaded",
    "module was force loaded",
    "kernel running on an out of specification system",
    "module was force unloaded",
    "processor reported a Machine Check Exception (MCE)",
    "bad page referenced or some unexpected page flags",
    "taint requested by userspace application",
    "kernel died recently, i.e. there was an OOPS or BUG",
    "ACPI table overridden by user",
    "kernel issued warning",
    "staging driver was loaded",
    "workaround for bug in platform firmware applied",
    "externally-built (\"out-of-tree\") module was loaded",
    "unsigned module was loaded",
    "soft lockup occurred",
    "kernel has been live patched",
    "auxiliary taint, defined for and used by distros",
    "kernel was built with the struct randomization plugin",
];

/// Fault-injection knob files under `/sys/kernel/debug`, toggled together by
/// [`Sut::setup_fault_injection`].
pub const FAULT_INJECTION_FILES: [&str; 4] =
    ["fail_io_timeout", "fail_make_request", "fail_page_alloc", "failslab"];

/// Shared tainted-code cache: at most one `/proc` read in flight, and the last snapshot is
/// never evicted, only overwritten, so concurrent callers always have something to read
/// while the read is in progress.
#[derive(Default)]
pub struct TaintedCache {
    lock: AsyncMutex<()>,
    cached: StdMutex<Option<(i32, Vec<String>)>>,
}

impl TaintedCache {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Capability set common to every transport: host process, SSH, QEMU serial console, LTX
/// binary protocol. See the individual modules for the wire-level details each one layers on
/// top of [`Sut::run`].
#[async_trait]
pub trait Sut: Plugin + Send + Sync {
    /// Whether concurrent `run` calls are safe on this transport.
    fn parallel_ok(&self) -> bool;

    async fn is_running(&self) -> bool;

    async fn start(&self, iobuf: Option<&(dyn IoBuffer)>) -> Result<(), CommunicationError>;

    async fn stop(&self, iobuf: Option<&(dyn IoBuffer)>) -> Result<(), CommunicationError>;

    /// Round-trip time of a no-op command.
    async fn ping(&self) -> Result<f64, CommunicationError>;

    async fn run(
        &self,
        command: &str,
        cwd: Option<&str>,
        env: Option<&BTreeMap<String, String>>,
        iobuf: Option<&(dyn IoBuffer)>,
    ) -> Result<RunOutcome, CommunicationError>;

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, CommunicationError>;

    /// Accessor for the transport's tainted-code cache; every implementor simply stores one.
    fn tainted_cache(&self) -> &TaintedCache;

    /// Retries `start`, calling `stop` between attempts, re-raising the last error once the
    /// budget is exhausted.
    async fn ensure_start(
        &self,
        iobuf: Option<&(dyn IoBuffer)>,
        retries: u32,
    ) -> Result<(), CommunicationError> {
        let retries = retries.max(1);
        let mut last_err = None;

        for attempt in 0..retries {
            match self.start(iobuf).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if attempt + 1 >= retries {
                        return Err(err);
                    }
                    last_err = Some(err);
                    self.stop(iobuf).await?;
                }
            }
        }

        Err(last_err.unwrap_or(CommunicationError::Unreachable("retries exhausted".into())))
    }

    /// Seven-field best-effort snapshot of the SUT's identity. Each subfield is resolved by a
    /// 1.5s bounded command and defaults to `"unknown"` on timeout or nonzero exit.
    async fn get_info(&self) -> SutInfo {
        async fn run_cmd(sut: &(impl Sut + ?Sized), cmd: &str) -> String {
            match timeout(Duration::from_millis(1500), sut.run(cmd, None, None, None)).await {
                Ok(Ok(out)) if out.return_code == 0 => out.stdout.trim_end().to_string(),
                _ => "unknown".to_string(),
            }
        }

        let (distro, distro_ver, kernel, arch, cpu, meminfo) = tokio::join!(
            run_cmd(self, ". /etc/os-release && echo \"$ID\""),
            run_cmd(self, ". /etc/os-release && echo \"$VERSION_ID\""),
            run_cmd(self, "uname -s -r -v"),
            run_cmd(self, "uname -m"),
            run_cmd(self, "uname -p"),
            run_cmd(self, "cat /proc/meminfo"),
        );

        let (ram, swap) = parse_meminfo(&meminfo);

        SutInfo {
            distro,
            distro_ver,
            kernel,
            arch,
            cpu,
            ram,
            swap,
        }
    }

    /// Reads and parses `/proc/sys/kernel/tainted`. Concurrent callers share one kernel read:
    /// if the lock is currently held, the last cached snapshot is returned instead of
    /// queueing behind it.
    async fn get_tainted(&self) -> Result<(i32, Vec<String>), CommunicationError> {
        let cache = self.tainted_cache();

        if cache.lock.try_lock().is_err() {
            if let Some(snapshot) = cache.cached.lock().unwrap().clone() {
                return Ok(snapshot);
            }
        }

        let _guard = cache.lock.lock().await;

        let out = self.run("cat /proc/sys/kernel/tainted", None, None, None).await?;
        if out.return_code != 0 {
            return Err(CommunicationError::Protocol(
                "can't read tainted kernel information".into(),
            ));
        }

        let code_str = out.stdout.trim();
        let code: i32 = code_str
            .parse()
            .map_err(|_| CommunicationError::Protocol(code_str.to_string()))?;

        let messages = TAINTED_MESSAGES
            .iter()
            .enumerate()
            .filter(|(i, _)| (code >> i) & 1 == 1)
            .map(|(_, msg)| msg.to_string())
            .collect::<Vec<_>>();

        *cache.cached.lock().unwrap() = Some((code, messages.clone()));

        Ok((code, messages))
    }

    async fn logged_as_root(&self) -> Result<bool, CommunicationError> {
        let out = self.run("id -u", None, None, None).await?;
        if out.return_code != 0 {
            return Err(CommunicationError::Protocol(
                "can't determine if running as root".into(),
            ));
        }
        let val = out.stdout.trim_end();
        let uid: i64 = val
            .parse()
            .map_err(|_| CommunicationError::Protocol(format!("'id -u' returned {val}")))?;
        Ok(uid == 0)
    }

    async fn is_fault_injection_enabled(&self) -> Result<bool, CommunicationError> {
        for ftype in FAULT_INJECTION_FILES {
            let out = self
                .run(&format!("test -d /sys/kernel/debug/{ftype}"), None, None, None)
                .await?;
            if out.return_code != 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Configures kernel fault injection. `prob == 0` resets to defaults.
    async fn setup_fault_injection(&self, prob: u32) -> Result<(), CommunicationError> {
        let (interval, times) = if prob == 0 { (1, 1) } else { (100, -1) };

        for ftype in FAULT_INJECTION_FILES {
            let base = format!("/sys/kernel/debug/{ftype}");
            for (value, suffix) in [
                (0i64, "space"),
                (times, "times"),
                (interval, "interval"),
                (prob as i64, "probability"),
            ] {
                let out = self.run(&format!("echo {value} > {base}/{suffix}"), None, None, None).await?;
                if out.return_code != 0 {
                    return Err(CommunicationError::Protocol(format!(
                        "can't setup {base}/{suffix}: {}",
                        out.stdout
                    )));
                }
            }
        }

        Ok(())
    }
}

fn parse_meminfo(meminfo: &str) -> (String, String) {
    if meminfo == "unknown" || meminfo.is_empty() {
        return ("unknown".to_string(), "unknown".to_string());
    }

    let mem_re = Regex::new(r"MemTotal:\s+(\d+\s+kB)").unwrap();
    let swap_re = Regex::new(r"SwapTotal:\s+(\d+\s+kB)").unwrap();

    let ram = mem_re
        .captures(meminfo)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let swap = swap_re
        .captures(meminfo)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| "unknown".to_string());

    (ram, swap)
}

/// Re-exported here so callers only need `sut::SutInfo` alongside `sut::Sut`.
pub use crate::results::SutInfo;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeSut {
        tainted: TaintedCache,
        reads: Arc<AtomicU32>,
        tainted_code: i32,
    }

    #[async_trait]
    impl Plugin for FakeSut {
        fn name(&self) -> &str {
            "fake"
        }
    }

    #[async_trait]
    impl Sut for FakeSut {
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
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(RunOutcome {
                command: command.to_string(),
                return_code: 0,
                stdout: self.tainted_code.to_string(),
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

    #[test]
    fn meminfo_parses_mem_total_and_swap_total() {
        let sample = "MemTotal:       16314172 kB\nMemFree: 1 kB\nSwapTotal:       2097148 kB\n";
        let (ram, swap) = parse_meminfo(sample);
        assert_eq!(ram, "16314172 kB");
        assert_eq!(swap, "2097148 kB");
    }

    #[tokio::test]
    async fn tainted_bits_map_low_to_high() {
        let sut = FakeSut {
            tainted: TaintedCache::new(),
            reads: Arc::new(AtomicU32::new(0)),
            tainted_code: 0b101,
        };
        let (code, messages) = sut.get_tainted().await.unwrap();
        assert_eq!(code, 5);
        assert_eq!(
            messages,
            vec![
                TAINTED_MESSAGES[0].to_string(),
                TAINTED_MESSAGES[2].to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_get_tainted_shares_one_read() {
        let sut = Arc::new(FakeSut {
            tainted: TaintedCache::new(),
            reads: Arc::new(AtomicU32::new(0)),
            tainted_code: 0,
        });

        let a = sut.clone();
        let b = sut.clone();
        let (ra, rb) = tokio::join!(a.get_tainted(), b.get_tainted());
        ra.unwrap();
        rb.unwrap();

        // Both callers observe a result; at least one real read happened.
        assert!(sut.reads.load(Ordering::SeqCst) >= 1);
    }
}
