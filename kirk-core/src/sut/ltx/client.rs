//! Single-consumer LTX client: one task owns the stdout stream, decodes whole msgpack
//! messages from it, and completes pending requests in place as their replies arrive.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::errors::CommunicationError;
use crate::sut::ltx::protocol::{self, Inbound};
use crate::sut::IoBuffer;

/// Completion payload for a pending request, handed back through its oneshot.
#[derive(Debug)]
pub enum LtxReply {
    Version(u32),
    Ping(i64),
    Env,
    Cwd,
    GetFile(Vec<u8>),
    SetFile,
    Exec { time_ns: i64, si_code: i32, si_status: i32 },
    Kill,
}

enum Pending {
    Version(oneshot::Sender<LtxReply>),
    Ping(oneshot::Sender<LtxReply>),
    Env { slot: u8, done: oneshot::Sender<LtxReply> },
    Cwd { slot: u8, done: oneshot::Sender<LtxReply> },
    GetFile { path: String, chunks: Vec<u8>, done: oneshot::Sender<LtxReply> },
    SetFile { path: String, done: oneshot::Sender<LtxReply> },
    Exec {
        slot: u8,
        echoed: bool,
        log: mpsc::UnboundedSender<String>,
        done: oneshot::Sender<LtxReply>,
    },
    Kill { slot: u8, done: oneshot::Sender<LtxReply> },
}

/// Feeds one decoded message to every still-pending request, completing (and removing) the
/// one it matches. Mirrors `Requests.feed` in the reference client: messages are matched by
/// tag plus an echoed slot/path, never by arrival order across different requests.
async fn feed(pending: &mut Vec<Pending>, msg: Inbound) {
    let mut done_idx = None;

    for (idx, req) in pending.iter_mut().enumerate() {
        let matched = match req {
            Pending::Version(_) => msg.tag == protocol::TAG_VERSION,
            Pending::Ping(_) => msg.tag == protocol::TAG_PONG,
            Pending::Env { slot, .. } => {
                msg.tag == protocol::TAG_ENV && msg.field_u8(0) == Some(*slot)
            }
            Pending::Cwd { slot, .. } => {
                msg.tag == protocol::TAG_CWD && msg.field_u8(0) == Some(*slot)
            }
            Pending::GetFile { path, chunks, .. } => match msg.tag {
                protocol::TAG_DATA => {
                    if let Some(chunk) = msg.field_bytes(0) {
                        chunks.extend_from_slice(chunk);
                    }
                    false
                }
                protocol::TAG_GET_FILE => msg.field_str(0) == Some(path.as_str()),
                _ => false,
            },
            Pending::SetFile { path, .. } => {
                msg.tag == protocol::TAG_SET_FILE && msg.field_str(0) == Some(path.as_str())
            }
            Pending::Exec { slot, echoed, log, .. } => match msg.tag {
                protocol::TAG_EXEC if msg.field_u8(0) == Some(*slot) => {
                    *echoed = true;
                    false
                }
                protocol::TAG_LOG if msg.field_u8(0) == Some(*slot) => {
                    if let Some(text) = msg.field_str(2) {
                        let _ = log.send(text.to_string());
                    }
                    false
                }
                protocol::TAG_RESULT if *echoed && msg.field_u8(0) == Some(*slot) => true,
                _ => false,
            },
            Pending::Kill { slot, .. } => {
                msg.tag == protocol::TAG_KILL && msg.field_u8(0) == Some(*slot)
            }
        };

        if matched {
            done_idx = Some(idx);
            break;
        }
    }

    let Some(idx) = done_idx else { return };
    let req = pending.remove(idx);

    match req {
        Pending::Version(done) => {
            let _ = done.send(LtxReply::Version(msg.field_i64(0).unwrap_or(0) as u32));
        }
        Pending::Ping(done) => {
            let _ = done.send(LtxReply::Ping(msg.field_i64(0).unwrap_or(0)));
        }
        Pending::Env { done, .. } => {
            let _ = done.send(LtxReply::Env);
        }
        Pending::Cwd { done, .. } => {
            let _ = done.send(LtxReply::Cwd);
        }
        Pending::GetFile { chunks, done, .. } => {
            let _ = done.send(LtxReply::GetFile(chunks));
        }
        Pending::SetFile { done, .. } => {
            let _ = done.send(LtxReply::SetFile);
        }
        Pending::Exec { done, .. } => {
            let time_ns = msg.field_i64(1).unwrap_or(0);
            let si_code = msg.field_i64(2).unwrap_or(0) as i32;
            let si_status = msg.field_i64(3).unwrap_or(0) as i32;
            let _ = done.send(LtxReply::Exec { time_ns, si_code, si_status });
        }
        Pending::Kill { done, .. } => {
            let _ = done.send(LtxReply::Kill);
        }
    }
}

/// Owns the pipes to a running LTX server process and dispatches its binary protocol.
pub struct LtxClient {
    stdin: AsyncMutex<BufWriter<ChildStdin>>,
    pending: Arc<AsyncMutex<Vec<Pending>>>,
    reader: AsyncMutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    exception: Arc<StdMutex<Option<String>>>,
}

impl LtxClient {
    pub fn connect(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let pending: Arc<AsyncMutex<Vec<Pending>>> = Arc::new(AsyncMutex::new(Vec::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let exception = Arc::new(StdMutex::new(None));

        let (tx, mut rx) = mpsc::unbounded_channel::<rmpv::Value>();

        // Decoding blocks on the underlying pipe, so it runs on a blocking thread; the
        // owning task above just dispatches whatever comes out.
        let decode_handle = {
            let connected = connected.clone();
            let exception = exception.clone();
            tokio::task::spawn_blocking(move || {
                let raw = stdout.try_into_std().ok().expect("stdout pipe must not be split");
                let mut reader = std::io::BufReader::new(raw);
                loop {
                    match rmpv::decode::read_value(&mut reader) {
                        Ok(value) => {
                            if tx.send(value).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            *exception.lock().unwrap() = Some(err.to_string());
                            connected.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            })
        };

        let dispatch_pending = pending.clone();
        let dispatch_handle = tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                if let Some(msg) = Inbound::from_value(value) {
                    if msg.tag == protocol::TAG_ERROR {
                        continue;
                    }
                    let mut guard = dispatch_pending.lock().await;
                    feed(&mut guard, msg).await;
                }
            }
            let _ = decode_handle.await;
        });

        Self {
            stdin: AsyncMutex::new(BufWriter::new(stdin)),
            pending,
            reader: AsyncMutex::new(Some(dispatch_handle)),
            connected,
            exception,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
    }

    fn check_alive(&self) -> Result<(), CommunicationError> {
        if let Some(msg) = self.exception.lock().unwrap().clone() {
            return Err(CommunicationError::Unreachable(msg));
        }
        if !self.is_connected() {
            return Err(CommunicationError::NotRunning);
        }
        Ok(())
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<(), CommunicationError> {
        self.check_alive()?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&bytes)
            .await
            .map_err(|err| CommunicationError::Unreachable(err.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|err| CommunicationError::Unreachable(err.to_string()))
    }

    async fn register<F>(&self, build: F) -> oneshot::Receiver<LtxReply>
    where
        F: FnOnce(oneshot::Sender<LtxReply>) -> Pending,
    {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.push(build(tx));
        rx
    }

    pub async fn version(&self) -> Result<u32, CommunicationError> {
        let rx = self.register(Pending::Version).await;
        self.send(protocol::pack_version()).await?;
        match rx.await {
            Ok(LtxReply::Version(v)) => Ok(v),
            _ => Err(CommunicationError::Protocol("no VERSION reply".into())),
        }
    }

    pub async fn ping(&self) -> Result<i64, CommunicationError> {
        let rx = self.register(Pending::Ping).await;
        self.send(protocol::pack_ping()).await?;
        match rx.await {
            Ok(LtxReply::Ping(t)) => Ok(t),
            _ => Err(CommunicationError::Protocol("no PONG reply".into())),
        }
    }

    pub async fn env(&self, slot: u8, key: &str, value: &str) -> Result<(), CommunicationError> {
        let rx = self.register(|done| Pending::Env { slot, done }).await;
        self.send(protocol::pack_env(slot, key, value)).await?;
        rx.await.map(|_| ()).map_err(|_| CommunicationError::Protocol("no ENV reply".into()))
    }

    pub async fn cwd(&self, slot: u8, path: &str) -> Result<(), CommunicationError> {
        let rx = self.register(|done| Pending::Cwd { slot, done }).await;
        self.send(protocol::pack_cwd(slot, path)).await?;
        rx.await.map(|_| ()).map_err(|_| CommunicationError::Protocol("no CWD reply".into()))
    }

    pub async fn get_file(&self, path: &str) -> Result<Vec<u8>, CommunicationError> {
        let path_owned = path.to_string();
        let rx = self
            .register(|done| Pending::GetFile { path: path_owned, chunks: Vec::new(), done })
            .await;
        self.send(protocol::pack_get_file(path)).await?;
        match rx.await {
            Ok(LtxReply::GetFile(data)) => Ok(data),
            _ => Err(CommunicationError::Protocol("no GET_FILE reply".into())),
        }
    }

    pub async fn set_file(&self, path: &str, data: &[u8]) -> Result<(), CommunicationError> {
        let path_owned = path.to_string();
        let rx = self.register(|done| Pending::SetFile { path: path_owned, done }).await;
        self.send(protocol::pack_set_file(path, data)).await?;
        rx.await.map(|_| ()).map_err(|_| CommunicationError::Protocol("no SET_FILE reply".into()))
    }

    pub async fn kill(&self, slot: u8) -> Result<(), CommunicationError> {
        let rx = self.register(|done| Pending::Kill { slot, done }).await;
        self.send(protocol::pack_kill(slot)).await?;
        rx.await.map(|_| ()).map_err(|_| CommunicationError::Protocol("no KILL reply".into()))
    }

    pub async fn execute(
        &self,
        slot: u8,
        command: &str,
        iobuf: Option<&(dyn IoBuffer)>,
    ) -> Result<(i64, i32, i32, String), CommunicationError> {
        let (log_tx, mut log_rx) = mpsc::unbounded_channel::<String>();
        let mut rx = self
            .register(|done| Pending::Exec { slot, echoed: false, log: log_tx, done })
            .await;
        self.send(protocol::pack_exec(slot, command)).await?;

        let mut stdout = String::new();
        let reply = loop {
            tokio::select! {
                biased;
                line = log_rx.recv() => {
                    match line {
                        Some(text) => {
                            stdout.push_str(&text);
                            if let Some(buf) = iobuf {
                                buf.write(&text).await;
                            }
                        }
                        None => {}
                    }
                }
                result = &mut rx => break result,
            }
        };

        match reply {
            Ok(LtxReply::Exec { time_ns, si_code, si_status }) => {
                Ok((time_ns, si_code, si_status, stdout))
            }
            _ => Err(CommunicationError::Protocol("no RESULT reply".into())),
        }
    }
}

/// Tracks which slots are currently reserved for an in-flight execution.
#[derive(Default)]
pub struct SlotTable {
    reserved: StdMutex<BTreeMap<u8, ()>>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Linear scan for the first free slot in `0..=MAX_SLOT`, marking it reserved.
    pub fn reserve(&self) -> Option<u8> {
        let mut reserved = self.reserved.lock().unwrap();
        for slot in 0..=protocol::MAX_SLOT {
            if !reserved.contains_key(&slot) {
                reserved.insert(slot, ());
                return Some(slot);
            }
        }
        None
    }

    pub fn release(&self, slot: u8) {
        self.reserved.lock().unwrap().remove(&slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmpv::Value;

    fn inbound(tag: u8, fields: Vec<Value>) -> Inbound {
        let mut array = vec![Value::from(tag)];
        array.extend(fields);
        Inbound::from_value(Value::Array(array)).unwrap()
    }

    #[test]
    fn slot_table_reserves_lowest_free_id_and_releases() {
        let table = SlotTable::new();
        assert_eq!(table.reserve(), Some(0));
        assert_eq!(table.reserve(), Some(1));
        table.release(0);
        assert_eq!(table.reserve(), Some(0));
    }

    #[tokio::test]
    async fn exec_requires_echo_before_result_completes_it() {
        let (done_tx, done_rx) = oneshot::channel();
        let (log_tx, mut log_rx) = mpsc::unbounded_channel();
        let mut pending = vec![Pending::Exec { slot: 3, echoed: false, log: log_tx, done: done_tx }];

        // A RESULT for the right slot before the EXEC echo must not complete the request.
        feed(&mut pending, inbound(protocol::TAG_RESULT, vec![Value::from(3u8), Value::from(0i64), Value::from(1i64), Value::from(0i64)])).await;
        assert_eq!(pending.len(), 1);

        feed(&mut pending, inbound(protocol::TAG_EXEC, vec![Value::from(3u8), Value::from("true")])).await;
        assert_eq!(pending.len(), 1);

        feed(&mut pending, inbound(protocol::TAG_LOG, vec![Value::from(3u8), Value::from(0i64), Value::from("hi\n")])).await;
        assert_eq!(log_rx.recv().await.unwrap(), "hi\n");

        feed(&mut pending, inbound(protocol::TAG_RESULT, vec![Value::from(3u8), Value::from(0i64), Value::from(1i64), Value::from(0i64)])).await;
        assert!(pending.is_empty());

        match done_rx.await.unwrap() {
            LtxReply::Exec { si_code, si_status, .. } => {
                assert_eq!(si_code, 1);
                assert_eq!(si_status, 0);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_file_accumulates_data_chunks_before_completion() {
        let (done_tx, done_rx) = oneshot::channel();
        let mut pending =
            vec![Pending::GetFile { path: "/proc/version".into(), chunks: Vec::new(), done: done_tx }];

        feed(&mut pending, inbound(protocol::TAG_DATA, vec![Value::from(b"abc".to_vec())])).await;
        feed(&mut pending, inbound(protocol::TAG_DATA, vec![Value::from(b"def".to_vec())])).await;
        feed(&mut pending, inbound(protocol::TAG_GET_FILE, vec![Value::from("/proc/version")])).await;

        assert!(pending.is_empty());
        match done_rx.await.unwrap() {
            LtxReply::GetFile(data) => assert_eq!(data, b"abcdef"),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
