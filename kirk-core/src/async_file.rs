//! Scoped, non-blocking file access.
//!
//! [`AsyncFile`] opens lazily and closes idempotently so the cooperative scheduler never stalls
//! on disk I/O: every operation runs through tokio's `fs` driver, which offloads the actual
//! syscalls to a blocking worker pool. [`AsyncFile::scoped`] is the usual entry point and
//! mirrors a context-manager block: open, run the closure, close — even on error.

use camino::{Utf8Path, Utf8PathBuf};
use std::future::Future;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// How the file is opened, matching the handful of modes the engine actually needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileMode {
    /// `r`
    Read,
    /// `w` / `w+` truncating write, creating the file if missing.
    Write,
    /// `a` / `a+` append, creating the file if missing.
    Append,
}

impl FileMode {
    fn to_open_options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            FileMode::Read => {
                opts.read(true);
            }
            FileMode::Write => {
                opts.read(true).write(true).create(true).truncate(true);
            }
            FileMode::Append => {
                opts.read(true).append(true).create(true);
            }
        }
        opts
    }
}

/// A file handle that is opened on first use and can be closed and reopened freely.
pub struct AsyncFile {
    path: Utf8PathBuf,
    mode: FileMode,
    file: Mutex<Option<BufReader<File>>>,
}

impl AsyncFile {
    pub fn new(path: impl AsRef<Utf8Path>, mode: FileMode) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            mode,
            file: Mutex::new(None),
        }
    }

    /// Opens the underlying file if it isn't already open. A no-op when already open.
    pub async fn open(&self) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let file = self.mode.to_open_options().open(self.path.as_std_path()).await?;
        *guard = Some(BufReader::new(file));
        Ok(())
    }

    /// Closes the file if open. A no-op when already closed.
    pub async fn close(&self) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            file.shutdown().await?;
        }
        Ok(())
    }

    /// Opens `path` in `mode`, runs `f` against the handle, then closes it regardless of
    /// whether `f` succeeded.
    pub async fn scoped<F, Fut, T>(
        path: impl AsRef<Utf8Path>,
        mode: FileMode,
        f: F,
    ) -> std::io::Result<T>
    where
        F: FnOnce(&AsyncFile) -> Fut,
        Fut: Future<Output = std::io::Result<T>>,
    {
        let handle = AsyncFile::new(path, mode);
        handle.open().await?;
        let result = f(&handle).await;
        handle.close().await?;
        result
    }

    pub async fn read_to_string(&self) -> std::io::Result<String> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().expect("file not open");
        let mut buf = String::new();
        file.read_to_string(&mut buf).await?;
        Ok(buf)
    }

    pub async fn read_to_end(&self) -> std::io::Result<Vec<u8>> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().expect("file not open");
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Reads one line, `\n` included. Returns `None` at EOF (the `StopAsyncIteration`
    /// equivalent) rather than an empty string.
    pub async fn read_line(&self) -> std::io::Result<Option<String>> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().expect("file not open");
        let mut line = String::new();
        let n = file.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    pub async fn write(&self, data: impl AsRef<[u8]>) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().expect("file not open");
        file.write_all(data.as_ref()).await?;
        file.flush().await
    }

    pub async fn seek(&self, pos: u64) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().expect("file not open");
        file.seek(std::io::SeekFrom::Start(pos)).await?;
        Ok(())
    }

    pub async fn tell(&self) -> std::io::Result<u64> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().expect("file not open");
        file.stream_position().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn tmp_path(name: &str) -> Utf8PathBuf {
        let mut p = Utf8PathBuf::from_path_buf(std::env::temp_dir()).unwrap();
        p.push(format!("kirk-async-file-test-{}-{}", std::process::id(), name));
        p
    }

    #[tokio::test]
    async fn scoped_write_then_read_round_trips() {
        let path = tmp_path("roundtrip");
        AsyncFile::scoped(&path, FileMode::Write, |f| async move {
            f.write("hello\nworld\n").await
        })
        .await
        .unwrap();

        let contents = AsyncFile::scoped(&path, FileMode::Read, |f| async move {
            f.read_to_string().await
        })
        .await
        .unwrap();

        assert_eq!(contents, "hello\nworld\n");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn read_line_returns_none_at_eof() {
        let path = tmp_path("eof");
        AsyncFile::scoped(&path, FileMode::Write, |f| async move { f.write("one\n").await })
            .await
            .unwrap();

        let file = AsyncFile::new(&path, FileMode::Read);
        file.open().await.unwrap();
        assert_eq!(file.read_line().await.unwrap(), Some("one\n".to_string()));
        assert_eq!(file.read_line().await.unwrap(), None);
        file.close().await.unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn open_is_idempotent_and_close_without_open_is_a_noop() {
        let path = tmp_path("idempotent");
        let file = AsyncFile::new(&path, FileMode::Write);
        file.open().await.unwrap();
        file.open().await.unwrap();
        file.close().await.unwrap();
        file.close().await.unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn append_mode_preserves_existing_content() {
        let path = tmp_path("append");
        AsyncFile::scoped(&path, FileMode::Write, |f| async move { f.write("a\n").await })
            .await
            .unwrap();
        AsyncFile::scoped(&path, FileMode::Append, |f| async move { f.write("b\n").await })
            .await
            .unwrap();

        let contents = AsyncFile::scoped(&path, FileMode::Read, |f| async move {
            f.read_to_string().await
        })
        .await
        .unwrap();
        assert_eq!(contents, "a\nb\n");
        let _ = std::fs::remove_file(&path);
    }
}
