//! Rotating temporary directory: `<root>/kirk.<user>/<random>`, with a `latest` symlink kept
//! pointing at the most recent one and older ones pruned once `max_rotate` is exceeded.

use camino::{Utf8Path, Utf8PathBuf};

use crate::errors::SessionError;

const FOLDER_PREFIX: &str = "kirk.";
const SYMLINK_NAME: &str = "latest";

/// A [`TempDir`] with no root behaves as a no-op: every path-returning accessor yields an
/// empty string and `mkdir`/`mkfile` are silently skipped. This mirrors letting a session run
/// without ever touching disk (e.g. under `--no-debug`-style configurations).
pub struct TempDir {
    root: Option<Utf8PathBuf>,
    folder: Utf8PathBuf,
}

impl TempDir {
    /// Rotates `root`'s `kirk.<user>` folder, keeping at most `max_rotate` prior runs, then
    /// creates and returns a handle to a brand new one.
    pub fn new(root: Option<&Utf8Path>, max_rotate: u32) -> Result<Self, SessionError> {
        let Some(root) = root else {
            return Ok(Self {
                root: None,
                folder: Utf8PathBuf::new(),
            });
        };

        if !root.is_dir() {
            return Err(SessionError::Other(format!("root folder doesn't exist: {root}")));
        }

        let root = root
            .canonicalize_utf8()
            .map_err(|err| SessionError::Other(err.to_string()))?;

        let username = current_username();
        let tmpbase = root.join(format!("{FOLDER_PREFIX}{username}"));
        std::fs::create_dir_all(&tmpbase).map_err(|err| SessionError::Other(err.to_string()))?;

        prune(&tmpbase, max_rotate)?;

        let folder = camino_tempfile::Builder::new()
            .tempdir_in(&tmpbase)
            .map_err(|err| SessionError::Other(err.to_string()))?
            .into_path();

        let latest = tmpbase.join(SYMLINK_NAME);
        if latest.is_symlink() || latest.exists() {
            let _ = std::fs::remove_file(&latest);
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&folder, &latest).map_err(|err| SessionError::Other(err.to_string()))?;

        Ok(Self {
            root: Some(root),
            folder,
        })
    }

    /// The root directory passed to [`TempDir::new`], or an empty string if none was given.
    pub fn root(&self) -> &str {
        self.root.as_deref().map(Utf8Path::as_str).unwrap_or("")
    }

    /// Absolute path of this run's temporary directory, or an empty string for a rootless
    /// `TempDir`.
    pub fn abspath(&self) -> &str {
        self.folder.as_str()
    }

    pub fn mkdir(&self, path: &str) -> Result<(), SessionError> {
        if self.folder.as_str().is_empty() {
            return Ok(());
        }
        std::fs::create_dir(self.folder.join(path)).map_err(|err| SessionError::Other(err.to_string()))
    }

    pub fn mkfile(&self, path: &str, content: &str) -> Result<(), SessionError> {
        if self.folder.as_str().is_empty() {
            return Ok(());
        }
        std::fs::write(self.folder.join(path), content).map_err(|err| SessionError::Other(err.to_string()))
    }
}

fn prune(tmpbase: &Utf8Path, max_rotate: u32) -> Result<(), SessionError> {
    let mut entries: Vec<(Utf8PathBuf, std::time::SystemTime)> = std::fs::read_dir(tmpbase)
        .map_err(|err| SessionError::Other(err.to_string()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name() != SYMLINK_NAME)
        .filter_map(|entry| {
            let path = Utf8PathBuf::from_path_buf(entry.path()).ok()?;
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((path, modified))
        })
        .collect();
    entries.sort_by_key(|(_, modified)| *modified);

    let max_rotate = max_rotate as usize;
    if entries.len() >= max_rotate {
        let remove_count = entries.len() - max_rotate + 1;
        for (path, _) in entries.into_iter().take(remove_count) {
            let _ = std::fs::remove_dir_all(path);
        }
    }

    Ok(())
}

fn current_username() -> String {
    #[cfg(unix)]
    {
        nix::unistd::User::from_uid(nix::unistd::Uid::current())
            .ok()
            .flatten()
            .map(|user| user.name)
            .unwrap_or_else(|| "unknown".to_string())
    }
    #[cfg(not(unix))]
    {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rootless_tempdir_is_inert() {
        let dir = TempDir::new(None, 5).unwrap();
        assert_eq!(dir.root(), "");
        assert_eq!(dir.abspath(), "");
        dir.mkfile("x", "y").unwrap();
    }

    #[test]
    fn new_tempdir_creates_folder_and_latest_symlink() {
        let base = camino_tempfile::tempdir().unwrap();
        let dir = TempDir::new(Some(base.path()), 5).unwrap();

        assert!(!dir.abspath().is_empty());
        assert!(Utf8Path::new(dir.abspath()).is_dir());

        let username = current_username();
        let latest = base.path().join(format!("{FOLDER_PREFIX}{username}")).join(SYMLINK_NAME);
        assert!(latest.is_symlink());
    }

    #[test]
    fn rotation_prunes_oldest_folders_beyond_max_rotate() {
        let base = camino_tempfile::tempdir().unwrap();

        let mut kept = Vec::new();
        for _ in 0..3 {
            let dir = TempDir::new(Some(base.path()), 2).unwrap();
            kept.push(dir.abspath().to_string());
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let username = current_username();
        let tmpbase = base.path().join(format!("{FOLDER_PREFIX}{username}"));
        let remaining: Vec<_> = std::fs::read_dir(&tmpbase)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != SYMLINK_NAME)
            .collect();

        assert_eq!(remaining.len(), 2);
        assert!(!remaining.iter().any(|e| e.path().to_str().unwrap() == kept[0]));
    }

    #[test]
    fn mkdir_and_mkfile_write_under_the_rotated_folder() {
        let base = camino_tempfile::tempdir().unwrap();
        let dir = TempDir::new(Some(base.path()), 5).unwrap();

        dir.mkdir("sub").unwrap();
        dir.mkfile("sub/file.txt", "hello").unwrap();

        let content = std::fs::read_to_string(Utf8Path::new(dir.abspath()).join("sub/file.txt")).unwrap();
        assert_eq!(content, "hello");
    }
}
