// Ephemeral per-request workspaces holding the submitted source file
use crate::error::{Result, SandboxError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub const WORKSPACE_PREFIX: &str = "tanuki-ws-";

/// Creates and tracks workspaces under a single root directory
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    provisioned: AtomicUsize,
}

/// One request's workspace.
///
/// Dropping an unreleased workspace still removes it from disk;
/// [`Workspace::release`] does the same but reports failures.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    source_path: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)
            .map_err(|e| SandboxError::workspace(format!("create root {}", root.display()), e))?;
        // Docker bind mounts need an absolute, symlink-free host path
        let root = fs::canonicalize(root)
            .map_err(|e| SandboxError::workspace(format!("resolve root {}", root.display()), e))?;

        Ok(Self {
            root,
            provisioned: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of workspaces this manager has created
    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    /// Prefix shared by all workspaces of this process
    fn process_prefix() -> String {
        format!("{}{}-", WORKSPACE_PREFIX, std::process::id())
    }

    /// Create a uniquely named directory and write `source` into `filename`
    pub async fn provision(&self, source: &str, filename: &str) -> Result<Workspace> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename == "."
            || filename == ".."
        {
            return Err(SandboxError::InvalidRequest(format!(
                "invalid source filename '{}'",
                filename
            )));
        }

        let dir = tempfile::Builder::new()
            .prefix(&Self::process_prefix())
            .tempdir_in(&self.root)
            .map_err(|e| SandboxError::workspace("create workspace directory", e))?;
        self.provisioned.fetch_add(1, Ordering::SeqCst);

        set_mode(dir.path(), 0o755)
            .map_err(|e| SandboxError::workspace("set workspace permissions", e))?;

        let source_path = dir.path().join(filename);
        let mut file = tokio::fs::File::create(&source_path)
            .await
            .map_err(|e| SandboxError::workspace(format!("create {}", filename), e))?;
        file.write_all(source.as_bytes())
            .await
            .map_err(|e| SandboxError::workspace(format!("write {}", filename), e))?;
        file.flush()
            .await
            .map_err(|e| SandboxError::workspace(format!("flush {}", filename), e))?;
        drop(file);

        set_mode(&source_path, 0o644)
            .map_err(|e| SandboxError::workspace("set source permissions", e))?;

        debug!(workspace = %dir.path().display(), file = filename, "Workspace provisioned");

        Ok(Workspace { dir, source_path })
    }

    /// Workspaces of this process still present on disk
    pub fn active(&self) -> Vec<PathBuf> {
        let prefix = Self::process_prefix();
        self.list_matching(|name| name.starts_with(&prefix))
    }

    /// Remove workspaces whose creating process is no longer alive.
    /// Returns how many were removed.
    pub fn sweep_stale(&self) -> usize {
        let mut removed = 0;
        let stale = self.list_matching(|name| match owner_pid(name) {
            Some(pid) => !process_alive(pid),
            None => false,
        });
        for path in stale {
            match fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(workspace = %path.display(), error = %e, "Failed to remove stale workspace"),
            }
        }
        removed
    }

    fn list_matching<F>(&self, matches: F) -> Vec<PathBuf>
    where
        F: Fn(&str) -> bool,
    {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter(|entry| entry.file_name().to_str().map(&matches).unwrap_or(false))
            .map(|entry| entry.path())
            .collect()
    }
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Remove the source file, then the directory.
    /// The directory removal is attempted even if the file removal failed.
    pub fn release(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        let file_result = fs::remove_file(&self.source_path);
        let dir_result = self.dir.close();

        match (file_result, dir_result) {
            (_, Err(e)) => Err(SandboxError::Cleanup(format!(
                "workspace {} not removed: {}",
                path.display(),
                e
            ))),
            (Err(e), Ok(())) if e.kind() != std::io::ErrorKind::NotFound => {
                debug!(workspace = %path.display(), error = %e, "Source file removal failed before directory removal");
                Ok(())
            }
            _ => {
                debug!(workspace = %path.display(), "Workspace released");
                Ok(())
            }
        }
    }
}

/// Pid encoded in a `tanuki-ws-<pid>-<random>` directory name
fn owner_pid(name: &str) -> Option<u32> {
    let rest = name.strip_prefix(WORKSPACE_PREFIX)?;
    let (pid, _) = rest.split_once('-')?;
    pid.parse().ok()
}

/// Check if process is alive. Without procfs every process counts as alive.
#[cfg(target_os = "linux")]
pub(crate) fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_provision_writes_source() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).unwrap();

        let ws = manager.provision("print('hi')", "main.py").await.unwrap();
        assert_eq!(fs::read_to_string(ws.source_path()).unwrap(), "print('hi')");
        assert!(ws.path().starts_with(manager.root()));
        assert_eq!(manager.provisioned(), 1);
        assert_eq!(manager.active().len(), 1);

        ws.release().unwrap();
        assert!(manager.active().is_empty());
    }

    #[tokio::test]
    async fn test_workspaces_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).unwrap();

        let a = manager.provision("a", "main.rs").await.unwrap();
        let b = manager.provision("b", "main.rs").await.unwrap();
        assert_ne!(a.path(), b.path());
        assert_eq!(manager.active().len(), 2);

        drop(a);
        b.release().unwrap();
        assert!(manager.active().is_empty(), "dropped workspace must be removed too");
    }

    #[tokio::test]
    async fn test_rejects_path_like_filenames() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).unwrap();

        for name in ["../evil.py", "a/b.py", "", ".."] {
            assert!(matches!(
                manager.provision("x", name).await,
                Err(SandboxError::InvalidRequest(_))
            ));
        }
        assert_eq!(manager.provisioned(), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_sweep_stale_leaves_own_workspaces() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).unwrap();

        let stale = manager.root().join(format!("{}999999999-abc", WORKSPACE_PREFIX));
        fs::create_dir(&stale).unwrap();
        let own = manager.provision("x", "main.go").await.unwrap();

        assert_eq!(manager.sweep_stale(), 1);
        assert!(!stale.exists());
        assert!(own.path().exists());
        own.release().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_sweep_stale_keeps_live_process_workspaces() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path()).unwrap();

        // pid 1 always exists
        let live = manager.root().join(format!("{}1-abc", WORKSPACE_PREFIX));
        let foreign = manager.root().join("tanuki-ws-notapid");
        fs::create_dir(&live).unwrap();
        fs::create_dir(&foreign).unwrap();

        assert_eq!(manager.sweep_stale(), 0);
        assert!(live.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn test_owner_pid_parsing() {
        assert_eq!(owner_pid("tanuki-ws-4242-x1y2"), Some(4242));
        assert_eq!(owner_pid("tanuki-ws-abc-x1y2"), None);
        assert_eq!(owner_pid("other-4242-x1y2"), None);
        assert!(process_alive(std::process::id()));
    }
}
