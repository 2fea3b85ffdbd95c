//! Scoped temporary storage for extracted audio.
//!
//! Every artifact lives in a per-manager temporary directory and is deleted
//! when its [`Artifact`] handle is dropped, unless it was persisted or kept.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::{TempDir, TempPath};
use tracing::debug;

use crate::error::{Result, SamplerError};

const DIR_PREFIX: &str = "speechclip-";

/// Owner of the temporary directory artifacts are allocated in.
#[derive(Debug, Clone)]
pub struct ResourceManager {
    dir: Arc<TempDir>,
}

impl ResourceManager {
    /// Create a manager under the system temporary directory.
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix(DIR_PREFIX).tempdir()?;
        debug!("Allocated work directory {}", dir.path().display());
        Ok(Self { dir: Arc::new(dir) })
    }

    /// Create a manager under `parent`.
    pub fn in_dir(parent: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(parent.as_ref())?;
        let dir = tempfile::Builder::new()
            .prefix(DIR_PREFIX)
            .tempdir_in(parent)?;
        debug!("Allocated work directory {}", dir.path().display());
        Ok(Self { dir: Arc::new(dir) })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Reserve a fresh, uniquely named `.wav` path.
    pub fn allocate(&self, label: &str) -> Result<Artifact> {
        let path = tempfile::Builder::new()
            .prefix(&format!("{label}-"))
            .suffix(".wav")
            .tempfile_in(self.dir.path())?
            .into_temp_path();
        Ok(Artifact {
            path,
            _dir: self.dir.clone(),
        })
    }

    /// Number of artifacts currently on disk.
    pub fn live_artifacts(&self) -> usize {
        std::fs::read_dir(self.dir.path())
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    }
}

/// An extracted audio file, removed from disk on drop.
#[derive(Debug)]
pub struct Artifact {
    path: TempPath,
    // Keeps the directory alive for as long as any artifact is.
    _dir: Arc<TempDir>,
}

impl Artifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the artifact to `dest`, taking it out of automatic cleanup.
    pub fn persist(self, dest: impl AsRef<Path>) -> Result<PathBuf> {
        let dest = dest.as_ref().to_path_buf();
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match std::fs::rename(&self.path, &dest) {
            Ok(()) => {
                // Nothing left at the old name to delete.
                let _ = self.path.keep();
            }
            Err(_) => {
                // Rename fails across filesystems.
                std::fs::copy(&self.path, &dest)?;
                self.cleanup()?;
            }
        }
        Ok(dest)
    }

    /// Delete the artifact now, reporting failures.
    pub fn cleanup(self) -> Result<()> {
        self.path.close()?;
        Ok(())
    }

    /// Leave the file in place and return its path.
    ///
    /// The file still disappears with the work directory.
    pub fn keep(self) -> Result<PathBuf> {
        let path = self
            .path
            .keep()
            .map_err(|e| SamplerError::Io(e.error))?;
        Ok(path)
    }
}

impl Deref for Artifact {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for Artifact {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Stop request shared with blocking work that writes an artifact.
///
/// Once raised, the waiting side may already have deleted the artifact, so
/// the worker must not leave anything at the output path.
#[derive(Debug, Clone, Default)]
pub(crate) struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Guard that raises the signal when dropped.
    pub(crate) fn raise_on_drop(&self) -> RaiseOnDrop {
        RaiseOnDrop(self.clone())
    }

    /// Run `work`, which writes `output`; if the signal is raised meanwhile,
    /// remove `output` and report cancellation instead.
    pub(crate) fn run_writing<T>(
        &self,
        output: &Path,
        work: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let result = work();
        if !self.is_raised() {
            return result;
        }
        match std::fs::remove_file(output) {
            Ok(()) => debug!("Removed abandoned output {}", output.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("Failed to remove abandoned output {}: {}", output.display(), e),
        }
        Err(SamplerError::Cancelled)
    }
}

/// Raises its [`StopSignal`] on drop.
pub(crate) struct RaiseOnDrop(StopSignal);

impl Drop for RaiseOnDrop {
    fn drop(&mut self) {
        self.0.raise();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_unique_paths() {
        let resources = ResourceManager::new().unwrap();
        let a = resources.allocate("clip").unwrap();
        let b = resources.allocate("clip").unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(resources.path()));
        assert_eq!(a.path().extension().unwrap(), "wav");
        assert_eq!(resources.live_artifacts(), 2);
    }

    #[test]
    fn test_drop_removes_file() {
        let resources = ResourceManager::new().unwrap();
        let artifact = resources.allocate("clip").unwrap();
        let path = artifact.path().to_path_buf();
        assert!(path.exists());
        drop(artifact);
        assert!(!path.exists());
        assert_eq!(resources.live_artifacts(), 0);
    }

    #[test]
    fn test_cleanup_removes_file() {
        let resources = ResourceManager::new().unwrap();
        let artifact = resources.allocate("clip").unwrap();
        artifact.cleanup().unwrap();
        assert_eq!(resources.live_artifacts(), 0);
    }

    #[test]
    fn test_persist_moves_out_of_work_dir() {
        let out = tempfile::tempdir().unwrap();
        let resources = ResourceManager::new().unwrap();
        let artifact = resources.allocate("clip").unwrap();
        std::fs::write(artifact.path(), b"RIFF").unwrap();

        let dest = artifact.persist(out.path().join("nested/sample.wav")).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"RIFF");
        assert_eq!(resources.live_artifacts(), 0);
    }

    #[test]
    fn test_directory_outlives_manager() {
        let resources = ResourceManager::new().unwrap();
        let dir = resources.path().to_path_buf();
        let artifact = resources.allocate("clip").unwrap();
        drop(resources);
        assert!(dir.exists());
        drop(artifact);
        assert!(!dir.exists());
    }

    #[test]
    fn test_in_dir_creates_parent() {
        let root = tempfile::tempdir().unwrap();
        let resources = ResourceManager::in_dir(root.path().join("work")).unwrap();
        assert!(resources.path().starts_with(root.path().join("work")));
    }

    #[test]
    fn test_raised_signal_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("late.wav");
        let signal = StopSignal::new();

        let guard = signal.raise_on_drop();
        drop(guard);
        assert!(signal.is_raised());

        let result = signal.run_writing(&output, || {
            std::fs::write(&output, b"RIFF")?;
            Ok(())
        });
        assert!(matches!(result, Err(SamplerError::Cancelled)));
        assert!(!output.exists());
    }

    #[test]
    fn test_unraised_signal_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("done.wav");
        let signal = StopSignal::new();

        let written = signal.run_writing(&output, || {
            std::fs::write(&output, b"RIFF")?;
            Ok(4)
        });
        assert_eq!(written.unwrap(), 4);
        assert!(output.exists());
    }
}
