//! Workspace Manager
//!
//! One workspace per render attempt, named `<fingerprint>-<attempt>` so
//! concurrent attempts at the same fingerprint never share a directory.
//! The directory is removed when the handle drops. In debug mode a
//! workspace whose attempt failed is kept for inspection.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::hashing::Fingerprint;

/// Base name shared by every intermediate file in a workspace.
pub const STEM: &str = "formula";

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    debug: bool,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, debug: bool) -> Self {
        Self {
            root: root.into(),
            debug,
        }
    }

    pub async fn create(&self, fingerprint: &Fingerprint) -> io::Result<Workspace> {
        let dir = self.root.join(format!("{}-{}", fingerprint, Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&dir).await?;
        debug!(fingerprint = %fingerprint.short(), dir = %dir.display(), "workspace created");
        Ok(Workspace {
            dir,
            keep_on_failure: self.debug,
            failed: false,
        })
    }
}

/// Scoped handle to a transient render directory.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    keep_on_failure: bool,
    failed: bool,
}

impl Workspace {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of an intermediate file, e.g. `file("tex")` -> `formula.tex`.
    pub fn file(&self, extension: &str) -> PathBuf {
        self.dir.join(format!("{STEM}.{extension}"))
    }

    /// Record that the attempt failed; debug mode keeps the directory.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn is_preserved(&self) -> bool {
        self.failed && self.keep_on_failure
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.is_preserved() {
            warn!(dir = %self.dir.display(), "keeping failed workspace (debug mode)");
            return;
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(dir = %self.dir.display(), error = %err, "failed to remove workspace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_workspace_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), false);
        let ws = manager.create(&Fingerprint::of("x")).await.unwrap();
        std::fs::write(ws.file("tex"), "x").unwrap();
        let dir = ws.dir().to_path_buf();
        assert!(dir.is_dir());
        drop(ws);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_same_fingerprint_gets_distinct_dirs() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), false);
        let fp = Fingerprint::of("x");
        let a = manager.create(&fp).await.unwrap();
        let b = manager.create(&fp).await.unwrap();
        assert_ne!(a.dir(), b.dir());
        assert!(a.dir().file_name().unwrap().to_string_lossy().starts_with(fp.as_str()));
    }

    #[tokio::test]
    async fn test_failed_workspace_removed_without_debug() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), false);
        let mut ws = manager.create(&Fingerprint::of("x")).await.unwrap();
        ws.mark_failed();
        let dir = ws.dir().to_path_buf();
        drop(ws);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_debug_keeps_failed_workspace_only() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), true);

        let mut failed = manager.create(&Fingerprint::of("bad")).await.unwrap();
        failed.mark_failed();
        let failed_dir = failed.dir().to_path_buf();
        drop(failed);
        assert!(failed_dir.is_dir());

        let ok = manager.create(&Fingerprint::of("good")).await.unwrap();
        let ok_dir = ok.dir().to_path_buf();
        drop(ok);
        assert!(!ok_dir.exists());
    }
}
