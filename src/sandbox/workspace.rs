//! Disposable workspace directories.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A per-run workspace directory under a base directory.
///
/// The directory name combines the run id with a timestamp so retried runs
/// with the same id never collide.
#[derive(Debug, Clone)]
pub struct Workspace {
    run_id: String,
    path: PathBuf,
    created: bool,
}

impl Workspace {
    /// Plans a workspace path without touching the filesystem.
    pub fn plan(base: &Path, run_id: &str) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            run_id: run_id.to_string(),
            path: base.join(format!("{}-{}", sanitize(run_id), timestamp)),
            created: false,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the directory, failing if it already exists.
    pub async fn create(&mut self) -> Result<()> {
        if let Some(base) = self.path.parent() {
            tokio::fs::create_dir_all(base).await.map_err(|e| {
                Error::SandboxCreation(format!(
                    "cannot create workspace base {}: {}",
                    base.display(),
                    e
                ))
            })?;
        }
        tokio::fs::create_dir(&self.path).await.map_err(|e| {
            Error::SandboxCreation(format!(
                "cannot create workspace {}: {}",
                self.path.display(),
                e
            ))
        })?;
        self.created = true;

        tracing::info!(path = ?self.path, run_id = %self.run_id, "created workspace");
        Ok(())
    }

    /// Removes the directory unless `preserve` is set. Never fails.
    pub async fn remove(&mut self, preserve: bool) {
        if !self.created {
            return;
        }
        if preserve {
            tracing::info!(path = ?self.path, "preserving workspace for inspection");
            return;
        }
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                self.created = false;
                tracing::debug!(path = ?self.path, "removed workspace");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.created = false,
            Err(e) => {
                tracing::warn!(error = %e, path = ?self.path, "failed to remove workspace");
            }
        }
    }
}

/// Keeps run ids usable as a single path component.
fn sanitize(run_id: &str) -> String {
    let cleaned: String = run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn planned_path_includes_run_id() {
        let ws = Workspace::plan(Path::new("/base"), "tutorial 1/a");
        let name = ws.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("tutorial-1-a-"));
        assert_eq!(ws.run_id(), "tutorial 1/a");
    }

    #[tokio::test]
    async fn workspace_creates_and_removes() {
        let base = TempDir::new().unwrap();
        let mut ws = Workspace::plan(base.path(), "run");
        ws.create().await.unwrap();
        assert!(ws.path().is_dir());

        let path = ws.path().to_path_buf();
        ws.remove(false).await;
        assert!(!path.exists());

        // second removal is a no-op
        ws.remove(false).await;
    }

    #[tokio::test]
    async fn preserved_workspace_survives() {
        let base = TempDir::new().unwrap();
        let mut ws = Workspace::plan(base.path(), "keep");
        ws.create().await.unwrap();
        ws.remove(true).await;
        assert!(ws.path().is_dir());
    }

    #[tokio::test]
    async fn workspace_creates_missing_base() {
        let base = TempDir::new().unwrap();
        let nested = base.path().join("a").join("b");
        let mut ws = Workspace::plan(&nested, "run");
        ws.create().await.unwrap();
        assert!(ws.path().starts_with(&nested));
    }
}
