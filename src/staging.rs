use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A fresh HOME directory for one reviewer invocation. Confines CLI caches
/// and credential files; removed when dropped.
pub struct IsolatedHome {
    dir: TempDir,
}

impl IsolatedHome {
    pub fn new() -> Result<Self> {
        let dir = TempDir::with_prefix("cerberus-home-")
            .map_err(|e| Error::Staging(format!("failed to create isolated home: {e}")))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The per-perspective scratchpad path inside this HOME. The prompt
    /// tells the model to write progress here so a timed-out run can still
    /// be salvaged.
    pub fn scratchpad_path(&self, perspective: &str) -> PathBuf {
        self.dir.path().join(format!("{perspective}-scratchpad.md"))
    }
}

#[derive(Debug)]
enum Backup {
    /// Destination did not exist before staging.
    Absent,
    /// Original file content moved aside.
    Saved(PathBuf),
}

#[derive(Debug)]
struct StagedEntry {
    dest: PathBuf,
    backup: Backup,
}

/// Stages trusted files into a consumer checkout and restores the checkout
/// byte-identically on drop.
///
/// The LLM CLI auto-discovers project config and agent definitions from the
/// working tree, so a run inside a consumer repository must temporarily
/// place trusted copies there. Destinations that are symlinks or otherwise
/// not regular files are refused outright.
pub struct WorkspaceStaging {
    backup_dir: TempDir,
    staged: Vec<StagedEntry>,
    restored: bool,
}

impl WorkspaceStaging {
    pub fn new() -> Result<Self> {
        let backup_dir = TempDir::with_prefix("cerberus-staging-")
            .map_err(|e| Error::Staging(format!("failed to create backup dir: {e}")))?;
        Ok(Self {
            backup_dir,
            staged: Vec::new(),
            restored: false,
        })
    }

    /// Copy `source` (trusted) to `dest` inside the workspace, backing up
    /// any existing regular file at `dest`.
    pub fn stage(&mut self, source: &Path, dest: &Path) -> Result<()> {
        if !source.is_file() {
            return Err(Error::Staging(format!(
                "trusted source is not a regular file: {}",
                source.display()
            )));
        }

        let backup = match std::fs::symlink_metadata(dest) {
            Err(_) => Backup::Absent,
            Ok(meta) => {
                if !meta.is_file() {
                    return Err(Error::Staging(format!(
                        "refusing to overwrite non-regular file: {}",
                        dest.display()
                    )));
                }
                let backup_path = self.backup_dir.path().join(format!(
                    "{}.bak",
                    self.staged.len()
                ));
                std::fs::copy(dest, &backup_path).map_err(|e| {
                    Error::Staging(format!("failed to back up {}: {e}", dest.display()))
                })?;
                Backup::Saved(backup_path)
            }
        };

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Staging(format!("failed to create {}: {e}", parent.display())))?;
        }
        std::fs::copy(source, dest)
            .map_err(|e| Error::Staging(format!("failed to stage {}: {e}", dest.display())))?;
        debug!(dest = %dest.display(), "staged trusted file");

        self.staged.push(StagedEntry {
            dest: dest.to_path_buf(),
            backup,
        });
        Ok(())
    }

    /// Put the workspace back exactly as it was. Idempotent; also invoked
    /// from Drop as a safety net.
    pub fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        // Restore in reverse order so nested stagings unwind cleanly.
        let mut first_err = None;
        for entry in self.staged.drain(..).rev() {
            let result = match &entry.backup {
                Backup::Absent => std::fs::remove_file(&entry.dest),
                Backup::Saved(backup_path) => {
                    std::fs::copy(backup_path, &entry.dest).map(|_| ())
                }
            };
            if let Err(e) = result {
                warn!(dest = %entry.dest.display(), "failed to restore staged file: {e}");
                if first_err.is_none() {
                    first_err = Some(Error::Staging(format!(
                        "failed to restore {}: {e}",
                        entry.dest.display()
                    )));
                }
            }
        }
        self.restored = true;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for WorkspaceStaging {
    fn drop(&mut self) {
        if !self.restored
            && let Err(e) = self.restore()
        {
            warn!("workspace restore on drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn isolated_home_created_and_removed() {
        let path;
        {
            let home = IsolatedHome::new().unwrap();
            path = home.path().to_path_buf();
            assert!(path.exists());
            let scratch = home.scratchpad_path("security");
            assert!(scratch.ends_with("security-scratchpad.md"));
        }
        assert!(!path.exists());
    }

    #[test]
    fn stage_new_file_removed_on_restore() {
        let trusted = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let source = trusted.path().join("agent.md");
        fs::write(&source, "trusted agent").unwrap();
        let dest = workspace.path().join(".cerberus").join("agent.md");

        let mut staging = WorkspaceStaging::new().unwrap();
        staging.stage(&source, &dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "trusted agent");

        staging.restore().unwrap();
        assert!(!dest.exists());
    }

    #[test]
    fn stage_existing_file_restored_byte_identical() {
        let trusted = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let source = trusted.path().join("config.toml");
        fs::write(&source, "trusted = true").unwrap();
        let dest = workspace.path().join("config.toml");
        fs::write(&dest, "original consumer content").unwrap();

        let mut staging = WorkspaceStaging::new().unwrap();
        staging.stage(&source, &dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "trusted = true");

        staging.restore().unwrap();
        assert_eq!(
            fs::read_to_string(&dest).unwrap(),
            "original consumer content"
        );
    }

    #[test]
    fn restore_runs_on_drop() {
        let trusted = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let source = trusted.path().join("a.md");
        fs::write(&source, "x").unwrap();
        let dest = workspace.path().join("a.md");

        {
            let mut staging = WorkspaceStaging::new().unwrap();
            staging.stage(&source, &dest).unwrap();
            assert!(dest.exists());
        }
        assert!(!dest.exists());
    }

    #[cfg(unix)]
    #[test]
    fn refuses_to_overwrite_symlink() {
        let trusted = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let source = trusted.path().join("a.md");
        fs::write(&source, "x").unwrap();
        let target = workspace.path().join("target.md");
        fs::write(&target, "t").unwrap();
        let dest = workspace.path().join("link.md");
        std::os::unix::fs::symlink(&target, &dest).unwrap();

        let mut staging = WorkspaceStaging::new().unwrap();
        let err = staging.stage(&source, &dest).unwrap_err();
        assert!(err.to_string().contains("non-regular file"));
        // symlink untouched
        assert!(fs::symlink_metadata(&dest).unwrap().file_type().is_symlink());
    }

    #[test]
    fn refuses_directory_destination() {
        let trusted = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let source = trusted.path().join("a.md");
        fs::write(&source, "x").unwrap();
        let dest = workspace.path().join("subdir");
        fs::create_dir(&dest).unwrap();

        let mut staging = WorkspaceStaging::new().unwrap();
        assert!(staging.stage(&source, &dest).is_err());
    }

    #[test]
    fn missing_source_rejected() {
        let workspace = tempfile::tempdir().unwrap();
        let mut staging = WorkspaceStaging::new().unwrap();
        let err = staging
            .stage(Path::new("/nonexistent/agent.md"), &workspace.path().join("a"))
            .unwrap_err();
        assert!(err.to_string().contains("not a regular file"));
    }

    #[test]
    fn multiple_stagings_unwind() {
        let trusted = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let s1 = trusted.path().join("1.md");
        let s2 = trusted.path().join("2.md");
        fs::write(&s1, "one").unwrap();
        fs::write(&s2, "two").unwrap();
        let d1 = workspace.path().join("1.md");
        let d2 = workspace.path().join("2.md");
        fs::write(&d1, "orig1").unwrap();

        let mut staging = WorkspaceStaging::new().unwrap();
        staging.stage(&s1, &d1).unwrap();
        staging.stage(&s2, &d2).unwrap();
        staging.restore().unwrap();

        assert_eq!(fs::read_to_string(&d1).unwrap(), "orig1");
        assert!(!d2.exists());
        // second restore is a no-op
        staging.restore().unwrap();
    }
}
