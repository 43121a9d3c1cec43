//! Run-scoped working directories.
//!
//! Each sandboxed run gets a fresh private directory that doubles as
//! `HOME` and `TMPDIR` for the child. The directory is removed when the
//! [`Workspace`] is dropped, whichever way the run ends.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use super::SandboxError;

/// Private directory for one run.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a workspace under `root`, or the system temp dir if `None`.
    pub fn create(root: Option<&Path>) -> Result<Self, SandboxError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("corral-run-");
        let dir = match root {
            Some(root) => {
                fs::create_dir_all(root).map_err(SandboxError::Workspace)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(SandboxError::Workspace)?;
        Ok(Self { dir })
    }

    /// Workspace directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file into the workspace and return its path.
    pub fn write_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf, SandboxError> {
        let target = self.resolve(name)?;
        fs::write(&target, contents).map_err(SandboxError::Workspace)?;
        Ok(target)
    }

    /// Copy a host file into the workspace.
    ///
    /// The source must resolve (after following symlinks) to a path under one
    /// of `allowed`. The copy keeps the source's file name.
    pub fn stage_input(&self, source: &Path, allowed: &[PathBuf]) -> Result<PathBuf, SandboxError> {
        let resolved = source.canonicalize().map_err(|e| {
            SandboxError::InvalidRequest(format!("input {}: {}", source.display(), e))
        })?;
        let permitted = allowed
            .iter()
            .filter_map(|root| root.canonicalize().ok())
            .any(|root| resolved.starts_with(&root));
        if !permitted {
            return Err(SandboxError::InvalidRequest(format!(
                "input {} is outside the allowed paths",
                source.display()
            )));
        }
        if !resolved.is_file() {
            return Err(SandboxError::InvalidRequest(format!(
                "input {} is not a regular file",
                source.display()
            )));
        }
        let name = resolved
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                SandboxError::InvalidRequest(format!("input {} has no file name", source.display()))
            })?;
        let target = self.resolve(name)?;
        fs::copy(&resolved, &target).map_err(SandboxError::Workspace)?;
        Ok(target)
    }

    /// Remove the directory now instead of on drop.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, SandboxError> {
        let candidate = Path::new(name);
        let plain = candidate.components().count() == 1
            && matches!(
                candidate.components().next(),
                Some(std::path::Component::Normal(_))
            );
        if !plain {
            return Err(SandboxError::InvalidRequest(format!(
                "workspace file name must be a plain name: {}",
                name
            )));
        }
        Ok(self.dir.path().join(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_removed_on_drop() {
        let path = {
            let ws = Workspace::create(None).unwrap();
            ws.write_file("main.py", b"print(1)").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_workspace_under_root() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(Some(root.path())).unwrap();
        assert!(ws.path().starts_with(root.path()));
    }

    #[test]
    fn test_write_file_rejects_traversal() {
        let ws = Workspace::create(None).unwrap();
        assert!(matches!(
            ws.write_file("../escape", b"x"),
            Err(SandboxError::InvalidRequest(_))
        ));
        assert!(ws.write_file("/etc/passwd", b"x").is_err());
    }

    #[test]
    fn test_stage_input_inside_allowed_path() {
        let host = TempDir::new().unwrap();
        let src = host.path().join("data.txt");
        fs::write(&src, "42").unwrap();

        let ws = Workspace::create(None).unwrap();
        let staged = ws.stage_input(&src, &[host.path().to_path_buf()]).unwrap();

        assert_eq!(fs::read_to_string(staged).unwrap(), "42");
    }

    #[test]
    fn test_stage_input_outside_allowed_path() {
        let host = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let src = host.path().join("secret.txt");
        fs::write(&src, "x").unwrap();

        let ws = Workspace::create(None).unwrap();
        let err = ws.stage_input(&src, &[other.path().to_path_buf()]).unwrap_err();

        assert!(matches!(err, SandboxError::InvalidRequest(_)));
    }
}
