//! Sandbox directories and bounded-retention eviction.

use crate::error::SessionError;
use crate::state::SessionRegistry;
use nix::unistd::{chown, Gid, Uid};
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reject names that would escape the sandbox root.
pub fn validate_sandbox_name(name: &str) -> Result<(), SessionError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(SessionError::InvalidSandboxName(name.to_string()));
    }
    Ok(())
}

/// What one eviction sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed: Vec<String>,
    /// Candidates left alone because a live session uses them.
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

/// Trim `root` down to `keep` entries, oldest name first.
///
/// Only the first `len - keep` entries are candidates; an active candidate
/// is skipped without pulling in a newer entry to take its place. Names are
/// assumed to sort in creation order, which caller-chosen sandbox names can
/// violate.
pub fn evict(root: &Path, keep: usize, is_active: impl Fn(&str) -> bool) -> EvictionReport {
    let mut report = EvictionReport::default();
    if keep == 0 {
        return report;
    }

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "Cannot list sandboxes");
            return report;
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.file_name().to_string_lossy().into_owned()),
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Skipping unreadable sandbox entry");
                None
            }
        })
        .collect();
    names.sort();

    let removable = names.len().saturating_sub(keep);
    for name in names.into_iter().take(removable) {
        if is_active(&name) {
            debug!(sandbox = %name, "Sandbox still in use, not evicting");
            report.skipped.push(name);
            continue;
        }

        let path = root.join(&name);
        let result = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                info!(sandbox = %name, "Evicted sandbox");
                report.removed.push(name);
            }
            Err(e) => {
                warn!(sandbox = %name, error = %e, "Failed to evict sandbox");
                report.failed.push(name);
            }
        }
    }
    report
}

/// Creates sandboxes under one root and evicts old ones against the live
/// session registry.
#[derive(Clone)]
pub struct SandboxManager {
    root: PathBuf,
    keep: usize,
    registry: Arc<SessionRegistry>,
}

impl SandboxManager {
    pub fn new(root: impl Into<PathBuf>, keep: usize, registry: Arc<SessionRegistry>) -> Self {
        Self {
            root: root.into(),
            keep,
            registry,
        }
    }

    pub fn path_for(&self, name: &str) -> Result<PathBuf, SessionError> {
        validate_sandbox_name(name)?;
        Ok(self.root.join(name))
    }

    /// Create the sandbox (0755, owned by `owner`) unless it already exists.
    pub fn ensure_sandbox(&self, name: &str, owner: Option<(u32, u32)>) -> Result<PathBuf, SessionError> {
        let path = self.path_for(name)?;
        let fail = |source: io::Error| SessionError::Sandbox {
            path: path.clone(),
            source,
        };

        if path.is_dir() {
            debug!(sandbox = %name, "Reusing existing sandbox");
            return Ok(path);
        }

        fs::create_dir_all(&self.root).map_err(fail)?;
        match fs::DirBuilder::new().mode(0o755).create(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => return Ok(path),
            Err(e) => return Err(fail(e)),
        }
        // The umask may have narrowed the mode.
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).map_err(fail)?;

        if let Some((uid, gid)) = owner {
            chown(path.as_path(), Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
                .map_err(|e| fail(io::Error::from(e)))?;
        }

        info!(sandbox = %name, path = %path.display(), "Created sandbox");
        Ok(path)
    }

    /// One eviction sweep, checking liveness against the registry per entry.
    pub fn evict(&self) -> EvictionReport {
        let registry = &self.registry;
        evict(&self.root, self.keep, |name| registry.is_sandbox_active(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_names() {
        for name in ["", ".", "..", "a/b", "../etc"] {
            assert!(validate_sandbox_name(name).is_err(), "{name:?} accepted");
        }
        assert!(validate_sandbox_name("20240101000000000").is_ok());
        assert!(validate_sandbox_name("..hidden").is_ok());
    }

    #[test]
    fn ensure_creates_once_and_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(dir.path().join("boxes"), 0, Arc::new(SessionRegistry::default()));

        let path = manager.ensure_sandbox("one", None).unwrap();
        assert!(path.is_dir());
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);

        fs::write(path.join("marker"), b"x").unwrap();
        let again = manager.ensure_sandbox("one", None).unwrap();
        assert_eq!(again, path);
        assert!(again.join("marker").exists());
    }

    #[test]
    fn missing_root_evicts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let report = evict(&dir.path().join("absent"), 1, |_| false);
        assert_eq!(report, EvictionReport::default());
    }
}
