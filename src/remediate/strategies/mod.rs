//! Remediation strategies and the backup bookkeeping they share.
//!
//! - [`swap::SwapFixer`]: in-place swap with backup (package directories)
//! - [`staged::StagedInstallFixer`]: deferred single-transaction install
//! - [`dpkg::DistrolessDpkgFixer`]: manual dpkg database maintenance

pub mod dpkg;
pub mod staged;
pub mod swap;

use indexmap::{IndexMap, IndexSet};
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, warn};

use crate::remediate::traits::FixError;

/// Tracks what one fixer moved aside and what it created.
///
/// Originals are moved into `scratch`, keeping their path structure below it,
/// so a backup tree left behind after a failed rollback can be inspected and
/// replayed by hand.
#[derive(Debug)]
pub struct BackupStore {
    scratch: PathBuf,
    /// Original path → backup path, in the order they were moved.
    backups: IndexMap<PathBuf, PathBuf>,
    /// Files, links and directories written by installs, in creation order.
    created: IndexSet<PathBuf>,
    /// Emptied directories removed by [`BackupStore::prune_dir`], deepest first.
    pruned: Vec<PathBuf>,
}

impl BackupStore {
    pub fn new(scratch: impl Into<PathBuf>) -> Self {
        Self {
            scratch: scratch.into(),
            backups: IndexMap::new(),
            created: IndexSet::new(),
            pruned: Vec::new(),
        }
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty() && self.created.is_empty() && self.pruned.is_empty()
    }

    pub fn backup_of(&self, original: &Path) -> Option<&Path> {
        self.backups.get(original).map(PathBuf::as_path)
    }

    fn backup_path(&self, original: &Path) -> Result<PathBuf, FixError> {
        let mut backup = self.scratch.clone();
        for component in original.components() {
            match component {
                Component::Normal(part) => backup.push(part),
                Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(FixError::PathTraversal {
                        attempted: original.display().to_string(),
                    })
                }
            }
        }
        Ok(backup)
    }

    /// Moves `original` into the backup tree.
    ///
    /// Returns `false` when there was nothing to move: the path is missing, is
    /// a directory (directories are shared between packages), was already
    /// stashed, or was created by this run.
    pub fn stash(&mut self, original: &Path) -> Result<bool, FixError> {
        if self.backups.contains_key(original) || self.created.contains(original) {
            return Ok(false);
        }
        let meta = match fs::symlink_metadata(original) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(FixError::io(original)(e)),
        };
        if meta.is_dir() {
            return Ok(false);
        }

        let backup = self.backup_path(original)?;
        if let Some(parent) = backup.parent() {
            fs::create_dir_all(parent).map_err(FixError::io(parent))?;
        }
        move_path(original, &backup).map_err(FixError::io(original))?;
        debug!(original = %original.display(), backup = %backup.display(), "Stashed");
        self.backups.insert(original.to_path_buf(), backup);
        Ok(true)
    }

    /// Creates `dir` and any missing ancestors, remembering each one created.
    pub fn create_dirs(&mut self, dir: &Path) -> Result<(), FixError> {
        let mut missing = Vec::new();
        let mut cursor = Some(dir);
        while let Some(path) = cursor {
            if path.as_os_str().is_empty() || fs::symlink_metadata(path).is_ok() {
                break;
            }
            missing.push(path.to_path_buf());
            cursor = path.parent();
        }
        for path in missing.into_iter().rev() {
            match fs::create_dir(&path) {
                Ok(()) => {
                    self.created.insert(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(FixError::io(path)(e)),
            }
        }
        Ok(())
    }

    /// Removes `dir` with all its subdirectories if no file is left below it.
    ///
    /// Returns `false` and removes nothing when a file remains. Removed
    /// directories are recreated by [`BackupStore::restore`].
    pub fn prune_dir(&mut self, dir: &Path) -> Result<bool, FixError> {
        let mut dirs = vec![dir.to_path_buf()];
        let mut index = 0;
        while index < dirs.len() {
            let current = dirs[index].clone();
            for entry in fs::read_dir(&current).map_err(FixError::io(&current))? {
                let entry = entry.map_err(FixError::io(&current))?;
                let file_type = entry.file_type().map_err(FixError::io(entry.path()))?;
                if !file_type.is_dir() {
                    return Ok(false);
                }
                dirs.push(entry.path());
            }
            index += 1;
        }
        for path in dirs.into_iter().rev() {
            fs::remove_dir(&path).map_err(FixError::io(&path))?;
            debug!(dir = %path.display(), "Pruned");
            self.pruned.push(path);
        }
        Ok(true)
    }

    /// Makes room for a new entry at `path`: parents are created and any
    /// pre-existing non-directory is stashed.
    fn prepare_target(&mut self, path: &Path) -> Result<(), FixError> {
        if let Some(parent) = path.parent() {
            self.create_dirs(parent)?;
        }
        self.stash(path)?;
        if self.created.contains(path) {
            if let Ok(meta) = fs::symlink_metadata(path) {
                if !meta.is_dir() {
                    fs::remove_file(path).map_err(FixError::io(path))?;
                }
            }
        }
        Ok(())
    }

    /// Writes a regular file, stashing whatever was there before.
    pub fn write_file(
        &mut self,
        path: &Path,
        contents: &mut dyn Read,
        mode: Option<u32>,
    ) -> Result<(), FixError> {
        self.prepare_target(path)?;
        let mut file = fs::File::create(path).map_err(FixError::io(path))?;
        self.created.insert(path.to_path_buf());
        io::copy(contents, &mut file).map_err(FixError::io(path))?;
        if let Some(mode) = mode {
            set_mode(path, mode).map_err(FixError::io(path))?;
        }
        Ok(())
    }

    /// Creates a symlink at `link` pointing to `target`.
    pub fn symlink(&mut self, target: &Path, link: &Path) -> Result<(), FixError> {
        self.prepare_target(link)?;
        std::os::unix::fs::symlink(target, link).map_err(FixError::io(link))?;
        self.created.insert(link.to_path_buf());
        Ok(())
    }

    /// Undoes every change: created entries are removed newest first, pruned
    /// directories come back, then backups are moved back newest first.
    ///
    /// Keeps going after a failure and returns `false` if anything could not
    /// be restored; the backup tree is left in place in that case.
    pub fn restore(&mut self) -> bool {
        let mut complete = true;

        for path in self.created.iter().rev() {
            let result = match fs::symlink_metadata(path) {
                Ok(meta) if meta.is_dir() => fs::remove_dir(path),
                Ok(_) => fs::remove_file(path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(path = %path.display(), error = %e, "Failed to remove installed entry");
                complete = false;
            }
        }

        for dir in self.pruned.iter().rev() {
            if let Err(e) = fs::create_dir_all(dir) {
                error!(dir = %dir.display(), error = %e, "Failed to recreate directory");
                complete = false;
            }
        }

        for (original, backup) in self.backups.iter().rev() {
            let result = original
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|()| move_path(backup, original));
            if let Err(e) = result {
                error!(
                    original = %original.display(),
                    backup = %backup.display(),
                    error = %e,
                    "Failed to restore backup"
                );
                complete = false;
            }
        }

        if complete {
            self.created.clear();
            self.pruned.clear();
            self.backups.clear();
        }
        complete
    }

    /// Deletes the backup tree.
    pub fn discard(&mut self) -> bool {
        self.backups.clear();
        self.created.clear();
        self.pruned.clear();
        match fs::remove_dir_all(&self.scratch) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(scratch = %self.scratch.display(), error = %e, "Failed to remove scratch tree");
                false
            }
        }
    }
}

/// Resolves `relative` against `root`, rejecting anything that would escape
/// it (absolute paths or `..` components).
pub fn safe_join(root: &Path, relative: &Path) -> Result<PathBuf, FixError> {
    for component in relative.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(FixError::PathTraversal {
                    attempted: relative.display().to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(root.join(relative))
}

/// Resolves `.` and `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Renames, falling back to copy-and-delete across filesystems.
pub fn move_path(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    let meta = fs::symlink_metadata(from)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(from)?;
        std::os::unix::fs::symlink(target, to)?;
    } else {
        fs::copy(from, to)?;
    }
    fs::remove_file(from)
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_join_rejects_path_traversal() {
        let root = Path::new("/tmp/safe_root");
        assert!(safe_join(root, Path::new("../../etc/passwd")).is_err());
        assert!(safe_join(root, Path::new("/etc/passwd")).is_err());
        assert_eq!(
            safe_join(root, Path::new("pkg/mod.py")).unwrap(),
            PathBuf::from("/tmp/safe_root/pkg/mod.py")
        );
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/venv/lib/site/../../../bin/tool")),
            PathBuf::from("/venv/bin/tool")
        );
    }

    #[test]
    fn test_restore_removes_created_and_replays_backups() {
        let tmp = tempfile::tempdir().unwrap();
        let live = tmp.path().join("live");
        fs::create_dir_all(&live).unwrap();
        fs::write(live.join("keep.txt"), b"old").unwrap();

        let mut store = BackupStore::new(tmp.path().join("scratch"));
        assert!(store.stash(&live.join("keep.txt")).unwrap());
        assert!(!store.stash(&live.join("keep.txt")).unwrap());
        assert!(!store.stash(&live.join("missing.txt")).unwrap());
        store
            .write_file(&live.join("keep.txt"), &mut &b"new"[..], Some(0o644))
            .unwrap();
        store
            .write_file(&live.join("sub/dir/added.txt"), &mut &b"added"[..], None)
            .unwrap();
        store
            .symlink(Path::new("keep.txt"), &live.join("link"))
            .unwrap();

        assert_eq!(fs::read(live.join("keep.txt")).unwrap(), b"new");
        assert!(store.restore());

        assert_eq!(fs::read(live.join("keep.txt")).unwrap(), b"old");
        assert!(!live.join("sub").exists());
        assert!(fs::symlink_metadata(live.join("link")).is_err());
        assert!(store.is_empty());
        assert!(store.discard());
        assert!(!tmp.path().join("scratch").exists());
    }

    #[test]
    fn test_prune_dir_only_removes_file_free_trees() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = tmp.path().join("demo-1.0.dist-info");
        fs::create_dir_all(meta.join("licenses/vendored")).unwrap();
        fs::write(meta.join("licenses/LICENSE"), b"MIT").unwrap();

        let mut store = BackupStore::new(tmp.path().join("scratch"));
        assert!(!store.prune_dir(&meta).unwrap());
        assert!(meta.join("licenses/vendored").is_dir());

        assert!(store.stash(&meta.join("licenses/LICENSE")).unwrap());
        assert!(store.prune_dir(&meta).unwrap());
        assert!(!meta.exists());

        assert!(store.restore());
        assert!(meta.join("licenses/vendored").is_dir());
        assert_eq!(fs::read(meta.join("licenses/LICENSE")).unwrap(), b"MIT");
    }
}
