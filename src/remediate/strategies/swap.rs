//! Strategy A: in-place swap with backup.
//!
//! Install roots such as `site-packages` are shared by many packages, so the
//! fixer never treats a directory as belonging to one package. It asks the
//! package's own file manifest which files to move aside, then unpacks the
//! replacement over the same root.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use super::BackupStore;
use crate::model::{Artifact, DependencyDescriptor, DependencyInstance};
use crate::remediate::traits::{FixError, FixOutcome, Fixer};

/// Ecosystem-specific knowledge of how an installed package is laid out.
pub trait PackageLayout: Send {
    /// Directory the package's files are installed relative to.
    fn install_root(&self, instance: &DependencyInstance) -> Result<PathBuf, FixError>;

    /// Absolute paths of every file the instance owns, per its manifest.
    fn owned_files(&self, instance: &DependencyInstance) -> Result<Vec<PathBuf>, FixError>;

    /// Unpacks `artifact` over `root` through `store`, returning the new
    /// metadata location of the package if the artifact declares one.
    fn unpack(
        &self,
        store: &mut BackupStore,
        root: &Path,
        artifact: &Artifact,
    ) -> Result<Option<PathBuf>, FixError>;
}

pub struct SwapFixer<L: PackageLayout> {
    layout: L,
    store: BackupStore,
}

impl<L: PackageLayout> SwapFixer<L> {
    pub fn new(layout: L, workdir: &Path) -> Self {
        Self {
            layout,
            store: BackupStore::new(workdir.join("backup")),
        }
    }

    pub fn store(&self) -> &BackupStore {
        &self.store
    }
}

impl<L: PackageLayout> Fixer for SwapFixer<L> {
    fn strategy(&self) -> &'static str {
        "swap"
    }

    fn prepare(&mut self) -> Result<(), FixError> {
        let scratch = self.store.scratch().to_path_buf();
        fs::create_dir_all(&scratch).map_err(FixError::io(scratch))
    }

    #[instrument(skip_all, fields(package = %descriptor.fix_key(), path = %instance.disk_path.display()))]
    fn fix(
        &mut self,
        descriptor: &DependencyDescriptor,
        instance: &DependencyInstance,
        artifact: &Artifact,
    ) -> Result<FixOutcome, FixError> {
        let root = self.layout.install_root(instance)?;
        let files = self.layout.owned_files(instance)?;

        let mut moved = 0usize;
        for file in &files {
            if self.store.stash(file)? {
                moved += 1;
            }
        }
        // The metadata directory is versioned; drop it once emptied so only
        // the new one remains. Rollback recreates it with its files.
        if instance.disk_path.is_dir() && !self.store.prune_dir(&instance.disk_path)? {
            warn!("Package metadata directory not empty after backup");
        }

        let new_disk_path = self
            .layout
            .unpack(&mut self.store, &root, artifact)?
            .unwrap_or_else(|| instance.disk_path.clone());

        info!(
            moved,
            new_path = %new_disk_path.display(),
            "Swapped package files"
        );
        Ok(FixOutcome {
            applied: true,
            new_disk_path,
        })
    }

    fn rollback(&mut self) -> bool {
        self.store.restore()
    }

    fn cleanup(&mut self) -> bool {
        self.store.discard()
    }
}
