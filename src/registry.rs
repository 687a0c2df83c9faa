//! Ecosystem registry keyed on indicator files.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::RemediationConfig;
use crate::ecosystems::os::{APK_INSTALLED, DPKG_STATUS, RPM_DB};
use crate::ecosystems::{OsManager, PipManager};
use crate::model::ManagerKind;
use crate::traits::PackageManager;

/// Where an indicator path is resolved from.
#[derive(Debug, Clone, Copy)]
enum Base {
    Project,
    Root,
}

const INDICATORS: &[(ManagerKind, Base, &[&str])] = &[
    (
        ManagerKind::Pip,
        Base::Project,
        &["requirements.txt", "pyproject.toml", "setup.py"],
    ),
    (ManagerKind::Apk, Base::Root, &[APK_INSTALLED]),
    (ManagerKind::Dpkg, Base::Root, &[DPKG_STATUS]),
    (ManagerKind::Rpm, Base::Root, &[RPM_DB]),
];

/// The package managers present in a project and on a filesystem root.
#[derive(Default)]
pub struct ManagerRegistry {
    managers: Vec<Arc<dyn PackageManager>>,
}

impl ManagerRegistry {
    /// Returns one manager per ecosystem with an indicator under
    /// `project_dir` (language ecosystems) or `root` (OS ecosystems).
    pub fn detect(project_dir: &Path, root: &Path) -> Self {
        let mut managers: Vec<Arc<dyn PackageManager>> = Vec::new();
        for (kind, base, indicators) in INDICATORS {
            let base_dir = match base {
                Base::Project => project_dir,
                Base::Root => root,
            };
            let Some(found) = indicators.iter().find(|i| base_dir.join(i).exists()) else {
                continue;
            };
            debug!(ecosystem = %kind, indicator = %found, "Ecosystem detected");
            let manager: Arc<dyn PackageManager> = match kind {
                ManagerKind::Pip => Arc::new(PipManager::discover(project_dir)),
                os => Arc::new(OsManager::new(*os, root)),
            };
            managers.push(manager);
        }
        info!(count = managers.len(), "Package managers detected");
        Self { managers }
    }

    pub fn from_config(project_dir: &Path, config: &RemediationConfig) -> Self {
        Self::detect(project_dir, &config.root)
    }

    pub fn managers(&self) -> &[Arc<dyn PackageManager>] {
        &self.managers
    }

    pub fn get(&self, kind: ManagerKind) -> Option<Arc<dyn PackageManager>> {
        self.managers.iter().find(|m| m.kind() == kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ManagerKind> {
        self.managers.iter().map(|m| m.kind()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}
