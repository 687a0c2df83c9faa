//! OS package managers: apk, dpkg and rpm.
//!
//! Installed packages are read straight from each manager's database under
//! `root` (rpm has no plain-text database, so it is queried through `rpm`).
//! Fixes go through the native binary when it can act on `root`, and through
//! the manual dpkg implementation when it cannot.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::backend::BackendClient;
use crate::model::{Artifact, DependencyDescriptor, DependencyInstance, FixMap, ManagerKind};
use crate::remediate::strategies::dpkg::DistrolessDpkgFixer;
use crate::remediate::strategies::staged::{NativeInstaller, StagedInstallFixer};
use crate::remediate::Fixer;
use crate::traits::{ManagerError, PackageManager};

pub const DPKG_STATUS: &str = "var/lib/dpkg/status";
pub const APK_INSTALLED: &str = "lib/apk/db/installed";
pub const RPM_DB: &str = "var/lib/rpm";

const RPM_QUERY_FORMAT: &str = "%{NAME}\\t%|EPOCH?{%{EPOCH}:}:{}|%{VERSION}-%{RELEASE}\\t%{ARCH}\\n";

pub struct OsManager {
    kind: ManagerKind,
    root: PathBuf,
}

impl OsManager {
    pub fn new(kind: ManagerKind, root: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn database(&self) -> PathBuf {
        match self.kind {
            ManagerKind::Apk => self.root.join(APK_INSTALLED),
            ManagerKind::Rpm => self.root.join(RPM_DB),
            _ => self.root.join(DPKG_STATUS),
        }
    }

    fn list_dpkg(&self, status: &str) -> Vec<DependencyInstance> {
        let info_dir = self.root.join("var/lib/dpkg/info");
        parse_stanzas(status, ':')
            .into_iter()
            .filter(|s| field(s, "Status").is_some_and(|v| v.ends_with(" installed")))
            .filter_map(|s| {
                let name = field(&s, "Package")?.to_string();
                let version = field(&s, "Version")?.to_string();
                let arch = field(&s, "Architecture").filter(|a| *a != "all");
                let qualified = arch.map(|a| info_dir.join(format!("{name}:{a}.list")));
                let disk_path = qualified
                    .filter(|p| p.exists())
                    .unwrap_or_else(|| info_dir.join(format!("{name}.list")));
                Some(self.instance(name, version, arch.map(str::to_string), disk_path))
            })
            .collect()
    }

    fn list_apk(&self, installed: &str) -> Vec<DependencyInstance> {
        let database = self.database();
        parse_stanzas(installed, ':')
            .into_iter()
            .filter_map(|s| {
                let name = field(&s, "P")?.to_string();
                let version = field(&s, "V")?.to_string();
                let arch = field(&s, "A").map(str::to_string);
                let disk_path = pseudo_path(&database, &name);
                Some(self.instance(name, version, arch, disk_path))
            })
            .collect()
    }

    fn list_rpm(&self, output: &str) -> Vec<DependencyInstance> {
        let database = self.database();
        output
            .lines()
            .filter_map(|line| {
                let mut parts = line.split('\t');
                let name = parts.next()?.trim().to_string();
                let version = parts.next()?.trim().to_string();
                let arch = parts.next().map(|a| a.trim().to_string());
                if name.is_empty() || version.is_empty() {
                    return None;
                }
                let disk_path = pseudo_path(&database, &name);
                Some(self.instance(name, version, arch, disk_path))
            })
            .collect()
    }

    fn instance(
        &self,
        name: String,
        version: String,
        arch: Option<String>,
        disk_path: PathBuf,
    ) -> DependencyInstance {
        DependencyInstance {
            normalized_name: name.to_ascii_lowercase(),
            name,
            version,
            manager: self.kind,
            disk_path,
            arch,
            parents: Vec::new(),
        }
    }

    async fn query_rpm(&self) -> Result<String, ManagerError> {
        let mut command = tokio::process::Command::new("rpm");
        if self.root != Path::new("/") {
            command.arg("--root").arg(&self.root);
        }
        let output = command
            .args(["-qa", "--queryformat", RPM_QUERY_FORMAT])
            .output()
            .await?;
        if !output.status.success() {
            return Err(ManagerError::InvalidContent(format!(
                "rpm -qa exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Canonical artifact file name and the architecture segment of the
    /// download path.
    fn artifact_name(&self, descriptor: &DependencyDescriptor) -> (String, String) {
        let fix = &descriptor.available_fix;
        match self.kind {
            ManagerKind::Dpkg => {
                let arch = descriptor.arch().unwrap_or("all").to_string();
                let version = fix.version.split_once(':').map_or(fix.version.as_str(), |(_, v)| v);
                (format!("{}_{}_{}.deb", fix.name, version, arch), arch)
            }
            ManagerKind::Rpm => {
                let arch = descriptor.arch().unwrap_or("noarch").to_string();
                let version = fix.version.split_once(':').map_or(fix.version.as_str(), |(_, v)| v);
                (format!("{}-{}.{}.rpm", fix.name, version, arch), arch)
            }
            _ => {
                let arch = descriptor
                    .arch()
                    .unwrap_or(std::env::consts::ARCH)
                    .to_string();
                (format!("{}-{}.apk", fix.name, fix.version), arch)
            }
        }
    }
}

#[async_trait]
impl PackageManager for OsManager {
    fn kind(&self) -> ManagerKind {
        self.kind
    }

    async fn list_dependencies(&self) -> Result<Vec<DependencyInstance>, ManagerError> {
        let instances = match self.kind {
            ManagerKind::Dpkg => self.list_dpkg(&tokio::fs::read_to_string(self.database()).await?),
            ManagerKind::Apk => self.list_apk(&tokio::fs::read_to_string(self.database()).await?),
            ManagerKind::Rpm => self.list_rpm(&self.query_rpm().await?),
            ManagerKind::Pip => {
                return Err(ManagerError::Unsupported {
                    kind: self.kind,
                    reason: "not an OS package manager".to_string(),
                })
            }
        };
        debug!(ecosystem = %self.kind, count = instances.len(), "Installed packages listed");
        Ok(instances)
    }

    async fn download_package(
        &self,
        server: &BackendClient,
        descriptor: &DependencyDescriptor,
    ) -> Result<Artifact, ManagerError> {
        let fix = &descriptor.available_fix;
        let (file_name, arch) = self.artifact_name(descriptor);
        let path = format!(
            "{}/{}/{}/{}/{}",
            self.kind, fix.name, fix.version, arch, file_name
        );
        Ok(server.download(&path, &file_name).await?)
    }

    fn fixer(&self, workdir: &Path) -> Result<Box<dyn Fixer>, ManagerError> {
        let installer = NativeInstaller::for_kind(self.kind).ok_or_else(|| {
            ManagerError::Unsupported {
                kind: self.kind,
                reason: "no native installer".to_string(),
            }
        })?;

        // The native tools act on the running system only.
        if self.root == Path::new("/") && installer.is_available() {
            info!(program = %installer.program, "Using native package transaction");
            return Ok(Box::new(StagedInstallFixer::new(installer, workdir)));
        }
        match self.kind {
            ManagerKind::Dpkg => {
                info!(root = %self.root.display(), "dpkg binary unavailable, editing database directly");
                Ok(Box::new(DistrolessDpkgFixer::new(&self.root, workdir)))
            }
            kind => Err(ManagerError::Unsupported {
                kind,
                reason: format!("{} binary not available for {}", installer.program, self.root.display()),
            }),
        }
    }

    async fn handle_fixes(&self, _fixes: &FixMap) -> Result<(), ManagerError> {
        // OS packages have no project manifest to rewrite.
        Ok(())
    }
}

/// Splits a `Key<sep> value` database into stanzas of `(key, value)` pairs.
/// Continuation lines (leading whitespace) are ignored.
fn parse_stanzas(contents: &str, separator: char) -> Vec<Vec<(String, String)>> {
    let mut stanzas = Vec::new();
    let mut current = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                stanzas.push(std::mem::take(&mut current));
            }
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            continue;
        }
        if let Some((key, value)) = line.split_once(separator) {
            current.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    if !current.is_empty() {
        stanzas.push(current);
    }
    stanzas
}

fn field<'a>(stanza: &'a [(String, String)], key: &str) -> Option<&'a str> {
    stanza
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Instance location for databases that keep every package in one file.
fn pseudo_path(database: &Path, name: &str) -> PathBuf {
    PathBuf::from(format!("{}#{}", database.display(), name))
}
