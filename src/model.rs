use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Package-manager tag attached to every instance and version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerKind {
    Pip,
    Apk,
    Dpkg,
    Rpm,
}

impl ManagerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerKind::Pip => "pip",
            ManagerKind::Apk => "apk",
            ManagerKind::Dpkg => "dpkg",
            ManagerKind::Rpm => "rpm",
        }
    }

    /// OS package managers publish one artifact per architecture under the
    /// same logical version, so their signatures are bound to an arch too.
    pub fn tracks_architecture(&self) -> bool {
        !matches!(self, ManagerKind::Pip)
    }
}

impl fmt::Display for ManagerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One concrete on-disk occurrence of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInstance {
    pub name: String,
    pub normalized_name: String,
    pub version: String,
    pub manager: ManagerKind,
    pub disk_path: PathBuf,
    pub arch: Option<String>,
    /// Transitive lineage, outermost parent first.
    #[serde(default)]
    pub parents: Vec<String>,
}

impl DependencyInstance {
    pub fn matches(&self, package: &PackageVersion) -> bool {
        self.manager == package.manager
            && self.normalized_name == package.normalized_name
            && self.version == package.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: String,       // CVE-2023-XXXX
    pub severity: String, // "Critical", "High", etc.
    #[serde(default)]
    pub summary: String,
}

/// A library+version known to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageVersion {
    /// Backend library-version id, the id signatures are bound to.
    pub version_id: String,
    pub name: String,
    pub normalized_name: String,
    pub version: String,
    pub manager: ManagerKind,
    pub role: VersionRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum VersionRole {
    Vulnerable {
        open_vulnerabilities: Vec<Vulnerability>,
        recommended_fix_id: Option<String>,
        recommended_fix_version: Option<String>,
        available_fix: Option<Box<PackageVersion>>,
    },
    Fix {
        sealed_vulnerabilities: Vec<Vulnerability>,
        origin_version: String,
    },
}

impl PackageVersion {
    /// `manager:name@version`, stable across runs.
    pub fn signature(&self) -> String {
        format!("{}:{}@{}", self.manager, self.normalized_name, self.version)
    }

    pub fn open_vulnerabilities(&self) -> &[Vulnerability] {
        match &self.role {
            VersionRole::Vulnerable {
                open_vulnerabilities,
                ..
            } => open_vulnerabilities,
            VersionRole::Fix { .. } => &[],
        }
    }

    pub fn available_fix(&self) -> Option<&PackageVersion> {
        match &self.role {
            VersionRole::Vulnerable { available_fix, .. } => available_fix.as_deref(),
            VersionRole::Fix { .. } => None,
        }
    }

    pub fn origin_version(&self) -> Option<&str> {
        match &self.role {
            VersionRole::Fix { origin_version, .. } => Some(origin_version),
            VersionRole::Vulnerable { .. } => None,
        }
    }
}

/// Vulnerable version, its fix and every disk location it was found at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyDescriptor {
    pub vulnerable: PackageVersion,
    pub available_fix: PackageVersion,
    /// Disk path → instance, in discovery order.
    pub locations: IndexMap<PathBuf, DependencyInstance>,
    pub fixed_locations: IndexSet<PathBuf>,
}

impl DependencyDescriptor {
    pub fn new(vulnerable: PackageVersion, available_fix: PackageVersion) -> Self {
        Self {
            vulnerable,
            available_fix,
            locations: IndexMap::new(),
            fixed_locations: IndexSet::new(),
        }
    }

    /// Key shared by the fetch de-duplication and the fix summary.
    pub fn fix_key(&self) -> String {
        format!(
            "{} -> {}",
            self.vulnerable.signature(),
            self.available_fix.signature()
        )
    }

    pub fn manager(&self) -> ManagerKind {
        self.vulnerable.manager
    }

    /// Marks `path` fixed. Paths that are not locations are refused so that
    /// `fixed_locations` stays a subset of `locations`.
    pub fn mark_fixed(&mut self, path: &Path) -> bool {
        if self.locations.contains_key(path) {
            self.fixed_locations.insert(path.to_path_buf());
            true
        } else {
            false
        }
    }

    /// Architecture of the first instance, if the ecosystem recorded one.
    pub fn arch(&self) -> Option<&str> {
        self.locations.values().find_map(|i| i.arch.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixEntry {
    pub fix: PackageVersion,
    pub paths: IndexSet<PathBuf>,
}

/// Summary of one remediation run, keyed by `vulnerable -> fix` signature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixMap {
    entries: IndexMap<String, FixEntry>,
}

impl FixMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `path` as fixed under the descriptor's key.
    ///
    /// Returns `false` without recording when `path` already sits under a
    /// different key: a disk path is fixed at most once per run.
    pub fn record(&mut self, descriptor: &DependencyDescriptor, path: PathBuf) -> bool {
        if self.claimed_elsewhere(descriptor, &path) {
            return false;
        }
        self.entries
            .entry(descriptor.fix_key())
            .or_insert_with(|| FixEntry {
                fix: descriptor.available_fix.clone(),
                paths: IndexSet::new(),
            })
            .paths
            .insert(path);
        true
    }

    /// Whether `path` is already recorded under a key other than the
    /// descriptor's.
    pub fn claimed_elsewhere(&self, descriptor: &DependencyDescriptor, path: &Path) -> bool {
        let key = descriptor.fix_key();
        self.entries
            .iter()
            .any(|(k, entry)| *k != key && entry.paths.contains(path))
    }

    pub fn get(&self, key: &str) -> Option<&FixEntry> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FixEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Identifies one artifact in a batch signature lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactIdentifier {
    pub file_name: String,
    pub library_version_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub file_name: String,
    pub library_version_id: String,
    #[serde(default)]
    pub arch: Option<String>,
    pub signature: String,
}

/// Replacement payload as returned by a package manager download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// A descriptor together with its downloaded artifact.
#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub descriptor: DependencyDescriptor,
    pub artifact: Artifact,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn vulnerable(name: &str, version: &str, fix_version: &str) -> PackageVersion {
        vulnerable_for(ManagerKind::Pip, name, version, fix_version)
    }

    pub fn vulnerable_for(
        manager: ManagerKind,
        name: &str,
        version: &str,
        fix_version: &str,
    ) -> PackageVersion {
        let fix = PackageVersion {
            version_id: format!("{name}-{fix_version}-id"),
            name: name.to_string(),
            normalized_name: name.to_string(),
            version: fix_version.to_string(),
            manager,
            role: VersionRole::Fix {
                sealed_vulnerabilities: vec![cve()],
                origin_version: version.to_string(),
            },
        };
        PackageVersion {
            version_id: format!("{name}-{version}-id"),
            name: name.to_string(),
            normalized_name: name.to_string(),
            version: version.to_string(),
            manager,
            role: VersionRole::Vulnerable {
                open_vulnerabilities: vec![cve()],
                recommended_fix_id: Some(fix.version_id.clone()),
                recommended_fix_version: Some(fix_version.to_string()),
                available_fix: Some(Box::new(fix)),
            },
        }
    }

    pub fn instance(package: &PackageVersion, path: &str) -> DependencyInstance {
        DependencyInstance {
            name: package.name.clone(),
            normalized_name: package.normalized_name.clone(),
            version: package.version.clone(),
            manager: package.manager,
            disk_path: PathBuf::from(path),
            arch: None,
            parents: Vec::new(),
        }
    }

    pub fn descriptor(package: &PackageVersion, paths: &[&str]) -> DependencyDescriptor {
        let fix = package.available_fix().cloned().expect("fixture has a fix");
        let mut descriptor = DependencyDescriptor::new(package.clone(), fix);
        for path in paths {
            descriptor
                .locations
                .insert(PathBuf::from(path), instance(package, path));
        }
        descriptor
    }

    fn cve() -> Vulnerability {
        Vulnerability {
            id: "CVE-2024-0001".to_string(),
            severity: "High".to_string(),
            summary: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_fix_key_is_deterministic() {
        let a = descriptor(&vulnerable("requests", "2.0", "2.0+sp1"), &["p1"]);
        assert_eq!(a.fix_key(), "pip:requests@2.0 -> pip:requests@2.0+sp1");
    }

    #[test]
    fn test_fix_map_rejects_path_under_second_key() {
        let a = descriptor(&vulnerable("a", "1.0", "1.1"), &["p1"]);
        let b = descriptor(&vulnerable("b", "1.0", "1.1"), &["p1"]);
        let mut map = FixMap::new();

        assert!(map.record(&a, PathBuf::from("p1")));
        assert!(map.record(&a, PathBuf::from("p1")));
        assert!(!map.record(&b, PathBuf::from("p1")));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&a.fix_key()).map(|e| e.paths.len()), Some(1));
    }

    #[test]
    fn test_mark_fixed_keeps_subset() {
        let mut d = descriptor(&vulnerable("a", "1.0", "1.1"), &["p1", "p2"]);
        assert!(d.mark_fixed(Path::new("p2")));
        assert!(!d.mark_fixed(Path::new("p3")));
        assert_eq!(d.fixed_locations.len(), 1);
    }

    #[test]
    fn test_version_role_serialization() {
        let package = vulnerable("a", "1.0", "1.1");
        let json = serde_json::to_string(&package).unwrap();
        let back: PackageVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, package);
        assert_eq!(
            back.available_fix().and_then(|f| f.origin_version()),
            Some("1.0")
        );
    }
}
