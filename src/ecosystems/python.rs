//! Python packages installed from wheels.
//!
//! Each installed distribution is located at its `*.dist-info` directory; its
//! `RECORD` file is the authoritative list of files it owns.

use async_trait::async_trait;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::backend::BackendClient;
use crate::model::{Artifact, DependencyDescriptor, DependencyInstance, FixMap, ManagerKind};
use crate::remediate::strategies::swap::{PackageLayout, SwapFixer};
use crate::remediate::strategies::{normalize_lexically, safe_join, BackupStore};
use crate::remediate::{FixError, Fixer};
use crate::traits::{ManagerError, PackageManager};

const REQUIREMENTS_FILE: &str = "requirements.txt";

/// PEP 503 name normalisation.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for ch in name.chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !in_separator {
                out.push('-');
            }
            in_separator = true;
        } else {
            out.push(ch.to_ascii_lowercase());
            in_separator = false;
        }
    }
    out
}

pub struct PipManager {
    project_dir: PathBuf,
    site_packages: Vec<PathBuf>,
}

impl PipManager {
    pub fn new(project_dir: impl Into<PathBuf>, site_packages: Vec<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            site_packages,
        }
    }

    /// Uses the site-packages directories of `.venv`/`venv` in the project.
    pub fn discover(project_dir: &Path) -> Self {
        let mut site_packages = Vec::new();
        for venv in [".venv", "venv"] {
            let lib = project_dir.join(venv).join("lib");
            let Ok(entries) = fs::read_dir(&lib) else {
                continue;
            };
            for entry in entries.flatten() {
                let candidate = entry.path().join("site-packages");
                if candidate.is_dir() {
                    site_packages.push(candidate);
                }
            }
        }
        site_packages.sort();
        Self::new(project_dir, site_packages)
    }
}

#[async_trait]
impl PackageManager for PipManager {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Pip
    }

    async fn list_dependencies(&self) -> Result<Vec<DependencyInstance>, ManagerError> {
        let dirs = self.site_packages.clone();
        tokio::task::spawn_blocking(move || scan_site_packages(&dirs))
            .await
            .map_err(|e| ManagerError::Unknown(format!("Task join error: {}", e)))?
    }

    async fn download_package(
        &self,
        server: &BackendClient,
        descriptor: &DependencyDescriptor,
    ) -> Result<Artifact, ManagerError> {
        let fix = &descriptor.available_fix;
        let path = format!("pypi/{}/{}/download", fix.normalized_name, fix.version);
        let default_name = format!(
            "{}-{}-py3-none-any.whl",
            fix.normalized_name.replace('-', "_"),
            fix.version
        );
        Ok(server.download(&path, &default_name).await?)
    }

    fn fixer(&self, workdir: &Path) -> Result<Box<dyn Fixer>, ManagerError> {
        Ok(Box::new(SwapFixer::new(WheelLayout, workdir)))
    }

    async fn handle_fixes(&self, fixes: &FixMap) -> Result<(), ManagerError> {
        let path = self.project_dir.join(REQUIREMENTS_FILE);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let (rewritten, changed) = rewrite_requirements(&contents, fixes);
        if changed > 0 {
            tokio::fs::write(&path, rewritten).await?;
            info!(path = %path.display(), changed, "Requirements pins updated");
        }
        Ok(())
    }
}

fn scan_site_packages(dirs: &[PathBuf]) -> Result<Vec<DependencyInstance>, ManagerError> {
    let mut instances = Vec::new();
    for dir in dirs {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "dist-info"))
            .collect();
        entries.sort();

        for dist_info in entries {
            let metadata = match fs::read_to_string(dist_info.join("METADATA")) {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %dist_info.display(), error = %e, "Unreadable METADATA, skipping");
                    continue;
                }
            };
            let field = |key: &str| {
                metadata
                    .lines()
                    .take_while(|line| !line.is_empty())
                    .find_map(|line| line.strip_prefix(key))
                    .map(|v| v.trim().to_string())
            };
            let (Some(name), Some(version)) = (field("Name:"), field("Version:")) else {
                warn!(path = %dist_info.display(), "METADATA lacks Name or Version, skipping");
                continue;
            };
            instances.push(DependencyInstance {
                normalized_name: normalize_name(&name),
                name,
                version,
                manager: ManagerKind::Pip,
                disk_path: dist_info,
                arch: None,
                parents: Vec::new(),
            });
        }
    }
    debug!(count = instances.len(), "Python distributions discovered");
    Ok(instances)
}

fn rewrite_requirements(contents: &str, fixes: &FixMap) -> (String, usize) {
    let mut changed = 0;
    let mut out = String::with_capacity(contents.len());
    for line in contents.lines() {
        let replacement = line.split_once("==").and_then(|(name, version)| {
            let version = version.split(['#', ';', ' ']).next().unwrap_or("").trim();
            let name = name.trim();
            fixes.iter().find_map(|(_, entry)| {
                let matches = normalize_name(name) == entry.fix.normalized_name
                    && entry.fix.origin_version() == Some(version);
                matches.then(|| line.replacen(&format!("=={version}"), &format!("=={}", entry.fix.version), 1))
            })
        });
        match replacement {
            Some(new_line) => {
                changed += 1;
                out.push_str(&new_line);
            }
            None => out.push_str(line),
        }
        out.push('\n');
    }
    (out, changed)
}

/// Parses the first column of a wheel `RECORD` (a CSV with optional quoting).
fn parse_record(contents: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in contents.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
        let path = if let Some(rest) = line.strip_prefix('"') {
            let mut path = String::new();
            let mut chars = rest.chars().peekable();
            while let Some(ch) = chars.next() {
                if ch == '"' {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        path.push('"');
                    } else {
                        break;
                    }
                } else {
                    path.push(ch);
                }
            }
            path
        } else {
            line.split(',').next().unwrap_or_default().to_string()
        };
        if !path.is_empty() {
            paths.push(path);
        }
    }
    paths
}

/// Layout of a wheel-installed distribution.
pub struct WheelLayout;

impl PackageLayout for WheelLayout {
    fn install_root(&self, instance: &DependencyInstance) -> Result<PathBuf, FixError> {
        instance
            .disk_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| FixError::Manifest {
                path: instance.disk_path.clone(),
                reason: "dist-info directory has no parent".to_string(),
            })
    }

    /// Files under the install root only. Scripts and data files that RECORD
    /// lists through `../` stay in place; a replacement overwrites them
    /// through the store when it ships its own copy.
    fn owned_files(&self, instance: &DependencyInstance) -> Result<Vec<PathBuf>, FixError> {
        let record = instance.disk_path.join("RECORD");
        let contents = fs::read_to_string(&record).map_err(|e| FixError::Manifest {
            path: record.clone(),
            reason: e.to_string(),
        })?;
        let root = self.install_root(instance)?;
        Ok(parse_record(&contents)
            .into_iter()
            .map(|p| normalize_lexically(&root.join(p)))
            .filter(|path| {
                let inside = path.starts_with(&root);
                if !inside {
                    debug!(path = %path.display(), "Keeping file outside the install root");
                }
                inside
            })
            .collect())
    }

    fn unpack(
        &self,
        store: &mut BackupStore,
        root: &Path,
        artifact: &Artifact,
    ) -> Result<Option<PathBuf>, FixError> {
        let invalid = |reason: String| FixError::Artifact {
            file: artifact.file_name.clone(),
            reason,
        };
        let mut archive =
            ZipArchive::new(Cursor::new(&artifact.bytes)).map_err(|e| invalid(e.to_string()))?;
        let prefix = install_prefix(root);

        let mut dist_info = None;
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(|e| invalid(e.to_string()))?;
            let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
                return Err(FixError::PathTraversal {
                    attempted: entry.name().to_string(),
                });
            };
            let (target, interpreter) = match (wheel_target(&relative), prefix.as_deref()) {
                (WheelTarget::Root(path), _) => (safe_join(root, &path)?, None),
                (WheelTarget::Prefix(path), Some(prefix)) => (safe_join(prefix, &path)?, None),
                (WheelTarget::Script(path), Some(prefix)) => (
                    safe_join(&prefix.join("bin"), &path)?,
                    Some(prefix.join("bin/python")),
                ),
                (WheelTarget::Prefix(_) | WheelTarget::Script(_), None) => {
                    warn!(entry = %relative.display(), "No installation prefix for wheel data entry");
                    continue;
                }
                (WheelTarget::Unsupported, _) => {
                    warn!(entry = %relative.display(), "Skipping unsupported wheel data scheme");
                    continue;
                }
            };

            if let Some(Component::Normal(first)) = relative.components().next() {
                if first.to_string_lossy().ends_with(".dist-info") {
                    dist_info.get_or_insert_with(|| root.join(first));
                }
            }

            if entry.is_dir() {
                store.create_dirs(&target)?;
            } else if let Some(interpreter) = interpreter {
                let mode = entry.unix_mode().map_or(0o755, |mode| mode | 0o111);
                let mut contents = Vec::new();
                entry
                    .read_to_end(&mut contents)
                    .map_err(|e| invalid(e.to_string()))?;
                let contents = rewrite_shebang(contents, &interpreter);
                store.write_file(&target, &mut contents.as_slice(), Some(mode))?;
            } else {
                let mode = entry.unix_mode();
                store.write_file(&target, &mut entry, mode)?;
            }
        }
        Ok(dist_info)
    }
}

/// Where a wheel entry lands.
#[derive(Debug, PartialEq, Eq)]
enum WheelTarget {
    /// Relative to the install root (`site-packages`).
    Root(PathBuf),
    /// Relative to the environment prefix (`data` files).
    Prefix(PathBuf),
    /// Relative to the environment's `bin/`.
    Script(PathBuf),
    Unsupported,
}

/// Maps `<name>.data/<scheme>/...` entries to their install location.
fn wheel_target(relative: &Path) -> WheelTarget {
    let mut components = relative.components();
    let Some(Component::Normal(first)) = components.next() else {
        return WheelTarget::Root(relative.to_path_buf());
    };
    if !first.to_string_lossy().ends_with(".data") {
        return WheelTarget::Root(relative.to_path_buf());
    }
    let Some(Component::Normal(scheme)) = components.next() else {
        return WheelTarget::Unsupported;
    };
    let rest = components.as_path();
    match scheme.to_str() {
        Some("purelib" | "platlib") => WheelTarget::Root(rest.to_path_buf()),
        Some("scripts") => WheelTarget::Script(rest.to_path_buf()),
        Some("data") => WheelTarget::Prefix(rest.to_path_buf()),
        _ => WheelTarget::Unsupported,
    }
}

/// Prefix of a `<prefix>/lib/pythonX.Y/site-packages` install root.
fn install_prefix(root: &Path) -> Option<PathBuf> {
    let lib = root.parent()?.parent()?;
    match lib.file_name()?.to_str()? {
        "lib" | "lib64" => lib.parent().map(Path::to_path_buf),
        _ => None,
    }
}

const SHEBANG_PLACEHOLDER: &[u8] = b"#!python";

/// Points a `#!python` placeholder shebang at `interpreter`.
fn rewrite_shebang(contents: Vec<u8>, interpreter: &Path) -> Vec<u8> {
    if !contents.starts_with(SHEBANG_PLACEHOLDER) {
        return contents;
    }
    let mut out = format!("#!{}", interpreter.display()).into_bytes();
    out.extend_from_slice(&contents[SHEBANG_PLACEHOLDER.len()..]);
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use std::io::Write;
    use zip::write::FileOptions;

    /// Installs a fake distribution under `site`, returning its dist-info path.
    pub(crate) fn install_fake_wheel(
        site: &Path,
        name: &str,
        version: &str,
        files: &[(&str, &str)],
    ) -> PathBuf {
        let dist_info = site.join(format!("{name}-{version}.dist-info"));
        fs::create_dir_all(&dist_info).unwrap();
        let mut record = String::new();
        for (path, contents) in files {
            let target = site.join(path);
            fs::create_dir_all(target.parent().unwrap()).unwrap();
            fs::write(&target, contents).unwrap();
            record.push_str(&format!("{path},sha256=x,{}\n", contents.len()));
        }
        fs::write(
            dist_info.join("METADATA"),
            format!("Metadata-Version: 2.1\nName: {name}\nVersion: {version}\n\nbody\n"),
        )
        .unwrap();
        record.push_str(&format!("{name}-{version}.dist-info/METADATA,,\n"));
        record.push_str(&format!("{name}-{version}.dist-info/RECORD,,\n"));
        fs::write(dist_info.join("RECORD"), record).unwrap();
        dist_info
    }

    /// Builds a minimal wheel holding `files` plus its dist-info.
    pub(crate) fn build_wheel(name: &str, version: &str, files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().unix_permissions(0o644);
        let dist_info = format!("{name}-{version}.dist-info");
        let mut record = String::new();
        for (path, contents) in files {
            writer.start_file(*path, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
            record.push_str(&format!("{path},,\n"));
        }
        writer
            .start_file(format!("{dist_info}/METADATA"), options)
            .unwrap();
        writer
            .write_all(format!("Name: {name}\nVersion: {version}\n").as_bytes())
            .unwrap();
        record.push_str(&format!("{dist_info}/METADATA,,\n{dist_info}/RECORD,,\n"));
        writer.start_file(format!("{dist_info}/RECORD"), options).unwrap();
        writer.write_all(record.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Foo__Bar.baz"), "foo-bar-baz");
        assert_eq!(normalize_name("requests"), "requests");
    }

    #[test]
    fn test_parse_record_handles_quoting() {
        let record = "pkg/a.py,sha256=abc,10\n\"pkg/odd, name.py\",,\n../../bin/tool,,\n\n";
        assert_eq!(
            parse_record(record),
            vec!["pkg/a.py", "pkg/odd, name.py", "../../bin/tool"]
        );
    }

    #[test]
    fn test_wheel_target() {
        assert_eq!(
            wheel_target(Path::new("demo-1.0.data/purelib/demo/x.py")),
            WheelTarget::Root(PathBuf::from("demo/x.py"))
        );
        assert_eq!(
            wheel_target(Path::new("demo-1.0.data/scripts/tool")),
            WheelTarget::Script(PathBuf::from("tool"))
        );
        assert_eq!(
            wheel_target(Path::new("demo-1.0.data/data/share/man/demo.1")),
            WheelTarget::Prefix(PathBuf::from("share/man/demo.1"))
        );
        assert_eq!(
            wheel_target(Path::new("demo-1.0.data/headers/demo.h")),
            WheelTarget::Unsupported
        );
        assert_eq!(
            wheel_target(Path::new("demo/x.py")),
            WheelTarget::Root(PathBuf::from("demo/x.py"))
        );
    }

    #[test]
    fn test_install_prefix_and_shebang() {
        let root = Path::new("/srv/app/.venv/lib/python3.12/site-packages");
        assert_eq!(install_prefix(root), Some(PathBuf::from("/srv/app/.venv")));
        assert_eq!(install_prefix(Path::new("/opt/site-packages")), None);
        assert_eq!(
            rewrite_shebang(b"#!python\nimport demo\n".to_vec(), Path::new("/venv/bin/python")),
            b"#!/venv/bin/python\nimport demo\n".to_vec()
        );
        assert_eq!(
            rewrite_shebang(b"#!/bin/sh\n".to_vec(), Path::new("/venv/bin/python")),
            b"#!/bin/sh\n"
        );
    }

    #[tokio::test]
    async fn test_list_dependencies_reads_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let site = tmp.path().join(".venv/lib/python3.12/site-packages");
        install_fake_wheel(&site, "Demo_Pkg", "1.0", &[("demo_pkg/__init__.py", "")]);
        fs::create_dir_all(site.join("broken-0.1.dist-info")).unwrap();

        let manager = PipManager::discover(tmp.path());
        let instances = manager.list_dependencies().await.unwrap();

        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].name, "Demo_Pkg");
        assert_eq!(instances[0].normalized_name, "demo-pkg");
        assert_eq!(instances[0].version, "1.0");
        assert_eq!(instances[0].disk_path, site.join("Demo_Pkg-1.0.dist-info"));
    }

    #[tokio::test]
    async fn test_handle_fixes_rewrites_pins() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(REQUIREMENTS_FILE),
            "# deps\nDemo==1.0  # pinned\nother==2.0\n",
        )
        .unwrap();

        let package = vulnerable("demo", "1.0", "1.0+sp1");
        let descriptor = descriptor(&package, &["p1"]);
        let mut fixes = FixMap::new();
        fixes.record(&descriptor, PathBuf::from("p1"));

        PipManager::new(tmp.path(), Vec::new())
            .handle_fixes(&fixes)
            .await
            .unwrap();

        let contents = fs::read_to_string(tmp.path().join(REQUIREMENTS_FILE)).unwrap();
        assert_eq!(contents, "# deps\nDemo==1.0+sp1  # pinned\nother==2.0\n");
    }

    #[test]
    fn test_unpack_rejects_traversal() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("../escape.py", FileOptions::default())
            .unwrap();
        writer.write_all(b"x").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let tmp = tempfile::tempdir().unwrap();
        let mut store = BackupStore::new(tmp.path().join("scratch"));
        let artifact = Artifact {
            file_name: "evil.whl".to_string(),
            bytes,
        };
        let err = WheelLayout
            .unpack(&mut store, &tmp.path().join("site"), &artifact)
            .unwrap_err();
        assert!(matches!(err, FixError::PathTraversal { .. }));
    }
}
