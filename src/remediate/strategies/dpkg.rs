//! Strategy C: dpkg database maintenance without the `dpkg` binary.
//!
//! Distroless images ship `/var/lib/dpkg` but no package manager. Removal
//! follows the package's own `info/<pkg>.list`, installation unpacks the
//! `.deb` envelope by hand, and the `status` database is rewritten. Every
//! touched path goes through a [`BackupStore`] keyed by absolute path.
//! Maintainer scripts are not run.

use flate2::read::GzDecoder;
use xz2::read::XzDecoder;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::EntryType;
use tracing::{debug, info, instrument};

use super::{safe_join, BackupStore};
use crate::model::{Artifact, DependencyDescriptor, DependencyInstance};
use crate::remediate::traits::{FixError, FixOutcome, Fixer};

const AR_MAGIC: &[u8] = b"!<arch>\n";
const AR_HEADER_LEN: usize = 60;
const INSTALLED_STATUS: &str = "Status: install ok installed";

// ============================================================================
// Archive Parsing
// ============================================================================

/// One member of an `ar` archive.
#[derive(Debug)]
struct ArMember<'a> {
    name: String,
    data: &'a [u8],
}

fn read_ar(bytes: &[u8]) -> Result<Vec<ArMember<'_>>, String> {
    if !bytes.starts_with(AR_MAGIC) {
        return Err("missing ar magic".to_string());
    }
    let mut members = Vec::new();
    let mut offset = AR_MAGIC.len();
    while offset + AR_HEADER_LEN <= bytes.len() {
        let header = &bytes[offset..offset + AR_HEADER_LEN];
        if &header[58..60] != b"`\n" {
            return Err(format!("corrupt ar header at offset {offset}"));
        }
        let name = String::from_utf8_lossy(&header[0..16])
            .trim_end()
            .trim_end_matches('/')
            .to_string();
        let size: usize = String::from_utf8_lossy(&header[48..58])
            .trim()
            .parse()
            .map_err(|_| format!("invalid size for ar member {name}"))?;
        let start = offset + AR_HEADER_LEN;
        let end = start
            .checked_add(size)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| format!("truncated ar member {name}"))?;
        members.push(ArMember {
            name,
            data: &bytes[start..end],
        });
        offset = end + size % 2;
    }
    Ok(members)
}

/// Opens a `control.tar*` / `data.tar*` member, decompressing by suffix.
fn open_tar<'a>(member: &ArMember<'a>) -> Result<tar::Archive<Box<dyn Read + 'a>>, String> {
    let name = member.name.as_str();
    let reader: Box<dyn Read + 'a> = if name.ends_with(".tar.gz") {
        Box::new(GzDecoder::new(member.data))
    } else if name.ends_with(".tar.xz") {
        Box::new(XzDecoder::new(member.data))
    } else if name.ends_with(".tar.zst") {
        let decoder = zstd::stream::read::Decoder::new(member.data)
            .map_err(|e| format!("{name}: {e}"))?;
        Box::new(decoder)
    } else if name.ends_with(".tar") {
        Box::new(member.data)
    } else {
        return Err(format!("unsupported compression for {name}"));
    };
    Ok(tar::Archive::new(reader))
}

/// Whether `file_name` is a control record of `key`: `<key>.<ext>` with a
/// single-component extension. Package names may contain dots, so
/// `python3.11.list` belongs to `python3.11`, not `python3`.
fn is_record_of(file_name: &str, key: &str) -> bool {
    file_name
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| stem == key && !ext.is_empty())
}

/// Entry path without the leading `./`.
fn entry_relative(path: &Path) -> PathBuf {
    path.strip_prefix(".").unwrap_or(path).to_path_buf()
}

/// A file from `control.tar`.
struct ControlFile {
    name: String,
    contents: Vec<u8>,
    mode: u32,
}

/// The parts of a `.deb` this strategy needs.
struct DebPackage<'a> {
    control: Vec<ControlFile>,
    data: ArMember<'a>,
}

impl<'a> DebPackage<'a> {
    fn parse(bytes: &'a [u8]) -> Result<Self, String> {
        let mut members = read_ar(bytes)?;
        if !members.iter().any(|m| m.name == "debian-binary") {
            return Err("missing debian-binary member".to_string());
        }
        let data_index = members
            .iter()
            .position(|m| m.name.starts_with("data.tar"))
            .ok_or("missing data.tar member")?;
        let data = members.swap_remove(data_index);
        let control_member = members
            .iter()
            .find(|m| m.name.starts_with("control.tar"))
            .ok_or("missing control.tar member")?;

        let mut control = Vec::new();
        let mut archive = open_tar(control_member)?;
        for entry in archive.entries().map_err(|e| e.to_string())? {
            let mut entry = entry.map_err(|e| e.to_string())?;
            if entry.header().entry_type() != EntryType::Regular {
                continue;
            }
            let path = entry.path().map_err(|e| e.to_string())?;
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let mode = entry.header().mode().unwrap_or(0o644);
            let mut contents = Vec::new();
            entry
                .read_to_end(&mut contents)
                .map_err(|e| e.to_string())?;
            control.push(ControlFile {
                name,
                contents,
                mode,
            });
        }
        Ok(Self { control, data })
    }

    fn control_fields(&self) -> Result<String, String> {
        let file = self
            .control
            .iter()
            .find(|f| f.name == "control")
            .ok_or("missing control file")?;
        Ok(String::from_utf8_lossy(&file.contents).trim_end().to_string())
    }
}

fn field<'a>(stanza: &'a str, key: &str) -> Option<&'a str> {
    stanza.lines().find_map(|line| {
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(str::trim)
    })
}

/// Replaces the installed stanza of `package` in a dpkg `status` database.
fn replace_status_stanza(
    status: &str,
    package: &str,
    arch: Option<&str>,
    control: &str,
) -> Option<String> {
    let mut replaced = false;
    let stanzas: Vec<String> = status
        .split("\n\n")
        .filter(|s| !s.trim().is_empty())
        .map(|stanza| {
            let stanza = stanza.trim_matches('\n');
            let same_arch = match (arch, field(stanza, "Architecture")) {
                (Some(wanted), Some(found)) => found == wanted || found == "all",
                _ => true,
            };
            if !replaced && field(stanza, "Package") == Some(package) && same_arch {
                replaced = true;
                let mut lines: Vec<&str> = control
                    .lines()
                    .filter(|l| !l.starts_with("Status:"))
                    .collect();
                let at = lines
                    .iter()
                    .position(|l| l.starts_with("Package:"))
                    .map_or(0, |i| i + 1);
                lines.insert(at, INSTALLED_STATUS);
                lines.join("\n")
            } else {
                stanza.to_string()
            }
        })
        .collect();
    replaced.then(|| stanzas.join("\n\n") + "\n")
}

// ============================================================================
// Fixer
// ============================================================================

pub struct DistrolessDpkgFixer {
    root: PathBuf,
    store: BackupStore,
}

impl DistrolessDpkgFixer {
    pub fn new(root: impl Into<PathBuf>, workdir: &Path) -> Self {
        Self {
            root: root.into(),
            store: BackupStore::new(workdir.join("backup")),
        }
    }

    fn admin_dir(&self) -> PathBuf {
        self.root.join("var/lib/dpkg")
    }

    fn info_dir(&self) -> PathBuf {
        self.admin_dir().join("info")
    }

    /// `pkg:arch` for multi-arch installs, `pkg` otherwise.
    fn info_key(&self, package: &str, arch: Option<&str>) -> String {
        if let Some(arch) = arch {
            let qualified = format!("{package}:{arch}");
            if self.info_dir().join(format!("{qualified}.list")).exists() {
                return qualified;
            }
        }
        package.to_string()
    }

    /// Moves every file the installed package owns, plus its control
    /// records, into the backup tree.
    fn uninstall(&mut self, key: &str) -> Result<usize, FixError> {
        let list = self.info_dir().join(format!("{key}.list"));
        let contents = fs::read_to_string(&list).map_err(|e| FixError::Manifest {
            path: list.clone(),
            reason: e.to_string(),
        })?;

        let mut moved = 0;
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let target = safe_join(&self.root, Path::new(line.trim_start_matches('/')))?;
            if self.store.stash(&target)? {
                moved += 1;
            }
        }

        let info_dir = self.info_dir();
        let mut records: Vec<PathBuf> = fs::read_dir(&info_dir)
            .map_err(FixError::io(&info_dir))?
            .filter_map(|e| e.ok())
            .filter(|e| is_record_of(&e.file_name().to_string_lossy(), key))
            .map(|e| e.path())
            .collect();
        records.sort();
        for record in records {
            if self.store.stash(&record)? {
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Writes the payload to its absolute locations, returning the new
    /// `.list` contents.
    fn install_payload(&mut self, file: &str, data: &ArMember<'_>) -> Result<String, FixError> {
        let invalid = |reason: String| FixError::Artifact {
            file: file.to_string(),
            reason,
        };
        let mut listed = vec!["/.".to_string()];
        let mut archive = open_tar(data).map_err(invalid)?;

        for entry in archive.entries().map_err(|e| invalid(e.to_string()))? {
            let mut entry = entry.map_err(|e| invalid(e.to_string()))?;
            let relative = entry_relative(&entry.path().map_err(|e| invalid(e.to_string()))?);
            if relative.as_os_str().is_empty() {
                continue;
            }
            let target = safe_join(&self.root, &relative)?;
            let kind = entry.header().entry_type();
            let mode = entry.header().mode().ok();
            let link = entry
                .link_name()
                .map_err(|e| invalid(e.to_string()))?
                .map(|l| l.into_owned());

            match (kind, link) {
                (EntryType::Directory, _) => self.store.create_dirs(&target)?,
                (EntryType::Symlink, Some(link)) => self.store.symlink(&link, &target)?,
                (EntryType::Link, Some(link)) => {
                    let source = safe_join(&self.root, &entry_relative(&link))?;
                    let bytes = fs::read(&source).map_err(FixError::io(&source))?;
                    self.store.write_file(&target, &mut bytes.as_slice(), mode)?;
                }
                (EntryType::Regular | EntryType::Continuous, _) => {
                    self.store.write_file(&target, &mut entry, mode)?
                }
                (other, _) => {
                    debug!(entry = %relative.display(), kind = ?other, "Skipping unsupported tar entry");
                    continue;
                }
            }
            listed.push(format!("/{}", relative.display()).trim_end_matches('/').to_string());
        }
        Ok(listed.join("\n") + "\n")
    }
}

impl Fixer for DistrolessDpkgFixer {
    fn strategy(&self) -> &'static str {
        "distroless-dpkg"
    }

    fn prepare(&mut self) -> Result<(), FixError> {
        if self.root == Path::new("/") && !nix::unistd::Uid::effective().is_root() {
            return Err(FixError::Privilege(
                "dpkg database changes must run as root".to_string(),
            ));
        }
        let status = self.admin_dir().join("status");
        if !status.is_file() {
            return Err(FixError::Manifest {
                path: status,
                reason: "dpkg status database not found".to_string(),
            });
        }
        let scratch = self.store.scratch().to_path_buf();
        fs::create_dir_all(&scratch).map_err(FixError::io(scratch))
    }

    #[instrument(skip_all, fields(package = %descriptor.fix_key(), file = %artifact.file_name))]
    fn fix(
        &mut self,
        descriptor: &DependencyDescriptor,
        instance: &DependencyInstance,
        artifact: &Artifact,
    ) -> Result<FixOutcome, FixError> {
        let invalid = |reason: String| FixError::Artifact {
            file: artifact.file_name.clone(),
            reason,
        };
        let deb = DebPackage::parse(&artifact.bytes).map_err(invalid)?;
        let control = deb.control_fields().map_err(invalid)?;
        if field(&control, "Package") != Some(instance.name.as_str()) {
            return Err(invalid(format!(
                "artifact does not contain package {}",
                instance.name
            )));
        }

        // Read before uninstall moves anything.
        let status_path = self.admin_dir().join("status");
        let status = fs::read_to_string(&status_path).map_err(FixError::io(&status_path))?;
        let new_status =
            replace_status_stanza(&status, &instance.name, instance.arch.as_deref(), &control)
                .ok_or_else(|| FixError::Manifest {
                    path: status_path.clone(),
                    reason: format!("{} is not installed", instance.name),
                })?;

        let key = self.info_key(&instance.name, instance.arch.as_deref());
        let moved = self.uninstall(&key)?;
        let list = self.install_payload(&artifact.file_name, &deb.data)?;

        let info_dir = self.info_dir();
        for record in deb.control.iter().filter(|f| f.name != "control") {
            let path = info_dir.join(format!("{key}.{}", record.name));
            self.store
                .write_file(&path, &mut record.contents.as_slice(), Some(record.mode))?;
        }
        let list_path = info_dir.join(format!("{key}.list"));
        self.store
            .write_file(&list_path, &mut list.as_bytes(), Some(0o644))?;
        self.store
            .write_file(&status_path, &mut new_status.as_bytes(), Some(0o644))?;

        info!(moved, files = list.lines().count(), "Package replaced in dpkg database");
        Ok(FixOutcome {
            applied: true,
            new_disk_path: list_path,
        })
    }

    fn rollback(&mut self) -> bool {
        self.store.restore()
    }

    fn cleanup(&mut self) -> bool {
        self.store.discard()
    }
}
