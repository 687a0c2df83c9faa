//! Strategy B: deferred single-transaction install.
//!
//! `fix` only stages artifacts. The live system is touched once, by
//! [`Fixer::commit`], which hands every staged path to the native package
//! manager in a single invocation so the tool's own transaction decides the
//! outcome.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, instrument};

use super::safe_join;
use crate::model::{Artifact, DependencyDescriptor, DependencyInstance, ManagerKind};
use crate::remediate::traits::{FixError, FixOutcome, Fixer};

/// Command line of a native batch install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeInstaller {
    pub program: String,
    pub args: Vec<String>,
}

impl NativeInstaller {
    pub fn for_kind(kind: ManagerKind) -> Option<Self> {
        let (program, args): (&str, &[&str]) = match kind {
            ManagerKind::Apk => ("apk", &["add", "--allow-untrusted", "--no-network"]),
            ManagerKind::Dpkg => ("dpkg", &["-i"]),
            ManagerKind::Rpm => ("rpm", &["-Uvh", "--replacepkgs"]),
            ManagerKind::Pip => return None,
        };
        Some(Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        })
    }

    /// Whether the installer binary can be found.
    pub fn is_available(&self) -> bool {
        if self.program.contains('/') {
            Path::new(&self.program).is_file()
        } else {
            which::which(&self.program).is_ok()
        }
    }
}

pub struct StagedInstallFixer {
    installer: NativeInstaller,
    staging: PathBuf,
    queue: Vec<PathBuf>,
    require_root: bool,
}

impl StagedInstallFixer {
    pub fn new(installer: NativeInstaller, workdir: &Path) -> Self {
        Self {
            installer,
            staging: workdir.join("staging"),
            queue: Vec::new(),
            require_root: true,
        }
    }

    /// Skips the effective-uid check in [`Fixer::prepare`].
    pub fn without_privilege_check(mut self) -> Self {
        self.require_root = false;
        self
    }

    pub fn queue(&self) -> &[PathBuf] {
        &self.queue
    }
}

impl Fixer for StagedInstallFixer {
    fn strategy(&self) -> &'static str {
        "staged"
    }

    fn prepare(&mut self) -> Result<(), FixError> {
        if self.require_root && !nix::unistd::Uid::effective().is_root() {
            return Err(FixError::Privilege(format!(
                "{} fixes must run as root",
                self.installer.program
            )));
        }
        if !self.installer.is_available() {
            return Err(FixError::MissingTool(self.installer.program.clone()));
        }
        fs::create_dir_all(&self.staging).map_err(FixError::io(&self.staging))
    }

    #[instrument(skip_all, fields(package = %descriptor.fix_key(), file = %artifact.file_name))]
    fn fix(
        &mut self,
        descriptor: &DependencyDescriptor,
        instance: &DependencyInstance,
        artifact: &Artifact,
    ) -> Result<FixOutcome, FixError> {
        let staged = safe_join(&self.staging, Path::new(&artifact.file_name))?;
        if !self.queue.contains(&staged) {
            fs::write(&staged, &artifact.bytes).map_err(FixError::io(&staged))?;
            self.queue.push(staged);
            info!(queued = self.queue.len(), "Artifact staged");
        }
        Ok(FixOutcome {
            applied: true,
            new_disk_path: instance.disk_path.clone(),
        })
    }

    fn commit(&mut self) -> Result<(), FixError> {
        if self.queue.is_empty() {
            return Ok(());
        }
        info!(
            program = %self.installer.program,
            packages = self.queue.len(),
            "Running native install transaction"
        );
        let output = Command::new(&self.installer.program)
            .args(&self.installer.args)
            .args(&self.queue)
            .output()
            .map_err(FixError::io(&self.installer.program))?;

        if !output.status.success() {
            return Err(FixError::Installer {
                command: self.installer.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn rollback(&mut self) -> bool {
        // Nothing on the live system changes before `commit`, and a failed
        // commit is undone by the native transaction itself.
        true
    }

    fn cleanup(&mut self) -> bool {
        self.queue.clear();
        match fs::remove_dir_all(&self.staging) {
            Ok(()) => true,
            Err(e) => e.kind() == std::io::ErrorKind::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, body: &str) -> NativeInstaller {
        let path = dir.join("installer.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        NativeInstaller {
            program: path.to_string_lossy().into_owned(),
            args: vec!["-i".to_string()],
        }
    }

    fn stage(fixer: &mut StagedInstallFixer, name: &str) {
        let package = vulnerable_for(ManagerKind::Dpkg, name, "1.0", "1.1");
        let list = format!("/var/lib/dpkg/info/{name}.list");
        let descriptor = descriptor(&package, &[list.as_str()]);
        let instance = descriptor.locations[0].clone();
        let artifact = Artifact {
            file_name: format!("{name}_1.1_amd64.deb"),
            bytes: name.as_bytes().to_vec(),
        };
        fixer.fix(&descriptor, &instance, &artifact).unwrap();
    }

    #[test]
    fn test_single_transaction_for_all_staged_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("calls.log");
        let installer = script(tmp.path(), &format!("printf '%s\\n' \"$*\" >> {}", log.display()));
        let work = tmp.path().join("work");

        let mut fixer = StagedInstallFixer::new(installer, &work).without_privilege_check();
        fixer.prepare().unwrap();
        stage(&mut fixer, "libfoo");
        stage(&mut fixer, "libbar");
        stage(&mut fixer, "libbaz");
        assert!(!log.exists(), "nothing may run before commit");

        fixer.commit().unwrap();

        let calls = fs::read_to_string(&log).unwrap();
        let lines: Vec<_> = calls.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("-i "));
        for name in ["libfoo", "libbar", "libbaz"] {
            assert!(lines[0].contains(&format!("{name}_1.1_amd64.deb")));
        }
        assert!(fixer.cleanup());
        assert!(!work.join("staging").exists());
    }

    #[test]
    fn test_failed_transaction_reports_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let installer = script(tmp.path(), "echo 'dependency problems' >&2\nexit 1");

        let mut fixer =
            StagedInstallFixer::new(installer, &tmp.path().join("work")).without_privilege_check();
        fixer.prepare().unwrap();
        stage(&mut fixer, "libfoo");

        match fixer.commit().unwrap_err() {
            FixError::Installer { stderr, .. } => assert_eq!(stderr, "dependency problems"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(fixer.rollback());
    }

    #[test]
    fn test_prepare_requires_installer_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let installer = NativeInstaller {
            program: "definitely-not-an-installer".to_string(),
            args: Vec::new(),
        };
        let mut fixer = StagedInstallFixer::new(installer, tmp.path()).without_privilege_check();
        assert!(matches!(fixer.prepare(), Err(FixError::MissingTool(_))));
    }

    #[test]
    fn test_same_artifact_staged_once() {
        let tmp = tempfile::tempdir().unwrap();
        let installer = script(tmp.path(), "exit 0");
        let mut fixer =
            StagedInstallFixer::new(installer, &tmp.path().join("work")).without_privilege_check();
        fixer.prepare().unwrap();
        stage(&mut fixer, "libfoo");
        stage(&mut fixer, "libfoo");
        assert_eq!(fixer.queue().len(), 1);
    }
}
