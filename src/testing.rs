//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signer, SigningKey};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{BackendClient, BackendError, SignatureBackend};
use crate::config::RemediationConfig;
use crate::model::{
    Artifact, ArtifactIdentifier, DependencyDescriptor, DependencyInstance, FixMap, ManagerKind,
    SignatureRecord,
};
use crate::remediate::verify::artifact_digest;
use crate::remediate::{FixError, FixOutcome, Fixer};
use crate::traits::{ManagerError, PackageManager};

pub fn test_server() -> Arc<BackendClient> {
    Arc::new(BackendClient::new(&RemediationConfig::default()).unwrap())
}

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

pub fn public_key() -> String {
    general_purpose::STANDARD.encode(signing_key().verifying_key().as_bytes())
}

pub fn sign(bytes: &[u8]) -> String {
    let signature = signing_key().sign(artifact_digest(bytes).as_bytes());
    general_purpose::STANDARD.encode(signature.to_bytes())
}

/// The artifact [`MockManager`] serves for `descriptor`.
pub fn mock_artifact(descriptor: &DependencyDescriptor) -> Artifact {
    let fix = &descriptor.available_fix;
    Artifact {
        file_name: format!("{}-{}.whl", fix.name, fix.version),
        bytes: format!("sealed {} {}", fix.name, fix.version).into_bytes(),
    }
}

/// Everything the mocks observed, in call order.
#[derive(Debug, Default)]
pub struct CallLog {
    pub downloads: Vec<String>,
    pub prepares: usize,
    pub fixes: Vec<PathBuf>,
    pub commits: usize,
    pub rollbacks: usize,
    pub cleanups: usize,
    pub hooks: Vec<FixMap>,
}

#[derive(Default)]
pub struct MockManager {
    failing: HashSet<String>,
    panicking: HashSet<String>,
    fail_fix_at: Option<PathBuf>,
    fail_prepare: bool,
    fail_commit: bool,
    fail_hook: bool,
    incomplete_rollback: bool,
    log: Arc<Mutex<CallLog>>,
}

impl MockManager {
    /// Downloads of `name` answer with a server error.
    pub fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    /// Downloads of `name` panic.
    pub fn panicking(mut self, name: &str) -> Self {
        self.panicking.insert(name.to_string());
        self
    }

    pub fn failing_fix_at(mut self, path: &str) -> Self {
        self.fail_fix_at = Some(PathBuf::from(path));
        self
    }

    pub fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn failing_hook(mut self) -> Self {
        self.fail_hook = true;
        self
    }

    pub fn incomplete_rollback(mut self) -> Self {
        self.incomplete_rollback = true;
        self
    }

    pub fn log(&self) -> MutexGuard<'_, CallLog> {
        self.log.lock().unwrap()
    }
}

#[async_trait]
impl PackageManager for MockManager {
    fn kind(&self) -> ManagerKind {
        ManagerKind::Pip
    }

    async fn list_dependencies(&self) -> Result<Vec<DependencyInstance>, ManagerError> {
        Ok(Vec::new())
    }

    async fn download_package(
        &self,
        _server: &BackendClient,
        descriptor: &DependencyDescriptor,
    ) -> Result<Artifact, ManagerError> {
        let name = descriptor.vulnerable.name.clone();
        self.log().downloads.push(name.clone());
        if self.panicking.contains(&name) {
            panic!("boom while downloading {name}");
        }
        if self.failing.contains(&name) {
            return Err(ManagerError::Download(BackendError::Status {
                url: format!("http://backend.test/pypi/{name}"),
                status: 503,
            }));
        }
        Ok(mock_artifact(descriptor))
    }

    fn fixer(&self, _workdir: &Path) -> Result<Box<dyn Fixer>, ManagerError> {
        Ok(Box::new(RecordingFixer {
            fail_prepare: self.fail_prepare,
            fail_fix_at: self.fail_fix_at.clone(),
            fail_commit: self.fail_commit,
            incomplete_rollback: self.incomplete_rollback,
            log: Arc::clone(&self.log),
        }))
    }

    async fn handle_fixes(&self, fixes: &FixMap) -> Result<(), ManagerError> {
        self.log().hooks.push(fixes.clone());
        if self.fail_hook {
            return Err(ManagerError::Unknown("requirements.txt is read-only".to_string()));
        }
        Ok(())
    }
}

/// Fixer that only records the calls made to it.
pub struct RecordingFixer {
    fail_prepare: bool,
    fail_fix_at: Option<PathBuf>,
    fail_commit: bool,
    incomplete_rollback: bool,
    log: Arc<Mutex<CallLog>>,
}

impl RecordingFixer {
    fn log(&self) -> MutexGuard<'_, CallLog> {
        self.log.lock().unwrap()
    }
}

impl Fixer for RecordingFixer {
    fn strategy(&self) -> &'static str {
        "recording"
    }

    fn prepare(&mut self) -> Result<(), FixError> {
        self.log().prepares += 1;
        if self.fail_prepare {
            return Err(FixError::Privilege("tests run unprivileged".to_string()));
        }
        Ok(())
    }

    fn fix(
        &mut self,
        _descriptor: &DependencyDescriptor,
        instance: &DependencyInstance,
        _artifact: &Artifact,
    ) -> Result<FixOutcome, FixError> {
        if self.fail_fix_at.as_ref() == Some(&instance.disk_path) {
            return Err(FixError::Io {
                path: instance.disk_path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        self.log().fixes.push(instance.disk_path.clone());
        Ok(FixOutcome {
            applied: true,
            new_disk_path: instance.disk_path.clone(),
        })
    }

    fn commit(&mut self) -> Result<(), FixError> {
        self.log().commits += 1;
        if self.fail_commit {
            return Err(FixError::Installer {
                command: "dpkg".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "dependency problems".to_string(),
            });
        }
        Ok(())
    }

    fn rollback(&mut self) -> bool {
        self.log().rollbacks += 1;
        !self.incomplete_rollback
    }

    fn cleanup(&mut self) -> bool {
        self.log().cleanups += 1;
        true
    }
}

/// In-memory signature backend.
pub struct MockSignatures {
    public_key: String,
    records: Vec<SignatureRecord>,
    lookups: AtomicUsize,
}

impl MockSignatures {
    pub fn new(public_key: &str, records: Vec<SignatureRecord>) -> Self {
        Self {
            public_key: public_key.to_string(),
            records,
            lookups: AtomicUsize::new(0),
        }
    }

    /// Validly signs what [`MockManager`] serves for each descriptor.
    pub fn signing(descriptors: &[DependencyDescriptor]) -> Self {
        let records = descriptors
            .iter()
            .map(|d| {
                let artifact = mock_artifact(d);
                SignatureRecord {
                    file_name: artifact.file_name,
                    library_version_id: d.available_fix.version_id.clone(),
                    arch: None,
                    signature: sign(&artifact.bytes),
                }
            })
            .collect();
        Self::new(&public_key(), records)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignatureBackend for MockSignatures {
    async fn public_key(&self) -> Result<String, BackendError> {
        Ok(self.public_key.clone())
    }

    async fn lookup_signatures(
        &self,
        artifacts: &[ArtifactIdentifier],
    ) -> Result<Vec<SignatureRecord>, BackendError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .records
            .iter()
            .filter(|r| artifacts.iter().any(|a| a.file_name == r.file_name))
            .cloned()
            .collect())
    }
}
