use crate::backend::{BackendClient, BackendError};
use crate::model::{Artifact, DependencyDescriptor, DependencyInstance, FixMap, ManagerKind};
use crate::remediate::Fixer;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Failed to parse package database: {0}")]
    InvalidContent(String),
    #[error("Download failed: {0}")]
    Download(#[from] BackendError),
    #[error("Unsupported operation for {kind}: {reason}")]
    Unsupported { kind: ManagerKind, reason: String },
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Capabilities one ecosystem offers to the remediation engine.
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Returns the ecosystem this manager handles.
    fn kind(&self) -> ManagerKind;

    /// Lists every installed package instance visible to this manager.
    async fn list_dependencies(&self) -> Result<Vec<DependencyInstance>, ManagerError>;

    /// Downloads the sealed artifact for the descriptor's fix version.
    async fn download_package(
        &self,
        server: &BackendClient,
        descriptor: &DependencyDescriptor,
    ) -> Result<Artifact, ManagerError>;

    /// Creates a fresh fixer owning `workdir` for the duration of one run.
    fn fixer(&self, workdir: &Path) -> Result<Box<dyn Fixer>, ManagerError>;

    /// Rewrites project manifests to reflect applied fixes. Best-effort.
    async fn handle_fixes(&self, fixes: &FixMap) -> Result<(), ManagerError>;
}
