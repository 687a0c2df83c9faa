//! Fixer contract shared by every remediation strategy.
//!
//! A [`Fixer`] is created fresh for each run and owns everything it mutates
//! (backup map, staging queue) until the run ends. The orchestrator drives it
//! through a fixed lifecycle:
//!
//! 1. [`Fixer::prepare`] once, before any download
//! 2. [`Fixer::fix`] once per (verified artifact, disk instance) pair
//! 3. [`Fixer::commit`] once, after every `fix` succeeded
//! 4. exactly one of [`Fixer::rollback`] (on failure) or [`Fixer::cleanup`]

use std::path::PathBuf;
use thiserror::Error;

use crate::model::{Artifact, DependencyDescriptor, DependencyInstance};

// ============================================================================
// Fixer Trait
// ============================================================================

/// Per-ecosystem apply/rollback strategy.
///
/// Implementations are only ever called from the coordinator, one call at a
/// time, so they keep their state in plain fields.
pub trait Fixer: Send {
    /// Returns the strategy name used in logs.
    fn strategy(&self) -> &'static str;

    /// Checks that the run can proceed at all (privileges, tools).
    ///
    /// # Errors
    ///
    /// Returns [`FixError::Privilege`] when the strategy needs root and the
    /// process is not privileged.
    fn prepare(&mut self) -> Result<(), FixError>;

    /// Applies `artifact` to one disk instance of the descriptor's package.
    ///
    /// # Errors
    ///
    /// Any error leaves the instance recorded in the backup map as far as it
    /// was modified, so a later [`Fixer::rollback`] can restore it.
    fn fix(
        &mut self,
        descriptor: &DependencyDescriptor,
        instance: &DependencyInstance,
        artifact: &Artifact,
    ) -> Result<FixOutcome, FixError>;

    /// Finishes work deferred by `fix`. Defaults to nothing.
    fn commit(&mut self) -> Result<(), FixError> {
        Ok(())
    }

    /// Restores every instance modified during this run.
    ///
    /// Attempts every restoration even after one fails, and returns `false`
    /// if any of them failed.
    fn rollback(&mut self) -> bool;

    /// Discards the scratch tree after a successful run.
    fn cleanup(&mut self) -> bool;
}

/// Result of one [`Fixer::fix`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixOutcome {
    /// Whether anything was applied (staging counts as applied).
    pub applied: bool,

    /// Location of the instance after the fix; package metadata directories
    /// are versioned, so this can differ from the original disk path.
    pub new_disk_path: PathBuf,
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by fixers.
#[derive(Error, Debug)]
pub enum FixError {
    /// Strategy needs elevated privileges
    #[error("Elevated privileges required: {0}")]
    Privilege(String),

    /// Native package-manager binary is not available
    #[error("Package manager binary not found: {0}")]
    MissingTool(String),

    /// The installed package's file manifest is missing or unreadable
    #[error("Invalid package manifest at {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    /// The replacement artifact is corrupted or in an unsupported format
    #[error("Invalid artifact {file}: {reason}")]
    Artifact { file: String, reason: String },

    /// An entry would escape its install root (path traversal)
    #[error("Path traversal attempt rejected: '{attempted}'")]
    PathTraversal { attempted: String },

    /// The native transaction exited unsuccessfully
    #[error("Installer '{command}' failed with {status}: {stderr}")]
    Installer {
        command: String,
        status: String,
        stderr: String,
    },

    /// Generic I/O error
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FixError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> FixError {
        let path = path.into();
        move |source| FixError::Io { path, source }
    }
}
