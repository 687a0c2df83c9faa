//! Fix orchestrator.
//!
//! [`Remediator`] drives one remediation run through
//! `Idle → Fetching → Verifying → Applying → {Committing | RollingBack} → Done`:
//! - downloads run on the [`ArtifactFetcher`] pool while the verification key
//!   is fetched
//! - every artifact passes the [`SignatureVerifier`] before any fix starts
//! - fixes run one at a time on a blocking task, in completion order across
//!   packages and discovery order across instances of the same package
//! - any failure up to the commit rolls back everything this run changed

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::backend::{BackendClient, BackendError, SignatureBackend};
use crate::config::RemediationConfig;
use crate::executor::{select_fixable, ArtifactFetcher, FetchError};
use crate::model::{DependencyInstance, FetchedArtifact, FixMap, PackageVersion};
use crate::remediate::traits::{FixError, Fixer};
use crate::remediate::verify::{SignatureVerifier, VerifyError};
use crate::traits::{ManagerError, PackageManager};

// ============================================================================
// Run Types
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemediationState {
    #[default]
    Idle,
    Fetching,
    Verifying,
    Applying,
    Committing,
    RollingBack,
    Done,
}

impl fmt::Display for RemediationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemediationState::Idle => "idle",
            RemediationState::Fetching => "fetching",
            RemediationState::Verifying => "verifying",
            RemediationState::Applying => "applying",
            RemediationState::Committing => "committing",
            RemediationState::RollingBack => "rolling back",
            RemediationState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Statistics about one remediation run.
#[derive(Debug, Default, Clone)]
pub struct RemediationStats {
    /// Total time spent on the run (milliseconds)
    pub total_duration_ms: u64,

    /// Time spent downloading artifacts (milliseconds)
    pub fetch_duration_ms: u64,

    /// Time spent on the signature lookup and checks (milliseconds)
    pub verify_duration_ms: u64,

    /// Time spent applying fixes, excluding the commit (milliseconds)
    pub apply_duration_ms: u64,

    /// Artifacts downloaded
    pub downloads: usize,

    /// Artifacts that passed signature verification
    pub verified: usize,

    /// Disk instances a fix was applied to
    pub applied: usize,

    /// State the run finished in
    pub state: RemediationState,

    /// State the run was in when it failed
    pub failed_in: Option<RemediationState>,

    /// Whether rollback restored everything; `None` if no rollback ran.
    pub rollback_complete: Option<bool>,
}

/// Result of a successful run.
#[derive(Debug)]
pub struct RemediationOutcome {
    /// Fixed disk paths, keyed by `vulnerable -> fix` signature
    pub summary: FixMap,

    pub stats: RemediationStats,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum RemediationError {
    /// Strategy needs elevated privileges; detected before any download
    #[error("Elevated privileges required: {0}")]
    Privilege(String),

    /// The ecosystem could not provide a fixer
    #[error("Fixer unavailable: {0}")]
    Setup(#[source] ManagerError),

    #[error(transparent)]
    Download(#[from] FetchError),

    #[error("Verification failed: {0}")]
    Verification(#[from] VerifyError),

    #[error("Apply failed: {0}")]
    Apply(#[source] FixError),

    /// Fixes stand; only the project manifest is stale
    #[error("Manifest update failed: {0}")]
    ManifestHook(#[source] ManagerError),

    #[error("Backend request failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Fixer task aborted: {0}")]
    Aborted(String),
}

impl From<FixError> for RemediationError {
    fn from(e: FixError) -> Self {
        match e {
            FixError::Privilege(reason) => RemediationError::Privilege(reason),
            other => RemediationError::Apply(other),
        }
    }
}

/// A failed run: the triggering error plus the stats gathered until then.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct RemediationFailure {
    pub error: RemediationError,
    pub stats: RemediationStats,
}

// ============================================================================
// Orchestrator
// ============================================================================

type SharedFixer = Arc<Mutex<Box<dyn Fixer>>>;

/// Runs `f` against the fixer on a blocking task.
///
/// A panic inside `f` poisons the mutex, but the fixer stays reachable
/// afterwards so it can still be rolled back.
async fn with_fixer<T, F>(fixer: &SharedFixer, f: F) -> Result<T, RemediationError>
where
    F: FnOnce(&mut dyn Fixer) -> T + Send + 'static,
    T: Send + 'static,
{
    let fixer = Arc::clone(fixer);
    tokio::task::spawn_blocking(move || {
        let mut guard = fixer.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut **guard)
    })
    .await
    .map_err(|e| RemediationError::Aborted(format!("Task join error: {}", e)))
}

/// Applies every artifact to every instance of its package.
fn apply_all(
    fixer: &mut dyn Fixer,
    fetched: &mut [FetchedArtifact],
    summary: &mut FixMap,
) -> Result<usize, FixError> {
    let mut applied = 0;
    for item in fetched.iter_mut() {
        let instances: Vec<DependencyInstance> = item.descriptor.locations.values().cloned().collect();
        for instance in &instances {
            if summary.claimed_elsewhere(&item.descriptor, &instance.disk_path) {
                warn!(
                    path = %instance.disk_path.display(),
                    "Path already fixed under another package in this run, skipping"
                );
                continue;
            }
            let outcome = fixer.fix(&item.descriptor, instance, &item.artifact)?;
            if !outcome.applied {
                continue;
            }
            item.descriptor.mark_fixed(&instance.disk_path);
            summary.record(&item.descriptor, instance.disk_path.clone());
            applied += 1;
            info!(
                package = %item.descriptor.fix_key(),
                path = %instance.disk_path.display(),
                new_path = %outcome.new_disk_path.display(),
                "Instance fixed"
            );
        }
    }
    Ok(applied)
}

/// Fetches, verifies and applies sealed replacements for one ecosystem.
///
/// A `Remediator` can run any number of times; each run gets a fresh fixer.
pub struct Remediator {
    manager: Arc<dyn PackageManager>,
    backend: Arc<BackendClient>,
    signatures: Arc<dyn SignatureBackend>,
    fetcher: ArtifactFetcher,
    verifier: SignatureVerifier,
    workdir: PathBuf,
}

/// Tracks state transitions and stats of one run.
struct Run {
    started: Instant,
    stats: RemediationStats,
}

impl Run {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            stats: RemediationStats::default(),
        }
    }

    fn enter(&mut self, next: RemediationState) {
        info!(from = %self.stats.state, to = %next, "Remediation state change");
        self.stats.state = next;
    }

    fn finish(&mut self) -> RemediationStats {
        self.enter(RemediationState::Done);
        self.stats.total_duration_ms = self.started.elapsed().as_millis() as u64;
        self.stats.clone()
    }

    /// Fails without rollback; used before anything could have changed.
    fn fail(mut self, error: RemediationError) -> RemediationFailure {
        error!(state = %self.stats.state, error = %error, "Remediation failed");
        self.stats.failed_in = Some(self.stats.state);
        RemediationFailure {
            error,
            stats: self.finish(),
        }
    }
}

impl Remediator {
    /// Creates a remediator using `backend` for downloads and signatures.
    pub fn new(
        manager: Arc<dyn PackageManager>,
        backend: Arc<BackendClient>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        let signatures: Arc<dyn SignatureBackend> = backend.clone();
        Self {
            manager,
            backend,
            signatures,
            fetcher: ArtifactFetcher::default(),
            verifier: SignatureVerifier::new(),
            workdir: workdir.into(),
        }
    }

    /// Builds the backend client, worker count and per-ecosystem scratch
    /// directory from `config`.
    pub fn from_config(
        manager: Arc<dyn PackageManager>,
        config: &RemediationConfig,
    ) -> Result<Self, BackendError> {
        let backend = Arc::new(BackendClient::new(config)?);
        let workdir = config.workdir.join(manager.kind().as_str());
        Ok(Self::new(manager, backend, workdir).with_workers(config.workers))
    }

    /// Sets the number of concurrent downloads.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.fetcher = ArtifactFetcher::new(workers);
        self
    }

    /// Uses `signatures` for the public key and signature lookups instead
    /// of the download backend.
    pub fn with_signature_backend(mut self, signatures: Arc<dyn SignatureBackend>) -> Self {
        self.signatures = signatures;
        self
    }

    pub fn with_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Remediates every fixable package in `vulnerable` that is installed
    /// at one of `instances`.
    ///
    /// # Errors
    ///
    /// Returns a [`RemediationFailure`] carrying the first error. Download,
    /// verification and apply failures roll back everything fixed so far;
    /// a failing manifest hook leaves the fixes in place.
    #[instrument(skip_all, fields(ecosystem = %self.manager.kind(), packages = vulnerable.len()))]
    pub async fn remediate(
        &self,
        vulnerable: &[PackageVersion],
        instances: &[DependencyInstance],
    ) -> Result<RemediationOutcome, RemediationFailure> {
        let mut run = Run::new();

        let fixer = match self.manager.fixer(&self.workdir) {
            Ok(fixer) => fixer,
            Err(e) => return Err(run.fail(RemediationError::Setup(e))),
        };
        info!(strategy = fixer.strategy(), workdir = %self.workdir.display(), "Fixer ready");
        let fixer: SharedFixer = Arc::new(Mutex::new(fixer));

        match with_fixer(&fixer, |f| f.prepare()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(run.fail(e.into())),
            Err(e) => return Err(run.fail(e)),
        }

        let descriptors = select_fixable(vulnerable, instances);
        if descriptors.is_empty() {
            info!("Nothing to remediate");
            self.cleanup(&fixer).await;
            return Ok(RemediationOutcome {
                summary: FixMap::new(),
                stats: run.finish(),
            });
        }

        // ====================================================================
        // Fetching
        // ====================================================================

        run.enter(RemediationState::Fetching);
        let fetch_start = Instant::now();
        let (fetched, public_key) = tokio::join!(
            self.fetcher.fetch(
                Arc::clone(&self.manager),
                Arc::clone(&self.backend),
                descriptors
            ),
            self.signatures.public_key()
        );
        run.stats.fetch_duration_ms = fetch_start.elapsed().as_millis() as u64;
        let mut fetched = match fetched {
            Ok(fetched) => fetched,
            Err(e) => return Err(self.abort(run, &fixer, e.into()).await),
        };
        run.stats.downloads = fetched.len();
        let public_key = match public_key {
            Ok(key) => key,
            Err(e) => return Err(self.abort(run, &fixer, e.into()).await),
        };

        // ====================================================================
        // Verifying
        // ====================================================================

        run.enter(RemediationState::Verifying);
        let verify_start = Instant::now();
        let verified = self
            .verifier
            .verify(self.signatures.as_ref(), &public_key, &fetched)
            .await;
        run.stats.verify_duration_ms = verify_start.elapsed().as_millis() as u64;
        match verified {
            Ok(count) => run.stats.verified = count,
            Err(e) => return Err(self.abort(run, &fixer, e.into()).await),
        }

        // ====================================================================
        // Applying
        // ====================================================================

        run.enter(RemediationState::Applying);
        let apply_start = Instant::now();
        let applied = with_fixer(&fixer, move |f| {
            let mut summary = FixMap::new();
            apply_all(f, &mut fetched, &mut summary).map(|count| (summary, count))
        })
        .await;
        let summary = match applied {
            Ok(Ok((summary, count))) => {
                run.stats.applied = count;
                summary
            }
            Ok(Err(e)) => return Err(self.abort(run, &fixer, e.into()).await),
            Err(e) => return Err(self.abort(run, &fixer, e).await),
        };

        run.stats.apply_duration_ms = apply_start.elapsed().as_millis() as u64;

        // ====================================================================
        // Committing
        // ====================================================================

        run.enter(RemediationState::Committing);
        match with_fixer(&fixer, |f| f.commit()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.abort(run, &fixer, e.into()).await),
            Err(e) => return Err(self.abort(run, &fixer, e).await),
        }

        let hook = if summary.is_empty() {
            Ok(())
        } else {
            self.manager.handle_fixes(&summary).await
        };
        self.cleanup(&fixer).await;

        if let Err(e) = hook {
            return Err(run.fail(RemediationError::ManifestHook(e)));
        }

        let stats = run.finish();
        info!(
            fixes = summary.len(),
            applied = stats.applied,
            duration_ms = stats.total_duration_ms,
            "Remediation completed"
        );
        Ok(RemediationOutcome { summary, stats })
    }

    /// Rolls back once and turns `error` into the run's failure.
    async fn abort(
        &self,
        mut run: Run,
        fixer: &SharedFixer,
        error: RemediationError,
    ) -> RemediationFailure {
        error!(state = %run.stats.state, error = %error, "Remediation step failed, rolling back");
        run.stats.failed_in = Some(run.stats.state);
        run.enter(RemediationState::RollingBack);

        let complete = match with_fixer(fixer, |f| f.rollback()).await {
            Ok(complete) => complete,
            Err(e) => {
                error!(error = %e, "Rollback task failed");
                false
            }
        };
        if !complete {
            error!(
                scratch = %self.workdir.display(),
                "Rollback incomplete, scratch tree kept for inspection"
            );
        }
        run.stats.rollback_complete = Some(complete);

        RemediationFailure {
            error,
            stats: run.finish(),
        }
    }

    async fn cleanup(&self, fixer: &SharedFixer) {
        match with_fixer(fixer, |f| f.cleanup()).await {
            Ok(true) => {}
            Ok(false) => warn!(scratch = %self.workdir.display(), "Scratch tree not fully removed"),
            Err(e) => warn!(error = %e, "Cleanup task failed"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
