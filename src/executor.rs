use crate::backend::BackendClient;
use crate::model::{DependencyDescriptor, DependencyInstance, FetchedArtifact, PackageVersion};
use crate::traits::{ManagerError, PackageManager};
use indexmap::IndexMap;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_WORKERS: usize = 10;

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("Download of {package} failed: {source}")]
    Download {
        package: String,
        #[source]
        source: ManagerError,
    },
    #[error("Download worker panicked while fetching {package}: {message}")]
    WorkerPanicked { package: String, message: String },
    #[error("Download worker aborted: {0}")]
    Aborted(String),
}

/// Pairs every fixable vulnerable package with the instances it was found at.
///
/// A package is fixable when it has at least one open vulnerability, an
/// available fix and at least one discovered instance. Everything else is
/// skipped silently. Packages sharing the same `vulnerable -> fix` pair are
/// merged, so each pair is downloaded once.
pub fn select_fixable(
    vulnerable: &[PackageVersion],
    instances: &[DependencyInstance],
) -> Vec<DependencyDescriptor> {
    let mut selected: IndexMap<String, DependencyDescriptor> = IndexMap::new();

    for package in vulnerable {
        if package.open_vulnerabilities().is_empty() {
            debug!(package = %package.signature(), "No open vulnerabilities, skipping");
            continue;
        }
        let Some(fix) = package.available_fix() else {
            debug!(package = %package.signature(), "No available fix, skipping");
            continue;
        };

        let mut descriptor = DependencyDescriptor::new(package.clone(), fix.clone());
        for instance in instances.iter().filter(|i| i.matches(package)) {
            descriptor
                .locations
                .entry(instance.disk_path.clone())
                .or_insert_with(|| instance.clone());
        }
        if descriptor.locations.is_empty() {
            debug!(package = %package.signature(), "Not installed, skipping");
            continue;
        }

        match selected.get_mut(&descriptor.fix_key()) {
            Some(existing) => {
                for (path, instance) in descriptor.locations {
                    existing.locations.entry(path).or_insert(instance);
                }
            }
            None => {
                selected.insert(descriptor.fix_key(), descriptor);
            }
        }
    }

    selected.into_values().collect()
}

/// Fixed-size pool downloading fix artifacts.
///
/// Jobs flow through a bounded queue to `workers` tasks. The first failing
/// job (a download error or a panic inside the download) cancels the pool:
/// no further job is started, in-flight downloads finish, and the error is
/// returned once every worker has exited.
pub struct ArtifactFetcher {
    workers: usize,
}

impl Default for ArtifactFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl ArtifactFetcher {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    #[instrument(skip_all, fields(jobs = descriptors.len(), workers = self.workers))]
    pub async fn fetch(
        &self,
        manager: Arc<dyn PackageManager>,
        server: Arc<BackendClient>,
        descriptors: Vec<DependencyDescriptor>,
    ) -> Result<Vec<FetchedArtifact>, FetchError> {
        let total = descriptors.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let (job_tx, job_rx) = mpsc::channel::<DependencyDescriptor>(self.workers);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::channel(total);

        let mut pool = JoinSet::new();
        for worker in 0..self.workers.min(total) {
            let jobs = Arc::clone(&job_rx);
            let results = result_tx.clone();
            let cancelled = Arc::clone(&cancelled);
            let manager = Arc::clone(&manager);
            let server = Arc::clone(&server);

            pool.spawn(async move {
                loop {
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    let Some(descriptor) = jobs.lock().await.recv().await else {
                        break;
                    };
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    debug!(worker, package = %descriptor.fix_key(), "Starting download");
                    let outcome =
                        download_one(Arc::clone(&manager), Arc::clone(&server), descriptor).await;
                    if outcome.is_err() {
                        cancelled.store(true, Ordering::SeqCst);
                    }
                    if results.send(outcome).await.is_err() {
                        break;
                    }
                }
            });
        }
        // Workers own the only remaining handles, so the channels close when
        // the pool drains.
        drop(job_rx);
        drop(result_tx);

        let producer = {
            let cancelled = Arc::clone(&cancelled);
            tokio::spawn(async move {
                for descriptor in descriptors {
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    if job_tx.send(descriptor).await.is_err() {
                        break;
                    }
                }
            })
        };

        let mut fetched = Vec::with_capacity(total);
        let mut first_error = None;
        while let Some(outcome) = result_rx.recv().await {
            match outcome {
                Ok(artifact) => {
                    info!(
                        package = %artifact.descriptor.fix_key(),
                        file = %artifact.artifact.file_name,
                        "Artifact fetched"
                    );
                    fetched.push(artifact);
                }
                Err(e) => {
                    warn!(error = %e, "Download failed, stopping worker pool");
                    cancelled.store(true, Ordering::SeqCst);
                    first_error.get_or_insert(e);
                }
            }
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                cancelled.store(true, Ordering::SeqCst);
                first_error.get_or_insert(FetchError::Aborted(e.to_string()));
            }
        }
        if let Err(e) = producer.await {
            first_error.get_or_insert(FetchError::Aborted(e.to_string()));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(fetched),
        }
    }
}

/// Runs one download on its own task so a panic surfaces as a `JoinError`
/// instead of taking the worker down.
async fn download_one(
    manager: Arc<dyn PackageManager>,
    server: Arc<BackendClient>,
    descriptor: DependencyDescriptor,
) -> Result<FetchedArtifact, FetchError> {
    let package = descriptor.fix_key();
    let job = tokio::spawn(async move {
        let result = manager.download_package(&server, &descriptor).await;
        (descriptor, result)
    });

    match job.await {
        Ok((descriptor, Ok(artifact))) => Ok(FetchedArtifact {
            descriptor,
            artifact,
        }),
        Ok((_, Err(source))) => Err(FetchError::Download { package, source }),
        Err(e) if e.is_panic() => Err(FetchError::WorkerPanicked {
            package,
            message: panic_message(e.into_panic()),
        }),
        Err(e) => Err(FetchError::Aborted(e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
