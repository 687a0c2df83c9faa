pub mod backend;
pub mod config;
pub mod ecosystems;
pub mod executor;
pub mod logging;
pub mod model;
pub mod registry;
pub mod remediate;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types for convenience
pub use backend::{BackendClient, BackendError, SignatureBackend};
pub use config::{ConfigError, RemediationConfig};
pub use executor::*;
pub use model::*;
pub use registry::ManagerRegistry;
pub use remediate::{
    RemediationError, RemediationFailure, RemediationOutcome, RemediationState, RemediationStats,
    Remediator,
};
pub use traits::*;
