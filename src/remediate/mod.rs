//! Remediation engine.
//!
//! This module turns a list of vulnerable packages into applied fixes:
//! - [`verify`]: signature gate between download and apply
//! - [`strategies`]: the three ways a fix reaches disk
//! - [`pipeline`]: the orchestrator tying fetch, verify and apply together

pub mod pipeline;
pub mod strategies;
pub mod traits;
pub mod verify;

pub use pipeline::{
    RemediationError, RemediationFailure, RemediationOutcome, RemediationState, RemediationStats,
    Remediator,
};
pub use traits::{FixError, FixOutcome, Fixer};
pub use verify::{SignatureVerifier, VerifyError};
