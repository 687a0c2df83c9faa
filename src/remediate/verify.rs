//! Signature gate between fetch and apply.
//!
//! Every downloaded artifact must carry exactly one backend-issued Ed25519
//! signature over `base64(SHA-512(bytes))`. Anything short of that fails
//! the whole run.

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha512};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::backend::{BackendError, SignatureBackend};
use crate::model::{ArtifactIdentifier, FetchedArtifact, SignatureRecord};

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("No signature record for artifact {file}")]
    MissingSignature { file: String },

    #[error("Signature record for {file} has library version id {found}, expected {expected}")]
    IdMismatch {
        file: String,
        expected: String,
        found: String,
    },

    #[error("Signature record for {file} has architecture {found:?}, expected {expected}")]
    ArchMismatch {
        file: String,
        expected: String,
        found: Option<String>,
    },

    #[error("{count} signature records match artifact {file}")]
    AmbiguousSignature { file: String, count: usize },

    #[error("Unsupported architecture: {0}")]
    UnsupportedArch(String),

    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    #[error("Invalid signature for artifact {file}: {reason}")]
    InvalidSignature { file: String, reason: String },

    #[error("Signature lookup failed: {0}")]
    Backend(#[from] BackendError),
}

/// Maps a platform architecture name to the one the backend signs under.
pub fn map_arch(raw: &str) -> Option<&'static str> {
    match raw {
        "amd64" | "x86_64" => Some("x86_64"),
        "arm64" | "armhf" | "aarch64" => Some("arm64"),
        "arm" => Some("arm"),
        "noarch" => Some("any"),
        _ => None,
    }
}

pub struct SignatureVerifier {
    host_arch: String,
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureVerifier {
    pub fn new() -> Self {
        Self::with_host_arch(std::env::consts::ARCH)
    }

    pub fn with_host_arch(arch: impl Into<String>) -> Self {
        Self {
            host_arch: arch.into(),
        }
    }

    /// Identifier the backend knows `fetched` by.
    pub fn identifier(&self, fetched: &FetchedArtifact) -> Result<ArtifactIdentifier, VerifyError> {
        let descriptor = &fetched.descriptor;
        let arch = if descriptor.manager().tracks_architecture() {
            let raw = descriptor.arch().unwrap_or(self.host_arch.as_str());
            let mapped = map_arch(raw).ok_or_else(|| VerifyError::UnsupportedArch(raw.to_string()))?;
            Some(mapped.to_string())
        } else {
            None
        };
        Ok(ArtifactIdentifier {
            file_name: fetched.artifact.file_name.clone(),
            library_version_id: descriptor.available_fix.version_id.clone(),
            arch,
        })
    }

    /// Unique identifiers for one batch lookup, sorted by file name.
    pub fn identifiers(
        &self,
        fetched: &[FetchedArtifact],
    ) -> Result<Vec<ArtifactIdentifier>, VerifyError> {
        let unique: BTreeSet<ArtifactIdentifier> = fetched
            .iter()
            .map(|f| self.identifier(f))
            .collect::<Result<_, _>>()?;
        Ok(unique.into_iter().collect())
    }

    /// Looks up signatures in one batch call and checks every artifact.
    #[instrument(skip_all, fields(artifacts = fetched.len()))]
    pub async fn verify(
        &self,
        backend: &dyn SignatureBackend,
        public_key: &str,
        fetched: &[FetchedArtifact],
    ) -> Result<usize, VerifyError> {
        if fetched.is_empty() {
            return Ok(0);
        }
        let key = parse_public_key(public_key)?;
        let identifiers = self.identifiers(fetched)?;
        let records = backend.lookup_signatures(&identifiers).await?;
        debug!(requested = identifiers.len(), returned = records.len(), "Signature records received");

        for item in fetched {
            self.check(&key, item, &records)?;
        }
        info!(verified = fetched.len(), "All artifacts verified");
        Ok(fetched.len())
    }

    fn check(
        &self,
        key: &VerifyingKey,
        fetched: &FetchedArtifact,
        records: &[SignatureRecord],
    ) -> Result<(), VerifyError> {
        let id = self.identifier(fetched)?;
        let file = id.file_name.clone();

        let by_name: Vec<&SignatureRecord> =
            records.iter().filter(|r| r.file_name == id.file_name).collect();
        let first = by_name
            .first()
            .ok_or_else(|| VerifyError::MissingSignature { file: file.clone() })?;

        let by_id: Vec<&SignatureRecord> = by_name
            .iter()
            .copied()
            .filter(|r| r.library_version_id == id.library_version_id)
            .collect();
        if by_id.is_empty() {
            return Err(VerifyError::IdMismatch {
                file,
                expected: id.library_version_id,
                found: first.library_version_id.clone(),
            });
        }

        let matching: Vec<&SignatureRecord> = match &id.arch {
            Some(arch) => by_id
                .iter()
                .copied()
                .filter(|r| r.arch.as_deref() == Some(arch.as_str()))
                .collect(),
            None => by_id.clone(),
        };
        let record = match matching.as_slice() {
            [record] => *record,
            [] => {
                return Err(VerifyError::ArchMismatch {
                    file,
                    expected: id.arch.unwrap_or_default(),
                    found: by_id[0].arch.clone(),
                })
            }
            many => {
                return Err(VerifyError::AmbiguousSignature {
                    file,
                    count: many.len(),
                })
            }
        };

        let signature = parse_signature(&record.signature).map_err(|reason| {
            VerifyError::InvalidSignature {
                file: file.clone(),
                reason,
            }
        })?;
        let digest = artifact_digest(&fetched.artifact.bytes);
        key.verify(digest.as_bytes(), &signature)
            .map_err(|e| VerifyError::InvalidSignature {
                file,
                reason: e.to_string(),
            })
    }
}

/// The message the backend signs: `base64(SHA-512(bytes))`.
pub fn artifact_digest(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(Sha512::digest(bytes))
}

fn parse_public_key(raw: &str) -> Result<VerifyingKey, VerifyError> {
    let bytes = decode_hex_or_base64(raw).map_err(VerifyError::InvalidKey)?;
    let key_bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| VerifyError::InvalidKey("Ed25519 public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&key_bytes).map_err(|e| VerifyError::InvalidKey(e.to_string()))
}

fn parse_signature(raw: &str) -> Result<Signature, String> {
    let bytes = decode_hex_or_base64(raw)?;
    let signature_bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| "Ed25519 signature must be 64 bytes".to_string())?;
    Ok(Signature::from_bytes(&signature_bytes))
}

fn decode_hex_or_base64(raw: &str) -> Result<Vec<u8>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("value is empty".to_string());
    }
    if trimmed.len() % 2 == 0 && trimmed.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return hex::decode(trimmed).map_err(|e| e.to_string());
    }
    general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(trimmed))
        .or_else(|_| general_purpose::URL_SAFE.decode(trimmed))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|_| "value must be base64 or hex encoded".to_string())
}
