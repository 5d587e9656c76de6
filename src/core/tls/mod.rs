//! Runtime TLS domain bindings.
//!
//! Certificate material (PKCS#12 or PEM) is validated outside any lock and
//! only then swapped into the concurrent binding map, so readers performing
//! SNI selection never wait on administrative writes.
pub mod certificate;
mod pkcs12;
pub mod runtime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use certificate::{CertificateMaterial, RotateRequest};
pub use runtime::{DomainTlsRuntime, RotationOutcome};

/// Metadata describing one hostname's certificate. Never carries key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainBinding {
    pub host: String,
    pub subject: String,
    pub issuer: String,
    pub thumbprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub has_private_key: bool,
    pub hostname_matches: bool,
    pub subject_alternative_names: Vec<String>,
    pub chain_provided: bool,
    pub chain_validated: bool,
    pub chain_count: usize,
    pub bound_at: DateTime<Utc>,
}

/// Validation failures for bind and rotate operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsError {
    #[error("host must not be empty")]
    EmptyHost,

    #[error("certificate bundle is not valid base64")]
    InvalidBase64,

    #[error("malformed PKCS#12 bundle: {0}")]
    MalformedPfx(String),

    #[error("PKCS#12 password is incorrect")]
    InvalidPfxPassword,

    #[error("malformed PEM input: {0}")]
    MalformedPem(String),

    #[error("no certificate found in the supplied material")]
    NoCertificate,

    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),

    #[error("certificate material does not include a private key")]
    MissingPrivateKey,

    #[error("private key is not usable: {0}")]
    InvalidPrivateKey(String),

    #[error("private key does not match the certificate: {0}")]
    KeyMismatch(String),

    #[error("certificate is not valid before {0}")]
    NotYetValid(DateTime<Utc>),

    #[error("certificate expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("rotation requires either a PFX bundle or a PEM certificate and key")]
    MissingRotateInput,
}

/// Normalize a hostname for map keys and comparisons: trimmed, without a
/// trailing dot, lowercase. Returns `None` for blank input.
pub fn normalize_host(host: &str) -> Option<String> {
    let host = host.trim().trim_end_matches('.');
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// Wildcard-aware hostname comparison.
///
/// `*.example.com` matches a host with exactly one more label than
/// `example.com`; deeper subdomains and the bare suffix do not match.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let (Some(pattern), Some(host)) = (normalize_host(pattern), normalize_host(host)) else {
        return false;
    };
    match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .strip_suffix(suffix)
            .and_then(|head| head.strip_suffix('.'))
            .is_some_and(|label| !label.is_empty() && !label.contains('.')),
        None => pattern == host,
    }
}
