//! Parsing and validation of certificate material.
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    sign::CertifiedKey,
};
use serde::Deserialize;
use sha1::{Digest, Sha1};
use x509_parser::{
    certificate::X509Certificate, extensions::GeneralName, parse_x509_certificate,
};

use crate::core::tls::{DomainBinding, TlsError, host_matches, pkcs12};

/// Certificate input accepted by bind and rotate.
#[derive(Clone)]
pub enum CertificateMaterial {
    /// Base64-encoded PKCS#12 bundle.
    Pfx {
        data_base64: String,
        password: Option<String>,
    },
    /// PEM leaf (optionally followed by intermediates), key and extra chain.
    Pem {
        cert_pem: String,
        key_pem: String,
        chain_pem: Option<String>,
    },
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertificateMaterial::Pfx { .. } => f.write_str("CertificateMaterial::Pfx(..)"),
            CertificateMaterial::Pem { .. } => f.write_str("CertificateMaterial::Pem(..)"),
        }
    }
}

/// Body of a rotate request. A PFX bundle takes precedence over PEM input.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateRequest {
    #[serde(default)]
    pub pfx_base64: Option<String>,
    #[serde(default)]
    pub pfx_password: Option<String>,
    #[serde(default)]
    pub cert_pem: Option<String>,
    #[serde(default)]
    pub key_pem: Option<String>,
    #[serde(default)]
    pub chain_pem: Option<String>,
}

impl RotateRequest {
    pub fn into_material(self) -> Result<CertificateMaterial, TlsError> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());

        if present(&self.pfx_base64) {
            return Ok(CertificateMaterial::Pfx {
                data_base64: self.pfx_base64.unwrap_or_default(),
                password: self.pfx_password,
            });
        }
        if present(&self.cert_pem) && present(&self.key_pem) {
            return Ok(CertificateMaterial::Pem {
                cert_pem: self.cert_pem.unwrap_or_default(),
                key_pem: self.key_pem.unwrap_or_default(),
                chain_pem: self.chain_pem.filter(|c| !c.trim().is_empty()),
            });
        }
        Err(TlsError::MissingRotateInput)
    }
}

/// A binding that passed validation, ready to be installed.
pub(crate) struct ValidatedCertificate {
    pub binding: DomainBinding,
    pub certified_key: Arc<CertifiedKey>,
}

struct DecodedMaterial {
    leaf: CertificateDer<'static>,
    chain: Vec<CertificateDer<'static>>,
    key: Option<PrivateKeyDer<'static>>,
}

/// Validate `material` for `host` as of `now`.
///
/// Hard failures: unreadable input, missing or mismatched key, and a leaf
/// outside its validity window. A hostname mismatch or an unverifiable chain
/// is only recorded on the binding.
pub(crate) fn validate(
    host: &str,
    material: &CertificateMaterial,
    now: DateTime<Utc>,
) -> Result<ValidatedCertificate, TlsError> {
    let decoded = match material {
        CertificateMaterial::Pfx {
            data_base64,
            password,
        } => decode_pfx(data_base64, password.as_deref().unwrap_or_default())?,
        CertificateMaterial::Pem {
            cert_pem,
            key_pem,
            chain_pem,
        } => decode_pem(cert_pem, key_pem, chain_pem.as_deref())?,
    };
    let key = decoded.key.ok_or(TlsError::MissingPrivateKey)?;

    let (_, leaf) = parse_x509_certificate(decoded.leaf.as_ref())
        .map_err(|e| TlsError::MalformedCertificate(e.to_string()))?;
    let not_before = to_utc(leaf.validity().not_before.timestamp())?;
    let not_after = to_utc(leaf.validity().not_after.timestamp())?;
    if now < not_before {
        return Err(TlsError::NotYetValid(not_before));
    }
    if now > not_after {
        return Err(TlsError::Expired(not_after));
    }

    let names = san_dns_names(&leaf);
    let hostname_matches = names.iter().any(|name| host_matches(name, host))
        || common_names(&leaf).any(|cn| host_matches(&cn, host));
    let chain_provided = !decoded.chain.is_empty();
    let chain_validated = chain_provided && chain_validates(&leaf, &decoded.chain, now);
    let subject = leaf.subject().to_string();
    let issuer = leaf.issuer().to_string();

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| TlsError::InvalidPrivateKey(e.to_string()))?;
    let thumbprint = thumbprint(decoded.leaf.as_ref());
    let chain_count = decoded.chain.len();
    let mut presented = Vec::with_capacity(chain_count + 1);
    presented.push(decoded.leaf.clone());
    presented.extend(decoded.chain.iter().cloned());
    let certified_key = CertifiedKey::new(presented, signing_key);
    match certified_key.keys_match() {
        // The key type cannot report its public half; nothing to compare.
        Ok(()) | Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => {}
        Err(e) => return Err(TlsError::KeyMismatch(e.to_string())),
    }

    Ok(ValidatedCertificate {
        binding: DomainBinding {
            host: host.to_string(),
            subject,
            issuer,
            thumbprint,
            not_before,
            not_after,
            has_private_key: true,
            hostname_matches,
            subject_alternative_names: names,
            chain_provided,
            chain_validated,
            chain_count,
            bound_at: now,
        },
        certified_key: Arc::new(certified_key),
    })
}

fn decode_pfx(data_base64: &str, password: &str) -> Result<DecodedMaterial, TlsError> {
    let compact: String = data_base64.split_whitespace().collect();
    let der = STANDARD
        .decode(compact.as_bytes())
        .map_err(|_| TlsError::InvalidBase64)?;
    let contents = pkcs12::open(&der, password)?;

    // The leaf carries the key's localKeyId; without one, the first non-CA
    // certificate wins. Everything else is chain.
    let key_id = contents
        .private_keys
        .first()
        .and_then(|key| key.local_key_id.as_deref());
    let leaf_index = key_id
        .and_then(|id| {
            contents
                .certificates
                .iter()
                .position(|cert| cert.local_key_id.as_deref() == Some(id))
        })
        .or_else(|| {
            contents.certificates.iter().position(|cert| {
                parse_x509_certificate(&cert.der).is_ok_and(|(_, parsed)| !parsed.is_ca())
            })
        })
        .unwrap_or(0);
    let key = contents
        .private_keys
        .into_iter()
        .next()
        .map(|key| PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.der)));

    let mut certs: Vec<CertificateDer<'static>> = contents
        .certificates
        .into_iter()
        .map(|cert| CertificateDer::from(cert.der))
        .collect();
    if certs.is_empty() {
        return Err(TlsError::NoCertificate);
    }
    let leaf = certs.remove(leaf_index);
    Ok(DecodedMaterial {
        leaf,
        chain: certs,
        key,
    })
}

fn decode_pem(
    cert_pem: &str,
    key_pem: &str,
    chain_pem: Option<&str>,
) -> Result<DecodedMaterial, TlsError> {
    let mut certs = read_pem_certs(cert_pem)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate);
    }
    let leaf = certs.remove(0);
    if let Some(chain_pem) = chain_pem {
        certs.extend(read_pem_certs(chain_pem)?);
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| TlsError::MalformedPem(e.to_string()))?;
    Ok(DecodedMaterial {
        leaf,
        chain: certs,
        key,
    })
}

fn read_pem_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::MalformedPem(e.to_string()))
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>, TlsError> {
    DateTime::from_timestamp(timestamp, 0).ok_or_else(|| {
        TlsError::MalformedCertificate(format!("validity timestamp {timestamp} out of range"))
    })
}

/// DNS subject alternative names, lowercased.
fn san_dns_names(cert: &X509Certificate<'_>) -> Vec<String> {
    cert.subject_alternative_name()
        .ok()
        .flatten()
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn common_names(cert: &X509Certificate<'_>) -> impl Iterator<Item = String> {
    cert.subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .map(str::to_ascii_lowercase)
}

/// Walk issuers from the leaf through the supplied chain to a self-signed root.
fn chain_validates(
    leaf: &X509Certificate<'_>,
    chain: &[CertificateDer<'static>],
    now: DateTime<Utc>,
) -> bool {
    let pool: Vec<X509Certificate<'_>> = chain
        .iter()
        .filter_map(|der| parse_x509_certificate(der.as_ref()).ok().map(|(_, c)| c))
        .collect();
    let within_validity = |cert: &X509Certificate<'_>| {
        let validity = cert.validity();
        let now = now.timestamp();
        validity.not_before.timestamp() <= now && now <= validity.not_after.timestamp()
    };

    let mut current = leaf;
    for _ in 0..=pool.len() {
        if current.subject().as_raw() == current.issuer().as_raw()
            && current.verify_signature(None).is_ok()
        {
            return true;
        }
        let issuer = pool.iter().find(|candidate| {
            candidate.subject().as_raw() == current.issuer().as_raw()
                && within_validity(candidate)
                && current
                    .verify_signature(Some(candidate.public_key()))
                    .is_ok()
        });
        match issuer {
            Some(issuer) => current = issuer,
            None => return false,
        }
    }
    false
}

/// Upper-case hex SHA-1 of the DER certificate.
pub fn thumbprint(der: &[u8]) -> String {
    Sha1::digest(der)
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect()
}
