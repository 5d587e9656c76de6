use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use scc::HashMap;
use serde::Serialize;

use crate::core::tls::{
    DomainBinding, TlsError,
    certificate::{self, CertificateMaterial, RotateRequest},
    normalize_host,
};

struct BoundCertificate {
    binding: DomainBinding,
    certified_key: Arc<CertifiedKey>,
}

/// Result of a rotation: the binding now in effect and the one it replaced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationOutcome {
    pub current: DomainBinding,
    pub previous: Option<DomainBinding>,
}

/// Host to certificate bindings, consulted during the TLS handshake.
#[derive(Default)]
pub struct DomainTlsRuntime {
    bindings: HashMap<String, Arc<BoundCertificate>>,
}

impl fmt::Debug for DomainTlsRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainTlsRuntime")
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

impl DomainTlsRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// All bindings, ordered by host.
    pub async fn list(&self) -> Vec<DomainBinding> {
        let mut out = Vec::with_capacity(self.bindings.len());
        self.bindings
            .retain_async(|_, bound| {
                out.push(bound.binding.clone());
                true
            })
            .await;
        out.sort_by(|a, b| a.host.cmp(&b.host));
        out
    }

    pub async fn get(&self, host: &str) -> Option<DomainBinding> {
        let host = normalize_host(host)?;
        self.bindings
            .read_async(&host, |_, bound| bound.binding.clone())
            .await
    }

    /// Bind a base64 PKCS#12 bundle to `host`, replacing any existing binding.
    pub async fn add_or_replace(
        &self,
        host: &str,
        pfx_base64: &str,
        password: Option<&str>,
    ) -> Result<DomainBinding, TlsError> {
        let material = CertificateMaterial::Pfx {
            data_base64: pfx_base64.to_string(),
            password: password.map(str::to_string),
        };
        self.bind(host, &material).await
    }

    /// Bind PEM certificate, key and optional chain to `host`.
    pub async fn add_or_replace_pem(
        &self,
        host: &str,
        cert_pem: &str,
        key_pem: &str,
        chain_pem: Option<&str>,
    ) -> Result<DomainBinding, TlsError> {
        let material = CertificateMaterial::Pem {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            chain_pem: chain_pem.map(str::to_string),
        };
        self.bind(host, &material).await
    }

    pub async fn bind(
        &self,
        host: &str,
        material: &CertificateMaterial,
    ) -> Result<DomainBinding, TlsError> {
        self.bind_at(host, material, Utc::now()).await
    }

    pub(crate) async fn bind_at(
        &self,
        host: &str,
        material: &CertificateMaterial,
        now: DateTime<Utc>,
    ) -> Result<DomainBinding, TlsError> {
        let host = normalize_host(host).ok_or(TlsError::EmptyHost)?;
        let validated = certificate::validate(&host, material, now)?;
        let binding = validated.binding.clone();
        self.install(&host, validated.binding, validated.certified_key).await;

        if !binding.hostname_matches {
            tracing::warn!(
                host = %host,
                subject = %binding.subject,
                "Bound certificate does not cover its host"
            );
        }
        if binding.chain_provided && !binding.chain_validated {
            tracing::warn!(host = %host, "Certificate chain could not be validated");
        }
        tracing::info!(
            host = %host,
            thumbprint = %binding.thumbprint,
            not_after = %binding.not_after,
            "Bound TLS certificate"
        );
        Ok(binding)
    }

    async fn install(&self, host: &str, binding: DomainBinding, certified_key: Arc<CertifiedKey>) {
        let bound = Arc::new(BoundCertificate {
            binding,
            certified_key,
        });
        self.bindings.upsert_async(host.to_string(), bound).await;
    }

    /// Replace the binding for `host` from either a PFX bundle or PEM input.
    pub async fn rotate(
        &self,
        host: &str,
        request: RotateRequest,
    ) -> Result<RotationOutcome, TlsError> {
        let normalized = normalize_host(host).ok_or(TlsError::EmptyHost)?;
        let material = request.into_material()?;
        let previous = self.get(&normalized).await;
        let current = self.bind(&normalized, &material).await?;
        if let Some(previous) = &previous {
            tracing::info!(
                host = %normalized,
                previous = %previous.thumbprint,
                current = %current.thumbprint,
                "Rotated TLS certificate"
            );
        }
        Ok(RotationOutcome { current, previous })
    }

    pub async fn remove(&self, host: &str) -> bool {
        let Some(host) = normalize_host(host) else {
            return false;
        };
        let removed = self.bindings.remove_async(&host).await.is_some();
        if removed {
            tracing::info!(host = %host, "Removed TLS certificate binding");
        }
        removed
    }

    /// Signing material for an SNI name: an exact binding, else `*.parent`.
    pub fn certified_key_for(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let host = normalize_host(server_name)?;
        let lookup = |key: &str| {
            self.bindings
                .read_sync(key, |_, bound| bound.certified_key.clone())
        };
        lookup(&host).or_else(|| {
            let (_, parent) = host.split_once('.')?;
            lookup(&format!("*.{parent}"))
        })
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl ResolvesServerCert for DomainTlsRuntime {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        let key = self.certified_key_for(name);
        if key.is_none() {
            tracing::debug!(server_name = name, "No TLS binding for server name");
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use chrono::{Duration, TimeZone};
    use p12::{CertBag, ContentInfo, PFX, SafeBag, SafeBagKind};
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
        date_time_ymd,
    };

    const OPENSSL3_CHAIN: &str = include_str!("testdata/openssl3_chain.p12.b64");

    struct Generated {
        cert_pem: String,
        key_pem: String,
        cert_der: Vec<u8>,
        key_der: Vec<u8>,
    }

    fn generated(cert: &rcgen::Certificate, key: &KeyPair) -> Generated {
        Generated {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert_der: cert.der().to_vec(),
            key_der: key.serialize_der(),
        }
    }

    fn pfx_base64(generated: &Generated, ca_der: Option<&[u8]>, password: &str) -> String {
        let pfx = PFX::new(
            &generated.cert_der,
            &generated.key_der,
            ca_der,
            password,
            "gateway",
        )
        .unwrap();
        STANDARD.encode(pfx.to_der())
    }

    /// Bundle holding a single certificate bag and no key or MAC.
    fn certificate_only_pfx(cert_der: &[u8]) -> String {
        let bag = SafeBag {
            bag: SafeBagKind::CertBag(CertBag::X509(cert_der.to_vec())),
            attributes: vec![],
        };
        let safe_contents = yasna::construct_der(|w| w.write_sequence_of(|w| bag.write(w.next())));
        let auth_safe = yasna::construct_der(|w| {
            w.write_sequence_of(|w| ContentInfo::Data(safe_contents.clone()).write(w.next()))
        });
        let pfx = PFX {
            version: 3,
            auth_safe: ContentInfo::Data(auth_safe),
            mac_data: None,
        };
        STANDARD.encode(pfx.to_der())
    }

    fn leaf(names: &[&str], valid_from: (i32, u8, u8), valid_to: (i32, u8, u8)) -> Generated {
        let mut params =
            CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        params.not_before = date_time_ymd(valid_from.0, valid_from.1, valid_from.2);
        params.not_after = date_time_ymd(valid_to.0, valid_to.1, valid_to.2);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        generated(&cert, &key)
    }

    fn current(names: &[&str]) -> Generated {
        leaf(names, (2020, 1, 1), (2099, 1, 1))
    }

    fn ca(name: &str) -> (CertificateParams, KeyPair, String, Vec<u8>) {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.not_before = date_time_ymd(2020, 1, 1);
        params.not_after = date_time_ymd(2099, 1, 1);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        let (pem, der) = (cert.pem(), cert.der().to_vec());
        (params, key, pem, der)
    }

    fn signed_leaf(host: &str, issuer: &Issuer<'_, KeyPair>) -> Generated {
        let mut params = CertificateParams::new(vec![host.to_string()]).unwrap();
        params.not_before = date_time_ymd(2020, 1, 1);
        params.not_after = date_time_ymd(2099, 1, 1);
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, issuer).unwrap();
        generated(&cert, &key)
    }

    #[tokio::test]
    async fn test_bind_pem_records_metadata() {
        let runtime = DomainTlsRuntime::new();
        let generated = current(&["api.example.com"]);
        let binding = runtime
            .add_or_replace_pem("API.example.com.", &generated.cert_pem, &generated.key_pem, None)
            .await
            .unwrap();

        assert_eq!(binding.host, "api.example.com");
        assert!(binding.has_private_key);
        assert!(binding.hostname_matches);
        assert!(!binding.chain_provided);
        assert!(!binding.chain_validated);
        assert_eq!(binding.chain_count, 0);
        assert_eq!(binding.thumbprint.len(), 40);
        assert!(binding.thumbprint.chars().all(|c| !c.is_ascii_lowercase()));
        assert_eq!(runtime.get("api.example.com").await, Some(binding));
    }

    #[tokio::test]
    async fn test_hostname_mismatch_is_recorded_not_rejected() {
        let runtime = DomainTlsRuntime::new();
        let generated = current(&["other.example.com"]);
        let binding = runtime
            .add_or_replace_pem("api.example.com", &generated.cert_pem, &generated.key_pem, None)
            .await
            .unwrap();
        assert!(!binding.hostname_matches);
    }

    #[tokio::test]
    async fn test_common_name_is_checked_when_no_san_matches() {
        let mut params = CertificateParams::new(vec!["other.example.com".to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "API.example.com");
        params.distinguished_name = dn;
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        let generated = generated(&cert, &key);

        let runtime = DomainTlsRuntime::new();
        let binding = runtime
            .add_or_replace_pem("api.example.com", &generated.cert_pem, &generated.key_pem, None)
            .await
            .unwrap();
        assert!(binding.hostname_matches);
        assert_eq!(binding.subject_alternative_names, vec!["other.example.com"]);

        let elsewhere = runtime
            .add_or_replace_pem("www.example.com", &generated.cert_pem, &generated.key_pem, None)
            .await
            .unwrap();
        assert!(!elsewhere.hostname_matches);
    }

    #[tokio::test]
    async fn test_wildcard_certificate_covers_one_label() {
        let runtime = DomainTlsRuntime::new();
        let generated = current(&["*.example.com"]);
        let ok = runtime
            .add_or_replace_pem("api.example.com", &generated.cert_pem, &generated.key_pem, None)
            .await
            .unwrap();
        let deep = runtime
            .add_or_replace_pem("a.b.example.com", &generated.cert_pem, &generated.key_pem, None)
            .await
            .unwrap();
        assert!(ok.hostname_matches);
        assert!(!deep.hostname_matches);
    }

    #[tokio::test]
    async fn test_missing_private_key_fails() {
        let runtime = DomainTlsRuntime::new();
        let generated = current(&["api.example.com"]);
        let err = runtime
            .add_or_replace_pem("api.example.com", &generated.cert_pem, "", None)
            .await
            .unwrap_err();
        assert_eq!(err, TlsError::MissingPrivateKey);
        assert!(runtime.is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_key_fails() {
        let runtime = DomainTlsRuntime::new();
        let first = current(&["api.example.com"]);
        let second = current(&["api.example.com"]);
        let err = runtime
            .add_or_replace_pem("api.example.com", &first.cert_pem, &second.key_pem, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TlsError::KeyMismatch(_)));
    }

    #[tokio::test]
    async fn test_validity_window_is_enforced() {
        let runtime = DomainTlsRuntime::new();
        let expired = leaf(&["api.example.com"], (2001, 1, 1), (2002, 1, 1));
        let err = runtime
            .add_or_replace_pem("api.example.com", &expired.cert_pem, &expired.key_pem, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TlsError::Expired(_)));

        let future = leaf(&["api.example.com"], (2090, 1, 1), (2095, 1, 1));
        let err = runtime
            .add_or_replace_pem("api.example.com", &future.cert_pem, &future.key_pem, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TlsError::NotYetValid(_)));
    }

    #[tokio::test]
    async fn test_bind_at_uses_supplied_clock() {
        let runtime = DomainTlsRuntime::new();
        let generated = leaf(&["api.example.com"], (2030, 1, 1), (2031, 1, 1));
        let material = CertificateMaterial::Pem {
            cert_pem: generated.cert_pem,
            key_pem: generated.key_pem,
            chain_pem: None,
        };
        let inside = Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap();
        let binding = runtime
            .bind_at("api.example.com", &material, inside)
            .await
            .unwrap();
        assert_eq!(binding.bound_at, inside);
        let after = binding.not_after + Duration::days(1);
        assert!(matches!(
            runtime.bind_at("api.example.com", &material, after).await,
            Err(TlsError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn test_valid_chain_is_marked_validated() {
        let (ca_params, ca_key, ca_pem, _) = ca("Gateway Test Root");
        let issuer = Issuer::new(ca_params, ca_key);
        let generated = signed_leaf("api.example.com", &issuer);

        let runtime = DomainTlsRuntime::new();
        let binding = runtime
            .add_or_replace_pem(
                "api.example.com",
                &generated.cert_pem,
                &generated.key_pem,
                Some(&ca_pem),
            )
            .await
            .unwrap();
        assert!(binding.chain_provided);
        assert!(binding.chain_validated);
        assert_eq!(binding.chain_count, 1);
    }

    #[tokio::test]
    async fn test_unrelated_chain_is_recorded_as_unvalidated() {
        let (ca_params, ca_key, _, _) = ca("Gateway Test Root");
        let issuer = Issuer::new(ca_params, ca_key);
        let generated = signed_leaf("api.example.com", &issuer);
        let (_, _, unrelated_pem, _) = ca("Somebody Else");

        let runtime = DomainTlsRuntime::new();
        let binding = runtime
            .add_or_replace_pem(
                "api.example.com",
                &generated.cert_pem,
                &generated.key_pem,
                Some(&unrelated_pem),
            )
            .await
            .unwrap();
        assert!(binding.chain_provided);
        assert!(!binding.chain_validated);
    }

    #[tokio::test]
    async fn test_rotate_returns_previous_binding() {
        let runtime = DomainTlsRuntime::new();
        let first = current(&["api.example.com"]);
        let second = current(&["api.example.com"]);
        let original = runtime
            .add_or_replace_pem("api.example.com", &first.cert_pem, &first.key_pem, None)
            .await
            .unwrap();

        let outcome = runtime
            .rotate(
                "api.example.com",
                RotateRequest {
                    cert_pem: Some(second.cert_pem),
                    key_pem: Some(second.key_pem),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.previous, Some(original.clone()));
        assert_ne!(outcome.current.thumbprint, original.thumbprint);
        assert_eq!(runtime.list().await, vec![outcome.current]);
    }

    #[tokio::test]
    async fn test_rotate_without_material_fails() {
        let runtime = DomainTlsRuntime::new();
        assert_eq!(
            runtime
                .rotate("api.example.com", RotateRequest::default())
                .await
                .unwrap_err(),
            TlsError::MissingRotateInput
        );
    }

    #[tokio::test]
    async fn test_empty_host_is_rejected() {
        let runtime = DomainTlsRuntime::new();
        let generated = current(&["api.example.com"]);
        assert_eq!(
            runtime
                .add_or_replace_pem("  ", &generated.cert_pem, &generated.key_pem, None)
                .await
                .unwrap_err(),
            TlsError::EmptyHost
        );
    }

    #[tokio::test]
    async fn test_sni_lookup_falls_back_to_wildcard() {
        let runtime = DomainTlsRuntime::new();
        let wildcard = current(&["*.example.com"]);
        runtime
            .add_or_replace_pem("*.example.com", &wildcard.cert_pem, &wildcard.key_pem, None)
            .await
            .unwrap();

        assert!(runtime.certified_key_for("API.example.com").is_some());
        assert!(runtime.certified_key_for("a.b.example.com").is_none());
        assert!(runtime.certified_key_for("example.org").is_none());

        assert!(runtime.remove("*.example.com").await);
        assert!(!runtime.remove("*.example.com").await);
        assert!(runtime.certified_key_for("api.example.com").is_none());
    }

    #[tokio::test]
    async fn test_invalid_pfx_bytes_are_rejected() {
        let runtime = DomainTlsRuntime::new();
        let err = runtime
            .add_or_replace("api.example.com", &STANDARD.encode(b"not a pkcs12"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TlsError::MalformedPfx(_)));
    }

    #[tokio::test]
    async fn test_bind_pfx_with_private_key() {
        let runtime = DomainTlsRuntime::new();
        let generated = current(&["api.example.com"]);
        let binding = runtime
            .add_or_replace(
                "api.example.com",
                &pfx_base64(&generated, None, "pfx-pass"),
                Some("pfx-pass"),
            )
            .await
            .unwrap();

        assert!(binding.has_private_key);
        assert!(binding.hostname_matches);
        assert!(!binding.chain_provided);
        assert_eq!(binding.chain_count, 0);
        assert_eq!(
            binding.thumbprint,
            certificate::thumbprint(&generated.cert_der)
        );
        assert!(runtime.certified_key_for("api.example.com").is_some());
    }

    #[tokio::test]
    async fn test_bind_pfx_counts_embedded_chain() {
        let (ca_params, ca_key, _, ca_der) = ca("Gateway Test Root");
        let issuer = Issuer::new(ca_params, ca_key);
        let generated = signed_leaf("api.example.com", &issuer);

        let runtime = DomainTlsRuntime::new();
        let binding = runtime
            .add_or_replace(
                "api.example.com",
                &pfx_base64(&generated, Some(&ca_der), "pfx-pass"),
                Some("pfx-pass"),
            )
            .await
            .unwrap();

        assert_eq!(
            binding.thumbprint,
            certificate::thumbprint(&generated.cert_der)
        );
        assert!(binding.chain_provided);
        assert_eq!(binding.chain_count, 1);
        assert!(binding.chain_validated);
    }

    #[tokio::test]
    async fn test_pfx_without_private_key_fails() {
        let runtime = DomainTlsRuntime::new();
        let generated = current(&["api.example.com"]);
        let err = runtime
            .add_or_replace(
                "api.example.com",
                &certificate_only_pfx(&generated.cert_der),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err, TlsError::MissingPrivateKey);
        assert!(runtime.is_empty());
    }

    #[tokio::test]
    async fn test_pfx_wrong_password_is_rejected() {
        let runtime = DomainTlsRuntime::new();
        let generated = current(&["api.example.com"]);
        let err = runtime
            .add_or_replace(
                "api.example.com",
                &pfx_base64(&generated, None, "right"),
                Some("wrong"),
            )
            .await
            .unwrap_err();
        assert_eq!(err, TlsError::InvalidPfxPassword);
    }

    #[tokio::test]
    async fn test_bind_openssl3_default_bundle() {
        // AES-256-CBC bags and an HMAC-SHA-256 MAC, as written by
        // `openssl pkcs12 -export` without `-legacy`.
        let runtime = DomainTlsRuntime::new();
        let material = CertificateMaterial::Pfx {
            data_base64: OPENSSL3_CHAIN.to_string(),
            password: Some("s3cret".to_string()),
        };
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let binding = runtime
            .bind_at("api.example.com", &material, now)
            .await
            .unwrap();

        assert!(binding.has_private_key);
        assert!(binding.hostname_matches);
        assert_eq!(binding.subject, "CN=api.example.com");
        assert_eq!(binding.chain_count, 1);
        assert!(binding.chain_validated);

        let wrong = CertificateMaterial::Pfx {
            data_base64: OPENSSL3_CHAIN.to_string(),
            password: Some("guess".to_string()),
        };
        assert_eq!(
            runtime.bind_at("api.example.com", &wrong, now).await.unwrap_err(),
            TlsError::InvalidPfxPassword
        );
    }
}
