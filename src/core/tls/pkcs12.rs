//! PKCS#12 container decoding.
//!
//! `p12` parses the bundle structure but only decrypts the legacy SHA-1
//! password-based schemes. OpenSSL 3 writes PBES2 (PBKDF2 with AES-CBC) bags
//! and an HMAC-SHA-256 integrity MAC by default; those are handled here with
//! aws-lc-rs, the same backend rustls uses.
use std::num::NonZeroU32;

use aws_lc_rs::{
    cipher::{
        AES_128, AES_192, AES_256, Algorithm as CipherAlgorithm, DecryptionContext,
        PaddedBlockDecryptingKey, UnboundCipherKey,
    },
    digest, hmac,
    iv::FixedLength,
    pbkdf2,
};
use p12::{AlgorithmIdentifier, CertBag, ContentInfo, MacData, PFX, SafeBag, SafeBagKind};
use yasna::{ASN1Error, ASN1ErrorKind, models::ObjectIdentifier};

use crate::core::tls::TlsError;

const OID_PBES2: &[u64] = &[1, 2, 840, 113_549, 1, 5, 13];
const OID_PBKDF2: &[u64] = &[1, 2, 840, 113_549, 1, 5, 12];
const OID_HMAC_SHA1: &[u64] = &[1, 2, 840, 113_549, 2, 7];
const OID_HMAC_SHA256: &[u64] = &[1, 2, 840, 113_549, 2, 9];
const OID_HMAC_SHA384: &[u64] = &[1, 2, 840, 113_549, 2, 10];
const OID_HMAC_SHA512: &[u64] = &[1, 2, 840, 113_549, 2, 11];
const OID_AES128_CBC: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 1, 2];
const OID_AES192_CBC: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 1, 22];
const OID_AES256_CBC: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 1, 42];
const OID_SHA256: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 1];
const OID_SHA384: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 2];
const OID_SHA512: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 3];
const OID_KEY_BAG: &[u64] = &[1, 2, 840, 113_549, 1, 12, 10, 1, 1];

/// A certificate or key bag together with its `localKeyId` attribute.
#[derive(Debug, Clone)]
pub(crate) struct BagEntry {
    pub der: Vec<u8>,
    pub local_key_id: Option<Vec<u8>>,
}

/// Decrypted contents of a bundle, in bag order.
#[derive(Debug, Default)]
pub(crate) struct Pkcs12Contents {
    pub certificates: Vec<BagEntry>,
    /// PKCS#8 `PrivateKeyInfo` DER.
    pub private_keys: Vec<BagEntry>,
}

/// Verify the integrity MAC and decrypt every bag of a DER bundle.
pub(crate) fn open(der: &[u8], password: &str) -> Result<Pkcs12Contents, TlsError> {
    let pfx = PFX::parse(der).map_err(malformed)?;
    let ContentInfo::Data(auth_safe) = &pfx.auth_safe else {
        return Err(unsupported("public-key integrity mode"));
    };
    let bmp_password = bmp_string(password);
    if let Some(mac_data) = &pfx.mac_data {
        verify_mac(mac_data, auth_safe, &bmp_password)?;
    }

    let contents =
        yasna::parse_ber(auth_safe, |r| r.collect_sequence_of(ContentInfo::parse))
            .map_err(malformed)?;
    let mut out = Pkcs12Contents::default();
    for content in &contents {
        let safe_contents = match content {
            ContentInfo::Data(data) => data.clone(),
            ContentInfo::EncryptedData(encrypted) => {
                let info = &encrypted.encrypted_content_info;
                decrypt(
                    &info.content_encryption_algorithm,
                    &info.encrypted_content,
                    password,
                    &bmp_password,
                )?
            }
            ContentInfo::OtherContext(other) => {
                return Err(unsupported(&format!(
                    "content type {}",
                    other.content_type
                )));
            }
        };
        let bags = yasna::parse_ber(&safe_contents, |r| r.collect_sequence_of(SafeBag::parse))
            .map_err(malformed)?;
        for bag in &bags {
            out.push(bag, password, &bmp_password)?;
        }
    }
    Ok(out)
}

impl Pkcs12Contents {
    fn push(&mut self, bag: &SafeBag, password: &str, bmp_password: &[u8]) -> Result<(), TlsError> {
        let local_key_id = bag.local_key_id();
        match &bag.bag {
            SafeBagKind::CertBag(CertBag::X509(der)) => self.certificates.push(BagEntry {
                der: der.clone(),
                local_key_id,
            }),
            SafeBagKind::Pkcs8ShroudedKeyBag(info) => {
                let der = decrypt(
                    &info.encryption_algorithm,
                    &info.encrypted_data,
                    password,
                    bmp_password,
                )?;
                self.private_keys.push(BagEntry { der, local_key_id });
            }
            SafeBagKind::OtherBagKind(other) if oid_is(&other.bag_id, OID_KEY_BAG) => {
                self.private_keys.push(BagEntry {
                    der: other.bag_value.clone(),
                    local_key_id,
                });
            }
            SafeBagKind::CertBag(CertBag::SDSI(_)) | SafeBagKind::OtherBagKind(_) => {}
        }
        Ok(())
    }
}

fn verify_mac(mac_data: &MacData, data: &[u8], bmp_password: &[u8]) -> Result<(), TlsError> {
    let (digest_algorithm, hmac_algorithm): (&'static digest::Algorithm, hmac::Algorithm) =
        match &mac_data.mac.digest_algorithm {
            AlgorithmIdentifier::Sha1 => (
                &digest::SHA1_FOR_LEGACY_USE_ONLY,
                hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            ),
            AlgorithmIdentifier::OtherAlg(other) => {
                match other.algorithm_type.components().as_slice() {
                    OID_SHA256 => (&digest::SHA256, hmac::HMAC_SHA256),
                    OID_SHA384 => (&digest::SHA384, hmac::HMAC_SHA384),
                    OID_SHA512 => (&digest::SHA512, hmac::HMAC_SHA512),
                    _ => {
                        return Err(unsupported(&format!(
                            "MAC digest {}",
                            other.algorithm_type
                        )));
                    }
                }
            }
            _ => return Err(unsupported("MAC digest")),
        };

    let mac_key = mac_key(
        digest_algorithm,
        bmp_password,
        &mac_data.salt,
        mac_data.iterations,
    );
    let key = hmac::Key::new(hmac_algorithm, mac_key.as_ref());
    hmac::verify(&key, data, &mac_data.mac.digest).map_err(|_| TlsError::InvalidPfxPassword)
}

/// MAC key derivation of RFC 7292 appendix B.2 (diversifier 3), one hash
/// block long.
fn mac_key(
    algorithm: &'static digest::Algorithm,
    bmp_password: &[u8],
    salt: &[u8],
    iterations: u32,
) -> digest::Digest {
    let block_len = algorithm.block_len();
    let mut context = digest::Context::new(algorithm);
    context.update(&vec![3u8; block_len]);
    context.update(&repeat_to_block(salt, block_len));
    context.update(&repeat_to_block(bmp_password, block_len));
    let mut hash = context.finish();
    for _ in 1..iterations {
        hash = digest::digest(algorithm, hash.as_ref());
    }
    hash
}

fn repeat_to_block(bytes: &[u8], block_len: usize) -> Vec<u8> {
    let len = bytes.len().div_ceil(block_len) * block_len;
    bytes.iter().copied().cycle().take(len).collect()
}

fn decrypt(
    algorithm: &AlgorithmIdentifier,
    ciphertext: &[u8],
    password: &str,
    bmp_password: &[u8],
) -> Result<Vec<u8>, TlsError> {
    match algorithm {
        AlgorithmIdentifier::PbewithSHAAnd40BitRC2CBC(_)
        | AlgorithmIdentifier::PbeWithSHAAnd3KeyTripleDESCBC(_) => algorithm
            .decrypt_pbe(ciphertext, bmp_password)
            .ok_or(TlsError::InvalidPfxPassword),
        AlgorithmIdentifier::OtherAlg(other) if oid_is(&other.algorithm_type, OID_PBES2) => {
            let params = other
                .params
                .as_deref()
                .ok_or_else(|| TlsError::MalformedPfx("PBES2 parameters missing".to_string()))?;
            pbes2_decrypt(params, ciphertext, password.as_bytes())
        }
        AlgorithmIdentifier::OtherAlg(other) => Err(unsupported(&format!(
            "encryption scheme {}",
            other.algorithm_type
        ))),
        AlgorithmIdentifier::Sha1 => Err(unsupported("encryption scheme sha1")),
    }
}

struct Pbes2Params {
    salt: Vec<u8>,
    iterations: u64,
    key_length: Option<u64>,
    prf: Option<ObjectIdentifier>,
    cipher: ObjectIdentifier,
    iv: Vec<u8>,
}

fn parse_pbes2(params: &[u8]) -> Result<Pbes2Params, ASN1Error> {
    yasna::parse_ber(params, |r| {
        r.read_sequence(|r| {
            let (salt, iterations, key_length, prf) = r.next().read_sequence(|r| {
                let kdf = r.next().read_oid()?;
                if !oid_is(&kdf, OID_PBKDF2) {
                    return Err(ASN1Error::new(ASN1ErrorKind::Invalid));
                }
                r.next().read_sequence(|r| {
                    let salt = r.next().read_bytes()?;
                    let iterations = r.next().read_u64()?;
                    let key_length = r.read_optional(|r| r.read_u64())?;
                    let prf = r.read_optional(|r| {
                        r.read_sequence(|r| {
                            let oid = r.next().read_oid()?;
                            r.read_optional(|r| r.read_null())?;
                            Ok(oid)
                        })
                    })?;
                    Ok((salt, iterations, key_length, prf))
                })
            })?;
            let (cipher, iv) = r.next().read_sequence(|r| {
                let cipher = r.next().read_oid()?;
                let iv = r.next().read_bytes()?;
                Ok((cipher, iv))
            })?;
            Ok(Pbes2Params {
                salt,
                iterations,
                key_length,
                prf,
                cipher,
                iv,
            })
        })
    })
}

fn pbes2_decrypt(params: &[u8], ciphertext: &[u8], password: &[u8]) -> Result<Vec<u8>, TlsError> {
    let params = parse_pbes2(params)
        .map_err(|e| TlsError::MalformedPfx(format!("PBES2 parameters: {e:?}")))?;

    let prf = match params.prf.as_ref().map(|oid| oid.components().as_slice()) {
        None | Some(OID_HMAC_SHA1) => pbkdf2::PBKDF2_HMAC_SHA1,
        Some(OID_HMAC_SHA256) => pbkdf2::PBKDF2_HMAC_SHA256,
        Some(OID_HMAC_SHA384) => pbkdf2::PBKDF2_HMAC_SHA384,
        Some(OID_HMAC_SHA512) => pbkdf2::PBKDF2_HMAC_SHA512,
        Some(_) => return Err(unsupported("PBKDF2 pseudo-random function")),
    };
    let (cipher, key_len): (&'static CipherAlgorithm, usize) =
        match params.cipher.components().as_slice() {
            OID_AES128_CBC => (&AES_128, 16),
            OID_AES192_CBC => (&AES_192, 24),
            OID_AES256_CBC => (&AES_256, 32),
            _ => {
                return Err(unsupported(&format!("cipher {}", params.cipher)));
            }
        };
    if params.key_length.is_some_and(|len| len != key_len as u64) {
        return Err(TlsError::MalformedPfx(
            "PBKDF2 key length does not match the cipher".to_string(),
        ));
    }
    let iterations = u32::try_from(params.iterations)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or_else(|| TlsError::MalformedPfx("PBKDF2 iteration count out of range".to_string()))?;
    let iv: [u8; 16] = params
        .iv
        .as_slice()
        .try_into()
        .map_err(|_| TlsError::MalformedPfx("AES-CBC IV must be 16 bytes".to_string()))?;

    let mut key_bytes = vec![0u8; key_len];
    pbkdf2::derive(prf, iterations, &params.salt, password, &mut key_bytes);
    let key = UnboundCipherKey::new(cipher, &key_bytes)
        .and_then(PaddedBlockDecryptingKey::cbc_pkcs7)
        .map_err(|_| TlsError::MalformedPfx("unusable AES key".to_string()))?;

    let mut buffer = ciphertext.to_vec();
    let plaintext = key
        .decrypt(&mut buffer, DecryptionContext::Iv128(FixedLength::from(iv)))
        .map_err(|_| TlsError::InvalidPfxPassword)?;
    Ok(plaintext.to_vec())
}

/// Password as a NUL-terminated big-endian UTF-16 string.
fn bmp_string(password: &str) -> Vec<u8> {
    let mut out: Vec<u8> = password.encode_utf16().flat_map(u16::to_be_bytes).collect();
    out.extend_from_slice(&[0, 0]);
    out
}

fn oid_is(oid: &ObjectIdentifier, expected: &[u64]) -> bool {
    oid.components().as_slice() == expected
}

fn malformed(e: ASN1Error) -> TlsError {
    TlsError::MalformedPfx(format!("{e:?}"))
}

fn unsupported(what: &str) -> TlsError {
    TlsError::MalformedPfx(format!("unsupported {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use rcgen::{CertificateParams, KeyPair};

    const OPENSSL3_CHAIN: &str = include_str!("testdata/openssl3_chain.p12.b64");

    fn openssl3_bundle() -> Vec<u8> {
        let compact: String = OPENSSL3_CHAIN.split_whitespace().collect();
        STANDARD.decode(compact).unwrap()
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn test_bmp_string() {
        assert_eq!(bmp_string(""), vec![0, 0]);
        assert_eq!(bmp_string("ab"), vec![0, b'a', 0, b'b', 0, 0]);
    }

    #[test]
    fn test_mac_key_derivation() {
        let key = mac_key(&digest::SHA256, &bmp_string("s3cret"), b"saltsalt", 5);
        assert_eq!(
            hex(key.as_ref()),
            "e7746a246838a92f22bae81efc2a3f45e312b56eb0c2e9c59fc3aa312bde2b8e"
        );
        let key = mac_key(
            &digest::SHA1_FOR_LEGACY_USE_ONLY,
            &bmp_string(""),
            &[1, 2, 3, 4, 5, 6, 7, 8],
            1,
        );
        assert_eq!(hex(key.as_ref()), "b73b61d3a22867cf1922c1d70e96c7567ff156bd");
    }

    #[test]
    fn test_opens_openssl3_default_bundle() {
        let contents = open(&openssl3_bundle(), "s3cret").unwrap();
        assert_eq!(contents.certificates.len(), 2);
        assert_eq!(contents.private_keys.len(), 1);

        let key_id = contents.private_keys[0].local_key_id.clone();
        assert!(key_id.is_some());
        assert_eq!(
            contents
                .certificates
                .iter()
                .filter(|c| c.local_key_id == key_id)
                .count(),
            1
        );
    }

    #[test]
    fn test_wrong_password_on_sha256_mac() {
        assert!(matches!(
            open(&openssl3_bundle(), "wrong"),
            Err(TlsError::InvalidPfxPassword)
        ));
    }

    #[test]
    fn test_opens_legacy_bundle() {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["api.example.com".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let pfx = PFX::new(cert.der(), &key.serialize_der(), None, "pw", "api").unwrap();

        let contents = open(&pfx.to_der(), "pw").unwrap();
        assert_eq!(contents.certificates.len(), 1);
        assert_eq!(contents.certificates[0].der, cert.der().to_vec());
        assert_eq!(contents.private_keys[0].der, key.serialize_der());

        assert!(matches!(
            open(&pfx.to_der(), "nope"),
            Err(TlsError::InvalidPfxPassword)
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            open(b"not a bundle", ""),
            Err(TlsError::MalformedPfx(_))
        ));
    }
}
