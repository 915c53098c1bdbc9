//! Certificate key and CSR management.
//!
//! Keys are ECDSA P-256. A key on disk is reused only when the caller permits
//! it; anything unreadable or on another curve is replaced by a fresh key.

use std::collections::BTreeSet;
use std::path::Path;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, KeyPair, PublicKeyData, PKCS_ECDSA_P256_SHA256,
};
use tracing::{debug, info, warn};

use crate::error::IssueError;
use crate::request::CertificateRequest;

/// Whether an existing key file may be reused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyReuse {
    Permitted,
    Denied,
}

/// Where the key of this run came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Loaded,
    Generated,
}

/// The certificate private key for one run
///
/// Not `Clone`: the only copy is handed to the installer via [`KeyMaterial::into_pem`].
pub struct KeyMaterial {
    key: KeyPair,
    origin: KeyOrigin,
}

impl KeyMaterial {
    /// Generate a fresh P-256 key
    pub fn generate() -> Result<Self, IssueError> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| IssueError::KeyGeneration(e.to_string()))?;
        Ok(Self {
            key,
            origin: KeyOrigin::Generated,
        })
    }

    /// Parse a PEM-encoded P-256 key
    pub fn from_pem(pem: &str) -> Result<Self, IssueError> {
        let key = KeyPair::from_pem(pem).map_err(|e| IssueError::KeyGeneration(e.to_string()))?;
        if key.algorithm() != &PKCS_ECDSA_P256_SHA256 {
            return Err(IssueError::KeyGeneration(
                "key is not an ECDSA P-256 key".to_string(),
            ));
        }
        Ok(Self {
            key,
            origin: KeyOrigin::Loaded,
        })
    }

    pub fn origin(&self) -> KeyOrigin {
        self.origin
    }

    /// DER-encoded SubjectPublicKeyInfo
    pub fn public_key_der(&self) -> Vec<u8> {
        self.key.subject_public_key_info()
    }

    /// Serialize the key for installation, consuming it
    pub fn into_pem(self) -> String {
        self.key.serialize_pem()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// A PKCS#10 request derived from a [`CertificateRequest`] and a key
#[derive(Debug, Clone)]
pub struct SigningRequest {
    der: Vec<u8>,
    pem: String,
    sans: BTreeSet<String>,
}

impl SigningRequest {
    /// DER encoding, as submitted to the finalize endpoint
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn sans(&self) -> &BTreeSet<String> {
        &self.sans
    }
}

/// Load the key at `path` when reuse is permitted, else generate one
pub fn ensure_key(path: &Path, reuse: KeyReuse) -> Result<KeyMaterial, IssueError> {
    if reuse == KeyReuse::Permitted {
        match std::fs::read_to_string(path) {
            Ok(pem) => match KeyMaterial::from_pem(&pem) {
                Ok(key) => {
                    debug!(path = %path.display(), "Reusing existing certificate key");
                    return Ok(key);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Existing key unusable, generating a new one");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No existing key");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Existing key unreadable, generating a new one");
            }
        }
    }

    let key = KeyMaterial::generate()?;
    info!(path = %path.display(), "Generated new ECDSA P-256 certificate key");
    Ok(key)
}

/// Build the CSR for `request`, signed by `key`
///
/// The subject CN is the request's common name and the SAN extension lists
/// exactly the request's SAN set in sorted order.
pub fn build_signing_request(
    key: &KeyMaterial,
    request: &CertificateRequest,
) -> Result<SigningRequest, IssueError> {
    if request.sans().is_empty() {
        return Err(IssueError::CsrBuild("SAN set is empty".to_string()));
    }

    let names: Vec<String> = request.sans().iter().cloned().collect();
    let mut params =
        CertificateParams::new(names).map_err(|e| IssueError::CsrBuild(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, request.common_name());
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&key.key)
        .map_err(|e| IssueError::CsrBuild(e.to_string()))?;
    let pem = csr.pem().map_err(|e| IssueError::CsrBuild(e.to_string()))?;

    debug!(
        common_name = %request.common_name(),
        san_count = request.sans().len(),
        "Built certificate signing request"
    );

    Ok(SigningRequest {
        der: csr.der().to_vec(),
        pem,
        sans: request.sans().clone(),
    })
}
