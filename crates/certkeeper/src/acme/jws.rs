//! Account key handling and JWS signing (RFC 7515, RFC 7638, RFC 8555 section 6.2).

use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::DecodePrivateKey;
use p256::SecretKey;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::IssueError;

/// ECDSA P-256 account key
pub struct AccountKey {
    signing: SigningKey,
    x: String,
    y: String,
    thumbprint: String,
}

impl AccountKey {
    /// Load the externally supplied account key
    pub fn load(path: &Path) -> Result<Self, IssueError> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            IssueError::Account(format!(
                "cannot read account key {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_pem(&pem)
    }

    /// Parse a PKCS#8 (`PRIVATE KEY`) or SEC1 (`EC PRIVATE KEY`) PEM key
    pub fn from_pem(pem: &str) -> Result<Self, IssueError> {
        let signing = if pem.contains("BEGIN EC PRIVATE KEY") {
            SecretKey::from_sec1_pem(pem)
                .map(SigningKey::from)
                .map_err(|e| IssueError::Account(format!("invalid SEC1 account key: {}", e)))?
        } else {
            SigningKey::from_pkcs8_pem(pem).map_err(|e| {
                IssueError::Account(format!("invalid PKCS#8 P-256 account key: {}", e))
            })?
        };
        Self::from_signing_key(signing)
    }

    /// Generate a fresh key, for tests and throwaway accounts
    pub fn generate() -> Result<Self, IssueError> {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| IssueError::Account(format!("cannot generate account key: {}", e)))?;
        Self::from_pem(&key.serialize_pem())
    }

    fn from_signing_key(signing: SigningKey) -> Result<Self, IssueError> {
        let point = signing.verifying_key().to_encoded_point(false);
        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            return Err(IssueError::Account(
                "account public key has no affine coordinates".to_string(),
            ));
        };
        let x = URL_SAFE_NO_PAD.encode(x);
        let y = URL_SAFE_NO_PAD.encode(y);

        // Members in lexicographic order, no whitespace.
        let canonical = format!(r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#, x, y);
        let thumbprint = URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()));

        Ok(Self {
            signing,
            x,
            y,
            thumbprint,
        })
    }

    /// Public key as a JWK
    pub fn jwk(&self) -> Value {
        json!({
            "crv": "P-256",
            "kty": "EC",
            "x": self.x,
            "y": self.y,
        })
    }

    /// Base64url SHA-256 JWK thumbprint
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// `token.thumbprint`, the content served for an http-01 challenge
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{}.{}", token, self.thumbprint)
    }

    /// Produce a flattened JWS for `url`
    ///
    /// `kid` selects the account URL header; without it the JWK is embedded,
    /// as required for newAccount. A `None` payload produces POST-as-GET.
    pub fn sign_request(
        &self,
        url: &str,
        nonce: &str,
        kid: Option<&str>,
        payload: Option<&Value>,
    ) -> Value {
        let mut protected = json!({
            "alg": "ES256",
            "nonce": nonce,
            "url": url,
        });
        match kid {
            Some(kid) => protected["kid"] = Value::String(kid.to_string()),
            None => protected["jwk"] = self.jwk(),
        }

        let protected = URL_SAFE_NO_PAD.encode(protected.to_string().as_bytes());
        let payload = match payload {
            Some(value) => URL_SAFE_NO_PAD.encode(value.to_string().as_bytes()),
            None => String::new(),
        };

        let signature: Signature = self
            .signing
            .sign(format!("{}.{}", protected, payload).as_bytes());

        json!({
            "protected": protected,
            "payload": payload,
            "signature": URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        })
    }
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey")
            .field("thumbprint", &self.thumbprint)
            .finish_non_exhaustive()
    }
}
