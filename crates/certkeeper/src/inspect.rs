//! Existing certificate inspection.
//!
//! An unreadable or unparseable certificate is reported as absent so the
//! policy treats it as "needs issuance" instead of failing the run.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

/// Snapshot of an installed certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingCertificate {
    /// Names from the subject alternative name extension
    pub sans: BTreeSet<String>,
    /// End of the validity period
    pub not_after: DateTime<Utc>,
    /// DER-encoded SubjectPublicKeyInfo of the certificate
    pub public_key: Vec<u8>,
}

/// Inspect the certificate at `path`
///
/// Returns `None` when the file is missing or not a parseable certificate.
pub fn inspect(path: &Path) -> Option<ExistingCertificate> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            trace!(path = %path.display(), "No existing certificate");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Existing certificate unreadable, treating as absent");
            return None;
        }
    };

    match parse_certificate_pem(&bytes) {
        Ok(cert) => {
            debug!(
                path = %path.display(),
                not_after = %cert.not_after,
                san_count = cert.sans.len(),
                "Inspected existing certificate"
            );
            Some(cert)
        }
        Err(reason) => {
            warn!(path = %path.display(), reason = %reason, "Existing certificate unparseable, treating as absent");
            None
        }
    }
}

/// Parse the first certificate of a PEM buffer
pub fn parse_certificate_pem(bytes: &[u8]) -> Result<ExistingCertificate, String> {
    let (_, pem) = parse_x509_pem(bytes).map_err(|e| format!("invalid PEM: {}", e))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| format!("invalid X.509 certificate: {}", e))?;

    let timestamp = cert.validity().not_after.timestamp();
    let not_after = DateTime::<Utc>::from_timestamp(timestamp, 0)
        .ok_or_else(|| format!("notAfter {} out of range", timestamp))?;

    let mut sans = BTreeSet::new();
    match cert.subject_alternative_name() {
        Ok(Some(ext)) => {
            for name in &ext.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => {
                        sans.insert(dns.to_ascii_lowercase());
                    }
                    GeneralName::IPAddress(raw) => {
                        if let Some(ip) = ip_from_bytes(raw) {
                            sans.insert(ip.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(None) => {}
        Err(e) => return Err(format!("invalid subjectAltName extension: {}", e)),
    }

    Ok(ExistingCertificate {
        sans,
        not_after,
        public_key: cert.public_key().raw.to_vec(),
    })
}

fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
