//! Splitting a downloaded PEM chain into leaf and intermediates.

use std::collections::BTreeSet;

use crate::error::IssueError;
use crate::inspect::parse_certificate_pem;

const END_MARKER: &str = "-----END CERTIFICATE-----";

/// Certificate material returned by the CA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedChain {
    /// The end-entity certificate
    pub leaf: String,
    /// Intermediates, in CA order; empty if the CA sent only the leaf
    pub chain: String,
    /// Leaf followed by the intermediates
    pub full_chain: String,
}

impl IssuedChain {
    /// Split a `application/pem-certificate-chain` body
    ///
    /// The first certificate is the leaf. Its SANs must equal `expected`.
    pub fn split(pem: &str, expected: &BTreeSet<String>) -> Result<Self, IssueError> {
        let blocks = pem_blocks(pem);
        let Some((leaf, rest)) = blocks.split_first() else {
            return Err(IssueError::protocol(
                "download",
                "certificate chain contains no certificates",
            ));
        };

        let parsed = parse_certificate_pem(leaf.as_bytes())
            .map_err(|e| IssueError::protocol("download", e))?;
        if &parsed.sans != expected {
            return Err(IssueError::protocol(
                "download",
                format!(
                    "issued certificate covers [{}], requested [{}]",
                    join(&parsed.sans),
                    join(expected)
                ),
            ));
        }

        let chain = rest.concat();
        Ok(Self {
            leaf: leaf.clone(),
            full_chain: format!("{}{}", leaf, chain),
            chain,
        })
    }
}

/// Individual certificate blocks, each normalized to end with a newline
fn pem_blocks(pem: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = pem;
    while let Some(start) = rest.find("-----BEGIN CERTIFICATE-----") {
        let Some(end) = rest[start..].find(END_MARKER) else {
            break;
        };
        let end = start + end + END_MARKER.len();
        blocks.push(format!("{}\n", &rest[start..end]));
        rest = &rest[end..];
    }
    blocks
}

fn join(names: &BTreeSet<String>) -> String {
    names.iter().cloned().collect::<Vec<_>>().join(", ")
}
