//! The certificate request a run works towards.

use std::collections::BTreeSet;

use certkeeper_config::validate::canonical_name;
use certkeeper_config::CertConfig;

use crate::error::IssueError;

/// Names and identity of the certificate to maintain
///
/// Built once per invocation. Names are stored in the form the CA prints
/// them in the certificate. The SAN set always contains the common name
/// and is kept sorted so every derived artifact lists names in the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    common_name: String,
    sans: BTreeSet<String>,
    service_name: String,
}

impl CertificateRequest {
    /// Create a request, adding the common name to the SAN set if missing
    pub fn new<I, S>(common_name: &str, sans: I, service_name: &str) -> Result<Self, IssueError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let common_name = canonical_name(common_name);
        if common_name.is_empty() {
            return Err(IssueError::Configuration(
                "common name must not be empty".to_string(),
            ));
        }

        let service_name = service_name.trim().to_string();
        if service_name.is_empty() {
            return Err(IssueError::Configuration(
                "service name must not be empty".to_string(),
            ));
        }

        let mut set: BTreeSet<String> = sans
            .into_iter()
            .map(|s| canonical_name(s.as_ref()))
            .filter(|s| !s.is_empty())
            .collect();
        set.insert(common_name.clone());

        Ok(Self {
            common_name,
            sans: set,
            service_name,
        })
    }

    /// Build the request described by a validated configuration
    pub fn from_config(config: &CertConfig) -> Result<Self, IssueError> {
        Self::new(&config.common_name, &config.sans, &config.service_name)
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Requested SAN set, sorted
    pub fn sans(&self) -> &BTreeSet<String> {
        &self.sans
    }

    /// File stem for installed artifacts
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}
