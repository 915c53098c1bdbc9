//! Configuration linting
//!
//! Flags settings that work but are probably not what the operator meant.

use super::{ValidationResult, ValidationWarning};
use crate::{CertConfig, LETS_ENCRYPT_STAGING};

/// Lint configuration for likely mistakes
pub fn lint_config(config: &CertConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    let cn = config.common_name.to_ascii_lowercase();
    if !config.sans.iter().any(|s| s.eq_ignore_ascii_case(&cn)) {
        result.add_warning(ValidationWarning::new(format!(
            "common-name '{}' is not listed in sans and will be added implicitly",
            config.common_name
        )));
    }

    if config.acme.directory_url == LETS_ENCRYPT_STAGING {
        result.add_warning(ValidationWarning::new(
            "Using the Let's Encrypt staging directory; issued certificates are not trusted",
        ));
    }

    if config.acme.directory_url.starts_with("http://") {
        result.add_warning(ValidationWarning::new(format!(
            "ACME directory '{}' is not served over TLS",
            config.acme.directory_url
        )));
    }

    // Let's Encrypt certificates live 90 days; this would renew on every run.
    if config.renewal.threshold_days >= 90 {
        result.add_warning(ValidationWarning::new(format!(
            "renewal.threshold-days is {}; certificates will likely be renewed on every run",
            config.renewal.threshold_days
        )));
    }

    if config.renewal.force {
        result.add_warning(ValidationWarning::new(
            "renewal.force is set; a certificate is requested on every run",
        ));
    }

    if config.reload.service.is_none() {
        result.add_warning(ValidationWarning::new(
            "No reload service configured; new certificates are not picked up automatically",
        ));
    }

    result
}
