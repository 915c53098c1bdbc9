//! Path, ACME and renewal setting validation.

use std::path::Path;

use url::Url;

use super::{ErrorCategory, ValidationError, ValidationResult};
use crate::{CertConfig, MIN_POLL_TIMEOUT_SECS};

/// Validate paths, URLs and timing settings
pub fn validate_settings(config: &CertConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    require_absolute(&mut result, "webroot", &config.webroot);
    require_absolute(&mut result, "install.dir", &config.install.dir);
    require_absolute(&mut result, "acme.account-key", &config.acme.account_key);
    require_absolute(
        &mut result,
        "acme.trust-store-dir",
        &config.acme.trust_store_dir,
    );

    match Url::parse(&config.acme.directory_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        Ok(url) => result.add_error(ValidationError::new(
            ErrorCategory::Acme,
            format!(
                "acme.directory must be an http(s) URL, got scheme '{}'",
                url.scheme()
            ),
        )),
        Err(e) => result.add_error(ValidationError::new(
            ErrorCategory::Acme,
            format!(
                "acme.directory '{}' is not a URL: {}",
                config.acme.directory_url, e
            ),
        )),
    }

    if let Some(ref root) = config.acme.ca_root {
        let is_url = root.starts_with("https://") || root.starts_with("http://");
        if !is_url && !Path::new(root).is_absolute() {
            result.add_error(ValidationError::new(
                ErrorCategory::Acme,
                format!("acme.ca-root '{}' must be an absolute path or URL", root),
            ));
        }
    }

    let renewal = &config.renewal;
    if renewal.poll_initial_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Renewal,
            "renewal.poll-initial-secs must be at least 1",
        ));
    }
    if renewal.poll_initial_secs > renewal.poll_max_secs {
        result.add_error(ValidationError::new(
            ErrorCategory::Renewal,
            format!(
                "renewal.poll-initial-secs ({}) exceeds renewal.poll-max-secs ({})",
                renewal.poll_initial_secs, renewal.poll_max_secs
            ),
        ));
    }
    for (key, value) in [
        (
            "renewal.validation-timeout-secs",
            renewal.validation_timeout_secs,
        ),
        (
            "renewal.finalization-timeout-secs",
            renewal.finalization_timeout_secs,
        ),
    ] {
        if value < MIN_POLL_TIMEOUT_SECS {
            result.add_error(ValidationError::new(
                ErrorCategory::Renewal,
                format!(
                    "{} must be at least {} seconds, got {}",
                    key, MIN_POLL_TIMEOUT_SECS, value
                ),
            ));
        }
    }
    if renewal.run_timeout_secs < renewal.validation_timeout_secs {
        result.add_error(ValidationError::new(
            ErrorCategory::Renewal,
            "renewal.run-timeout-secs must not be shorter than renewal.validation-timeout-secs",
        ));
    }

    result
}

fn require_absolute(result: &mut ValidationResult, key: &str, path: &Path) {
    if !path.is_absolute() {
        result.add_error(ValidationError::new(
            ErrorCategory::Path,
            format!("{} must be an absolute path, got {:?}", key, path),
        ));
    }
}
