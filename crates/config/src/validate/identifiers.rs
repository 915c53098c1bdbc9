//! Service name, common name and SAN validation.

use std::net::IpAddr;

use super::{ErrorCategory, ValidationError, ValidationResult};
use crate::CertConfig;

/// Validate service name, common name and SAN set
pub fn validate_identifiers(config: &CertConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    let service = config.service_name.trim();
    if service.is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Identifier,
            "service name must not be empty",
        ));
    } else if service.contains(['/', '\\']) || service == "." || service == ".." {
        result.add_error(ValidationError::new(
            ErrorCategory::Identifier,
            format!(
                "service name '{}' cannot be used as a file name",
                config.service_name
            ),
        ));
    }

    if config.common_name.trim().is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Identifier,
            "common-name must not be empty",
        ));
    } else if let Err(reason) = validate_identifier(&config.common_name) {
        result.add_error(ValidationError::new(
            ErrorCategory::Identifier,
            format!("common-name '{}': {}", config.common_name, reason),
        ));
    }

    if config.sans.is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Identifier,
            "sans must list at least one name",
        ));
    }

    for san in &config.sans {
        if let Err(reason) = validate_identifier(san) {
            result.add_error(ValidationError::new(
                ErrorCategory::Identifier,
                format!("san '{}': {}", san, reason),
            ));
        }
    }

    result
}

/// The form a name takes in an issued certificate
///
/// IP literals are re-emitted in their standard textual form, DNS names are
/// lower-cased and lose a trailing root dot.
pub fn canonical_name(name: &str) -> String {
    let name = name.trim();
    match name.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase(),
    }
}

/// Check that a name can be validated with http-01
pub fn validate_identifier(name: &str) -> Result<(), String> {
    if name.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if name.starts_with("*.") {
        return Err("wildcard names cannot be validated with http-01".to_string());
    }
    if !is_valid_dns_name(name) {
        return Err("not a valid DNS name or IP address".to_string());
    }
    Ok(())
}

/// RFC 1123 host name check
pub fn is_valid_dns_name(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
