//! Configuration validation
//!
//! Errors make the configuration unusable; warnings are logged and the run
//! proceeds.

mod identifiers;
mod lint;
mod settings;

pub use identifiers::{canonical_name, is_valid_dns_name, validate_identifier};

use std::fmt;

use crate::CertConfig;

/// Category of a validation error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Service, common name or SAN problems
    Identifier,
    /// Path settings
    Path,
    /// ACME directory or account settings
    Acme,
    /// Timeouts and thresholds
    Renewal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Identifier => "identifier",
            ErrorCategory::Path => "path",
            ErrorCategory::Acme => "acme",
            ErrorCategory::Renewal => "renewal",
        };
        f.write_str(name)
    }
}

/// A validation failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// A non-fatal observation about the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Collected validation outcome
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Run every validation pass over the configuration
pub fn validate_config(config: &CertConfig) -> ValidationResult {
    let mut result = ValidationResult::new();
    result.merge(identifiers::validate_identifiers(config));
    result.merge(settings::validate_settings(config));
    result.merge(lint::lint_config(config));
    result
}
