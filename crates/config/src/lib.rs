//! Configuration for certkeeper
//!
//! A certkeeper configuration describes exactly one certificate service: the
//! names the certificate must cover, the ACME directory to obtain it from,
//! the webroot used to answer http-01 challenges and where the resulting
//! files are installed.
//!
//! Configuration files are written in KDL:
//!
//! ```kdl
//! service "web"
//! common-name "example.com"
//! sans "example.com" "www.example.com"
//! webroot "/var/www/acme"
//!
//! acme {
//!     directory "https://acme-v02.api.letsencrypt.org/directory"
//!     account-key "/etc/certkeeper/account.pem"
//! }
//!
//! install {
//!     dir "/etc/ssl/web"
//!     group "www-data"
//! }
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

mod error;
pub mod kdl;
pub mod validate;

pub use error::ConfigError;
pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Default trust anchor directory on Debian-family systems
pub const DEFAULT_TRUST_STORE_DIR: &str = "/usr/local/share/ca-certificates";

/// Lowest accepted validation/finalization timeout in seconds
pub const MIN_POLL_TIMEOUT_SECS: u64 = 120;

/// Complete configuration for one certificate service
#[derive(Debug, Clone, PartialEq)]
pub struct CertConfig {
    /// Unique service identifier, used as the stem of the installed files
    pub service_name: String,
    /// Subject common name
    pub common_name: String,
    /// Subject alternative names as written in the file
    pub sans: Vec<String>,
    /// Directory served at `http://<name>/` for http-01 challenges
    pub webroot: PathBuf,
    /// ACME account and directory settings
    pub acme: AcmeConfig,
    /// Output location and ownership
    pub install: InstallConfig,
    /// Renewal and polling behaviour
    pub renewal: RenewalConfig,
    /// Service to reload after a change
    pub reload: ReloadConfig,
}

/// ACME directory and account settings
#[derive(Debug, Clone, PartialEq)]
pub struct AcmeConfig {
    /// Directory URL of the certificate authority
    pub directory_url: String,
    /// PEM file holding the pre-existing ECDSA P-256 account key
    pub account_key: PathBuf,
    /// Contact addresses sent when binding the account
    pub contacts: Vec<String>,
    /// Optional CA root certificate (file path or https URL) to trust
    pub ca_root: Option<String>,
    /// Where the CA root is installed into the OS trust store
    pub trust_store_dir: PathBuf,
}

/// Output settings
#[derive(Debug, Clone, PartialEq)]
pub struct InstallConfig {
    /// Directory receiving `{service}.key`, `.csr`, `.crt`, `-chain.crt`, `-fullchain.crt`
    pub dir: PathBuf,
    /// Owning user of the installed files
    pub owner: Option<String>,
    /// Owning group of the installed files
    pub group: Option<String>,
}

/// Renewal decision and polling settings
#[derive(Debug, Clone, PartialEq)]
pub struct RenewalConfig {
    /// Renew when fewer than this many days of validity remain
    pub threshold_days: u32,
    /// Renew regardless of the existing certificate
    pub force: bool,
    /// First poll delay
    pub poll_initial_secs: u64,
    /// Poll delay cap
    pub poll_max_secs: u64,
    /// Deadline for all authorizations to become valid
    pub validation_timeout_secs: u64,
    /// Deadline for the order to become valid after finalization
    pub finalization_timeout_secs: u64,
    /// Ceiling for a whole issuance run
    pub run_timeout_secs: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            threshold_days: default_threshold_days(),
            force: false,
            poll_initial_secs: 2,
            poll_max_secs: 30,
            validation_timeout_secs: 300,
            finalization_timeout_secs: 300,
            run_timeout_secs: 900,
        }
    }
}

/// Service reload settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReloadConfig {
    /// Service unit reloaded when the certificate changed
    pub service: Option<String>,
}

pub(crate) fn default_threshold_days() -> u32 {
    30
}

impl CertConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), bytes = content.len(), "Read configuration file");

        let config = Self::from_kdl(&content)?;
        config.validate()?;

        info!(
            service = %config.service_name,
            san_count = config.sans.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse configuration from KDL source without validating it
    pub fn from_kdl(content: &str) -> Result<Self, ConfigError> {
        self::kdl::parse_config(content)
    }

    /// Validate the configuration, logging any warnings
    pub fn validate(&self) -> Result<(), ConfigError> {
        let result = validate::validate_config(self);

        for warning in &result.warnings {
            warn!(service = %self.service_name, "{}", warning.message);
        }

        if result.errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(result.errors))
        }
    }

    /// SAN set as it will be requested: canonical names, with the common name included
    pub fn requested_sans(&self) -> Vec<String> {
        let mut sans: Vec<String> = self.sans.iter().map(|s| validate::canonical_name(s)).collect();
        let cn = validate::canonical_name(&self.common_name);
        if !sans.contains(&cn) {
            sans.push(cn);
        }
        sans.sort();
        sans.dedup();
        sans
    }
}
