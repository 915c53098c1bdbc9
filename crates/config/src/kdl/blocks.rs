//! Parsing of the `acme`, `install`, `renewal` and `reload` blocks.

use ::kdl::KdlDocument;
use std::path::PathBuf;
use tracing::trace;

use crate::{
    AcmeConfig, ConfigError, InstallConfig, ReloadConfig, RenewalConfig, DEFAULT_TRUST_STORE_DIR,
    LETS_ENCRYPT_PRODUCTION,
};

use super::helpers::{
    get_bool_entry, get_int_entry, get_string_args, get_string_entry, has_non_integer,
};

/// Parse the `acme` block
pub fn parse_acme(doc: &KdlDocument) -> Result<AcmeConfig, ConfigError> {
    let config = AcmeConfig {
        directory_url: get_string_entry(doc, "directory")
            .unwrap_or_else(|| LETS_ENCRYPT_PRODUCTION.to_string()),
        account_key: get_string_entry(doc, "account-key")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("acme.account-key"))?,
        contacts: get_string_args(doc, "contact"),
        ca_root: get_string_entry(doc, "ca-root"),
        trust_store_dir: get_string_entry(doc, "trust-store-dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TRUST_STORE_DIR)),
    };

    trace!(
        directory = %config.directory_url,
        contacts = config.contacts.len(),
        has_ca_root = config.ca_root.is_some(),
        "Parsed acme block"
    );
    Ok(config)
}

/// Parse the `install` block
pub fn parse_install(doc: &KdlDocument) -> Result<InstallConfig, ConfigError> {
    Ok(InstallConfig {
        dir: get_string_entry(doc, "dir")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("install.dir"))?,
        owner: get_string_entry(doc, "owner"),
        group: get_string_entry(doc, "group"),
    })
}

/// Parse the `renewal` block, falling back to defaults per setting
pub fn parse_renewal(doc: &KdlDocument) -> Result<RenewalConfig, ConfigError> {
    let defaults = RenewalConfig::default();

    Ok(RenewalConfig {
        threshold_days: int_setting(doc, "threshold-days", "renewal.threshold-days")?
            .unwrap_or(defaults.threshold_days),
        force: get_bool_entry(doc, "force").unwrap_or(defaults.force),
        poll_initial_secs: int_setting(doc, "poll-initial-secs", "renewal.poll-initial-secs")?
            .unwrap_or(defaults.poll_initial_secs),
        poll_max_secs: int_setting(doc, "poll-max-secs", "renewal.poll-max-secs")?
            .unwrap_or(defaults.poll_max_secs),
        validation_timeout_secs: int_setting(
            doc,
            "validation-timeout-secs",
            "renewal.validation-timeout-secs",
        )?
        .unwrap_or(defaults.validation_timeout_secs),
        finalization_timeout_secs: int_setting(
            doc,
            "finalization-timeout-secs",
            "renewal.finalization-timeout-secs",
        )?
        .unwrap_or(defaults.finalization_timeout_secs),
        run_timeout_secs: int_setting(doc, "run-timeout-secs", "renewal.run-timeout-secs")?
            .unwrap_or(defaults.run_timeout_secs),
    })
}

/// Parse the `reload` block
pub fn parse_reload(doc: &KdlDocument) -> Result<ReloadConfig, ConfigError> {
    Ok(ReloadConfig {
        service: get_string_entry(doc, "service"),
    })
}

/// Read a non-negative integer setting that fits into `T`
fn int_setting<T: TryFrom<i128>>(
    doc: &KdlDocument,
    name: &str,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    if has_non_integer(doc, name) {
        return Err(ConfigError::Invalid {
            key,
            reason: "expected an integer".to_string(),
        });
    }

    match get_int_entry(doc, name) {
        None => Ok(None),
        Some(value) => T::try_from(value).map(Some).map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("{} is out of range", value),
        }),
    }
}
