//! KDL configuration parsing.

mod blocks;
pub mod helpers;

use ::kdl::KdlDocument;
use std::path::PathBuf;
use tracing::trace;

use crate::{CertConfig, ConfigError};

use blocks::{parse_acme, parse_install, parse_reload, parse_renewal};
use helpers::{get_block, get_string_args, get_string_entry, has_non_string};

/// Parse a complete configuration document
pub fn parse_config(content: &str) -> Result<CertConfig, ConfigError> {
    let doc: KdlDocument = content
        .parse()
        .map_err(|e: ::kdl::KdlError| ConfigError::Parse(format!("{:?}", miette::Report::new(e))))?;

    trace!(node_count = doc.nodes().len(), "Parsed KDL document");

    for key in ["service", "common-name", "webroot"] {
        if has_non_string(&doc, key) {
            return Err(ConfigError::Invalid {
                key: static_key(key),
                reason: "expected a string".to_string(),
            });
        }
    }

    let service_name = get_string_entry(&doc, "service").ok_or(ConfigError::Missing("service"))?;
    let common_name =
        get_string_entry(&doc, "common-name").ok_or(ConfigError::Missing("common-name"))?;
    let sans = get_string_args(&doc, "sans");
    let webroot = get_string_entry(&doc, "webroot")
        .map(PathBuf::from)
        .ok_or(ConfigError::Missing("webroot"))?;

    let acme = parse_acme(get_block(&doc, "acme").ok_or(ConfigError::Missing("acme"))?)?;
    let install =
        parse_install(get_block(&doc, "install").ok_or(ConfigError::Missing("install"))?)?;
    let renewal = match get_block(&doc, "renewal") {
        Some(block) => parse_renewal(block)?,
        None => Default::default(),
    };
    let reload = match get_block(&doc, "reload") {
        Some(block) => parse_reload(block)?,
        None => Default::default(),
    };

    trace!(
        service = %service_name,
        san_count = sans.len(),
        threshold_days = renewal.threshold_days,
        "Parsed certificate configuration"
    );

    Ok(CertConfig {
        service_name,
        common_name,
        sans,
        webroot,
        acme,
        install,
        renewal,
        reload,
    })
}

fn static_key(key: &str) -> &'static str {
    match key {
        "service" => "service",
        "common-name" => "common-name",
        _ => "webroot",
    }
}
