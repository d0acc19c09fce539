//! Tenant subdomain rules.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

pub const MIN_SUBDOMAIN_LEN: usize = 3;
pub const MAX_SUBDOMAIN_LEN: usize = 63;

/// Labels that belong to the platform itself.
const RESERVED: &[&str] = &[
    "www", "api", "admin", "app", "mail", "status", "static", "cdn", "auth", "billing",
];

static LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9](?:[a-z0-9-]*[a-z0-9])?$").unwrap());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubdomainError {
    #[error("subdomain must be {MIN_SUBDOMAIN_LEN}-{MAX_SUBDOMAIN_LEN} characters, got {0}")]
    Length(usize),

    #[error("subdomain may only contain lowercase letters, digits and inner hyphens")]
    Charset,

    #[error("subdomain may not contain consecutive hyphens")]
    DoubleHyphen,

    #[error("subdomain '{0}' is reserved")]
    Reserved(String),
}

/// Check that `label` is a usable tenant subdomain.
pub fn validate_subdomain(label: &str) -> Result<(), SubdomainError> {
    let len = label.len();
    if !(MIN_SUBDOMAIN_LEN..=MAX_SUBDOMAIN_LEN).contains(&len) {
        return Err(SubdomainError::Length(len));
    }
    if !LABEL.is_match(label) {
        return Err(SubdomainError::Charset);
    }
    if label.contains("--") {
        return Err(SubdomainError::DoubleHyphen);
    }
    if RESERVED.contains(&label) {
        return Err(SubdomainError::Reserved(label.to_string()));
    }
    Ok(())
}

/// Fully-qualified domain for a tenant subdomain.
pub fn fqdn(subdomain: &str, base_domain: &str) -> String {
    format!("{subdomain}.{}", base_domain.trim_start_matches('.'))
}
