//! DNS provider capability for DNS-01 challenges
//!
//! Every platform hides its own zone lookup, pagination and record naming
//! behind [`DnsProvider`].

use async_trait::async_trait;
use cm_common::{CertificateRequest, SecretError};
use std::fmt::Debug;
use thiserror::Error;

/// Result type for DNS operations
pub type DnsResult<T> = Result<T, DnsProviderError>;

/// Errors that can occur during DNS provider operations
#[derive(Debug, Error)]
pub enum DnsProviderError {
    /// No public zone matches the request's base domain
    #[error("No public zone found for '{zone}'")]
    ZoneNotFound { zone: String },

    /// The upsert of a TXT record failed
    #[error("Failed to write TXT record '{record_name}': {message}")]
    WriteFailure { record_name: String, message: String },

    /// Removing a TXT record failed
    #[error("Failed to delete TXT record '{record_name}': {message}")]
    DeleteFailure { record_name: String, message: String },

    /// API request failed
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Credential loading failed
    #[error("Failed to load credentials: {0}")]
    Credentials(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Secret(#[from] SecretError),
}

/// Trait for DNS providers that answer DNS-01 challenges
#[async_trait]
pub trait DnsProvider: Send + Sync + Debug {
    /// Returns the provider name (e.g. "aws", "azure")
    fn name(&self) -> &'static str;

    /// Upsert the challenge TXT record for `domain` and return the FQDN written.
    ///
    /// `key_authorization` is the DNS encoded key authorization. The record is
    /// written quoted with [`CHALLENGE_TTL`] into the public zone matching the
    /// request's ACME DNS domain. Calling this twice leaves one record holding
    /// the latest value.
    async fn answer_challenge(
        &self,
        key_authorization: &str,
        domain: &str,
        request: &CertificateRequest,
    ) -> DnsResult<String>;

    /// Write then delete a throwaway record to prove the credentials can write.
    ///
    /// Returns `Ok(false)` when no public zone is usable.
    async fn validate_write_access(&self, request: &CertificateRequest) -> DnsResult<bool>;

    /// Remove the challenge records of every DNS name in the request.
    ///
    /// Only the zone lookup is fatal. Per-record failures are logged and skipped.
    async fn delete_challenge_records(&self, request: &CertificateRequest) -> DnsResult<()>;
}

/// ACME challenge record label
pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

/// Label of the record written by [`DnsProvider::validate_write_access`]
pub const ACCESS_TEST_LABEL: &str = "_certman_access_test";

/// Value of the write access probe record
pub const ACCESS_TEST_VALUE: &str = "txt_entry";

/// TTL for challenge records (60 seconds)
pub const CHALLENGE_TTL: u32 = 60;

/// Strip a trailing dot, a wildcard label and any leading dot
///
/// `*.apps.example.com.` becomes `apps.example.com`.
pub fn normalize_domain(domain: &str) -> &str {
    let domain = trim_trailing_dot(domain.trim());
    let domain = domain.strip_prefix('*').unwrap_or(domain);
    domain.trim_start_matches('.')
}

/// Build the full challenge record name for a DNS name
///
/// For `*.apps.example.com`, returns `_acme-challenge.apps.example.com`
pub fn challenge_record_fqdn(domain: &str) -> String {
    format!("{}.{}", ACME_CHALLENGE_LABEL, normalize_domain(domain))
}

/// Name of the write access probe record for a zone
pub fn access_test_fqdn(zone: &str) -> String {
    format!("{}.{}", ACCESS_TEST_LABEL, trim_trailing_dot(zone))
}

pub fn trim_trailing_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// Case-insensitive DNS name comparison ignoring the root dot
pub fn same_name(a: &str, b: &str) -> bool {
    trim_trailing_dot(a).eq_ignore_ascii_case(trim_trailing_dot(b))
}

/// TXT values are stored as quoted character strings
pub fn quote_txt(value: &str) -> String {
    format!("\"{}\"", value)
}

pub fn unquote_txt(value: &str) -> &str {
    value.trim_matches('"')
}

/// Name of `fqdn` relative to `zone`, or `None` when it is outside the zone
///
/// `_acme-challenge.apps.example.com` in `example.com` is `_acme-challenge.apps`.
pub fn relative_record_name(fqdn: &str, zone: &str) -> Option<String> {
    let fqdn = trim_trailing_dot(fqdn).to_ascii_lowercase();
    let zone = trim_trailing_dot(zone).to_ascii_lowercase();
    if fqdn == zone {
        return Some("@".to_string());
    }
    fqdn.strip_suffix(&zone)
        .and_then(|prefix| prefix.strip_suffix('.'))
        .filter(|prefix| !prefix.is_empty())
        .map(str::to_string)
}
