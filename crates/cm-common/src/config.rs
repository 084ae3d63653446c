use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Process configuration loaded from environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertmanConfig {
    /// Namespace used when a request or secret reference does not name one
    pub operator_namespace: String,
    /// Root of the file backed secret store
    pub secrets_dir: PathBuf,
    /// Directory scanned for certificate request manifests
    pub requests_dir: PathBuf,
    /// Directory receiving per-request status files
    pub state_dir: PathBuf,
    /// Secret holding the ACME account
    pub acme_account_secret: String,
    /// FedRAMP clusters write challenges to one fixed Route53 zone
    pub fedramp: bool,
    pub hosted_zone_id: Option<String>,
    pub max_concurrent_reconciles: usize,
    pub max_requeues: u32,
    pub dns_propagation_attempts: u32,
    pub dns_propagation_wait_secs: u64,
    pub dns_max_negative_cache_ttl_secs: u64,
}

impl Default for CertmanConfig {
    fn default() -> Self {
        Self {
            operator_namespace: "certman-operator".to_string(),
            secrets_dir: PathBuf::from("/var/lib/certman/secrets"),
            requests_dir: PathBuf::from("/etc/certman/requests"),
            state_dir: PathBuf::from("/var/lib/certman/state"),
            acme_account_secret: "lets-encrypt-account".to_string(),
            fedramp: false,
            hosted_zone_id: None,
            max_concurrent_reconciles: 10,
            max_requeues: 10,
            dns_propagation_attempts: 10,
            dns_propagation_wait_secs: 60,
            dns_max_negative_cache_ttl_secs: 600,
        }
    }
}

impl CertmanConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup, unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("OPERATOR_NAMESPACE") {
            config.operator_namespace = v;
        }
        if let Some(v) = lookup("SECRETS_DIR") {
            config.secrets_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("REQUESTS_DIR") {
            config.requests_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("STATE_DIR") {
            config.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ACME_ACCOUNT_SECRET") {
            config.acme_account_secret = v;
        }
        if let Some(v) = lookup("FEDRAMP") {
            config.fedramp = parse_bool(&v);
        }
        if let Some(v) = lookup("HOSTED_ZONE_ID") {
            if !v.trim().is_empty() {
                config.hosted_zone_id = Some(v.trim().to_string());
            }
        }
        if let Some(v) = lookup("MAX_CONCURRENT_RECONCILES").and_then(|v| v.parse().ok()) {
            config.max_concurrent_reconciles = v;
        }
        if let Some(v) = lookup("MAX_REQUEUES").and_then(|v| v.parse().ok()) {
            config.max_requeues = v;
        }
        if let Some(v) = lookup("DNS_PROPAGATION_ATTEMPTS").and_then(|v| v.parse().ok()) {
            config.dns_propagation_attempts = v;
        }
        if let Some(v) = lookup("DNS_PROPAGATION_WAIT_SECS").and_then(|v| v.parse().ok()) {
            config.dns_propagation_wait_secs = v;
        }
        if let Some(v) = lookup("DNS_MAX_NEGATIVE_CACHE_TTL_SECS").and_then(|v| v.parse().ok()) {
            config.dns_max_negative_cache_ttl_secs = v;
        }

        config
    }

    /// Load the .env file, then the environment variables
    pub fn load(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            load_dotenv(path);
        } else {
            let candidates = [PathBuf::from("/etc/certman/.env"), PathBuf::from(".env")];
            for candidate in &candidates {
                if candidate.exists() {
                    load_dotenv(candidate);
                    break;
                }
            }
        }

        Self::from_env()
    }

    /// Reject combinations the issuance core cannot run with
    pub fn validate(&self) -> Result<(), AppError> {
        if self.fedramp && self.hosted_zone_id.is_none() {
            return Err(AppError::Config(
                "FEDRAMP is enabled but HOSTED_ZONE_ID is not set".into(),
            ));
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(AppError::Config(
                "MAX_CONCURRENT_RECONCILES must be at least 1".into(),
            ));
        }
        if self.dns_propagation_attempts == 0 {
            return Err(AppError::Config(
                "DNS_PROPAGATION_ATTEMPTS must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Route53 zone to pin challenge records to, only in FedRAMP mode
    pub fn fedramp_hosted_zone(&self) -> Option<&str> {
        if self.fedramp {
            self.hosted_zone_id.as_deref()
        } else {
            None
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Load a basic .env file (one KEY=VALUE per line)
fn load_dotenv(path: &Path) {
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    // SAFETY: called before the runtime spawns worker threads
                    unsafe { std::env::set_var(key, value) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CertmanConfig::from_lookup(|_| None);
        assert_eq!(config.operator_namespace, "certman-operator");
        assert_eq!(config.max_concurrent_reconciles, 10);
        assert_eq!(config.dns_propagation_attempts, 10);
        assert_eq!(config.dns_max_negative_cache_ttl_secs, 600);
        assert!(config.validate().is_ok());
        assert_eq!(config.fedramp_hosted_zone(), None);
    }

    #[test]
    fn test_overrides_and_invalid_numbers() {
        let config = CertmanConfig::from_lookup(lookup_from(&[
            ("OPERATOR_NAMESPACE", "ops"),
            ("MAX_CONCURRENT_RECONCILES", "4"),
            ("DNS_PROPAGATION_WAIT_SECS", "not-a-number"),
            ("SECRETS_DIR", "/tmp/secrets"),
        ]));
        assert_eq!(config.operator_namespace, "ops");
        assert_eq!(config.max_concurrent_reconciles, 4);
        assert_eq!(config.dns_propagation_wait_secs, 60);
        assert_eq!(config.secrets_dir, PathBuf::from("/tmp/secrets"));
    }

    #[test]
    fn test_fedramp_requires_zone() {
        let config = CertmanConfig::from_lookup(lookup_from(&[("FEDRAMP", "true")]));
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        let config = CertmanConfig::from_lookup(lookup_from(&[
            ("FEDRAMP", "1"),
            ("HOSTED_ZONE_ID", "Z123"),
        ]));
        assert!(config.validate().is_ok());
        assert_eq!(config.fedramp_hosted_zone(), Some("Z123"));
    }

    #[test]
    fn test_zone_ignored_outside_fedramp() {
        let config = CertmanConfig::from_lookup(lookup_from(&[("HOSTED_ZONE_ID", "Z123")]));
        assert_eq!(config.fedramp_hosted_zone(), None);
    }
}
