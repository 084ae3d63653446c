//! DNS propagation checking for DNS-01 challenges
//!
//! Polls public DNS-over-HTTPS resolvers until the challenge TXT record is
//! visible. A negative answer carrying an SOA TTL stretches the next wait to
//! that TTL, and a TTL beyond the configured cap ends the check early.

use crate::provider::{same_name, unquote_txt, DnsProviderError, DnsResult};
use async_trait::async_trait;
use cm_common::CertmanConfig;
use serde::Deserialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cloudflare JSON API, queried first
pub const CLOUDFLARE_DOH: &str = "https://cloudflare-dns.com/dns-query";
/// Google JSON API, used when the primary fails
pub const GOOGLE_DOH: &str = "https://dns.google/resolve";

const DOH_TIMEOUT: Duration = Duration::from_secs(60);

/// NXDOMAIN response code
pub const RCODE_NAME_ERROR: u32 = 3;

/// Configuration for propagation checking
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Number of resolver queries before giving up
    pub max_attempts: u32,
    /// Default pause between two queries
    pub wait: Duration,
    /// Added to a negative cache TTL before waiting on it
    pub negative_cache_margin: Duration,
    /// Negative cache TTLs above this abandon the check
    pub max_negative_cache_ttl: Duration,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            wait: Duration::from_secs(60),
            negative_cache_margin: Duration::from_secs(5),
            max_negative_cache_ttl: Duration::from_secs(600),
        }
    }
}

impl From<&CertmanConfig> for PropagationConfig {
    fn from(config: &CertmanConfig) -> Self {
        Self {
            max_attempts: config.dns_propagation_attempts,
            wait: Duration::from_secs(config.dns_propagation_wait_secs),
            max_negative_cache_ttl: Duration::from_secs(config.dns_max_negative_cache_ttl_secs),
            ..Self::default()
        }
    }
}

/// JSON answer of a DNS-over-HTTPS query
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DnsQueryResponse {
    #[serde(rename = "Status")]
    pub status: u32,
    #[serde(rename = "TC", default)]
    pub truncated: bool,
    #[serde(rename = "Answer", default)]
    pub answer: Vec<DnsAnswer>,
    #[serde(rename = "Authority", default)]
    pub authority: Vec<DnsAnswer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DnsAnswer {
    pub name: String,
    #[serde(rename = "type", default)]
    pub record_type: u16,
    #[serde(rename = "TTL", default)]
    pub ttl: u64,
    #[serde(default)]
    pub data: String,
}

impl DnsQueryResponse {
    /// TTL of the SOA record attached to an NXDOMAIN answer
    pub fn negative_cache_ttl(&self) -> Option<u64> {
        if self.status != RCODE_NAME_ERROR {
            return None;
        }
        self.authority.first().map(|soa| soa.ttl)
    }

    /// Whether an answer carries `expected` for `fqdn`
    pub fn contains(&self, fqdn: &str, expected: &str) -> bool {
        self.answer
            .iter()
            .any(|a| same_name(&a.name, fqdn) && unquote_txt(&a.data) == expected)
    }
}

/// Source of TXT lookups for the verifier
#[async_trait]
pub trait TxtResolver: Send + Sync + Debug {
    async fn query_txt(&self, fqdn: &str) -> DnsResult<DnsQueryResponse>;
}

/// DNS-over-HTTPS resolver trying each endpoint in turn
#[derive(Debug, Clone)]
pub struct DohResolver {
    http: reqwest::Client,
    endpoints: Vec<String>,
}

impl DohResolver {
    /// Cloudflare with Google as fallback
    pub fn new() -> DnsResult<Self> {
        Self::with_endpoints(vec![CLOUDFLARE_DOH.to_string(), GOOGLE_DOH.to_string()])
    }

    pub fn with_endpoints(endpoints: Vec<String>) -> DnsResult<Self> {
        if endpoints.is_empty() {
            return Err(DnsProviderError::Configuration(
                "At least one DNS-over-HTTPS endpoint is required".into(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(DOH_TIMEOUT)
            .build()
            .map_err(|e| DnsProviderError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { http, endpoints })
    }

    async fn query_endpoint(&self, endpoint: &str, fqdn: &str) -> DnsResult<DnsQueryResponse> {
        let resp = self
            .http
            .get(endpoint)
            .query(&[("name", fqdn), ("type", "TXT")])
            .header("accept", "application/dns-json")
            .send()
            .await
            .map_err(|e| DnsProviderError::ApiRequest(format!("DoH query failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(DnsProviderError::ApiRequest(format!(
                "DoH query returned {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| DnsProviderError::ApiRequest(format!("Invalid DoH response: {}", e)))
    }
}

#[async_trait]
impl TxtResolver for DohResolver {
    async fn query_txt(&self, fqdn: &str) -> DnsResult<DnsQueryResponse> {
        let mut last_error = None;
        for endpoint in &self.endpoints {
            match self.query_endpoint(endpoint, fqdn).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    warn!(endpoint = %endpoint, fqdn = %fqdn, error = %e, "DoH resolver failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            DnsProviderError::Configuration("No DNS-over-HTTPS endpoint configured".into())
        }))
    }
}

/// What to do before a propagation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Now,
    Wait(Duration),
    GiveUp,
}

/// Pause before `attempt` (1-based) given the negative cache TTL of the previous answer
pub fn wait_before_attempt(
    attempt: u32,
    negative_cache_ttl: Option<u64>,
    config: &PropagationConfig,
) -> Backoff {
    if attempt <= 1 {
        return Backoff::Now;
    }
    match negative_cache_ttl {
        Some(ttl) => {
            let ttl = Duration::from_secs(ttl) + config.negative_cache_margin;
            if ttl > config.max_negative_cache_ttl {
                Backoff::GiveUp
            } else {
                Backoff::Wait(ttl.max(config.wait))
            }
        }
        None => Backoff::Wait(config.wait),
    }
}

/// Confirms challenge records are publicly resolvable
#[derive(Debug, Clone)]
pub struct PropagationVerifier {
    resolver: Arc<dyn TxtResolver>,
    config: PropagationConfig,
}

impl PropagationVerifier {
    pub fn new(resolver: Arc<dyn TxtResolver>, config: PropagationConfig) -> Self {
        Self { resolver, config }
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// `true` once a resolver returns `expected` for `fqdn`, `false` after the attempts run out
    pub async fn verify(&self, fqdn: &str, expected: &str) -> bool {
        let mut negative_cache_ttl = None;

        for attempt in 1..=self.config.max_attempts {
            match wait_before_attempt(attempt, negative_cache_ttl, &self.config) {
                Backoff::Now => {}
                Backoff::Wait(pause) => {
                    debug!(fqdn = %fqdn, attempt, pause_secs = pause.as_secs(), "Waiting before DNS check");
                    tokio::time::sleep(pause).await;
                }
                Backoff::GiveUp => {
                    warn!(
                        fqdn = %fqdn,
                        ttl = ?negative_cache_ttl,
                        "Negative cache TTL exceeds the maximum wait, giving up"
                    );
                    return false;
                }
            }

            negative_cache_ttl = None;
            match self.resolver.query_txt(fqdn).await {
                Ok(resp) if resp.contains(fqdn, expected) => {
                    info!(fqdn = %fqdn, attempt, "Challenge record propagated");
                    return true;
                }
                Ok(resp) => {
                    negative_cache_ttl = resp.negative_cache_ttl();
                    debug!(
                        fqdn = %fqdn,
                        attempt,
                        status = resp.status,
                        answers = resp.answer.len(),
                        "Challenge record not visible yet"
                    );
                }
                Err(e) => {
                    warn!(fqdn = %fqdn, attempt, error = %e, "DNS check failed");
                }
            }
        }

        warn!(
            fqdn = %fqdn,
            attempts = self.config.max_attempts,
            "Challenge record did not propagate"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays scripted responses, then repeats the fallback
    #[derive(Debug)]
    struct ScriptedResolver {
        script: Mutex<VecDeque<DnsResult<DnsQueryResponse>>>,
        fallback: DnsQueryResponse,
        calls: AtomicU32,
    }

    impl ScriptedResolver {
        fn new(script: Vec<DnsResult<DnsQueryResponse>>, fallback: DnsQueryResponse) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl TxtResolver for ScriptedResolver {
        async fn query_txt(&self, _fqdn: &str) -> DnsResult<DnsQueryResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    fn fast_config() -> PropagationConfig {
        PropagationConfig {
            wait: Duration::ZERO,
            negative_cache_margin: Duration::ZERO,
            ..PropagationConfig::default()
        }
    }

    fn empty() -> DnsQueryResponse {
        DnsQueryResponse::default()
    }

    fn answer(name: &str, data: &str) -> DnsQueryResponse {
        DnsQueryResponse {
            answer: vec![DnsAnswer {
                name: name.into(),
                record_type: 16,
                ttl: 60,
                data: data.into(),
            }],
            ..DnsQueryResponse::default()
        }
    }

    fn nxdomain(ttl: u64) -> DnsQueryResponse {
        DnsQueryResponse {
            status: RCODE_NAME_ERROR,
            authority: vec![DnsAnswer {
                name: "example.com.".into(),
                record_type: 6,
                ttl,
                data: "ns.example.com. hostmaster.example.com. 1 7200 900 1209600 86400".into(),
            }],
            ..DnsQueryResponse::default()
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let resolver = Arc::new(ScriptedResolver::new(vec![], empty()));
        let verifier = PropagationVerifier::new(resolver.clone(), fast_config());

        assert!(!verifier.verify("_acme-challenge.example.com", "v").await);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let resolver = Arc::new(ScriptedResolver::new(
            vec![
                Ok(empty()),
                Err(DnsProviderError::ApiRequest("timeout".into())),
                Ok(answer("_ACME-challenge.example.com.", "\"token\"")),
            ],
            empty(),
        ));
        let verifier = PropagationVerifier::new(resolver.clone(), fast_config());

        assert!(verifier.verify("_acme-challenge.example.com", "token").await);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_mismatched_value_keeps_polling() {
        let resolver = Arc::new(ScriptedResolver::new(
            vec![],
            answer("_acme-challenge.example.com.", "\"stale\""),
        ));
        let config = PropagationConfig {
            max_attempts: 4,
            ..fast_config()
        };
        let verifier = PropagationVerifier::new(resolver.clone(), config);

        assert!(!verifier.verify("_acme-challenge.example.com", "fresh").await);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_long_negative_cache_abandons_early() {
        let resolver = Arc::new(ScriptedResolver::new(vec![Ok(nxdomain(3600))], empty()));
        let verifier = PropagationVerifier::new(resolver.clone(), fast_config());

        assert!(!verifier.verify("_acme-challenge.example.com", "v").await);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_before_attempt() {
        let config = PropagationConfig::default();

        assert_eq!(wait_before_attempt(1, None, &config), Backoff::Now);
        assert_eq!(
            wait_before_attempt(2, None, &config),
            Backoff::Wait(Duration::from_secs(60))
        );
        // Short negative TTLs never shorten the default wait
        assert_eq!(
            wait_before_attempt(2, Some(10), &config),
            Backoff::Wait(Duration::from_secs(60))
        );
        assert_eq!(
            wait_before_attempt(3, Some(300), &config),
            Backoff::Wait(Duration::from_secs(305))
        );
        assert_eq!(
            wait_before_attempt(3, Some(595), &config),
            Backoff::Wait(Duration::from_secs(600))
        );
        assert_eq!(wait_before_attempt(3, Some(596), &config), Backoff::GiveUp);
    }

    #[test]
    fn test_negative_cache_detection() {
        assert_eq!(nxdomain(900).negative_cache_ttl(), Some(900));
        assert_eq!(empty().negative_cache_ttl(), None);

        let no_soa = DnsQueryResponse {
            status: RCODE_NAME_ERROR,
            ..DnsQueryResponse::default()
        };
        assert_eq!(no_soa.negative_cache_ttl(), None);
    }

    #[test]
    fn test_parse_doh_json() {
        let body = r#"{
            "Status": 0, "TC": false, "RD": true, "RA": true, "AD": false, "CD": false,
            "Question": [{"name": "_acme-challenge.example.com", "type": 16}],
            "Answer": [{"name": "_acme-challenge.example.com.", "type": 16, "TTL": 60,
                        "data": "\"abc\""}]
        }"#;
        let resp: DnsQueryResponse = serde_json::from_str(body).unwrap();
        assert!(resp.contains("_acme-challenge.example.com", "abc"));
        assert!(!resp.contains("_acme-challenge.example.org", "abc"));
        assert!(!resp.contains("_acme-challenge.example.com", "abd"));
    }

    #[test]
    fn test_config_from_env_settings() {
        let env = CertmanConfig {
            dns_propagation_attempts: 3,
            dns_propagation_wait_secs: 5,
            ..CertmanConfig::default()
        };
        let config = PropagationConfig::from(&env);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.wait, Duration::from_secs(5));
        assert_eq!(config.negative_cache_margin, Duration::from_secs(5));
    }
}
