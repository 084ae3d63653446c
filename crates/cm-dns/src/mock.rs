//! In-memory DNS provider with failure injection
//!
//! The provider also answers TXT lookups from its own zones, so it can stand
//! in for the public resolvers of the propagation check.

use crate::propagation::{DnsAnswer, DnsQueryResponse, TxtResolver, RCODE_NAME_ERROR};
use crate::provider::{
    access_test_fqdn, challenge_record_fqdn, quote_txt, trim_trailing_dot, DnsProvider,
    DnsProviderError, DnsResult, ACCESS_TEST_VALUE, CHALLENGE_TTL,
};
use async_trait::async_trait;
use cm_common::types::MockPlatform;
use cm_common::CertificateRequest;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Default)]
struct MockZone {
    private: bool,
    /// Lowercased record name to TXT values
    records: BTreeMap<String, Vec<String>>,
}

/// In-memory zones standing in for a cloud DNS service.
///
/// Without explicit zones every requested base domain resolves to a public
/// zone created on first use.
#[derive(Debug, Default)]
pub struct MockDnsProvider {
    options: MockPlatform,
    zones: Mutex<HashMap<String, MockZone>>,
    strict_zones: bool,
}

impl MockDnsProvider {
    pub fn new() -> Self {
        Self::from_platform(MockPlatform::default())
    }

    pub fn from_platform(options: MockPlatform) -> Self {
        Self {
            options,
            zones: Mutex::new(HashMap::new()),
            strict_zones: false,
        }
    }

    /// Register a zone; once any zone is registered, unknown zones are not found
    pub fn with_zone(self, name: &str, private: bool) -> Self {
        self.zones.lock().insert(
            zone_key(name),
            MockZone {
                private,
                records: BTreeMap::new(),
            },
        );
        Self {
            strict_zones: true,
            ..self
        }
    }

    /// Current TXT values of a record
    pub fn txt_records(&self, fqdn: &str) -> Vec<String> {
        let key = zone_key(fqdn);
        self.zones
            .lock()
            .values()
            .find_map(|zone| zone.records.get(&key).cloned())
            .unwrap_or_default()
    }

    /// Number of records across all zones
    pub fn record_count(&self) -> usize {
        self.zones
            .lock()
            .values()
            .map(|zone| zone.records.len())
            .sum()
    }

    /// Run `f` against the public zone named `zone`
    fn with_public_zone<T>(
        &self,
        zone: &str,
        f: impl FnOnce(&mut MockZone) -> T,
    ) -> DnsResult<T> {
        let mut zones = self.zones.lock();
        let key = zone_key(zone);
        if !self.strict_zones {
            zones.entry(key.clone()).or_default();
        }
        match zones.get_mut(&key) {
            Some(found) if !found.private => Ok(f(found)),
            _ => Err(DnsProviderError::ZoneNotFound {
                zone: zone.to_string(),
            }),
        }
    }
}

fn zone_key(name: &str) -> String {
    trim_trailing_dot(name).to_ascii_lowercase()
}

#[async_trait]
impl DnsProvider for MockDnsProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn answer_challenge(
        &self,
        key_authorization: &str,
        domain: &str,
        request: &CertificateRequest,
    ) -> DnsResult<String> {
        let fqdn = challenge_record_fqdn(domain);
        if let Some(message) = &self.options.answer_challenge_error {
            return Err(DnsProviderError::WriteFailure {
                record_name: fqdn,
                message: message.clone(),
            });
        }

        self.with_public_zone(&request.acme_dns_domain, |zone| {
            zone.records
                .insert(zone_key(&fqdn), vec![quote_txt(key_authorization)]);
        })?;

        debug!(fqdn = %fqdn, "Mock challenge record written");
        Ok(fqdn)
    }

    async fn validate_write_access(&self, request: &CertificateRequest) -> DnsResult<bool> {
        if let Some(message) = &self.options.validate_write_access_error {
            return Err(DnsProviderError::ApiRequest(message.clone()));
        }
        if !self.options.validate_write_access {
            return Ok(false);
        }

        let probe = zone_key(&access_test_fqdn(&request.acme_dns_domain));
        let written = self.with_public_zone(&request.acme_dns_domain, |zone| {
            zone.records
                .insert(probe.clone(), vec![quote_txt(ACCESS_TEST_VALUE)]);
            zone.records.remove(&probe);
        });

        Ok(written.is_ok())
    }

    async fn delete_challenge_records(&self, request: &CertificateRequest) -> DnsResult<()> {
        if let Some(message) = &self.options.delete_records_error {
            return Err(DnsProviderError::ApiRequest(message.clone()));
        }

        self.with_public_zone(&request.acme_dns_domain, |zone| {
            for name in &request.dns_names {
                zone.records.remove(&zone_key(&challenge_record_fqdn(name)));
            }
        })
    }
}

#[async_trait]
impl TxtResolver for MockDnsProvider {
    async fn query_txt(&self, fqdn: &str) -> DnsResult<DnsQueryResponse> {
        let values = self.txt_records(fqdn);
        if values.is_empty() {
            return Ok(DnsQueryResponse {
                status: RCODE_NAME_ERROR,
                ..DnsQueryResponse::default()
            });
        }

        let name = format!("{}.", trim_trailing_dot(fqdn));
        Ok(DnsQueryResponse {
            answer: values
                .into_iter()
                .map(|data| DnsAnswer {
                    name: name.clone(),
                    record_type: 16,
                    ttl: u64::from(CHALLENGE_TTL),
                    data,
                })
                .collect(),
            ..DnsQueryResponse::default()
        })
    }
}
