//! Azure DNS challenge records
//!
//! Azure addresses record sets relative to their zone, so challenge names are
//! rewritten from FQDNs before every call.

use crate::provider::{
    challenge_record_fqdn, relative_record_name, trim_trailing_dot, DnsProvider, DnsProviderError,
    DnsResult, ACCESS_TEST_LABEL, ACCESS_TEST_VALUE, CHALLENGE_TTL,
};
use async_trait::async_trait;
use cm_common::CertificateRequest;
use serde::Deserialize;
use serde_json::json;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const MANAGEMENT_BASE: &str = "https://management.azure.com";
const LOGIN_BASE: &str = "https://login.microsoftonline.com";
const DNS_API_VERSION: &str = "2018-05-01";

/// Secret key holding the service principal JSON
pub const SERVICE_PRINCIPAL_KEY: &str = "osServicePrincipal.json";

/// Service principal credentials as stored in the credentials secret
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePrincipal {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub subscription_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureZone {
    pub name: String,
    pub private: bool,
}

/// The Azure DNS calls the provider needs
#[async_trait]
pub trait AzureDnsApi: Send + Sync + Debug {
    /// `None` when the zone does not exist in the resource group
    async fn get_zone(&self, resource_group: &str, zone: &str) -> DnsResult<Option<AzureZone>>;

    /// Create or replace a TXT record set
    async fn put_txt_record(
        &self,
        resource_group: &str,
        zone: &str,
        relative_name: &str,
        ttl: u32,
        values: &[String],
    ) -> DnsResult<()>;

    /// Delete a TXT record set, succeeding if it does not exist
    async fn delete_txt_record(
        &self,
        resource_group: &str,
        zone: &str,
        relative_name: &str,
    ) -> DnsResult<()>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct ZoneResponse {
    name: String,
    #[serde(default)]
    properties: ZoneProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZoneProperties {
    #[serde(default)]
    zone_type: Option<String>,
}

/// [`AzureDnsApi`] over the Azure Resource Manager REST API
#[derive(Debug)]
pub struct AzureRestClient {
    http: reqwest::Client,
    principal: ServicePrincipal,
    token: Mutex<Option<(String, Instant)>>,
}

impl AzureRestClient {
    pub fn new(principal: ServicePrincipal) -> Self {
        Self {
            http: reqwest::Client::new(),
            principal,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> DnsResult<String> {
        let mut cached = self.token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", &self.principal.client_id)
            .append_pair("client_secret", &self.principal.client_secret)
            .append_pair("scope", "https://management.azure.com/.default")
            .finish();

        let url = format!("{}/{}/oauth2/v2.0/token", LOGIN_BASE, self.principal.tenant_id);
        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| DnsProviderError::Credentials(format!("Token request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(DnsProviderError::Credentials(format!(
                "Token request rejected ({}): {}",
                status, text
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| DnsProviderError::Credentials(format!("Invalid token response: {}", e)))?;

        // Refresh a minute early
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some((token.access_token.clone(), Instant::now() + lifetime));
        Ok(token.access_token)
    }

    fn zone_url(&self, resource_group: &str, zone: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/dnsZones/{}",
            MANAGEMENT_BASE, self.principal.subscription_id, resource_group, zone
        )
    }

    fn txt_url(&self, resource_group: &str, zone: &str, relative_name: &str) -> String {
        format!(
            "{}/TXT/{}?api-version={}",
            self.zone_url(resource_group, zone),
            relative_name,
            DNS_API_VERSION
        )
    }
}

async fn api_error(context: &str, resp: reqwest::Response) -> DnsProviderError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    DnsProviderError::ApiRequest(format!("{} ({}): {}", context, status, text))
}

#[async_trait]
impl AzureDnsApi for AzureRestClient {
    async fn get_zone(&self, resource_group: &str, zone: &str) -> DnsResult<Option<AzureZone>> {
        let token = self.access_token().await?;
        let url = format!(
            "{}?api-version={}",
            self.zone_url(resource_group, zone),
            DNS_API_VERSION
        );

        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DnsProviderError::ApiRequest(format!("HTTP request failed: {}", e)))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(api_error("Failed to get zone", resp).await);
        }

        let body: ZoneResponse = resp
            .json()
            .await
            .map_err(|e| DnsProviderError::ApiRequest(format!("Failed to parse zone: {}", e)))?;

        Ok(Some(AzureZone {
            name: body.name,
            private: body
                .properties
                .zone_type
                .is_some_and(|t| t.eq_ignore_ascii_case("private")),
        }))
    }

    async fn put_txt_record(
        &self,
        resource_group: &str,
        zone: &str,
        relative_name: &str,
        ttl: u32,
        values: &[String],
    ) -> DnsResult<()> {
        let token = self.access_token().await?;
        let body = json!({
            "properties": {
                "TTL": ttl,
                "TXTRecords": [{ "value": values }],
            }
        });

        let resp = self
            .http
            .put(self.txt_url(resource_group, zone, relative_name))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| DnsProviderError::ApiRequest(format!("HTTP request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(api_error("Failed to write TXT record", resp).await);
        }
        Ok(())
    }

    async fn delete_txt_record(
        &self,
        resource_group: &str,
        zone: &str,
        relative_name: &str,
    ) -> DnsResult<()> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .delete(self.txt_url(resource_group, zone, relative_name))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DnsProviderError::ApiRequest(format!("HTTP request failed: {}", e)))?;

        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(api_error("Failed to delete TXT record", resp).await)
    }
}

/// DNS provider writing into an Azure DNS zone of one resource group
#[derive(Debug, Clone)]
pub struct AzureDnsProvider {
    api: Arc<dyn AzureDnsApi>,
    resource_group: String,
}

impl AzureDnsProvider {
    pub fn new(api: Arc<dyn AzureDnsApi>, resource_group: impl Into<String>) -> Self {
        Self {
            api,
            resource_group: resource_group.into(),
        }
    }

    async fn public_zone(&self, base_domain: &str) -> DnsResult<Option<AzureZone>> {
        let zone = self
            .api
            .get_zone(&self.resource_group, trim_trailing_dot(base_domain))
            .await?;
        Ok(zone.filter(|z| !z.private))
    }

    async fn zone_for(&self, request: &CertificateRequest) -> DnsResult<AzureZone> {
        self.public_zone(&request.acme_dns_domain)
            .await?
            .ok_or_else(|| DnsProviderError::ZoneNotFound {
                zone: request.acme_dns_domain.clone(),
            })
    }
}

/// Zone-relative challenge record name for a DNS name
fn challenge_record_name(domain: &str, zone: &str) -> DnsResult<String> {
    relative_record_name(&challenge_record_fqdn(domain), zone).ok_or_else(|| {
        DnsProviderError::Configuration(format!("{} is not inside zone {}", domain, zone))
    })
}

#[async_trait]
impl DnsProvider for AzureDnsProvider {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn answer_challenge(
        &self,
        key_authorization: &str,
        domain: &str,
        request: &CertificateRequest,
    ) -> DnsResult<String> {
        let zone = self.zone_for(request).await?;
        let fqdn = challenge_record_fqdn(domain);
        let relative = challenge_record_name(domain, &zone.name)?;

        // Azure quotes TXT values itself
        self.api
            .put_txt_record(
                &self.resource_group,
                &zone.name,
                &relative,
                CHALLENGE_TTL,
                &[key_authorization.to_string()],
            )
            .await
            .map_err(|e| DnsProviderError::WriteFailure {
                record_name: fqdn.clone(),
                message: e.to_string(),
            })?;

        info!(fqdn = %fqdn, record = %relative, zone = %zone.name, "Azure challenge record written");
        Ok(fqdn)
    }

    async fn validate_write_access(&self, request: &CertificateRequest) -> DnsResult<bool> {
        let Some(zone) = self.public_zone(&request.acme_dns_domain).await? else {
            warn!(zone = %request.acme_dns_domain, "No public Azure zone, write access denied");
            return Ok(false);
        };

        self.api
            .put_txt_record(
                &self.resource_group,
                &zone.name,
                ACCESS_TEST_LABEL,
                CHALLENGE_TTL,
                &[ACCESS_TEST_VALUE.to_string()],
            )
            .await?;
        self.api
            .delete_txt_record(&self.resource_group, &zone.name, ACCESS_TEST_LABEL)
            .await?;

        debug!(zone = %zone.name, "Azure write access confirmed");
        Ok(true)
    }

    async fn delete_challenge_records(&self, request: &CertificateRequest) -> DnsResult<()> {
        let zone = self.zone_for(request).await?;

        for name in &request.dns_names {
            let relative = match challenge_record_name(name, &zone.name) {
                Ok(relative) => relative,
                Err(e) => {
                    warn!(domain = %name, error = %e, "Skipping challenge record cleanup");
                    continue;
                }
            };
            match self
                .api
                .delete_txt_record(&self.resource_group, &zone.name, &relative)
                .await
            {
                Ok(()) => info!(record = %relative, "Azure challenge record deleted"),
                Err(e) => warn!(record = %relative, error = %e, "Failed to delete challenge record"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_common::types::MockPlatform;
    use cm_common::{Platform, SecretRef};
    use parking_lot::Mutex as SyncMutex;
    use std::collections::BTreeMap;

    #[derive(Debug, Default)]
    struct FakeAzure {
        zones: Vec<(String, String, bool)>,
        records: SyncMutex<BTreeMap<String, Vec<String>>>,
    }

    #[async_trait]
    impl AzureDnsApi for FakeAzure {
        async fn get_zone(&self, resource_group: &str, zone: &str) -> DnsResult<Option<AzureZone>> {
            Ok(self
                .zones
                .iter()
                .find(|(rg, name, _)| rg == resource_group && name == zone)
                .map(|(_, name, private)| AzureZone {
                    name: name.clone(),
                    private: *private,
                }))
        }

        async fn put_txt_record(
            &self,
            _resource_group: &str,
            zone: &str,
            relative_name: &str,
            _ttl: u32,
            values: &[String],
        ) -> DnsResult<()> {
            self.records
                .lock()
                .insert(format!("{}|{}", zone, relative_name), values.to_vec());
            Ok(())
        }

        async fn delete_txt_record(
            &self,
            _resource_group: &str,
            zone: &str,
            relative_name: &str,
        ) -> DnsResult<()> {
            self.records
                .lock()
                .remove(&format!("{}|{}", zone, relative_name));
            Ok(())
        }
    }

    fn fake(private: bool) -> Arc<FakeAzure> {
        Arc::new(FakeAzure {
            zones: vec![("rg".into(), "example.com".into(), private)],
            records: SyncMutex::new(BTreeMap::new()),
        })
    }

    fn request(dns_names: &[&str]) -> CertificateRequest {
        CertificateRequest {
            name: "test".into(),
            namespace: "ns".into(),
            acme_dns_domain: "example.com.".into(),
            dns_names: dns_names.iter().map(|s| s.to_string()).collect(),
            email: "a@b.com".into(),
            reissue_before_days: 0,
            platform: Platform::Mock(MockPlatform::default()),
            certificate_secret: SecretRef::new("tls"),
        }
    }

    #[tokio::test]
    async fn test_wildcard_uses_relative_name() {
        let api = fake(false);
        let provider = AzureDnsProvider::new(api.clone(), "rg");
        let req = request(&["*.apps.example.com"]);

        let fqdn = provider
            .answer_challenge("token", "*.apps.example.com", &req)
            .await
            .unwrap();

        assert_eq!(fqdn, "_acme-challenge.apps.example.com");
        let records = api.records.lock();
        assert_eq!(
            records.get("example.com|_acme-challenge.apps"),
            Some(&vec!["token".to_string()])
        );
    }

    #[tokio::test]
    async fn test_answer_is_idempotent() {
        let api = fake(false);
        let provider = AzureDnsProvider::new(api.clone(), "rg");
        let req = request(&["api.example.com"]);

        provider.answer_challenge("a", "api.example.com", &req).await.unwrap();
        provider.answer_challenge("b", "api.example.com", &req).await.unwrap();

        let records = api.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records.get("example.com|_acme-challenge.api"),
            Some(&vec!["b".to_string()])
        );
    }

    #[tokio::test]
    async fn test_private_zone() {
        let provider = AzureDnsProvider::new(fake(true), "rg");
        let req = request(&["api.example.com"]);

        assert!(!provider.validate_write_access(&req).await.unwrap());
        assert!(matches!(
            provider.delete_challenge_records(&req).await,
            Err(DnsProviderError::ZoneNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_validate_and_delete() {
        let api = fake(false);
        let provider = AzureDnsProvider::new(api.clone(), "rg");
        let req = request(&["api.example.com", "example.com", "other.org"]);

        assert!(provider.validate_write_access(&req).await.unwrap());
        assert!(api.records.lock().is_empty());

        provider.answer_challenge("a", "api.example.com", &req).await.unwrap();
        provider.answer_challenge("b", "example.com", &req).await.unwrap();
        assert!(api.records.lock().contains_key("example.com|_acme-challenge"));

        // other.org lies outside the zone and is skipped
        provider.delete_challenge_records(&req).await.unwrap();
        assert!(api.records.lock().is_empty());
    }

    #[test]
    fn test_service_principal_json() {
        let principal: ServicePrincipal = serde_json::from_str(
            r#"{"clientId":"c","clientSecret":"s","tenantId":"t","subscriptionId":"sub"}"#,
        )
        .unwrap();
        assert_eq!(principal.tenant_id, "t");
        assert_eq!(principal.subscription_id, "sub");
    }
}
