//! GCP Cloud DNS challenge records

use crate::provider::{
    access_test_fqdn, challenge_record_fqdn, quote_txt, same_name, DnsProvider, DnsProviderError,
    DnsResult, ACCESS_TEST_VALUE, CHALLENGE_TTL,
};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cm_common::CertificateRequest;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CLOUD_DNS_BASE: &str = "https://dns.googleapis.com/dns/v1";
const CLOUD_DNS_SCOPE: &str = "https://www.googleapis.com/auth/ndev.clouddns.readwrite";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Secret key holding the service account JSON
pub const SERVICE_ACCOUNT_KEY: &str = "osServiceAccount.json";

/// Service account key file
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccount {
    pub project_id: String,
    pub private_key_id: String,
    pub private_key: String,
    pub client_email: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedZone {
    pub name: String,
    /// Zone apex with a trailing dot
    pub dns_name: String,
    #[serde(default)]
    pub visibility: Option<String>,
}

impl ManagedZone {
    pub fn is_public(&self) -> bool {
        self.visibility
            .as_deref()
            .is_none_or(|v| v.eq_ignore_ascii_case("public"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedZonePage {
    #[serde(default)]
    pub managed_zones: Vec<ManagedZone>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSet {
    /// Absolute name with a trailing dot
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub ttl: u32,
    #[serde(default)]
    pub rrdatas: Vec<String>,
}

impl RecordSet {
    pub fn txt(fqdn: &str, value: &str) -> Self {
        Self {
            name: absolute(fqdn),
            record_type: "TXT".to_string(),
            ttl: CHALLENGE_TTL,
            rrdatas: vec![quote_txt(value)],
        }
    }
}

/// Atomic set of deletions then additions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordChange {
    pub additions: Vec<RecordSet>,
    pub deletions: Vec<RecordSet>,
}

fn absolute(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// The Cloud DNS calls the provider needs
#[async_trait]
pub trait CloudDnsApi: Send + Sync + Debug {
    async fn list_managed_zones(&self, page_token: Option<String>) -> DnsResult<ManagedZonePage>;

    async fn list_txt_records(&self, zone: &str, fqdn: &str) -> DnsResult<Vec<RecordSet>>;

    async fn apply_change(&self, zone: &str, change: &RecordChange) -> DnsResult<()>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RecordSetList {
    #[serde(default)]
    rrsets: Vec<RecordSet>,
}

/// [`CloudDnsApi`] over the Cloud DNS REST API
#[derive(Debug)]
pub struct GcpRestClient {
    http: reqwest::Client,
    account: ServiceAccount,
    project: String,
    token: Mutex<Option<(String, Instant)>>,
}

impl GcpRestClient {
    /// Client for `project`, defaulting to the service account's own project
    pub fn new(account: ServiceAccount, project: Option<String>) -> Self {
        let project = project.unwrap_or_else(|| account.project_id.clone());
        Self {
            http: reqwest::Client::new(),
            account,
            project,
            token: Mutex::new(None),
        }
    }

    /// RS256 signed assertion for the OAuth2 JWT bearer grant
    fn signed_assertion(&self, issued_at: u64) -> DnsResult<String> {
        let header = json!({
            "alg": "RS256",
            "typ": "JWT",
            "kid": self.account.private_key_id,
        });
        let claims = json!({
            "iss": self.account.client_email,
            "scope": CLOUD_DNS_SCOPE,
            "aud": self.account.token_uri,
            "iat": issued_at,
            "exp": issued_at + 3600,
        });

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );

        let key_der = pkcs8_from_pem(&self.account.private_key)?;
        let key_pair = RsaKeyPair::from_pkcs8(&key_der)
            .map_err(|e| DnsProviderError::Credentials(format!("Invalid service account key: {}", e)))?;

        let mut signature = vec![0u8; key_pair.public().modulus_len()];
        key_pair
            .sign(
                &RSA_PKCS1_SHA256,
                &SystemRandom::new(),
                signing_input.as_bytes(),
                &mut signature,
            )
            .map_err(|e| DnsProviderError::Credentials(format!("Failed to sign assertion: {}", e)))?;

        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    async fn access_token(&self) -> DnsResult<String> {
        let mut cached = self.token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }

        let issued_at = chrono::Utc::now().timestamp().max(0) as u64;
        let assertion = self.signed_assertion(issued_at)?;
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer")
            .append_pair("assertion", &assertion)
            .finish();

        let resp = self
            .http
            .post(&self.account.token_uri)
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

        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some((token.access_token.clone(), Instant::now() + lifetime));
        Ok(token.access_token)
    }

    fn zones_url(&self) -> String {
        format!("{}/projects/{}/managedZones", CLOUD_DNS_BASE, self.project)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> DnsResult<T> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DnsProviderError::ApiRequest(format!("HTTP request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(DnsProviderError::ApiRequest(format!(
                "Cloud DNS request failed ({}): {}",
                status, text
            )));
        }

        resp.json()
            .await
            .map_err(|e| DnsProviderError::ApiRequest(format!("Failed to parse response: {}", e)))
    }
}

/// DER of the first PKCS#8 key in a PEM document
fn pkcs8_from_pem(pem: &str) -> DnsResult<Vec<u8>> {
    let mut reader = pem.as_bytes();
    for item in rustls_pemfile::read_all(&mut reader) {
        match item {
            Ok(rustls_pemfile::Item::Pkcs8Key(key)) => {
                return Ok(key.secret_pkcs8_der().to_vec());
            }
            Ok(_) => continue,
            Err(e) => {
                return Err(DnsProviderError::Credentials(format!(
                    "Invalid private key PEM: {}",
                    e
                )));
            }
        }
    }
    Err(DnsProviderError::Credentials(
        "No PKCS#8 private key in service account".into(),
    ))
}

#[async_trait]
impl CloudDnsApi for GcpRestClient {
    async fn list_managed_zones(&self, page_token: Option<String>) -> DnsResult<ManagedZonePage> {
        let url = self.zones_url();
        match page_token {
            Some(token) => self.get_json(&url, &[("pageToken", token.as_str())]).await,
            None => self.get_json(&url, &[]).await,
        }
    }

    async fn list_txt_records(&self, zone: &str, fqdn: &str) -> DnsResult<Vec<RecordSet>> {
        let url = format!("{}/{}/rrsets", self.zones_url(), zone);
        let name = absolute(fqdn);
        let list: RecordSetList = self
            .get_json(&url, &[("name", name.as_str()), ("type", "TXT")])
            .await?;
        Ok(list.rrsets)
    }

    async fn apply_change(&self, zone: &str, change: &RecordChange) -> DnsResult<()> {
        let token = self.access_token().await?;
        let url = format!("{}/{}/changes", self.zones_url(), zone);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(change)
            .send()
            .await
            .map_err(|e| DnsProviderError::ApiRequest(format!("HTTP request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(DnsProviderError::ApiRequest(format!(
                "Cloud DNS change rejected ({}): {}",
                status, text
            )));
        }
        Ok(())
    }
}

/// DNS provider writing into Cloud DNS public managed zones
#[derive(Debug, Clone)]
pub struct GcpDnsProvider {
    api: Arc<dyn CloudDnsApi>,
}

impl GcpDnsProvider {
    pub fn new(api: Arc<dyn CloudDnsApi>) -> Self {
        Self { api }
    }

    async fn find_public_zone(&self, base_domain: &str) -> DnsResult<Option<ManagedZone>> {
        let mut page_token = None;
        loop {
            let page = self.api.list_managed_zones(page_token).await?;
            if let Some(zone) = page
                .managed_zones
                .into_iter()
                .find(|zone| zone.is_public() && same_name(&zone.dns_name, base_domain))
            {
                return Ok(Some(zone));
            }
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => return Ok(None),
            }
        }
    }

    async fn zone_for(&self, request: &CertificateRequest) -> DnsResult<ManagedZone> {
        self.find_public_zone(&request.acme_dns_domain)
            .await?
            .ok_or_else(|| DnsProviderError::ZoneNotFound {
                zone: request.acme_dns_domain.clone(),
            })
    }

    async fn existing_records(&self, zone: &ManagedZone, fqdn: &str) -> DnsResult<Vec<RecordSet>> {
        Ok(self
            .api
            .list_txt_records(&zone.name, fqdn)
            .await?
            .into_iter()
            .filter(|set| same_name(&set.name, fqdn))
            .collect())
    }

    /// Replace whatever TXT set lives at `fqdn` with a single value
    async fn upsert(&self, zone: &ManagedZone, fqdn: &str, value: &str) -> DnsResult<()> {
        let change = RecordChange {
            deletions: self.existing_records(zone, fqdn).await?,
            additions: vec![RecordSet::txt(fqdn, value)],
        };
        self.api.apply_change(&zone.name, &change).await
    }
}

#[async_trait]
impl DnsProvider for GcpDnsProvider {
    fn name(&self) -> &'static str {
        "gcp"
    }

    async fn answer_challenge(
        &self,
        key_authorization: &str,
        domain: &str,
        request: &CertificateRequest,
    ) -> DnsResult<String> {
        let zone = self.zone_for(request).await?;
        let fqdn = challenge_record_fqdn(domain);

        self.upsert(&zone, &fqdn, key_authorization)
            .await
            .map_err(|e| DnsProviderError::WriteFailure {
                record_name: fqdn.clone(),
                message: e.to_string(),
            })?;

        info!(fqdn = %fqdn, zone = %zone.name, "Cloud DNS challenge record written");
        Ok(fqdn)
    }

    async fn validate_write_access(&self, request: &CertificateRequest) -> DnsResult<bool> {
        let Some(zone) = self.find_public_zone(&request.acme_dns_domain).await? else {
            warn!(zone = %request.acme_dns_domain, "No public Cloud DNS zone, write access denied");
            return Ok(false);
        };

        let probe = access_test_fqdn(&zone.dns_name);
        self.upsert(&zone, &probe, ACCESS_TEST_VALUE).await?;
        let cleanup = RecordChange {
            deletions: vec![RecordSet::txt(&probe, ACCESS_TEST_VALUE)],
            additions: Vec::new(),
        };
        self.api.apply_change(&zone.name, &cleanup).await?;

        debug!(zone = %zone.name, "Cloud DNS write access confirmed");
        Ok(true)
    }

    async fn delete_challenge_records(&self, request: &CertificateRequest) -> DnsResult<()> {
        let zone = self.zone_for(request).await?;

        for name in &request.dns_names {
            let fqdn = challenge_record_fqdn(name);
            let existing = match self.existing_records(&zone, &fqdn).await {
                Ok(existing) => existing,
                Err(e) => {
                    warn!(fqdn = %fqdn, error = %e, "Failed to list challenge records");
                    continue;
                }
            };
            if existing.is_empty() {
                continue;
            }

            let change = RecordChange {
                deletions: existing,
                additions: Vec::new(),
            };
            match self.api.apply_change(&zone.name, &change).await {
                Ok(()) => info!(fqdn = %fqdn, "Cloud DNS challenge record deleted"),
                Err(e) => warn!(fqdn = %fqdn, error = %e, "Failed to delete challenge record"),
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

    /// Rejects deletions of missing sets and additions over existing ones, like Cloud DNS
    #[derive(Debug)]
    struct FakeCloudDns {
        pages: Vec<Vec<ManagedZone>>,
        records: SyncMutex<BTreeMap<(String, String), RecordSet>>,
    }

    impl FakeCloudDns {
        fn new(pages: Vec<Vec<ManagedZone>>) -> Self {
            Self {
                pages,
                records: SyncMutex::new(BTreeMap::new()),
            }
        }
    }

    #[async_trait]
    impl CloudDnsApi for FakeCloudDns {
        async fn list_managed_zones(
            &self,
            page_token: Option<String>,
        ) -> DnsResult<ManagedZonePage> {
            let index: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
            Ok(ManagedZonePage {
                managed_zones: self.pages[index].clone(),
                next_page_token: (index + 1 < self.pages.len()).then(|| (index + 1).to_string()),
            })
        }

        async fn list_txt_records(&self, zone: &str, fqdn: &str) -> DnsResult<Vec<RecordSet>> {
            Ok(self
                .records
                .lock()
                .get(&(zone.to_string(), absolute(fqdn)))
                .cloned()
                .into_iter()
                .collect())
        }

        async fn apply_change(&self, zone: &str, change: &RecordChange) -> DnsResult<()> {
            let mut records = self.records.lock();
            for deletion in &change.deletions {
                let key = (zone.to_string(), deletion.name.clone());
                if records.remove(&key).is_none() {
                    return Err(DnsProviderError::ApiRequest("deletion not found".into()));
                }
            }
            for addition in &change.additions {
                let key = (zone.to_string(), addition.name.clone());
                if records.contains_key(&key) {
                    return Err(DnsProviderError::ApiRequest("already exists".into()));
                }
                records.insert(key, addition.clone());
            }
            Ok(())
        }
    }

    fn zone(name: &str, dns_name: &str, visibility: &str) -> ManagedZone {
        ManagedZone {
            name: name.into(),
            dns_name: dns_name.into(),
            visibility: Some(visibility.into()),
        }
    }

    fn api() -> Arc<FakeCloudDns> {
        Arc::new(FakeCloudDns::new(vec![
            vec![zone("internal", "example.com.", "private")],
            vec![zone("public-zone", "example.com.", "public")],
        ]))
    }

    fn request(dns_names: &[&str]) -> CertificateRequest {
        CertificateRequest {
            name: "test".into(),
            namespace: "ns".into(),
            acme_dns_domain: "example.com".into(),
            dns_names: dns_names.iter().map(|s| s.to_string()).collect(),
            email: "a@b.com".into(),
            reissue_before_days: 0,
            platform: Platform::Mock(MockPlatform::default()),
            certificate_secret: SecretRef::new("tls"),
        }
    }

    #[tokio::test]
    async fn test_answer_is_idempotent_and_skips_private_zone() {
        let api = api();
        let provider = GcpDnsProvider::new(api.clone());
        let req = request(&["*.apps.example.com"]);

        let fqdn = provider
            .answer_challenge("one", "*.apps.example.com", &req)
            .await
            .unwrap();
        provider
            .answer_challenge("two", "*.apps.example.com", &req)
            .await
            .unwrap();

        assert_eq!(fqdn, "_acme-challenge.apps.example.com");
        let records = api.records.lock();
        assert_eq!(records.len(), 1);
        let (key, set) = records.iter().next().unwrap();
        assert_eq!(key.0, "public-zone");
        assert_eq!(set.name, "_acme-challenge.apps.example.com.");
        assert_eq!(set.rrdatas, vec!["\"two\"".to_string()]);
    }

    #[tokio::test]
    async fn test_validate_write_access() {
        let api = api();
        let provider = GcpDnsProvider::new(api.clone());
        assert!(provider
            .validate_write_access(&request(&["a.example.com"]))
            .await
            .unwrap());
        assert!(api.records.lock().is_empty());

        let private_only = Arc::new(FakeCloudDns::new(vec![vec![zone(
            "internal",
            "example.com.",
            "private",
        )]]));
        let provider = GcpDnsProvider::new(private_only);
        assert!(!provider
            .validate_write_access(&request(&["a.example.com"]))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_delete_challenge_records() {
        let api = api();
        let provider = GcpDnsProvider::new(api.clone());
        let req = request(&["a.example.com", "b.example.com"]);

        provider.answer_challenge("v", "a.example.com", &req).await.unwrap();
        provider.delete_challenge_records(&req).await.unwrap();
        assert!(api.records.lock().is_empty());
    }

    #[test]
    fn test_zone_visibility_defaults_to_public() {
        let page: ManagedZonePage = serde_json::from_str(
            r#"{"managedZones":[{"name":"z","dnsName":"example.com."}]}"#,
        )
        .unwrap();
        assert!(page.managed_zones[0].is_public());
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn test_invalid_key_pem() {
        assert!(matches!(
            pkcs8_from_pem("not a key"),
            Err(DnsProviderError::Credentials(_))
        ));
    }
}
