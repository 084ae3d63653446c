use crate::client::AcmeClient;
use crate::issuer;
use crate::letsencrypt::LetsEncryptClient;
use crate::mock::MockAcmeClient;
use crate::renewal;
use crate::revocation;
use crate::transport::ReqwestHttpClient;
use crate::types::{AcmeResult, IssuedCertificate};
use async_trait::async_trait;
use cm_common::{CertificateRequest, CertmanConfig, SecretStore};
use cm_dns::{
    build_provider, DnsProvider, DohResolver, PropagationConfig, PropagationVerifier,
    ProviderSettings,
};
use instant_acme::HttpClient;
use std::sync::Arc;
use tracing::info;

/// Builds the DNS provider a request's platform calls for
#[async_trait]
pub trait DnsProviderFactory: Send + Sync {
    async fn provider(&self, request: &CertificateRequest) -> AcmeResult<Arc<dyn DnsProvider>>;
}

/// Opens a fresh ACME session
#[async_trait]
pub trait AcmeClientFactory: Send + Sync {
    async fn client(&self) -> AcmeResult<Box<dyn AcmeClient>>;
}

/// Providers backed by credentials from the secret store
pub struct SecretDnsProviderFactory {
    secrets: Arc<dyn SecretStore>,
    settings: ProviderSettings,
}

impl SecretDnsProviderFactory {
    pub fn new(secrets: Arc<dyn SecretStore>, settings: ProviderSettings) -> Self {
        Self { secrets, settings }
    }
}

#[async_trait]
impl DnsProviderFactory for SecretDnsProviderFactory {
    async fn provider(&self, request: &CertificateRequest) -> AcmeResult<Arc<dyn DnsProvider>> {
        Ok(build_provider(request, self.secrets.as_ref(), &self.settings).await?)
    }
}

/// The same provider for every request
pub struct FixedDnsProviderFactory(pub Arc<dyn DnsProvider>);

#[async_trait]
impl DnsProviderFactory for FixedDnsProviderFactory {
    async fn provider(&self, _request: &CertificateRequest) -> AcmeResult<Arc<dyn DnsProvider>> {
        Ok(self.0.clone())
    }
}

/// Let's Encrypt sessions for the account held in one secret
pub struct LetsEncryptClientFactory {
    secrets: Arc<dyn SecretStore>,
    account_secret: String,
    namespace: String,
    http: Arc<dyn HttpClient>,
}

impl LetsEncryptClientFactory {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        account_secret: &str,
        namespace: &str,
    ) -> AcmeResult<Self> {
        Ok(Self {
            secrets,
            account_secret: account_secret.to_string(),
            namespace: namespace.to_string(),
            http: Arc::new(ReqwestHttpClient::new()?),
        })
    }
}

#[async_trait]
impl AcmeClientFactory for LetsEncryptClientFactory {
    async fn client(&self) -> AcmeResult<Box<dyn AcmeClient>> {
        let client = LetsEncryptClient::from_secret(
            self.secrets.as_ref(),
            &self.account_secret,
            &self.namespace,
            self.http.clone(),
        )
        .await?;
        Ok(Box::new(client))
    }
}

#[async_trait]
impl AcmeClientFactory for MockAcmeClient {
    async fn client(&self) -> AcmeResult<Box<dyn AcmeClient>> {
        Ok(Box::new(self.fork()))
    }
}

/// Entry point for issuing, renewing and revoking certificates
pub struct CertificateManager {
    dns: Arc<dyn DnsProviderFactory>,
    acme: Arc<dyn AcmeClientFactory>,
    verifier: PropagationVerifier,
}

impl CertificateManager {
    pub fn new(
        dns: Arc<dyn DnsProviderFactory>,
        acme: Arc<dyn AcmeClientFactory>,
        verifier: PropagationVerifier,
    ) -> Self {
        Self { dns, acme, verifier }
    }

    /// Secret backed providers, Let's Encrypt and public DoH resolvers
    pub fn from_config(config: &CertmanConfig, secrets: Arc<dyn SecretStore>) -> AcmeResult<Self> {
        let verifier = PropagationVerifier::new(
            Arc::new(DohResolver::new()?),
            PropagationConfig::from(config),
        );
        Ok(Self::new(
            Arc::new(SecretDnsProviderFactory::new(
                secrets.clone(),
                ProviderSettings::from(config),
            )),
            Arc::new(LetsEncryptClientFactory::new(
                secrets,
                &config.acme_account_secret,
                &config.operator_namespace,
            )?),
            verifier,
        ))
    }

    pub async fn issue_certificate(
        &self,
        request: &CertificateRequest,
    ) -> AcmeResult<IssuedCertificate> {
        let dns = self.dns.provider(request).await?;
        let mut acme = self.acme.client().await?;
        issuer::issue_certificate(request, dns.as_ref(), acme.as_mut(), &self.verifier).await
    }

    pub fn should_reissue(
        &self,
        request: &CertificateRequest,
        current: Option<&[u8]>,
    ) -> AcmeResult<bool> {
        renewal::should_reissue(request, current)
    }

    pub async fn revoke_certificate(
        &self,
        request: &CertificateRequest,
        certificate_pem: &[u8],
    ) -> AcmeResult<()> {
        let dns = self.dns.provider(request).await?;
        let mut acme = self.acme.client().await?;
        revocation::revoke_certificate(request, certificate_pem, acme.as_mut(), dns.as_ref()).await
    }

    pub async fn validate_dns_write_access(&self, request: &CertificateRequest) -> AcmeResult<bool> {
        let dns = self.dns.provider(request).await?;
        let writable = dns.validate_write_access(request).await?;
        info!(
            request = %request.key(),
            provider = dns.name(),
            writable,
            "Checked DNS write access"
        );
        Ok(writable)
    }
}
