use crate::azure::{AzureDnsProvider, AzureRestClient, ServicePrincipal, SERVICE_PRINCIPAL_KEY};
use crate::gcp::{GcpDnsProvider, GcpRestClient, ServiceAccount, SERVICE_ACCOUNT_KEY};
use crate::mock::MockDnsProvider;
use crate::provider::{DnsProvider, DnsProviderError, DnsResult};
use crate::route53::{Route53Provider, SdkRoute53};
use cm_common::{CertificateRequest, CertmanConfig, Platform, SecretStore};
use std::sync::Arc;
use tracing::debug;

/// Process-wide inputs to provider construction
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    /// Namespace for credential secrets of requests without one
    pub default_namespace: String,
    /// Route53 zone pinned in FedRAMP mode
    pub fedramp_hosted_zone_id: Option<String>,
}

impl From<&CertmanConfig> for ProviderSettings {
    fn from(config: &CertmanConfig) -> Self {
        Self {
            default_namespace: config.operator_namespace.clone(),
            fedramp_hosted_zone_id: config.fedramp_hosted_zone().map(str::to_string),
        }
    }
}

/// Build the DNS provider selected by the request's platform
pub async fn build_provider(
    request: &CertificateRequest,
    secrets: &dyn SecretStore,
    settings: &ProviderSettings,
) -> DnsResult<Arc<dyn DnsProvider>> {
    let namespace = if request.namespace.is_empty() {
        settings.default_namespace.as_str()
    } else {
        request.namespace.as_str()
    };

    let provider: Arc<dyn DnsProvider> = match &request.platform {
        Platform::Aws(aws) => {
            let secret = secrets
                .get_secret(&aws.credentials.name, aws.credentials.namespace_or(namespace))
                .await?;
            let access_key_id = secret.require_str("aws_access_key_id")?.trim();
            let secret_access_key = secret.require_str("aws_secret_access_key")?.trim();

            let api = SdkRoute53::connect(access_key_id, secret_access_key, &aws.region).await;
            Arc::new(Route53Provider::new(
                Arc::new(api),
                settings.fedramp_hosted_zone_id.clone(),
            ))
        }
        Platform::Azure(azure) => {
            let secret = secrets
                .get_secret(&azure.credentials.name, azure.credentials.namespace_or(namespace))
                .await?;
            let principal: ServicePrincipal =
                serde_json::from_slice(secret.require(SERVICE_PRINCIPAL_KEY)?).map_err(|e| {
                    DnsProviderError::Credentials(format!("Invalid {}: {}", SERVICE_PRINCIPAL_KEY, e))
                })?;

            Arc::new(AzureDnsProvider::new(
                Arc::new(AzureRestClient::new(principal)),
                azure.resource_group_name.clone(),
            ))
        }
        Platform::Gcp(gcp) => {
            let secret = secrets
                .get_secret(&gcp.credentials.name, gcp.credentials.namespace_or(namespace))
                .await?;
            let account: ServiceAccount =
                serde_json::from_slice(secret.require(SERVICE_ACCOUNT_KEY)?).map_err(|e| {
                    DnsProviderError::Credentials(format!("Invalid {}: {}", SERVICE_ACCOUNT_KEY, e))
                })?;

            Arc::new(GcpDnsProvider::new(Arc::new(GcpRestClient::new(
                account,
                gcp.project.clone(),
            ))))
        }
        Platform::Mock(options) => Arc::new(MockDnsProvider::from_platform(options.clone())),
    };

    debug!(request = %request.key(), provider = provider.name(), "DNS provider ready");
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_common::types::{AwsPlatform, AzurePlatform, GcpPlatform, MockPlatform};
    use cm_common::{MemorySecretStore, Secret, SecretRef};

    fn request(platform: Platform) -> CertificateRequest {
        CertificateRequest {
            name: "test".into(),
            namespace: String::new(),
            acme_dns_domain: "example.com".into(),
            dns_names: vec!["a.example.com".into()],
            email: "a@b.com".into(),
            reissue_before_days: 0,
            platform,
            certificate_secret: SecretRef::new("tls"),
        }
    }

    fn settings() -> ProviderSettings {
        ProviderSettings {
            default_namespace: "certman-operator".into(),
            fedramp_hosted_zone_id: None,
        }
    }

    #[tokio::test]
    async fn test_mock_platform() {
        let secrets = MemorySecretStore::new();
        let provider = build_provider(
            &request(Platform::Mock(MockPlatform::default())),
            &secrets,
            &settings(),
        )
        .await
        .unwrap();
        assert_eq!(provider.name(), "mock");
    }

    #[tokio::test]
    async fn test_missing_credentials_secret() {
        let secrets = MemorySecretStore::new();
        let err = build_provider(
            &request(Platform::Aws(AwsPlatform {
                credentials: SecretRef::new("aws-creds"),
                region: "us-east-1".into(),
            })),
            &secrets,
            &settings(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DnsProviderError::Secret(_)));
    }

    #[tokio::test]
    async fn test_azure_credentials_in_default_namespace() {
        let secrets = MemorySecretStore::new();
        let platform = Platform::Azure(AzurePlatform {
            credentials: SecretRef::new("azure-creds"),
            resource_group_name: "rg".into(),
        });

        secrets.insert(
            Secret::new("azure-creds", "certman-operator")
                .with(SERVICE_PRINCIPAL_KEY, "{not json"),
        );
        let err = build_provider(&request(platform.clone()), &secrets, &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, DnsProviderError::Credentials(_)));

        secrets.insert(Secret::new("azure-creds", "certman-operator").with(
            SERVICE_PRINCIPAL_KEY,
            r#"{"clientId":"c","clientSecret":"s","tenantId":"t","subscriptionId":"sub"}"#,
        ));
        let provider = build_provider(&request(platform), &secrets, &settings())
            .await
            .unwrap();
        assert_eq!(provider.name(), "azure");
    }

    #[tokio::test]
    async fn test_gcp_credentials_missing_key() {
        let secrets = MemorySecretStore::new();
        secrets.insert(Secret::new("gcp-creds", "cluster").with("other", "x"));

        let mut req = request(Platform::Gcp(GcpPlatform {
            credentials: SecretRef::new("gcp-creds"),
            project: Some("proj".into()),
        }));
        req.namespace = "cluster".into();

        let err = build_provider(&req, &secrets, &settings()).await.unwrap_err();
        assert!(matches!(err, DnsProviderError::Secret(_)));
    }

    #[test]
    fn test_settings_from_config() {
        let config = CertmanConfig {
            fedramp: true,
            hosted_zone_id: Some("Z9".into()),
            ..CertmanConfig::default()
        };
        let settings = ProviderSettings::from(&config);
        assert_eq!(settings.fedramp_hosted_zone_id.as_deref(), Some("Z9"));
        assert_eq!(settings.default_namespace, "certman-operator");
    }
}
