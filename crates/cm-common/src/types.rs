use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference to a secret held by a [`crate::SecretStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    /// Falls back to the namespace of the owning request when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SecretRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    /// Namespace of the secret, or `fallback` if the reference has none.
    pub fn namespace_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(fallback)
    }
}

/// DNS platform hosting the zone the challenge records are written to.
///
/// Serialized externally tagged, e.g. `{"aws": {"credentials": {...}, "region": "us-east-1"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Aws(AwsPlatform),
    Azure(AzurePlatform),
    Gcp(GcpPlatform),
    Mock(MockPlatform),
}

impl Platform {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aws(_) => "aws",
            Self::Azure(_) => "azure",
            Self::Gcp(_) => "gcp",
            Self::Mock(_) => "mock",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsPlatform {
    /// Secret with `aws_access_key_id` and `aws_secret_access_key`
    pub credentials: SecretRef,
    #[serde(default = "default_aws_region")]
    pub region: String,
}

fn default_aws_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzurePlatform {
    /// Secret with an `osServicePrincipal.json` key
    pub credentials: SecretRef,
    pub resource_group_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpPlatform {
    /// Secret with an `osServiceAccount.json` key
    pub credentials: SecretRef,
    /// Defaults to the `project_id` of the service account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

/// Failure injection knobs for the in-memory DNS provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MockPlatform {
    pub answer_challenge_error: Option<String>,
    pub validate_write_access: bool,
    pub validate_write_access_error: Option<String>,
    pub delete_records_error: Option<String>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self {
            answer_challenge_error: None,
            validate_write_access: true,
            validate_write_access_error: None,
            delete_records_error: None,
        }
    }
}

/// One desired certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequest {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Zone housing the `_acme-challenge` records
    #[serde(rename = "acmeDNSDomain", alias = "baseDomain")]
    pub acme_dns_domain: String,
    /// Ordered SAN list, the first entry becomes the common name
    pub dns_names: Vec<String>,
    pub email: String,
    /// Renewal threshold in days, `<= 0` selects the default
    #[serde(default, rename = "renewBeforeDays", alias = "reissueBeforeDays")]
    pub reissue_before_days: i64,
    pub platform: Platform,
    pub certificate_secret: SecretRef,
}

impl CertificateRequest {
    /// Common name of the certificate (first DNS name).
    pub fn common_name(&self) -> Option<&str> {
        self.dns_names.first().map(String::as_str)
    }

    /// Renewal threshold, replacing non-positive values with `default_days`.
    pub fn reissue_before_days_or(&self, default_days: i64) -> i64 {
        if self.reissue_before_days <= 0 {
            default_days
        } else {
            self.reissue_before_days
        }
    }

    /// Reject requests that cannot be issued before any DNS or ACME call.
    pub fn validate(&self) -> Result<(), AppError> {
        let invalid = |message: &str| AppError::InvalidRequest {
            name: self.key(),
            message: message.to_string(),
        };

        if self.dns_names.is_empty() {
            return Err(invalid("no DNS names"));
        }
        if self.dns_names.iter().any(|n| n.trim().is_empty()) {
            return Err(invalid("blank DNS name"));
        }
        if self.acme_dns_domain.trim().is_empty() {
            return Err(invalid("acmeDNSDomain is empty"));
        }
        if self.certificate_secret.name.trim().is_empty() {
            return Err(invalid("certificateSecret has no name"));
        }
        Ok(())
    }

    /// Human readable `namespace/name` key.
    pub fn key(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}

/// Type of a status condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    #[serde(rename = "acme error")]
    AcmeError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: bool,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Observed state of a [`CertificateRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestStatus {
    pub issued: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StatusCondition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_request_with_platform_union() {
        let json = r#"{
            "name": "api-cert",
            "namespace": "cluster-1",
            "acmeDNSDomain": "example.com",
            "dnsNames": ["api.example.com", "*.apps.example.com"],
            "email": "admin@example.com",
            "platform": {"aws": {"credentials": {"name": "aws-creds"}}},
            "certificateSecret": {"name": "api-tls"}
        }"#;

        let request: CertificateRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.common_name(), Some("api.example.com"));
        assert_eq!(request.reissue_before_days, 0);
        assert_eq!(request.key(), "cluster-1/api-cert");
        match &request.platform {
            Platform::Aws(aws) => {
                assert_eq!(aws.credentials.name, "aws-creds");
                assert_eq!(aws.region, "us-east-1");
            }
            other => panic!("unexpected platform {:?}", other),
        }
    }

    #[test]
    fn test_base_domain_alias_and_mock_defaults() {
        let json = r#"{
            "name": "mock-cert",
            "baseDomain": "example.com",
            "dnsNames": ["a.example.com"],
            "email": "a@b.com",
            "platform": {"mock": {}},
            "certificateSecret": {"name": "mock-tls", "namespace": "other"}
        }"#;

        let request: CertificateRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.acme_dns_domain, "example.com");
        assert_eq!(request.platform, Platform::Mock(MockPlatform::default()));
        assert_eq!(request.certificate_secret.namespace_or("fallback"), "other");
    }

    #[test]
    fn test_reissue_before_days_default() {
        let mut request: CertificateRequest = serde_json::from_str(
            r#"{"name":"x","acmeDNSDomain":"d","dnsNames":[],"email":"e",
                "platform":{"mock":{}},"certificateSecret":{"name":"s"}}"#,
        )
        .unwrap();
        assert_eq!(request.reissue_before_days_or(32), 32);
        request.reissue_before_days = -4;
        assert_eq!(request.reissue_before_days_or(32), 32);
        request.reissue_before_days = 10;
        assert_eq!(request.reissue_before_days_or(32), 10);
        assert_eq!(request.common_name(), None);
    }

    #[test]
    fn test_validate() {
        let mut request: CertificateRequest = serde_json::from_str(
            r#"{"name":"x","namespace":"ns","acmeDNSDomain":"example.com","dnsNames":["a.example.com"],
                "email":"e","platform":{"mock":{}},"certificateSecret":{"name":"s"}}"#,
        )
        .unwrap();
        assert!(request.validate().is_ok());

        request.acme_dns_domain = " ".into();
        match request.validate() {
            Err(AppError::InvalidRequest { name, message }) => {
                assert_eq!(name, "ns/x");
                assert!(message.contains("acmeDNSDomain"));
            }
            other => panic!("unexpected {:?}", other),
        }

        request.acme_dns_domain = "example.com".into();
        request.dns_names.clear();
        assert!(request.validate().is_err());
    }
}
