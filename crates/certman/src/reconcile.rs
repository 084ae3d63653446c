use anyhow::Context;
use cm_acme::status::{record_error, record_issued};
use cm_acme::{CertificateManager, ParsedCertificate};
use cm_common::{CertificateRequest, CertificateRequestStatus, Secret, SecretError, SecretStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";

/// What a reconcile pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Issued,
    UpToDate,
}

/// Drives one certificate request towards a valid stored certificate
pub struct Reconciler {
    manager: Arc<CertificateManager>,
    secrets: Arc<dyn SecretStore>,
    state_dir: PathBuf,
    default_namespace: String,
}

impl Reconciler {
    pub fn new(
        manager: Arc<CertificateManager>,
        secrets: Arc<dyn SecretStore>,
        state_dir: PathBuf,
        default_namespace: &str,
    ) -> Self {
        Self {
            manager,
            secrets,
            state_dir,
            default_namespace: default_namespace.to_string(),
        }
    }

    pub fn manager(&self) -> &CertificateManager {
        &self.manager
    }

    fn namespace<'a>(&'a self, request: &'a CertificateRequest) -> &'a str {
        if request.namespace.is_empty() {
            &self.default_namespace
        } else {
            &request.namespace
        }
    }

    fn status_path(&self, request: &CertificateRequest) -> PathBuf {
        self.state_dir
            .join(self.namespace(request))
            .join(format!("{}.status.json", request.name))
    }

    /// Stored certificate chain, `None` when the secret or key does not exist yet
    pub async fn current_certificate(
        &self,
        request: &CertificateRequest,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let secret_ref = &request.certificate_secret;
        let namespace = secret_ref.namespace_or(self.namespace(request));
        match self.secrets.get_secret(&secret_ref.name, namespace).await {
            Ok(secret) => Ok(secret.get(TLS_CERT_KEY).map(<[u8]>::to_vec)),
            Err(SecretError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load_status(
        &self,
        request: &CertificateRequest,
    ) -> anyhow::Result<CertificateRequestStatus> {
        let path = self.status_path(request);
        match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("Invalid status file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(CertificateRequestStatus::default())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn save_status(
        &self,
        request: &CertificateRequest,
        status: &CertificateRequestStatus,
    ) -> anyhow::Result<()> {
        let path = self.status_path(request);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(status)?)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Issue when needed, store the result and record the status
    pub async fn reconcile(&self, request: &CertificateRequest) -> anyhow::Result<ReconcileOutcome> {
        let mut status = self.load_status(request).await?;

        match self.reconcile_certificate(request).await {
            Ok((outcome, certificate)) => {
                if record_issued(&mut status, &certificate) {
                    self.save_status(request, &status).await?;
                }
                Ok(outcome)
            }
            Err(e) => {
                record_error(&mut status, &format!("{:#}", e));
                if let Err(save_error) = self.save_status(request, &status).await {
                    warn!(request = %request.key(), error = %save_error, "Failed to save status");
                }
                Err(e)
            }
        }
    }

    async fn reconcile_certificate(
        &self,
        request: &CertificateRequest,
    ) -> anyhow::Result<(ReconcileOutcome, ParsedCertificate)> {
        let current = self.current_certificate(request).await?;

        if !self.manager.should_reissue(request, current.as_deref())? {
            let pem = current.unwrap_or_default();
            return Ok((ReconcileOutcome::UpToDate, ParsedCertificate::from_pem(&pem)?));
        }

        let issued = self.manager.issue_certificate(request).await?;
        let certificate = ParsedCertificate::from_pem(issued.certificate_pem.as_bytes())?;

        let secret_ref = &request.certificate_secret;
        let secret = Secret::new(
            secret_ref.name.clone(),
            secret_ref.namespace_or(self.namespace(request)),
        )
        .with(TLS_CERT_KEY, issued.certificate_pem)
        .with(TLS_KEY_KEY, issued.private_key_pem);
        self.secrets.put_secret(&secret).await?;

        info!(
            request = %request.key(),
            secret = %secret_ref.name,
            not_after = %certificate.not_after,
            "Stored certificate"
        );
        Ok((ReconcileOutcome::Issued, certificate))
    }

    /// Revoke the stored certificate
    pub async fn revoke(&self, request: &CertificateRequest) -> anyhow::Result<()> {
        let current = self
            .current_certificate(request)
            .await?
            .with_context(|| format!("No certificate stored for {}", request.key()))?;
        self.manager.revoke_certificate(request, &current).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_acme::{FixedDnsProviderFactory, MockAcmeClient};
    use cm_common::types::{ConditionType, MockPlatform};
    use cm_common::{MemorySecretStore, Platform, SecretRef};
    use cm_dns::{MockDnsProvider, PropagationConfig, PropagationVerifier};
    use std::time::Duration;

    fn request() -> CertificateRequest {
        CertificateRequest {
            name: "api-cert".into(),
            namespace: String::new(),
            acme_dns_domain: "example.com".into(),
            dns_names: vec!["api.example.com".into()],
            email: "admin@example.com".into(),
            reissue_before_days: 0,
            platform: Platform::Mock(MockPlatform::default()),
            certificate_secret: SecretRef::new("api-tls"),
        }
    }

    fn reconciler(
        acme: MockAcmeClient,
        secrets: Arc<MemorySecretStore>,
        state_dir: PathBuf,
    ) -> Reconciler {
        let dns = Arc::new(MockDnsProvider::new());
        let verifier = PropagationVerifier::new(
            dns.clone(),
            PropagationConfig {
                max_attempts: 1,
                wait: Duration::ZERO,
                ..PropagationConfig::default()
            },
        );
        let manager = CertificateManager::new(
            Arc::new(FixedDnsProviderFactory(dns)),
            Arc::new(acme),
            verifier,
        );
        Reconciler::new(Arc::new(manager), secrets, state_dir, "certman-operator")
    }

    #[tokio::test]
    async fn test_issue_store_then_up_to_date() {
        let state = tempfile::tempdir().unwrap();
        let secrets = Arc::new(MemorySecretStore::new());
        let acme = MockAcmeClient::new().unwrap();
        let reconciler = reconciler(acme.clone(), secrets.clone(), state.path().to_path_buf());
        let req = request();

        assert_eq!(reconciler.reconcile(&req).await.unwrap(), ReconcileOutcome::Issued);
        assert!(secrets.contains("api-tls", "certman-operator"));

        let status = reconciler.load_status(&req).await.unwrap();
        assert!(status.issued);
        assert_eq!(status.status, "Success");
        assert!(state
            .path()
            .join("certman-operator/api-cert.status.json")
            .exists());

        assert_eq!(reconciler.reconcile(&req).await.unwrap(), ReconcileOutcome::UpToDate);
        assert_eq!(acme.calls().finalized, 1);

        reconciler.revoke(&req).await.unwrap();
        assert_eq!(acme.calls().revoked.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_records_acme_condition() {
        let state = tempfile::tempdir().unwrap();
        let secrets = Arc::new(MemorySecretStore::new());
        let reconciler = reconciler(
            MockAcmeClient::new().unwrap().unavailable(),
            secrets.clone(),
            state.path().to_path_buf(),
        );
        let req = request();

        assert!(reconciler.reconcile(&req).await.is_err());
        assert!(!secrets.contains("api-tls", "certman-operator"));

        let status = reconciler.load_status(&req).await.unwrap();
        assert!(!status.issued);
        assert_eq!(status.status, "Error");
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].kind, ConditionType::AcmeError);
    }

    #[tokio::test]
    async fn test_revoke_without_certificate() {
        let state = tempfile::tempdir().unwrap();
        let reconciler = reconciler(
            MockAcmeClient::new().unwrap(),
            Arc::new(MemorySecretStore::new()),
            state.path().to_path_buf(),
        );
        let err = reconciler.revoke(&request()).await.unwrap_err();
        assert!(err.to_string().contains("No certificate stored"));
    }
}
