use crate::certificate::ParsedCertificate;
use crate::client::AcmeClient;
use crate::types::{
    AcmeError, AcmeResult, LETS_ENCRYPT_ISSUERS, STAGING_ISSUERS, STAGING_ISSUER_PREFIX,
};
use cm_common::CertificateRequest;
use cm_dns::DnsProvider;
use tracing::{info, warn};

/// Whether `issuer` is a Let's Encrypt production or staging intermediate
pub fn is_lets_encrypt_issuer(issuer: &str) -> bool {
    LETS_ENCRYPT_ISSUERS.contains(&issuer)
        || STAGING_ISSUERS.contains(&issuer)
        || issuer.starts_with(STAGING_ISSUER_PREFIX)
}

/// Revoke the certificate stored for `request` and drop its challenge records.
///
/// Certificates from any other CA are refused without contacting the ACME
/// server. Challenge records are deleted after every revoke attempt.
pub async fn revoke_certificate(
    request: &CertificateRequest,
    certificate_pem: &[u8],
    acme: &mut dyn AcmeClient,
    dns: &dyn DnsProvider,
) -> AcmeResult<()> {
    let certificate = ParsedCertificate::from_pem(certificate_pem)?;
    let issuer = certificate.issuer_common_name.clone().unwrap_or_default();
    if !is_lets_encrypt_issuer(&issuer) {
        return Err(AcmeError::NotIssuedByAcme { issuer });
    }

    info!(
        request = %request.key(),
        serial = %certificate.serial_number,
        issuer = %issuer,
        "Revoking certificate"
    );
    let revoked = acme.revoke_certificate(&certificate.der).await;

    if let Err(e) = dns.delete_challenge_records(request).await {
        warn!(request = %request.key(), error = %e, "Failed to clean up challenge records");
    }

    revoked?;
    info!(request = %request.key(), "Certificate revoked");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::test_support::leaf_pem;
    use crate::mock::{MockAcmeClient, MOCK_ISSUER};
    use crate::types::ProblemDetails;
    use cm_common::types::MockPlatform;
    use cm_common::{Platform, SecretRef};
    use cm_dns::MockDnsProvider;

    fn request() -> CertificateRequest {
        CertificateRequest {
            name: "web".into(),
            namespace: "ns".into(),
            acme_dns_domain: "example.com".into(),
            dns_names: vec!["a.example.com".into()],
            email: "admin@example.com".into(),
            reissue_before_days: 0,
            platform: Platform::Mock(MockPlatform::default()),
            certificate_secret: SecretRef::new("web-tls"),
        }
    }

    fn ninety_days() -> time::Duration {
        time::Duration::days(90)
    }

    #[test]
    fn test_known_issuers() {
        assert!(is_lets_encrypt_issuer("R11"));
        assert!(is_lets_encrypt_issuer("Let's Encrypt Authority X3"));
        assert!(is_lets_encrypt_issuer(MOCK_ISSUER));
        assert!(is_lets_encrypt_issuer("(STAGING) Puzzling Parsnip E7"));
        assert!(!is_lets_encrypt_issuer("Some Other CA"));
        assert!(!is_lets_encrypt_issuer(""));
    }

    #[tokio::test]
    async fn test_foreign_issuer_is_refused() {
        let pem = leaf_pem(&["a.example.com"], "Some Other CA", ninety_days());
        let mut acme = MockAcmeClient::new().unwrap();
        let dns = MockDnsProvider::new();

        let err = revoke_certificate(&request(), pem.as_bytes(), &mut acme, &dns)
            .await
            .unwrap_err();
        assert!(matches!(err, AcmeError::NotIssuedByAcme { ref issuer } if issuer == "Some Other CA"));
        assert!(acme.calls().revoked.is_empty());
    }

    #[tokio::test]
    async fn test_revokes_and_cleans_up() {
        let req = request();
        let pem = leaf_pem(&["a.example.com"], "R11", ninety_days());
        let mut acme = MockAcmeClient::new().unwrap();
        let dns = MockDnsProvider::new();
        dns.answer_challenge("leftover", "a.example.com", &req)
            .await
            .unwrap();

        revoke_certificate(&req, pem.as_bytes(), &mut acme, &dns)
            .await
            .unwrap();

        let parsed = ParsedCertificate::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(acme.calls().revoked, vec![parsed.der]);
        assert_eq!(dns.record_count(), 0);
    }

    #[tokio::test]
    async fn test_revoke_error_returned_after_cleanup() {
        let req = request();
        let pem = leaf_pem(&["a.example.com"], "R11", ninety_days());
        let mut acme = MockAcmeClient::new()
            .unwrap()
            .with_revoke_problem(ProblemDetails::new(
                "urn:ietf:params:acme:error:unauthorized",
                "account does not own this certificate",
            ));
        let dns = MockDnsProvider::new();
        dns.answer_challenge("leftover", "a.example.com", &req)
            .await
            .unwrap();

        let err = revoke_certificate(&req, pem.as_bytes(), &mut acme, &dns)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unauthorized"));
        assert_eq!(dns.record_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_mask_success() {
        let pem = leaf_pem(&["a.example.com"], "R11", ninety_days());
        let mut acme = MockAcmeClient::new().unwrap();
        let dns = MockDnsProvider::from_platform(MockPlatform {
            delete_records_error: Some("api down".into()),
            ..MockPlatform::default()
        });

        revoke_certificate(&request(), pem.as_bytes(), &mut acme, &dns)
            .await
            .unwrap();
        assert_eq!(acme.calls().revoked.len(), 1);
    }
}
