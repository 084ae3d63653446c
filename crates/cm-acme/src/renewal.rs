use crate::certificate::ParsedCertificate;
use crate::types::{AcmeResult, DEFAULT_REISSUE_BEFORE_DAYS};
use chrono::{DateTime, Utc};
use cm_common::CertificateRequest;
use tracing::info;

/// Whether the certificate stored for `request` has to be issued again
pub fn should_reissue(request: &CertificateRequest, current: Option<&[u8]>) -> AcmeResult<bool> {
    should_reissue_at(request, current, Utc::now())
}

/// [`should_reissue`] evaluated at `now`.
///
/// Missing or blank certificate data always reissues. Otherwise the
/// certificate is reissued once it is within the request's threshold of
/// expiry, or when a requested name is no longer among its SANs.
pub fn should_reissue_at(
    request: &CertificateRequest,
    current: Option<&[u8]>,
    now: DateTime<Utc>,
) -> AcmeResult<bool> {
    let pem = match current {
        Some(data) if !data.trim_ascii().is_empty() => data,
        _ => {
            info!(request = %request.key(), "No certificate stored, issuing");
            return Ok(true);
        }
    };

    let certificate = ParsedCertificate::from_pem(pem)?;
    let threshold = request.reissue_before_days_or(DEFAULT_REISSUE_BEFORE_DAYS);
    let days_remaining = certificate.days_remaining(now);

    if days_remaining <= threshold {
        info!(
            request = %request.key(),
            days_remaining,
            threshold,
            not_after = %certificate.not_after,
            "Certificate is due for renewal"
        );
        return Ok(true);
    }

    let missing: Vec<&str> = request
        .dns_names
        .iter()
        .filter(|name| !certificate.covers(name))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        info!(request = %request.key(), missing = ?missing, "Certificate does not cover every requested name");
        return Ok(true);
    }

    Ok(false)
}
