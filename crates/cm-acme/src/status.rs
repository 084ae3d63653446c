use crate::certificate::ParsedCertificate;
use chrono::Utc;
use cm_common::types::{ConditionType, StatusCondition};
use cm_common::CertificateRequestStatus;
use std::fmt::Display;
use tracing::debug;

pub const STATUS_SUCCESS: &str = "Success";
pub const STATUS_ERROR: &str = "Error";

/// Copy the certificate's identity into `status`, returning whether anything changed
pub fn record_issued(status: &mut CertificateRequestStatus, certificate: &ParsedCertificate) -> bool {
    let unchanged = status.issued
        && status.status == STATUS_SUCCESS
        && status.issuer_name == certificate.issuer_common_name
        && status.not_before == Some(certificate.not_before)
        && status.not_after == Some(certificate.not_after)
        && status.serial_number.as_deref() == Some(certificate.serial_number.as_str());
    if unchanged {
        return false;
    }

    status.issued = true;
    status.status = STATUS_SUCCESS.to_string();
    status.issuer_name = certificate.issuer_common_name.clone();
    status.not_before = Some(certificate.not_before);
    status.not_after = Some(certificate.not_after);
    status.serial_number = Some(certificate.serial_number.clone());
    true
}

/// Mark `status` as failed; ACME failures also leave an `acme error` condition.
///
/// An existing `acme error` condition is kept as is.
pub fn record_error(status: &mut CertificateRequestStatus, err: &impl Display) {
    status.issued = false;
    status.status = STATUS_ERROR.to_string();

    let message = err.to_string();
    if !message.to_ascii_lowercase().contains("acme") {
        return;
    }
    if status
        .conditions
        .iter()
        .any(|c| c.kind == ConditionType::AcmeError)
    {
        return;
    }

    debug!(message = %message, "Adding acme error condition");
    status.conditions.push(StatusCondition {
        kind: ConditionType::AcmeError,
        status: true,
        message,
        last_transition_time: Utc::now(),
    });
}
