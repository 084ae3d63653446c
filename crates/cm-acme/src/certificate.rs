use crate::types::{AcmeError, AcmeResult};
use chrono::{DateTime, Utc};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Fields of an X.509 certificate the lifecycle decisions look at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    pub der: Vec<u8>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub issuer_common_name: Option<String>,
    pub subject_common_name: Option<String>,
    pub dns_names: Vec<String>,
    /// Colon separated hex
    pub serial_number: String,
}

impl ParsedCertificate {
    /// Parse the first PEM block, which must be a certificate
    pub fn from_pem(pem: &[u8]) -> AcmeResult<Self> {
        let (_, block) = parse_x509_pem(pem)
            .map_err(|e| AcmeError::CertificateParse(format!("Invalid PEM: {}", e)))?;
        if block.label != "CERTIFICATE" {
            return Err(AcmeError::CertificateParse(format!(
                "Expected a CERTIFICATE block, found {}",
                block.label
            )));
        }
        Self::from_der(&block.contents)
    }

    pub fn from_der(der: &[u8]) -> AcmeResult<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| AcmeError::CertificateParse(format!("Invalid certificate: {}", e)))?;

        let validity = cert.validity();
        let not_before = timestamp(validity.not_before.timestamp())?;
        let not_after = timestamp(validity.not_after.timestamp())?;

        let dns_names = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                return Err(AcmeError::CertificateParse(format!(
                    "Invalid subject alternative names: {}",
                    e
                )));
            }
        };

        let common_name = |name: &x509_parser::x509::X509Name<'_>| {
            name.iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string)
        };

        Ok(Self {
            der: der.to_vec(),
            not_before,
            not_after,
            issuer_common_name: common_name(cert.issuer()),
            subject_common_name: common_name(cert.subject()),
            dns_names,
            serial_number: cert.raw_serial_as_string(),
        })
    }

    /// Whole days until expiry, rounded down
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_seconds().div_euclid(86_400)
    }

    /// Whether `name` is one of the certificate's SANs
    pub fn covers(&self, name: &str) -> bool {
        self.dns_names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

fn timestamp(secs: i64) -> AcmeResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AcmeError::CertificateParse(format!("Timestamp out of range: {}", secs)))
}
