use cm_common::{AppError, SecretError};
use cm_dns::DnsProviderError;
use std::fmt;
use thiserror::Error;

/// Default renewal threshold, keeps Let's Encrypt expiry mails away
pub const DEFAULT_REISSUE_BEFORE_DAYS: i64 = 32;

/// Let's Encrypt production intermediates
pub const LETS_ENCRYPT_ISSUERS: &[&str] = &[
    "Let's Encrypt Authority X3",
    "Let's Encrypt Authority X4",
    "R3",
    "R4",
    "R10",
    "R11",
    "R12",
    "R13",
    "R14",
    "E1",
    "E2",
    "E5",
    "E6",
    "E7",
    "E8",
    "E9",
];

/// Let's Encrypt staging intermediates
pub const STAGING_ISSUERS: &[&str] = &["Fake LE Intermediate X1"];

/// Every staging intermediate since 2020 carries this prefix
pub const STAGING_ISSUER_PREFIX: &str = "(STAGING) ";

const ALREADY_REVOKED: &str = "urn:ietf:params:acme:error:alreadyRevoked";

/// Structured error returned by the ACME server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProblemDetails {
    /// Problem type URN, e.g. `urn:ietf:params:acme:error:rateLimited`
    pub kind: Option<String>,
    pub detail: String,
    pub status: Option<u16>,
}

impl ProblemDetails {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            detail: detail.into(),
            status: None,
        }
    }

    /// Transport level failure without a problem document
    pub fn transport(detail: impl Into<String>) -> Self {
        Self {
            kind: None,
            detail: detail.into(),
            status: None,
        }
    }

    /// The server is down for maintenance or failed internally
    pub fn is_maintenance(&self) -> bool {
        self.status == Some(503)
            || self
                .kind
                .as_deref()
                .is_some_and(|k| k.ends_with(":serverInternal"))
            || self.detail.to_ascii_lowercase().contains("maintenance")
    }

    pub fn is_already_revoked(&self) -> bool {
        self.kind.as_deref() == Some(ALREADY_REVOKED) || self.detail.contains(ALREADY_REVOKED)
    }
}

impl fmt::Display for ProblemDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Some(kind) => write!(f, "{}: {}", kind, self.detail),
            None => f.write_str(&self.detail),
        }
    }
}

impl From<instant_acme::Problem> for ProblemDetails {
    fn from(problem: instant_acme::Problem) -> Self {
        Self {
            kind: problem.r#type,
            detail: problem.detail.unwrap_or_default(),
            status: problem.status,
        }
    }
}

impl From<instant_acme::Error> for ProblemDetails {
    fn from(e: instant_acme::Error) -> Self {
        match e {
            instant_acme::Error::Api(problem) => problem.into(),
            other => Self::transport(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("Certificate request has no DNS names")]
    NoDnsNames,

    #[error(transparent)]
    InvalidRequest(#[from] AppError),

    #[error("Failed to get write access to DNS zone {zone}")]
    WriteAccessDenied { zone: String },

    #[error("ACME account error: {0}")]
    Account(ProblemDetails),

    #[error("ACME {operation} failed: {problem}")]
    Server {
        operation: &'static str,
        problem: ProblemDetails,
    },

    #[error("ACME order has not been created")]
    NoOrder,

    #[error("ACME authorization has not been fetched")]
    NoAuthorization,

    #[error("Authorization identifier not set")]
    IdentifierNotSet,

    #[error("No dns-01 challenge offered for {domain}")]
    NoDns01Challenge { domain: String },

    #[error("Challenge key authorization not set")]
    KeyNotSet,

    #[error("ACME validation failed for {domain}: {detail}")]
    ValidationFailed { domain: String, detail: String },

    #[error("DNS record {fqdn} did not propagate")]
    PropagationFailed { fqdn: String },

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Failed to build CSR: {0}")]
    Csr(String),

    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),

    #[error("Certificate was issued by {issuer}, not by Let's Encrypt")]
    NotIssuedByAcme { issuer: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Dns(#[from] DnsProviderError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AcmeError {
    /// Wrap a library error for `operation`, keeping the server's problem document
    pub fn server(operation: &'static str, e: impl Into<ProblemDetails>) -> Self {
        Self::Server {
            operation,
            problem: e.into(),
        }
    }

    pub fn problem(&self) -> Option<&ProblemDetails> {
        match self {
            Self::Account(problem) | Self::Server { problem, .. } => Some(problem),
            _ => None,
        }
    }

    /// Let's Encrypt maintenance, worth a requeue rather than a config fix
    pub fn is_maintenance(&self) -> bool {
        self.problem().is_some_and(ProblemDetails::is_maintenance)
    }
}

pub type AcmeResult<T> = Result<T, AcmeError>;

/// Certificate chain and key produced by one issuance
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// Leaf followed by the first intermediate
    pub certificate_pem: String,
    /// PKCS#1 `RSA PRIVATE KEY`
    pub private_key_pem: String,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("certificate_pem", &self.certificate_pem)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maintenance_detection() {
        let problem = ProblemDetails::new(
            "urn:acme:error:serverInternal",
            "The service is down for maintenance or had an internal error.",
        );
        assert!(problem.is_maintenance());
        assert!(AcmeError::Account(problem).is_maintenance());

        let unavailable = ProblemDetails {
            kind: None,
            detail: "Service Unavailable".into(),
            status: Some(503),
        };
        assert!(unavailable.is_maintenance());

        let rate_limited =
            ProblemDetails::new("urn:ietf:params:acme:error:rateLimited", "too many orders");
        assert!(!rate_limited.is_maintenance());
        assert!(!AcmeError::KeyNotSet.is_maintenance());
    }

    #[test]
    fn test_already_revoked_detection() {
        assert!(ProblemDetails::new(ALREADY_REVOKED, "Certificate already revoked").is_already_revoked());
        assert!(ProblemDetails::transport(format!("400: {}", ALREADY_REVOKED)).is_already_revoked());
        assert!(!ProblemDetails::transport("unauthorized").is_already_revoked());
    }

    #[test]
    fn test_problem_display_keeps_server_text() {
        let err = AcmeError::server(
            "new order",
            ProblemDetails::new("urn:ietf:params:acme:error:rejectedIdentifier", "bad name"),
        );
        assert_eq!(
            err.to_string(),
            "ACME new order failed: urn:ietf:params:acme:error:rejectedIdentifier: bad name"
        );
    }
}
