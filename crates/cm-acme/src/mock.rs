//! In-memory ACME server double.
//!
//! Signs the submitted CSR with a throwaway intermediate named like the
//! Let's Encrypt staging issuer, so certificates it hands out pass the
//! revocation issuer check and parse like real ones.

use crate::client::AcmeClient;
use crate::types::{AcmeError, AcmeResult, ProblemDetails};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, IsCa, KeyPair, SanType,
};
use rustls::pki_types::CertificateSigningRequestDer;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

pub const MOCK_ISSUER: &str = "Fake LE Intermediate X1";
const MOCK_BASE_URL: &str = "https://acme.mock.invalid";
const MAINTENANCE_KIND: &str = "urn:acme:error:serverInternal";
const MAINTENANCE_DETAIL: &str = "The service is down for maintenance or had an internal error. Check https://letsencrypt.status.io/ for more details";

/// What the mock was asked to do, shared between clones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockAcmeCalls {
    pub contacts: Vec<String>,
    pub orders: Vec<Vec<String>>,
    pub ready_challenges: Vec<String>,
    pub finalized: usize,
    pub revoked: Vec<Vec<u8>>,
}

struct MockIssuer {
    certificate: Certificate,
    key: KeyPair,
}

impl MockIssuer {
    fn generate() -> AcmeResult<Self> {
        let key = KeyPair::generate()
            .map_err(|e| AcmeError::Csr(format!("Failed to generate issuer key: {}", e)))?;
        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| AcmeError::Csr(format!("Invalid issuer params: {}", e)))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, MOCK_ISSUER);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let certificate = params
            .self_signed(&key)
            .map_err(|e| AcmeError::Csr(format!("Failed to sign issuer: {}", e)))?;
        Ok(Self { certificate, key })
    }
}

#[derive(Debug, Default)]
struct Session {
    order: Option<MockOrder>,
    authorization: Option<String>,
    challenge: Option<String>,
    certificates: Option<Vec<Vec<u8>>>,
}

#[derive(Debug)]
struct MockOrder {
    url: String,
    domains: Vec<String>,
    validated: BTreeSet<String>,
}

/// Scriptable [`AcmeClient`] for tests and dry runs
#[derive(Clone)]
pub struct MockAcmeClient {
    available: bool,
    offer_dns01: bool,
    validation_failure: Option<String>,
    revoke_problem: Option<ProblemDetails>,
    issuer: Arc<MockIssuer>,
    calls: Arc<Mutex<MockAcmeCalls>>,
    session: Arc<Mutex<Session>>,
}

impl fmt::Debug for MockAcmeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockAcmeClient")
            .field("available", &self.available)
            .field("offer_dns01", &self.offer_dns01)
            .field("validation_failure", &self.validation_failure)
            .field("revoke_problem", &self.revoke_problem)
            .finish_non_exhaustive()
    }
}

impl MockAcmeClient {
    pub fn new() -> AcmeResult<Self> {
        Ok(Self {
            available: true,
            offer_dns01: true,
            validation_failure: None,
            revoke_problem: None,
            issuer: Arc::new(MockIssuer::generate()?),
            calls: Arc::new(Mutex::new(MockAcmeCalls::default())),
            session: Arc::new(Mutex::new(Session::default())),
        })
    }

    /// Fail account and order calls the way Let's Encrypt does during maintenance
    pub fn unavailable(self) -> Self {
        Self {
            available: false,
            ..self
        }
    }

    /// Offer only http-01 challenges
    pub fn without_dns01(self) -> Self {
        Self {
            offer_dns01: false,
            ..self
        }
    }

    /// Mark every authorization invalid once its challenge is submitted
    pub fn with_validation_failure(self, detail: &str) -> Self {
        Self {
            validation_failure: Some(detail.to_string()),
            ..self
        }
    }

    pub fn with_revoke_problem(self, problem: ProblemDetails) -> Self {
        Self {
            revoke_problem: Some(problem),
            ..self
        }
    }

    /// A client sharing the call log and issuer, with a fresh session
    pub fn fork(&self) -> Self {
        Self {
            session: Arc::new(Mutex::new(Session::default())),
            ..self.clone()
        }
    }

    pub fn calls(&self) -> MockAcmeCalls {
        self.calls.lock().clone()
    }

    fn ensure_available(&self, operation: &'static str) -> AcmeResult<()> {
        if self.available {
            return Ok(());
        }
        Err(AcmeError::server(
            operation,
            ProblemDetails::new(MAINTENANCE_KIND, MAINTENANCE_DETAIL),
        ))
    }

    fn sign(&self, csr_der: &[u8], domains: &[String]) -> AcmeResult<Vec<Vec<u8>>> {
        let mut csr = CertificateSigningRequestParams::from_der(
            &CertificateSigningRequestDer::from(csr_der.to_vec()),
        )
        .map_err(|e| bad_csr(format!("Unparseable CSR: {}", e)))?;

        let requested: BTreeSet<String> = csr
            .params
            .subject_alt_names
            .iter()
            .filter_map(|san| match san {
                SanType::DnsName(name) => Some(name.as_str().to_ascii_lowercase()),
                _ => None,
            })
            .collect();
        let ordered: BTreeSet<String> = domains.iter().map(|d| d.to_ascii_lowercase()).collect();
        if requested != ordered {
            return Err(bad_csr(format!(
                "CSR names {:?} do not match order {:?}",
                requested, ordered
            )));
        }

        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now - Duration::hours(1);
        csr.params.not_after = now + Duration::days(90);

        let leaf = csr
            .signed_by(&self.issuer.certificate, &self.issuer.key)
            .map_err(|e| bad_csr(format!("Failed to sign CSR: {}", e)))?;

        Ok(vec![
            leaf.der().to_vec(),
            self.issuer.certificate.der().to_vec(),
        ])
    }
}

fn bad_csr(detail: String) -> AcmeError {
    AcmeError::server(
        "finalize order",
        ProblemDetails::new("urn:ietf:params:acme:error:badCSR", detail),
    )
}

fn authorization_url(order: &MockOrder, index: usize) -> String {
    format!("{}/authz/{}", order.url, index)
}

/// Identifier the server reports for a requested name
fn identifier(domain: &str) -> String {
    domain.trim_start_matches("*.").to_ascii_lowercase()
}

#[async_trait]
impl AcmeClient for MockAcmeClient {
    async fn update_account(&mut self, email: &str) -> AcmeResult<()> {
        if !self.available {
            return Err(AcmeError::Account(ProblemDetails::new(
                MAINTENANCE_KIND,
                MAINTENANCE_DETAIL,
            )));
        }
        self.calls.lock().contacts.push(format!("mailto:{}", email));
        Ok(())
    }

    async fn create_order(&mut self, domains: &[String]) -> AcmeResult<()> {
        self.ensure_available("new order")?;
        let mut calls = self.calls.lock();
        calls.orders.push(domains.to_vec());
        let url = format!("{}/order/{}", MOCK_BASE_URL, calls.orders.len());

        *self.session.lock() = Session {
            order: Some(MockOrder {
                url,
                domains: domains.to_vec(),
                validated: BTreeSet::new(),
            }),
            ..Session::default()
        };
        Ok(())
    }

    fn order_url(&self) -> AcmeResult<String> {
        let session = self.session.lock();
        let order = session.order.as_ref().ok_or(AcmeError::NoOrder)?;
        Ok(order.url.clone())
    }

    fn order_authorizations(&self) -> AcmeResult<Vec<String>> {
        let session = self.session.lock();
        let order = session.order.as_ref().ok_or(AcmeError::NoOrder)?;
        Ok((0..order.domains.len())
            .map(|i| authorization_url(order, i))
            .collect())
    }

    async fn fetch_authorization(&mut self, url: &str) -> AcmeResult<()> {
        let mut session = self.session.lock();
        let order = session.order.as_ref().ok_or(AcmeError::NoOrder)?;
        let domain = (0..order.domains.len())
            .find(|i| authorization_url(order, *i) == url)
            .map(|i| identifier(&order.domains[i]))
            .ok_or_else(|| {
                AcmeError::server(
                    "fetch authorization",
                    ProblemDetails::new("urn:ietf:params:acme:error:malformed", url),
                )
            })?;
        session.authorization = Some(domain);
        session.challenge = None;
        Ok(())
    }

    fn authorization_identifier(&self) -> AcmeResult<String> {
        self.session
            .lock()
            .authorization
            .clone()
            .ok_or(AcmeError::IdentifierNotSet)
    }

    fn select_dns01_challenge(&mut self) -> AcmeResult<()> {
        let mut session = self.session.lock();
        let domain = session
            .authorization
            .clone()
            .ok_or(AcmeError::NoAuthorization)?;
        if !self.offer_dns01 {
            return Err(AcmeError::NoDns01Challenge { domain });
        }
        session.challenge = Some(format!("{}/chall/{}", MOCK_BASE_URL, domain));
        Ok(())
    }

    fn challenge_url(&self) -> AcmeResult<String> {
        self.session.lock().challenge.clone().ok_or(AcmeError::KeyNotSet)
    }

    fn dns01_key_authorization(&self) -> AcmeResult<String> {
        let session = self.session.lock();
        let challenge = session.challenge.as_ref().ok_or(AcmeError::KeyNotSet)?;
        Ok(URL_SAFE_NO_PAD.encode(challenge.as_bytes()))
    }

    async fn update_challenge(&mut self) -> AcmeResult<()> {
        let mut session = self.session.lock();
        let url = session.challenge.clone().ok_or(AcmeError::KeyNotSet)?;
        let domain = session
            .authorization
            .clone()
            .ok_or(AcmeError::NoAuthorization)?;
        self.calls.lock().ready_challenges.push(url);

        if let Some(detail) = &self.validation_failure {
            return Err(AcmeError::ValidationFailed {
                domain,
                detail: detail.clone(),
            });
        }

        let order = session.order.as_mut().ok_or(AcmeError::NoOrder)?;
        order.validated.insert(domain);
        Ok(())
    }

    async fn finalize_order(&mut self, csr_der: &[u8]) -> AcmeResult<()> {
        let mut session = self.session.lock();
        let order = session.order.as_ref().ok_or(AcmeError::NoOrder)?;

        let pending: Vec<String> = order
            .domains
            .iter()
            .map(|d| identifier(d))
            .filter(|d| !order.validated.contains(d))
            .collect();
        if !pending.is_empty() {
            return Err(AcmeError::server(
                "finalize order",
                ProblemDetails::new(
                    "urn:ietf:params:acme:error:orderNotReady",
                    format!("Authorizations pending for {}", pending.join(", ")),
                ),
            ));
        }

        let chain = self.sign(csr_der, &order.domains)?;
        self.calls.lock().finalized += 1;
        session.certificates = Some(chain);
        Ok(())
    }

    async fn fetch_certificates(&mut self) -> AcmeResult<Vec<Vec<u8>>> {
        self.session
            .lock()
            .certificates
            .clone()
            .ok_or(AcmeError::Timeout("certificate"))
    }

    async fn revoke_certificate(&mut self, cert_der: &[u8]) -> AcmeResult<()> {
        self.ensure_available("revoke certificate")?;
        self.calls.lock().revoked.push(cert_der.to_vec());
        match &self.revoke_problem {
            Some(problem) if problem.is_already_revoked() => Ok(()),
            Some(problem) => Err(AcmeError::server("revoke certificate", problem.clone())),
            None => Ok(()),
        }
    }
}
