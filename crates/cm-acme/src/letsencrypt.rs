use crate::account;
use crate::client::AcmeClient;
use crate::pem;
use crate::transport::SharedHttp;
use crate::types::{AcmeError, AcmeResult, ProblemDetails};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cm_common::{Secret, SecretError, SecretStore};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, HttpClient, Identifier,
    LetsEncrypt, NewOrder, Order, OrderStatus, RevocationRequest,
};
use pkcs8::der::Encode;
use pkcs8::{AlgorithmIdentifierRef, ObjectIdentifier, PrivateKeyInfo};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// `instant-acme` credentials JSON
pub const ACCOUNT_CREDENTIALS_KEY: &str = "account-credentials";
/// ECDSA P-256 PEM account key (PKCS#8 or SEC1), paired with [`ACCOUNT_URL_KEY`]
pub const ACCOUNT_PRIVATE_KEY: &str = "private-key";
pub const ACCOUNT_URL_KEY: &str = "account-url";

/// Older installs split the account by environment
const DEPRECATED_ACCOUNT_SECRETS: &[&str] = &[
    "lets-encrypt-account-production",
    "lets-encrypt-account-staging",
];

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const CERTIFICATE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLLS: u32 = 60;

const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const PRIME256V1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");

#[derive(Debug, Clone)]
struct FetchedAuthorization {
    index: usize,
    domain: String,
    dns01: Option<Dns01Challenge>,
}

#[derive(Debug, Clone)]
struct Dns01Challenge {
    url: String,
    key_authorization: String,
}

/// [`AcmeClient`] talking to Let's Encrypt through `instant-acme`
pub struct LetsEncryptClient {
    credentials: String,
    http: Arc<dyn HttpClient>,
    poll_interval: Duration,
    account: Option<Account>,
    order: Option<Order>,
    authorization_urls: Vec<String>,
    authorization: Option<FetchedAuthorization>,
    challenge: Option<Dns01Challenge>,
}

impl LetsEncryptClient {
    /// Client for already serialized `instant-acme` credentials
    pub fn new(credentials: String, http: Arc<dyn HttpClient>) -> Self {
        Self {
            credentials,
            http,
            poll_interval: POLL_INTERVAL,
            account: None,
            order: None,
            authorization_urls: Vec::new(),
            authorization: None,
            challenge: None,
        }
    }

    /// Pause between authorization, order and certificate polls
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Load the account from `name`, falling back to the per-environment secrets
    pub async fn from_secret(
        secrets: &dyn SecretStore,
        name: &str,
        namespace: &str,
        http: Arc<dyn HttpClient>,
    ) -> AcmeResult<Self> {
        let secret = match secrets.get_secret(name, namespace).await {
            Ok(secret) => secret,
            Err(SecretError::NotFound { .. }) => {
                deprecated_account_secret(secrets, namespace)
                    .await?
                    .ok_or_else(|| SecretError::NotFound {
                        name: name.to_string(),
                        namespace: namespace.to_string(),
                    })?
            }
            Err(e) => return Err(e.into()),
        };

        let credentials = account_credentials(&secret)?;
        debug!(secret = %secret.name, namespace = %namespace, "Loaded ACME account secret");
        Ok(Self::new(serde_json::to_string(&credentials)?, http))
    }

    async fn load_account(&mut self) -> AcmeResult<Account> {
        if let Some(account) = &self.account {
            return Ok(account.clone());
        }

        let credentials: AccountCredentials = serde_json::from_str(&self.credentials)?;
        let account =
            Account::from_credentials_and_http(credentials, Box::new(SharedHttp(self.http.clone())))
                .await
            .map_err(|e| AcmeError::Account(e.into()))?;
        self.account = Some(account.clone());
        Ok(account)
    }

    fn order_mut(&mut self) -> AcmeResult<&mut Order> {
        self.order.as_mut().ok_or(AcmeError::NoOrder)
    }
}

async fn deprecated_account_secret(
    secrets: &dyn SecretStore,
    namespace: &str,
) -> AcmeResult<Option<Secret>> {
    for name in DEPRECATED_ACCOUNT_SECRETS {
        match secrets.get_secret(name, namespace).await {
            Ok(secret) => {
                warn!(secret = %name, "Using deprecated ACME account secret");
                return Ok(Some(secret));
            }
            Err(SecretError::NotFound { .. }) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

/// Credentials JSON from either supported secret layout
fn account_credentials(secret: &Secret) -> AcmeResult<serde_json::Value> {
    if let Some(raw) = secret.get(ACCOUNT_CREDENTIALS_KEY) {
        let value: serde_json::Value = serde_json::from_slice(raw)?;
        // reject malformed credentials now rather than at the first order
        serde_json::from_value::<AccountCredentials>(value.clone())?;
        return Ok(value);
    }

    let account_url = secret.require_str(ACCOUNT_URL_KEY)?.trim();
    let directory = directory_for_account(account_url)?;

    let mut reader = secret.require(ACCOUNT_PRIVATE_KEY)?;
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| AcmeError::Config(format!("Invalid ACME account key: {}", e)))?
        .ok_or_else(|| AcmeError::Config("ACME account key holds no private key".into()))?;
    let pkcs8 = match key {
        PrivateKeyDer::Pkcs8(der) => der.secret_pkcs8_der().to_vec(),
        PrivateKeyDer::Sec1(der) => sec1_to_pkcs8(der.secret_sec1_der())?,
        _ => {
            return Err(AcmeError::Config(
                "ACME account key must be an ECDSA P-256 key, RSA keys are not supported".into(),
            ));
        }
    };
    EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &pkcs8, &SystemRandom::new())
        .map_err(|e| AcmeError::Config(format!("ACME account key is not ECDSA P-256: {}", e)))?;

    let value = serde_json::json!({
        "id": account_url,
        "key_pkcs8": URL_SAFE_NO_PAD.encode(&pkcs8),
        "directory": directory,
    });
    serde_json::from_value::<AccountCredentials>(value.clone())?;
    Ok(value)
}

/// Wrap an `EC PRIVATE KEY` in a PKCS#8 envelope for P-256
fn sec1_to_pkcs8(sec1: &[u8]) -> AcmeResult<Vec<u8>> {
    let algorithm = AlgorithmIdentifierRef {
        oid: EC_PUBLIC_KEY,
        parameters: Some((&PRIME256V1).into()),
    };
    PrivateKeyInfo::new(algorithm, sec1)
        .to_der()
        .map_err(|e| AcmeError::Config(format!("Invalid EC account key: {}", e)))
}

/// Staging or production directory, chosen by the account URL host
fn directory_for_account(account_url: &str) -> AcmeResult<&'static str> {
    let parsed = url::Url::parse(account_url)
        .map_err(|e| AcmeError::Config(format!("Invalid ACME account URL: {}", e)))?;
    let host = parsed.host_str().unwrap_or_default();

    [LetsEncrypt::Staging.url(), LetsEncrypt::Production.url()]
        .into_iter()
        .find(|directory| {
            url::Url::parse(directory)
                .ok()
                .is_some_and(|d| d.host_str() == Some(host))
        })
        .ok_or_else(|| {
            AcmeError::Config(format!(
                "Cannot find a Let's Encrypt directory for account host {}",
                host
            ))
        })
}

fn problem_details(problem: &instant_acme::Problem) -> ProblemDetails {
    ProblemDetails::from(problem.clone())
}

#[async_trait]
impl AcmeClient for LetsEncryptClient {
    async fn update_account(&mut self, email: &str) -> AcmeResult<()> {
        let contacts = account::contacts_for(email);
        let updated =
            account::update_contacts(self.http.as_ref(), &self.credentials, &contacts).await?;
        info!(contact = ?updated.contact, "ACME account updated");

        self.account = None;
        self.load_account().await?;
        Ok(())
    }

    async fn create_order(&mut self, domains: &[String]) -> AcmeResult<()> {
        let account = self.load_account().await?;
        let identifiers: Vec<Identifier> =
            domains.iter().map(|d| Identifier::Dns(d.clone())).collect();

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AcmeError::server("new order", e))?;

        self.authorization_urls = order.state().authorizations.clone();
        self.order = Some(order);
        self.authorization = None;
        self.challenge = None;
        Ok(())
    }

    fn order_url(&self) -> AcmeResult<String> {
        self.order
            .as_ref()
            .map(|order| order.url().to_string())
            .ok_or(AcmeError::NoOrder)
    }

    fn order_authorizations(&self) -> AcmeResult<Vec<String>> {
        if self.order.is_none() {
            return Err(AcmeError::NoOrder);
        }
        Ok(self.authorization_urls.clone())
    }

    async fn fetch_authorization(&mut self, url: &str) -> AcmeResult<()> {
        let index = self
            .authorization_urls
            .iter()
            .position(|u| u == url)
            .ok_or(AcmeError::NoAuthorization)?;

        let order = self.order_mut()?;
        let authorization = order
            .authorizations()
            .await
            .map_err(|e| AcmeError::server("fetch authorization", e))?
            .into_iter()
            .nth(index)
            .ok_or(AcmeError::NoAuthorization)?;

        let domain = match &authorization.identifier {
            Identifier::Dns(d) => d.clone(),
        };
        let dns01 = authorization
            .challenges
            .iter()
            .find(|c| c.r#type == ChallengeType::Dns01)
            .map(|c| Dns01Challenge {
                url: c.url.clone(),
                key_authorization: if c.token.trim().is_empty() {
                    String::new()
                } else {
                    order.key_authorization(c).dns_value()
                },
            });

        debug!(domain = %domain, status = ?authorization.status, "Fetched ACME authorization");
        self.authorization = Some(FetchedAuthorization {
            index,
            domain,
            dns01,
        });
        self.challenge = None;
        Ok(())
    }

    fn authorization_identifier(&self) -> AcmeResult<String> {
        self.authorization
            .as_ref()
            .map(|a| a.domain.clone())
            .filter(|domain| !domain.trim().is_empty())
            .ok_or(AcmeError::IdentifierNotSet)
    }

    fn select_dns01_challenge(&mut self) -> AcmeResult<()> {
        let authorization = self.authorization.as_ref().ok_or(AcmeError::NoAuthorization)?;
        let challenge =
            authorization
                .dns01
                .clone()
                .ok_or_else(|| AcmeError::NoDns01Challenge {
                    domain: authorization.domain.clone(),
                })?;
        self.challenge = Some(challenge);
        Ok(())
    }

    fn challenge_url(&self) -> AcmeResult<String> {
        self.challenge
            .as_ref()
            .map(|c| c.url.clone())
            .ok_or(AcmeError::KeyNotSet)
    }

    fn dns01_key_authorization(&self) -> AcmeResult<String> {
        self.challenge
            .as_ref()
            .map(|c| c.key_authorization.clone())
            .filter(|key| !key.is_empty())
            .ok_or(AcmeError::KeyNotSet)
    }

    async fn update_challenge(&mut self) -> AcmeResult<()> {
        let challenge = self.challenge.clone().ok_or(AcmeError::KeyNotSet)?;
        let poll_interval = self.poll_interval;
        let FetchedAuthorization { index, domain, .. } = self
            .authorization
            .clone()
            .ok_or(AcmeError::NoAuthorization)?;
        let order = self.order_mut()?;

        order
            .set_challenge_ready(&challenge.url)
            .await
            .map_err(|e| AcmeError::server("set challenge ready", e))?;

        for attempt in 1..=MAX_POLLS {
            tokio::time::sleep(poll_interval).await;

            let authorization = order
                .authorizations()
                .await
                .map_err(|e| AcmeError::server("fetch authorization", e))?
                .into_iter()
                .nth(index)
                .ok_or(AcmeError::NoAuthorization)?;

            match authorization.status {
                AuthorizationStatus::Valid => {
                    info!(domain = %domain, "ACME authorization valid");
                    return Ok(());
                }
                AuthorizationStatus::Pending => {
                    debug!(domain = %domain, attempt, "ACME authorization pending");
                }
                AuthorizationStatus::Invalid => {
                    let detail = authorization
                        .challenges
                        .iter()
                        .find(|c| c.r#type == ChallengeType::Dns01)
                        .and_then(|c| c.error.as_ref())
                        .map(|p| problem_details(p).to_string())
                        .unwrap_or_else(|| "authorization is invalid".to_string());
                    return Err(AcmeError::ValidationFailed { domain, detail });
                }
                status => {
                    return Err(AcmeError::ValidationFailed {
                        domain,
                        detail: format!("authorization is {:?}", status),
                    });
                }
            }
        }

        Err(AcmeError::Timeout("authorization validation"))
    }

    async fn finalize_order(&mut self, csr_der: &[u8]) -> AcmeResult<()> {
        let poll_interval = self.poll_interval;
        let order = self.order_mut()?;

        for attempt in 1..=MAX_POLLS {
            let (status, error) = {
                let state = order
                    .refresh()
                    .await
                    .map_err(|e| AcmeError::server("refresh order", e))?;
                (state.status, state.error.as_ref().map(problem_details))
            };

            match status {
                OrderStatus::Ready => {
                    order
                        .finalize(csr_der)
                        .await
                        .map_err(|e| AcmeError::server("finalize order", e))?;
                    info!(order = %order.url(), "ACME order finalized");
                    return Ok(());
                }
                OrderStatus::Valid => {
                    info!(order = %order.url(), "ACME order already valid");
                    return Ok(());
                }
                OrderStatus::Invalid => {
                    return Err(AcmeError::server(
                        "finalize order",
                        error.unwrap_or_else(|| ProblemDetails::transport("order became invalid")),
                    ));
                }
                status => {
                    debug!(status = ?status, attempt, "ACME order not ready yet");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }

        Err(AcmeError::Timeout("order to become ready"))
    }

    async fn fetch_certificates(&mut self) -> AcmeResult<Vec<Vec<u8>>> {
        let poll_interval = self.poll_interval.min(CERTIFICATE_POLL_INTERVAL);
        let order = self.order_mut()?;

        for attempt in 1..=MAX_POLLS {
            match order
                .certificate()
                .await
                .map_err(|e| AcmeError::server("fetch certificate", e))?
            {
                Some(chain) => return pem::certificates(chain.as_bytes()),
                None => {
                    debug!(attempt, "Certificate not ready yet");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }

        Err(AcmeError::Timeout("certificate"))
    }

    async fn revoke_certificate(&mut self, cert_der: &[u8]) -> AcmeResult<()> {
        let account = self.load_account().await?;
        let certificate = CertificateDer::from(cert_der);

        match account
            .revoke(&RevocationRequest {
                certificate: &certificate,
                reason: None,
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                let problem = ProblemDetails::from(e);
                if problem.is_already_revoked() {
                    info!("Certificate was already revoked");
                    Ok(())
                } else {
                    Err(AcmeError::server("revoke certificate", problem))
                }
            }
        }
    }
}
