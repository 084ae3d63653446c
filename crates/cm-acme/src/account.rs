//! Account update (RFC 8555 section 7.3.2) signed with the account key.
//!
//! instant-acme has no call for it, so the request is built here and sent
//! through the same [`HttpClient`] the library uses.

use crate::types::{AcmeError, AcmeResult, ProblemDetails};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Method, Request, StatusCode};
use http_body_util::Full;
use instant_acme::{BytesBody, BytesResponse, HttpClient};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::Deserialize;
use tracing::debug;

const JOSE_JSON: &str = "application/jose+json";
const REPLAY_NONCE: &str = "replay-nonce";
const BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
const NONCE_ATTEMPTS: u32 = 3;

/// The parts of serialized instant-acme credentials needed to sign
#[derive(Deserialize)]
struct StoredAccount {
    id: String,
    key_pkcs8: String,
    directory: Option<String>,
    urls: Option<NonceUrl>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NonceUrl {
    new_nonce: String,
}

/// Account resource as returned by the server
#[derive(Debug, Clone, Deserialize)]
pub struct AccountObject {
    pub status: String,
    #[serde(default)]
    pub contact: Vec<String>,
}

/// `mailto:` contact list for `email`, empty when no address is configured
pub fn contacts_for(email: &str) -> Vec<String> {
    let email = email.trim();
    if email.is_empty() {
        Vec::new()
    } else {
        vec![format!("mailto:{}", email)]
    }
}

/// Replace the account contacts and check the account is still usable
pub async fn update_contacts(
    http: &dyn HttpClient,
    credentials: &str,
    contacts: &[String],
) -> AcmeResult<AccountObject> {
    let stored: StoredAccount = serde_json::from_str(credentials)?;
    let key_der = URL_SAFE_NO_PAD
        .decode(stored.key_pkcs8.as_bytes())
        .map_err(|e| AcmeError::Config(format!("Invalid ACME account key encoding: {}", e)))?;
    let rng = SystemRandom::new();
    let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &key_der, &rng)
        .map_err(|e| AcmeError::Config(format!("Invalid ACME account key: {}", e)))?;

    let nonce_url = match (&stored.directory, &stored.urls) {
        (Some(directory), _) => fetch_directory(http, directory).await?.new_nonce,
        (None, Some(urls)) => urls.new_nonce.clone(),
        (None, None) => {
            return Err(AcmeError::Config(
                "ACME account credentials name no directory".into(),
            ));
        }
    };

    let payload = serde_json::json!({ "contact": contacts });
    let mut nonce = None;

    for attempt in 1..=NONCE_ATTEMPTS {
        let current = match nonce.take() {
            Some(nonce) => nonce,
            None => new_nonce(http, &nonce_url).await?,
        };
        let body = signed_body(&key, &rng, &stored.id, &current, &payload)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(&stored.id)
            .header(CONTENT_TYPE, JOSE_JSON)
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| AcmeError::Config(format!("Invalid ACME account URL: {}", e)))?;

        let response = http
            .request(request)
            .await
            .map_err(|e| AcmeError::server("update account", e))?;
        let (status, replay, body) = read_response(response).await?;

        if status.is_success() {
            let account: AccountObject = serde_json::from_slice(&body)?;
            if account.status != "valid" {
                return Err(AcmeError::Account(ProblemDetails::transport(format!(
                    "ACME account status is {}",
                    account.status
                ))));
            }
            return Ok(account);
        }

        let problem = problem_from_body(status, &body);
        if problem.kind.as_deref() == Some(BAD_NONCE) && attempt < NONCE_ATTEMPTS {
            debug!(attempt, "ACME rejected nonce, retrying account update");
            nonce = replay;
            continue;
        }
        return Err(AcmeError::Account(problem));
    }

    Err(AcmeError::Timeout("a fresh ACME nonce"))
}

async fn fetch_directory(http: &dyn HttpClient, directory: &str) -> AcmeResult<NonceUrl> {
    let request = Request::builder()
        .uri(directory)
        .body(Full::default())
        .map_err(|e| AcmeError::Config(format!("Invalid ACME directory URL: {}", e)))?;
    let response = http
        .request(request)
        .await
        .map_err(|e| AcmeError::server("fetch directory", e))?;
    let (status, _, body) = read_response(response).await?;
    if !status.is_success() {
        return Err(AcmeError::server(
            "fetch directory",
            problem_from_body(status, &body),
        ));
    }
    Ok(serde_json::from_slice(&body)?)
}

async fn new_nonce(http: &dyn HttpClient, url: &str) -> AcmeResult<String> {
    let request = Request::builder()
        .method(Method::HEAD)
        .uri(url)
        .body(Full::default())
        .map_err(|e| AcmeError::Config(format!("Invalid ACME nonce URL: {}", e)))?;
    let response = http
        .request(request)
        .await
        .map_err(|e| AcmeError::server("fetch nonce", e))?;
    let (status, nonce, _) = read_response(response).await?;
    match nonce {
        Some(nonce) if status.is_success() => Ok(nonce),
        _ => Err(AcmeError::server(
            "fetch nonce",
            ProblemDetails::transport(format!("{}: no Replay-Nonce header", status)),
        )),
    }
}

fn signed_body(
    key: &EcdsaKeyPair,
    rng: &SystemRandom,
    kid: &str,
    nonce: &str,
    payload: &serde_json::Value,
) -> AcmeResult<Vec<u8>> {
    let protected = serde_json::json!({
        "alg": "ES256",
        "kid": kid,
        "nonce": nonce,
        "url": kid,
    });
    let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&protected)?);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload)?);

    let signature = key
        .sign(rng, format!("{}.{}", protected, payload).as_bytes())
        .map_err(|_| AcmeError::Config("Failed to sign ACME account request".into()))?;

    Ok(serde_json::to_vec(&serde_json::json!({
        "protected": protected,
        "payload": payload,
        "signature": URL_SAFE_NO_PAD.encode(signature.as_ref()),
    }))?)
}

async fn read_response(
    mut response: BytesResponse,
) -> AcmeResult<(StatusCode, Option<String>, Bytes)> {
    let status = response.parts.status;
    let nonce = response
        .parts
        .headers
        .get(REPLAY_NONCE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response
        .body
        .into_bytes()
        .await
        .map_err(|e| AcmeError::server("read response", ProblemDetails::transport(e.to_string())))?;
    Ok((status, nonce, body))
}

fn problem_from_body(status: StatusCode, body: &[u8]) -> ProblemDetails {
    match serde_json::from_slice::<instant_acme::Problem>(body) {
        Ok(problem) => problem.into(),
        Err(_) => ProblemDetails {
            kind: None,
            detail: format!("{}: {}", status, String::from_utf8_lossy(body)),
            status: Some(status.as_u16()),
        },
    }
}
