use crate::types::AcmeResult;
use async_trait::async_trait;

/// Stateful ACME session driving one order at a time.
///
/// The issuer walks the calls in order: account, order, then for each
/// authorization fetch, pick the dns-01 challenge, publish its key
/// authorization and mark it ready. Accessors fail with the matching
/// "not set" error when called out of sequence.
#[async_trait]
pub trait AcmeClient: Send {
    /// Register or refresh the account contact for `email`
    async fn update_account(&mut self, email: &str) -> AcmeResult<()>;

    /// Open a new order for `domains`
    async fn create_order(&mut self, domains: &[String]) -> AcmeResult<()>;

    fn order_url(&self) -> AcmeResult<String>;

    /// Authorization URLs of the current order
    fn order_authorizations(&self) -> AcmeResult<Vec<String>>;

    async fn fetch_authorization(&mut self, url: &str) -> AcmeResult<()>;

    /// Domain of the fetched authorization, wildcard prefix removed
    fn authorization_identifier(&self) -> AcmeResult<String>;

    /// Pick the dns-01 challenge of the fetched authorization
    fn select_dns01_challenge(&mut self) -> AcmeResult<()>;

    fn challenge_url(&self) -> AcmeResult<String>;

    /// DNS encoded key authorization of the selected challenge
    fn dns01_key_authorization(&self) -> AcmeResult<String>;

    /// Tell the server the challenge is ready and wait for the authorization to settle
    async fn update_challenge(&mut self) -> AcmeResult<()>;

    /// Submit the CSR once the order is ready
    async fn finalize_order(&mut self, csr_der: &[u8]) -> AcmeResult<()>;

    /// DER chain of the issued certificate, leaf first
    async fn fetch_certificates(&mut self) -> AcmeResult<Vec<Vec<u8>>>;

    /// Revoke `cert_der`; an already revoked certificate is not an error
    async fn revoke_certificate(&mut self, cert_der: &[u8]) -> AcmeResult<()>;
}
