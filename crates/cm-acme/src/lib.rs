//! ACME DNS-01 certificate lifecycle: issuance against Let's Encrypt,
//! renewal decisions, revocation and status bookkeeping.

pub mod account;
pub mod certificate;
pub mod client;
pub mod csr;
pub mod issuer;
pub mod letsencrypt;
pub mod manager;
pub mod mock;
pub mod pem;
pub mod renewal;
pub mod revocation;
pub mod status;
pub mod transport;
pub mod types;

pub use certificate::ParsedCertificate;
pub use client::AcmeClient;
pub use letsencrypt::LetsEncryptClient;
pub use manager::{
    AcmeClientFactory, CertificateManager, DnsProviderFactory, FixedDnsProviderFactory,
    LetsEncryptClientFactory, SecretDnsProviderFactory,
};
pub use mock::MockAcmeClient;
pub use transport::ReqwestHttpClient;
pub use types::{AcmeError, AcmeResult, IssuedCertificate, ProblemDetails};
