//! Shared building blocks for certman: certificate request model, environment
//! configuration and the secret store the issuance core reads credentials from.

pub mod config;
pub mod error;
pub mod secrets;
pub mod types;

pub use config::CertmanConfig;
pub use error::AppError;
pub use secrets::{FileSecretStore, MemorySecretStore, Secret, SecretError, SecretStore};
pub use types::{CertificateRequest, CertificateRequestStatus, Platform, SecretRef};
