use crate::types::{AcmeError, AcmeResult};
use rand_core::OsRng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::PrivatePkcs8KeyDer;

pub const RSA_KEY_BITS: usize = 2048;

/// Fresh private key and the CSR signed with it
pub struct KeyAndCsr {
    /// PKCS#1 PEM
    pub private_key_pem: String,
    pub csr_der: Vec<u8>,
}

/// RSA key and SHA-256 CSR with the first name as common name and every name as SAN
pub fn generate(dns_names: &[String]) -> AcmeResult<KeyAndCsr> {
    let common_name = dns_names.first().ok_or(AcmeError::NoDnsNames)?;

    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| AcmeError::Csr(format!("Failed to generate RSA key: {}", e)))?;
    let private_key_pem = private_key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| AcmeError::Csr(format!("Failed to encode RSA key: {}", e)))?
        .to_string();
    let pkcs8 = private_key
        .to_pkcs8_der()
        .map_err(|e| AcmeError::Csr(format!("Failed to encode RSA key: {}", e)))?;

    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(
        &PrivatePkcs8KeyDer::from(pkcs8.as_bytes()),
        &PKCS_RSA_SHA256,
    )
    .map_err(|e| AcmeError::Csr(format!("Failed to load RSA key: {}", e)))?;

    let mut params = CertificateParams::new(dns_names.to_vec())
        .map_err(|e| AcmeError::Csr(format!("Invalid DNS names: {}", e)))?;
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name.as_str());
    params.distinguished_name = distinguished_name;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| AcmeError::Csr(format!("Failed to sign CSR: {}", e)))?;

    Ok(KeyAndCsr {
        private_key_pem,
        csr_der: csr.der().to_vec(),
    })
}
