use crate::types::{AcmeError, AcmeResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// PEM armor around `der`, 64 columns per line
pub fn encode(tag: &str, der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {}-----\n", tag);
    for chunk in body.as_bytes().chunks(64) {
        // base64 output is ASCII
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", tag));
    out
}

/// DER of every `CERTIFICATE` block, in order
pub fn certificates(pem: &[u8]) -> AcmeResult<Vec<Vec<u8>>> {
    let mut reader = pem;
    rustls_pemfile::certs(&mut reader)
        .map(|cert| {
            cert.map(|der| der.as_ref().to_vec())
                .map_err(|e| AcmeError::CertificateParse(format!("Invalid PEM: {}", e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_wraps_lines() {
        let der = vec![0xabu8; 100];
        let pem = encode(CERTIFICATE_TAG, &der);

        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        assert!(pem.lines().all(|line| line.len() <= 64));
        assert_eq!(certificates(pem.as_bytes()).unwrap(), vec![der]);
    }

    #[test]
    fn test_certificates_keeps_order_and_skips_keys() {
        let chain = format!(
            "{}{}{}",
            encode(CERTIFICATE_TAG, b"leaf"),
            encode("RSA PRIVATE KEY", b"key"),
            encode(CERTIFICATE_TAG, b"intermediate"),
        );
        assert_eq!(
            certificates(chain.as_bytes()).unwrap(),
            vec![b"leaf".to_vec(), b"intermediate".to_vec()]
        );
    }
}
