//! TLS client configuration for ldaps:// and StartTLS connections to the directory server.

use anyhow::{Context, Result};
use rustls::ClientConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pemfile::certs;
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Build the client config used for every TLS session: system roots plus an optional CA bundle,
/// or no verification at all when `trust_all` is set.
pub fn client_config(ca_file: Option<&str>, trust_all: bool) -> Result<Arc<ClientConfig>> {
    if trust_all {
        warn!("TLS certificate verification of the directory server is disabled");
        return tls_client_config_insecure();
    }
    let extra = match ca_file {
        Some(path) => load_certs_from_file(path)?,
        None => Vec::new(),
    };
    tls_client_config_with_ca(extra)
}

fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    if !Path::new(path).exists() {
        anyhow::bail!("TLS CA file not found: {}", path);
    }
    let file = fs::File::open(path).with_context(|| format!("Open CA file: {}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

fn native_root_store() -> Result<rustls::RootCertStore> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().context("Load system CA certs")? {
        let _ = root_store.add(cert);
    }
    Ok(root_store)
}

fn tls_client_config_with_ca(extra: Vec<CertificateDer<'static>>) -> Result<Arc<ClientConfig>> {
    let mut root_store = native_root_store()?;
    for cert in extra {
        root_store.add(cert).context("Add CA certificate")?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn tls_client_config_insecure() -> Result<Arc<ClientConfig>> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    config.dangerous().set_certificate_verifier(Arc::new(InsecureServerVerifier));
    Ok(Arc::new(config))
}

/// Verifier that accepts any server certificate. Only for `ldap.trust_all` (tests, internal networks).
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// Name presented for SNI and certificate checks.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|_| anyhow::anyhow!("Invalid hostname for TLS SNI: {}", host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_trust_all_config() {
        assert!(client_config(None, true).is_ok());
    }

    #[test]
    fn test_missing_ca_file() {
        let err = client_config(Some("/nonexistent/ca.pem"), false).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_ca_file_without_certs() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not a certificate\n").unwrap();
        file.flush().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let err = load_certs_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("No certificates"));
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("ldap.example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("bad host name").is_err());
    }
}
