//! TLS acceptor for the client-facing listener.
//!
//! TLS 1.3 only, server certificate only (clients are browsers and carry no
//! certificate). The `rustls-post-quantum` provider must be installed as the
//! global default before calling into this module.

use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;

use crate::error::{BrokerError, Result};

/// Build an acceptor presenting the PEM chain in `cert_file` with the key in
/// `key_file`.
pub fn build_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor> {
    let provider = CryptoProvider::get_default()
        .cloned()
        .ok_or_else(|| BrokerError::Config("no TLS crypto provider installed".into()))?;

    // ── Certificate chain ─────────────────────────────────────────────────────
    let cert_pem = fs::read(cert_file)?;
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut Cursor::new(cert_pem))
        .collect::<std::io::Result<Vec<_>>>()?;
    if cert_chain.is_empty() {
        return Err(BrokerError::Config(format!(
            "no certificate found in {}",
            cert_file.display()
        )));
    }

    // ── Private key ───────────────────────────────────────────────────────────
    let key_pem = fs::read(key_file)?;
    let private_key = private_key(&mut Cursor::new(key_pem))?
        .ok_or_else(|| BrokerError::Config(format!(
            "no private key found in {}",
            key_file.display()
        )))?;

    let tls_config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(BrokerError::Tls)?
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(BrokerError::Tls)?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("xfilter-broker-tls-{}-{name}", std::process::id()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn missing_files_are_io_errors() {
        let _ = rustls_post_quantum::provider().install_default();
        let err = build_acceptor(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .err()
            .unwrap();
        assert!(matches!(err, BrokerError::Io(_)));
    }

    #[test]
    fn empty_pem_is_rejected() {
        let _ = rustls_post_quantum::provider().install_default();
        let cert = scratch("cert.pem", "not a certificate\n");
        let key = scratch("key.pem", "not a key\n");
        let err = build_acceptor(&cert, &key).err().unwrap();
        assert!(matches!(err, BrokerError::Config(_)));
        let _ = fs::remove_file(cert);
        let _ = fs::remove_file(key);
    }
}
