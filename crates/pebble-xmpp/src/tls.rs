//! TLS material for STARTTLS.

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::XmppError;

/// Load a TLS acceptor from PEM certificate chain and private key files.
pub fn load_tls_acceptor(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<TlsAcceptor, XmppError> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let cert_file = File::open(cert_path).map_err(|e| {
        XmppError::config(format!("Failed to open cert file {}: {}", cert_path.display(), e))
    })?;
    let key_file = File::open(key_path).map_err(|e| {
        XmppError::config(format!("Failed to open key file {}: {}", key_path.display(), e))
    })?;

    let acceptor = build_acceptor(&mut BufReader::new(cert_file), &mut BufReader::new(key_file))?;
    info!(cert = %cert_path.display(), "TLS certificate loaded");
    Ok(acceptor)
}

/// Build a TLS acceptor from in-memory PEM data.
pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, XmppError> {
    build_acceptor(&mut Cursor::new(cert_pem), &mut Cursor::new(key_pem))
}

fn build_acceptor(
    cert_reader: &mut dyn BufRead,
    key_reader: &mut dyn BufRead,
) -> Result<TlsAcceptor, XmppError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| XmppError::config(format!("Invalid certificate PEM: {}", e)))?;

    if certs.is_empty() {
        return Err(XmppError::config("No certificate found"));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(key_reader)
        .map_err(|e| XmppError::config(format!("Invalid private key PEM: {}", e)))?
        .ok_or_else(|| XmppError::config("No private key found"))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let server_config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
