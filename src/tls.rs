//! Mutual-TLS configuration, built from on-disk PEM files.
//!
//! The library only ever consumes file *paths*; provisioning,
//! rotation, and the trust store itself are an out-of-band concern.
//! Both configurations built here verify the peer's certificate and
//! fail closed if the peer presents none — "TLS ≥ 1.0, fail closed on
//! a missing peer certificate" translated to `rustls`'s default
//! protocol-version set plus an explicit client-cert verifier.

use std::path::Path;
use std::sync::Arc;
use std::sync::Once;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::{Error, ErrorKind, Result, ResultSimpleExt, ResultWrappedExt};

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

fn ensure_crypto_provider() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        // Ignore the error: a prior call elsewhere in the process may have
        // already installed a (compatible) default provider.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path).wrapped(ErrorKind::HandshakeFailed)?,
    );
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .wrapped(ErrorKind::HandshakeFailed)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path).wrapped(ErrorKind::HandshakeFailed)?,
    );
    rustls_pemfile::private_key(&mut reader)
        .wrapped(ErrorKind::HandshakeFailed)?
        .ok_or_else(|| Error::simple(ErrorKind::HandshakeFailed))
}

fn load_root_store(ca_path: &Path) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        store.add(cert).simple(ErrorKind::HandshakeFailed)?;
    }
    Ok(store)
}

/// File paths identifying one endpoint's TLS identity and trust anchor.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub certificate: std::path::PathBuf,
    pub private_key: std::path::PathBuf,
    pub ca_bundle: std::path::PathBuf,
}

/// Builds a server-side TLS configuration that requires and verifies a
/// client certificate against `paths.ca_bundle` before completing the
/// handshake.
pub fn build_server_config(paths: &TlsPaths) -> Result<Arc<ServerConfig>> {
    ensure_crypto_provider();

    let certs = load_certs(&paths.certificate)?;
    let key = load_private_key(&paths.private_key)?;
    let roots = Arc::new(load_root_store(&paths.ca_bundle)?);

    let client_verifier = WebPkiClientVerifier::builder(roots)
        .build()
        .simple(ErrorKind::HandshakeFailed)?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .wrapped(ErrorKind::HandshakeFailed)?;

    Ok(Arc::new(config))
}

/// Builds a client-side TLS configuration that presents
/// `paths.certificate`/`paths.private_key` and verifies the server
/// against `paths.ca_bundle`.
pub fn build_client_config(paths: &TlsPaths) -> Result<Arc<ClientConfig>> {
    ensure_crypto_provider();

    let certs = load_certs(&paths.certificate)?;
    let key = load_private_key(&paths.private_key)?;
    let roots = load_root_store(&paths.ca_bundle)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .wrapped(ErrorKind::HandshakeFailed)?;

    Ok(Arc::new(config))
}
