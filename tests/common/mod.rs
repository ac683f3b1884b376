//! Throwaway mutual-TLS certificate fixtures for the integration tests.
//!
//! A single self-signed CA signs both a "server" leaf certificate and a
//! "client" leaf certificate, so each side's trust store can verify the
//! other. Nothing here is meant to resemble real certificate
//! provisioning — that is explicitly out of this crate's scope.

use std::path::PathBuf;
use std::sync::Once;
use std::time::{Duration, Instant};

use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use tempfile::TempDir;

use meshlink::TlsPaths;

static INIT_TRACING: Once = Once::new();

/// Installs a `tracing` subscriber filtered by `RUST_LOG` (defaulting to
/// `meshlink=debug`) so a failing test's reactor/dispatcher log lines
/// show up in `cargo test -- --nocapture`. Safe to call from every test;
/// only the first call installs anything.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "meshlink=debug".into()))
            .with_test_writer()
            .init();
    });
}

pub struct TlsFixture {
    // Held only to keep the temp directory alive for the test's duration.
    pub _dir: TempDir,
    pub server: TlsPaths,
    pub client: TlsPaths,
}

pub fn generate_mutual_tls_fixture() -> TlsFixture {
    let dir = TempDir::new().expect("failed to create temp dir for test certs");

    let mut ca_params = CertificateParams::new(Vec::new()).expect("ca params");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().expect("ca key");
    let ca_cert = ca_params.self_signed(&ca_key).expect("ca self-sign");

    let ca_path = write_pem(&dir, "ca.pem", &ca_cert.pem());

    let server_key = KeyPair::generate().expect("server key");
    let server_params = CertificateParams::new(vec!["localhost".to_string()]).expect("server params");
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).expect("server sign");
    let server_cert_path = write_pem(&dir, "server-cert.pem", &server_cert.pem());
    let server_key_path = write_pem(&dir, "server-key.pem", &server_key.serialize_pem());

    let client_key = KeyPair::generate().expect("client key");
    let client_params = CertificateParams::new(vec!["localhost".to_string()]).expect("client params");
    let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key).expect("client sign");
    let client_cert_path = write_pem(&dir, "client-cert.pem", &client_cert.pem());
    let client_key_path = write_pem(&dir, "client-key.pem", &client_key.serialize_pem());

    TlsFixture {
        server: TlsPaths { certificate: server_cert_path, private_key: server_key_path, ca_bundle: ca_path.clone() },
        client: TlsPaths { certificate: client_cert_path, private_key: client_key_path, ca_bundle: ca_path },
        _dir: dir,
    }
}

fn write_pem(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).expect("failed to write test cert");
    path
}

/// A deterministic-per-process port so parallel test binaries don't
/// collide as often as a single fixed constant would.
pub fn unique_port(offset: u16) -> u16 {
    20000 + ((std::process::id() as u16).wrapping_add(offset.wrapping_mul(97)) % 10000)
}

pub fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    predicate()
}
