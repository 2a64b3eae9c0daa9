//! TLS configuration for the OTP listener.
//!
//! Loads the server certificate chain and private key from PEM files and builds
//! a rustls server config. When a client CA bundle is configured, clients must
//! present a certificate issued by it (mutual TLS); otherwise any client may
//! complete the handshake.
//!
//! The server refuses to start without valid TLS assets.

use anyhow::{Context, Result, anyhow};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pemfile::{certs, ec_private_keys, pkcs8_private_keys, rsa_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

#[derive(Debug, Clone)]
pub struct TlsPaths {
    cert: PathBuf,
    key: PathBuf,
    client_ca: Option<PathBuf>,
}

impl TlsPaths {
    #[must_use]
    pub fn from_cli(cert: String, key: String, client_ca: Option<String>) -> Self {
        Self {
            cert: PathBuf::from(cert),
            key: PathBuf::from(key),
            client_ca: client_ca.map(PathBuf::from),
        }
    }

    #[must_use]
    pub fn cert_path(&self) -> &Path {
        &self.cert
    }

    #[must_use]
    pub fn key_path(&self) -> &Path {
        &self.key
    }

    #[must_use]
    pub fn client_ca_path(&self) -> Option<&Path> {
        self.client_ca.as_deref()
    }
}

/// Build the server config from the configured PEM files.
///
/// # Errors
/// Returns an error if the certificate, key or client CA bundle cannot be read
/// or parsed, or if rustls rejects the combination.
pub fn load_server_config(paths: &TlsPaths) -> Result<ServerConfig> {
    let cert_chain = load_cert_chain(paths.cert_path())?;
    let key = load_private_key(paths.key_path())?;

    let builder = ServerConfig::builder();
    let builder = match paths.client_ca_path() {
        Some(ca) => {
            let roots = load_root_store(ca)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| anyhow!("Failed to build client certificate verifier: {e}"))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    builder
        .with_single_cert(cert_chain, key)
        .context("TLS certificate and key do not match")
}

/// Convenience wrapper returning a ready acceptor.
///
/// # Errors
/// See [`load_server_config`].
pub fn load_acceptor(paths: &TlsPaths) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(Arc::new(load_server_config(paths)?)))
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open TLS certificate: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read TLS certificate: {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("TLS certificate is empty: {}", path.display()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let open = || {
        File::open(path)
            .map(BufReader::new)
            .with_context(|| format!("Failed to open TLS key: {}", path.display()))
    };

    let mut keys = pkcs8_private_keys(&mut open()?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read PKCS#8 TLS key: {}", path.display()))?;
    if let Some(key) = keys.pop() {
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    let mut keys = ec_private_keys(&mut open()?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read SEC1 TLS key: {}", path.display()))?;
    if let Some(key) = keys.pop() {
        return Ok(PrivateKeyDer::Sec1(key));
    }

    let mut keys = rsa_private_keys(&mut open()?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read PKCS#1 TLS key: {}", path.display()))?;
    if let Some(key) = keys.pop() {
        return Ok(PrivateKeyDer::Pkcs1(key));
    }

    Err(anyhow!("TLS private key not found: {}", path.display()))
}

fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open TLS CA bundle: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read TLS CA bundle: {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("TLS CA bundle is empty: {}", path.display()));
    }
    let mut store = RootCertStore::empty();
    let (added, _) = store.add_parsable_certificates(certs);
    if added == 0 {
        return Err(anyhow!(
            "No valid CA certificates found in {}",
            path.display()
        ));
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn scratch_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("otp-server-tls-test-{label}-{}", Ulid::new()))
    }

    #[test]
    fn load_private_key_missing_fails() {
        let path = scratch_dir("key");
        assert!(load_private_key(&path).is_err());
    }

    #[test]
    fn load_root_store_missing_fails() {
        let path = scratch_dir("ca");
        assert!(load_root_store(&path).is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn empty_certificate_is_rejected() {
        let dir = scratch_dir("empty");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tls.crt");
        std::fs::write(&path, "").unwrap();
        let err = load_cert_chain(&path).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn load_valid_config_with_and_without_client_ca() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let dir = scratch_dir("valid");
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("tls.crt");
        let key_path = dir.join("tls.key");

        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();

        let cert_s = cert_path.display().to_string();
        let key_s = key_path.display().to_string();

        let plain = TlsPaths::from_cli(cert_s.clone(), key_s.clone(), None);
        let config = load_server_config(&plain);
        assert!(config.is_ok(), "{:?}", config.err());

        // Self-signed: the server certificate doubles as the client CA.
        let mutual = TlsPaths::from_cli(cert_s, key_s, Some(cert_path.display().to_string()));
        assert!(load_acceptor(&mutual).is_ok());
    }
}
