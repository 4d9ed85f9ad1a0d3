//! TLS utilities for the node agent channel.
//!
//! Loads PEM material from disk and builds:
//! - the agent's rustls server config, optionally requiring client certificates (mTLS)
//! - the orchestrator's HTTP client trust roots and client identity

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::fs;

use crate::config::TlsConfig;

/// Error type for TLS configuration issues.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("Certificate path not configured")]
    MissingCert,

    #[error("Private key path not configured")]
    MissingKey,

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("Certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("No PEM certificates in {0}")]
    EmptyCertificate(PathBuf),

    #[error("No private key in {0}")]
    EmptyKey(PathBuf),

    #[error("Invalid TLS configuration: {0}")]
    Invalid(String),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),
}

/// Loaded TLS materials for the agent server.
#[derive(Clone, Debug)]
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: Arc<PrivateKeyDer<'static>>,
    /// Roots used to verify client certificates.
    client_roots: Option<Arc<RootCertStore>>,
}

impl TlsIdentity {
    /// Load TLS materials from file paths specified in the config.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Any required path is not configured
    /// - Any file does not exist, cannot be read, or holds no PEM items
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let cert_path = config.cert_path.as_ref().ok_or(TlsError::MissingCert)?;
        let key_path = config.key_path.as_ref().ok_or(TlsError::MissingKey)?;

        if !cert_path.exists() {
            return Err(TlsError::CertNotFound(cert_path.clone()));
        }
        if !key_path.exists() {
            return Err(TlsError::KeyNotFound(key_path.clone()));
        }

        let certs = read_certs(cert_path).await?;
        let key = read_key(key_path).await?;

        let client_roots = if config.require_client_cert {
            let ca_path = config.ca_cert_path.as_ref().ok_or(TlsError::MissingCaCert)?;
            if !ca_path.exists() {
                return Err(TlsError::CaCertNotFound(ca_path.clone()));
            }
            let mut roots = RootCertStore::empty();
            for ca in read_certs(ca_path).await? {
                roots
                    .add(ca)
                    .map_err(|e| TlsError::Invalid(format!("bad CA certificate: {}", e)))?;
            }
            Some(Arc::new(roots))
        } else {
            None
        };

        Ok(Self {
            certs,
            key: Arc::new(key),
            client_roots,
        })
    }

    pub fn requires_client_cert(&self) -> bool {
        self.client_roots.is_some()
    }

    /// Create the agent's server config.
    ///
    /// With client roots loaded, the returned config requires every client to
    /// present a certificate chaining to the configured CA.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Invalid(e.to_string()))?;

        let builder = match &self.client_roots {
            Some(roots) => {
                let verifier = WebPkiClientVerifier::builder_with_provider(roots.clone(), provider)
                    .build()
                    .map_err(|e| TlsError::Invalid(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let config = builder
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| TlsError::Invalid(e.to_string()))?;
        Ok(Arc::new(config))
    }
}

/// Trust roots and optional client identity for talking to agents over TLS.
#[derive(Clone, Debug, Default)]
pub struct ClientTls {
    ca_pem: Option<Vec<u8>>,
    identity_pem: Option<Vec<u8>>,
}

impl ClientTls {
    /// Load the CA used to verify agents and, for mTLS, this client's cert and key.
    pub async fn load(
        ca_cert: Option<&Path>,
        cert: Option<&Path>,
        key: Option<&Path>,
    ) -> Result<Self, TlsError> {
        let ca_pem = match ca_cert {
            Some(path) => {
                if !path.exists() {
                    return Err(TlsError::CaCertNotFound(path.to_path_buf()));
                }
                Some(fs::read(path).await?)
            }
            None => None,
        };

        let identity_pem = match (cert, key) {
            (Some(cert), Some(key)) => {
                if !cert.exists() {
                    return Err(TlsError::CertNotFound(cert.to_path_buf()));
                }
                if !key.exists() {
                    return Err(TlsError::KeyNotFound(key.to_path_buf()));
                }
                let mut pem = fs::read(cert).await?;
                pem.push(b'\n');
                pem.extend(fs::read(key).await?);
                Some(pem)
            }
            (None, None) => None,
            (Some(_), None) => return Err(TlsError::MissingKey),
            (None, Some(_)) => return Err(TlsError::MissingCert),
        };

        Ok(Self {
            ca_pem,
            identity_pem,
        })
    }

    pub fn from_pem(ca_pem: Option<Vec<u8>>, identity_pem: Option<Vec<u8>>) -> Self {
        Self {
            ca_pem,
            identity_pem,
        }
    }

    /// Apply trust roots and identity to an HTTP client builder.
    pub fn apply(
        &self,
        mut builder: reqwest::ClientBuilder,
    ) -> Result<reqwest::ClientBuilder, TlsError> {
        builder = builder.use_rustls_tls();
        if let Some(ca) = &self.ca_pem {
            let cert = reqwest::Certificate::from_pem(ca)
                .map_err(|e| TlsError::Invalid(format!("bad CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(pem) = &self.identity_pem {
            let identity = reqwest::Identity::from_pem(pem)
                .map_err(|e| TlsError::Invalid(format!("bad client identity: {}", e)))?;
            builder = builder.identity(identity);
        }
        Ok(builder)
    }
}

/// Subject distinguished name of a DER certificate, if it parses.
pub fn certificate_subject(der: &[u8]) -> Option<String> {
    x509_parser::parse_x509_certificate(der)
        .ok()
        .map(|(_, cert)| cert.subject().to_string())
}

async fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = fs::read(path).await?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::EmptyCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

async fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = fs::read(path).await?;
    rustls_pemfile::private_key(&mut BufReader::new(pem.as_slice()))?
        .ok_or_else(|| TlsError::EmptyKey(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_missing_paths() {
        let config = TlsConfig {
            enabled: true,
            ..TlsConfig::default()
        };

        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::MissingCert)));
    }

    #[tokio::test]
    async fn test_load_nonexistent_files() {
        let config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            cert_path: Some(PathBuf::from("/nonexistent/agent.crt")),
            key_path: Some(PathBuf::from("/nonexistent/agent.key")),
            require_client_cert: true,
            allow_insecure: false,
        };

        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::CertNotFound(_))));
    }

    #[tokio::test]
    async fn test_client_tls_requires_both_halves() {
        let result = ClientTls::load(None, Some(Path::new("/tmp/cert.pem")), None).await;
        assert!(matches!(result, Err(TlsError::MissingKey)));
    }

    #[test]
    fn test_subject_of_garbage_is_none() {
        assert!(certificate_subject(b"not a certificate").is_none());
    }
}
