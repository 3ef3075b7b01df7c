use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;

mod spoof_store;

pub use spoof_store::{LeafEntry, SpoofingCertificateStore};

#[derive(Debug, Error)]
pub enum TlsStoreError {
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CA bundle {path} yielded no usable certificates: {detail}")]
    InvalidCaBundle { path: String, detail: String },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("leaf issuance for {host} failed: {detail}")]
    LeafIssuance { host: String, detail: String },
}

/// Construction parameters for the spoofing store's root CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoofingAuthorityConfig {
    pub common_name: String,
    pub organization: String,
    /// Embedder-persisted CA, both present or both absent. When absent a
    /// fresh CA is generated at construction.
    pub ca_cert_pem: Option<String>,
    pub ca_key_pem: Option<String>,
    pub leaf_validity_days: i64,
}

impl Default for SpoofingAuthorityConfig {
    fn default() -> Self {
        Self {
            common_name: "sift-proxy Filtering CA".to_string(),
            organization: "sift-proxy".to_string(),
            ca_cert_pem: None,
            ca_key_pem: None,
            leaf_validity_days: 825,
        }
    }
}

impl SpoofingAuthorityConfig {
    pub(crate) fn validate(&self) -> Result<(), TlsStoreError> {
        match (&self.ca_cert_pem, &self.ca_key_pem) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => {
                return Err(TlsStoreError::InvalidConfiguration(
                    "ca_cert_pem and ca_key_pem must either both be set or both be unset"
                        .to_string(),
                ));
            }
        }
        if self.common_name.trim().is_empty() {
            return Err(TlsStoreError::InvalidConfiguration(
                "common_name must not be empty".to_string(),
            ));
        }
        if self.leaf_validity_days <= 0 {
            return Err(TlsStoreError::InvalidConfiguration(
                "leaf_validity_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Client configuration used when the engine acts as the upstream client on
/// behalf of intercepted flows. Verification anchors come from the embedder
/// bundle when one is configured, otherwise from the Mozilla root program.
pub fn build_upstream_client_config(
    ca_bundle_path: Option<&Path>,
) -> Result<Arc<ClientConfig>, TlsStoreError> {
    let mut roots = RootCertStore::empty();

    match ca_bundle_path {
        Some(path) => {
            let certs = CertificateDer::pem_file_iter(path).map_err(|error| {
                TlsStoreError::InvalidCaBundle {
                    path: path.display().to_string(),
                    detail: error.to_string(),
                }
            })?;
            let mut added = 0_usize;
            for cert in certs {
                let cert = cert.map_err(|error| TlsStoreError::InvalidCaBundle {
                    path: path.display().to_string(),
                    detail: error.to_string(),
                })?;
                if roots.add(cert).is_ok() {
                    added += 1;
                }
            }
            if added == 0 {
                return Err(TlsStoreError::InvalidCaBundle {
                    path: path.display().to_string(),
                    detail: "no certificate in bundle could be parsed".to_string(),
                });
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Hostnames are cached and certified in a canonical form: lowercased with
/// any trailing dot removed. SNI arrives already punycoded, IP literals stay
/// as written.
pub fn normalize_host(host: &str) -> String {
    let host = host.strip_suffix('.').unwrap_or(host);
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}
