use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tokio::sync::watch;

use crate::{normalize_host, SpoofingAuthorityConfig, TlsStoreError};

/// Leaf not_before is backdated to tolerate client clock skew.
const NOT_BEFORE_SKEW_SECONDS: i64 = 60;
const CA_VALIDITY_DAYS: i64 = 3650;
const SERIAL_LEN: usize = 16;

/// A spoofed leaf plus the ready-to-serve TLS configuration for its host.
pub struct LeafEntry {
    pub server_config: Arc<ServerConfig>,
    pub leaf_cert_der: CertificateDer<'static>,
}

type LeafOutcome = Result<Arc<LeafEntry>, String>;

enum LeafSlot {
    Ready(Arc<LeafEntry>),
    InFlight(watch::Receiver<Option<LeafOutcome>>),
}

struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
}

/// Thread-safe, on-demand leaf certificate factory keyed by hostname.
///
/// Exactly one root CA exists per store. A leaf for a given host is produced
/// at most once per engine lifetime: concurrent first requests share one
/// in-flight issuance through a per-host promise slot; a failed issuance
/// clears the slot so the next caller retries.
pub struct SpoofingCertificateStore {
    config: SpoofingAuthorityConfig,
    ca: Arc<CaMaterial>,
    slots: Mutex<HashMap<String, LeafSlot>>,
    leaves_issued: AtomicU64,
}

impl SpoofingCertificateStore {
    pub fn new(config: SpoofingAuthorityConfig) -> Result<Self, TlsStoreError> {
        config.validate()?;
        let ca = match (&config.ca_cert_pem, &config.ca_key_pem) {
            (Some(cert_pem), Some(key_pem)) => load_ca(cert_pem, key_pem)?,
            _ => generate_ca(&config)?,
        };
        Ok(Self {
            config,
            ca: Arc::new(ca),
            slots: Mutex::new(HashMap::new()),
            leaves_issued: AtomicU64::new(0),
        })
    }

    /// PEM copy of the root certificate. The private key is never exported.
    pub fn root_ca_pem(&self) -> String {
        self.ca.cert_pem.clone()
    }

    pub fn leaves_issued(&self) -> u64 {
        self.leaves_issued.load(Ordering::Relaxed)
    }

    /// Server TLS parameters for `host`, generating and caching the leaf on
    /// first demand. Safe to call from any number of sessions concurrently.
    pub async fn server_config_for(&self, host: &str) -> Result<Arc<LeafEntry>, TlsStoreError> {
        let key = normalize_host(host);

        loop {
            enum Action {
                Wait(watch::Receiver<Option<LeafOutcome>>),
                Produce(watch::Sender<Option<LeafOutcome>>),
            }

            let action = {
                let mut slots = self.slots.lock().expect("leaf slot lock poisoned");
                match slots.get(&key) {
                    Some(LeafSlot::Ready(entry)) => return Ok(Arc::clone(entry)),
                    Some(LeafSlot::InFlight(rx)) => Action::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        slots.insert(key.clone(), LeafSlot::InFlight(rx));
                        Action::Produce(tx)
                    }
                }
            };

            match action {
                Action::Produce(tx) => return self.produce_leaf(key, tx).await,
                Action::Wait(mut rx) => {
                    let outcome = loop {
                        let published = rx.borrow().clone();
                        if let Some(outcome) = published {
                            break Some(outcome);
                        }
                        if rx.changed().await.is_err() {
                            break None;
                        }
                    };
                    match outcome {
                        Some(Ok(entry)) => return Ok(entry),
                        Some(Err(detail)) => {
                            return Err(TlsStoreError::LeafIssuance { host: key, detail })
                        }
                        None => {
                            // The producer vanished without publishing
                            // (cancelled mid-issuance). Clear its stale slot
                            // and take another run at the state machine.
                            let mut slots = self.slots.lock().expect("leaf slot lock poisoned");
                            if let Some(LeafSlot::InFlight(current)) = slots.get(&key) {
                                if current.same_channel(&rx) {
                                    slots.remove(&key);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn produce_leaf(
        &self,
        key: String,
        tx: watch::Sender<Option<LeafOutcome>>,
    ) -> Result<Arc<LeafEntry>, TlsStoreError> {
        let ca = Arc::clone(&self.ca);
        let leaf_host = key.clone();
        let validity_days = self.config.leaf_validity_days;

        let outcome: LeafOutcome =
            match tokio::task::spawn_blocking(move || issue_leaf(&ca, &leaf_host, validity_days))
                .await
            {
                Ok(Ok(entry)) => Ok(Arc::new(entry)),
                Ok(Err(error)) => Err(error.to_string()),
                Err(join_error) => Err(format!("issuance task failed: {join_error}")),
            };

        {
            let mut slots = self.slots.lock().expect("leaf slot lock poisoned");
            match &outcome {
                Ok(entry) => {
                    slots.insert(key.clone(), LeafSlot::Ready(Arc::clone(entry)));
                    self.leaves_issued.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    slots.remove(&key);
                }
            }
        }
        let _ = tx.send(Some(outcome.clone()));

        match outcome {
            Ok(entry) => Ok(entry),
            Err(detail) => Err(TlsStoreError::LeafIssuance { host: key, detail }),
        }
    }
}

fn generate_ca(config: &SpoofingAuthorityConfig) -> Result<CaMaterial, TlsStoreError> {
    let ca_key = KeyPair::generate()?;
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    params.serial_number = Some(random_serial());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECONDS);
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, config.common_name.clone());
    distinguished_name.push(DnType::OrganizationName, config.organization.clone());
    params.distinguished_name = distinguished_name;

    let ca_cert = params.self_signed(&ca_key)?;
    let cert_pem = ca_cert.pem();
    let cert_der = ca_cert.der().clone();
    let issuer = Issuer::new(params, ca_key);

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
    })
}

fn load_ca(cert_pem: &str, key_pem: &str) -> Result<CaMaterial, TlsStoreError> {
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        TlsStoreError::InvalidConfiguration(format!("failed to parse CA certificate PEM: {error}"))
    })?;
    let ca_key = KeyPair::from_pem(key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, ca_key).map_err(|error| {
        TlsStoreError::InvalidConfiguration(format!(
            "failed to parse issuer metadata from CA certificate: {error}"
        ))
    })?;

    Ok(CaMaterial {
        issuer,
        cert_pem: cert_pem.to_string(),
        cert_der,
    })
}

fn issue_leaf(
    ca: &CaMaterial,
    host: &str,
    validity_days: i64,
) -> Result<LeafEntry, TlsStoreError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::NoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.serial_number = Some(random_serial());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECONDS);
    params.not_after = now + Duration::days(validity_days);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
    let leaf_key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
    let leaf_cert = params.signed_by(&leaf_key, &ca.issuer)?;
    let leaf_cert_der = leaf_cert.der().clone();

    let chain = vec![leaf_cert_der.clone(), ca.cert_der.clone()];
    let private_key = PrivateKeyDer::from(leaf_key_der);

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(LeafEntry {
        server_config: Arc::new(server_config),
        leaf_cert_der,
    })
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0_u8; SERIAL_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    SerialNumber::from_slice(&bytes)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
        KeyUsagePurpose,
    };
    use x509_parser::extensions::GeneralName;
    use x509_parser::parse_x509_certificate;
    use x509_parser::pem::parse_x509_pem;

    use super::SpoofingCertificateStore;
    use crate::SpoofingAuthorityConfig;

    fn default_store() -> SpoofingCertificateStore {
        SpoofingCertificateStore::new(SpoofingAuthorityConfig::default()).expect("cert store")
    }

    fn leaf_dns_names(cert_der: &rustls::pki_types::CertificateDer<'static>) -> Vec<String> {
        let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
        let san = cert
            .subject_alternative_name()
            .expect("san extension parse")
            .expect("san extension present");
        san.value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(value) => Some(value.to_string()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_share_one_issuance() {
        let store = Arc::new(default_store());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.server_config_for("secure.example.com").await
            }));
        }

        let mut entries = Vec::new();
        for handle in handles {
            entries.push(handle.await.expect("join").expect("leaf"));
        }

        let first = &entries[0];
        for entry in &entries {
            assert!(Arc::ptr_eq(first, entry), "waiters must share one leaf");
        }
        assert_eq!(store.leaves_issued(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn host_normalization_folds_case_and_trailing_dot() {
        let store = default_store();
        let first = store
            .server_config_for("Secure.Example.Com")
            .await
            .expect("leaf");
        let second = store
            .server_config_for("secure.example.com.")
            .await
            .expect("leaf");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.leaves_issued(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leaf_carries_host_in_cn_and_san() {
        let store = default_store();
        let entry = store
            .server_config_for("secure.example.com")
            .await
            .expect("leaf");

        let (_, cert) = parse_x509_certificate(entry.leaf_cert_der.as_ref()).expect("parse x509");
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .expect("commonName")
            .as_str()
            .expect("commonName utf8");
        assert_eq!(cn, "secure.example.com");
        assert_eq!(
            leaf_dns_names(&entry.leaf_cert_der),
            vec!["secure.example.com".to_string()]
        );

        let issuer_cn = cert
            .issuer()
            .iter_common_name()
            .next()
            .expect("issuer commonName")
            .as_str()
            .expect("issuer commonName utf8");
        assert_eq!(issuer_cn, SpoofingAuthorityConfig::default().common_name);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leaf_for_ip_literal_uses_ip_san() {
        let store = default_store();
        let entry = store.server_config_for("127.0.0.1").await.expect("leaf");

        let (_, cert) = parse_x509_certificate(entry.leaf_cert_der.as_ref()).expect("parse x509");
        let san = cert
            .subject_alternative_name()
            .expect("san parse")
            .expect("san present");
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::IPAddress(value) if *value == [127, 0, 0, 1])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leaf_validity_window_is_backdated_and_bounded() {
        let store = default_store();
        let entry = store
            .server_config_for("window.example.com")
            .await
            .expect("leaf");

        let (_, cert) = parse_x509_certificate(entry.leaf_cert_der.as_ref()).expect("parse x509");
        let validity = cert.validity();
        let lifetime_seconds = validity.not_after.timestamp() - validity.not_before.timestamp();
        let expected = 825 * 24 * 60 * 60 + 60;
        assert_eq!(lifetime_seconds, expected);
    }

    #[test]
    fn root_ca_pem_round_trips_through_a_parser() {
        let store = default_store();
        let pem = store.root_ca_pem();
        assert!(!pem.is_empty());

        let (_, parsed) = parse_x509_pem(pem.as_bytes()).expect("parse PEM");
        let cert = parsed.parse_x509().expect("parse certificate");
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .expect("commonName")
            .as_str()
            .expect("commonName utf8");
        assert_eq!(cn, SpoofingAuthorityConfig::default().common_name);
        assert!(cert.is_ca());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn embedder_supplied_ca_is_used_verbatim() {
        let ca_key = KeyPair::generate().expect("ca key");
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Persisted Test CA");
        params.distinguished_name = dn;
        let ca_cert = params.self_signed(&ca_key).expect("self signed");

        let config = SpoofingAuthorityConfig {
            ca_cert_pem: Some(ca_cert.pem()),
            ca_key_pem: Some(ca_key.serialize_pem()),
            ..SpoofingAuthorityConfig::default()
        };
        let store = SpoofingCertificateStore::new(config).expect("store");
        assert_eq!(store.root_ca_pem(), ca_cert.pem());

        let entry = store
            .server_config_for("persisted.example.com")
            .await
            .expect("leaf");
        let (_, cert) = parse_x509_certificate(entry.leaf_cert_der.as_ref()).expect("parse x509");
        let issuer_cn = cert
            .issuer()
            .iter_common_name()
            .next()
            .expect("issuer commonName")
            .as_str()
            .expect("issuer commonName utf8");
        assert_eq!(issuer_cn, "Persisted Test CA");
    }
}
