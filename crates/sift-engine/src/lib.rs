use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sift_policy::{DecisionEngine, ProgramOptions, RuleStore, TextTriggerStore};
use sift_tls::{build_upstream_client_config, SpoofingCertificateStore, TlsStoreError};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio_rustls::rustls::ClientConfig;

mod acceptor;
mod diversion;
mod session;
mod session_tls;

pub use diversion::{Diverter, FirewallCheck, StaticDiverter};
pub use sift_observe::{ContentClassifier, EventReporter, NoopReporter, RecordingReporter};
pub use sift_policy::{
    OPTION_BLOCK_ON_SCAN_OVERFLOW, OPTION_REMOVE_ELEMENTS, OPTION_SCAN_TEXT_TRIGGERS,
    OPTION_USE_CLASSIFIER,
};
pub use sift_tls::SpoofingAuthorityConfig;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine configuration: {0}")]
    Configuration(String),
    #[error("failed to bind {listener} listener: {source}")]
    Bind {
        listener: &'static str,
        source: io::Error,
    },
    #[error("TLS initialization failed: {0}")]
    Tls(#[from] TlsStoreError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Listener ports; zero asks the OS for an ephemeral port.
    pub http_port: u16,
    pub https_port: u16,
    /// Worker threads for the shared reactor; zero means logical core count.
    pub worker_threads: usize,
    /// PEM bundle used to validate upstream TLS. Mozilla roots when unset.
    pub ca_bundle_path: Option<PathBuf>,
    /// HTML served in place of blocked text/html payloads.
    pub blocked_html_page: String,
    pub authority: SpoofingAuthorityConfig,
    pub max_head_bytes: usize,
    /// Cap for bodies buffered on behalf of a filtering decision.
    pub max_scan_body_bytes: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_keepalive_timeout: Duration,
    pub stop_drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http_port: 0,
            https_port: 0,
            worker_threads: 0,
            ca_bundle_path: None,
            blocked_html_page: String::new(),
            authority: SpoofingAuthorityConfig::default(),
            max_head_bytes: 64 * 1024,
            max_scan_body_bytes: 4 * 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            idle_keepalive_timeout: Duration::from_secs(30),
            stop_drain_timeout: Duration::from_secs(5),
        }
    }
}

pub(crate) struct EngineShared {
    pub config: EngineConfig,
    pub options: Arc<ProgramOptions>,
    pub decision: DecisionEngine,
    pub cert_store: SpoofingCertificateStore,
    pub upstream_tls: Arc<ClientConfig>,
    pub reporter: Arc<dyn EventReporter>,
    pub diverter: Arc<dyn Diverter>,
}

struct ControlState {
    runtime: Option<Runtime>,
    shutdown_tx: Option<watch::Sender<bool>>,
    http_port: u16,
    https_port: u16,
}

/// Owns every engine component and orchestrates start/stop. All methods are
/// safe to call concurrently with traffic handling; `start` and `stop`
/// serialize on one mutex and are idempotent.
pub struct EngineControl {
    shared: Arc<EngineShared>,
    control: Mutex<ControlState>,
    running: AtomicBool,
}

impl EngineControl {
    pub fn new(
        config: EngineConfig,
        diverter: Arc<dyn Diverter>,
        firewall_check: Option<FirewallCheck>,
        reporter: Arc<dyn EventReporter>,
        classifier: Option<Arc<dyn ContentClassifier>>,
    ) -> Result<Self, EngineError> {
        match firewall_check {
            Some(check) => diverter.install_firewall_check(check),
            None if diverter.requires_firewall_authorization() => {
                return Err(EngineError::Configuration(
                    "a firewall check callback is required on this platform".to_string(),
                ));
            }
            None => {}
        }

        let options = Arc::new(ProgramOptions::new());
        options.set_option_enabled(OPTION_REMOVE_ELEMENTS, true);
        options.set_option_enabled(OPTION_SCAN_TEXT_TRIGGERS, true);
        options.set_option_enabled(OPTION_USE_CLASSIFIER, true);

        let rules = Arc::new(RuleStore::new(Arc::clone(&options)));
        let triggers = Arc::new(TextTriggerStore::new(Arc::clone(&options)));
        let decision = DecisionEngine::new(rules, triggers, Arc::clone(&options), classifier);

        let cert_store = SpoofingCertificateStore::new(config.authority.clone())?;
        let upstream_tls = build_upstream_client_config(config.ca_bundle_path.as_deref())?;

        Ok(Self {
            shared: Arc::new(EngineShared {
                config,
                options,
                decision,
                cert_store,
                upstream_tls,
                reporter,
                diverter,
            }),
            control: Mutex::new(ControlState {
                runtime: None,
                shutdown_tx: None,
                http_port: 0,
                https_port: 0,
            }),
            running: AtomicBool::new(false),
        })
    }

    /// Bind both listeners, spin up the worker pool and ask the diverter to
    /// begin steering flows. A second call while running is a no-op.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut control = self.control.lock().expect("engine control lock poisoned");
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let worker_threads = if self.shared.config.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|parallelism| parallelism.get())
                .unwrap_or(1)
        } else {
            self.shared.config.worker_threads
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("sift-worker")
            .enable_all()
            .build()?;

        let http_port = self.shared.config.http_port;
        let https_port = self.shared.config.https_port;
        let bind_result: Result<(TcpListener, TcpListener), EngineError> =
            runtime.block_on(async {
                let http = TcpListener::bind(("127.0.0.1", http_port))
                    .await
                    .map_err(|source| EngineError::Bind {
                        listener: "http",
                        source,
                    })?;
                let https = TcpListener::bind(("127.0.0.1", https_port))
                    .await
                    .map_err(|source| EngineError::Bind {
                        listener: "https",
                        source,
                    })?;
                Ok((http, https))
            });
        let (http_listener, https_listener) = match bind_result {
            Ok(listeners) => listeners,
            Err(error) => {
                self.shared
                    .reporter
                    .error(&format!("engine start failed: {error}"));
                runtime.shutdown_timeout(Duration::from_millis(100));
                return Err(error);
            }
        };

        let bound_http = http_listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0);
        let bound_https = https_listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        runtime.spawn(acceptor::run_accept_loop(
            Arc::clone(&self.shared),
            http_listener,
            acceptor::ListenerKind::Http,
            shutdown_rx.clone(),
        ));
        runtime.spawn(acceptor::run_accept_loop(
            Arc::clone(&self.shared),
            https_listener,
            acceptor::ListenerKind::Tls,
            shutdown_rx,
        ));

        if let Err(error) = self.shared.diverter.start(bound_http, bound_https) {
            self.shared
                .reporter
                .error(&format!("diverter start failed: {error}"));
            let _ = shutdown_tx.send(true);
            runtime.shutdown_timeout(self.shared.config.stop_drain_timeout);
            return Err(EngineError::Io(error));
        }

        control.runtime = Some(runtime);
        control.shutdown_tx = Some(shutdown_tx);
        control.http_port = bound_http;
        control.https_port = bound_https;
        self.running.store(true, Ordering::SeqCst);
        self.shared.reporter.info(&format!(
            "engine running: http on 127.0.0.1:{bound_http}, https on 127.0.0.1:{bound_https}"
        ));
        Ok(())
    }

    /// Stop diversion, refuse new sessions, cancel in-flight work and wait
    /// for worker drain within the configured deadline. Idempotent.
    pub fn stop(&self) {
        let mut control = self.control.lock().expect("engine control lock poisoned");
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        self.shared.diverter.stop();
        if let Some(shutdown_tx) = control.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(runtime) = control.runtime.take() {
            runtime.shutdown_timeout(self.shared.config.stop_drain_timeout);
        }
        control.http_port = 0;
        control.https_port = 0;
        self.running.store(false, Ordering::SeqCst);
        self.shared.reporter.info("engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound port of the plain listener, zero when stopped.
    pub fn http_listener_port(&self) -> u16 {
        self.control
            .lock()
            .expect("engine control lock poisoned")
            .http_port
    }

    /// Bound port of the TLS listener, zero when stopped.
    pub fn https_listener_port(&self) -> u16 {
        self.control
            .lock()
            .expect("engine control lock poisoned")
            .https_port
    }

    pub fn set_option_enabled(&self, option: u32, enabled: bool) {
        self.shared.options.set_option_enabled(option, enabled);
    }

    pub fn option_enabled(&self, option: u32) -> bool {
        self.shared.options.option_enabled(option)
    }

    pub fn set_category_enabled(&self, category: u8, enabled: bool) {
        self.shared.options.set_category_enabled(category, enabled);
    }

    pub fn category_enabled(&self, category: u8) -> bool {
        self.shared.options.category_enabled(category)
    }

    pub fn load_rules_from_string(
        &self,
        source: &str,
        category: u8,
        flush_category_first: bool,
    ) -> (u32, u32) {
        self.shared
            .decision
            .rules()
            .load_rules(source, category, flush_category_first)
    }

    pub fn load_rules_from_file(
        &self,
        path: &std::path::Path,
        category: u8,
        flush_category_first: bool,
    ) -> (u32, u32) {
        match std::fs::read_to_string(path) {
            Ok(source) => self.load_rules_from_string(&source, category, flush_category_first),
            Err(error) => {
                self.shared.reporter.error(&format!(
                    "failed to read rule list {}: {error}",
                    path.display()
                ));
                (0, 0)
            }
        }
    }

    pub fn load_triggers_from_string(
        &self,
        source: &str,
        category: u8,
        flush_category_first: bool,
    ) -> u32 {
        self.shared
            .decision
            .triggers()
            .load_triggers(source, category, flush_category_first)
    }

    pub fn load_triggers_from_file(
        &self,
        path: &std::path::Path,
        category: u8,
        flush_category_first: bool,
    ) -> u32 {
        match std::fs::read_to_string(path) {
            Ok(source) => self.load_triggers_from_string(&source, category, flush_category_first),
            Err(error) => {
                self.shared.reporter.error(&format!(
                    "failed to read trigger list {}: {error}",
                    path.display()
                ));
                0
            }
        }
    }

    pub fn unload_rules(&self, category: u8) {
        self.shared.decision.rules().unload_rules(category);
    }

    pub fn unload_triggers(&self, category: u8) {
        self.shared.decision.triggers().unload_triggers(category);
    }

    /// PEM of the spoofing root CA; embedders install it in client trust
    /// stores. The private key is never exported.
    pub fn root_ca_pem(&self) -> String {
        self.shared.cert_store.root_ca_pem()
    }
}

impl Drop for EngineControl {
    fn drop(&mut self) {
        self.stop();
    }
}
