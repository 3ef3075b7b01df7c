use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

/// Decides whether the binary at the given absolute path is authorized for
/// internet access. Invoked by the Diverter when it considers a flow for
/// diversion; the engine only stores the callback and hands it over.
pub type FirewallCheck = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Capability over the platform packet-diversion mechanism (WFP, NFQUEUE,
/// pf). The engine never touches platform APIs itself: it starts and stops
/// diversion and asks where a diverted flow was originally headed.
pub trait Diverter: Send + Sync {
    fn start(&self, http_port: u16, https_port: u16) -> io::Result<()>;

    fn stop(&self);

    /// The destination the client believed it was connecting to, queried by
    /// a new session using the client's source endpoint.
    fn lookup_original_destination(&self, client: SocketAddr) -> Option<(String, u16)>;

    /// Whether this platform needs the firewall callback to avoid acting as
    /// an application-firewall bypass. Construction fails when this is true
    /// and no callback was supplied.
    fn requires_firewall_authorization(&self) -> bool {
        cfg!(windows)
    }

    fn install_firewall_check(&self, _check: FirewallCheck) {}
}

/// Table-driven diverter for embedding tests and local setups where flows
/// are steered by explicit mappings rather than a packet hook.
#[derive(Default)]
pub struct StaticDiverter {
    routes: DashMap<SocketAddr, (String, u16)>,
    default_destination: Mutex<Option<(String, u16)>>,
    active: AtomicBool,
}

impl StaticDiverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default_destination(&self, host: impl Into<String>, port: u16) {
        *self
            .default_destination
            .lock()
            .expect("diverter default lock poisoned") = Some((host.into(), port));
    }

    pub fn map_client(&self, client: SocketAddr, host: impl Into<String>, port: u16) {
        self.routes.insert(client, (host.into(), port));
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

impl Diverter for StaticDiverter {
    fn start(&self, _http_port: u16, _https_port: u16) -> io::Result<()> {
        self.active.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    fn lookup_original_destination(&self, client: SocketAddr) -> Option<(String, u16)> {
        if let Some(route) = self.routes.get(&client) {
            return Some(route.clone());
        }
        self.default_destination
            .lock()
            .expect("diverter default lock poisoned")
            .clone()
    }

    fn requires_firewall_authorization(&self) -> bool {
        false
    }
}
