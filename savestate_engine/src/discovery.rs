use crate::query_server::{Description, QueryServer};
use crossbeam_channel::Sender;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use savestate_protocol::RemoteEndpoint;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const OSCJSON_SERVICE_TYPE: &str = "_oscjson._tcp.local.";
pub const OSC_SERVICE_TYPE: &str = "_osc._udp.local.";

const BROWSE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mdns error: {0}")]
    Mdns(#[from] mdns_sd::Error),
    #[error("description server failed: {0}")]
    Server(#[from] io::Error),
}

/// One directory entry as observed on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAnnouncement {
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// Accepts the first announcement whose name contains `marker`
/// (case-sensitive), then stays quiet until re-armed.
#[derive(Debug)]
pub struct DiscoveryWatcher {
    marker: String,
    armed: bool,
}

impl DiscoveryWatcher {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            armed: true,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn observe(&mut self, announcement: &ServiceAnnouncement) -> Option<RemoteEndpoint> {
        debug!(
            name = %announcement.name,
            host = %announcement.host,
            port = announcement.port,
            "found service"
        );
        if !self.armed || !announcement.name.contains(&self.marker) {
            return None;
        }
        self.armed = false;
        info!(name = %announcement.name, "matched remote service");
        Some(RemoteEndpoint::new(
            announcement.host.clone(),
            announcement.port,
        ))
    }

    pub fn rearm(&mut self) {
        self.armed = true;
    }
}

/// Lets the engine ask the directory to report already-known services again.
pub trait ServiceDirectory {
    fn refresh(&self);
}

#[derive(Debug, Clone)]
pub struct DirectoryHandle {
    refresh: Arc<AtomicBool>,
}

impl ServiceDirectory for DirectoryHandle {
    fn refresh(&self) {
        self.refresh.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct Advertisement {
    pub service_name: String,
    /// Where the description server listens.
    pub bind_ip: IpAddr,
    /// Published in both records and in `HOST_INFO`.
    pub advertise_ip: IpAddr,
    pub osc_port: u16,
    /// Zero picks a free port.
    pub query_port: u16,
}

/// The advertised local endpoint: mDNS registrations, browse thread and the
/// description server. Dropping it withdraws everything.
pub struct LocalService {
    daemon: ServiceDaemon,
    registered: Vec<String>,
    server: QueryServer,
    refresh: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LocalService {
    pub fn advertise(
        ad: &Advertisement,
        announcements: Sender<ServiceAnnouncement>,
    ) -> Result<Self, DiscoveryError> {
        let server = QueryServer::start(
            SocketAddr::new(ad.bind_ip, ad.query_port),
            Description::for_listener(&ad.service_name, ad.advertise_ip, ad.osc_port),
        )?;
        let query_port = server.local_addr().port();

        let daemon = ServiceDaemon::new()?;
        let mut registered = Vec::new();
        for (ty, port) in [
            (OSCJSON_SERVICE_TYPE, query_port),
            (OSC_SERVICE_TYPE, ad.osc_port),
        ] {
            let info = service_info(ty, ad, port)?;
            registered.push(info.get_fullname().to_string());
            daemon.register(info)?;
        }
        info!(
            service = %ad.service_name,
            ip = %ad.advertise_ip,
            query_port,
            osc_port = ad.osc_port,
            "advertised local endpoint"
        );

        // The browse thread starts its first browse through the refresh path.
        let refresh = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(AtomicBool::new(false));
        let join_handle = thread::Builder::new().name("mdns-browse".to_string()).spawn({
            let daemon = daemon.clone();
            let refresh = Arc::clone(&refresh);
            let shutdown = Arc::clone(&shutdown);
            move || run_browse(daemon, announcements, refresh, shutdown)
        })?;

        Ok(Self {
            daemon,
            registered,
            server,
            refresh,
            shutdown,
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    pub fn handle(&self) -> DirectoryHandle {
        DirectoryHandle {
            refresh: Arc::clone(&self.refresh),
        }
    }

    pub fn query_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Ok(mut h) = self.join_handle.lock() {
            if let Some(h) = h.take() {
                let _ = h.join();
            }
        }
        for fullname in &self.registered {
            if let Err(e) = self.daemon.unregister(fullname) {
                debug!(%fullname, error = %e, "unregister failed");
            }
        }
        let _ = self.daemon.shutdown();
        self.server.shutdown();
    }
}

impl Drop for LocalService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The daemon drops loopback interfaces when announcing, so every
/// non-loopback host address is added alongside `advertise_ip`.
fn service_info(ty: &str, ad: &Advertisement, port: u16) -> Result<ServiceInfo, DiscoveryError> {
    let host_name = format!("{}.local.", ad.service_name);
    let info = ServiceInfo::new(
        ty,
        &ad.service_name,
        &host_name,
        ad.advertise_ip,
        port,
        HashMap::<String, String>::new(),
    )?;
    Ok(info.enable_addr_auto())
}

fn run_browse(
    daemon: ServiceDaemon,
    announcements: Sender<ServiceAnnouncement>,
    refresh: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) {
    let mut browse = None;
    while !shutdown.load(Ordering::Relaxed) {
        if refresh.swap(false, Ordering::Relaxed) {
            // Restarting the browse makes the daemon report cached services again.
            if browse.take().is_some() {
                let _ = daemon.stop_browse(OSCJSON_SERVICE_TYPE);
            }
            match daemon.browse(OSCJSON_SERVICE_TYPE) {
                Ok(rx) => browse = Some(rx),
                Err(e) => {
                    warn!(error = %e, "restarting browse failed");
                    refresh.store(true, Ordering::Relaxed);
                    thread::sleep(BROWSE_POLL);
                    continue;
                }
            }
        }

        let Some(rx) = browse.as_ref() else {
            thread::sleep(BROWSE_POLL);
            continue;
        };
        match rx.recv_timeout(BROWSE_POLL) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let Some(announcement) = announcement_from(&info) else {
                    continue;
                };
                if announcements.send(announcement).is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}

fn announcement_from(info: &ServiceInfo) -> Option<ServiceAnnouncement> {
    let addresses = info.get_addresses();
    let host = addresses
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addresses.iter().next())?;
    let fullname = info.get_fullname();
    let name = fullname
        .strip_suffix(OSCJSON_SERVICE_TYPE)
        .map(|n| n.trim_end_matches('.'))
        .unwrap_or(fullname);
    Some(ServiceAnnouncement {
        name: name.to_string(),
        host: host.to_string(),
        port: info.get_port(),
    })
}
