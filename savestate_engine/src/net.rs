use crate::osc::{decode_packet, OscArg, OscError, OscMessage};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_DATAGRAM: usize = 65_536;
const MDNS_GROUP_V4: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(224, 0, 0, 251), 5353);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket bind failed: {0}")]
    Bind(#[source] io::Error),
    #[error("send to {address} failed: {source}")]
    Send {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("osc encode failed: {0}")]
    Encode(#[from] OscError),
}

/// Outbound side of the parameter channel. Mocked in tests.
pub trait ParameterSink {
    fn send(&self, address: &str, arg: OscArg) -> Result<(), TransportError>;
}

pub struct OscSender {
    socket: UdpSocket,
    target: SocketAddr,
}

impl OscSender {
    pub fn connect(target: SocketAddr) -> Result<Self, TransportError> {
        let bind: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).map_err(TransportError::Bind)?;
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn send_float(&self, address: &str, value: f32) -> Result<(), TransportError> {
        self.send(address, OscArg::Float(value))
    }

    pub fn send_int(&self, address: &str, value: i32) -> Result<(), TransportError> {
        self.send(address, OscArg::Int(value))
    }

    pub fn send_bool(&self, address: &str, value: bool) -> Result<(), TransportError> {
        self.send(address, OscArg::Bool(value))
    }
}

impl ParameterSink for OscSender {
    fn send(&self, address: &str, arg: OscArg) -> Result<(), TransportError> {
        let payload = OscMessage::new(address, vec![arg]).encode()?;
        self.socket
            .send_to(&payload, self.target)
            .map(|_| ())
            .map_err(|source| TransportError::Send {
                address: address.to_string(),
                source,
            })
    }
}

/// Inbound side: one thread, one socket, one observer.
pub struct OscListener {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl OscListener {
    pub fn spawn<A, F>(addr: A, on_message: F) -> Result<Self, TransportError>
    where
        A: ToSocketAddrs,
        F: FnMut(OscMessage) + Send + 'static,
    {
        let socket = UdpSocket::bind(addr).map_err(TransportError::Bind)?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(TransportError::Bind)?;
        let local_addr = socket.local_addr().map_err(TransportError::Bind)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = Arc::clone(&shutdown);
        let join_handle = thread::Builder::new()
            .name("osc-listener".to_string())
            .spawn(move || run_listener(socket, on_message, shutdown_for_thread))
            .map_err(TransportError::Bind)?;

        Ok(Self {
            local_addr,
            shutdown,
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Ok(mut h) = self.join_handle.lock() {
            if let Some(h) = h.take() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for OscListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_listener<F>(socket: UdpSocket, mut on_message: F, shutdown: Arc<AtomicBool>)
where
    F: FnMut(OscMessage),
{
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((size, from)) => match decode_packet(&buf[..size]) {
                Ok(messages) => messages.into_iter().for_each(&mut on_message),
                Err(e) => debug!(%from, error = %e, "dropping malformed osc packet"),
            },
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            // Windows reports ICMP port-unreachable on the receiving socket.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
            Err(e) => {
                warn!(error = %e, "osc receive failed");
                thread::sleep(RECV_TIMEOUT);
            }
        }
    }
}

pub fn available_udp_port() -> io::Result<u16> {
    UdpSocket::bind(("127.0.0.1", 0))?.local_addr().map(|a| a.port())
}

pub fn available_tcp_port() -> io::Result<u16> {
    TcpListener::bind(("127.0.0.1", 0))?.local_addr().map(|a| a.port())
}

/// Loopback and wildcard addresses are invisible to other hosts.
pub fn is_lan_ip(ip: IpAddr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified()
}

/// The address the OS routes mDNS traffic from. Connecting a UDP socket
/// picks a route without sending a datagram.
pub fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(MDNS_GROUP_V4).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    is_lan_ip(ip).then_some(ip)
}

/// Address published for the local listener: an explicit setting, else a
/// concrete bind address, else the outbound LAN address.
pub fn advertise_ip(configured: Option<IpAddr>, bind: IpAddr) -> IpAddr {
    choose_advertise_ip(configured, bind, outbound_ip)
}

fn choose_advertise_ip(
    configured: Option<IpAddr>,
    bind: IpAddr,
    detect: impl FnOnce() -> Option<IpAddr>,
) -> IpAddr {
    if let Some(ip) = configured {
        if !is_lan_ip(ip) {
            warn!(%ip, "advertised address is not reachable from other hosts");
        }
        return ip;
    }
    if is_lan_ip(bind) {
        return bind;
    }
    detect().unwrap_or_else(|| {
        warn!("no LAN address found, advertising loopback");
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    })
}
