use crate::store::DEFAULT_PAGE_SIZE;
use crate::tree::FetchStrategy;
use savestate_protocol::AVATAR_PARAMETERS_PATH;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_SERVICE_NAME: &str = "VRCParameterSaveStates";
pub const DEFAULT_TARGET_MARKER: &str = "VRChat";
pub const DEFAULT_OSC_SEND_PORT: u16 = 9000;
pub const DEFAULT_REFRESH_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub service_name: String,
    /// Substring a directory entry's name must contain to be accepted.
    pub target_marker: String,
    pub osc_send_addr: SocketAddr,
    /// Address the listener and description server bind.
    pub bind_ip: IpAddr,
    /// Address published over mDNS and in `HOST_INFO`. `None` picks the
    /// outbound LAN address.
    pub advertise_ip: Option<IpAddr>,
    /// Profiles live under `{storage_root}/Profiles/{avatar_id}`.
    pub storage_root: PathBuf,
    pub fetch_timeout: Duration,
    /// Pause between a failed remote and asking the directory again.
    pub refresh_backoff: Duration,
    pub fetch_strategy: FetchStrategy,
    pub page_size: usize,
    pub parameters_path: String,
    pub writable_only: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            target_marker: DEFAULT_TARGET_MARKER.to_string(),
            osc_send_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_OSC_SEND_PORT)),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_ip: None,
            storage_root: PathBuf::from("."),
            fetch_timeout: Duration::from_secs(5),
            refresh_backoff: DEFAULT_REFRESH_BACKOFF,
            fetch_strategy: FetchStrategy::WholeTree,
            page_size: DEFAULT_PAGE_SIZE,
            parameters_path: AVATAR_PARAMETERS_PATH.to_string(),
            writable_only: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `SAVESTATES_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_str("SAVESTATES_DATA_DIR") {
            cfg.storage_root = PathBuf::from(v);
        }
        if let Some(v) = env_str("SAVESTATES_SERVICE_NAME") {
            cfg.service_name = v;
        }
        if let Some(v) = env_str("SAVESTATES_TARGET_MARKER") {
            cfg.target_marker = v;
        }
        if let Some(v) = env_parse::<SocketAddr>("SAVESTATES_OSC_SEND_ADDR") {
            cfg.osc_send_addr = v;
        }
        if let Some(v) = env_parse::<IpAddr>("SAVESTATES_BIND_IP") {
            cfg.bind_ip = v;
        }
        if let Some(v) = env_parse::<IpAddr>("SAVESTATES_ADVERTISE_IP") {
            cfg.advertise_ip = Some(v);
        }
        if let Some(secs) = env_parse::<u64>("SAVESTATES_FETCH_TIMEOUT_SECS") {
            cfg.fetch_timeout = Duration::from_secs(secs.clamp(1, 60));
        }
        if let Some(ms) = env_parse::<u64>("SAVESTATES_REFRESH_BACKOFF_MS") {
            cfg.refresh_backoff = Duration::from_millis(ms.min(60_000));
        }
        if let Some(n) = env_parse::<usize>("SAVESTATES_PAGE_SIZE") {
            cfg.page_size = n.clamp(1, 200);
        }
        if let Some(v) = env_str("SAVESTATES_FETCH_STRATEGY") {
            cfg.fetch_strategy = parse_strategy(&v).unwrap_or_else(|| {
                warn!(value = %v, "unknown SAVESTATES_FETCH_STRATEGY, using whole-tree");
                FetchStrategy::WholeTree
            });
        }
        if let Some(v) = env_str("SAVESTATES_WRITABLE_ONLY") {
            cfg.writable_only = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        cfg
    }
}

pub fn parse_strategy(s: &str) -> Option<FetchStrategy> {
    match s.trim().to_ascii_lowercase().as_str() {
        "whole" | "whole_tree" | "whole-tree" | "tree" => Some(FetchStrategy::WholeTree),
        "per_path" | "per-path" | "path" => Some(FetchStrategy::PerPath),
        _ => None,
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_str(key)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
