use crate::codec::{FlattenOptions, ReplayReport};
use crate::config::EngineConfig;
use crate::discovery::{DiscoveryError, DiscoveryWatcher, ServiceAnnouncement, ServiceDirectory};
use crate::net::{ParameterSink, TransportError};
use crate::osc::{OscArg, OscMessage};
use crate::session::{AvatarSession, SessionEvent, SessionState};
use crate::store::{Capture, ProfileEntry, ProfileStore, StoreError};
use crate::tree::{fetch_current_avatar, FetchError, TreeFetcher};
use crossbeam_channel::{never, select, Receiver, Sender, TryRecvError};
use savestate_protocol::{RemoteEndpoint, AVATAR_CHANGE_ADDRESS};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no remote service found within {0:?}")]
    DiscoveryTimeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Failures that mean the remote endpoint can no longer be trusted.
    fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_)
                | EngineError::Fetch(_)
                | EngineError::Store(StoreError::Fetch(_))
                | EngineError::Store(StoreError::Transport(_))
        )
    }
}

pub type EventReceiver = Receiver<SessionEvent>;

/// What a host UI shows next to the profile list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Waiting,
    Connected,
    Reconnecting,
}

/// The remote-facing pieces the loop drives. Real sockets in the host, mocks in tests.
pub struct Collaborators {
    pub directory: Box<dyn ServiceDirectory + Send>,
    pub fetcher: Box<dyn TreeFetcher + Send>,
    pub sink: Box<dyn ParameterSink + Send>,
}

pub struct MainLoop {
    discovery_rx: Receiver<ServiceAnnouncement>,
    inbound_rx: Receiver<OscMessage>,
    events_tx: Sender<SessionEvent>,

    directory: Box<dyn ServiceDirectory + Send>,
    fetcher: Box<dyn TreeFetcher + Send>,
    sink: Box<dyn ParameterSink + Send>,

    watcher: DiscoveryWatcher,
    session: AvatarSession,
    store: ProfileStore,

    parameters_path: String,
    flatten: FlattenOptions,

    refresh_backoff: Duration,
    /// When the directory is next asked to re-report, after a failed remote.
    rediscover_at: Option<Instant>,
}

impl MainLoop {
    pub fn new(
        config: &EngineConfig,
        discovery_rx: Receiver<ServiceAnnouncement>,
        inbound_rx: Receiver<OscMessage>,
        events_tx: Sender<SessionEvent>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            discovery_rx,
            inbound_rx,
            events_tx,
            directory: collaborators.directory,
            fetcher: collaborators.fetcher,
            sink: collaborators.sink,
            watcher: DiscoveryWatcher::new(config.target_marker.clone()),
            session: AvatarSession::new(),
            store: ProfileStore::new(&config.storage_root, config.page_size),
            parameters_path: config.parameters_path.clone(),
            flatten: FlattenOptions {
                writable_only: config.writable_only,
            },
            refresh_backoff: config.refresh_backoff,
            rediscover_at: None,
        }
    }

    /// Starts accepting directory announcements. Call once the local
    /// endpoint is advertised.
    pub fn begin_discovery(&mut self) {
        self.session.begin_discovery();
    }

    /// Drains everything queued on both channels without blocking.
    pub fn tick(&mut self) -> usize {
        self.poll_rediscovery();
        let mut handled = 0;
        loop {
            match self.discovery_rx.try_recv() {
                Ok(announcement) => {
                    self.handle_announcement(announcement);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("directory channel closed");
                    self.discovery_rx = never();
                    break;
                }
            }
        }
        loop {
            match self.inbound_rx.try_recv() {
                Ok(msg) => {
                    self.handle_message(msg);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("inbound channel closed");
                    self.inbound_rx = never();
                    break;
                }
            }
        }
        self.poll_rediscovery();
        handled
    }

    /// Waits up to `timeout` for the first input, then drains the rest.
    pub fn tick_blocking(&mut self, timeout: Duration) -> usize {
        let timeout = match self.rediscover_at {
            Some(at) => timeout.min(at.saturating_duration_since(Instant::now())),
            None => timeout,
        };
        let discovery = self.discovery_rx.clone();
        let inbound = self.inbound_rx.clone();
        let mut handled = 0;
        select! {
            recv(discovery) -> msg => match msg {
                Ok(announcement) => {
                    self.handle_announcement(announcement);
                    handled += 1;
                }
                Err(_) => self.discovery_rx = never(),
            },
            recv(inbound) -> msg => match msg {
                Ok(msg) => {
                    self.handle_message(msg);
                    handled += 1;
                }
                Err(_) => self.inbound_rx = never(),
            },
            default(timeout) => {}
        }
        handled + self.tick()
    }

    pub fn wait_connected(&mut self, timeout: Duration) -> Result<RemoteEndpoint, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(endpoint) = self.session.endpoint() {
                return Ok(endpoint.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::DiscoveryTimeout(timeout));
            }
            self.tick_blocking(remaining);
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn status(&self) -> Status {
        match self.session.state() {
            SessionState::Connected => Status::Connected,
            SessionState::Reconnecting => Status::Reconnecting,
            SessionState::Disconnected | SessionState::Discovering => Status::Waiting,
        }
    }

    pub fn current_avatar(&self) -> Option<&str> {
        self.session.current()
    }

    pub fn previous_avatar(&self) -> Option<&str> {
        self.session.previous()
    }

    pub fn endpoint(&self) -> Option<&RemoteEndpoint> {
        self.session.endpoint()
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ProfileStore {
        &mut self.store
    }

    pub fn send(&mut self, address: &str, arg: OscArg) -> Result<(), EngineError> {
        let result = self.sink.send(address, arg).map_err(EngineError::from);
        self.check(result)
    }

    pub fn save_profile(&mut self, name: &str) -> Result<ProfileEntry, EngineError> {
        let avatar = self.require_avatar()?;
        let capture = Capture {
            fetcher: &*self.fetcher,
            endpoint: self.session.endpoint(),
            path: &self.parameters_path,
            options: self.flatten,
        };
        let result = self
            .store
            .save_profile(&avatar, name, &capture)
            .map_err(EngineError::from);
        self.check(result)
    }

    pub fn override_profile(&mut self, name: &str) -> Result<ProfileEntry, EngineError> {
        let avatar = self.require_avatar()?;
        let capture = Capture {
            fetcher: &*self.fetcher,
            endpoint: self.session.endpoint(),
            path: &self.parameters_path,
            options: self.flatten,
        };
        let result = self
            .store
            .override_profile(&avatar, name, &capture)
            .map_err(EngineError::from);
        self.check(result)
    }

    pub fn apply_profile(&mut self, name: &str) -> Result<ReplayReport, EngineError> {
        let avatar = self.require_avatar()?;
        let result = self
            .store
            .apply_profile(&avatar, name, &*self.sink)
            .map_err(EngineError::from);
        self.check(result)
    }

    pub fn apply_profile_at(&mut self, index: u32) -> Result<ReplayReport, EngineError> {
        let avatar = self.require_avatar()?;
        let result = self
            .store
            .apply_profile_at(&avatar, index, &*self.sink)
            .map_err(EngineError::from);
        self.check(result)
    }

    pub fn delete_profile(&mut self, name: &str) -> Result<bool, EngineError> {
        let avatar = self.require_avatar()?;
        Ok(self.store.delete_profile(&avatar, name)?)
    }

    pub fn delete_profile_at(&mut self, index: u32) -> Result<bool, EngineError> {
        let avatar = self.require_avatar()?;
        Ok(self.store.delete_profile_at(&avatar, index)?)
    }

    pub fn rename_profile(&mut self, name: &str, new_name: &str) -> Result<ProfileEntry, EngineError> {
        let avatar = self.require_avatar()?;
        Ok(self.store.rename_profile(&avatar, name, new_name)?)
    }

    pub fn copy_profiles_from_avatar(&mut self, source: &str, target: &str) -> Result<usize, EngineError> {
        Ok(self.store.copy_profiles_from_avatar(source, target)?)
    }

    pub fn copy_from_previous(&mut self) -> Result<usize, EngineError> {
        let current = self.require_avatar()?;
        let previous = self
            .session
            .previous()
            .map(str::to_string)
            .ok_or(StoreError::NoPreviousAvatar)?;
        self.copy_profiles_from_avatar(&previous, &current)
    }

    pub fn load_avatar_name(&self) -> Result<Option<String>, EngineError> {
        let avatar = self.require_avatar()?;
        Ok(self.store.load_avatar_name(&avatar)?)
    }

    pub fn save_avatar_name(&self, name: &str) -> Result<(), EngineError> {
        let avatar = self.require_avatar()?;
        Ok(self.store.save_avatar_name(&avatar, name)?)
    }

    pub fn shutdown(&mut self) {
        self.session.shutdown();
    }

    fn require_avatar(&self) -> Result<String, StoreError> {
        self.session
            .current()
            .map(str::to_string)
            .ok_or(StoreError::NoAvatar)
    }

    fn check<T>(&mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(e) = &result {
            if e.is_remote_failure() {
                warn!(error = %e, "remote operation failed");
                self.lose_connection();
            }
        }
        result
    }

    fn handle_announcement(&mut self, announcement: ServiceAnnouncement) {
        if !self.session.is_awaiting_endpoint() {
            return;
        }
        let Some(endpoint) = self.watcher.observe(&announcement) else {
            return;
        };
        match fetch_current_avatar(&*self.fetcher, &endpoint) {
            Ok(avatar) => {
                for event in self.session.on_connected(endpoint, avatar) {
                    self.emit(event);
                }
            }
            Err(e) => {
                warn!(%endpoint, error = %e, "initial avatar fetch failed");
                self.schedule_rediscovery();
            }
        }
    }

    fn handle_message(&mut self, msg: OscMessage) {
        if msg.address != AVATAR_CHANGE_ADDRESS {
            debug!(address = %msg.address, "ignoring osc message");
            return;
        }
        match msg.first_string() {
            Some(avatar) => {
                if let Some(event) = self.session.on_avatar_message(avatar) {
                    self.emit(event);
                }
            }
            None => debug!("avatar change without a string argument"),
        }
    }

    fn lose_connection(&mut self) {
        if let Some(event) = self.session.on_remote_failure() {
            self.emit(event);
        }
        self.schedule_rediscovery();
    }

    /// Re-arms and refreshes after `refresh_backoff`; a refresh replays the
    /// cached record of the endpoint that just failed.
    fn schedule_rediscovery(&mut self) {
        if self.rediscover_at.is_none() {
            debug!(backoff = ?self.refresh_backoff, "rediscovery scheduled");
            self.rediscover_at = Some(Instant::now() + self.refresh_backoff);
        }
    }

    fn poll_rediscovery(&mut self) {
        let Some(at) = self.rediscover_at else {
            return;
        };
        if Instant::now() < at {
            return;
        }
        self.rediscover_at = None;
        info!("rediscovering remote service");
        self.watcher.rearm();
        self.directory.refresh();
    }

    fn emit(&mut self, event: SessionEvent) {
        if let SessionEvent::AvatarChanged { current, .. } = &event {
            if let Err(e) = self.store.load_profiles(current) {
                warn!(avatar = %current, error = %e, "loading profiles failed");
            }
        }
        if self.events_tx.try_send(event).is_err() {
            debug!("session event dropped");
        }
    }
}

impl std::fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainLoop")
            .field("session", &self.session)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
