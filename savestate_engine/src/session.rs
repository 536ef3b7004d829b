use savestate_protocol::RemoteEndpoint;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Discovering,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    AvatarConnected(RemoteEndpoint),
    AvatarChanged {
        previous: Option<String>,
        current: String,
    },
    ConnectionLost,
}

/// Owns the remote endpoint and the current/previous avatar identity.
///
/// Identity survives connection loss so profiles of the previous avatar stay
/// reachable while the remote is away.
#[derive(Debug)]
pub struct AvatarSession {
    state: SessionState,
    endpoint: Option<RemoteEndpoint>,
    current: Option<String>,
    previous: Option<String>,
}

impl Default for AvatarSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AvatarSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            endpoint: None,
            current: None,
            previous: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn endpoint(&self) -> Option<&RemoteEndpoint> {
        self.endpoint.as_ref()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn previous(&self) -> Option<&str> {
        self.previous.as_deref()
    }

    pub fn is_awaiting_endpoint(&self) -> bool {
        matches!(
            self.state,
            SessionState::Discovering | SessionState::Reconnecting
        )
    }

    pub fn begin_discovery(&mut self) {
        if self.state == SessionState::Disconnected {
            self.state = SessionState::Discovering;
            info!("waiting for remote service");
        }
    }

    /// Endpoint resolved and its initial identity read.
    pub fn on_connected(&mut self, endpoint: RemoteEndpoint, avatar: String) -> Vec<SessionEvent> {
        info!(%endpoint, avatar = %avatar, from = ?self.state, "connected");
        self.state = SessionState::Connected;
        self.endpoint = Some(endpoint.clone());

        let mut events = vec![SessionEvent::AvatarConnected(endpoint)];
        events.extend(self.adopt(avatar));
        events
    }

    /// Live `/avatar/change` update. Repeats of the current identity are ignored.
    pub fn on_avatar_message(&mut self, avatar: &str) -> Option<SessionEvent> {
        self.adopt(avatar.to_string())
    }

    /// Something that needed the endpoint failed. Identity is kept.
    pub fn on_remote_failure(&mut self) -> Option<SessionEvent> {
        self.endpoint = None;
        if self.state != SessionState::Connected {
            return None;
        }
        info!("connection lost, rediscovering");
        self.state = SessionState::Reconnecting;
        Some(SessionEvent::ConnectionLost)
    }

    pub fn shutdown(&mut self) {
        self.state = SessionState::Disconnected;
        self.endpoint = None;
    }

    fn adopt(&mut self, avatar: String) -> Option<SessionEvent> {
        if avatar.is_empty() {
            debug!("ignoring empty avatar id");
            return None;
        }
        if self.current.as_deref() == Some(avatar.as_str()) {
            return None;
        }
        self.previous = self.current.take();
        self.current = Some(avatar.clone());
        info!(previous = ?self.previous, current = %avatar, "avatar changed");
        Some(SessionEvent::AvatarChanged {
            previous: self.previous.clone(),
            current: avatar,
        })
    }
}
