use savestate_engine::{SessionEvent, SessionState};
use savestate_engine::session::AvatarSession;
use savestate_protocol::RemoteEndpoint;

fn endpoint(port: u16) -> RemoteEndpoint {
    RemoteEndpoint::new("127.0.0.1", port)
}

#[test]
fn first_connection_reports_endpoint_then_identity() {
    let mut session = AvatarSession::new();
    assert_eq!(session.state(), SessionState::Disconnected);
    session.begin_discovery();
    assert_eq!(session.state(), SessionState::Discovering);
    assert!(session.is_awaiting_endpoint());

    let events = session.on_connected(endpoint(9001), "avtr_A".to_string());
    assert_eq!(
        events,
        vec![
            SessionEvent::AvatarConnected(endpoint(9001)),
            SessionEvent::AvatarChanged {
                previous: None,
                current: "avtr_A".to_string(),
            },
        ]
    );
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.current(), Some("avtr_A"));
    assert_eq!(session.previous(), None);
}

#[test]
fn repeated_identity_is_ignored() {
    let mut session = AvatarSession::new();
    session.begin_discovery();
    session.on_connected(endpoint(9001), "avtr_A".to_string());

    assert_eq!(session.on_avatar_message("avtr_A"), None);
    assert_eq!(session.on_avatar_message(""), None);

    let event = session.on_avatar_message("avtr_B");
    assert_eq!(
        event,
        Some(SessionEvent::AvatarChanged {
            previous: Some("avtr_A".to_string()),
            current: "avtr_B".to_string(),
        })
    );
    assert_eq!(session.on_avatar_message("avtr_B"), None);
    assert_eq!(session.previous(), Some("avtr_A"));
}

#[test]
fn connection_loss_keeps_identity_and_reconnect_is_quiet_for_same_avatar() {
    let mut session = AvatarSession::new();
    session.begin_discovery();
    session.on_connected(endpoint(9001), "avtr_A".to_string());
    session.on_avatar_message("avtr_B");

    assert_eq!(session.on_remote_failure(), Some(SessionEvent::ConnectionLost));
    assert_eq!(session.state(), SessionState::Reconnecting);
    assert!(session.endpoint().is_none());
    assert!(session.is_awaiting_endpoint());
    assert_eq!(session.current(), Some("avtr_B"));
    assert_eq!(session.previous(), Some("avtr_A"));

    // A second failure while already away is not a new loss.
    assert_eq!(session.on_remote_failure(), None);

    let events = session.on_connected(endpoint(9002), "avtr_B".to_string());
    assert_eq!(events, vec![SessionEvent::AvatarConnected(endpoint(9002))]);
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.previous(), Some("avtr_A"));
}

#[test]
fn reconnect_with_new_avatar_reports_change() {
    let mut session = AvatarSession::new();
    session.begin_discovery();
    session.on_connected(endpoint(9001), "avtr_A".to_string());
    session.on_remote_failure();

    let events = session.on_connected(endpoint(9001), "avtr_C".to_string());
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[1],
        SessionEvent::AvatarChanged {
            previous: Some("avtr_A".to_string()),
            current: "avtr_C".to_string(),
        }
    );
}

#[test]
fn shutdown_returns_to_disconnected() {
    let mut session = AvatarSession::new();
    session.begin_discovery();
    session.on_connected(endpoint(9001), "avtr_A".to_string());
    session.shutdown();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.endpoint().is_none());
    assert_eq!(session.on_remote_failure(), None);
}
