//! Connection lifecycle: connect, deferral, disconnect rundown and the watchdog

mod common;

use std::time::Duration;

use fe2o3_amqp_types::definitions::AmqpError;
use iothub_amqp::{
    constants::USER_AGENT_PROPERTY,
    transport::{ConnectionEvent, SenderEvent, SessionEvent},
    ConnectionConfig, ConnectionManager, ConnectionState, Error, LinkOptions,
};
use tokio::{sync::mpsc, time::Instant};
use tokio_test::{assert_err, assert_ok};

use common::{body, message, settle, Call, Mock};

const EVENTS: &str = "/devices/d1/messages/events";

fn config() -> ConnectionConfig {
    ConnectionConfig::builder()
        .container_id("d1")
        .user_agent("device/1.0")
        .build("amqps://hub.example.net")
        .unwrap()
}

fn internal_error(description: &str) -> Error {
    Error::amqp_error(AmqpError::InternalError, description.to_string())
}

fn position(calls: &[Call], call: &Call) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{:?} not found in {:?}", call, calls))
}

#[tokio::test(start_paused = true)]
async fn connect_attach_send_disconnect() {
    let mock = Mock::new();
    let manager = ConnectionManager::new(mock.transport());

    assert_ok!(manager.connect(config()).await);
    assert_eq!(manager.state().await.unwrap(), ConnectionState::Connected);

    let params = mock.params().unwrap();
    assert_eq!(params.host, "hub.example.net");
    assert_eq!(params.port, 5671);
    assert!(params.tls.is_some());
    assert!(!params.reconnect);
    assert_eq!(
        params.properties.get(USER_AGENT_PROPERTY).map(String::as_str),
        Some("device/1.0")
    );

    let sender = manager
        .attach_sender_link(EVENTS, LinkOptions::default())
        .await
        .unwrap();
    assert_ok!(sender.send(message("hello")).await);
    assert_eq!(body(&mock.sent(EVENTS)[0]), Some("hello"));

    assert_ok!(manager.disconnect().await);
    assert_eq!(manager.state().await.unwrap(), ConnectionState::Disconnected);

    let calls = mock.calls();
    let link = Call::CloseLink(mock.link_names(EVENTS)[0].clone());
    assert!(position(&calls, &link) < position(&calls, &Call::CloseSession));
    assert!(position(&calls, &Call::CloseSession) < position(&calls, &Call::CloseConnection));
    assert_eq!(mock.count(&Call::RemoveConnection), 0);
    assert_eq!(mock.count(&Call::RemoveSession), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_fails_when_the_transport_cannot_open() {
    let mock = Mock::with(|s| s.fail_open_connection = Some(internal_error("unreachable")));
    let manager = ConnectionManager::new(mock.transport());

    let err = assert_err!(manager.connect(config()).await);
    assert!(matches!(err, Error::Amqp(_)));
    assert_eq!(manager.state().await.unwrap(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn close_before_connected_fails_the_connect() {
    let mock = Mock::with(|s| s.behaviour.auto_open = false);
    let manager = ConnectionManager::new(mock.transport());

    let connecting = manager.connect(config());
    settle().await;
    assert_eq!(manager.state().await.unwrap(), ConnectionState::Connecting);

    mock.connection_sink()
        .emit(ConnectionEvent::Close(Some(internal_error("refused"))));
    let err = assert_err!(connecting.await);
    assert!(matches!(err, Error::Amqp(_)));
    assert_eq!(manager.state().await.unwrap(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn inputs_are_deferred_until_connected() {
    let mock = Mock::with(|s| s.behaviour.auto_open = false);
    let manager = ConnectionManager::new(mock.transport());

    let connecting = manager.connect(config());
    let attaching = manager.attach_sender_link(EVENTS, LinkOptions::default());
    settle().await;
    assert_eq!(mock.calls(), vec![Call::OpenConnection]);

    mock.connection_sink().emit(ConnectionEvent::Open);
    settle().await;
    assert_eq!(
        manager.state().await.unwrap(),
        ConnectionState::ConnectingSession
    );
    assert_eq!(mock.count(&Call::OpenSender(EVENTS.into())), 0);

    mock.update(|s| s.behaviour.auto_open = true);
    mock.session_sink().emit(SessionEvent::Open);

    assert_ok!(connecting.await);
    let sender = attaching.await.unwrap();
    assert_eq!(sender.endpoint(), EVENTS);
    assert_eq!(mock.count(&Call::OpenSender(EVENTS.into())), 1);
}

#[tokio::test(start_paused = true)]
async fn operations_require_a_connection() {
    let mock = Mock::new();
    let manager = ConnectionManager::new(mock.transport());

    let err = assert_err!(manager.attach_sender_link(EVENTS, LinkOptions::default()).await);
    assert!(matches!(err, Error::NotConnected(_)));
    let err = assert_err!(manager.send(EVENTS, message("m")).await);
    assert!(matches!(err, Error::NotConnected(_)));
    let err = assert_err!(manager.put_token("audience", "token").await);
    assert!(matches!(err, Error::NotConnected(_)));
    let err = assert_err!(manager.initialize_cbs().await);
    assert!(matches!(err, Error::NotConnected(_)));

    // Nothing tracked, nothing to do
    assert_ok!(manager.detach_sender_link(EVENTS).await);
    assert_ok!(manager.detach_receiver_link(EVENTS).await);
    assert_ok!(manager.disconnect().await);
    assert!(mock.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_endpoint_is_rejected() {
    let mock = Mock::new();
    let manager = ConnectionManager::new(mock.transport());
    assert_ok!(manager.connect(config()).await);

    let err = assert_err!(manager.attach_sender_link("", LinkOptions::default()).await);
    assert!(matches!(err, Error::InvalidArgument(_)));
    let err = assert_err!(manager.attach_receiver_link("", LinkOptions::default()).await);
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test(start_paused = true)]
async fn watchdog_forces_the_teardown() {
    let mock = Mock::with(|s| s.behaviour.auto_close = false);
    let manager = ConnectionManager::new(mock.transport());
    assert_ok!(manager.connect(config()).await);
    manager
        .attach_sender_link(EVENTS, LinkOptions::default())
        .await
        .unwrap();

    let start = Instant::now();
    assert_ok!(manager.disconnect().await);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(45), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(46), "{:?}", elapsed);

    let name = mock.link_names(EVENTS)[0].clone();
    assert_eq!(mock.count(&Call::CloseLink(name.clone())), 1);
    assert_eq!(mock.count(&Call::RemoveLink(name)), 1);
    assert_eq!(mock.count(&Call::CloseSession), 0);
    assert_eq!(mock.count(&Call::RemoveSession), 1);
    assert_eq!(mock.count(&Call::RemoveConnection), 1);
    assert_eq!(manager.state().await.unwrap(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn watchdog_interval_comes_from_the_config() {
    let mock = Mock::with(|s| s.behaviour.auto_close = false);
    let manager = ConnectionManager::new(mock.transport());
    let config = ConnectionConfig::builder()
        .disconnect_timeout(Duration::from_secs(5))
        .build("amqp://localhost")
        .unwrap();
    assert_ok!(manager.connect(config).await);

    let start = Instant::now();
    assert_ok!(manager.disconnect().await);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn peer_close_runs_a_forced_rundown_and_notifies() {
    let mock = Mock::new();
    let manager = ConnectionManager::new(mock.transport());
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager
        .set_disconnect_handler(move |error| {
            let _ = tx.send(error);
        })
        .unwrap();
    assert_ok!(manager.connect(config()).await);
    let sender = manager
        .attach_sender_link(EVENTS, LinkOptions::default())
        .await
        .unwrap();

    mock.connection_sink()
        .emit(ConnectionEvent::Disconnected(Some(internal_error("socket reset"))));

    let reason = rx.recv().await.unwrap();
    assert!(matches!(reason, Some(Error::Amqp(_))));

    let name = mock.link_names(EVENTS)[0].clone();
    assert_eq!(mock.count(&Call::RemoveLink(name.clone())), 1);
    assert_eq!(mock.count(&Call::CloseLink(name)), 0);
    assert_eq!(mock.count(&Call::CloseConnection), 0);
    assert_eq!(mock.count(&Call::RemoveConnection), 0);
    assert_eq!(manager.state().await.unwrap(), ConnectionState::Disconnected);

    let err = assert_err!(sender.send(message("late")).await);
    assert!(matches!(err, Error::NotConnected(_)));
}

#[tokio::test(start_paused = true)]
async fn trigger_error_wins_over_later_errors() {
    let mock = Mock::with(|s| s.behaviour.auto_close = false);
    let manager = ConnectionManager::new(mock.transport());
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager
        .set_disconnect_handler(move |error| {
            let _ = tx.send(error);
        })
        .unwrap();
    assert_ok!(manager.connect(config()).await);
    manager
        .attach_sender_link(EVENTS, LinkOptions::default())
        .await
        .unwrap();

    mock.session_sink()
        .emit(SessionEvent::Error(internal_error("first")));
    settle().await;
    assert_eq!(
        manager.state().await.unwrap(),
        ConnectionState::Disconnecting
    );

    mock.sender_sink(EVENTS)
        .emit(SenderEvent::Close(Some(internal_error("second"))));
    settle().await;
    mock.session_sink().emit(SessionEvent::Close(None));
    settle().await;
    mock.connection_sink().emit(ConnectionEvent::Close(None));

    match rx.recv().await.unwrap() {
        Some(Error::Amqp(error)) => assert_eq!(error.description.as_deref(), Some("first")),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn detach_error_is_reported_to_the_disconnect_caller() {
    let mock = Mock::with(|s| s.behaviour.auto_close = false);
    let manager = ConnectionManager::new(mock.transport());
    assert_ok!(manager.connect(config()).await);
    manager
        .attach_sender_link(EVENTS, LinkOptions::default())
        .await
        .unwrap();

    let disconnecting = manager.disconnect();
    settle().await;
    mock.sender_sink(EVENTS)
        .emit(SenderEvent::Close(Some(internal_error("detach refused"))));
    settle().await;
    mock.session_sink().emit(SessionEvent::Close(None));
    settle().await;
    mock.connection_sink().emit(ConnectionEvent::Close(None));

    match assert_err!(disconnecting.await) {
        Error::Amqp(error) => assert_eq!(error.description.as_deref(), Some("detach refused")),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn connect_during_disconnect_runs_afterwards() {
    let mock = Mock::with(|s| s.behaviour.auto_close = false);
    let manager = ConnectionManager::new(mock.transport());
    assert_ok!(manager.connect(config()).await);

    let disconnecting = manager.disconnect();
    let reconnecting = manager.connect(config());
    settle().await;
    assert_eq!(mock.count(&Call::OpenConnection), 1);

    mock.session_sink().emit(SessionEvent::Close(None));
    settle().await;
    mock.connection_sink().emit(ConnectionEvent::Close(None));

    assert_ok!(disconnecting.await);
    assert_ok!(reconnecting.await);
    assert_eq!(mock.count(&Call::OpenConnection), 2);
    assert_eq!(manager.state().await.unwrap(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn events_of_a_previous_connection_are_ignored() {
    let mock = Mock::new();
    let manager = ConnectionManager::new(mock.transport());
    assert_ok!(manager.connect(config()).await);
    let stale = mock.connection_sink();
    assert_ok!(manager.disconnect().await);
    assert_ok!(manager.connect(config()).await);

    stale.emit(ConnectionEvent::Close(Some(internal_error("stale"))));
    settle().await;
    assert_eq!(manager.state().await.unwrap(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_tears_down_locally() {
    let mock = Mock::new();
    let manager = ConnectionManager::new(mock.transport());
    assert_ok!(manager.connect(config()).await);
    drop(manager);
    settle().await;

    assert_eq!(mock.count(&Call::RemoveSession), 1);
    assert_eq!(mock.count(&Call::RemoveConnection), 1);
}
