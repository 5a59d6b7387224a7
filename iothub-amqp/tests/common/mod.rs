//! In-memory transport that records every call and lets tests inject events

#![allow(dead_code)]

use std::sync::Arc;

use fe2o3_amqp_types::{
    definitions,
    messaging::{AmqpValue, ApplicationProperties, Body, Message, MessageId, Properties},
    primitives::{SimpleValue, Value},
};
use iothub_amqp::{
    config::TransportParameters,
    constants::STATUS_CODE,
    transport::{
        AmqpMessage, Connection, ConnectionEvent, Disposition, EventSink, Link, ReceiverEvent,
        ReceiverLink, SenderEvent, SenderLink, SentDelivery, Session, SessionEvent, Transport,
    },
    ConnectionConfig, ConnectionManager, Error, LinkOptions, Result,
};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    OpenConnection,
    CloseConnection,
    RemoveConnection,
    CreateSession,
    CloseSession,
    RemoveSession,
    OpenSender(String),
    OpenReceiver(String),
    CloseLink(String),
    RemoveLink(String),
    Accept(u64),
    Reject(u64),
    Release(u64),
}

/// How the mock peer answers
#[derive(Debug, Clone)]
pub struct Behaviour {
    /// Answer open/begin/attach immediately
    pub auto_open: bool,
    /// Answer close/end/detach immediately
    pub auto_close: bool,
    /// Deliveries are settled as they are sent
    pub settled: bool,
    pub sendable: bool,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            auto_open: true,
            auto_close: true,
            settled: true,
            sendable: true,
        }
    }
}

pub struct MockLink {
    pub name: String,
    pub address: String,
    pub sender: Option<EventSink<SenderEvent>>,
    pub receiver: Option<EventSink<ReceiverEvent<MockDelivery>>>,
}

#[derive(Default)]
pub struct State {
    pub behaviour: Behaviour,
    pub calls: Vec<Call>,
    pub params: Option<TransportParameters>,
    pub connection: Option<EventSink<ConnectionEvent>>,
    pub session: Option<EventSink<SessionEvent>>,
    pub links: Vec<MockLink>,
    pub sent: Vec<(String, AmqpMessage)>,
    pub next_delivery: u32,
    pub next_incoming: u64,
    pub fail_open_connection: Option<Error>,
    pub fail_open_sender: Option<Error>,
    pub fail_send: Option<Error>,
}

#[derive(Clone, Default)]
pub struct Mock {
    state: Arc<Mutex<State>>,
}

impl Mock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(configure: impl FnOnce(&mut State)) -> Self {
        let mock = Self::default();
        configure(&mut mock.state.lock());
        mock
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport {
            state: self.state.clone(),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut State)) {
        f(&mut self.state.lock())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn params(&self) -> Option<TransportParameters> {
        self.state.lock().params.clone()
    }

    pub fn connection_sink(&self) -> EventSink<ConnectionEvent> {
        self.state.lock().connection.clone().expect("no connection")
    }

    pub fn session_sink(&self) -> EventSink<SessionEvent> {
        self.state.lock().session.clone().expect("no session")
    }

    /// Sink of the latest sender link opened on `address`
    pub fn sender_sink(&self, address: &str) -> EventSink<SenderEvent> {
        self.state
            .lock()
            .links
            .iter()
            .rev()
            .find(|link| link.address == address && link.sender.is_some())
            .and_then(|link| link.sender.clone())
            .expect("no sender link")
    }

    /// Sink of the latest receiver link opened on `address`
    pub fn receiver_sink(&self, address: &str) -> EventSink<ReceiverEvent<MockDelivery>> {
        self.state
            .lock()
            .links
            .iter()
            .rev()
            .find(|link| link.address == address && link.receiver.is_some())
            .and_then(|link| link.receiver.clone())
            .expect("no receiver link")
    }

    /// Names of every link opened on `address`, oldest first
    pub fn link_names(&self, address: &str) -> Vec<String> {
        self.state
            .lock()
            .links
            .iter()
            .filter(|link| link.address == address)
            .map(|link| link.name.clone())
            .collect()
    }

    pub fn sent(&self, address: &str) -> Vec<AmqpMessage> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Delivers `message` on the latest receiver link of `address`
    pub fn deliver(&self, address: &str, message: AmqpMessage) -> u64 {
        let sink = self.receiver_sink(address);
        let id = {
            let mut state = self.state.lock();
            state.next_incoming += 1;
            state.next_incoming
        };
        sink.emit(ReceiverEvent::Message {
            message,
            delivery: MockDelivery {
                id,
                state: self.state.clone(),
            },
        });
        id
    }
}

pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl Transport for MockTransport {
    type Connection = MockConnection;

    fn open_connection(
        &mut self,
        params: TransportParameters,
        events: EventSink<ConnectionEvent>,
    ) -> Result<MockConnection> {
        let mut state = self.state.lock();
        state.calls.push(Call::OpenConnection);
        state.params = Some(params);
        if let Some(error) = state.fail_open_connection.take() {
            return Err(error);
        }
        if state.behaviour.auto_open {
            events.emit(ConnectionEvent::Open);
        }
        state.connection = Some(events);
        Ok(MockConnection {
            state: self.state.clone(),
        })
    }
}

pub struct MockConnection {
    state: Arc<Mutex<State>>,
}

impl Connection for MockConnection {
    type Session = MockSession;

    fn create_session(&mut self, events: EventSink<SessionEvent>) -> Result<MockSession> {
        let mut state = self.state.lock();
        state.calls.push(Call::CreateSession);
        if state.behaviour.auto_open {
            events.emit(SessionEvent::Open);
        }
        state.session = Some(events);
        Ok(MockSession {
            state: self.state.clone(),
        })
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.calls.push(Call::CloseConnection);
        if state.behaviour.auto_close {
            if let Some(sink) = &state.connection {
                sink.emit(ConnectionEvent::Close(None));
            }
        }
    }

    fn remove(&mut self) {
        self.state.lock().calls.push(Call::RemoveConnection);
    }
}

pub struct MockSession {
    state: Arc<Mutex<State>>,
}

impl Session for MockSession {
    type Sender = MockSender;
    type Receiver = MockReceiver;

    fn open_sender(
        &mut self,
        options: LinkOptions,
        events: EventSink<SenderEvent>,
    ) -> Result<MockSender> {
        let mut state = self.state.lock();
        let address = options.target.clone().unwrap_or_default();
        state.calls.push(Call::OpenSender(address.clone()));
        if let Some(error) = state.fail_open_sender.take() {
            return Err(error);
        }
        if state.behaviour.auto_open {
            events.emit(SenderEvent::Open);
        }
        let name = options.name.clone().unwrap_or_default();
        state.links.push(MockLink {
            name: name.clone(),
            address: address.clone(),
            sender: Some(events.clone()),
            receiver: None,
        });
        Ok(MockSender {
            state: self.state.clone(),
            name,
            address,
            events,
        })
    }

    fn open_receiver(
        &mut self,
        options: LinkOptions,
        events: EventSink<ReceiverEvent<MockDelivery>>,
    ) -> Result<MockReceiver> {
        let mut state = self.state.lock();
        let address = options.source.clone().unwrap_or_default();
        state.calls.push(Call::OpenReceiver(address.clone()));
        if state.behaviour.auto_open {
            events.emit(ReceiverEvent::Open);
        }
        let name = options.name.clone().unwrap_or_default();
        state.links.push(MockLink {
            name: name.clone(),
            address,
            sender: None,
            receiver: Some(events.clone()),
        });
        Ok(MockReceiver {
            state: self.state.clone(),
            name,
            events,
        })
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.calls.push(Call::CloseSession);
        if state.behaviour.auto_close {
            if let Some(sink) = &state.session {
                sink.emit(SessionEvent::Close(None));
            }
        }
    }

    fn remove(&mut self) {
        self.state.lock().calls.push(Call::RemoveSession);
    }
}

pub struct MockSender {
    state: Arc<Mutex<State>>,
    name: String,
    address: String,
    events: EventSink<SenderEvent>,
}

impl Link for MockSender {
    fn close(&mut self) {
        let mut state = self.state.lock();
        state.calls.push(Call::CloseLink(self.name.clone()));
        if state.behaviour.auto_close {
            self.events.emit(SenderEvent::Close(None));
        }
    }

    fn remove(&mut self) {
        self.state.lock().calls.push(Call::RemoveLink(self.name.clone()));
    }
}

impl SenderLink for MockSender {
    fn sendable(&self) -> bool {
        self.state.lock().behaviour.sendable
    }

    fn send(&mut self, message: AmqpMessage) -> Result<SentDelivery> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_send.take() {
            return Err(error);
        }
        state.sent.push((self.address.clone(), message));
        state.next_delivery += 1;
        Ok(SentDelivery {
            id: state.next_delivery,
            settled: state.behaviour.settled,
        })
    }
}

pub struct MockReceiver {
    state: Arc<Mutex<State>>,
    name: String,
    events: EventSink<ReceiverEvent<MockDelivery>>,
}

impl Link for MockReceiver {
    fn close(&mut self) {
        let mut state = self.state.lock();
        state.calls.push(Call::CloseLink(self.name.clone()));
        if state.behaviour.auto_close {
            self.events.emit(ReceiverEvent::Close(None));
        }
    }

    fn remove(&mut self) {
        self.state.lock().calls.push(Call::RemoveLink(self.name.clone()));
    }
}

impl ReceiverLink for MockReceiver {
    type Delivery = MockDelivery;
}

pub struct MockDelivery {
    id: u64,
    state: Arc<Mutex<State>>,
}

impl Disposition for MockDelivery {
    fn accept(self) {
        self.state.lock().calls.push(Call::Accept(self.id));
    }

    fn reject(self, _error: Option<definitions::Error>) {
        self.state.lock().calls.push(Call::Reject(self.id));
    }

    fn release(self) {
        self.state.lock().calls.push(Call::Release(self.id));
    }
}

pub fn message(body: &str) -> AmqpMessage {
    Message {
        header: None,
        delivery_annotations: None,
        message_annotations: None,
        properties: None,
        application_properties: None,
        body: Body::Value(AmqpValue(Value::String(body.to_string()))),
        footer: None,
    }
}

pub fn body(message: &AmqpMessage) -> Option<&str> {
    match &message.body {
        Body::Value(AmqpValue(Value::String(s))) => Some(s.as_str()),
        _ => None,
    }
}

/// The message id of a put-token request, as a string
pub fn message_id(message: &AmqpMessage) -> String {
    match message.properties.as_ref().and_then(|p| p.message_id.clone()) {
        Some(MessageId::String(id)) => id,
        other => panic!("unexpected message id {:?}", other),
    }
}

/// A put-token response from the CBS node
pub fn cbs_response(correlation_id: &str, status_code: i32) -> AmqpMessage {
    let mut response = message("");
    response.properties = Some(
        Properties::builder()
            .correlation_id(MessageId::String(correlation_id.to_string()))
            .build(),
    );
    response.application_properties = Some(
        ApplicationProperties::builder()
            .insert(STATUS_CODE, SimpleValue::Int(status_code))
            .build(),
    );
    response
}

/// Spawns an engine on `mock` and connects it
pub async fn connected(mock: &Mock) -> ConnectionManager {
    let manager = ConnectionManager::new(mock.transport());
    manager
        .connect(ConnectionConfig::from_url("amqps://hub.example.net").unwrap())
        .await
        .unwrap();
    manager
}

/// Lets the engine task drain every ready input
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
