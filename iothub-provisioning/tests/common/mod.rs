//! Scripted provisioning transport

#![allow(dead_code)]

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use iothub_provisioning::{
    Error, PollingTransport, RegistrationRequest, RegistrationResult, RegistrationState,
    ResponseInfo, Result, TransportReply,
};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Register(String),
    Query(String),
    Cancel,
    Disconnect,
}

/// How the next registration request or status query is answered
pub enum Script {
    Reply(Result<TransportReply>),
    Delayed(Duration, Result<TransportReply>),
    /// Never answers
    Hang,
}

#[derive(Default)]
pub struct State {
    pub calls: Vec<Call>,
    pub scripts: VecDeque<Script>,
    pub cancel_delay: Option<Duration>,
    pub cancel_error: Option<Error>,
    pub disconnect_error: Option<Error>,
}

#[derive(Clone, Default)]
pub struct Mock {
    state: Arc<Mutex<State>>,
}

impl Mock {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        let mock = Self::default();
        mock.state.lock().scripts.extend(scripts);
        mock
    }

    pub fn update(&self, f: impl FnOnce(&mut State)) {
        f(&mut self.state.lock())
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport {
            state: self.state.clone(),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }
}

pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    async fn answer(&self, call: Call) -> Result<TransportReply> {
        let script = {
            let mut state = self.state.lock();
            state.calls.push(call);
            state.scripts.pop_front()
        };
        match script {
            Some(Script::Reply(reply)) => reply,
            Some(Script::Delayed(delay, reply)) => {
                tokio::time::sleep(delay).await;
                reply
            }
            Some(Script::Hang) | None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl PollingTransport for MockTransport {
    async fn registration_request(&self, request: &RegistrationRequest) -> Result<TransportReply> {
        self.answer(Call::Register(request.registration_id.clone()))
            .await
    }

    async fn query_operation_status(
        &self,
        _request: &RegistrationRequest,
        operation_id: &str,
    ) -> Result<TransportReply> {
        self.answer(Call::Query(operation_id.to_string())).await
    }

    async fn cancel(&self) -> Result<()> {
        let (delay, error) = {
            let mut state = self.state.lock();
            state.calls.push(Call::Cancel);
            (state.cancel_delay, state.cancel_error.take())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        error.map_or(Ok(()), Err)
    }

    async fn disconnect(&self) -> Result<()> {
        let error = {
            let mut state = self.state.lock();
            state.calls.push(Call::Disconnect);
            state.disconnect_error.take()
        };
        error.map_or(Ok(()), Err)
    }
}

pub fn status(status: &str) -> TransportReply {
    TransportReply {
        result: RegistrationResult {
            status: status.to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn assigning(operation_id: &str) -> TransportReply {
    let mut reply = status("assigning");
    reply.result.operation_id = Some(operation_id.to_string());
    reply
}

pub fn assigned(device_id: &str) -> TransportReply {
    let mut reply = status("assigned");
    reply.result.registration_state = Some(RegistrationState {
        assigned_hub: Some("hub.example.net".to_string()),
        device_id: Some(device_id.to_string()),
        status: Some("assigned".to_string()),
        ..Default::default()
    });
    reply.response = ResponseInfo {
        status_code: Some(200),
        ..Default::default()
    };
    reply
}

/// Lets the engine and transport tasks drain every ready input
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
