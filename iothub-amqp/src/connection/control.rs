//! Controls sent from the public handles to the connection engine

use fe2o3_amqp_types::definitions;
use tokio::sync::{mpsc, oneshot};

use crate::{
    config::ConnectionConfig,
    link::{
        receiver::{MessageTx, SubscriberId},
        LinkOptions, LockToken, Role,
    },
    results::{
        Connected, Disconnected, MessageAbandoned, MessageCompleted, MessageEnqueued,
        MessageRejected, SharedAccessSignatureUpdated,
    },
    transport::AmqpMessage,
    util::{Completion, Responder},
    Error,
};

use super::ConnectionState;

/// Invoked whenever the connection reaches `Disconnected` without a pending `disconnect` call
pub type DisconnectHandler = Box<dyn FnMut(Option<Error>) + Send>;

/// Invoked with the endpoint address of a link that failed with no caller to report to
pub type LinkErrorHandler = Box<dyn FnMut(&str, Error) + Send>;

pub(crate) type ControlTx = mpsc::UnboundedSender<Control>;

pub(crate) enum SettleResponder {
    Complete(Responder<MessageCompleted>),
    Reject(Option<definitions::Error>, Responder<MessageRejected>),
    Abandon(Responder<MessageAbandoned>),
}

pub(crate) enum Control {
    Connect(ConnectionConfig, Responder<Connected>),
    Disconnect(Responder<Disconnected>),
    InitializeCbs(Responder<()>),
    PutToken {
        audience: String,
        token: String,
        responder: Responder<SharedAccessSignatureUpdated>,
    },
    Attach {
        role: Role,
        endpoint: String,
        options: LinkOptions,
        responder: Responder<()>,
    },
    Detach {
        role: Role,
        endpoint: String,
        responder: Responder<()>,
    },
    Send {
        endpoint: String,
        message: AmqpMessage,
        responder: Responder<MessageEnqueued>,
    },
    Subscribe {
        endpoint: String,
        tx: MessageTx,
        responder: Responder<SubscriberId>,
    },
    Unsubscribe {
        endpoint: String,
        id: SubscriberId,
    },
    Settle {
        endpoint: String,
        token: LockToken,
        settlement: SettleResponder,
    },
    SetDisconnectHandler(DisconnectHandler),
    SetLinkErrorHandler(LinkErrorHandler),
    State(oneshot::Sender<ConnectionState>),
}

impl Control {
    pub fn name(&self) -> &'static str {
        match self {
            Control::Connect(..) => "connect",
            Control::Disconnect(_) => "disconnect",
            Control::InitializeCbs(_) => "initialize_cbs",
            Control::PutToken { .. } => "put_token",
            Control::Attach { .. } => "attach",
            Control::Detach { .. } => "detach",
            Control::Send { .. } => "send",
            Control::Subscribe { .. } => "subscribe",
            Control::Unsubscribe { .. } => "unsubscribe",
            Control::Settle { .. } => "settle",
            Control::SetDisconnectHandler(_) => "set_disconnect_handler",
            Control::SetLinkErrorHandler(_) => "set_link_error_handler",
            Control::State(_) => "state",
        }
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Hands a control to the engine and returns the completion of its responder
pub(crate) fn submit<T>(
    control: &ControlTx,
    build: impl FnOnce(Responder<T>) -> Control,
) -> Completion<T> {
    let (tx, rx) = oneshot::channel();
    match control.send(build(tx)) {
        Ok(()) => Completion::pending(rx),
        Err(_) => Completion::failed(Error::EngineStopped),
    }
}
