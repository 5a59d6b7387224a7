use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use fe2o3_amqp_types::definitions;
use futures_util::Stream;
use tokio::sync::mpsc;

use crate::{
    connection::control::{submit, Control, ControlTx, SettleResponder},
    error::Result,
    results::{MessageAbandoned, MessageCompleted, MessageEnqueued, MessageRejected},
    transport::AmqpMessage,
    util::Completion,
};

use super::{
    receiver::{ReceivedMessage, SubscriberId},
    Role,
};

/// Handle to a sender link tracked by a [`ConnectionManager`](crate::ConnectionManager)
#[derive(Debug, Clone)]
pub struct Sender {
    endpoint: String,
    control: ControlTx,
}

impl Sender {
    pub(crate) fn new(endpoint: String, control: ControlTx) -> Self {
        Self { endpoint, control }
    }

    /// Endpoint address of the link
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends a message.
    ///
    /// Messages are sent in the order `send` is called. If the link has been detached in
    /// the meantime, it is re-attached first.
    pub fn send(&self, message: AmqpMessage) -> Completion<MessageEnqueued> {
        submit(&self.control, |responder| Control::Send {
            endpoint: self.endpoint.clone(),
            message,
            responder,
        })
    }

    /// Detaches the link and stops tracking it
    pub fn detach(&self) -> Completion<()> {
        submit(&self.control, |responder| Control::Detach {
            role: Role::Sender,
            endpoint: self.endpoint.clone(),
            responder,
        })
    }
}

/// Handle to a receiver link tracked by a [`ConnectionManager`](crate::ConnectionManager)
#[derive(Debug, Clone)]
pub struct Receiver {
    endpoint: String,
    control: ControlTx,
}

impl Receiver {
    pub(crate) fn new(endpoint: String, control: ControlTx) -> Self {
        Self { endpoint, control }
    }

    /// Endpoint address of the link
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Subscribes to the messages received on the link.
    ///
    /// The first subscription attaches the link if it is detached, and dropping the last
    /// [`MessageStream`] detaches it.
    pub fn subscribe(&self) -> impl Future<Output = Result<MessageStream>> + Send + 'static {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = self.endpoint.clone();
        let control = self.control.clone();
        let subscribed = submit(&self.control, |responder| Control::Subscribe {
            endpoint: endpoint.clone(),
            tx,
            responder,
        });
        async move {
            let id = subscribed.await?;
            Ok(MessageStream {
                endpoint,
                id,
                rx,
                control,
            })
        }
    }

    /// Settles a received message with the accepted outcome
    pub fn complete(&self, message: &ReceivedMessage) -> Completion<MessageCompleted> {
        submit(&self.control, |responder| Control::Settle {
            endpoint: self.endpoint.clone(),
            token: message.lock_token(),
            settlement: SettleResponder::Complete(responder),
        })
    }

    /// Settles a received message with the rejected outcome
    pub fn reject(
        &self,
        message: &ReceivedMessage,
        error: impl Into<Option<definitions::Error>>,
    ) -> Completion<MessageRejected> {
        let error = error.into();
        submit(&self.control, |responder| Control::Settle {
            endpoint: self.endpoint.clone(),
            token: message.lock_token(),
            settlement: SettleResponder::Reject(error, responder),
        })
    }

    /// Settles a received message with the released outcome so that it is redelivered
    pub fn abandon(&self, message: &ReceivedMessage) -> Completion<MessageAbandoned> {
        submit(&self.control, |responder| Control::Settle {
            endpoint: self.endpoint.clone(),
            token: message.lock_token(),
            settlement: SettleResponder::Abandon(responder),
        })
    }

    /// Detaches the link and stops tracking it
    pub fn detach(&self) -> Completion<()> {
        submit(&self.control, |responder| Control::Detach {
            role: Role::Receiver,
            endpoint: self.endpoint.clone(),
            responder,
        })
    }
}

/// Messages received on a link for one subscriber.
///
/// The stream yields an `Err` if the link detaches with an error and ends once the link
/// detaches. Dropping the stream unsubscribes.
#[derive(Debug)]
pub struct MessageStream {
    endpoint: String,
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<Result<ReceivedMessage>>,
    control: ControlTx,
}

impl MessageStream {
    /// Receives the next message
    pub async fn recv(&mut self) -> Option<Result<ReceivedMessage>> {
        self.rx.recv().await
    }
}

impl Stream for MessageStream {
    type Item = Result<ReceivedMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Unsubscribe {
            endpoint: self.endpoint.clone(),
            id: self.id,
        });
    }
}
