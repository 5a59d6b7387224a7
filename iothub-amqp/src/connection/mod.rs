//! Connection, session and link orchestration

use std::future::Future;

use tokio::sync::{mpsc, oneshot};

use crate::{
    cbs::CbsConfig,
    config::ConnectionConfig,
    error::Result,
    link::{LinkOptions, Receiver, Role, Sender},
    results::{Connected, Disconnected, MessageEnqueued, SharedAccessSignatureUpdated},
    transport::{AmqpMessage, Transport},
    util::Completion,
    Error,
};

pub(crate) mod control;
mod engine;
mod state;

use control::{submit, Control, ControlTx};
use engine::ConnectionEngine;

pub use control::{DisconnectHandler, LinkErrorHandler};
pub use state::ConnectionState;

/// Handle to a connection engine
///
/// The engine runs as a separate task and owns the connection, its single session, the
/// claims-based security agent and every link endpoint. All operations are submitted to
/// the engine in call order. Operations submitted while the connection is being opened or
/// torn down are deferred until it settles in `Connected` or `Disconnected`.
///
/// The engine stops once this handle and every [`Sender`]/[`Receiver`] created from it
/// have been dropped.
///
/// # Example
///
/// ```rust,ignore
/// let manager = ConnectionManager::new(transport);
/// manager.connect(ConnectionConfig::from_url("amqps://myhub.example.net")?).await?;
/// manager.put_token("myhub.example.net/devices/d1", sas_token).await?;
///
/// let sender = manager
///     .attach_sender_link("/devices/d1/messages/events", LinkOptions::default())
///     .await?;
/// sender.send(message).await?;
///
/// manager.disconnect().await?;
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    control: ControlTx,
}

impl ConnectionManager {
    /// Spawns a connection engine on the current tokio runtime
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::with_cbs_config(transport, CbsConfig::default())
    }

    /// Spawns a connection engine with a custom claims-based security configuration
    pub fn with_cbs_config<T: Transport>(transport: T, cbs_config: CbsConfig) -> Self {
        let (control, rx) = mpsc::unbounded_channel();
        let engine = ConnectionEngine::new(transport, rx, cbs_config);
        tokio::spawn(engine.event_loop());
        Self { control }
    }

    /// Opens the connection and its session
    pub fn connect(&self, config: ConnectionConfig) -> Completion<Connected> {
        submit(&self.control, |responder| Control::Connect(config, responder))
    }

    /// Detaches every link, then ends the session and closes the connection.
    ///
    /// If the peer does not acknowledge within the configured disconnect timeout, the
    /// remaining steps are performed locally.
    pub fn disconnect(&self) -> Completion<Disconnected> {
        submit(&self.control, Control::Disconnect)
    }

    /// Attaches the claims-based security links
    pub fn initialize_cbs(&self) -> Completion<()> {
        submit(&self.control, Control::InitializeCbs)
    }

    /// Puts a token on the claims-based security node, initializing it if needed
    pub fn put_token(
        &self,
        audience: impl Into<String>,
        token: impl Into<String>,
    ) -> Completion<SharedAccessSignatureUpdated> {
        let audience = audience.into();
        let token = token.into();
        submit(&self.control, |responder| Control::PutToken {
            audience,
            token,
            responder,
        })
    }

    /// Attaches a sender link to `endpoint`
    pub fn attach_sender_link(
        &self,
        endpoint: impl Into<String>,
        options: LinkOptions,
    ) -> impl Future<Output = Result<Sender>> + Send + 'static {
        let endpoint = endpoint.into();
        let attached = self.attach(Role::Sender, endpoint.clone(), options);
        let control = self.control.clone();
        async move {
            attached.await?;
            Ok(Sender::new(endpoint, control))
        }
    }

    /// Attaches a receiver link to `endpoint`
    pub fn attach_receiver_link(
        &self,
        endpoint: impl Into<String>,
        options: LinkOptions,
    ) -> impl Future<Output = Result<Receiver>> + Send + 'static {
        let endpoint = endpoint.into();
        let attached = self.attach(Role::Receiver, endpoint.clone(), options);
        let control = self.control.clone();
        async move {
            attached.await?;
            Ok(Receiver::new(endpoint, control))
        }
    }

    fn attach(&self, role: Role, endpoint: String, options: LinkOptions) -> Completion<()> {
        if endpoint.is_empty() {
            return Completion::failed(Error::InvalidArgument("endpoint must not be empty"));
        }
        submit(&self.control, |responder| Control::Attach {
            role,
            endpoint,
            options,
            responder,
        })
    }

    /// Detaches the sender link of `endpoint`. Succeeds immediately if none is tracked.
    pub fn detach_sender_link(&self, endpoint: impl Into<String>) -> Completion<()> {
        let endpoint = endpoint.into();
        submit(&self.control, |responder| Control::Detach {
            role: Role::Sender,
            endpoint,
            responder,
        })
    }

    /// Detaches the receiver link of `endpoint`. Succeeds immediately if none is tracked.
    pub fn detach_receiver_link(&self, endpoint: impl Into<String>) -> Completion<()> {
        let endpoint = endpoint.into();
        submit(&self.control, |responder| Control::Detach {
            role: Role::Receiver,
            endpoint,
            responder,
        })
    }

    /// Sends a message on the sender link of `endpoint`
    pub fn send(
        &self,
        endpoint: impl Into<String>,
        message: AmqpMessage,
    ) -> Completion<MessageEnqueued> {
        let endpoint = endpoint.into();
        submit(&self.control, |responder| Control::Send {
            endpoint,
            message,
            responder,
        })
    }

    /// Sets the handler invoked when the connection is lost without a `disconnect` call
    pub fn set_disconnect_handler<F>(&self, handler: F) -> Result<()>
    where
        F: FnMut(Option<Error>) + Send + 'static,
    {
        self.control
            .send(Control::SetDisconnectHandler(Box::new(handler)))?;
        Ok(())
    }

    /// Sets the handler invoked with link errors that no pending operation received
    pub fn set_link_error_handler<F>(&self, handler: F) -> Result<()>
    where
        F: FnMut(&str, Error) + Send + 'static,
    {
        self.control
            .send(Control::SetLinkErrorHandler(Box::new(handler)))?;
        Ok(())
    }

    /// Current state of the connection
    pub async fn state(&self) -> Result<ConnectionState> {
        let (tx, rx) = oneshot::channel();
        self.control.send(Control::State(tx))?;
        Ok(rx.await?)
    }
}
