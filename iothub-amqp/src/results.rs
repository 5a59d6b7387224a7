//! Typed results returned by successful operations

/// The connection and its session are open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected;

/// The connection has been torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

/// The message has been handed to the transport and, if unsettled, accepted by the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageEnqueued;

/// A received message was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCompleted;

/// A received message was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRejected;

/// A received message was released back to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageAbandoned;

/// A put-token request was acknowledged by the CBS node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedAccessSignatureUpdated;
