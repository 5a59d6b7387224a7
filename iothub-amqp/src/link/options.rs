use std::collections::BTreeMap;

use fe2o3_amqp_types::definitions::{ReceiverSettleMode, SenderSettleMode};

/// Options of a link attach
///
/// The endpoint address is always written into `target` for a sender and into `source`
/// for a receiver when the link is attached, and `name` is replaced with a fresh name on
/// every attach attempt.
#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    /// Link name
    pub name: Option<String>,
    /// Source address
    pub source: Option<String>,
    /// Target address
    pub target: Option<String>,
    /// Sender settle mode
    pub snd_settle_mode: Option<SenderSettleMode>,
    /// Receiver settle mode
    pub rcv_settle_mode: Option<ReceiverSettleMode>,
    /// Link properties
    pub properties: BTreeMap<String, String>,
}

impl LinkOptions {
    /// Adds a link property
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Sets the sender settle mode
    pub fn snd_settle_mode(mut self, mode: SenderSettleMode) -> Self {
        self.snd_settle_mode = Some(mode);
        self
    }

    /// Sets the receiver settle mode
    pub fn rcv_settle_mode(mut self, mode: ReceiverSettleMode) -> Self {
        self.rcv_settle_mode = Some(mode);
        self
    }

    pub(crate) fn for_attach(&self, role: Role, address: &str, name: String) -> Self {
        let mut options = self.clone();
        options.name = Some(name);
        match role {
            Role::Sender => options.target = Some(address.to_string()),
            Role::Receiver => options.source = Some(address.to_string()),
        }
        options
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}
