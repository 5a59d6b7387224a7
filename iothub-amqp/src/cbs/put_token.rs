use std::collections::VecDeque;

use fe2o3_amqp_types::{
    messaging::{AmqpValue, ApplicationProperties, Body, Message, MessageId, Properties},
    primitives::{SimpleValue, Value},
};
use tokio::time::Instant;

use crate::{
    constants::{
        CBS_NODE_ADDR, CBS_REPLY_TO, NAME, OPERATION, PUT_TOKEN, STATUS_CODE,
        STATUS_DESCRIPTION, TYPE,
    },
    results::SharedAccessSignatureUpdated,
    transport::AmqpMessage,
    util::Responder,
};

pub(crate) struct PutTokenRequest {
    pub audience: String,
    pub token: String,
    pub responder: Responder<SharedAccessSignatureUpdated>,
}

/// Builds the request message. `message_id` is echoed by the node as the correlation id.
pub(crate) fn put_token_message(
    token_type: &str,
    audience: &str,
    token: String,
    message_id: &str,
) -> AmqpMessage {
    let application_properties = ApplicationProperties::builder()
        .insert(OPERATION, PUT_TOKEN)
        .insert(TYPE, token_type)
        .insert(NAME, audience)
        .build();
    let properties = Properties::builder()
        .message_id(MessageId::String(message_id.to_string()))
        .to(CBS_NODE_ADDR.to_string())
        .reply_to(CBS_REPLY_TO.to_string())
        .build();
    Message {
        header: None,
        delivery_annotations: None,
        message_annotations: None,
        properties: Some(properties),
        application_properties: Some(application_properties),
        body: Body::Value(AmqpValue(Value::String(token))),
        footer: None,
    }
}

/// Parsed put-token response
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PutTokenResponse {
    pub correlation_id: Option<String>,
    pub status_code: Option<i64>,
    pub status_description: Option<String>,
}

impl PutTokenResponse {
    pub fn from_message(message: &AmqpMessage) -> Self {
        let correlation_id = message
            .properties
            .as_ref()
            .and_then(|p| p.correlation_id.as_ref())
            .and_then(|id| match id {
                MessageId::String(id) => Some(id.clone()),
                _ => None,
            });
        let properties = message.application_properties.as_ref();
        let status_code = properties
            .and_then(|ap| ap.get(STATUS_CODE))
            .and_then(|value| match value {
                SimpleValue::Short(v) => Some(i64::from(*v)),
                SimpleValue::Int(v) => Some(i64::from(*v)),
                SimpleValue::Long(v) => Some(*v),
                SimpleValue::Ushort(v) => Some(i64::from(*v)),
                SimpleValue::Uint(v) => Some(i64::from(*v)),
                SimpleValue::Ulong(v) => i64::try_from(*v).ok(),
                _ => None,
            });
        let status_description = properties
            .and_then(|ap| ap.get(STATUS_DESCRIPTION))
            .and_then(|value| match value {
                SimpleValue::String(s) => Some(s.clone()),
                _ => None,
            });
        Self {
            correlation_id,
            status_code,
            status_description,
        }
    }
}

pub(crate) struct OutstandingPutToken {
    pub correlation_id: String,
    pub expires_at: Instant,
    pub responder: Responder<SharedAccessSignatureUpdated>,
}

/// Outstanding requests in send order, which is also expiry order
#[derive(Default)]
pub(crate) struct OutstandingPutTokens {
    entries: VecDeque<OutstandingPutToken>,
}

impl OutstandingPutTokens {
    pub fn push(&mut self, entry: OutstandingPutToken) {
        self.entries.push_back(entry);
    }

    pub fn remove(&mut self, correlation_id: &str) -> Option<OutstandingPutToken> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.correlation_id == correlation_id)?;
        self.entries.remove(position)
    }

    /// Removes expired entries from the head, stopping at the first unexpired one
    pub fn remove_expired(&mut self, now: Instant) -> Vec<OutstandingPutToken> {
        let mut expired = Vec::new();
        while let Some(entry) = self.entries.front() {
            if entry.expires_at > now {
                break;
            }
            expired.extend(self.entries.pop_front());
        }
        expired
    }

    pub fn drain(&mut self) -> impl Iterator<Item = OutstandingPutToken> + '_ {
        self.entries.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
