//! Contract consumed from the provisioning transport and the data it exchanges

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A registration request, re-sent as is when the service asks the device to retry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    /// Registration id of the device
    pub registration_id: String,

    /// Custom payload forwarded to the allocation policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// Forces a new registration even if the device is already assigned
    #[serde(skip)]
    pub force_registration: bool,
}

impl RegistrationRequest {
    /// Creates a request for `registration_id`
    pub fn new(registration_id: impl Into<String>) -> Self {
        Self {
            registration_id: registration_id.into(),
            payload: None,
            force_registration: false,
        }
    }

    /// Attaches a custom payload
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Requests a forced re-registration
    pub fn force_registration(mut self, force: bool) -> Self {
        self.force_registration = force;
        self
    }
}

/// Registration state of an assigned (or failed) device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrationState {
    /// Registration id
    pub registration_id: Option<String>,
    /// Creation time, as reported by the service
    pub created_date_time_utc: Option<String>,
    /// Hub the device was assigned to
    pub assigned_hub: Option<String>,
    /// Device id on the assigned hub
    pub device_id: Option<String>,
    /// Registration status
    pub status: Option<String>,
    /// Reason of the assignment
    pub substatus: Option<String>,
    /// Error code of a failed registration
    pub error_code: Option<i64>,
    /// Error message of a failed registration
    pub error_message: Option<String>,
    /// Last update time, as reported by the service
    pub last_updated_date_time_utc: Option<String>,
    /// Entity tag
    pub etag: Option<String>,
    /// Custom payload returned by the allocation policy
    pub payload: Option<serde_json::Value>,
}

/// Body of a registration or operation status response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrationResult {
    /// Operation to poll while the status is `assigning`
    pub operation_id: Option<String>,
    /// `registering`, `assigning`, `assigned` or `failed`, in any case
    pub status: String,
    /// Present once the registration settled
    pub registration_state: Option<RegistrationState>,
}

impl RegistrationResult {
    /// Decodes a JSON response body
    pub fn from_json(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Transport level details of a response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseInfo {
    /// Status code, if the transport has one
    pub status_code: Option<u16>,
    /// Response headers or application properties
    pub headers: BTreeMap<String, String>,
    /// Raw body
    pub body: Option<String>,
}

/// What a transport returns for a registration request or a status query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportReply {
    /// Decoded result
    pub result: RegistrationResult,
    /// Response details
    pub response: ResponseInfo,
    /// Interval requested by the service before the next request
    pub polling_interval: Option<Duration>,
}

/// A provisioning transport
///
/// Calls may be issued concurrently with [`cancel`](Self::cancel): a request that is
/// cancelled may still complete, and its result is then ignored.
#[async_trait]
pub trait PollingTransport: Send + Sync + 'static {
    /// Sends a registration request
    async fn registration_request(&self, request: &RegistrationRequest) -> Result<TransportReply>;

    /// Queries the status of a registration operation
    async fn query_operation_status(
        &self,
        request: &RegistrationRequest,
        operation_id: &str,
    ) -> Result<TransportReply>;

    /// Aborts whatever request is in flight
    async fn cancel(&self) -> Result<()>;

    /// Closes the underlying connection
    async fn disconnect(&self) -> Result<()>;
}
