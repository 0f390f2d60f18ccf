//! Wire types for the DigitalOcean v1 API.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::provider::{MachineDescriptor, MachineId, MachineStatus, SshKeyId};

use super::ProviderError;

/// Status wrapper present on every v1 response.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Decodes a response body, rejecting anything that does not report
/// `"status": "OK"`.
pub(super) fn decode_body<T: DeserializeOwned>(
    endpoint: &str,
    body: &[u8],
) -> Result<T, ProviderError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|err| ProviderError::decode(endpoint, err))?;
    let envelope =
        Envelope::deserialize(&value).map_err(|err| ProviderError::decode(endpoint, err))?;

    if envelope.status.as_deref() != Some("OK") {
        let message = envelope
            .error_message
            .or(envelope.message)
            .or(envelope.status)
            .unwrap_or_else(|| String::from("response carried no status"));
        return Err(ProviderError::Api {
            endpoint: endpoint.to_owned(),
            message,
        });
    }

    T::deserialize(value).map_err(|err| ProviderError::decode(endpoint, err))
}

/// Body of `droplets/new`.
#[derive(Debug, Deserialize)]
pub(super) struct CreateResponse {
    droplet: CreatedDroplet,
}

#[derive(Debug, Deserialize)]
struct CreatedDroplet {
    id: MachineId,
}

impl From<CreateResponse> for MachineDescriptor {
    fn from(value: CreateResponse) -> Self {
        Self {
            id: value.droplet.id,
            ip_address: None,
            status: MachineStatus::New,
            created_at: None,
        }
    }
}

/// Body of `droplets/{id}`.
#[derive(Debug, Deserialize)]
pub(super) struct StatusResponse {
    pub(super) droplet: MachineDescriptor,
}

/// Body of `ssh_keys/`.
#[derive(Debug, Deserialize)]
pub(super) struct SshKeysResponse {
    #[serde(default)]
    ssh_keys: Vec<SshKeyEntry>,
}

#[derive(Debug, Deserialize)]
struct SshKeyEntry {
    id: SshKeyId,
}

impl SshKeysResponse {
    pub(super) fn into_ids(self) -> Vec<SshKeyId> {
        self.ssh_keys.into_iter().map(|key| key.id).collect()
    }
}

/// Body of `droplets/{id}/destroy/`; only the status matters.
#[derive(Debug, Deserialize)]
pub(super) struct DestroyResponse {}
