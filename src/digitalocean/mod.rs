//! DigitalOcean v1 implementation of the machine lifecycle.
//!
//! Every call is a `GET` carrying `client_id` and `api_key` in the query
//! string, so URLs are treated as secrets: logs and errors only ever mention
//! the endpoint path.

mod error;
mod params;
mod types;


use std::fmt;
use std::time::Duration;

use reqwest::Url;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::InstavpnConfig;
use crate::provider::{
    MachineDescriptor, MachineId, Provider, ProviderFuture, ProvisioningRequest, SshKeyId,
};
use params::Params;
use types::{CreateResponse, DestroyResponse, SshKeysResponse, StatusResponse, decode_body};

pub use error::ProviderError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Account credentials attached to every call.
#[derive(Clone, Eq, PartialEq)]
struct Credentials {
    client_id: String,
    api_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &"<redacted>")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// HTTP client for the DigitalOcean v1 API.
#[derive(Clone, Debug)]
pub struct DigitalOceanClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Credentials,
}

impl DigitalOceanClient {
    /// Constructs a client from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when the configuration fails
    /// validation, [`ProviderError::InvalidUrl`] when the base URL does not
    /// parse, or [`ProviderError::Http`] when the HTTP client cannot be built.
    pub fn new(config: &InstavpnConfig) -> Result<Self, ProviderError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| ProviderError::http("client", err))?;
        Ok(Self {
            http,
            base_url: parse_base_url(&config.api_base_url)?,
            credentials: Credentials {
                client_id: config.client_id.clone(),
                api_key: config.api_key.clone(),
            },
        })
    }

    /// Base URL every endpoint path is joined onto.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Joins `segments` onto the base URL, percent-encoding each one so an
    /// identifier can never add path components or a query of its own.
    fn endpoint(&self, segments: &[&str], params: &Params) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                ProviderError::InvalidUrl(format!("{}: not usable as a base URL", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .append_pair("client_id", &self.credentials.client_id)
            .append_pair("api_key", &self.credentials.api_key);
        Ok(url)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        params: &Params,
    ) -> Result<T, ProviderError> {
        let url = self.endpoint(segments, params)?;
        let endpoint = segments.join("/");
        debug!(endpoint = %endpoint, "calling provider");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ProviderError::http(&endpoint, err))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ProviderError::http(&endpoint, err))?;
        debug!(endpoint = %endpoint, status = status.as_u16(), "provider responded");
        decode_body(&endpoint, &body)
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ProviderError> {
    let mut url =
        Url::parse(raw.trim()).map_err(|err| ProviderError::InvalidUrl(format!("{raw}: {err}")))?;
    if url.cannot_be_a_base() {
        return Err(ProviderError::InvalidUrl(format!(
            "{raw}: not usable as a base URL"
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn droplet_path(id: &MachineId) -> [&str; 2] {
    ["droplets", id.as_str()]
}

fn destroy_path(id: &MachineId) -> [&str; 4] {
    ["droplets", id.as_str(), "destroy", ""]
}

impl Provider for DigitalOceanClient {
    type Error = ProviderError;

    fn create_machine<'a>(
        &'a self,
        request: &'a ProvisioningRequest,
    ) -> ProviderFuture<'a, MachineDescriptor, Self::Error> {
        Box::pin(async move {
            request.validate()?;
            let response: CreateResponse = self
                .call(&["droplets", "new"], &params::create_params(request))
                .await?;
            Ok(MachineDescriptor::from(response))
        })
    }

    fn machine_status<'a>(
        &'a self,
        id: &'a MachineId,
    ) -> ProviderFuture<'a, MachineDescriptor, Self::Error> {
        Box::pin(async move {
            let response: StatusResponse = self.call(&droplet_path(id), &Params::new()).await?;
            Ok(response.droplet)
        })
    }

    fn list_ssh_keys(&self) -> ProviderFuture<'_, Vec<SshKeyId>, Self::Error> {
        Box::pin(async move {
            let response: SshKeysResponse = self.call(&["ssh_keys", ""], &Params::new()).await?;
            Ok(response.into_ids())
        })
    }

    fn destroy<'a>(
        &'a self,
        id: &'a MachineId,
        scrub: bool,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let _: DestroyResponse = self
                .call(&destroy_path(id), &params::destroy_params(scrub))
                .await?;
            Ok(())
        })
    }

    fn destruct_url(&self, id: &MachineId, scrub: bool) -> Result<Url, Self::Error> {
        self.endpoint(&destroy_path(id), &params::destroy_params(scrub))
    }
}
