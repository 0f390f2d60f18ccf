//! Provider abstraction for provisioning throwaway tunnel endpoints.
//!
//! The workflow only ever talks to a cloud through [`Provider`], which keeps
//! the DigitalOcean client swappable for scripted doubles in tests.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Parameters required to create a new machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisioningRequest {
    /// Region slug (for example `nyc1`) or numeric region identifier.
    pub region: String,
    /// Size slug (for example `512mb`) or numeric size identifier.
    pub size: String,
    /// Image slug (for example `ubuntu-20-04-x64`) or numeric image identifier.
    pub image: String,
    /// Hostname given to the machine.
    pub name: String,
    /// SSH keys installed for the root user.
    pub ssh_key_ids: Vec<SshKeyId>,
}

impl ProvisioningRequest {
    /// Starts a builder for a [`ProvisioningRequest`].
    #[must_use]
    pub fn builder() -> ProvisioningRequestBuilder {
        ProvisioningRequestBuilder::new()
    }

    /// Validates the request.
    ///
    /// Only the machine name is checked; region, size and image are passed
    /// through to the provider untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidName`] when the name contains
    /// characters outside `[a-zA-Z0-9.-]`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_machine_name(&self.name)
    }
}

/// Builder for [`ProvisioningRequest`] that trims inputs and validates on
/// construction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisioningRequestBuilder {
    region: String,
    size: String,
    image: String,
    name: String,
    ssh_key_ids: Vec<SshKeyId>,
}

impl ProvisioningRequestBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the region slug or identifier.
    #[must_use]
    pub fn region(mut self, value: impl Into<String>) -> Self {
        self.region = value.into();
        self
    }

    /// Sets the size slug or identifier.
    #[must_use]
    pub fn size(mut self, value: impl Into<String>) -> Self {
        self.size = value.into();
        self
    }

    /// Sets the image slug or identifier.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    /// Sets the machine name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Replaces the SSH key identifiers.
    #[must_use]
    pub fn ssh_key_ids(mut self, keys: impl IntoIterator<Item = SshKeyId>) -> Self {
        self.ssh_key_ids = keys.into_iter().collect();
        self
    }

    /// Builds and validates the [`ProvisioningRequest`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidName`] when the trimmed name is empty
    /// or contains characters that are not valid in a hostname.
    pub fn build(self) -> Result<ProvisioningRequest, ValidationError> {
        let request = ProvisioningRequest {
            region: self.region.trim().to_owned(),
            size: self.size.trim().to_owned(),
            image: self.image.trim().to_owned(),
            name: self.name.trim().to_owned(),
            ssh_key_ids: self.ssh_key_ids,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Checks that `name` only uses hostname characters (`a-z`, `A-Z`, `0-9`,
/// `.` and `-`).
///
/// # Errors
///
/// Returns [`ValidationError::InvalidName`] for empty names or names with any
/// other character.
pub fn validate_machine_name(name: &str) -> Result<(), ValidationError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidName(name.to_owned()))
    }
}

/// Errors raised before any remote call is made.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ValidationError {
    /// Raised when a machine name contains non-hostname characters.
    #[error(
        "invalid machine name '{0}': only valid hostname characters are allowed (a-z, A-Z, 0-9, . and -)"
    )]
    InvalidName(String),
    /// Raised when a serialized machine state cannot be decoded.
    #[error("invalid machine state: {0}")]
    MachineState(String),
}

/// Deserializes an identifier that providers emit either as a JSON number or
/// as a string.
fn deserialize_identifier<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawIdentifier {
        Number(u64),
        Text(String),
    }

    match RawIdentifier::deserialize(deserializer)? {
        RawIdentifier::Number(value) => Ok(value.to_string()),
        RawIdentifier::Text(value) if !value.trim().is_empty() => Ok(value),
        RawIdentifier::Text(_) => Err(serde::de::Error::custom("identifier must not be empty")),
    }
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Returns the identifier as a string slice.
            #[must_use]
            pub const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserialize_identifier(deserializer).map(Self)
            }
        }
    };
}

identifier!(
    /// Opaque provider-assigned machine identifier.
    MachineId
);

identifier!(
    /// Identifier of an SSH public key registered with the provider.
    SshKeyId
);

impl SshKeyId {
    /// Parses a comma-separated list of key identifiers, dropping blanks.
    #[must_use]
    pub fn parse_list(value: &str) -> Vec<Self> {
        value
            .split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(Self::from)
            .collect()
    }
}

/// Lifecycle status reported by the provider.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum MachineStatus {
    /// The machine is still being built.
    #[default]
    New,
    /// The machine is running and reachable.
    Active,
    /// The machine is powered off.
    Off,
    /// The machine has been destroyed or archived and will never come back.
    Archive,
    /// Any status this client does not know about, kept verbatim.
    Other(String),
}

impl MachineStatus {
    /// Returns the provider's spelling of the status.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Off => "off",
            Self::Archive => "archive",
            Self::Other(value) => value.as_str(),
        }
    }

    /// Returns `true` for the only status eligible for a tunnel connection.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns `true` when the machine can no longer become active.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Archive)
    }
}

impl From<&str> for MachineStatus {
    fn from(value: &str) -> Self {
        match value.trim() {
            "new" => Self::New,
            "active" => Self::Active,
            "off" => Self::Off,
            "archive" => Self::Archive,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MachineStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MachineStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from(raw.as_str()))
    }
}

/// Provider view of a machine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MachineDescriptor {
    /// Provider-assigned identifier.
    pub id: MachineId,
    /// Public IPv4 address, absent until the provider assigns one.
    #[serde(default)]
    pub ip_address: Option<IpAddr>,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: MachineStatus,
    /// Creation timestamp as reported by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Serialized machine state accepted by `--debug-state` and printed once the
/// machine is active.
#[derive(Debug, Deserialize, Serialize)]
struct MachineState<T> {
    droplet: T,
}

impl MachineDescriptor {
    /// Decodes a descriptor from the `{"droplet": {...}}` state format.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MachineState`] when the JSON is malformed or
    /// lacks a machine identifier.
    pub fn from_state_json(json: &str) -> Result<Self, ValidationError> {
        serde_json::from_str::<MachineState<Self>>(json)
            .map(|state| state.droplet)
            .map_err(|err| ValidationError::MachineState(err.to_string()))
    }

    /// Encodes the descriptor in the `{"droplet": {...}}` state format.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MachineState`] when serialization fails.
    pub fn to_state_json(&self) -> Result<String, ValidationError> {
        serde_json::to_string(&MachineState { droplet: self })
            .map_err(|err| ValidationError::MachineState(err.to_string()))
    }
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Machine lifecycle operations implemented by cloud providers.
pub trait Provider {
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Issues the create call and returns the freshly created machine.
    fn create_machine<'a>(
        &'a self,
        request: &'a ProvisioningRequest,
    ) -> ProviderFuture<'a, MachineDescriptor, Self::Error>;

    /// Fetches the current state of a machine.
    fn machine_status<'a>(
        &'a self,
        id: &'a MachineId,
    ) -> ProviderFuture<'a, MachineDescriptor, Self::Error>;

    /// Lists every SSH key registered to the account, in provider order.
    fn list_ssh_keys(&self) -> ProviderFuture<'_, Vec<SshKeyId>, Self::Error>;

    /// Destroys a machine, optionally scrubbing its disk.
    fn destroy<'a>(&'a self, id: &'a MachineId, scrub: bool)
    -> ProviderFuture<'a, (), Self::Error>;

    /// Builds the authenticated destroy URL without calling it.
    ///
    /// # Errors
    ///
    /// Returns the provider error when the URL cannot be constructed.
    fn destruct_url(&self, id: &MachineId, scrub: bool) -> Result<Url, Self::Error>;
}
