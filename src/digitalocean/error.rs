//! Error types for the DigitalOcean client.

use thiserror::Error;

use crate::config::ConfigError;
use crate::provider::ValidationError;

/// Errors raised by the DigitalOcean client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when the high-level configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a request fails validation before any call is made.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Raised when an endpoint URL cannot be built.
    #[error("invalid API URL: {0}")]
    InvalidUrl(String),
    /// Raised when the HTTP exchange fails. Messages never carry the request
    /// URL, which holds the account credentials.
    #[error("request to {endpoint} failed: {message}")]
    Http {
        /// Endpoint path, relative to the API base URL.
        endpoint: String,
        /// Transport error message.
        message: String,
    },
    /// Raised when the provider answers without `"status": "OK"`.
    #[error("{endpoint} returned an error: {message}")]
    Api {
        /// Endpoint path, relative to the API base URL.
        endpoint: String,
        /// Error message reported by the provider.
        message: String,
    },
    /// Raised when a response body cannot be decoded.
    #[error("unexpected response from {endpoint}: {message}")]
    Decode {
        /// Endpoint path, relative to the API base URL.
        endpoint: String,
        /// Decoder error message.
        message: String,
    },
}

impl ProviderError {
    pub(super) fn http(endpoint: &str, err: reqwest::Error) -> Self {
        Self::Http {
            endpoint: endpoint.to_owned(),
            message: err.without_url().to_string(),
        }
    }

    pub(super) fn decode(endpoint: &str, message: impl ToString) -> Self {
        Self::Decode {
            endpoint: endpoint.to_owned(),
            message: message.to_string(),
        }
    }
}

impl From<ConfigError> for ProviderError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<ValidationError> for ProviderError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value.to_string())
    }
}
