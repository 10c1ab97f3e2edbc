use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Unauthorized, check that the access token is correct")]
    Unauthorized,

    #[error("Remote returned error: ({0}) {1}")]
    Status(StatusCode, String),

    #[error("Request encoding failed: {0}")]
    Encoding(serde_json::Error),

    #[error("Response decoding failed: {0}")]
    Decoding(serde_json::Error),

    /// The provisioning endpoint answered, but did not issue an access token.
    /// Carries the full response body.
    #[error("Device provisioning failed: {0}")]
    Provisioning(Value),
}

impl Error {
    /// True for failures to reach the remote at all (refused connection, timeout).
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}
