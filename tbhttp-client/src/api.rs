use std::fmt::Display;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{Level, Span, field, instrument};

use crate::config::ClientConfig;
use crate::error::Error;
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Device API endpoint a payload is published to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Telemetry,
    Attributes,
    Rpc,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Telemetry => "telemetry",
            Endpoint::Attributes => "attributes",
            Endpoint::Rpc => "rpc",
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request layer shared by the client and its workers.
///
/// Knows how to build device API URLs from the configuration and how to
/// turn raw transport responses into JSON values or typed errors.
pub(crate) struct Api<T> {
    transport: T,
    config: ClientConfig,
}

impl<T: Transport> Api<T> {
    pub fn new(config: ClientConfig, transport: T) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// `{host}/api/v1/{token}`
    pub fn base_url(&self) -> String {
        self.config
            .host
            .join(&format!("api/v1/{}", self.config.token.as_str()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url())
    }

    /// POST `body` to the device API and decode the response.
    #[instrument(skip_all, fields(endpoint = path, status = field::Empty), err(level = Level::DEBUG))]
    pub async fn post(
        &self,
        path: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        let request = HttpRequest {
            method: Method::POST,
            url: self.url(path),
            query: Vec::new(),
            body: Some(body.clone()),
            timeout: timeout.unwrap_or(self.config.timeout),
        };
        request_json(&self.transport, request).await
    }

    /// GET from the device API and decode the response.
    #[instrument(skip_all, fields(endpoint = path, status = field::Empty), err(level = Level::DEBUG))]
    pub async fn get(
        &self,
        path: &str,
        query: Vec<(String, String)>,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        let request = HttpRequest {
            method: Method::GET,
            url: self.url(path),
            query,
            body: None,
            timeout: timeout.unwrap_or(self.config.timeout),
        };
        request_json(&self.transport, request).await
    }

    /// Issue a single GET and hand back the raw response, whatever its status.
    pub async fn poll(
        &self,
        path: &str,
        query: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResponse, Error> {
        let request = HttpRequest {
            method: Method::GET,
            url: self.url(path),
            query: query.to_vec(),
            body: None,
            timeout,
        };
        Ok(self.transport.send(request).await?)
    }
}

/// Send a request and decode its JSON response, failing on any non-2xx status.
pub(crate) async fn request_json<T: Transport>(
    transport: &T,
    request: HttpRequest,
) -> Result<Value, Error> {
    let response = transport.send(request).await?;
    Span::current().record("status", response.status.as_u16());
    let response = check_status(response)?;
    decode_body(&response.body)
}

pub(crate) fn check_status(response: HttpResponse) -> Result<HttpResponse, Error> {
    match response.status {
        status if status.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED => Err(Error::Unauthorized),
        status => Err(Error::Status(
            status,
            String::from_utf8_lossy(&response.body).into_owned(),
        )),
    }
}

/// Decode a response body; an empty body decodes to an empty object.
pub(crate) fn decode_body(body: &[u8]) -> Result<Value, Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(Error::Decoding)
}
