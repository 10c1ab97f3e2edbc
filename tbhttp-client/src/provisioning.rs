use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::api::request_json;
use crate::client::Client;
use crate::config::{ClientConfig, DEFAULT_TIMEOUT};
use crate::error::Error;
use crate::transport::{HttpRequest, Transport};
use crate::util::http::Uri;

/*
    request {
        deviceName
        provisionDeviceKey
        provisionDeviceSecret
    }
*/
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionRequest<'a> {
    device_name: &'a str,
    provision_device_key: &'a str,
    provision_device_secret: &'a str,
}

/*
    response {
        status
        credentialsType
        credentialsValue
    }
*/
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionResponse {
    status: String,
    credentials_type: Option<String>,
    credentials_value: Option<String>,
}

/// Register a device with the remote using a provisioning key and secret.
///
/// Returns a client bound to the access token issued for the device. If
/// the remote refuses, or issues anything other than an access token, the
/// full response is returned in [`Error::Provisioning`].
#[instrument(skip_all, fields(device = device_name), err)]
pub async fn provision<T: Transport>(
    transport: T,
    host: Uri,
    device_name: &str,
    device_key: &str,
    device_secret: &str,
) -> Result<Client<T>, Error> {
    let body = serde_json::to_value(ProvisionRequest {
        device_name,
        provision_device_key: device_key,
        provision_device_secret: device_secret,
    })
    .map_err(Error::Encoding)?;

    debug!("calling remote");
    let request = HttpRequest {
        method: Method::POST,
        url: host.join("api/v1/provision"),
        query: Vec::new(),
        body: Some(body),
        timeout: DEFAULT_TIMEOUT,
    };
    let device = request_json(&transport, request).await?;

    match serde_json::from_value::<ProvisionResponse>(device.clone()) {
        Ok(ProvisionResponse {
            status,
            credentials_type: Some(credentials_type),
            credentials_value: Some(token),
        }) if status == "SUCCESS" && credentials_type == "ACCESS_TOKEN" => {
            info!("device provisioned");
            let config = ClientConfig::new(host, token).with_name(device_name);
            Ok(Client::with_transport(config, transport))
        }
        _ => Err(Error::Provisioning(device)),
    }
}
