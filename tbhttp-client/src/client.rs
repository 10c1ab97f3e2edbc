use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::api::{Api, Endpoint};
use crate::config::ClientConfig;
use crate::error::Error;
use crate::provisioning;
use crate::publish::{DeadLetterHandler, OutboundTask, PublishMetrics, PublishWorker};
use crate::subscription::{Callback, Channel, SubscriptionWorker};
use crate::transport::{HttpTransport, Transport};
use crate::util::http::Uri;
use crate::worker::WorkerRole;

/// How `send_telemetry` hands the payload over to the remote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Delivery {
    /// Add to the publish queue and return immediately
    #[default]
    Queued,
    /// Publish right away and report the outcome
    Immediate,
}

/// ThingsBoard HTTP device client.
///
/// Owns the configuration and three background workers: the publish queue
/// and the attribute and RPC subscriptions. Workers are spawned on the
/// current Tokio runtime when started and are asked to stop when the client
/// is dropped.
pub struct Client<T: Transport = HttpTransport> {
    api: Arc<Api<T>>,
    publisher: PublishWorker<T>,
    attributes: SubscriptionWorker<T>,
    rpc: SubscriptionWorker<T>,
}

impl Client<HttpTransport> {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport(config, HttpTransport::new())
    }

    /// Provision a new device and return a client bound to the issued token.
    pub async fn provision(
        host: Uri,
        device_name: &str,
        device_key: &str,
        device_secret: &str,
    ) -> Result<Self, Error> {
        provisioning::provision(
            HttpTransport::new(),
            host,
            device_name,
            device_key,
            device_secret,
        )
        .await
    }
}

impl<T: Transport> Client<T> {
    pub fn with_transport(config: ClientConfig, transport: T) -> Self {
        let api = Arc::new(Api::new(config, transport));
        Self {
            publisher: PublishWorker::new(api.clone()),
            attributes: SubscriptionWorker::new(api.clone(), Channel::Attributes),
            rpc: SubscriptionWorker::new(api.clone(), Channel::Rpc),
            api,
        }
    }

    pub fn host(&self) -> &Uri {
        &self.api.config().host
    }

    pub fn name(&self) -> Option<&str> {
        self.api.config().name.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.api.config().timeout
    }

    pub fn config(&self) -> &ClientConfig {
        self.api.config()
    }

    /// `{host}/api/v1/{token}`
    pub fn api_base_url(&self) -> String {
        self.api.base_url()
    }

    /// Publish an empty telemetry payload to check the remote is reachable
    /// and accepts our token.
    ///
    /// Failures are logged, never returned.
    pub async fn test_connection(&self) -> bool {
        debug!("start connection test");
        let success = match self.publish_data(Endpoint::Telemetry, &json!({}), None).await {
            Ok(_) => {
                debug!("connection test successful");
                true
            }
            Err(e) if e.is_connectivity() => {
                debug!("{e}");
                false
            }
            Err(Error::Unauthorized) => {
                error!("Error 401: Unauthorized. Check if token is correct.");
                false
            }
            Err(Error::Status(status, _)) => {
                error!("Error {}", status.as_u16());
                false
            }
            Err(e) => {
                error!("{e}");
                false
            }
        };
        debug!("end connection test");
        success
    }

    /// Test the connection and start the publish worker if it succeeds.
    pub async fn connect(&self) -> bool {
        let connected = self.test_connection().await;
        if connected {
            info!("connected to ThingsBoard");
            self.start_publish_worker();
        }
        connected
    }

    pub fn start_publish_worker(&self) {
        self.publisher.start();
    }

    pub fn stop_publish_worker(&self) {
        self.publisher.stop();
    }

    pub fn publish_metrics(&self) -> watch::Receiver<PublishMetrics> {
        self.publisher.metrics()
    }

    /// Receive tasks the publish worker gave up on after
    /// [`max_attempts`](crate::PublishConfig::max_attempts) failures.
    pub fn on_dead_letter(&self, handler: DeadLetterHandler) {
        self.publisher.set_dead_letter_handler(handler);
    }

    pub fn is_running(&self, role: WorkerRole) -> bool {
        match role {
            WorkerRole::Publish => self.publisher.is_running(),
            WorkerRole::Attributes => self.attributes.is_running(),
            WorkerRole::Rpc => self.rpc.is_running(),
        }
    }

    /// POST `body` to a device API endpoint and return the decoded response.
    ///
    /// `timeout` overrides the configured timeout for this request only.
    pub async fn publish_data(
        &self,
        endpoint: Endpoint,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        self.api.post(endpoint.as_str(), body, timeout).await
    }

    /// GET from a device API endpoint and return the decoded response.
    pub async fn get_data(
        &self,
        endpoint: Endpoint,
        query: Vec<(String, String)>,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        self.api.get(endpoint.as_str(), query, timeout).await
    }

    /// Publish telemetry `values` recorded at `timestamp`, or now if not given.
    ///
    /// With [`Delivery::Queued`] the only possible error is failing to
    /// serialize `values`; delivery itself is retried in the background.
    pub async fn send_telemetry<V: Serialize>(
        &self,
        values: V,
        timestamp: Option<DateTime<Utc>>,
        delivery: Delivery,
    ) -> Result<(), Error> {
        let values = serde_json::to_value(values).map_err(Error::Encoding)?;
        let ts = timestamp.unwrap_or_else(Utc::now).timestamp_millis();
        let payload = json!({"ts": ts, "values": values});

        match delivery {
            Delivery::Queued => {
                self.publisher
                    .enqueue(OutboundTask::new(Endpoint::Telemetry, payload));
                Ok(())
            }
            Delivery::Immediate => self
                .publish_data(Endpoint::Telemetry, &payload, None)
                .await
                .map(|_| ()),
        }
    }

    pub async fn send_attributes<V: Serialize>(&self, attributes: V) -> Result<(), Error> {
        let attributes = serde_json::to_value(attributes).map_err(Error::Encoding)?;
        self.publish_data(Endpoint::Attributes, &attributes, None)
            .await
            .map(|_| ())
    }

    /// Call a server-side RPC `method` and return its response.
    pub async fn send_rpc(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        let body = json!({
            "method": method,
            "params": params.unwrap_or_else(|| json!({})),
        });
        self.publish_data(Endpoint::Rpc, &body, None).await
    }

    /// Request client and/or shared attribute values by key.
    pub async fn request_attributes(
        &self,
        client_keys: Option<&[&str]>,
        shared_keys: Option<&[&str]>,
    ) -> Result<Value, Error> {
        let query = [("client_keys", client_keys), ("shared_keys", shared_keys)]
            .into_iter()
            .filter_map(|(param, keys)| keys.map(|keys| (param.to_owned(), keys.join(","))))
            .collect();
        self.get_data(Endpoint::Attributes, query, None).await
    }

    /// Listen for shared attribute updates.
    ///
    /// Without a `callback` the previously registered one is used; if there
    /// is none the subscription stops right away.
    pub fn subscribe_to_attributes(&self, callback: Option<Callback>) {
        self.attributes.subscribe(callback);
    }

    pub fn unsubscribe_from_attributes(&self) {
        self.attributes.unsubscribe();
    }

    /// Listen for server-side RPC calls.
    pub fn subscribe_to_rpc(&self, callback: Option<Callback>) {
        self.rpc.subscribe(callback);
    }

    pub fn unsubscribe_from_rpc(&self) {
        self.rpc.unsubscribe();
    }
}

impl<T: Transport> Display for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<ThingsBoard ({}) HTTP client {}>",
            self.host(),
            self.name().unwrap_or_default()
        )
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        self.publisher.stop();
        self.attributes.unsubscribe();
        self.rpc.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use mockito::{Matcher, Server};
    use pretty_assertions::assert_eq;
    use reqwest::StatusCode;
    use std::sync::Mutex;

    use super::*;
    use crate::config::PublishConfig;
    use crate::transport::mock::{MockTransport, status};

    fn test_config(url: &str) -> ClientConfig {
        ClientConfig::new(url.parse().unwrap(), "test-token")
            .with_name("sensor-1")
            .with_timeout(Duration::from_secs(2))
            .with_publish(PublishConfig {
                poll_interval: Duration::from_millis(50),
                retry_min_backoff: Duration::from_millis(10),
                retry_max_backoff: Duration::from_millis(10),
                ..PublishConfig::default()
            })
    }

    #[tokio::test]
    async fn test_connection_succeeds_on_empty_response() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/test-token/telemetry")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({})))
            .with_status(200)
            .create_async()
            .await;

        let client = Client::new(test_config(&server.url()));
        assert!(client.test_connection().await);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_connection_fails_on_unauthorized() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/test-token/telemetry")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;

        let client = Client::new(test_config(&server.url()));
        assert!(!client.test_connection().await);
        assert!(!client.connect().await);
        assert!(!client.is_running(WorkerRole::Publish));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_connection_fails_when_refused() {
        // nothing listens on port 1
        let client = Client::new(test_config("http://127.0.0.1:1"));
        assert!(!client.test_connection().await);
    }

    #[tokio::test]
    async fn test_send_telemetry_immediately() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/test-token/telemetry")
            .match_body(Matcher::Json(json!({
                "ts": 1_700_000_000_123_i64,
                "values": {"temp": 21.5}
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let client = Client::new(test_config(&server.url()));
        let timestamp = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        client
            .send_telemetry(json!({"temp": 21.5}), Some(timestamp), Delivery::Immediate)
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_telemetry_immediately_propagates_errors() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/v1/test-token/telemetry")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = Client::new(test_config(&server.url()));
        let err = client
            .send_telemetry(json!({"temp": 21.5}), None, Delivery::Immediate)
            .await
            .unwrap_err();

        match err {
            Error::Status(status, body) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "boom");
            }
            e => panic!("unexpected error {e}"),
        }
    }

    #[tokio::test]
    async fn test_queued_telemetry_is_delivered_by_the_worker() {
        let mut server = Server::new_async().await;
        let probe = server
            .mock("POST", "/api/v1/test-token/telemetry")
            .match_body(Matcher::Json(json!({})))
            .with_status(200)
            .expect(2)
            .create_async()
            .await;
        let telemetry = server
            .mock("POST", "/api/v1/test-token/telemetry")
            .match_body(Matcher::PartialJson(json!({"values": {"temp": 20}})))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let client = Client::new(test_config(&server.url()));
        assert!(client.connect().await);

        client
            .send_telemetry(json!({"temp": 20}), None, Delivery::Queued)
            .await
            .unwrap();

        let mut metrics = client.publish_metrics();
        tokio::time::timeout(Duration::from_secs(5), metrics.wait_for(|m| m.delivered == 1))
            .await
            .unwrap()
            .unwrap();

        client.stop_publish_worker();
        tokio::time::timeout(Duration::from_secs(5), async {
            while client.is_running(WorkerRole::Publish) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // connect() and the worker both test the connection
        probe.assert_async().await;
        telemetry.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_attributes_publishes_the_raw_map() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/test-token/attributes")
            .match_body(Matcher::Json(json!({"firmware": "1.2.0", "online": true})))
            .with_status(200)
            .create_async()
            .await;

        let client = Client::new(test_config(&server.url()));
        client
            .send_attributes(json!({"firmware": "1.2.0", "online": true}))
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_rpc_returns_the_response() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/test-token/rpc")
            .match_body(Matcher::Json(json!({"method": "getTime", "params": {}})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"time": 1700000000}"#)
            .create_async()
            .await;

        let client = Client::new(test_config(&server.url()));
        let response = client.send_rpc("getTime", None).await.unwrap();

        assert_eq!(response, json!({"time": 1700000000}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_request_attributes_passes_keys_as_query() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/test-token/attributes")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("client_keys".into(), "model,serial".into()),
                Matcher::UrlEncoded("shared_keys".into(), "target_temp".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"client": {"model": "x1"}, "shared": {"target_temp": 20}}"#)
            .create_async()
            .await;

        let client = Client::new(test_config(&server.url()));
        let response = client
            .request_attributes(Some(&["model", "serial"]), Some(&["target_temp"]))
            .await
            .unwrap();

        assert_eq!(
            response,
            json!({"client": {"model": "x1"}, "shared": {"target_temp": 20}})
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_request_attributes_reports_malformed_responses() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/test-token/attributes")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let client = Client::new(test_config(&server.url()));
        let err = client.request_attributes(None, None).await.unwrap_err();

        assert!(matches!(err, Error::Decoding(_)));
    }

    #[tokio::test]
    async fn test_subscribe_to_attributes_over_http() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/test-token/attributes/updates")
            .match_query(Matcher::UrlEncoded("timeout".into(), "2000".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"target_temp": 22}"#)
            .expect_at_least(1)
            .create_async()
            .await;

        let client = Client::new(test_config(&server.url()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client.subscribe_to_attributes(Some(Arc::new(move |update: Value| {
            let _ = tx.send(update);
        })));

        let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update, json!({"target_temp": 22}));

        client.unsubscribe_from_attributes();
        tokio::time::timeout(Duration::from_secs(5), async {
            while client.is_running(WorkerRole::Attributes) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_the_client_stops_its_workers() {
        let transport = MockTransport::new();
        transport.fallback(Ok(status(408)));
        let client = Client::with_transport(test_config("http://tb.local"), transport.clone());

        client.start_publish_worker();
        client.subscribe_to_rpc(Some(Arc::new(|_: Value| {})));
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(client);

        // let the workers observe the stop request
        tokio::time::sleep(Duration::from_secs(10)).await;
        let seen = transport.requests().len();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.requests().len(), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letters_reach_the_registered_handler() {
        let transport = MockTransport::new();
        transport.reply_status(200).fallback(Ok(status(500)));
        let mut config = test_config("http://tb.local");
        config.publish.max_attempts = Some(3);
        let client = Client::with_transport(config, transport.clone());

        let dead = Arc::new(Mutex::new(Vec::new()));
        let sink = dead.clone();
        client.on_dead_letter(Arc::new(move |task: OutboundTask| {
            sink.lock().unwrap().push(task)
        }));

        client.start_publish_worker();
        client
            .send_telemetry(json!({"temp": 1}), None, Delivery::Queued)
            .await
            .unwrap();

        let mut metrics = client.publish_metrics();
        metrics.wait_for(|m| m.dead_lettered == 1).await.unwrap();

        let dead = dead.lock().unwrap();
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].endpoint, Endpoint::Telemetry);
    }

    #[test]
    fn it_displays_host_and_name() {
        let client = Client::with_transport(
            test_config("https://iot.example.com"),
            MockTransport::new(),
        );
        let repr = client.to_string();
        assert!(repr.starts_with("<ThingsBoard (https://iot.example.com"));
        assert!(repr.ends_with(") HTTP client sensor-1>"));
        assert_eq!(client.api_base_url(), "https://iot.example.com/api/v1/test-token");
    }
}
