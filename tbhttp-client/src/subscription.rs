use reqwest::StatusCode;
use serde_json::Value;
use std::any::Any;
use std::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::api::{Api, check_status};
use crate::error::Error;
use crate::transport::{Transport, TransportError};
use crate::util::json::duration_to_ms;
use crate::worker::WorkerState;

/// Extra time given to a long-poll request on top of the server side
/// timeout, so the server gets to answer before the request is dropped.
const POLL_GRACE: Duration = Duration::from_secs(5);

/// Invoked with every update received on a subscription
pub type Callback = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Channel {
    Attributes,
    Rpc,
}

impl Channel {
    fn path(&self) -> &'static str {
        match self {
            Channel::Attributes => "attributes/updates",
            Channel::Rpc => "rpc",
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Attributes => f.write_str("attributes"),
            Channel::Rpc => f.write_str("rpc"),
        }
    }
}

struct Shared<T> {
    api: Arc<Api<T>>,
    channel: Channel,
    state: WorkerState,
    callback: Mutex<Option<Callback>>,
}

/// Long-poll listener for one subscription channel.
pub(crate) struct SubscriptionWorker<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> SubscriptionWorker<T> {
    pub fn new(api: Arc<Api<T>>, channel: Channel) -> Self {
        Self {
            shared: Arc::new(Shared {
                api,
                channel,
                state: WorkerState::default(),
                callback: Mutex::new(None),
            }),
        }
    }

    /// Start listening, replacing the callback if one is given.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, callback: Option<Callback>) {
        if let Some(callback) = callback {
            *self
                .shared
                .callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(callback);
        }

        if self.shared.state.start() {
            tokio::spawn(run(self.shared.clone()));
        }
    }

    /// Stop listening after the in-flight poll returns.
    pub fn unsubscribe(&self) {
        debug!("set stop event for {} subscription", self.shared.channel);
        self.shared.state.request_stop();
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.is_running()
    }
}

impl<T: Transport> Shared<T> {
    fn callback(&self) -> Option<Callback> {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn deliver(&self, body: &[u8]) {
        if body.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        let update: Value = match serde_json::from_slice(body) {
            Ok(update) => update,
            Err(e) => {
                error!("failed to decode {} update: {e}", self.channel);
                return;
            }
        };

        let Some(callback) = self.callback() else {
            return;
        };

        // a misbehaving callback must not take the subscription down with it
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(update))) {
            error!(
                "{} callback panicked: {}",
                self.channel,
                panic_message(panic.as_ref())
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

#[instrument(name = "subscription", skip_all, fields(channel = %shared.channel))]
async fn run<T: Transport>(shared: Arc<Shared<T>>) {
    let channel = shared.channel;
    info!("start subscription to {channel} updates");

    if shared.callback().is_none() {
        warn!("no callback set for {channel} subscription");
        shared.state.request_stop();
    }

    let timeout = shared.api.config().timeout;
    let query = [("timeout".to_owned(), duration_to_ms(&timeout).to_string())];
    debug!("timeout set to {timeout:?}");

    loop {
        if shared.state.stop_requested() {
            if shared.state.finish() {
                continue;
            }
            break;
        }

        let result = shared
            .api
            .poll(channel.path(), &query, timeout + POLL_GRACE)
            .await;

        // drop whatever arrived if we were told to stop in the meantime
        if shared.state.stop_requested() {
            continue;
        }

        match result {
            Ok(response) => match response.status {
                StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => continue,
                status if status.is_success() => shared.deliver(&response.body),
                _ => {
                    if let Err(e) = check_status(response) {
                        error!("{channel} subscription failed: {e}");
                    }
                    shared.state.abort();
                    break;
                }
            },
            Err(Error::Transport(TransportError::Timeout)) => {
                debug!("long poll timed out, reconnecting");
            }
            Err(e) => {
                error!("{channel} subscription failed: {e}");
                shared.state.abort();
                break;
            }
        }
    }

    info!("stop subscription to {channel} updates");
}
