/*
This crate is home to everything related to talking to a ThingsBoard
server as a device over the HTTP device API.

It provides a client that publishes telemetry, attributes and RPC calls,
either immediately or through a background publish queue that retries
until delivery, and that listens for attribute updates and server-side
RPC calls by long-polling the remote.
*/

mod api;
mod client;
mod config;
mod error;
mod provisioning;
mod publish;
mod subscription;
mod transport;
mod worker;

pub use api::Endpoint;
pub use client::{Client, Delivery};
pub use config::{ClientConfig, DEFAULT_TIMEOUT, PublishConfig};
pub use error::Error;
pub use provisioning::provision;
pub use publish::{DeadLetterHandler, OutboundTask, PublishMetrics};
pub use subscription::Callback;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Transport, TransportError};
pub use worker::WorkerRole;

use tbhttp_util as util;
