use std::error::Error;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, instrument, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod cli;

use tbhttp_client::{Client, ClientConfig, Delivery, OutboundTask, WorkerRole};
use tbhttp_util as util;

use crate::cli::{Cli, Command};

fn initialize_tracing() {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using
            // RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("info".parse().unwrap())
                    .add_directive("hyper=error".parse().unwrap())
                    .add_directive("reqwest=warn".parse().unwrap()),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    initialize_tracing();

    let cli = cli::parse();

    if let Command::Provision {
        device_key,
        device_secret,
    } = &cli.command
    {
        let name = cli
            .name
            .as_deref()
            .ok_or("--name is required to provision a device")?;
        let client = Client::provision(cli.host.clone(), name, device_key, device_secret).await?;
        println!("{}", client.config().token);
        return Ok(());
    }

    let token = cli
        .token
        .clone()
        .ok_or("--token is required unless provisioning")?;
    let mut config = ClientConfig::new(cli.host.clone(), token);
    if let Some(name) = &cli.name {
        config = config.with_name(name);
    }
    if let Some(timeout) = cli.timeout {
        config = config.with_timeout(timeout);
    }

    run(cli.command, config).await
}

#[instrument(name = "tbhttp", skip_all, err)]
async fn run(command: Command, mut config: ClientConfig) -> Result<(), Box<dyn Error>> {
    match command {
        Command::TestConnection => {
            let client = Client::new(config);
            if !client.test_connection().await {
                return Err(format!("cannot connect to {}", client.host()).into());
            }
            println!("connected to {client}");
        }
        Command::Telemetry { values, ts } => {
            let timestamp = ts
                .map(|ms| DateTime::<Utc>::from_timestamp_millis(ms).ok_or("invalid timestamp"))
                .transpose()?;
            Client::new(config)
                .send_telemetry(values, timestamp, Delivery::Immediate)
                .await?;
        }
        Command::Stream {
            retry_max_backoff,
            max_attempts,
        } => {
            if let Some(backoff) = retry_max_backoff {
                config.publish.retry_max_backoff = backoff;
            }
            config.publish.max_attempts = max_attempts;
            stream(Client::new(config)).await?;
        }
        Command::Attributes { values } => {
            Client::new(config).send_attributes(values).await?;
        }
        Command::Rpc { method, params } => {
            let response = Client::new(config).send_rpc(&method, params).await?;
            println!("{response}");
        }
        Command::RequestAttributes {
            client_keys,
            shared_keys,
        } => {
            let client_keys: Option<Vec<&str>> = client_keys
                .as_ref()
                .map(|keys| keys.iter().map(String::as_str).collect());
            let shared_keys: Option<Vec<&str>> = shared_keys
                .as_ref()
                .map(|keys| keys.iter().map(String::as_str).collect());
            let response = Client::new(config)
                .request_attributes(client_keys.as_deref(), shared_keys.as_deref())
                .await?;
            println!("{response}");
        }
        Command::Listen => listen(Client::new(config)).await?,
        Command::Provision { .. } => unreachable!("handled before building a client"),
    }

    Ok(())
}

/// Queue every line of stdin as telemetry and wait for the queue to drain.
async fn stream(client: Client) -> Result<(), Box<dyn Error>> {
    if !client.connect().await {
        return Err(format!("cannot connect to {}", client.host()).into());
    }

    client.on_dead_letter(Arc::new(|task: OutboundTask| {
        warn!(attempts = task.attempts, "dropped telemetry {}", task.payload);
    }));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(values) => {
                client
                    .send_telemetry(values, None, Delivery::Queued)
                    .await?
            }
            Err(e) => warn!("skipping invalid line: {e}"),
        }
    }

    let mut metrics = client.publish_metrics();
    let metrics = *metrics.wait_for(|m| m.pending() == 0).await?;
    info!(
        delivered = metrics.delivered,
        dropped = metrics.dead_lettered,
        "stdin closed, queue drained"
    );

    client.stop_publish_worker();
    while client.is_running(WorkerRole::Publish) {
        tokio::time::sleep(client.config().publish.poll_interval).await;
    }

    Ok(())
}

/// Print attribute updates and RPC calls as JSON lines until interrupted.
async fn listen(client: Client) -> Result<(), Box<dyn Error>> {
    client.subscribe_to_attributes(Some(Arc::new(|update: Value| {
        println!("{}", serde_json::json!({"attributes": update}));
    })));
    client.subscribe_to_rpc(Some(Arc::new(|request: Value| {
        println!("{}", serde_json::json!({"rpc": request}));
    })));

    info!("listening on {client}, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    client.unsubscribe_from_attributes();
    client.unsubscribe_from_rpc();
    Ok(())
}
