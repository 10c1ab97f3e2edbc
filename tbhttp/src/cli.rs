use clap::{Parser, Subcommand};
use serde_json::Value;
use std::num::ParseIntError;
use std::time::Duration;

use crate::util::http::Uri;
use crate::util::types::AccessToken;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

fn parse_json(s: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(s)
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Root URI of the ThingsBoard instance, eg. "https://thingsboard.cloud"
    #[arg(env = "TBHTTP_HOST", long = "host", value_name = "uri")]
    pub host: Uri,

    /// Device access token
    #[arg(env = "TBHTTP_TOKEN", long = "token", value_name = "token")]
    pub token: Option<AccessToken>,

    /// Device name, used in logs and as the name of provisioned devices
    #[arg(env = "TBHTTP_DEVICE_NAME", long = "name", value_name = "str")]
    pub name: Option<String>,

    /// Request timeout in milliseconds, also used as long-poll timeout
    #[arg(
        env = "TBHTTP_TIMEOUT_MS",
        long = "timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub timeout: Option<Duration>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Check that the remote is reachable and accepts the token
    TestConnection,

    /// Publish a telemetry object right away
    Telemetry {
        /// Telemetry values as a JSON object, eg. '{"temp": 21.5}'
        #[arg(value_parser = parse_json)]
        values: Value,

        /// Timestamp of the values in milliseconds since the epoch
        #[arg(long = "ts", value_name = "ms")]
        ts: Option<i64>,
    },

    /// Queue telemetry objects read from stdin, one JSON object per line
    Stream {
        /// Upper bound for the pause between retries in milliseconds
        #[arg(
            env = "TBHTTP_RETRY_MAX_BACKOFF_MS",
            long = "retry-max-backoff-ms",
            value_name = "ms",
            value_parser = parse_duration
        )]
        retry_max_backoff: Option<Duration>,

        /// Give up on a payload after this many failed attempts
        #[arg(
            env = "TBHTTP_MAX_ATTEMPTS",
            long = "max-attempts",
            value_name = "int"
        )]
        max_attempts: Option<u32>,
    },

    /// Publish client attributes
    Attributes {
        /// Attributes as a JSON object, eg. '{"firmware": "1.2.0"}'
        #[arg(value_parser = parse_json)]
        values: Value,
    },

    /// Call a server-side RPC method and print the response
    Rpc {
        method: String,

        /// Parameters as a JSON object
        #[arg(value_parser = parse_json)]
        params: Option<Value>,
    },

    /// Request attribute values by key and print them
    RequestAttributes {
        /// Comma separated client attribute keys
        #[arg(long = "client-keys", value_name = "keys", value_delimiter = ',')]
        client_keys: Option<Vec<String>>,

        /// Comma separated shared attribute keys
        #[arg(long = "shared-keys", value_name = "keys", value_delimiter = ',')]
        shared_keys: Option<Vec<String>>,
    },

    /// Print attribute updates and RPC calls until interrupted
    Listen,

    /// Provision a new device named after --name and print its access token
    Provision {
        /// Provisioning key of the device profile
        #[arg(
            env = "TBHTTP_PROVISION_DEVICE_KEY",
            long = "device-key",
            value_name = "key"
        )]
        device_key: String,

        /// Provisioning secret of the device profile
        #[arg(
            env = "TBHTTP_PROVISION_DEVICE_SECRET",
            long = "device-secret",
            value_name = "secret"
        )]
        device_secret: String,
    },
}

pub fn parse() -> Cli {
    Parser::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn it_parses_telemetry_arguments() {
        let cli = Cli::try_parse_from([
            "tbhttp",
            "--host",
            "http://localhost:8080",
            "--token",
            "abc",
            "--timeout-ms",
            "5000",
            "telemetry",
            r#"{"temp": 21.5}"#,
            "--ts",
            "1700000000000",
        ])
        .unwrap();

        assert_eq!(cli.timeout, Some(Duration::from_secs(5)));
        assert_eq!(cli.token.as_deref().map(String::as_str), Some("abc"));
        match cli.command {
            Command::Telemetry { values, ts } => {
                assert_eq!(values, json!({"temp": 21.5}));
                assert_eq!(ts, Some(1_700_000_000_000));
            }
            command => panic!("unexpected command {command:?}"),
        }
    }

    #[test]
    fn it_splits_attribute_keys() {
        let cli = Cli::try_parse_from([
            "tbhttp",
            "--host",
            "http://localhost:8080",
            "request-attributes",
            "--shared-keys",
            "a,b",
        ])
        .unwrap();

        match cli.command {
            Command::RequestAttributes {
                client_keys,
                shared_keys,
            } => {
                assert_eq!(client_keys, None);
                assert_eq!(shared_keys, Some(vec!["a".to_owned(), "b".to_owned()]));
            }
            command => panic!("unexpected command {command:?}"),
        }
    }

    #[test]
    fn it_rejects_invalid_json() {
        let result = Cli::try_parse_from([
            "tbhttp",
            "--host",
            "http://localhost:8080",
            "attributes",
            "{oops",
        ]);
        assert!(result.is_err());
    }
}
