use std::time::Duration;

use mac_address::MacAddress;
use serde_derive::Deserialize;
use thiserror::Error;

use super::ConfigError;
use crate::identity::DeviceIdentifier;

pub const API_VERSION: &str = "catdoorbell.github.com/v1alpha1";

const DEFAULT_DETECTION_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_TOPIC: &str = "bluetooth/devices";

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    /// MAC address of the beacon to listen for.
    pub target_mac: String,
    /// Minimum time between two alerts for the target.
    pub detection_timeout_seconds: Option<u64>,
    pub topic: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BrokerConfig {
    /// `tcp://host:port`, `mqtt://`, `ssl://` or `mqtts://`. The scheme is optional.
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub connect_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerAddressError {
    #[error("unsupported scheme {0}")]
    UnsupportedScheme(String),
    #[error("invalid port {0}")]
    InvalidPort(String),
    #[error("host cannot be empty")]
    EmptyHost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

pub fn decode(kind: &str, contents: &str) -> Result<Config, ConfigError> {
    match kind {
        "Config" => Ok(toml::de::from_str(contents)?),
        other => Err(ConfigError::UnsupportedKind {
            api_version: API_VERSION.to_string(),
            kind: other.to_string(),
        }),
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.target_mac
            .parse::<MacAddress>()
            .map_err(|err| ConfigError::InvalidTarget {
                value: self.target_mac.clone(),
                reason: err.to_string(),
            })?;
        self.broker.parsed_address()?;
        Ok(())
    }

    pub fn target(&self) -> DeviceIdentifier {
        DeviceIdentifier::new(self.target_mac.clone())
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_secs(
            self.detection_timeout_seconds
                .unwrap_or(DEFAULT_DETECTION_TIMEOUT_SECONDS),
        )
    }

    pub fn topic(&self) -> &str {
        self.topic.as_deref().unwrap_or(DEFAULT_TOPIC)
    }
}

impl BrokerConfig {
    pub fn parsed_address(&self) -> Result<BrokerAddress, ConfigError> {
        parse_broker_address(&self.address).map_err(|source| ConfigError::InvalidBroker {
            address: self.address.clone(),
            source,
        })
    }

    /// Defaults to `<hostname>-<pid>` so receivers on different machines
    /// never share a broker session.
    pub fn client_id(&self) -> String {
        self.client_id.clone().unwrap_or_else(|| {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "cat-doorbell".to_string());
            format!("{}-{}", host, std::process::id())
        })
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds.unwrap_or(5))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds.unwrap_or(30))
    }
}

fn parse_broker_address(address: &str) -> Result<BrokerAddress, BrokerAddressError> {
    let (tls, rest) = match address.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => (false, rest),
        Some(("ssl" | "tls" | "mqtts", rest)) => (true, rest),
        Some((scheme, _)) => {
            return Err(BrokerAddressError::UnsupportedScheme(scheme.to_string()));
        }
        None => (false, address),
    };
    let rest = rest.trim_end_matches('/');

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| BrokerAddressError::InvalidPort(port.to_string()))?;
            (host, port)
        }
        None => (rest, if tls { 8883 } else { 1883 }),
    };

    if host.is_empty() {
        return Err(BrokerAddressError::EmptyHost);
    }

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls,
    })
}
