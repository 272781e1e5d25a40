use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde_derive::Deserialize;
use thiserror::Error;

pub mod v1alpha1;

pub use v1alpha1::{BrokerAddressError, Config};

const DEFAULT_CONFIG_FILE: &str = "cat-doorbell/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unsupported api version: {0}")]
    UnsupportedApiVersion(String),
    #[error("unsupported kind {kind:?} for api version {api_version}")]
    UnsupportedKind { api_version: String, kind: String },
    #[error("invalid target MAC address {value:?}: {reason}")]
    InvalidTarget { value: String, reason: String },
    #[error("invalid broker address {address:?}: {source}")]
    InvalidBroker {
        address: String,
        #[source]
        source: BrokerAddressError,
    },
}

/// The discriminator every configuration document starts with.
#[derive(Deserialize, Debug, Clone)]
pub struct TypeMeta {
    pub api_version: String,
    pub kind: String,
}

/// A configuration decoded at whatever version the document declared.
#[derive(Debug, Clone)]
pub enum VersionedConfig {
    V1Alpha1(v1alpha1::Config),
}

impl VersionedConfig {
    pub fn api_version(&self) -> &'static str {
        match self {
            VersionedConfig::V1Alpha1(_) => v1alpha1::API_VERSION,
        }
    }
}

pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_CONFIG_FILE)
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    from_toml(&contents)
}

/// Decodes the type meta first, picks the decoder for that version and kind,
/// then brings the result up to the latest version.
pub fn from_toml(contents: &str) -> Result<Config, ConfigError> {
    let type_meta: TypeMeta = toml::de::from_str(contents)?;

    let versioned = match type_meta.api_version.as_str() {
        v1alpha1::API_VERSION => VersionedConfig::V1Alpha1(v1alpha1::decode(&type_meta.kind, contents)?),
        other => return Err(ConfigError::UnsupportedApiVersion(other.to_string())),
    };

    debug!("Decoded {} {}", versioned.api_version(), type_meta.kind);
    let config = migrate_to_latest(versioned)?;
    config.validate()?;
    Ok(config)
}

fn migrate_to_latest(versioned: VersionedConfig) -> Result<Config, ConfigError> {
    match versioned {
        // Already the latest version.
        VersionedConfig::V1Alpha1(config) => Ok(config),
    }
}
