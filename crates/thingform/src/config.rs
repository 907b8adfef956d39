//! Runtime configuration.
//!
//! Every field has a default, so an empty file (or no file at all) is a
//! valid configuration:
//!
//! ```toml
//! [transport]
//! max_attempts = 5
//!
//! [endpoint]
//! poll_interval_secs = 2
//! # max_attempts = 30
//! ```
use std::time::Duration;

use snafu::prelude::*;

use crate::{endpoint::EndpointResolver, observe::Observer};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Could not read config file '{path:?}': {source}"))]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not parse config file '{path:?}': {source}"))]
    Parse {
        path: std::path::PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("Invalid config: {msg}"))]
    Invalid { msg: String },
}

/// Settings for the SDK transport that carries every remote call.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSettings {
    /// Attempts per call, including the first, for throttling and network errors.
    pub max_attempts: u32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointSettings {
    pub poll_interval_secs: u64,
    /// Unset polls until the endpoint answers.
    pub max_attempts: Option<u32>,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            max_attempts: None,
        }
    }
}

impl EndpointSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn resolver<'a>(&self, observer: &'a dyn Observer) -> EndpointResolver<'a> {
        EndpointResolver::new(observer)
            .with_interval(self.poll_interval())
            .with_max_attempts(self.max_attempts)
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub transport: TransportSettings,
    pub endpoint: EndpointSettings,
}

impl Config {
    pub fn from_toml_str(
        contents: &str,
        path: impl AsRef<std::path::Path>,
    ) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents).context(ParseSnafu {
            path: path.as_ref(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        log::debug!("reading config from {path:?}");
        let contents = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        Self::from_toml_str(&contents, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.transport.max_attempts > 0,
            InvalidSnafu {
                msg: "transport.max_attempts must be at least 1"
            }
        );
        ensure!(
            self.endpoint.max_attempts != Some(0),
            InvalidSnafu {
                msg: "endpoint.max_attempts must be at least 1 when set"
            }
        );
        Ok(())
    }
}
