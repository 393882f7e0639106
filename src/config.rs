//! Module for loading the daemon configuration.
//!
//! Values are taken from the built in defaults, then from an optional YAML file and finally
//! from the environment variables used by the container deployment.
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::DatabaseParameters;
use crate::mqtt::MqttParameters;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
/// Parameters of the inbound message handling.
pub struct PipelineParameters {
    /// Number of received messages buffered while the database is busy. Messages arriving
    /// at a full buffer are dropped.
    pub queue_capacity: usize,
}

impl Default for PipelineParameters {
    fn default() -> Self {
        PipelineParameters { queue_capacity: 1024 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Configuration {
    pub database: DatabaseParameters,
    pub mqtt: MqttParameters,
    pub pipeline: PipelineParameters,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read the configuration file '{path}': {source}")]
    Io { path: String, source: std::io::Error },
    #[error("cannot deserialize the configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

impl Configuration {
    /// Reads the configuration from a YAML file. Missing keys keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Configuration, ConfigError> {
        let path = path.as_ref();
        let configuration_string = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_yaml::from_str::<Configuration>(&configuration_string)?)
    }

    /// Loads the configuration for the daemon.
    ///
    /// # Arguments
    ///
    /// * `explicit_path` - File given on the command line, it must exist.
    ///
    /// * `default_path` - File read only if it exists.
    ///
    /// * `lookup` - Source of environment overrides.
    ///
    pub fn load<F>(explicit_path: Option<&str>, default_path: &str, lookup: F) -> Result<Configuration, ConfigError>
        where F: Fn(&str) -> Option<String>
    {
        let mut configuration = match explicit_path {
            Some(path) => Configuration::from_file(path)?,
            None if Path::new(default_path).is_file() => Configuration::from_file(default_path)?,
            None => {
                log::debug!(target: "heatlogd", "No configuration file at \'{}\', using defaults", default_path);
                Configuration::default()
            }
        };
        configuration.apply_env_overrides(lookup)?;
        Ok(configuration)
    }

    /// Overrides connection settings from `MQTT_*` and `POSTGRES_*` variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
        where F: Fn(&str) -> Option<String>
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.address = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = parse_port("MQTT_PORT", port)?;
        }
        if let Some(host) = lookup("POSTGRES_HOST") {
            self.database.hostname = host;
        }
        if let Some(port) = lookup("POSTGRES_PORT") {
            self.database.port = parse_port("POSTGRES_PORT", port)?;
        }
        if let Some(database) = lookup("POSTGRES_DB") {
            self.database.database = database;
        }
        if let Some(user) = lookup("POSTGRES_USER") {
            self.database.username = user;
        }
        if let Some(password) = lookup("POSTGRES_PASSWORD") {
            self.database.password = password;
        }
        Ok(())
    }
}

fn parse_port(key: &str, value: String) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}
