use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError};
use serde::Deserialize;

use crate::session::SessionOptions;
use crate::source::Backoff;

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: Server,
    /// Shared secret a viewer must present to be admitted.
    pub auth_key: String,
    /// Host serving the device-local streams, normally loopback.
    #[serde(default = "default_source_host")]
    pub source_host: String,
    #[serde(default)]
    pub relay: Relay,
    /// Hard per-session duration ceiling.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Server {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Relay {
    /// Forward one out of every `skip_frame` candidate frames.
    #[serde(default = "default_skip_frame")]
    pub skip_frame: u32,
    /// Within a run of identical-length frames, still forward one out of
    /// every `skip_same_frame`.
    #[serde(default = "default_skip_same_frame")]
    pub skip_same_frame: u32,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            skip_frame: default_skip_frame(),
            skip_same_frame: default_skip_same_frame(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5901
}

fn default_source_host() -> String {
    "127.0.0.1".to_string()
}

fn default_skip_frame() -> u32 {
    5
}

fn default_skip_same_frame() -> u32 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    900
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("SCREEN_RELAY"))
            .build()?
            .try_deserialize()
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            source_host: self.source_host.clone(),
            skip_frame: self.relay.skip_frame,
            skip_same_frame: self.relay.skip_same_frame,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            port_poll: Backoff::PORT_POLL,
            source_connect: Backoff::SOURCE_CONNECT,
        }
    }
}
