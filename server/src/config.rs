use std::ffi::OsString;
use std::time::Duration;

use clap::parser::ValueSource;
use clap::{CommandFactory, FromArgMatches, Parser};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Forum real-time server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "forum-server", version, about = "Forum real-time server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "FORUM_PORT", default_value = "8080")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "FORUM_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./forum.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "FORUM_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for the SQLite database
    #[arg(long, env = "FORUM_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Messages returned per history page
    #[arg(long, env = "FORUM_HISTORY_PAGE_SIZE", default_value = "10")]
    #[serde(default = "default_history_page_size")]
    pub history_page_size: u32,

    /// Connection hub tuning (loaded from [hub] section in TOML)
    /// Not serialized so the CLI layer cannot mask the TOML/env values.
    #[arg(skip)]
    #[serde(default, skip_serializing)]
    pub hub: HubConfig,
}

/// Timings and queue sizes for the connection hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Seconds between keep-alive pings (default: 25)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds a single outbound write may take before the connection is dropped (default: 10)
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Seconds without any inbound traffic before the connection is dropped (default: 90)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Frames buffered per connection before new frames are dropped (default: 16)
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Pending generic broadcasts before new ones are dropped (default: 64)
    #[serde(default = "default_queue")]
    pub broadcast_queue: usize,

    /// Pending presence transitions before producers wait (default: 64)
    #[serde(default = "default_queue")]
    pub presence_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            write_timeout_secs: default_write_timeout(),
            read_timeout_secs: default_read_timeout(),
            outbound_buffer: default_outbound_buffer(),
            broadcast_queue: default_queue(),
            presence_queue: default_queue(),
        }
    }
}

impl HubConfig {
    /// Never zero; the ping timer requires a non-zero period.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

fn default_ping_interval() -> u64 {
    25
}

fn default_write_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    90
}

fn default_outbound_buffer() -> usize {
    16
}

fn default_queue() -> usize {
    64
}

fn default_history_page_size() -> u32 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            config: "./forum.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            history_page_size: default_history_page_size(),
            hub: HubConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (FORUM_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(std::env::args_os())
    }

    /// Same as [`Config::load`] over an explicit argument list. Only flags
    /// actually given on the command line form the CLI layer.
    pub fn load_from<I, T>(args: I) -> Result<Self, figment::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Config::command().get_matches_from(args);
        let cli = Config::from_arg_matches(&matches)
            .map_err(|e| figment::Error::from(e.to_string()))?;
        let config_path = cli.config.clone();

        let mut given = match serde_json::to_value(&cli) {
            Ok(serde_json::Value::Object(fields)) => fields,
            Ok(_) => serde_json::Map::new(),
            Err(e) => return Err(figment::Error::from(e.to_string())),
        };
        given.retain(|key, _| matches.value_source(key) == Some(ValueSource::CommandLine));

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("FORUM_").split("__"))
            .merge(Serialized::defaults(given))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Forum Server Configuration
# Place this file at ./forum.toml or specify with --config <path>
# All settings can be overridden via environment variables (FORUM_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database
# data_dir = "./data"

# Messages per page returned by GET /api/messages
# history_page_size = 10

# ---- Connection Hub ----
# [hub]

# Keep-alive ping interval in seconds
# ping_interval_secs = 25

# Per-write deadline in seconds; a stalled write tears the connection down
# write_timeout_secs = 10

# Read deadline in seconds, refreshed by any inbound frame including pongs
# read_timeout_secs = 90

# Outbound frames buffered per connection; overflow is dropped for that connection only
# outbound_buffer = 16

# Pending generic broadcasts; overflow is dropped
# broadcast_queue = 64

# Pending presence transitions; producers wait when full
# presence_queue = 64
"#
    .to_string()
}
