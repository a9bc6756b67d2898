use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::state::HubSettings;

/// Chorus real-time hub
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "chorus-hub", version, about = "Chorus real-time chat and presence hub")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "CHORUS_PORT", default_value = "7340")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "CHORUS_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./chorus.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "CHORUS_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Hub tuning knobs (loaded from [hub] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub hub: Option<HubConfig>,
}

/// Tuning knobs for the hub's runtime behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Outbound queue capacity per connection (default: 256)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Grace delay before a user with no connections goes offline,
    /// in milliseconds (default: 2000)
    #[serde(default = "default_offline_grace_ms")]
    pub offline_grace_ms: u64,

    /// Interval between server pings in seconds (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Close the connection if no pong arrives this long after a ping,
    /// in seconds (default: 10)
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    /// How long a delivered message ID is remembered for duplicate
    /// suppression, in seconds (default: 300)
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,

    /// Hard cap on remembered message IDs (default: 4096)
    #[serde(default = "default_dedup_max_entries")]
    pub dedup_max_entries: usize,

    /// Deadline for any single persistence/authorization call, in
    /// milliseconds (default: 2000)
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,

    /// Maximum concurrent connections per user (default: 8)
    #[serde(default = "default_max_conns_per_user")]
    pub max_conns_per_user: usize,

    /// Lifetime of a handshake ticket in seconds (default: 45)
    #[serde(default = "default_ticket_ttl")]
    pub ticket_ttl_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            offline_grace_ms: 2000,
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
            dedup_window_secs: 300,
            dedup_max_entries: 4096,
            upstream_timeout_ms: 2000,
            max_conns_per_user: 8,
            ticket_ttl_secs: 45,
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

fn default_offline_grace_ms() -> u64 {
    2000
}

fn default_ping_interval() -> u64 {
    30
}

fn default_pong_timeout() -> u64 {
    10
}

fn default_dedup_window() -> u64 {
    300
}

fn default_dedup_max_entries() -> usize {
    4096
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_max_conns_per_user() -> usize {
    8
}

fn default_ticket_ttl() -> u64 {
    45
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7340,
            bind_address: "0.0.0.0".to_string(),
            config: "./chorus.toml".to_string(),
            json_logs: false,
            generate_config: false,
            hub: Some(HubConfig::default()),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (CHORUS_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("CHORUS_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }

    /// Runtime settings derived from the loaded knobs.
    pub fn hub_settings(&self) -> HubSettings {
        let hub = self.hub.clone().unwrap_or_default();
        HubSettings {
            queue_capacity: hub.queue_capacity,
            offline_grace: Duration::from_millis(hub.offline_grace_ms),
            ping_interval: Duration::from_secs(hub.ping_interval_secs),
            pong_timeout: Duration::from_secs(hub.pong_timeout_secs),
            dedup_window: Duration::from_secs(hub.dedup_window_secs),
            dedup_max_entries: hub.dedup_max_entries,
            upstream_timeout: Duration::from_millis(hub.upstream_timeout_ms),
            max_conns_per_user: hub.max_conns_per_user,
            ticket_ttl: Duration::from_secs(hub.ticket_ttl_secs),
        }
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Chorus Hub Configuration
# Place this file at ./chorus.toml or specify with --config <path>
# All settings can be overridden via environment variables (CHORUS_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 7340)
# port = 7340

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# ---- Hub Tuning ----
# [hub]

# Outbound queue capacity per connection (default: 256)
# A slow client that falls this far behind starts losing ephemeral
# events; falling behind on durable events closes the connection.
# queue_capacity = 256

# Grace delay in ms before an empty connection set means offline
# (default: 2000). Absorbs page reloads and network flaps.
# offline_grace_ms = 2000

# Keep-alive supervision
# ping_interval_secs = 30
# pong_timeout_secs = 10

# Duplicate suppression window for delivered message IDs
# dedup_window_secs = 300
# dedup_max_entries = 4096

# Deadline for any single persistence/authorization call
# upstream_timeout_ms = 2000

# Maximum concurrent connections (tabs/devices) per user
# max_conns_per_user = 8

# Lifetime of a single-use connection ticket
# ticket_ttl_secs = 45
"#
    .to_string()
}
