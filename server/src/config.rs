use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Command-line flags. Only flags the user actually passed are serialized,
/// so unset flags never shadow the TOML file or the environment.
#[derive(Parser, Serialize, Debug)]
#[command(name = "forum-server", version, about = "Forum server with real-time chat")]
pub struct Cli {
    /// Port to listen on [default: 8080]
    #[arg(long, env = "FORUM_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "FORUM_BIND_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = "./forum.toml")]
    #[serde(skip)]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "FORUM_JSON_LOGS")]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub generate_config: bool,

    /// Data directory for persistent state (SQLite database) [default: ./data]
    #[arg(long, env = "FORUM_DATA_DIR")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Session lifetime in hours [default: 24]
    #[arg(long, env = "FORUM_SESSION_TTL_HOURS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_ttl_hours: Option<i64>,

    /// Mark the session cookie Secure (disable for plain-http development) [default: true]
    #[arg(long, env = "FORUM_SECURE_COOKIES", action = clap::ArgAction::Set)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure_cookies: Option<bool>,

    /// Requests a single peer IP may burst against /api/auth/* before throttling [default: 5]
    #[arg(long, env = "FORUM_AUTH_BURST_SIZE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_burst_size: Option<u32>,

    /// Seconds for one auth request token to replenish, 12 = 5 per minute [default: 12]
    #[arg(long, env = "FORUM_AUTH_REPLENISH_SECS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_replenish_secs: Option<u64>,
}

/// Resolved server configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub json_logs: bool,
    pub generate_config: bool,
    /// Data directory for the SQLite database
    pub data_dir: String,
    pub session_ttl_hours: i64,
    pub secure_cookies: bool,
    pub auth_burst_size: u32,
    pub auth_replenish_secs: u64,

    /// Real-time hub configuration (loaded from [realtime] section in TOML)
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

/// Tuning for WebSocket connections and the broadcast hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Per-connection outbound queue capacity; a full queue evicts the connection (default: 256)
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Seconds between server pings (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before dropping the connection (default: 10)
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    /// Broadcast an online-users snapshot whenever someone connects or leaves (default: true)
    #[serde(default = "default_announce_presence")]
    pub announce_presence: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
            announce_presence: true,
        }
    }
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_ping_interval() -> u64 {
    30
}

fn default_pong_timeout() -> u64 {
    10
}

fn default_announce_presence() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            session_ttl_hours: 24,
            secure_cookies: true,
            auth_burst_size: 5,
            auth_replenish_secs: 12,
            realtime: RealtimeConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (FORUM_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment(Cli::parse()).extract()
    }

    pub fn figment(cli: Cli) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("FORUM_").split("__"))
            .merge(Serialized::defaults(cli))
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

# Session lifetime in hours (default: 24)
# session_ttl_hours = 24

# Mark the session cookie Secure. Turn off only for plain-http development.
# secure_cookies = true

# Rate limit on /api/auth/*: burst size per peer IP, and seconds per replenished request
# auth_burst_size = 5
# auth_replenish_secs = 12

# ---- Real-time hub ----
# [realtime]

# Outbound frames buffered per connection before it is dropped as a slow consumer
# outbound_queue_capacity = 256

# Keep-alive: ping every N seconds, drop the connection if no pong within M seconds
# ping_interval_secs = 30
# pong_timeout_secs = 10

# Broadcast the online-users list whenever someone connects or disconnects
# announce_presence = true
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses_to_defaults() {
        let parsed: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(&generate_config_template()))
            .extract()
            .unwrap();
        assert_eq!(parsed.port, 8080);
        assert_eq!(parsed.realtime.outbound_queue_capacity, 256);
    }

    fn write_toml(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forum.toml");
        std::fs::write(&path, contents).unwrap();
        let path = path.to_str().unwrap().to_string();
        (dir, path)
    }

    #[test]
    fn test_toml_file_applies_when_flags_are_unset() {
        let (_dir, path) = write_toml(
            "port = 9000\ndata_dir = \"/srv/forum\"\nsecure_cookies = false\nauth_burst_size = 9\n",
        );
        let config: Config = Config::figment(Cli::parse_from(["forum-server", "--config", path.as_str()]))
            .extract()
            .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.data_dir, "/srv/forum");
        assert!(!config.secure_cookies);
        assert_eq!(config.auth_burst_size, 9);
        // Untouched keys keep their defaults
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.session_ttl_hours, 24);
    }

    #[test]
    fn test_cli_flags_override_toml_file() {
        let (_dir, path) = write_toml("port = 9000\nsession_ttl_hours = 2\n");
        let config: Config = Config::figment(Cli::parse_from([
            "forum-server",
            "--config",
            path.as_str(),
            "--port",
            "7000",
            "--secure-cookies",
            "false",
        ]))
        .extract()
        .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.session_ttl_hours, 2);
        assert!(!config.secure_cookies);
    }

    #[test]
    fn test_missing_config_file_falls_back_to_defaults() {
        let config: Config = Config::figment(Cli::parse_from([
            "forum-server",
            "--config",
            "/nonexistent/forum.toml",
        ]))
        .extract()
        .unwrap();
        assert_eq!(config.port, 8080);
        assert!(config.secure_cookies);
        assert_eq!(config.realtime.outbound_queue_capacity, 256);
    }

    #[test]
    fn test_toml_overrides_realtime_section() {
        let parsed: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(
                "port = 9000\n[realtime]\noutbound_queue_capacity = 8\n",
            ))
            .extract()
            .unwrap();
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.realtime.outbound_queue_capacity, 8);
        assert_eq!(parsed.realtime.ping_interval_secs, 30);
        assert!(parsed.realtime.announce_presence);
    }
}
