use clap::{parser::ValueSource, ArgMatches, CommandFactory, FromArgMatches, Parser};
use figment::{
    providers::{Data, Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// pairchat messaging server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "pairchat-server", version, about = "pairchat messaging server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PAIRCHAT_PORT", default_value = "8000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "PAIRCHAT_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./pairchat.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "PAIRCHAT_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, message key)
    #[arg(long, env = "PAIRCHAT_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Secret the message encryption key is derived from. When unset a random
    /// key is generated into the data directory.
    #[arg(long, env = "PAIRCHAT_MESSAGE_SECRET", hide_env_values = true)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_secret: Option<String>,

    /// Messaging behaviour (loaded from [chat] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatConfig>,

    /// Rate limiting of WebSocket upgrades (loaded from [rate_limit] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

/// Messaging and connection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// How long after sending a message its sender may recall it (default: 180000 = 3 minutes)
    #[serde(default = "default_recall_window_ms")]
    pub recall_window_ms: u64,

    /// Messages returned per history request, capped at 100 (default: 100)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Pending inbound events per connection before reads stall (default: 64)
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,

    /// Pending outbound frames per connection before events are dropped (default: 256)
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Interval in seconds between keepalive pings (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before closing the connection (default: 10)
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            recall_window_ms: 180_000,
            history_limit: 100,
            inbound_queue: 64,
            outbound_queue: 256,
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
        }
    }
}

fn default_recall_window_ms() -> u64 {
    180_000
}

fn default_history_limit() -> usize {
    100
}

fn default_inbound_queue() -> usize {
    64
}

fn default_outbound_queue() -> usize {
    256
}

fn default_ping_interval() -> u64 {
    30
}

fn default_pong_timeout() -> u64 {
    10
}

/// Per-IP rate limit on `/ws` upgrades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled (default: true)
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,

    /// Seconds to replenish one connection token (default: 2)
    #[serde(default = "default_per_second")]
    pub per_second: u64,

    /// Connections allowed in a burst (default: 20)
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_second: 2,
            burst_size: 20,
        }
    }
}

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_per_second() -> u64 {
    2
}

fn default_burst_size() -> u32 {
    20
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            bind_address: "0.0.0.0".to_string(),
            config: "./pairchat.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            message_secret: None,
            chat: Some(ChatConfig::default()),
            rate_limit: Some(RateLimitConfig::default()),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (PAIRCHAT_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let matches = Config::command().get_matches();
        let config_path = matches
            .get_one::<String>("config")
            .cloned()
            .unwrap_or_else(|| "./pairchat.toml".to_string());
        Self::layered(Toml::file(&config_path), &matches)
    }

    fn layered(file: Data<Toml>, matches: &ArgMatches) -> Result<Self, figment::Error> {
        let cli = Config::from_arg_matches(matches).unwrap_or_else(|e| e.exit());
        Self::figment(file)
            .merge(Serialized::defaults(explicit_args(&cli, matches)))
            .extract()
    }

    fn figment(file: Data<Toml>) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(file)
            .merge(Env::prefixed("PAIRCHAT_").split("__"))
    }
}

/// The fields the user actually typed on the command line. Everything else
/// clap filled in from `default_value` or the environment and must not mask
/// the file and env layers.
fn explicit_args(
    cli: &Config,
    matches: &ArgMatches,
) -> serde_json::Map<String, serde_json::Value> {
    let mut fields = match serde_json::to_value(cli) {
        Ok(serde_json::Value::Object(fields)) => fields,
        _ => return serde_json::Map::new(),
    };
    fields.retain(|key, _| {
        matches.ids().any(|id| id.as_str() == key)
            && matches.value_source(key) == Some(ValueSource::CommandLine)
    });
    fields
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# pairchat Server Configuration
# Place this file at ./pairchat.toml or specify with --config <path>
# All settings can be overridden via environment variables (PAIRCHAT_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8000)
# port = 8000

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database and message key
# data_dir = "./data"

# Secret the message encryption key is derived from.
# Leave unset to generate a random key into data_dir/message_key.
# Changing it makes previously stored messages unreadable.
# message_secret = ""

# ---- Messaging ----
# [chat]

# Milliseconds after sending during which the sender may recall a message
# recall_window_ms = 180000

# Messages returned per history request (at most 100)
# history_limit = 100

# Per-connection queue sizes
# inbound_queue = 64
# outbound_queue = 256

# Keepalive
# ping_interval_secs = 30
# pong_timeout_secs = 10

# ---- Rate Limiting (WebSocket upgrades, per client IP) ----
# [rate_limit]
# enabled = true
# per_second = 2    # 1 token every 2 seconds
# burst_size = 20
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_file_missing() {
        let config: Config = Config::figment(Toml::file("/nonexistent/pairchat.toml"))
            .extract()
            .unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.data_dir, "./data");
        assert!(config.message_secret.is_none());
        let chat = config.chat.unwrap();
        assert_eq!(chat.recall_window_ms, 180_000);
        assert_eq!(chat.history_limit, 100);
        assert!(config.rate_limit.unwrap().enabled);
    }

    #[test]
    fn test_toml_sections_override_defaults() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(
                r#"
                port = 9100
                [chat]
                recall_window_ms = 5000
                [rate_limit]
                enabled = false
                "#,
            ))
            .extract()
            .unwrap();

        assert_eq!(config.port, 9100);
        let chat = config.chat.unwrap();
        assert_eq!(chat.recall_window_ms, 5000);
        // Unset keys in a present section fall back to their defaults
        assert_eq!(chat.outbound_queue, 256);
        let rate_limit = config.rate_limit.unwrap();
        assert!(!rate_limit.enabled);
        assert_eq!(rate_limit.burst_size, 20);
    }

    fn load_with(toml: &str, args: &[&str]) -> Config {
        let matches = Config::command().get_matches_from(args);
        Config::layered(Toml::string(toml), &matches).unwrap()
    }

    #[test]
    fn test_toml_values_survive_cli_defaults() {
        let config = load_with(
            "port = 9100\ndata_dir = \"/srv/chat\"\njson_logs = true",
            &["pairchat-server"],
        );
        assert_eq!(config.port, 9100);
        assert_eq!(config.data_dir, "/srv/chat");
        assert!(config.json_logs);
        assert_eq!(config.bind_address, "0.0.0.0");
    }

    #[test]
    fn test_cli_flags_override_toml() {
        let config = load_with(
            "port = 9100\ndata_dir = \"/srv/chat\"\n[chat]\nhistory_limit = 20",
            &["pairchat-server", "--port", "9200", "--json-logs"],
        );
        assert_eq!(config.port, 9200);
        assert!(config.json_logs);
        assert_eq!(config.data_dir, "/srv/chat");
        assert_eq!(config.chat.unwrap().history_limit, 20);
    }

    #[test]
    fn test_template_mentions_every_section() {
        let template = generate_config_template();
        assert!(template.contains("[chat]"));
        assert!(template.contains("[rate_limit]"));
        assert!(template.contains("recall_window_ms"));
    }
}
