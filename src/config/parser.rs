use super::ConfigError;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub discord: DiscordConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub tickets: TicketsConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize)]
pub struct DiscordConfig {
    pub bot_token: SecretString,
    #[serde(default)]
    pub application_id: Option<u64>,
    #[serde(default = "default_use_privileged_intents")]
    pub use_privileged_intents: bool,
    #[serde(default)]
    pub ticket_category_id: Option<String>,
    #[serde(default = "default_register_commands")]
    pub register_commands: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(alias = "console", default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub conn_string: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
}

impl DatabaseConfig {
    pub fn db_type(&self) -> DbType {
        let url = self.connection_string();
        if url.starts_with("sqlite://") {
            DbType::Sqlite
        } else {
            DbType::Postgres
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            url.clone()
        } else if let Some(ref conn) = self.conn_string {
            conn.clone()
        } else if let Some(ref file) = self.filename {
            format!("sqlite://{}", file)
        } else {
            String::new()
        }
    }

    pub fn sqlite_path(&self) -> Option<String> {
        if let DbType::Sqlite = self.db_type() {
            let url = self.connection_string();
            Some(url.strip_prefix("sqlite://").unwrap_or(&url).to_string())
        } else {
            None
        }
    }

    pub fn max_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.max_connections,
            DbType::Sqlite => Some(1),
        }
    }

    pub fn min_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.min_connections,
            DbType::Sqlite => Some(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

#[derive(Debug, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_token: Option<SecretString>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            api_token: None,
        }
    }
}

const MAX_MISSING_CHANNEL_GRACE_SECS: u64 = 30 * 24 * 60 * 60;

/// Knobs for the lifecycle orchestrator and the channel provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TicketsConfig {
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,
    #[serde(default)]
    pub send_delay_ms: u64,
    #[serde(default = "default_channel_name_pattern")]
    pub channel_name_pattern: String,
    #[serde(default = "default_archive_prefix")]
    pub archive_prefix: String,
    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,
}

impl TicketsConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    /// Renders the channel name for a ticket from `channel_name_pattern`.
    ///
    /// Supported placeholders are `:number` and `:opener`.
    pub fn channel_name(&self, number: i64, opener_id: &str) -> String {
        self.channel_name_pattern
            .replace(":number", &format!("{number:04}"))
            .replace(":opener", opener_id)
    }
}

impl Default for TicketsConfig {
    fn default() -> Self {
        Self {
            provider_timeout_ms: default_provider_timeout_ms(),
            send_delay_ms: 0,
            channel_name_pattern: default_channel_name_pattern(),
            archive_prefix: default_archive_prefix(),
            welcome_message: default_welcome_message(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_reconciliation_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_missing_channel_grace_secs")]
    pub missing_channel_grace_secs: u64,
    #[serde(default = "default_verify_channels")]
    pub verify_channels: bool,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconciliation_enabled(),
            interval_secs: default_sweep_interval_secs(),
            missing_channel_grace_secs: default_missing_channel_grace_secs(),
            verify_channels: default_verify_channels(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PlatformConfig {
    #[serde(default)]
    pub admin_ids: Vec<String>,
}

impl PlatformConfig {
    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admin_ids.iter().any(|id| id == user_id)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_bind_address")]
    pub bind_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            bind_address: default_metrics_bind_address(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discord.bot_token.expose_secret().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "discord.bot_token cannot be empty".to_string(),
            ));
        }

        if self.database.connection_string().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "database connection string cannot be empty".to_string(),
            ));
        }

        if self.web.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "web.port must be between 1 and 65535".to_string(),
            ));
        }

        if self.tickets.provider_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "tickets.provider_timeout_ms must be greater than 0".to_string(),
            ));
        }

        // Channel names are reused on retry, so each ticket needs its own.
        if !self.tickets.channel_name_pattern.contains(":number") {
            return Err(ConfigError::InvalidConfig(
                "tickets.channel_name_pattern must contain :number".to_string(),
            ));
        }

        if self.reconciliation.missing_channel_grace_secs > MAX_MISSING_CHANNEL_GRACE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "reconciliation.missing_channel_grace_secs must be at most {MAX_MISSING_CHANNEL_GRACE_SECS}"
            )));
        }

        if self.reconciliation.enabled && self.reconciliation.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconciliation.interval_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("TICKET_CORE_DISCORD_TOKEN") {
            self.discord.bot_token = SecretString::from(value);
        }
        if let Ok(value) = std::env::var("TICKET_CORE_DATABASE_URL") {
            self.database.url = Some(value);
        }
        if let Ok(value) = std::env::var("TICKET_CORE_API_TOKEN") {
            self.web.api_token = Some(SecretString::from(value));
        }
    }
}

fn default_use_privileged_intents() -> bool {
    true
}

fn default_register_commands() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9010
}

fn default_provider_timeout_ms() -> u64 {
    10_000
}

fn default_channel_name_pattern() -> String {
    "ticket-:number".to_string()
}

fn default_archive_prefix() -> String {
    "closed-".to_string()
}

fn default_welcome_message() -> String {
    "Thanks for reaching out, <@:opener>. A member of the support team will be with you shortly."
        .to_string()
}

fn default_reconciliation_enabled() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_missing_channel_grace_secs() -> u64 {
    60
}

fn default_verify_channels() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9011
}

fn default_metrics_bind_address() -> String {
    "127.0.0.1".to_string()
}

#[cfg(test)]
mod tests {
    use super::{Config, DbType};
    use crate::config::ConfigError;

    const MINIMAL: &str = r#"
discord:
  bot_token: "token"
database:
  filename: "/tmp/tickets.db"
"#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = Config::from_yaml(MINIMAL).expect("config parses");

        assert_eq!(config.database.db_type(), DbType::Sqlite);
        assert_eq!(config.database.sqlite_path().as_deref(), Some("/tmp/tickets.db"));
        assert_eq!(config.web.port, 9010);
        assert_eq!(config.tickets.provider_timeout_ms, 10_000);
        assert!(config.reconciliation.enabled);
        assert!(config.platform.admin_ids.is_empty());
    }

    #[test]
    fn postgres_url_selects_postgres_backend() {
        let yaml = r#"
discord:
  bot_token: "token"
database:
  url: "postgres://tickets@localhost/tickets"
  max_connections: 4
"#;
        let config = Config::from_yaml(yaml).expect("config parses");

        assert_eq!(config.database.db_type(), DbType::Postgres);
        assert_eq!(config.database.max_connections(), Some(4));
        assert!(config.database.sqlite_path().is_none());
    }

    #[test]
    fn empty_token_is_rejected() {
        let yaml = r#"
discord:
  bot_token: ""
database:
  filename: "/tmp/tickets.db"
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig(message) if message.contains("bot_token")));
    }

    #[test]
    fn zero_sweep_interval_is_rejected_when_enabled() {
        let yaml = r#"
discord:
  bot_token: "token"
database:
  filename: "/tmp/tickets.db"
reconciliation:
  interval_secs: 0
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig(message) if message.contains("interval_secs")));
    }

    #[test]
    fn channel_name_pattern_needs_ticket_number() {
        let yaml = r#"
discord:
  bot_token: "token"
database:
  filename: "/tmp/tickets.db"
tickets:
  channel_name_pattern: "ticket-:opener"
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidConfig(message) if message.contains("channel_name_pattern"))
        );

        let yaml = yaml.replace("ticket-:opener", ":opener-:number");
        let config = Config::from_yaml(&yaml).expect("config parses");
        assert_eq!(config.tickets.channel_name(7, "1001"), "1001-0007");
    }

    #[test]
    fn oversized_missing_channel_grace_is_rejected() {
        let yaml = r#"
discord:
  bot_token: "token"
database:
  filename: "/tmp/tickets.db"
reconciliation:
  missing_channel_grace_secs: 18446744073709551615
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidConfig(message) if message.contains("missing_channel_grace_secs"))
        );
    }

    #[test]
    fn channel_name_pattern_pads_ticket_number() {
        let config = Config::from_yaml(MINIMAL).expect("config parses");
        assert_eq!(config.tickets.channel_name(42, "1001"), "ticket-0042");
    }
}
