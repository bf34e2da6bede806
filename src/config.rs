pub use self::parser::{
    Config, DatabaseConfig, DbType, DiscordConfig, LoggingConfig, MetricsConfig, PlatformConfig,
    ReconciliationConfig, TicketsConfig, WebConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
