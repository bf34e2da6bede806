use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "ticket-core", version, about = "Discord support ticket service")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "CONFIG_PATH", default_value = "config.yaml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Connect to Discord and serve the HTTP API (default).
    Run,
    /// Apply the database schema and exit.
    Migrate,
    /// Run one reconciliation pass and exit.
    Sweep,
    /// Create guild settings and the default roles.
    InitGuild { guild_id: String, owner_id: String },
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_the_default_command() {
        let cli = Cli::try_parse_from(["ticket-core"]).expect("parse");
        assert_eq!(cli.command(), Command::Run);
    }

    #[test]
    fn init_guild_takes_two_ids() {
        let cli = Cli::try_parse_from(["ticket-core", "--config", "prod.yaml", "init-guild", "1", "2"])
            .expect("parse");
        assert_eq!(cli.config, PathBuf::from("prod.yaml"));
        assert_eq!(
            cli.command(),
            Command::InitGuild {
                guild_id: "1".to_string(),
                owner_id: "2".to_string(),
            }
        );
        assert!(Cli::try_parse_from(["ticket-core", "init-guild", "1"]).is_err());
    }
}
