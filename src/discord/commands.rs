use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serenity::all::{CommandOptionType, CreateCommand, CreateCommandOption, ResolvedOption, ResolvedValue};

pub const COMMAND_NAME: &str = "ticket";
const SUBJECT_MAX_LEN: u16 = 100;

static BUTTON_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ticket:close-(confirm|deny):(\d+):([0-9a-fA-F-]{36})$")
        .expect("Invalid close button regex")
});

/// Buttons attached to a close request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseRequestButton {
    Confirm { ticket_id: i64, request_id: String },
    Deny { ticket_id: i64, request_id: String },
}

impl CloseRequestButton {
    pub fn custom_id(&self) -> String {
        match self {
            CloseRequestButton::Confirm {
                ticket_id,
                request_id,
            } => format!("ticket:close-confirm:{ticket_id}:{request_id}"),
            CloseRequestButton::Deny {
                ticket_id,
                request_id,
            } => format!("ticket:close-deny:{ticket_id}:{request_id}"),
        }
    }

    pub fn parse(custom_id: &str) -> Option<Self> {
        let captures = BUTTON_ID.captures(custom_id)?;
        let ticket_id = captures.get(2)?.as_str().parse().ok()?;
        let request_id = captures.get(3)?.as_str().to_string();
        match captures.get(1)?.as_str() {
            "confirm" => Some(CloseRequestButton::Confirm {
                ticket_id,
                request_id,
            }),
            "deny" => Some(CloseRequestButton::Deny {
                ticket_id,
                request_id,
            }),
            _ => None,
        }
    }
}

/// One `/ticket` subcommand with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketCommand {
    Open { subject: Option<String> },
    Claim,
    Unclaim,
    Close { reason: Option<String> },
    Transfer { to_user_id: String },
    Add { user_id: String },
    Remove { user_id: String },
    RequestClose { reason: Option<String> },
    Autoclose { excluded: bool },
}

/// Flattened subcommand arguments, independent of the gateway types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandArgs {
    pub subcommand: String,
    pub strings: HashMap<String, String>,
    pub users: HashMap<String, String>,
    pub booleans: HashMap<String, bool>,
}

impl CommandArgs {
    pub fn from_resolved(options: &[ResolvedOption<'_>]) -> Self {
        let mut args = CommandArgs::default();
        for option in options {
            if let ResolvedValue::SubCommand(inner) = &option.value {
                args.subcommand = option.name.to_string();
                for arg in inner {
                    match &arg.value {
                        ResolvedValue::String(value) => {
                            args.strings.insert(arg.name.to_string(), value.to_string());
                        }
                        ResolvedValue::User(user, _) => {
                            args.users.insert(arg.name.to_string(), user.id.to_string());
                        }
                        ResolvedValue::Boolean(value) => {
                            args.booleans.insert(arg.name.to_string(), *value);
                        }
                        _ => {}
                    }
                }
            }
        }
        args
    }

    fn text(&self, name: &str) -> Option<String> {
        self.strings
            .get(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn user(&self, name: &str) -> Result<String, String> {
        self.users
            .get(name)
            .cloned()
            .ok_or_else(|| format!("missing required option `{name}`"))
    }
}

impl TicketCommand {
    pub fn parse(args: &CommandArgs) -> Result<Self, String> {
        let command = match args.subcommand.as_str() {
            "open" => TicketCommand::Open {
                subject: args.text("subject"),
            },
            "claim" => TicketCommand::Claim,
            "unclaim" => TicketCommand::Unclaim,
            "close" => TicketCommand::Close {
                reason: args.text("reason"),
            },
            "transfer" => TicketCommand::Transfer {
                to_user_id: args.user("user")?,
            },
            "add" => TicketCommand::Add {
                user_id: args.user("user")?,
            },
            "remove" => TicketCommand::Remove {
                user_id: args.user("user")?,
            },
            "request-close" => TicketCommand::RequestClose {
                reason: args.text("reason"),
            },
            "autoclose" => TicketCommand::Autoclose {
                excluded: args
                    .booleans
                    .get("exclude")
                    .copied()
                    .ok_or_else(|| "missing required option `exclude`".to_string())?,
            },
            other => return Err(format!("unknown subcommand `{other}`")),
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TicketCommand::Open { .. } => "open",
            TicketCommand::Claim => "claim",
            TicketCommand::Unclaim => "unclaim",
            TicketCommand::Close { .. } => "close",
            TicketCommand::Transfer { .. } => "transfer",
            TicketCommand::Add { .. } => "add",
            TicketCommand::Remove { .. } => "remove",
            TicketCommand::RequestClose { .. } => "request-close",
            TicketCommand::Autoclose { .. } => "autoclose",
        }
    }
}

fn subcommand(name: &str, description: &str) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::SubCommand, name, description)
}

fn reason_option() -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::String, "reason", "Why")
        .required(false)
        .max_length(500)
}

fn user_option(description: &str) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::User, "user", description).required(true)
}

/// The `/ticket` command registered with Discord.
pub fn ticket_command() -> CreateCommand {
    CreateCommand::new(COMMAND_NAME)
        .description("Manage support tickets")
        .dm_permission(false)
        .add_option(
            subcommand("open", "Open a new ticket").add_sub_option(
                CreateCommandOption::new(CommandOptionType::String, "subject", "What do you need help with?")
                    .required(false)
                    .max_length(SUBJECT_MAX_LEN),
            ),
        )
        .add_option(subcommand("claim", "Claim this ticket"))
        .add_option(subcommand("unclaim", "Release your claim on this ticket"))
        .add_option(subcommand("close", "Close this ticket").add_sub_option(reason_option()))
        .add_option(
            subcommand("transfer", "Hand this ticket to another staff member")
                .add_sub_option(user_option("New claimer")),
        )
        .add_option(subcommand("add", "Add a user to this ticket").add_sub_option(user_option("User to add")))
        .add_option(
            subcommand("remove", "Remove a user from this ticket")
                .add_sub_option(user_option("User to remove")),
        )
        .add_option(
            subcommand("request-close", "Ask the opener to confirm closing")
                .add_sub_option(reason_option()),
        )
        .add_option(
            subcommand("autoclose", "Exclude this ticket from auto-close").add_sub_option(
                CreateCommandOption::new(CommandOptionType::Boolean, "exclude", "Exclude from auto-close")
                    .required(true),
            ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const REQUEST: &str = "4f9c2a1e-8b7d-4c3a-9e21-0a1b2c3d4e5f";

    #[test]
    fn button_ids_round_trip() {
        let confirm = CloseRequestButton::Confirm {
            ticket_id: 42,
            request_id: REQUEST.to_string(),
        };
        let id = confirm.custom_id();
        assert_eq!(id, format!("ticket:close-confirm:42:{REQUEST}"));
        assert_eq!(CloseRequestButton::parse(&id), Some(confirm));
    }

    #[test_case("ticket:close-confirm:abc:4f9c2a1e-8b7d-4c3a-9e21-0a1b2c3d4e5f" ; "non numeric ticket")]
    #[test_case("ticket:close-maybe:1:4f9c2a1e-8b7d-4c3a-9e21-0a1b2c3d4e5f" ; "unknown action")]
    #[test_case("ticket:close-deny:1:short" ; "bad request id")]
    #[test_case("other:close-deny:1:4f9c2a1e-8b7d-4c3a-9e21-0a1b2c3d4e5f" ; "foreign prefix")]
    fn malformed_button_ids_are_ignored(custom_id: &str) {
        assert_eq!(CloseRequestButton::parse(custom_id), None);
    }

    fn args(subcommand: &str) -> CommandArgs {
        CommandArgs {
            subcommand: subcommand.to_string(),
            ..CommandArgs::default()
        }
    }

    #[test]
    fn blank_strings_become_none() {
        let mut open = args("open");
        open.strings.insert("subject".to_string(), "   ".to_string());
        assert_eq!(TicketCommand::parse(&open), Ok(TicketCommand::Open { subject: None }));
    }

    #[test]
    fn user_options_are_required() {
        assert!(TicketCommand::parse(&args("transfer")).is_err());
        let mut transfer = args("transfer");
        transfer.users.insert("user".to_string(), "99".to_string());
        assert_eq!(
            TicketCommand::parse(&transfer),
            Ok(TicketCommand::Transfer {
                to_user_id: "99".to_string()
            })
        );
    }

    #[test]
    fn unknown_subcommand_is_rejected() {
        assert!(TicketCommand::parse(&args("reopen")).is_err());
    }
}
