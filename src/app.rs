use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{DatabaseManager, Ticket};
use crate::discord::commands::{CloseRequestButton, TicketCommand};
use crate::discord::provider::ChannelProvider;
use crate::events::EventBus;
use crate::lifecycle::{
    CloseOptions, ErrorKind, GENERIC_FAILURE_MESSAGE, LifecycleError, NewTicketRequest,
    TicketOrchestrator, TicketOutcome,
};
use crate::permissions::{Actor, AuthorizationPipeline, PermissionResolver, RoleService};
use crate::reconcile::ReconciliationSweep;
use crate::transcript::TranscriptRecorder;

/// Who invoked a gateway interaction, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub guild_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub discord_role_ids: Vec<String>,
}

/// Everything the entry surfaces need, built once at startup.
pub struct TicketApp {
    db: DatabaseManager,
    tickets: TicketOrchestrator,
    roles: RoleService,
    resolver: PermissionResolver,
    sweep: ReconciliationSweep,
    transcripts: TranscriptRecorder,
}

impl TicketApp {
    pub fn new(
        db: DatabaseManager,
        provider: Arc<dyn ChannelProvider>,
        events: EventBus,
        config: &Config,
    ) -> Self {
        let pipeline = AuthorizationPipeline::default();
        let tickets = TicketOrchestrator::new(
            db.clone(),
            pipeline.clone(),
            provider,
            events,
            config.tickets.clone(),
        );
        Self {
            roles: RoleService::new(db.guild_store(), db.role_store(), pipeline),
            resolver: PermissionResolver::new(
                db.guild_store(),
                db.role_store(),
                config.platform.clone(),
            ),
            sweep: ReconciliationSweep::new(tickets.clone(), config.reconciliation.clone()),
            transcripts: TranscriptRecorder::new(db.clone()),
            tickets,
            db,
        }
    }

    pub fn db(&self) -> &DatabaseManager {
        &self.db
    }

    pub fn tickets(&self) -> &TicketOrchestrator {
        &self.tickets
    }

    pub fn roles(&self) -> &RoleService {
        &self.roles
    }

    pub fn sweep(&self) -> &ReconciliationSweep {
        &self.sweep
    }

    pub fn transcripts(&self) -> &TranscriptRecorder {
        &self.transcripts
    }

    pub async fn actor(
        &self,
        guild_id: &str,
        user_id: &str,
        discord_role_ids: &[String],
    ) -> Result<Actor, LifecycleError> {
        Ok(self
            .resolver
            .resolve_actor(guild_id, user_id, discord_role_ids)
            .await?)
    }

    /// Bootstraps a guild the bot can see. Runs on every gateway guild-create.
    pub async fn on_guild_available(
        &self,
        guild_id: &str,
        owner_id: &str,
    ) -> Result<(), LifecycleError> {
        self.roles
            .initialize_guild(&Actor::system(), guild_id, owner_id)
            .await
            .map(|_| ())
    }

    pub async fn on_channel_deleted(&self, channel_id: &str) -> Result<(), LifecycleError> {
        self.sweep.handle_channel_deleted(channel_id).await.map(|_| ())
    }

    pub async fn on_member_left(&self, guild_id: &str, user_id: &str) -> Result<(), LifecycleError> {
        self.sweep
            .handle_member_left(guild_id, user_id)
            .await
            .map(|_| ())
    }

    /// Runs one `/ticket` subcommand and returns the ephemeral reply.
    pub async fn handle_command(&self, invocation: &Invocation, command: TicketCommand) -> String {
        let name = command.name();
        match self.run_command(invocation, command).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    "ticket command failed command={} guild_id={} user_id={}: {}",
                    name, invocation.guild_id, invocation.user_id, e
                );
                reply_for_error(&e)
            }
        }
    }

    /// Handles a close-request confirm or deny button.
    pub async fn handle_button(&self, invocation: &Invocation, button: CloseRequestButton) -> String {
        let result = async {
            let actor = self
                .actor(&invocation.guild_id, &invocation.user_id, &invocation.discord_role_ids)
                .await?;
            match &button {
                CloseRequestButton::Confirm {
                    ticket_id,
                    request_id,
                } => {
                    let outcome = self
                        .tickets
                        .confirm_close_request(&actor, *ticket_id, request_id)
                        .await?;
                    Ok::<_, LifecycleError>(with_notices(
                        format!("Ticket #{} closed.", outcome.ticket.number),
                        &outcome,
                    ))
                }
                CloseRequestButton::Deny {
                    ticket_id,
                    request_id,
                } => {
                    let outcome = self
                        .tickets
                        .deny_close_request(&actor, *ticket_id, request_id)
                        .await?;
                    Ok(format!("Ticket #{} stays open.", outcome.ticket.number))
                }
            }
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!(
                "close request button failed user_id={}: {}",
                invocation.user_id, e
            );
            reply_for_error(&e)
        })
    }

    async fn ticket_here(&self, invocation: &Invocation) -> Result<Ticket, LifecycleError> {
        self.tickets
            .find_by_channel(&invocation.channel_id)
            .await?
            .filter(|ticket| ticket.guild_id == invocation.guild_id)
            .ok_or_else(|| {
                LifecycleError::Validation("this command only works inside a ticket channel".to_string())
            })
    }

    async fn run_command(
        &self,
        invocation: &Invocation,
        command: TicketCommand,
    ) -> Result<String, LifecycleError> {
        let actor = self
            .actor(&invocation.guild_id, &invocation.user_id, &invocation.discord_role_ids)
            .await?;

        let reply = match command {
            TicketCommand::Open { subject } => {
                let outcome = self
                    .tickets
                    .create(
                        &actor,
                        NewTicketRequest {
                            guild_id: invocation.guild_id.clone(),
                            opener_id: invocation.user_id.clone(),
                            subject,
                            ..NewTicketRequest::default()
                        },
                    )
                    .await?;
                info!(
                    "ticket opened from command ticket_id={} guild_id={}",
                    outcome.ticket.id, invocation.guild_id
                );
                match outcome.ticket.channel() {
                    Some(channel_id) => format!(
                        "Ticket #{} opened in <#{}>.",
                        outcome.ticket.number, channel_id
                    ),
                    None => format!(
                        "Ticket #{} was created, but its channel could not be set up yet. It will be retried.",
                        outcome.ticket.number
                    ),
                }
            }
            TicketCommand::Claim => {
                let ticket = self.ticket_here(invocation).await?;
                let number = ticket.number;
                let outcome = self.tickets.claim(&actor, ticket.id).await?;
                let text = if outcome.changed {
                    format!("You claimed ticket #{number}.")
                } else {
                    format!("You already claimed ticket #{number}.")
                };
                with_notices(text, &outcome)
            }
            TicketCommand::Unclaim => {
                let ticket = self.ticket_here(invocation).await?;
                let outcome = self.tickets.unclaim(&actor, ticket.id, None).await?;
                with_notices(
                    format!("Ticket #{} is no longer claimed.", ticket.number),
                    &outcome,
                )
            }
            TicketCommand::Close { reason } => {
                let ticket = self.ticket_here(invocation).await?;
                let number = ticket.number;
                let outcome = self
                    .tickets
                    .close(&actor, ticket.id, reason, CloseOptions::default())
                    .await?;
                let text = if outcome.changed {
                    format!("Ticket #{number} closed.")
                } else {
                    format!("Ticket #{number} is already closed.")
                };
                with_notices(text, &outcome)
            }
            TicketCommand::Transfer { to_user_id } => {
                let ticket = self.ticket_here(invocation).await?;
                let from = ticket.claimed_by_id.clone().ok_or(LifecycleError::NotClaimed)?;
                let outcome = self
                    .tickets
                    .transfer(&actor, ticket.id, &from, &to_user_id)
                    .await?;
                with_notices(
                    format!("Ticket #{} transferred to <@{to_user_id}>.", ticket.number),
                    &outcome,
                )
            }
            TicketCommand::Add { user_id } => {
                let ticket = self.ticket_here(invocation).await?;
                let number = ticket.number;
                let outcome = self.tickets.add_participant(&actor, ticket.id, &user_id).await?;
                let text = if outcome.changed {
                    format!("<@{user_id}> added to ticket #{number}.")
                } else {
                    format!("<@{user_id}> is already in ticket #{number}.")
                };
                with_notices(text, &outcome)
            }
            TicketCommand::Remove { user_id } => {
                let ticket = self.ticket_here(invocation).await?;
                let number = ticket.number;
                let outcome = self
                    .tickets
                    .remove_participant(&actor, ticket.id, &user_id)
                    .await?;
                let text = if outcome.changed {
                    format!("<@{user_id}> removed from ticket #{number}.")
                } else {
                    format!("<@{user_id}> was not part of ticket #{number}.")
                };
                with_notices(text, &outcome)
            }
            TicketCommand::RequestClose { reason } => {
                let ticket = self.ticket_here(invocation).await?;
                let outcome = self.tickets.request_close(&actor, ticket.id, reason).await?;
                with_notices(
                    format!("Asked <@{}> to confirm closing.", outcome.ticket.opener_id),
                    &outcome,
                )
            }
            TicketCommand::Autoclose { excluded } => {
                let ticket = self.ticket_here(invocation).await?;
                let number = ticket.number;
                let outcome = self
                    .tickets
                    .set_autoclose_excluded(&actor, ticket.id, excluded)
                    .await?;
                let text = if excluded {
                    format!("Ticket #{number} is excluded from auto-close.")
                } else {
                    format!("Ticket #{number} may be auto-closed again.")
                };
                with_notices(text, &outcome)
            }
        };
        Ok(reply)
    }
}

fn with_notices(text: String, outcome: &TicketOutcome) -> String {
    if outcome.is_partial() {
        format!("{text} Some follow-up steps failed and will be retried.")
    } else {
        text
    }
}

/// User-facing text for a failed operation. Internal failures are logged in
/// full and rendered generically.
pub fn reply_for_error(err: &LifecycleError) -> String {
    if err.kind() == ErrorKind::Internal {
        error!("ticket operation failed: {:?}", err);
        GENERIC_FAILURE_MESSAGE.to_string()
    } else {
        err.user_message()
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::db::TicketStatus;
    use crate::db::test_helpers::sqlite_manager;
    use crate::testing::FakeProvider;

    async fn app() -> (tempfile::NamedTempFile, TicketApp) {
        let (file, db) = sqlite_manager().await;
        let config = Config::from_yaml(
            "discord:\n  bot_token: test-token\ndatabase:\n  filename: unused.db\n",
        )
        .expect("config");
        let app = TicketApp::new(db, Arc::new(FakeProvider::new()), EventBus::default(), &config);
        app.on_guild_available("g1", "owner").await.expect("bootstrap");
        (file, app)
    }

    fn invocation(user_id: &str, channel_id: &str) -> Invocation {
        Invocation {
            guild_id: "g1".to_string(),
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            discord_role_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn open_then_close_from_commands() {
        let (_file, app) = app().await;
        let reply = app
            .handle_command(
                &invocation("opener", "lobby"),
                TicketCommand::Open {
                    subject: Some("refund".to_string()),
                },
            )
            .await;
        assert!(reply.starts_with("Ticket #1 opened in <#"), "{reply}");

        let ticket = app
            .db()
            .ticket_store()
            .get_ticket_by_number("g1", 1)
            .await
            .expect("query")
            .expect("ticket");
        let channel_id = ticket.channel().expect("channel").to_string();

        let stranger = app
            .handle_command(&invocation("stranger", &channel_id), TicketCommand::Close { reason: None })
            .await;
        assert!(stranger.contains("permission"), "{stranger}");

        let closed = app
            .handle_command(
                &invocation("opener", &channel_id),
                TicketCommand::Close {
                    reason: Some("resolved".to_string()),
                },
            )
            .await;
        assert_eq!(closed, "Ticket #1 closed.");
        let again = app
            .handle_command(&invocation("owner", &channel_id), TicketCommand::Close { reason: None })
            .await;
        assert_eq!(again, "Ticket #1 is already closed.");

        let stored = app.db().ticket_store().get_ticket(ticket.id).await.expect("query").expect("ticket");
        assert_eq!(stored.status, TicketStatus::Closed);
    }

    #[tokio::test]
    async fn ticket_commands_outside_ticket_channels_are_rejected() {
        let (_file, app) = app().await;
        let reply = app
            .handle_command(&invocation("owner", "lobby"), TicketCommand::Claim)
            .await;
        assert!(reply.contains("ticket channel"), "{reply}");
    }

    #[tokio::test]
    async fn owner_bypass_allows_staff_commands() {
        let (_file, app) = app().await;
        app.handle_command(&invocation("opener", "lobby"), TicketCommand::Open { subject: None })
            .await;
        let ticket = app
            .db()
            .ticket_store()
            .get_ticket_by_number("g1", 1)
            .await
            .expect("query")
            .expect("ticket");
        let channel_id = ticket.channel().expect("channel").to_string();

        let claimed = app
            .handle_command(&invocation("owner", &channel_id), TicketCommand::Claim)
            .await;
        assert_eq!(claimed, "You claimed ticket #1.");
        let transferred = app
            .handle_command(
                &invocation("owner", &channel_id),
                TicketCommand::Transfer {
                    to_user_id: "agent".to_string(),
                },
            )
            .await;
        assert_eq!(transferred, "Ticket #1 transferred to <@agent>.");
    }

    #[test]
    fn internal_errors_render_generic_message() {
        let err = LifecycleError::Database(crate::db::DatabaseError::Query("boom".to_string()));
        assert_eq!(reply_for_error(&err), GENERIC_FAILURE_MESSAGE);
        assert_eq!(
            reply_for_error(&LifecycleError::StaleCloseRequest),
            LifecycleError::StaleCloseRequest.user_message()
        );
    }
}
