//! Ticket lifecycle operations.
//!
//! Every operation follows the same shape: lock the ticket row, authorize the
//! actor against the locked state, plan the transition, write the ticket and
//! its audit entry, commit. Provider calls and domain events run afterwards
//! and only when the transaction actually changed something.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TicketsConfig;
use crate::db::{
    AuditAction, DatabaseManager, GuildSettings, LifecycleEvent, NewLifecycleEvent, NewTicket,
    NewTicketFeedback, Ticket, TicketStatus, TicketTx,
};
use crate::discord::commands::CloseRequestButton;
use crate::discord::provider::{
    ButtonStyle, ChannelProvider, OutgoingMessage, ProviderError, TicketChannelRequest,
};
use crate::events::{
    DomainEvent, EventBus, FeedbackReceived, ParticipantChanged, TicketClaimed, TicketClosed,
    TicketCreated, TicketTransferred, TicketUnclaimed,
};
use crate::permissions::{
    Actor, AuthContext, AuthorizationPipeline, Operation, PermissionFlags, SYSTEM_ACTOR_ID,
    has_any_permission,
};

use super::effects::{EffectExecutor, EffectReport, SideEffect};
use super::error::LifecycleError;
use super::state::{
    Plan, REASON_INACTIVITY, REASON_MEMBER_LEFT, REASON_OPENER_APPROVED, check_close_request,
    plan_autoclose_exclusion, plan_claim, plan_close, plan_deny_close, plan_link_channel,
    plan_request_close, plan_transfer, plan_unclaim,
};

const MAX_SUBJECT_LEN: usize = 100;
const MAX_REASON_LEN: usize = 500;
const MAX_COMMENT_LEN: usize = 1000;

#[derive(Debug, Clone, Default)]
pub struct NewTicketRequest {
    pub guild_id: String,
    pub opener_id: String,
    pub subject: Option<String>,
    pub panel_id: Option<String>,
    pub metadata: Option<Value>,
}

/// How a close treats the ticket channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOptions {
    /// Archive or delete the channel per guild settings.
    pub delete_channel: bool,
    /// Direct-message the opener about the closure.
    pub notify_opener: bool,
    /// The channel is known to be gone; skip every channel call.
    pub channel_gone: bool,
}

impl Default for CloseOptions {
    fn default() -> Self {
        Self {
            delete_channel: true,
            notify_opener: true,
            channel_gone: false,
        }
    }
}

impl CloseOptions {
    pub fn channel_deleted() -> Self {
        Self {
            delete_channel: false,
            notify_opener: false,
            channel_gone: true,
        }
    }
}

/// Result of a lifecycle operation.
#[derive(Debug, Clone, PartialEq)]
pub struct TicketOutcome {
    pub ticket: Ticket,
    /// False when the ticket was already in the requested state.
    pub changed: bool,
    /// Post-commit failures the caller may want to surface.
    pub notices: Vec<String>,
}

impl TicketOutcome {
    fn unchanged(ticket: Ticket) -> Self {
        Self {
            ticket,
            changed: false,
            notices: Vec::new(),
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.notices.is_empty()
    }
}

/// What a transaction wrote.
#[derive(Debug)]
struct Committed {
    before: Ticket,
    ticket: Ticket,
    action: Option<AuditAction>,
}

impl Committed {
    fn unchanged(ticket: Ticket) -> Self {
        Self {
            before: ticket.clone(),
            ticket,
            action: None,
        }
    }

    fn applied(&self) -> bool {
        self.action.is_some()
    }
}

enum ChannelLink {
    Linked(Ticket),
    Discard(Ticket),
}

enum Release {
    Unclaimed(Committed),
    Removed(Committed),
}

fn not_found() -> LifecycleError {
    LifecycleError::NotFound("ticket".to_string())
}

fn append_audit(
    tx: &mut dyn TicketTx,
    ticket_id: i64,
    action: AuditAction,
    actor_id: &str,
    metadata: Value,
) -> Result<LifecycleEvent, LifecycleError> {
    Ok(tx.append_event(&NewLifecycleEvent {
        ticket_id,
        action,
        performed_by_id: actor_id.to_string(),
        metadata,
        created_at: Utc::now(),
    })?)
}

/// Writes a planned change and its audit entry on the open transaction.
fn apply(
    tx: &mut dyn TicketTx,
    before: Ticket,
    plan: Plan,
    actor_id: &str,
) -> Result<Committed, LifecycleError> {
    match plan {
        Plan::Unchanged => Ok(Committed::unchanged(before)),
        Plan::Apply(change) => {
            tx.update_ticket(&change.ticket)?;
            append_audit(tx, before.id, change.action, actor_id, change.metadata)?;
            Ok(Committed {
                before,
                ticket: change.ticket,
                action: Some(change.action),
            })
        }
    }
}

fn is_related(ticket: &Ticket, actor: &Actor) -> bool {
    ticket.opener_id == actor.user_id || ticket.is_claimed_by(&actor.user_id)
}

fn bounded_text(
    field: &str,
    value: Option<String>,
    max: usize,
) -> Result<Option<String>, LifecycleError> {
    let value = value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    if let Some(value) = &value
        && value.chars().count() > max
    {
        return Err(LifecycleError::Validation(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(value)
}

fn require_user_id(field: &str, value: &str) -> Result<(), LifecycleError> {
    if value.trim().is_empty() {
        Err(LifecycleError::Validation(format!("{field} is required")))
    } else {
        Ok(())
    }
}

#[derive(Clone)]
pub struct TicketOrchestrator {
    db: DatabaseManager,
    pipeline: AuthorizationPipeline,
    effects: EffectExecutor,
    events: EventBus,
    config: TicketsConfig,
}

impl TicketOrchestrator {
    pub fn new(
        db: DatabaseManager,
        pipeline: AuthorizationPipeline,
        provider: Arc<dyn ChannelProvider>,
        events: EventBus,
        config: TicketsConfig,
    ) -> Self {
        let effects = EffectExecutor::new(provider, &config);
        Self {
            db,
            pipeline,
            effects,
            events,
            config,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn effects(&self) -> &EffectExecutor {
        &self.effects
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    /// Runs `work` against the locked ticket inside one transaction.
    async fn locked<T, F>(&self, ticket_id: i64, actor: &Actor, work: F) -> Result<T, LifecycleError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn TicketTx, Ticket, &Actor, &AuthorizationPipeline) -> Result<T, LifecycleError>
            + Send
            + 'static,
    {
        let actor = actor.clone();
        let pipeline = self.pipeline.clone();
        self.db
            .transaction(move |tx| {
                let ticket = tx.lock_ticket(ticket_id)?.ok_or_else(not_found)?;
                work(tx, ticket, &actor, &pipeline)
            })
            .await
    }

    /// Locks, authorizes and plans, then applies the plan.
    async fn transition<F>(
        &self,
        ticket_id: i64,
        actor: &Actor,
        plan: F,
    ) -> Result<Committed, LifecycleError>
    where
        F: FnOnce(&Ticket, &Actor, &AuthorizationPipeline) -> Result<Plan, LifecycleError>
            + Send
            + 'static,
    {
        let committed = self
            .locked(ticket_id, actor, move |tx, ticket, actor, pipeline| {
                let planned = plan(&ticket, actor, pipeline)?;
                apply(tx, ticket, planned, &actor.user_id)
            })
            .await?;
        self.log_commit(&committed, actor);
        Ok(committed)
    }

    fn log_commit(&self, committed: &Committed, actor: &Actor) {
        match committed.action {
            Some(action) => {
                info!(
                    "ticket transition committed ticket_id={} action={} status={} actor={}",
                    committed.ticket.id, action, committed.ticket.status, actor.user_id
                );
                #[cfg(feature = "metrics")]
                metrics::counter!("ticket_transitions_total", "action" => action.as_str())
                    .increment(1);
            }
            None => info!(
                "ticket already in requested state ticket_id={} status={} actor={}",
                committed.ticket.id, committed.ticket.status, actor.user_id
            ),
        }
    }

    async fn guild_settings(&self, guild_id: &str) -> Result<GuildSettings, LifecycleError> {
        self.db
            .guild_store()
            .get_guild(guild_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound("guild".to_string()))
    }

    async fn load(&self, ticket_id: i64) -> Result<Ticket, LifecycleError> {
        self.db
            .ticket_store()
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(not_found)
    }

    /// Rejects users the platform reports as outside the guild. A failed
    /// lookup does not block the operation.
    async fn require_member(&self, guild_id: &str, user_id: &str) -> Result<(), LifecycleError> {
        match self.effects.is_guild_member(guild_id, user_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(LifecycleError::NotGuildMember(user_id.to_string())),
            Err(e) => {
                warn!("membership lookup failed guild_id={} user_id={}: {}", guild_id, user_id, e);
                Ok(())
            }
        }
    }

    /// Discord roles mirrored from ticket roles that see or work every ticket.
    async fn support_role_ids(&self, guild_id: &str) -> Result<Vec<String>, LifecycleError> {
        let roles = self.db.role_store().list_roles(guild_id).await?;
        Ok(roles
            .into_iter()
            .filter(|role| {
                has_any_permission(
                    PermissionFlags::from_stored(role.permissions),
                    &[PermissionFlags::TICKET_VIEW_ALL, PermissionFlags::TICKET_CLAIM],
                )
            })
            .filter_map(|role| role.discord_role_id)
            .collect())
    }

    fn publish(&self, event: DomainEvent) {
        self.events.publish(event);
    }

    /// Runs channel effects and builds the outcome for a committed change.
    async fn finish(
        &self,
        committed: Committed,
        action: &'static str,
        effects: Vec<SideEffect>,
        event: Option<DomainEvent>,
    ) -> TicketOutcome {
        if !committed.applied() {
            return TicketOutcome::unchanged(committed.ticket);
        }
        let report = self.effects.run(committed.ticket.id, action, effects).await;
        if let Some(event) = event {
            self.publish(event);
        }
        TicketOutcome {
            ticket: committed.ticket,
            changed: true,
            notices: report.notices(),
        }
    }

    fn channel_message(ticket: &Ticket, content: String) -> Vec<SideEffect> {
        ticket
            .channel()
            .map(|channel_id| SideEffect::message(channel_id, OutgoingMessage::text(content)))
            .into_iter()
            .collect()
    }

    pub async fn get_ticket(&self, actor: &Actor, ticket_id: i64) -> Result<Ticket, LifecycleError> {
        let ticket = self.load(ticket_id).await?;
        self.authorize_view(actor, &ticket).await?;
        Ok(ticket)
    }

    pub async fn list_events(
        &self,
        actor: &Actor,
        ticket_id: i64,
    ) -> Result<Vec<LifecycleEvent>, LifecycleError> {
        let ticket = self.load(ticket_id).await?;
        self.authorize_view(actor, &ticket).await?;
        Ok(self.db.ticket_store().list_events(ticket_id).await?)
    }

    pub async fn find_by_channel(&self, channel_id: &str) -> Result<Option<Ticket>, LifecycleError> {
        Ok(self.db.ticket_store().get_ticket_by_channel(channel_id).await?)
    }

    async fn authorize_view(&self, actor: &Actor, ticket: &Ticket) -> Result<(), LifecycleError> {
        let mut related = is_related(ticket, actor);
        if !related {
            related = self
                .db
                .ticket_store()
                .list_participants(ticket.id)
                .await?
                .iter()
                .any(|participant| participant.user_id == actor.user_id);
        }
        self.pipeline
            .require(actor, &AuthContext::new(Operation::ViewTicket).related(related))?;
        Ok(())
    }

    /// Records a new ticket, then creates and links its channel.
    ///
    /// The row is committed before the channel exists. If channel creation
    /// fails the ticket stays `OPEN` with no channel and the outcome carries a
    /// notice; reconciliation backfills it later.
    pub async fn create(
        &self,
        actor: &Actor,
        request: NewTicketRequest,
    ) -> Result<TicketOutcome, LifecycleError> {
        require_user_id("guild id", &request.guild_id)?;
        require_user_id("opener id", &request.opener_id)?;
        let subject = bounded_text("subject", request.subject, MAX_SUBJECT_LEN)?;
        let related = actor.user_id == request.opener_id;
        self.pipeline
            .require(actor, &AuthContext::new(Operation::CreateTicket).related(related))?;

        let actor_id = actor.user_id.clone();
        let new_ticket = NewTicket {
            guild_id: request.guild_id,
            number: 0,
            opener_id: request.opener_id,
            subject,
            panel_id: request.panel_id,
            metadata: request.metadata,
            created_at: Utc::now(),
        };
        let ticket = self
            .db
            .transaction(move |tx| {
                tx.lock_guild(&new_ticket.guild_id)?
                    .ok_or_else(|| LifecycleError::NotFound("guild".to_string()))?;
                let number = tx.next_ticket_number(&new_ticket.guild_id)?;
                let ticket = tx.insert_ticket(&NewTicket {
                    number,
                    ..new_ticket
                })?;
                append_audit(
                    tx,
                    ticket.id,
                    AuditAction::Created,
                    &actor_id,
                    json!({
                        "number": ticket.number,
                        "subject": ticket.subject,
                        "panel_id": ticket.panel_id,
                    }),
                )?;
                Ok::<_, LifecycleError>(ticket)
            })
            .await?;

        info!(
            "ticket created ticket_id={} guild_id={} number={} opener_id={}",
            ticket.id, ticket.guild_id, ticket.number, ticket.opener_id
        );
        #[cfg(feature = "metrics")]
        metrics::counter!("ticket_transitions_total", "action" => AuditAction::Created.as_str())
            .increment(1);

        // The row is durable from here on; later failures become notices so
        // the caller never retries into a duplicate ticket.
        let fallback = ticket.clone();
        let mut outcome = match self.provision_channel(ticket, actor).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    "ticket channel setup failed after commit ticket_id={} guild_id={}: {}",
                    fallback.id, fallback.guild_id, e
                );
                TicketOutcome {
                    ticket: fallback,
                    changed: true,
                    notices: vec![format!("channel setup failed, will retry: {e}")],
                }
            }
        };
        outcome.changed = true;
        Ok(outcome)
    }

    /// Creates and links the channel for a ticket that has none yet.
    ///
    /// Tickets that are closed or already linked are returned untouched.
    pub async fn ensure_channel(
        &self,
        actor: &Actor,
        ticket_id: i64,
    ) -> Result<TicketOutcome, LifecycleError> {
        let ticket = self.load(ticket_id).await?;
        self.pipeline.require(
            actor,
            &AuthContext::new(Operation::ViewTicket).related(is_related(&ticket, actor)),
        )?;
        if !ticket.status.is_active() || ticket.channel().is_some() {
            return Ok(TicketOutcome::unchanged(ticket));
        }
        self.provision_channel(ticket, actor).await
    }

    async fn provision_channel(
        &self,
        ticket: Ticket,
        actor: &Actor,
    ) -> Result<TicketOutcome, LifecycleError> {
        let settings = self.guild_settings(&ticket.guild_id).await?;
        let request = TicketChannelRequest {
            guild_id: ticket.guild_id.clone(),
            ticket_id: ticket.id,
            ticket_number: ticket.number,
            opener_id: ticket.opener_id.clone(),
            name: self.config.channel_name(ticket.number, &ticket.opener_id),
            topic: ticket.subject.clone(),
            category_id: settings.ticket_category_id.clone(),
            support_role_ids: self.support_role_ids(&ticket.guild_id).await?,
        };

        let created = match self.effects.create_channel(&request).await {
            Ok(created) => created,
            Err(e) => {
                error!(
                    "ticket channel creation failed ticket_id={} guild_id={}: {}",
                    ticket.id, ticket.guild_id, e
                );
                let mut report = EffectReport::default();
                report.record("create_ticket_channel", e);
                return Ok(TicketOutcome {
                    ticket,
                    changed: false,
                    notices: report.notices(),
                });
            }
        };

        let channel_id = created.channel_id.clone();
        let ticket_id = ticket.id;
        let linked = self
            .locked(ticket_id, actor, move |tx, current, actor, _pipeline| {
                if current.status == TicketStatus::Closed {
                    return Ok(ChannelLink::Discard(current));
                }
                match plan_link_channel(&current, &channel_id)? {
                    Plan::Unchanged => Ok(ChannelLink::Discard(current)),
                    plan => {
                        let committed = apply(tx, current, plan, &actor.user_id)?;
                        Ok(ChannelLink::Linked(committed.ticket))
                    }
                }
            })
            .await;

        match linked {
            Ok(ChannelLink::Linked(ticket)) => {
                info!(
                    "ticket channel linked ticket_id={} channel_id={}",
                    ticket.id, created.channel_id
                );
                let welcome = self.welcome_message(&ticket);
                let report = self
                    .effects
                    .run(
                        ticket.id,
                        AuditAction::ChannelLinked.as_str(),
                        vec![SideEffect::message(&created.channel_id, welcome)],
                    )
                    .await;
                self.publish(DomainEvent::Created(TicketCreated {
                    ticket_id: ticket.id,
                    ticket_number: ticket.number,
                    guild_id: ticket.guild_id.clone(),
                    opener_id: ticket.opener_id.clone(),
                    channel_id: ticket.channel_id.clone(),
                    subject: ticket.subject.clone(),
                    panel_id: ticket.panel_id.clone(),
                }));
                Ok(TicketOutcome {
                    ticket,
                    changed: true,
                    notices: report.notices(),
                })
            }
            Ok(ChannelLink::Discard(current)) => {
                // The provider reuses channels by name, so a concurrent run may
                // have linked the very channel this run got back.
                if current.channel() == Some(created.channel_id.as_str()) {
                    debug!(
                        "channel already linked by a concurrent run ticket_id={} channel_id={}",
                        current.id, created.channel_id
                    );
                    return Ok(TicketOutcome::unchanged(current));
                }
                warn!(
                    "discarding surplus channel ticket_id={} channel_id={} status={}",
                    current.id, created.channel_id, current.status
                );
                if let Err(e) = self
                    .effects
                    .discard_channel(&created.channel_id, &settings, &actor.user_id)
                    .await
                {
                    warn!(
                        "failed to discard surplus channel channel_id={}: {}",
                        created.channel_id, e
                    );
                }
                Ok(TicketOutcome::unchanged(current))
            }
            Err(e) => {
                error!(
                    "failed to link channel ticket_id={} channel_id={}: {}",
                    ticket_id, created.channel_id, e
                );
                let linked_elsewhere = self
                    .load(ticket_id)
                    .await
                    .is_ok_and(|current| current.channel() == Some(created.channel_id.as_str()));
                if linked_elsewhere {
                    return Err(e);
                }
                if let Err(discard) = self
                    .effects
                    .discard_channel(&created.channel_id, &settings, &actor.user_id)
                    .await
                {
                    warn!(
                        "failed to discard unlinked channel channel_id={}: {}",
                        created.channel_id, discard
                    );
                }
                Err(e)
            }
        }
    }

    fn welcome_message(&self, ticket: &Ticket) -> OutgoingMessage {
        let mut content = self
            .config
            .welcome_message
            .replace(":opener", &ticket.opener_id)
            .replace(":number", &ticket.number.to_string());
        if let Some(subject) = &ticket.subject {
            content.push_str(&format!("\n**Subject:** {subject}"));
        }
        OutgoingMessage::text(content)
    }

    pub async fn claim(&self, actor: &Actor, ticket_id: i64) -> Result<TicketOutcome, LifecycleError> {
        let committed = self
            .transition(ticket_id, actor, |ticket, actor, pipeline| {
                pipeline.require(actor, &AuthContext::new(Operation::ClaimTicket))?;
                plan_claim(ticket, &actor.user_id, Utc::now())
            })
            .await?;
        let ticket = &committed.ticket;
        let effects = Self::channel_message(
            ticket,
            format!("<@{}> has claimed this ticket.", actor.user_id),
        );
        let event = DomainEvent::Claimed(TicketClaimed {
            ticket_id: ticket.id,
            ticket_number: ticket.number,
            guild_id: ticket.guild_id.clone(),
            claimed_by_id: actor.user_id.clone(),
        });
        Ok(self.finish(committed, "claimed", effects, Some(event)).await)
    }

    /// Releases the claim. The claimer may always unclaim; others need
    /// `TICKET_ASSIGN`.
    pub async fn unclaim(
        &self,
        actor: &Actor,
        ticket_id: i64,
        reason: Option<String>,
    ) -> Result<TicketOutcome, LifecycleError> {
        let reason = bounded_text("reason", reason, MAX_REASON_LEN)?;
        let plan_reason = reason.clone();
        let committed = self
            .transition(ticket_id, actor, move |ticket, actor, pipeline| {
                let related = ticket.is_claimed_by(&actor.user_id);
                pipeline.require(
                    actor,
                    &AuthContext::new(Operation::UnclaimTicket).related(related),
                )?;
                plan_unclaim(ticket, plan_reason.as_deref(), Utc::now())
            })
            .await?;
        let ticket = &committed.ticket;
        let effects = Self::channel_message(
            ticket,
            "This ticket is no longer claimed and is waiting for staff.".to_string(),
        );
        let event = DomainEvent::Unclaimed(TicketUnclaimed {
            ticket_id: ticket.id,
            ticket_number: ticket.number,
            guild_id: ticket.guild_id.clone(),
            previous_claimer_id: committed.before.claimed_by_id.clone(),
            unclaimed_by_id: actor.user_id.clone(),
            reason,
        });
        Ok(self.finish(committed, "unclaimed", effects, Some(event)).await)
    }

    pub async fn transfer(
        &self,
        actor: &Actor,
        ticket_id: i64,
        from_user_id: &str,
        to_user_id: &str,
    ) -> Result<TicketOutcome, LifecycleError> {
        require_user_id("source user", from_user_id)?;
        require_user_id("target user", to_user_id)?;
        let current = self.load(ticket_id).await?;
        self.require_member(&current.guild_id, to_user_id).await?;
        let from = from_user_id.to_string();
        let to = to_user_id.to_string();
        let committed = self
            .transition(ticket_id, actor, move |ticket, actor, pipeline| {
                pipeline.require(actor, &AuthContext::new(Operation::TransferTicket))?;
                plan_transfer(ticket, &from, &to, Utc::now())
            })
            .await?;

        let ticket = &committed.ticket;
        let mut effects = Vec::new();
        if let Some(channel_id) = ticket.channel() {
            effects.push(SideEffect::SetMemberAccess {
                channel_id: channel_id.to_string(),
                user_id: to_user_id.to_string(),
                allowed: true,
            });
            effects.push(SideEffect::message(
                channel_id,
                OutgoingMessage::text(format!(
                    "This ticket was transferred from <@{from_user_id}> to <@{to_user_id}>."
                )),
            ));
        }
        let event = DomainEvent::Transferred(TicketTransferred {
            ticket_id: ticket.id,
            ticket_number: ticket.number,
            guild_id: ticket.guild_id.clone(),
            from_user_id: from_user_id.to_string(),
            to_user_id: to_user_id.to_string(),
            transferred_by_id: actor.user_id.clone(),
        });
        Ok(self.finish(committed, "transferred", effects, Some(event)).await)
    }

    /// Closes the ticket. Closing an already closed ticket succeeds without
    /// writing anything or emitting a second event.
    pub async fn close(
        &self,
        actor: &Actor,
        ticket_id: i64,
        reason: Option<String>,
        options: CloseOptions,
    ) -> Result<TicketOutcome, LifecycleError> {
        let reason = bounded_text("reason", reason, MAX_REASON_LEN)?;
        let settings = self.guild_settings(&self.load(ticket_id).await?.guild_id).await?;
        let allow_opener = settings.allow_users_to_close;
        let plan_reason = reason.clone();
        let committed = self
            .transition(ticket_id, actor, move |ticket, actor, pipeline| {
                let related = (allow_opener && ticket.opener_id == actor.user_id)
                    || ticket.is_claimed_by(&actor.user_id);
                pipeline.require(actor, &AuthContext::new(Operation::CloseTicket).related(related))?;
                plan_close(ticket, &actor.user_id, plan_reason.as_deref(), Utc::now())
            })
            .await?;

        if !committed.applied() {
            return Ok(TicketOutcome::unchanged(committed.ticket));
        }
        Ok(self
            .finish_close(committed.ticket, &settings, actor, reason, options)
            .await)
    }

    /// Closes a ticket for inactivity on behalf of the system actor.
    ///
    /// Exclusion, last activity and the guild's auto-close switch are read
    /// again under the row lock; a ticket that no longer qualifies is left
    /// untouched.
    pub async fn close_inactive(
        &self,
        ticket_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<TicketOutcome, LifecycleError> {
        let actor = Actor::system();
        let committed = self
            .locked(ticket_id, &actor, move |tx, ticket, actor, pipeline| {
                let settings = tx
                    .lock_guild(&ticket.guild_id)?
                    .filter(|settings| settings.auto_close_enabled);
                let Some(settings) = settings else {
                    return Ok((Committed::unchanged(ticket), None));
                };
                if !ticket.status.is_active()
                    || ticket.exclude_from_autoclose
                    || ticket.last_activity_at > cutoff
                {
                    return Ok((Committed::unchanged(ticket), None));
                }
                pipeline.require(actor, &AuthContext::new(Operation::CloseTicket))?;
                let plan = plan_close(&ticket, &actor.user_id, Some(REASON_INACTIVITY), Utc::now())?;
                Ok((apply(tx, ticket, plan, &actor.user_id)?, Some(settings)))
            })
            .await?;

        let (committed, settings) = committed;
        if committed.applied() {
            self.log_commit(&committed, &actor);
        }
        match settings {
            Some(settings) if committed.applied() => Ok(self
                .finish_close(
                    committed.ticket,
                    &settings,
                    &actor,
                    Some(REASON_INACTIVITY.to_string()),
                    CloseOptions::default(),
                )
                .await),
            _ => {
                debug!(
                    "ticket no longer qualifies for auto-close ticket_id={} status={}",
                    committed.ticket.id, committed.ticket.status
                );
                Ok(TicketOutcome::unchanged(committed.ticket))
            }
        }
    }

    async fn finish_close(
        &self,
        ticket: Ticket,
        settings: &GuildSettings,
        actor: &Actor,
        reason: Option<String>,
        options: CloseOptions,
    ) -> TicketOutcome {
        let mut report = EffectReport::default();
        let mut effects = Vec::new();
        let mut channel_gone = options.channel_gone;
        let mut can_manage = true;
        let channel_id = ticket.channel().map(str::to_string);

        if let Some(channel_id) = channel_id.as_deref()
            && !channel_gone
        {
            match self.effects.snapshot(channel_id).await {
                Ok(capabilities) => {
                    if capabilities.can_post() {
                        let reason_line = reason
                            .as_deref()
                            .map(|reason| format!(" Reason: {reason}"))
                            .unwrap_or_default();
                        effects.push(SideEffect::message(
                            channel_id,
                            OutgoingMessage::text(format!(
                                "This ticket was closed by <@{}>.{reason_line}",
                                actor.user_id
                            )),
                        ));
                    } else {
                        report.record(
                            "send_message",
                            ProviderError::MissingPermission("SEND_MESSAGES".to_string()),
                        );
                    }
                    can_manage = capabilities.can_manage();
                }
                Err(e) if e.is_not_found() => channel_gone = true,
                Err(e) => report.record("fetch_permission_snapshot", e),
            }
        }

        if options.notify_opener && actor.user_id != ticket.opener_id {
            let reason_line = reason
                .as_deref()
                .map(|reason| format!(" Reason: {reason}"))
                .unwrap_or_default();
            effects.push(SideEffect::NotifyUser {
                user_id: ticket.opener_id.clone(),
                content: format!("Your ticket #{} has been closed.{reason_line}", ticket.number),
            });
        }

        if let Some(channel_id) = channel_id.as_deref()
            && options.delete_channel
            && !channel_gone
        {
            if can_manage {
                effects.push(SideEffect::ArchiveOrDelete {
                    channel_id: channel_id.to_string(),
                    guild_id: ticket.guild_id.clone(),
                    settings: settings.clone(),
                    actor_id: actor.user_id.clone(),
                });
            } else {
                report.record(
                    "archive_or_delete",
                    ProviderError::MissingPermission("MANAGE_CHANNELS".to_string()),
                );
            }
        }

        report.merge(self.effects.run(ticket.id, "closed", effects).await);
        let channel_deleted = if channel_gone && channel_id.is_some() {
            Some(true)
        } else {
            report.channel_deleted
        };

        self.publish(DomainEvent::Closed(TicketClosed {
            ticket_id: ticket.id,
            ticket_number: ticket.number,
            guild_id: ticket.guild_id.clone(),
            closed_by_id: actor.user_id.clone(),
            reason,
            channel_deleted,
        }));

        TicketOutcome {
            ticket,
            changed: true,
            notices: report.notices(),
        }
    }

    /// Asks the opener to confirm closing. A new request supersedes any
    /// outstanding one.
    pub async fn request_close(
        &self,
        actor: &Actor,
        ticket_id: i64,
        reason: Option<String>,
    ) -> Result<TicketOutcome, LifecycleError> {
        let reason = bounded_text("reason", reason, MAX_REASON_LEN)?;
        let request_id = Uuid::new_v4().to_string();
        let plan_reason = reason.clone();
        let committed = self
            .transition(ticket_id, actor, move |ticket, actor, pipeline| {
                let related = ticket.is_claimed_by(&actor.user_id);
                pipeline.require(actor, &AuthContext::new(Operation::RequestClose).related(related))?;
                plan_request_close(ticket, &request_id, plan_reason.as_deref())
            })
            .await?;

        let ticket = &committed.ticket;
        let mut effects = Vec::new();
        if let (Some(channel_id), Some(request_id)) =
            (ticket.channel(), ticket.close_request_id.as_deref())
        {
            let reason_line = reason
                .as_deref()
                .map(|reason| format!("\nReason: {reason}"))
                .unwrap_or_default();
            let confirm = CloseRequestButton::Confirm {
                ticket_id: ticket.id,
                request_id: request_id.to_string(),
            };
            let deny = CloseRequestButton::Deny {
                ticket_id: ticket.id,
                request_id: request_id.to_string(),
            };
            effects.push(SideEffect::message(
                channel_id,
                OutgoingMessage::text(format!(
                    "<@{}>, <@{}> would like to close this ticket.{reason_line}",
                    ticket.opener_id, actor.user_id
                ))
                .with_button(confirm.custom_id(), "Close", ButtonStyle::Danger)
                .with_button(deny.custom_id(), "Keep open", ButtonStyle::Secondary),
            ));
        }
        Ok(self.finish(committed, "close_requested", effects, None).await)
    }

    /// Opener accepts the close request identified by `request_id`.
    pub async fn confirm_close_request(
        &self,
        actor: &Actor,
        ticket_id: i64,
        request_id: &str,
    ) -> Result<TicketOutcome, LifecycleError> {
        let settings = self.guild_settings(&self.load(ticket_id).await?.guild_id).await?;
        let request_id = request_id.to_string();
        let committed = self
            .transition(ticket_id, actor, move |ticket, actor, _pipeline| {
                if ticket.opener_id != actor.user_id {
                    return Err(LifecycleError::NotOpener);
                }
                check_close_request(ticket, &request_id)?;
                plan_close(ticket, &actor.user_id, Some(REASON_OPENER_APPROVED), Utc::now())
            })
            .await?;

        let options = CloseOptions {
            notify_opener: false,
            ..CloseOptions::default()
        };
        Ok(self
            .finish_close(
                committed.ticket,
                &settings,
                actor,
                Some(REASON_OPENER_APPROVED.to_string()),
                options,
            )
            .await)
    }

    /// Opener rejects the close request; the ticket stays open.
    pub async fn deny_close_request(
        &self,
        actor: &Actor,
        ticket_id: i64,
        request_id: &str,
    ) -> Result<TicketOutcome, LifecycleError> {
        let request_id = request_id.to_string();
        let committed = self
            .transition(ticket_id, actor, move |ticket, actor, _pipeline| {
                if ticket.opener_id != actor.user_id {
                    return Err(LifecycleError::NotOpener);
                }
                plan_deny_close(ticket, &request_id)
            })
            .await?;
        let effects = Self::channel_message(
            &committed.ticket,
            format!("<@{}> wants to keep this ticket open.", actor.user_id),
        );
        Ok(self.finish(committed, "close_request_denied", effects, None).await)
    }

    pub async fn set_autoclose_excluded(
        &self,
        actor: &Actor,
        ticket_id: i64,
        excluded: bool,
    ) -> Result<TicketOutcome, LifecycleError> {
        let committed = self
            .transition(ticket_id, actor, move |ticket, actor, pipeline| {
                pipeline.require(actor, &AuthContext::new(Operation::ManageAutoclose))?;
                plan_autoclose_exclusion(ticket, excluded)
            })
            .await?;
        let text = if excluded {
            "This ticket will not be closed automatically."
        } else {
            "This ticket may be closed automatically when inactive."
        };
        let effects = Self::channel_message(&committed.ticket, text.to_string());
        Ok(self.finish(committed, "autoclose", effects, None).await)
    }

    pub async fn add_participant(
        &self,
        actor: &Actor,
        ticket_id: i64,
        user_id: &str,
    ) -> Result<TicketOutcome, LifecycleError> {
        require_user_id("user id", user_id)?;
        let current = self.load(ticket_id).await?;
        self.require_member(&current.guild_id, user_id).await?;
        let target = user_id.to_string();
        let committed = self
            .locked(ticket_id, actor, move |tx, ticket, actor, pipeline| {
                pipeline.require(
                    actor,
                    &AuthContext::new(Operation::ManageParticipants).related(is_related(&ticket, actor)),
                )?;
                if !ticket.status.is_active() {
                    return Err(LifecycleError::InvalidTransition {
                        action: "add a participant to",
                        status: ticket.status,
                    });
                }
                if ticket.opener_id == target {
                    return Err(LifecycleError::Validation(
                        "the opener already has access to this ticket".to_string(),
                    ));
                }
                if !tx.insert_participant(ticket.id, &target, &actor.user_id, Utc::now())? {
                    return Ok(Committed::unchanged(ticket));
                }
                append_audit(
                    tx,
                    ticket.id,
                    AuditAction::UserAdded,
                    &actor.user_id,
                    json!({ "user_id": target }),
                )?;
                Ok(Committed {
                    before: ticket.clone(),
                    ticket,
                    action: Some(AuditAction::UserAdded),
                })
            })
            .await?;
        self.log_commit(&committed, actor);

        let ticket = &committed.ticket;
        let mut effects = Vec::new();
        if let Some(channel_id) = ticket.channel() {
            effects.push(SideEffect::SetMemberAccess {
                channel_id: channel_id.to_string(),
                user_id: user_id.to_string(),
                allowed: true,
            });
            effects.push(SideEffect::message(
                channel_id,
                OutgoingMessage::text(format!("<@{user_id}> was added to this ticket.")),
            ));
        }
        let event = DomainEvent::UserAdded(ParticipantChanged {
            ticket_id: ticket.id,
            ticket_number: ticket.number,
            guild_id: ticket.guild_id.clone(),
            user_id: user_id.to_string(),
            performed_by_id: actor.user_id.clone(),
        });
        Ok(self.finish(committed, "user_added", effects, Some(event)).await)
    }

    pub async fn remove_participant(
        &self,
        actor: &Actor,
        ticket_id: i64,
        user_id: &str,
    ) -> Result<TicketOutcome, LifecycleError> {
        require_user_id("user id", user_id)?;
        let target = user_id.to_string();
        let committed = self
            .locked(ticket_id, actor, move |tx, ticket, actor, pipeline| {
                pipeline.require(
                    actor,
                    &AuthContext::new(Operation::ManageParticipants).related(is_related(&ticket, actor)),
                )?;
                if !ticket.status.is_active() {
                    return Err(LifecycleError::InvalidTransition {
                        action: "remove a participant from",
                        status: ticket.status,
                    });
                }
                if !tx.delete_participant(ticket.id, &target)? {
                    return Ok(Committed::unchanged(ticket));
                }
                append_audit(
                    tx,
                    ticket.id,
                    AuditAction::UserRemoved,
                    &actor.user_id,
                    json!({ "user_id": target }),
                )?;
                Ok(Committed {
                    before: ticket.clone(),
                    ticket,
                    action: Some(AuditAction::UserRemoved),
                })
            })
            .await?;
        self.log_commit(&committed, actor);

        let ticket = &committed.ticket;
        let mut effects = Vec::new();
        if let Some(channel_id) = ticket.channel() {
            effects.push(SideEffect::SetMemberAccess {
                channel_id: channel_id.to_string(),
                user_id: user_id.to_string(),
                allowed: false,
            });
            effects.push(SideEffect::message(
                channel_id,
                OutgoingMessage::text(format!("<@{user_id}> was removed from this ticket.")),
            ));
        }
        let event = DomainEvent::UserRemoved(ParticipantChanged {
            ticket_id: ticket.id,
            ticket_number: ticket.number,
            guild_id: ticket.guild_id.clone(),
            user_id: user_id.to_string(),
            performed_by_id: actor.user_id.clone(),
        });
        Ok(self.finish(committed, "user_removed", effects, Some(event)).await)
    }

    /// Opener rates a closed ticket, once.
    pub async fn submit_feedback(
        &self,
        actor: &Actor,
        ticket_id: i64,
        rating: i32,
        comment: Option<String>,
    ) -> Result<TicketOutcome, LifecycleError> {
        if !(1..=5).contains(&rating) {
            return Err(LifecycleError::Validation(
                "rating must be between 1 and 5".to_string(),
            ));
        }
        let comment = bounded_text("comment", comment, MAX_COMMENT_LEN)?;
        let stored_comment = comment.clone();
        let committed = self
            .locked(ticket_id, actor, move |tx, ticket, actor, _pipeline| {
                if ticket.status != TicketStatus::Closed {
                    return Err(LifecycleError::InvalidTransition {
                        action: "leave feedback on",
                        status: ticket.status,
                    });
                }
                if ticket.opener_id != actor.user_id {
                    return Err(LifecycleError::NotOpener);
                }
                if tx.feedback_exists(ticket.id)? {
                    return Err(LifecycleError::FeedbackExists);
                }
                tx.insert_feedback(&NewTicketFeedback {
                    ticket_id: ticket.id,
                    rating,
                    comment: stored_comment.clone(),
                    submitted_by_id: actor.user_id.clone(),
                    created_at: Utc::now(),
                })?;
                append_audit(
                    tx,
                    ticket.id,
                    AuditAction::FeedbackReceived,
                    &actor.user_id,
                    json!({ "rating": rating, "comment": stored_comment }),
                )?;
                Ok(Committed {
                    before: ticket.clone(),
                    ticket,
                    action: Some(AuditAction::FeedbackReceived),
                })
            })
            .await?;
        self.log_commit(&committed, actor);

        let ticket = &committed.ticket;
        let event = DomainEvent::FeedbackReceived(FeedbackReceived {
            ticket_id: ticket.id,
            ticket_number: ticket.number,
            guild_id: ticket.guild_id.clone(),
            submitted_by_id: actor.user_id.clone(),
            rating,
            comment,
        });
        Ok(self.finish(committed, "feedback_received", Vec::new(), Some(event)).await)
    }

    /// Reopens tickets claimed by a member who left the guild and drops them
    /// from participant lists, in one transaction.
    pub async fn release_departed_member(
        &self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<Vec<TicketOutcome>, LifecycleError> {
        require_user_id("user id", user_id)?;
        let system = Actor::system();
        let guild = guild_id.to_string();
        let member = user_id.to_string();
        let released = self
            .db
            .transaction(move |tx| {
                let mut released = Vec::new();
                for ticket in tx.lock_claimed_tickets(&guild, &member)? {
                    let plan = plan_unclaim(&ticket, Some(REASON_MEMBER_LEFT), Utc::now())?;
                    released.push(Release::Unclaimed(apply(tx, ticket, plan, SYSTEM_ACTOR_ID)?));
                }
                for ticket in tx.lock_participant_tickets(&guild, &member)? {
                    if tx.delete_participant(ticket.id, &member)? {
                        append_audit(
                            tx,
                            ticket.id,
                            AuditAction::UserRemoved,
                            SYSTEM_ACTOR_ID,
                            json!({ "user_id": member, "reason": REASON_MEMBER_LEFT }),
                        )?;
                        released.push(Release::Removed(Committed {
                            before: ticket.clone(),
                            ticket,
                            action: Some(AuditAction::UserRemoved),
                        }));
                    }
                }
                Ok::<_, LifecycleError>(released)
            })
            .await?;

        let mut outcomes = Vec::with_capacity(released.len());
        for release in released {
            match release {
                Release::Unclaimed(committed) => {
                    self.log_commit(&committed, &system);
                    let ticket = &committed.ticket;
                    let effects = Self::channel_message(
                        ticket,
                        format!("<@{user_id}> left the server; this ticket is open for staff again."),
                    );
                    let event = DomainEvent::Unclaimed(TicketUnclaimed {
                        ticket_id: ticket.id,
                        ticket_number: ticket.number,
                        guild_id: ticket.guild_id.clone(),
                        previous_claimer_id: Some(user_id.to_string()),
                        unclaimed_by_id: SYSTEM_ACTOR_ID.to_string(),
                        reason: Some(REASON_MEMBER_LEFT.to_string()),
                    });
                    outcomes.push(self.finish(committed, "unclaimed", effects, Some(event)).await);
                }
                Release::Removed(committed) => {
                    self.log_commit(&committed, &system);
                    let ticket = &committed.ticket;
                    let event = DomainEvent::UserRemoved(ParticipantChanged {
                        ticket_id: ticket.id,
                        ticket_number: ticket.number,
                        guild_id: ticket.guild_id.clone(),
                        user_id: user_id.to_string(),
                        performed_by_id: SYSTEM_ACTOR_ID.to_string(),
                    });
                    outcomes.push(self.finish(committed, "user_removed", Vec::new(), Some(event)).await);
                }
            }
        }
        Ok(outcomes)
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::db::test_helpers::sqlite_manager;
    use crate::lifecycle::ErrorKind;
    use crate::testing::{FakeProvider, ProviderCall, ProviderOp};
    use tempfile::NamedTempFile;
    use tokio::sync::broadcast;

    struct Harness {
        file: NamedTempFile,
        db: DatabaseManager,
        provider: Arc<FakeProvider>,
        tickets: TicketOrchestrator,
        events: broadcast::Receiver<DomainEvent>,
    }

    impl Harness {
        fn drain(&mut self) -> Vec<DomainEvent> {
            let mut drained = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                drained.push(event);
            }
            drained
        }

        async fn actions(&self, ticket_id: i64) -> Vec<AuditAction> {
            self.db
                .ticket_store()
                .list_events(ticket_id)
                .await
                .expect("events")
                .into_iter()
                .map(|event| event.action)
                .collect()
        }

        async fn open(&self) -> Ticket {
            let outcome = self
                .tickets
                .create(
                    &opener(),
                    NewTicketRequest {
                        guild_id: "g1".to_string(),
                        opener_id: "opener".to_string(),
                        subject: Some("Cannot log in".to_string()),
                        ..NewTicketRequest::default()
                    },
                )
                .await
                .expect("create");
            outcome.ticket
        }
    }

    async fn harness() -> Harness {
        let (file, db) = sqlite_manager().await;
        db.guild_store()
            .ensure_guild("g1", "owner")
            .await
            .expect("guild");
        let provider = Arc::new(FakeProvider::new());
        let bus = EventBus::default();
        let events = bus.subscribe();
        let tickets = TicketOrchestrator::new(
            db.clone(),
            AuthorizationPipeline::default(),
            provider.clone(),
            bus,
            TicketsConfig::default(),
        );
        Harness {
            file,
            db,
            provider,
            tickets,
            events,
        }
    }

    fn opener() -> Actor {
        Actor::user("opener", PermissionFlags::empty())
    }

    fn staff(id: &str) -> Actor {
        Actor::user(id, PermissionFlags::SUPPORT)
    }

    fn admin() -> Actor {
        Actor::user("admin", PermissionFlags::all())
    }

    #[tokio::test]
    async fn create_links_channel_and_announces_ticket() {
        let mut h = harness().await;
        let ticket = h.open().await;

        assert_eq!(ticket.number, 1);
        assert_eq!(ticket.status, TicketStatus::Open);
        let channel_id = ticket.channel().expect("linked channel").to_string();
        assert_eq!(h.provider.created_channels(), 1);
        assert_eq!(h.provider.messages_to(&channel_id).len(), 1);
        assert_eq!(
            h.actions(ticket.id).await,
            vec![AuditAction::Created, AuditAction::ChannelLinked]
        );

        let events = h.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DomainEvent::Created(created) => {
                assert_eq!(created.channel_id, channel_id);
                assert_eq!(created.subject.as_deref(), Some("Cannot log in"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn claimed_ticket_closes_with_full_history() {
        let mut h = harness().await;
        let ticket = h.open().await;
        let channel_id = ticket.channel().expect("channel").to_string();

        let claimed = h.tickets.claim(&staff("staff"), ticket.id).await.expect("claim");
        assert!(claimed.changed);
        assert!(claimed.ticket.is_claimed_by("staff"));

        let closed = h
            .tickets
            .close(
                &staff("staff"),
                ticket.id,
                Some("resolved".to_string()),
                CloseOptions::default(),
            )
            .await
            .expect("close");
        assert!(closed.changed);
        assert!(!closed.is_partial());
        assert_eq!(closed.ticket.status, TicketStatus::Closed);
        assert_eq!(closed.ticket.close_reason.as_deref(), Some("resolved"));
        assert!(closed.ticket.closed_at.is_some());
        assert!(!h.provider.has_channel(&channel_id));
        assert!(h.provider.calls().iter().any(|call| matches!(
            call,
            ProviderCall::NotifyUser { user_id, .. } if user_id == "opener"
        )));

        assert_eq!(
            h.actions(ticket.id).await,
            vec![
                AuditAction::Created,
                AuditAction::ChannelLinked,
                AuditAction::Claimed,
                AuditAction::Closed,
            ]
        );
        let names: Vec<&str> = h.drain().iter().map(DomainEvent::name).collect();
        assert_eq!(names, vec!["ticket.created", "ticket.claimed", "ticket.closed"]);
    }

    #[tokio::test]
    async fn concurrent_closes_commit_once() {
        let mut h = harness().await;
        let ticket = h.open().await;
        h.drain();

        let first_actor = admin();
        let second_actor = staff("owner").with_guild_owner(true);
        let (first, second) = tokio::join!(
            h.tickets
                .close(&first_actor, ticket.id, None, CloseOptions::default()),
            h.tickets
                .close(&second_actor, ticket.id, None, CloseOptions::default()),
        );
        let first = first.expect("first close");
        let second = second.expect("second close");
        assert!(first.changed ^ second.changed);
        assert_eq!(first.ticket.status, TicketStatus::Closed);
        assert_eq!(second.ticket.status, TicketStatus::Closed);

        let closes = h
            .actions(ticket.id)
            .await
            .into_iter()
            .filter(|action| *action == AuditAction::Closed)
            .count();
        assert_eq!(closes, 1);
        let closed_events = h
            .drain()
            .into_iter()
            .filter(|event| matches!(event, DomainEvent::Closed(_)))
            .count();
        assert_eq!(closed_events, 1);
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected_without_writes() {
        let h = harness().await;
        let ticket = h.open().await;

        let denied = h.tickets.claim(&opener(), ticket.id).await;
        assert!(matches!(denied, Err(LifecycleError::PermissionDenied(_))));

        h.tickets.claim(&staff("staff"), ticket.id).await.expect("claim");
        let again = h.tickets.claim(&staff("staff"), ticket.id).await.expect("reclaim");
        assert!(!again.changed);

        let taken = h.tickets.claim(&staff("other"), ticket.id).await;
        assert!(matches!(
            taken,
            Err(LifecycleError::AlreadyClaimed { claimed_by }) if claimed_by == "staff"
        ));

        let stranger_unclaim = h.tickets.unclaim(&opener(), ticket.id, None).await;
        assert!(matches!(
            stranger_unclaim,
            Err(LifecycleError::PermissionDenied(_))
        ));

        h.tickets
            .close(&admin(), ticket.id, None, CloseOptions::default())
            .await
            .expect("close");
        let late = h.tickets.claim(&staff("other"), ticket.id).await;
        assert!(matches!(late, Err(LifecycleError::InvalidTransition { .. })));

        let missing = h.tickets.claim(&staff("staff"), 9999).await;
        assert!(matches!(missing, Err(LifecycleError::NotFound(_))));

        assert_eq!(h.actions(ticket.id).await.len(), 4);
    }

    #[tokio::test]
    async fn transfer_moves_claim_and_grants_access() {
        let mut h = harness().await;
        let ticket = h.open().await;
        h.tickets.claim(&staff("staff"), ticket.id).await.expect("claim");

        let wrong_source = h
            .tickets
            .transfer(&staff("staff"), ticket.id, "other", "next")
            .await;
        assert!(matches!(wrong_source, Err(LifecycleError::Validation(_))));

        let moved = h
            .tickets
            .transfer(&staff("staff"), ticket.id, "staff", "next")
            .await
            .expect("transfer");
        assert!(moved.ticket.is_claimed_by("next"));
        assert!(h.provider.calls().iter().any(|call| matches!(
            call,
            ProviderCall::SetMemberAccess { user_id, allowed: true, .. } if user_id == "next"
        )));
        assert!(h.drain().iter().any(|event| matches!(
            event,
            DomainEvent::Transferred(t) if t.from_user_id == "staff" && t.to_user_id == "next"
        )));
    }

    #[tokio::test]
    async fn only_the_current_close_request_can_be_confirmed() {
        let mut h = harness().await;
        let ticket = h.open().await;
        let channel_id = ticket.channel().expect("channel").to_string();
        h.tickets.claim(&staff("staff"), ticket.id).await.expect("claim");

        let first = h
            .tickets
            .request_close(&staff("staff"), ticket.id, None)
            .await
            .expect("first request");
        let first_id = first.ticket.close_request_id.clone().expect("request id");
        let second = h
            .tickets
            .request_close(&staff("staff"), ticket.id, Some("no reply".to_string()))
            .await
            .expect("second request");
        let second_id = second.ticket.close_request_id.clone().expect("request id");
        assert_ne!(first_id, second_id);

        let prompt = h
            .provider
            .messages_to(&channel_id)
            .pop()
            .expect("close prompt");
        assert_eq!(prompt.buttons.len(), 2);
        assert_eq!(
            CloseRequestButton::parse(&prompt.buttons[0].custom_id),
            Some(CloseRequestButton::Confirm {
                ticket_id: ticket.id,
                request_id: second_id.clone(),
            })
        );

        let stale = h
            .tickets
            .confirm_close_request(&opener(), ticket.id, &first_id)
            .await;
        assert!(matches!(stale, Err(LifecycleError::StaleCloseRequest)));

        let impostor = h
            .tickets
            .confirm_close_request(&staff("staff"), ticket.id, &second_id)
            .await;
        assert!(matches!(impostor, Err(LifecycleError::NotOpener)));

        let closed = h
            .tickets
            .confirm_close_request(&opener(), ticket.id, &second_id)
            .await
            .expect("confirm");
        assert_eq!(closed.ticket.status, TicketStatus::Closed);
        assert_eq!(
            closed.ticket.close_reason.as_deref(),
            Some(REASON_OPENER_APPROVED)
        );
        assert!(closed.ticket.close_request_id.is_none());

        let replay = h
            .tickets
            .deny_close_request(&opener(), ticket.id, &second_id)
            .await;
        assert!(matches!(replay, Err(LifecycleError::StaleCloseRequest)));
        assert!(h.drain().iter().any(|event| matches!(event, DomainEvent::Closed(_))));
    }

    #[tokio::test]
    async fn denied_close_request_keeps_ticket_open() {
        let h = harness().await;
        let ticket = h.open().await;
        let requested = h
            .tickets
            .request_close(&admin(), ticket.id, None)
            .await
            .expect("request");
        let request_id = requested.ticket.close_request_id.expect("request id");

        let denied = h
            .tickets
            .deny_close_request(&opener(), ticket.id, &request_id)
            .await
            .expect("deny");
        assert_eq!(denied.ticket.status, TicketStatus::Open);
        assert!(denied.ticket.close_request_id.is_none());
        assert_eq!(
            h.actions(ticket.id).await.last(),
            Some(&AuditAction::CloseRequestDenied)
        );
    }

    #[tokio::test]
    async fn failed_channel_creation_is_backfilled_once() {
        let mut h = harness().await;
        h.provider.fail(ProviderOp::CreateChannel);

        let outcome = h
            .tickets
            .create(
                &opener(),
                NewTicketRequest {
                    guild_id: "g1".to_string(),
                    opener_id: "opener".to_string(),
                    ..NewTicketRequest::default()
                },
            )
            .await
            .expect("create commits without a channel");
        assert!(outcome.changed);
        assert!(outcome.is_partial());
        assert_eq!(outcome.ticket.channel(), None);
        assert!(h.drain().is_empty());

        h.provider.recover(ProviderOp::CreateChannel);
        let linked = h
            .tickets
            .ensure_channel(&Actor::system(), outcome.ticket.id)
            .await
            .expect("backfill");
        assert!(linked.changed);
        assert!(linked.ticket.channel().is_some());

        let again = h
            .tickets
            .ensure_channel(&Actor::system(), outcome.ticket.id)
            .await
            .expect("second backfill");
        assert!(!again.changed);
        assert_eq!(h.provider.created_channels(), 1);
        assert_eq!(h.db.ticket_store().count_tickets("g1").await.expect("count"), 1);

        let created = h
            .drain()
            .into_iter()
            .filter(|event| matches!(event, DomainEvent::Created(_)))
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn concurrent_backfills_keep_the_shared_channel() {
        let mut h = harness().await;
        h.provider.fail(ProviderOp::CreateChannel);
        let ticket = h.open().await;
        assert_eq!(ticket.channel(), None);
        h.provider.recover(ProviderOp::CreateChannel);
        h.drain();

        // Both runs ask for the same channel name while it is still free.
        h.provider.gate_creates(2);
        let system = Actor::system();
        let (first, second) = tokio::join!(
            h.tickets.ensure_channel(&system, ticket.id),
            h.tickets.ensure_channel(&system, ticket.id),
        );
        let (first, second) = (first.expect("first backfill"), second.expect("second backfill"));
        assert!(first.changed ^ second.changed);

        let stored = h.tickets.load(ticket.id).await.expect("load");
        let channel_id = stored.channel().expect("linked channel").to_string();
        assert_eq!(first.ticket.channel(), Some(channel_id.as_str()));
        assert_eq!(second.ticket.channel(), Some(channel_id.as_str()));
        assert_eq!(h.provider.created_channels(), 2);
        assert!(h.provider.has_channel(&channel_id));
        assert!(h.provider.deleted_channels().is_empty());
        assert_eq!(h.provider.messages_to(&channel_id).len(), 1);
    }

    #[tokio::test]
    async fn link_failure_after_commit_returns_the_ticket() {
        use diesel::{Connection, RunQueryDsl, sqlite::SqliteConnection};

        let mut h = harness().await;
        let path = h.file.path().to_string_lossy().to_string();
        let mut conn = SqliteConnection::establish(&path).expect("side connection");
        diesel::sql_query(
            "CREATE TRIGGER reject_link BEFORE UPDATE ON tickets \
             WHEN NEW.channel_id <> OLD.channel_id \
             BEGIN SELECT RAISE(ABORT, 'link rejected'); END",
        )
        .execute(&mut conn)
        .expect("install trigger");

        let outcome = h
            .tickets
            .create(
                &opener(),
                NewTicketRequest {
                    guild_id: "g1".to_string(),
                    opener_id: "opener".to_string(),
                    ..NewTicketRequest::default()
                },
            )
            .await
            .expect("create reports the committed ticket");
        assert!(outcome.changed);
        assert!(outcome.is_partial());
        assert!(outcome.notices[0].contains("channel setup failed"));
        assert_eq!(outcome.ticket.channel(), None);
        assert_eq!(h.db.ticket_store().count_tickets("g1").await.expect("count"), 1);
        assert_eq!(h.provider.deleted_channels().len(), 1);
        assert!(h.drain().is_empty());

        diesel::sql_query("DROP TRIGGER reject_link")
            .execute(&mut conn)
            .expect("drop trigger");
        let linked = h
            .tickets
            .ensure_channel(&Actor::system(), outcome.ticket.id)
            .await
            .expect("backfill");
        assert!(linked.changed);
        assert!(linked.ticket.channel().is_some());
        assert_eq!(h.db.ticket_store().count_tickets("g1").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn closing_after_channel_vanished_skips_channel_calls() {
        let mut h = harness().await;
        let ticket = h.open().await;
        let channel_id = ticket.channel().expect("channel").to_string();
        h.provider.remove_channel(&channel_id);
        h.drain();

        let closed = h
            .tickets
            .close(&admin(), ticket.id, None, CloseOptions::default())
            .await
            .expect("close");
        assert!(closed.changed);
        assert!(!closed.is_partial());
        assert!(!h.provider.calls().iter().any(|call| matches!(
            call,
            ProviderCall::ArchiveOrDelete { .. }
        )));
        match h.drain().pop() {
            Some(DomainEvent::Closed(event)) => assert_eq!(event.channel_deleted, Some(true)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_manage_permission_is_reported_not_fatal() {
        let h = harness().await;
        let ticket = h.open().await;
        h.provider.set_capabilities(crate::discord::provider::ChannelCapabilities {
            manage_channels: false,
            ..crate::discord::provider::ChannelCapabilities::full()
        });

        let closed = h
            .tickets
            .close(&admin(), ticket.id, None, CloseOptions::default())
            .await
            .expect("close");
        assert_eq!(closed.ticket.status, TicketStatus::Closed);
        assert!(closed.is_partial());
        assert!(closed.notices[0].contains("archive_or_delete"));
    }

    #[tokio::test]
    async fn participants_are_added_once_and_removed() {
        let mut h = harness().await;
        let ticket = h.open().await;
        h.drain();

        let added = h
            .tickets
            .add_participant(&opener(), ticket.id, "friend")
            .await
            .expect("add");
        assert!(added.changed);
        let duplicate = h
            .tickets
            .add_participant(&opener(), ticket.id, "friend")
            .await
            .expect("duplicate add");
        assert!(!duplicate.changed);

        let self_add = h.tickets.add_participant(&opener(), ticket.id, "opener").await;
        assert!(matches!(self_add, Err(LifecycleError::Validation(_))));

        let outsider = h
            .tickets
            .add_participant(&Actor::user("outsider", PermissionFlags::empty()), ticket.id, "x")
            .await;
        assert!(matches!(outsider, Err(LifecycleError::PermissionDenied(_))));

        let viewed = h
            .tickets
            .get_ticket(&Actor::user("friend", PermissionFlags::empty()), ticket.id)
            .await
            .expect("participant can view");
        assert_eq!(viewed.id, ticket.id);

        let removed = h
            .tickets
            .remove_participant(&opener(), ticket.id, "friend")
            .await
            .expect("remove");
        assert!(removed.changed);
        assert!(h.provider.calls().iter().any(|call| matches!(
            call,
            ProviderCall::SetMemberAccess { user_id, allowed: false, .. } if user_id == "friend"
        )));

        let names: Vec<&str> = h.drain().iter().map(DomainEvent::name).collect();
        assert_eq!(names, vec!["ticket.userAdded", "ticket.userRemoved"]);
    }

    #[tokio::test]
    async fn departed_users_cannot_join_or_take_over_tickets() {
        let h = harness().await;
        let ticket = h.open().await;
        h.tickets.claim(&staff("staff"), ticket.id).await.expect("claim");
        h.provider.remove_member("gone");

        let Err(added) = h.tickets.add_participant(&opener(), ticket.id, "gone").await else {
            panic!("departed user was added");
        };
        assert!(matches!(added, LifecycleError::NotGuildMember(_)));
        assert_eq!(added.kind(), ErrorKind::Authorization);
        let transferred = h
            .tickets
            .transfer(&staff("staff"), ticket.id, "staff", "gone")
            .await;
        assert!(matches!(transferred, Err(LifecycleError::NotGuildMember(user)) if user == "gone"));

        let stored = h.tickets.load(ticket.id).await.expect("load");
        assert!(stored.is_claimed_by("staff"));
        assert!(!h.actions(ticket.id).await.contains(&AuditAction::UserAdded));
    }

    #[tokio::test]
    async fn failed_membership_lookup_does_not_block_adding() {
        let h = harness().await;
        let ticket = h.open().await;
        h.provider.fail(ProviderOp::MemberLookup);

        let added = h
            .tickets
            .add_participant(&opener(), ticket.id, "friend")
            .await
            .expect("add");
        assert!(added.changed);
    }

    #[tokio::test]
    async fn feedback_is_accepted_once_from_the_opener() {
        let mut h = harness().await;
        let ticket = h.open().await;

        let early = h.tickets.submit_feedback(&opener(), ticket.id, 5, None).await;
        assert!(matches!(early, Err(LifecycleError::InvalidTransition { .. })));

        h.tickets
            .close(&opener(), ticket.id, None, CloseOptions::default())
            .await
            .expect("opener closes");
        h.drain();

        let out_of_range = h.tickets.submit_feedback(&opener(), ticket.id, 6, None).await;
        assert!(matches!(out_of_range, Err(LifecycleError::Validation(_))));
        let not_opener = h
            .tickets
            .submit_feedback(&staff("staff"), ticket.id, 4, None)
            .await;
        assert!(matches!(not_opener, Err(LifecycleError::NotOpener)));

        h.tickets
            .submit_feedback(&opener(), ticket.id, 4, Some("quick help".to_string()))
            .await
            .expect("feedback");
        let twice = h.tickets.submit_feedback(&opener(), ticket.id, 5, None).await;
        assert!(matches!(twice, Err(LifecycleError::FeedbackExists)));

        let stored = h
            .db
            .ticket_store()
            .get_feedback(ticket.id)
            .await
            .expect("query")
            .expect("feedback row");
        assert_eq!(stored.rating, 4);
        assert!(matches!(
            h.drain().as_slice(),
            [DomainEvent::FeedbackReceived(event)] if event.rating == 4
        ));
    }

    #[tokio::test]
    async fn departed_member_is_released_from_tickets() {
        let mut h = harness().await;
        let claimed = h.open().await;
        let joined = h.open().await;
        h.tickets.claim(&staff("staff"), claimed.id).await.expect("claim");
        h.tickets
            .add_participant(&admin(), joined.id, "staff")
            .await
            .expect("add");
        h.drain();

        let outcomes = h
            .tickets
            .release_departed_member("g1", "staff")
            .await
            .expect("release");
        assert_eq!(outcomes.len(), 2);

        let reopened = h.db.ticket_store().get_ticket(claimed.id).await.expect("query").expect("ticket");
        assert_eq!(reopened.status, TicketStatus::Open);
        assert_eq!(reopened.claimed_by_id, None);
        let last = h
            .db
            .ticket_store()
            .list_events(claimed.id)
            .await
            .expect("events")
            .pop()
            .expect("unclaim entry");
        assert_eq!(last.action, AuditAction::Unclaimed);
        assert_eq!(last.performed_by_id, SYSTEM_ACTOR_ID);
        assert!(
            h.db.ticket_store()
                .list_participants(joined.id)
                .await
                .expect("participants")
                .is_empty()
        );

        let names: Vec<&str> = h.drain().iter().map(DomainEvent::name).collect();
        assert_eq!(names, vec!["ticket.unclaimed", "ticket.userRemoved"]);
    }
}
