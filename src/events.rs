//! Typed domain events published after a lifecycle transition commits.
//!
//! Listeners subscribe through [`EventBus::subscribe`]; each receives every
//! event published after it subscribed. Events that fail validation are
//! logged and dropped instead of being delivered.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const BUS_CAPACITY: usize = 256;
const MAX_FEEDBACK_COMMENT_LEN: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketCreated {
    pub ticket_id: i64,
    pub ticket_number: i64,
    pub guild_id: String,
    pub opener_id: String,
    pub channel_id: String,
    pub subject: Option<String>,
    pub panel_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketClosed {
    pub ticket_id: i64,
    pub ticket_number: i64,
    pub guild_id: String,
    pub closed_by_id: String,
    pub reason: Option<String>,
    pub channel_deleted: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketClaimed {
    pub ticket_id: i64,
    pub ticket_number: i64,
    pub guild_id: String,
    pub claimed_by_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketUnclaimed {
    pub ticket_id: i64,
    pub ticket_number: i64,
    pub guild_id: String,
    pub previous_claimer_id: Option<String>,
    pub unclaimed_by_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketTransferred {
    pub ticket_id: i64,
    pub ticket_number: i64,
    pub guild_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub transferred_by_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantChanged {
    pub ticket_id: i64,
    pub ticket_number: i64,
    pub guild_id: String,
    pub user_id: String,
    pub performed_by_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackReceived {
    pub ticket_id: i64,
    pub ticket_number: i64,
    pub guild_id: String,
    pub submitted_by_id: String,
    pub rating: i32,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    #[serde(rename = "ticket.created")]
    Created(TicketCreated),
    #[serde(rename = "ticket.closed")]
    Closed(TicketClosed),
    #[serde(rename = "ticket.claimed")]
    Claimed(TicketClaimed),
    #[serde(rename = "ticket.unclaimed")]
    Unclaimed(TicketUnclaimed),
    #[serde(rename = "ticket.transferred")]
    Transferred(TicketTransferred),
    #[serde(rename = "ticket.userAdded")]
    UserAdded(ParticipantChanged),
    #[serde(rename = "ticket.userRemoved")]
    UserRemoved(ParticipantChanged),
    #[serde(rename = "ticket.feedbackReceived")]
    FeedbackReceived(FeedbackReceived),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventValidationError {
    #[error("{event}: field {field} is required")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },
    #[error("{event}: field {field} is out of range ({value})")]
    OutOfRange {
        event: &'static str,
        field: &'static str,
        value: String,
    },
}

fn require_text(
    event: &'static str,
    field: &'static str,
    value: &str,
) -> Result<(), EventValidationError> {
    if value.trim().is_empty() {
        Err(EventValidationError::MissingField { event, field })
    } else {
        Ok(())
    }
}

fn require_positive(
    event: &'static str,
    field: &'static str,
    value: i64,
) -> Result<(), EventValidationError> {
    if value > 0 {
        Ok(())
    } else {
        Err(EventValidationError::OutOfRange {
            event,
            field,
            value: value.to_string(),
        })
    }
}

fn require_ticket(
    event: &'static str,
    ticket_id: i64,
    ticket_number: i64,
    guild_id: &str,
) -> Result<(), EventValidationError> {
    require_positive(event, "ticketId", ticket_id)?;
    require_positive(event, "ticketNumber", ticket_number)?;
    require_text(event, "guildId", guild_id)
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::Created(_) => "ticket.created",
            DomainEvent::Closed(_) => "ticket.closed",
            DomainEvent::Claimed(_) => "ticket.claimed",
            DomainEvent::Unclaimed(_) => "ticket.unclaimed",
            DomainEvent::Transferred(_) => "ticket.transferred",
            DomainEvent::UserAdded(_) => "ticket.userAdded",
            DomainEvent::UserRemoved(_) => "ticket.userRemoved",
            DomainEvent::FeedbackReceived(_) => "ticket.feedbackReceived",
        }
    }

    pub fn ticket_id(&self) -> i64 {
        match self {
            DomainEvent::Created(e) => e.ticket_id,
            DomainEvent::Closed(e) => e.ticket_id,
            DomainEvent::Claimed(e) => e.ticket_id,
            DomainEvent::Unclaimed(e) => e.ticket_id,
            DomainEvent::Transferred(e) => e.ticket_id,
            DomainEvent::UserAdded(e) | DomainEvent::UserRemoved(e) => e.ticket_id,
            DomainEvent::FeedbackReceived(e) => e.ticket_id,
        }
    }

    /// Checks the payload against the event schema.
    pub fn validate(&self) -> Result<(), EventValidationError> {
        let event = self.name();
        match self {
            DomainEvent::Created(e) => {
                require_ticket(event, e.ticket_id, e.ticket_number, &e.guild_id)?;
                require_text(event, "openerId", &e.opener_id)?;
                require_text(event, "channelId", &e.channel_id)
            }
            DomainEvent::Closed(e) => {
                require_ticket(event, e.ticket_id, e.ticket_number, &e.guild_id)?;
                require_text(event, "closedById", &e.closed_by_id)
            }
            DomainEvent::Claimed(e) => {
                require_ticket(event, e.ticket_id, e.ticket_number, &e.guild_id)?;
                require_text(event, "claimedById", &e.claimed_by_id)
            }
            DomainEvent::Unclaimed(e) => {
                require_ticket(event, e.ticket_id, e.ticket_number, &e.guild_id)?;
                require_text(event, "unclaimedById", &e.unclaimed_by_id)
            }
            DomainEvent::Transferred(e) => {
                require_ticket(event, e.ticket_id, e.ticket_number, &e.guild_id)?;
                require_text(event, "fromUserId", &e.from_user_id)?;
                require_text(event, "toUserId", &e.to_user_id)?;
                require_text(event, "transferredById", &e.transferred_by_id)?;
                if e.from_user_id == e.to_user_id {
                    return Err(EventValidationError::OutOfRange {
                        event,
                        field: "toUserId",
                        value: e.to_user_id.clone(),
                    });
                }
                Ok(())
            }
            DomainEvent::UserAdded(e) | DomainEvent::UserRemoved(e) => {
                require_ticket(event, e.ticket_id, e.ticket_number, &e.guild_id)?;
                require_text(event, "userId", &e.user_id)?;
                require_text(event, "performedById", &e.performed_by_id)
            }
            DomainEvent::FeedbackReceived(e) => {
                require_ticket(event, e.ticket_id, e.ticket_number, &e.guild_id)?;
                require_text(event, "submittedById", &e.submitted_by_id)?;
                if !(1..=5).contains(&e.rating) {
                    return Err(EventValidationError::OutOfRange {
                        event,
                        field: "rating",
                        value: e.rating.to_string(),
                    });
                }
                if let Some(comment) = &e.comment
                    && comment.chars().count() > MAX_FEEDBACK_COMMENT_LEN
                {
                    return Err(EventValidationError::OutOfRange {
                        event,
                        field: "comment",
                        value: format!("{} chars", comment.chars().count()),
                    });
                }
                Ok(())
            }
        }
    }
}

/// In-process publish/subscribe for [`DomainEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Validates and delivers `event`. Returns whether it was accepted.
    pub fn publish(&self, event: DomainEvent) -> bool {
        if let Err(e) = event.validate() {
            error!("dropping invalid domain event: {}", e);
            #[cfg(feature = "metrics")]
            metrics::counter!("ticket_events_dropped_total", "type" => event.name()).increment(1);
            return false;
        }

        #[cfg(feature = "metrics")]
        metrics::counter!("ticket_events_published_total", "type" => event.name()).increment(1);

        // No subscribers is not an error.
        let _ = self.sender.send(event);
        true
    }
}

/// Logs every published event until the bus is dropped.
pub fn spawn_logging_listener(bus: &EventBus) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    info!(
                        "domain event type={} ticket_id={} payload={}",
                        event.name(),
                        event.ticket_id(),
                        payload
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event logging listener lagged, skipped={}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
