//! Pure transition planning for the ticket status machine.
//!
//! ```text
//! OPEN ──claim──▶ CLAIMED
//!  ▲                │
//!  └──unclaim───────┘
//! OPEN | CLAIMED ──close──▶ CLOSED   (terminal; closing again is a no-op)
//! ```
//!
//! `PENDING` is stored but reserved: nothing moves into or out of it.
//! Planners never touch the database; the orchestrator applies the returned
//! change and its audit entry inside one transaction.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::db::{AuditAction, Ticket, TicketStatus};

use super::error::LifecycleError;

pub const REASON_CHANNEL_DELETED: &str = "channel deleted";
pub const REASON_OPENER_APPROVED: &str = "approved by opener";
pub const REASON_INACTIVITY: &str = "auto-closed due to inactivity";
pub const REASON_MEMBER_LEFT: &str = "member left guild";

/// A ticket mutation plus the audit entry that must accompany it.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub ticket: Ticket,
    pub action: AuditAction,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Apply(Change),
    /// Already in the requested state; nothing is written or emitted.
    Unchanged,
}

impl Plan {
    pub fn is_applied(&self) -> bool {
        matches!(self, Plan::Apply(_))
    }
}

fn invalid(action: &'static str, ticket: &Ticket) -> LifecycleError {
    LifecycleError::InvalidTransition {
        action,
        status: ticket.status,
    }
}

fn require_active(action: &'static str, ticket: &Ticket) -> Result<(), LifecycleError> {
    if ticket.status.is_active() {
        Ok(())
    } else {
        Err(invalid(action, ticket))
    }
}

pub fn plan_claim(
    ticket: &Ticket,
    claimer_id: &str,
    now: DateTime<Utc>,
) -> Result<Plan, LifecycleError> {
    match ticket.status {
        TicketStatus::Claimed if ticket.is_claimed_by(claimer_id) => Ok(Plan::Unchanged),
        TicketStatus::Claimed => Err(LifecycleError::AlreadyClaimed {
            claimed_by: ticket.claimed_by_id.clone().unwrap_or_default(),
        }),
        TicketStatus::Open => {
            let mut next = ticket.clone();
            next.status = TicketStatus::Claimed;
            next.claimed_by_id = Some(claimer_id.to_string());
            next.last_activity_at = now;
            Ok(Plan::Apply(Change {
                ticket: next,
                action: AuditAction::Claimed,
                metadata: json!({ "claimed_by": claimer_id }),
            }))
        }
        TicketStatus::Pending | TicketStatus::Closed => Err(invalid("claim", ticket)),
    }
}

/// Clears the claim. Callers decide whether the actor may do so.
pub fn plan_unclaim(
    ticket: &Ticket,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Plan, LifecycleError> {
    match ticket.status {
        TicketStatus::Claimed => {
            let previous = ticket.claimed_by_id.clone();
            let mut next = ticket.clone();
            next.status = TicketStatus::Open;
            next.claimed_by_id = None;
            next.last_activity_at = now;
            Ok(Plan::Apply(Change {
                ticket: next,
                action: AuditAction::Unclaimed,
                metadata: json!({ "previous_claimer": previous, "reason": reason }),
            }))
        }
        TicketStatus::Open => Err(LifecycleError::NotClaimed),
        TicketStatus::Pending | TicketStatus::Closed => Err(invalid("unclaim", ticket)),
    }
}

pub fn plan_transfer(
    ticket: &Ticket,
    from_user_id: &str,
    to_user_id: &str,
    now: DateTime<Utc>,
) -> Result<Plan, LifecycleError> {
    if from_user_id == to_user_id {
        return Err(LifecycleError::Validation(
            "cannot transfer a ticket to its current claimer".to_string(),
        ));
    }
    match ticket.status {
        TicketStatus::Claimed if ticket.is_claimed_by(from_user_id) => {
            let mut next = ticket.clone();
            next.claimed_by_id = Some(to_user_id.to_string());
            next.last_activity_at = now;
            Ok(Plan::Apply(Change {
                ticket: next,
                action: AuditAction::Transferred,
                metadata: json!({ "from": from_user_id, "to": to_user_id }),
            }))
        }
        TicketStatus::Claimed => Err(LifecycleError::Validation(format!(
            "ticket is not claimed by {from_user_id}"
        ))),
        TicketStatus::Open => Err(LifecycleError::NotClaimed),
        TicketStatus::Pending | TicketStatus::Closed => Err(invalid("transfer", ticket)),
    }
}

/// Closing a closed ticket is a successful no-op so racing closers agree.
pub fn plan_close(
    ticket: &Ticket,
    closed_by_id: &str,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Plan, LifecycleError> {
    match ticket.status {
        TicketStatus::Closed => Ok(Plan::Unchanged),
        TicketStatus::Pending => Err(invalid("close", ticket)),
        TicketStatus::Open | TicketStatus::Claimed => {
            let mut next = ticket.clone();
            next.status = TicketStatus::Closed;
            next.closed_at = Some(now);
            next.closed_by_id = Some(closed_by_id.to_string());
            next.close_reason = reason.map(str::to_string);
            next.close_request_id = None;
            Ok(Plan::Apply(Change {
                ticket: next,
                action: AuditAction::Closed,
                metadata: json!({
                    "reason": reason,
                    "claimed_by": ticket.claimed_by_id,
                    "previous_status": ticket.status.as_str(),
                }),
            }))
        }
    }
}

/// Opens a close request, superseding any outstanding one.
pub fn plan_request_close(
    ticket: &Ticket,
    request_id: &str,
    reason: Option<&str>,
) -> Result<Plan, LifecycleError> {
    require_active("request closing", ticket)?;
    let mut next = ticket.clone();
    next.close_request_id = Some(request_id.to_string());
    Ok(Plan::Apply(Change {
        ticket: next,
        action: AuditAction::CloseRequested,
        metadata: json!({
            "request_id": request_id,
            "superseded": ticket.close_request_id,
            "reason": reason,
        }),
    }))
}

/// A request id is valid only while it is the ticket's current request.
pub fn check_close_request(ticket: &Ticket, request_id: &str) -> Result<(), LifecycleError> {
    match ticket.close_request_id.as_deref() {
        Some(current) if current == request_id && ticket.status.is_active() => Ok(()),
        _ => Err(LifecycleError::StaleCloseRequest),
    }
}

pub fn plan_deny_close(ticket: &Ticket, request_id: &str) -> Result<Plan, LifecycleError> {
    check_close_request(ticket, request_id)?;
    let mut next = ticket.clone();
    next.close_request_id = None;
    Ok(Plan::Apply(Change {
        ticket: next,
        action: AuditAction::CloseRequestDenied,
        metadata: json!({ "request_id": request_id }),
    }))
}

pub fn plan_autoclose_exclusion(ticket: &Ticket, excluded: bool) -> Result<Plan, LifecycleError> {
    require_active("change auto-close on", ticket)?;
    if ticket.exclude_from_autoclose == excluded {
        return Ok(Plan::Unchanged);
    }
    let mut next = ticket.clone();
    next.exclude_from_autoclose = excluded;
    let action = if excluded {
        AuditAction::AutoCloseExcluded
    } else {
        AuditAction::AutoCloseIncluded
    };
    Ok(Plan::Apply(Change {
        ticket: next,
        action,
        metadata: json!({ "excluded": excluded }),
    }))
}

/// Records the channel created for a ticket, unless one is already linked.
pub fn plan_link_channel(ticket: &Ticket, channel_id: &str) -> Result<Plan, LifecycleError> {
    if channel_id.is_empty() {
        return Err(LifecycleError::Validation("channel id is empty".to_string()));
    }
    if ticket.channel().is_some() {
        return Ok(Plan::Unchanged);
    }
    let mut next = ticket.clone();
    next.channel_id = channel_id.to_string();
    Ok(Plan::Apply(Change {
        ticket: next,
        action: AuditAction::ChannelLinked,
        metadata: json!({ "channel_id": channel_id }),
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use test_case::test_case;

    pub(crate) fn ticket(status: TicketStatus, claimed_by: Option<&str>) -> Ticket {
        let now = Utc::now();
        Ticket {
            id: 42,
            guild_id: "g1".to_string(),
            number: 42,
            channel_id: "c42".to_string(),
            opener_id: "opener".to_string(),
            claimed_by_id: claimed_by.map(str::to_string),
            subject: None,
            panel_id: None,
            status,
            close_request_id: None,
            close_reason: None,
            closed_by_id: None,
            exclude_from_autoclose: false,
            metadata: None,
            created_at: now,
            closed_at: None,
            last_activity_at: now,
        }
    }

    #[test]
    fn claim_open_ticket() {
        let plan = plan_claim(&ticket(TicketStatus::Open, None), "staff", Utc::now()).expect("plan");
        let Plan::Apply(change) = plan else {
            panic!("expected a change");
        };
        assert_eq!(change.ticket.status, TicketStatus::Claimed);
        assert_eq!(change.ticket.claimed_by_id.as_deref(), Some("staff"));
        assert_eq!(change.action, AuditAction::Claimed);
    }

    #[test]
    fn claim_by_same_actor_is_noop() {
        let current = ticket(TicketStatus::Claimed, Some("staff"));
        assert_eq!(plan_claim(&current, "staff", Utc::now()).expect("plan"), Plan::Unchanged);
    }

    #[test]
    fn claim_by_other_actor_conflicts() {
        let current = ticket(TicketStatus::Claimed, Some("staff"));
        let err = plan_claim(&current, "other", Utc::now()).unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyClaimed { claimed_by } if claimed_by == "staff"));
    }

    #[test_case(TicketStatus::Closed ; "closed")]
    #[test_case(TicketStatus::Pending ; "pending")]
    fn claim_rejected_outside_active_states(status: TicketStatus) {
        let err = plan_claim(&ticket(status, None), "staff", Utc::now()).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { action: "claim", .. }));
    }

    #[test_case(TicketStatus::Open, None, "NotClaimed" ; "open")]
    #[test_case(TicketStatus::Closed, Some("staff"), "InvalidTransition" ; "closed")]
    #[test_case(TicketStatus::Pending, None, "InvalidTransition" ; "pending")]
    fn unclaim_rejections(status: TicketStatus, claimed_by: Option<&str>, expected: &str) {
        let err = plan_unclaim(&ticket(status, claimed_by), None, Utc::now()).unwrap_err();
        let actual = match err {
            LifecycleError::NotClaimed => "NotClaimed",
            LifecycleError::InvalidTransition { .. } => "InvalidTransition",
            _ => "other",
        };
        assert_eq!(actual, expected);
    }

    #[test]
    fn unclaim_reopens_ticket() {
        let plan = plan_unclaim(&ticket(TicketStatus::Claimed, Some("staff")), Some(REASON_MEMBER_LEFT), Utc::now())
            .expect("plan");
        let Plan::Apply(change) = plan else {
            panic!("expected a change");
        };
        assert_eq!(change.ticket.status, TicketStatus::Open);
        assert!(change.ticket.claimed_by_id.is_none());
        assert_eq!(change.metadata["previous_claimer"], "staff");
        assert_eq!(change.metadata["reason"], REASON_MEMBER_LEFT);
    }

    #[test]
    fn transfer_moves_claim() {
        let plan = plan_transfer(&ticket(TicketStatus::Claimed, Some("a")), "a", "b", Utc::now())
            .expect("plan");
        let Plan::Apply(change) = plan else {
            panic!("expected a change");
        };
        assert_eq!(change.ticket.claimed_by_id.as_deref(), Some("b"));
        assert_eq!(change.ticket.status, TicketStatus::Claimed);
        assert_eq!(change.action, AuditAction::Transferred);
    }

    #[test_case(TicketStatus::Claimed, Some("a"), "a", "a" ; "same user")]
    #[test_case(TicketStatus::Claimed, Some("c"), "a", "b" ; "wrong source")]
    #[test_case(TicketStatus::Open, None, "a", "b" ; "unclaimed")]
    #[test_case(TicketStatus::Closed, Some("a"), "a", "b" ; "closed")]
    fn transfer_rejections(status: TicketStatus, claimed_by: Option<&str>, from: &str, to: &str) {
        assert!(plan_transfer(&ticket(status, claimed_by), from, to, Utc::now()).is_err());
    }

    #[test_case(TicketStatus::Open ; "open")]
    #[test_case(TicketStatus::Claimed ; "claimed")]
    fn close_active_ticket(status: TicketStatus) {
        let mut current = ticket(status, Some("staff"));
        current.close_request_id = Some("req".to_string());
        let now = Utc::now();
        let plan = plan_close(&current, "opener", Some("resolved"), now).expect("plan");
        let Plan::Apply(change) = plan else {
            panic!("expected a change");
        };
        assert_eq!(change.ticket.status, TicketStatus::Closed);
        assert_eq!(change.ticket.closed_at, Some(now));
        assert_eq!(change.ticket.close_reason.as_deref(), Some("resolved"));
        assert!(change.ticket.close_request_id.is_none());
        assert_eq!(change.ticket.claimed_by_id.as_deref(), Some("staff"));
    }

    #[test]
    fn close_closed_ticket_is_noop() {
        let plan = plan_close(&ticket(TicketStatus::Closed, None), "x", None, Utc::now()).expect("plan");
        assert!(!plan.is_applied());
    }

    #[test]
    fn close_request_lifecycle() {
        let current = ticket(TicketStatus::Open, None);
        let Plan::Apply(first) = plan_request_close(&current, "r1", None).expect("first") else {
            panic!("expected a change");
        };
        let Plan::Apply(second) = plan_request_close(&first.ticket, "r2", None).expect("second") else {
            panic!("expected a change");
        };
        assert_eq!(second.metadata["superseded"], "r1");

        assert!(matches!(
            check_close_request(&second.ticket, "r1"),
            Err(LifecycleError::StaleCloseRequest)
        ));
        assert!(check_close_request(&second.ticket, "r2").is_ok());

        let Plan::Apply(denied) = plan_deny_close(&second.ticket, "r2").expect("deny") else {
            panic!("expected a change");
        };
        assert!(denied.ticket.close_request_id.is_none());
        assert_eq!(denied.ticket.status, TicketStatus::Open);
        assert!(matches!(
            plan_deny_close(&denied.ticket, "r2"),
            Err(LifecycleError::StaleCloseRequest)
        ));
    }

    #[test]
    fn close_request_on_closed_ticket_is_invalid() {
        assert!(plan_request_close(&ticket(TicketStatus::Closed, None), "r1", None).is_err());
    }

    #[test]
    fn autoclose_exclusion_toggles() {
        let current = ticket(TicketStatus::Open, None);
        assert_eq!(plan_autoclose_exclusion(&current, false).expect("plan"), Plan::Unchanged);
        let Plan::Apply(change) = plan_autoclose_exclusion(&current, true).expect("plan") else {
            panic!("expected a change");
        };
        assert_eq!(change.action, AuditAction::AutoCloseExcluded);
        assert!(change.ticket.exclude_from_autoclose);
    }

    #[test]
    fn link_channel_only_fills_blank_channel() {
        let mut blank = ticket(TicketStatus::Open, None);
        blank.channel_id.clear();
        assert!(plan_link_channel(&blank, "c1").expect("plan").is_applied());
        assert_eq!(
            plan_link_channel(&ticket(TicketStatus::Open, None), "c1").expect("plan"),
            Plan::Unchanged
        );
        assert!(plan_link_channel(&blank, "").is_err());
    }
}
