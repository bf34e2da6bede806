use thiserror::Error;

use crate::db::{DatabaseError, TicketStatus};
use crate::permissions::PermissionDenied;

pub const GENERIC_FAILURE_MESSAGE: &str = "Something went wrong, try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    Conflict,
    NotFound,
    Internal,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error(transparent)]
    PermissionDenied(#[from] PermissionDenied),
    #[error("user {0} is not a member of this guild")]
    NotGuildMember(String),
    #[error("only the ticket opener can do that")]
    NotOpener,
    #[error("ticket is already claimed by {claimed_by}")]
    AlreadyClaimed { claimed_by: String },
    #[error("ticket is not claimed")]
    NotClaimed,
    #[error("close request is no longer valid")]
    StaleCloseRequest,
    #[error("feedback was already submitted for this ticket")]
    FeedbackExists,
    #[error("cannot {action} a ticket in status {status}")]
    InvalidTransition {
        action: &'static str,
        status: TicketStatus,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Database(DatabaseError),
}

impl From<DatabaseError> for LifecycleError {
    fn from(value: DatabaseError) -> Self {
        match value {
            DatabaseError::NotFound(what) => LifecycleError::NotFound(what),
            other => LifecycleError::Database(other),
        }
    }
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::Validation(_) => ErrorKind::Validation,
            LifecycleError::PermissionDenied(_)
            | LifecycleError::NotGuildMember(_)
            | LifecycleError::NotOpener => ErrorKind::Authorization,
            LifecycleError::AlreadyClaimed { .. }
            | LifecycleError::NotClaimed
            | LifecycleError::StaleCloseRequest
            | LifecycleError::FeedbackExists
            | LifecycleError::InvalidTransition { .. } => ErrorKind::Conflict,
            LifecycleError::NotFound(_) => ErrorKind::NotFound,
            LifecycleError::Database(_) => ErrorKind::Internal,
        }
    }

    /// Short text safe to show the person who triggered the operation.
    pub fn user_message(&self) -> String {
        match self {
            LifecycleError::Validation(reason) => format!("Invalid request: {reason}."),
            LifecycleError::PermissionDenied(denied) => format!(
                "You don't have permission to do that (missing {}).",
                denied.missing.names()
            ),
            LifecycleError::NotGuildMember(_) => {
                "You must be a member of this server to do that.".to_string()
            }
            LifecycleError::NotOpener => "Only the ticket opener can do that.".to_string(),
            LifecycleError::AlreadyClaimed { claimed_by } => {
                format!("This ticket is already claimed by <@{claimed_by}>.")
            }
            LifecycleError::NotClaimed => "This ticket is not claimed.".to_string(),
            LifecycleError::StaleCloseRequest => {
                "This close request is no longer valid.".to_string()
            }
            LifecycleError::FeedbackExists => {
                "Feedback for this ticket was already submitted.".to_string()
            }
            LifecycleError::InvalidTransition { status, .. } => match status {
                TicketStatus::Closed => "This ticket is already closed.".to_string(),
                _ => "That action isn't available for this ticket right now.".to_string(),
            },
            LifecycleError::NotFound(what) => format!("The {what} could not be found."),
            LifecycleError::Database(_) => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PermissionFlags;

    #[test]
    fn permission_denied_names_missing_flag() {
        let err = LifecycleError::from(PermissionDenied {
            missing: PermissionFlags::TICKET_CLOSE_ANY,
        });
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert!(err.user_message().contains("TICKET_CLOSE_ANY"));
    }

    #[test]
    fn database_failures_stay_generic() {
        let err = LifecycleError::from(DatabaseError::Query("syntax error at or near".to_string()));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.user_message(), GENERIC_FAILURE_MESSAGE);
    }

    #[test]
    fn database_not_found_maps_to_not_found() {
        let err = LifecycleError::from(DatabaseError::NotFound("ticket".to_string()));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn already_claimed_mentions_claimer() {
        let err = LifecycleError::AlreadyClaimed {
            claimed_by: "42".to_string(),
        };
        assert_eq!(err.user_message(), "This ticket is already claimed by <@42>.");
    }
}
