pub use self::error::DatabaseError;
pub use self::manager::{DatabaseManager, DbType};
pub use self::models::{
    AuditAction, GuildRole, GuildSettings, LifecycleEvent, MessageType, NewGuildRole,
    NewLifecycleEvent, NewTicket, NewTicketFeedback, NewTicketMessage, RoleMember, Ticket,
    TicketFeedback, TicketMessage, TicketParticipant, TicketStatus, Transcript,
};
pub use self::stores::{GuildStore, RoleStore, TicketStore, TicketTx, TranscriptStore};

pub mod error;
pub mod manager;
pub mod models;
pub mod schema;
pub mod stores;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub mod schema_sqlite;

#[cfg(all(test, feature = "sqlite"))]
pub(crate) mod test_helpers;
