use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::DatabaseError;
use super::models::{
    GuildRole, GuildSettings, LifecycleEvent, NewGuildRole, NewLifecycleEvent, NewTicket,
    NewTicketFeedback, NewTicketMessage, RoleMember, Ticket, TicketFeedback, TicketMessage,
    TicketParticipant, Transcript,
};

#[async_trait]
pub trait GuildStore: Send + Sync {
    async fn get_guild(&self, guild_id: &str) -> Result<Option<GuildSettings>, DatabaseError>;
    /// Inserts default settings when the guild is unknown, otherwise refreshes the owner.
    async fn ensure_guild(
        &self,
        guild_id: &str,
        owner_id: &str,
    ) -> Result<GuildSettings, DatabaseError>;
    async fn update_guild_settings(&self, settings: &GuildSettings) -> Result<(), DatabaseError>;
    async fn list_guilds(&self) -> Result<Vec<GuildSettings>, DatabaseError>;
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn list_roles(&self, guild_id: &str) -> Result<Vec<GuildRole>, DatabaseError>;
    async fn get_role(&self, role_id: i64) -> Result<Option<GuildRole>, DatabaseError>;
    async fn find_default_role(
        &self,
        guild_id: &str,
        name: &str,
    ) -> Result<Option<GuildRole>, DatabaseError>;
    async fn create_role(&self, role: &NewGuildRole) -> Result<GuildRole, DatabaseError>;
    /// Inserts a default role unless one with the same name already exists.
    async fn ensure_default_role(&self, role: &NewGuildRole) -> Result<GuildRole, DatabaseError>;
    async fn update_role(&self, role: &GuildRole) -> Result<(), DatabaseError>;
    async fn delete_role(&self, role_id: i64) -> Result<(), DatabaseError>;
    async fn add_member(
        &self,
        role_id: i64,
        discord_id: &str,
        assigned_by_id: Option<&str>,
    ) -> Result<bool, DatabaseError>;
    async fn remove_member(&self, role_id: i64, discord_id: &str) -> Result<bool, DatabaseError>;
    async fn list_members(&self, role_id: i64) -> Result<Vec<RoleMember>, DatabaseError>;
    async fn roles_for_member(
        &self,
        guild_id: &str,
        discord_id: &str,
    ) -> Result<Vec<GuildRole>, DatabaseError>;
    async fn roles_for_discord_roles(
        &self,
        guild_id: &str,
        discord_role_ids: &[String],
    ) -> Result<Vec<GuildRole>, DatabaseError>;
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn get_ticket(&self, ticket_id: i64) -> Result<Option<Ticket>, DatabaseError>;
    async fn get_ticket_by_number(
        &self,
        guild_id: &str,
        number: i64,
    ) -> Result<Option<Ticket>, DatabaseError>;
    async fn get_ticket_by_channel(&self, channel_id: &str)
    -> Result<Option<Ticket>, DatabaseError>;
    async fn count_tickets(&self, guild_id: &str) -> Result<i64, DatabaseError>;
    async fn list_events(&self, ticket_id: i64) -> Result<Vec<LifecycleEvent>, DatabaseError>;
    async fn list_participants(
        &self,
        ticket_id: i64,
    ) -> Result<Vec<TicketParticipant>, DatabaseError>;
    async fn get_feedback(&self, ticket_id: i64) -> Result<Option<TicketFeedback>, DatabaseError>;
    /// Open and claimed tickets, optionally restricted to one guild.
    async fn list_active_tickets(
        &self,
        guild_id: Option<&str>,
    ) -> Result<Vec<Ticket>, DatabaseError>;
    async fn list_tickets_missing_channel(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Ticket>, DatabaseError>;
    async fn list_inactive_tickets(
        &self,
        guild_id: &str,
        inactive_since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>, DatabaseError>;
    async fn touch_activity(&self, ticket_id: i64, at: DateTime<Utc>) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn ensure_transcript(&self, ticket_id: i64) -> Result<Transcript, DatabaseError>;
    /// Returns `false` when a row for the same message id already exists.
    async fn append_message(&self, message: &NewTicketMessage) -> Result<bool, DatabaseError>;
    async fn mark_edited(
        &self,
        message_id: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
    async fn mark_deleted(&self, message_id: &str, at: DateTime<Utc>)
    -> Result<bool, DatabaseError>;
    async fn list_messages(&self, ticket_id: i64) -> Result<Vec<TicketMessage>, DatabaseError>;
}

/// Unit-of-work handle passed to [`crate::db::DatabaseManager::transaction`].
///
/// Every method runs on the connection holding the open transaction. The
/// `lock_*` methods take row locks on Postgres; SQLite transactions are
/// opened with `BEGIN IMMEDIATE`, which serializes writers for the whole file.
pub trait TicketTx {
    fn lock_guild(&mut self, guild_id: &str) -> Result<Option<GuildSettings>, DatabaseError>;
    fn next_ticket_number(&mut self, guild_id: &str) -> Result<i64, DatabaseError>;
    fn insert_ticket(&mut self, ticket: &NewTicket) -> Result<Ticket, DatabaseError>;
    fn lock_ticket(&mut self, ticket_id: i64) -> Result<Option<Ticket>, DatabaseError>;
    fn lock_claimed_tickets(
        &mut self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<Vec<Ticket>, DatabaseError>;
    fn lock_participant_tickets(
        &mut self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<Vec<Ticket>, DatabaseError>;
    fn update_ticket(&mut self, ticket: &Ticket) -> Result<(), DatabaseError>;
    fn append_event(&mut self, event: &NewLifecycleEvent) -> Result<LifecycleEvent, DatabaseError>;
    fn insert_participant(
        &mut self,
        ticket_id: i64,
        user_id: &str,
        added_by_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
    fn delete_participant(&mut self, ticket_id: i64, user_id: &str) -> Result<bool, DatabaseError>;
    fn feedback_exists(&mut self, ticket_id: i64) -> Result<bool, DatabaseError>;
    fn insert_feedback(&mut self, feedback: &NewTicketFeedback) -> Result<(), DatabaseError>;
}
