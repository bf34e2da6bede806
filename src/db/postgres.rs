use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;

use crate::db::manager::{Pool, TxFailure};
use crate::db::schema::{
    guild_roles, guilds, lifecycle_events, role_members, ticket_feedback, ticket_messages,
    ticket_participants, tickets, transcripts,
};

use super::{
    DatabaseError, TicketTx,
    models::{
        GuildRole, GuildSettings, LifecycleEvent, NewGuildRole, NewLifecycleEvent, NewTicket,
        NewTicketFeedback, NewTicketMessage, RoleMember, Ticket, TicketFeedback, TicketMessage,
        TicketParticipant, TicketStatus, Transcript, decode_json, encode_json,
    },
};

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = guilds)]
struct DbGuild {
    guild_id: String,
    owner_id: String,
    ticket_counter: i64,
    allow_users_to_close: bool,
    archive_on_close: bool,
    auto_close_enabled: bool,
    auto_close_after_hours: i32,
    ticket_category_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbGuild> for GuildSettings {
    fn from(value: DbGuild) -> Self {
        Self {
            guild_id: value.guild_id,
            owner_id: value.owner_id,
            ticket_counter: value.ticket_counter,
            allow_users_to_close: value.allow_users_to_close,
            archive_on_close: value.archive_on_close,
            auto_close_enabled: value.auto_close_enabled,
            auto_close_after_hours: value.auto_close_after_hours,
            ticket_category_id: value.ticket_category_id,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

impl From<&GuildSettings> for DbGuild {
    fn from(value: &GuildSettings) -> Self {
        Self {
            guild_id: value.guild_id.clone(),
            owner_id: value.owner_id.clone(),
            ticket_counter: value.ticket_counter,
            allow_users_to_close: value.allow_users_to_close,
            archive_on_close: value.archive_on_close,
            auto_close_enabled: value.auto_close_enabled,
            auto_close_after_hours: value.auto_close_after_hours,
            ticket_category_id: value.ticket_category_id.clone(),
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = tickets)]
struct DbTicket {
    id: i64,
    guild_id: String,
    number: i64,
    channel_id: String,
    opener_id: String,
    claimed_by_id: Option<String>,
    subject: Option<String>,
    panel_id: Option<String>,
    status: String,
    close_request_id: Option<String>,
    close_reason: Option<String>,
    closed_by_id: Option<String>,
    exclude_from_autoclose: bool,
    metadata: Option<String>,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    last_activity_at: DateTime<Utc>,
}

impl DbTicket {
    fn into_ticket(self) -> Result<Ticket, DatabaseError> {
        Ok(Ticket {
            id: self.id,
            guild_id: self.guild_id,
            number: self.number,
            channel_id: self.channel_id,
            opener_id: self.opener_id,
            claimed_by_id: self.claimed_by_id,
            subject: self.subject,
            panel_id: self.panel_id,
            status: self.status.parse()?,
            close_request_id: self.close_request_id,
            close_reason: self.close_reason,
            closed_by_id: self.closed_by_id,
            exclude_from_autoclose: self.exclude_from_autoclose,
            metadata: decode_json(self.metadata)?,
            created_at: self.created_at,
            closed_at: self.closed_at,
            last_activity_at: self.last_activity_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = tickets)]
struct NewTicketRow<'a> {
    guild_id: &'a str,
    number: i64,
    channel_id: &'a str,
    opener_id: &'a str,
    subject: Option<&'a str>,
    panel_id: Option<&'a str>,
    status: &'a str,
    exclude_from_autoclose: bool,
    metadata: Option<String>,
    created_at: &'a DateTime<Utc>,
    last_activity_at: &'a DateTime<Utc>,
}

#[derive(AsChangeset)]
#[diesel(table_name = tickets)]
#[diesel(treat_none_as_null = true)]
struct TicketChanges<'a> {
    channel_id: &'a str,
    claimed_by_id: Option<&'a str>,
    subject: Option<&'a str>,
    status: &'a str,
    close_request_id: Option<&'a str>,
    close_reason: Option<&'a str>,
    closed_by_id: Option<&'a str>,
    exclude_from_autoclose: bool,
    closed_at: Option<&'a DateTime<Utc>>,
    last_activity_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = lifecycle_events)]
struct DbLifecycleEvent {
    id: i64,
    ticket_id: i64,
    action: String,
    performed_by_id: String,
    metadata: String,
    created_at: DateTime<Utc>,
}

impl DbLifecycleEvent {
    fn into_event(self) -> Result<LifecycleEvent, DatabaseError> {
        Ok(LifecycleEvent {
            id: self.id,
            ticket_id: self.ticket_id,
            action: self.action.parse()?,
            performed_by_id: self.performed_by_id,
            metadata: decode_json(Some(self.metadata))?.unwrap_or_default(),
            created_at: self.created_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = lifecycle_events)]
struct NewLifecycleEventRow<'a> {
    ticket_id: i64,
    action: &'a str,
    performed_by_id: &'a str,
    metadata: String,
    created_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = ticket_participants)]
struct DbParticipant {
    id: i64,
    ticket_id: i64,
    user_id: String,
    added_by_id: String,
    added_at: DateTime<Utc>,
}

impl From<DbParticipant> for TicketParticipant {
    fn from(value: DbParticipant) -> Self {
        Self {
            id: value.id,
            ticket_id: value.ticket_id,
            user_id: value.user_id,
            added_by_id: value.added_by_id,
            added_at: value.added_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = ticket_feedback)]
struct DbFeedback {
    id: i64,
    ticket_id: i64,
    rating: i32,
    comment: Option<String>,
    submitted_by_id: String,
    created_at: DateTime<Utc>,
}

impl From<DbFeedback> for TicketFeedback {
    fn from(value: DbFeedback) -> Self {
        Self {
            id: value.id,
            ticket_id: value.ticket_id,
            rating: value.rating,
            comment: value.comment,
            submitted_by_id: value.submitted_by_id,
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = guild_roles)]
struct DbGuildRole {
    id: i64,
    guild_id: String,
    name: String,
    permissions: i64,
    is_default: bool,
    discord_role_id: Option<String>,
    position: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbGuildRole> for GuildRole {
    fn from(value: DbGuildRole) -> Self {
        Self {
            id: value.id,
            guild_id: value.guild_id,
            name: value.name,
            permissions: value.permissions as u64,
            is_default: value.is_default,
            discord_role_id: value.discord_role_id,
            position: value.position,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = guild_roles)]
struct NewGuildRoleRow<'a> {
    guild_id: &'a str,
    name: &'a str,
    permissions: i64,
    is_default: bool,
    discord_role_id: Option<&'a str>,
    position: i32,
    created_at: &'a DateTime<Utc>,
    updated_at: &'a DateTime<Utc>,
}

#[derive(AsChangeset)]
#[diesel(table_name = guild_roles)]
#[diesel(treat_none_as_null = true)]
struct GuildRoleChanges<'a> {
    name: &'a str,
    permissions: i64,
    discord_role_id: Option<&'a str>,
    position: i32,
    updated_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = role_members)]
struct DbRoleMember {
    id: i64,
    guild_role_id: i64,
    discord_id: String,
    assigned_at: DateTime<Utc>,
    assigned_by_id: Option<String>,
}

impl From<DbRoleMember> for RoleMember {
    fn from(value: DbRoleMember) -> Self {
        Self {
            id: value.id,
            guild_role_id: value.guild_role_id,
            discord_id: value.discord_id,
            assigned_at: value.assigned_at,
            assigned_by_id: value.assigned_by_id,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = transcripts)]
struct DbTranscript {
    id: i64,
    ticket_id: i64,
    created_at: DateTime<Utc>,
}

impl From<DbTranscript> for Transcript {
    fn from(value: DbTranscript) -> Self {
        Self {
            id: value.id,
            ticket_id: value.ticket_id,
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = ticket_messages)]
struct DbTicketMessage {
    id: i64,
    transcript_id: i64,
    message_id: String,
    author_id: String,
    content: String,
    embeds: Option<String>,
    attachments: Option<String>,
    message_type: String,
    reference_id: Option<String>,
    created_at: DateTime<Utc>,
    edited_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl DbTicketMessage {
    fn into_message(self) -> Result<TicketMessage, DatabaseError> {
        Ok(TicketMessage {
            id: self.id,
            transcript_id: self.transcript_id,
            message_id: self.message_id,
            author_id: self.author_id,
            content: self.content,
            embeds: decode_json(self.embeds)?,
            attachments: decode_json(self.attachments)?,
            message_type: self.message_type.parse()?,
            reference_id: self.reference_id,
            created_at: self.created_at,
            edited_at: self.edited_at,
            deleted_at: self.deleted_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = ticket_messages)]
struct NewTicketMessageRow<'a> {
    transcript_id: i64,
    message_id: &'a str,
    author_id: &'a str,
    content: &'a str,
    embeds: Option<String>,
    attachments: Option<String>,
    message_type: &'a str,
    reference_id: Option<&'a str>,
    created_at: &'a DateTime<Utc>,
}

fn query_err(e: diesel::result::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

async fn with_connection<T, F>(pool: Pool, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

pub(crate) async fn run_transaction<T, E, F>(pool: Pool, work: F) -> Result<T, E>
where
    T: Send + 'static,
    E: From<DatabaseError> + Send + 'static,
    F: FnOnce(&mut dyn TicketTx) -> Result<T, E> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut pooled = pool
            .get()
            .map_err(|e| E::from(DatabaseError::Connection(e.to_string())))?;
        let conn: &mut PgConnection = &mut pooled;
        conn.transaction::<T, TxFailure<E>, _>(|conn| {
            let mut tx = PgTicketTx { conn };
            work(&mut tx).map_err(TxFailure::Work)
        })
        .map_err(TxFailure::into_inner)
    })
    .await
    .map_err(|e| E::from(DatabaseError::Query(format!("database task failed: {e}"))))?
}

struct PgTicketTx<'a> {
    conn: &'a mut PgConnection,
}

impl TicketTx for PgTicketTx<'_> {
    fn lock_guild(&mut self, guild_id_value: &str) -> Result<Option<GuildSettings>, DatabaseError> {
        use crate::db::schema::guilds::dsl::*;
        guilds
            .filter(guild_id.eq(guild_id_value))
            .select(DbGuild::as_select())
            .for_update()
            .first::<DbGuild>(self.conn)
            .optional()
            .map(|value| value.map(Into::into))
            .map_err(query_err)
    }

    fn next_ticket_number(&mut self, guild_id_value: &str) -> Result<i64, DatabaseError> {
        use crate::db::schema::guilds::dsl::*;
        diesel::update(guilds.filter(guild_id.eq(guild_id_value)))
            .set(ticket_counter.eq(ticket_counter + 1))
            .returning(ticket_counter)
            .get_result::<i64>(self.conn)
            .map_err(query_err)
    }

    fn insert_ticket(&mut self, ticket: &NewTicket) -> Result<Ticket, DatabaseError> {
        let row = NewTicketRow {
            guild_id: &ticket.guild_id,
            number: ticket.number,
            channel_id: "",
            opener_id: &ticket.opener_id,
            subject: ticket.subject.as_deref(),
            panel_id: ticket.panel_id.as_deref(),
            status: TicketStatus::Open.as_str(),
            exclude_from_autoclose: false,
            metadata: encode_json(ticket.metadata.as_ref()),
            created_at: &ticket.created_at,
            last_activity_at: &ticket.created_at,
        };
        diesel::insert_into(tickets::table)
            .values(&row)
            .returning(DbTicket::as_returning())
            .get_result::<DbTicket>(self.conn)
            .map_err(query_err)?
            .into_ticket()
    }

    fn lock_ticket(&mut self, ticket_id: i64) -> Result<Option<Ticket>, DatabaseError> {
        tickets::table
            .filter(tickets::id.eq(ticket_id))
            .select(DbTicket::as_select())
            .for_update()
            .first::<DbTicket>(self.conn)
            .optional()
            .map_err(query_err)?
            .map(DbTicket::into_ticket)
            .transpose()
    }

    fn lock_claimed_tickets(
        &mut self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<Vec<Ticket>, DatabaseError> {
        tickets::table
            .filter(tickets::guild_id.eq(guild_id))
            .filter(tickets::claimed_by_id.eq(user_id))
            .filter(tickets::status.eq_any(TicketStatus::ACTIVE))
            .order(tickets::id.asc())
            .select(DbTicket::as_select())
            .for_update()
            .load::<DbTicket>(self.conn)
            .map_err(query_err)?
            .into_iter()
            .map(DbTicket::into_ticket)
            .collect()
    }

    fn lock_participant_tickets(
        &mut self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<Vec<Ticket>, DatabaseError> {
        let ticket_ids: Vec<i64> = ticket_participants::table
            .filter(ticket_participants::user_id.eq(user_id))
            .select(ticket_participants::ticket_id)
            .load(self.conn)
            .map_err(query_err)?;
        if ticket_ids.is_empty() {
            return Ok(Vec::new());
        }

        tickets::table
            .filter(tickets::id.eq_any(ticket_ids))
            .filter(tickets::guild_id.eq(guild_id))
            .filter(tickets::status.eq_any(TicketStatus::ACTIVE))
            .order(tickets::id.asc())
            .select(DbTicket::as_select())
            .for_update()
            .load::<DbTicket>(self.conn)
            .map_err(query_err)?
            .into_iter()
            .map(DbTicket::into_ticket)
            .collect()
    }

    fn update_ticket(&mut self, ticket: &Ticket) -> Result<(), DatabaseError> {
        let changes = TicketChanges {
            channel_id: &ticket.channel_id,
            claimed_by_id: ticket.claimed_by_id.as_deref(),
            subject: ticket.subject.as_deref(),
            status: ticket.status.as_str(),
            close_request_id: ticket.close_request_id.as_deref(),
            close_reason: ticket.close_reason.as_deref(),
            closed_by_id: ticket.closed_by_id.as_deref(),
            exclude_from_autoclose: ticket.exclude_from_autoclose,
            closed_at: ticket.closed_at.as_ref(),
            last_activity_at: &ticket.last_activity_at,
        };
        diesel::update(tickets::table.filter(tickets::id.eq(ticket.id)))
            .set(changes)
            .execute(self.conn)
            .map(|_| ())
            .map_err(query_err)
    }

    fn append_event(&mut self, event: &NewLifecycleEvent) -> Result<LifecycleEvent, DatabaseError> {
        let row = NewLifecycleEventRow {
            ticket_id: event.ticket_id,
            action: event.action.as_str(),
            performed_by_id: &event.performed_by_id,
            metadata: event.metadata.to_string(),
            created_at: &event.created_at,
        };
        diesel::insert_into(lifecycle_events::table)
            .values(&row)
            .returning(DbLifecycleEvent::as_returning())
            .get_result::<DbLifecycleEvent>(self.conn)
            .map_err(query_err)?
            .into_event()
    }

    fn insert_participant(
        &mut self,
        ticket_id: i64,
        user_id: &str,
        added_by_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        diesel::insert_into(ticket_participants::table)
            .values((
                ticket_participants::ticket_id.eq(ticket_id),
                ticket_participants::user_id.eq(user_id),
                ticket_participants::added_by_id.eq(added_by_id),
                ticket_participants::added_at.eq(at),
            ))
            .on_conflict_do_nothing()
            .execute(self.conn)
            .map(|rows| rows > 0)
            .map_err(query_err)
    }

    fn delete_participant(&mut self, ticket_id: i64, user_id: &str) -> Result<bool, DatabaseError> {
        diesel::delete(
            ticket_participants::table
                .filter(ticket_participants::ticket_id.eq(ticket_id))
                .filter(ticket_participants::user_id.eq(user_id)),
        )
        .execute(self.conn)
        .map(|rows| rows > 0)
        .map_err(query_err)
    }

    fn feedback_exists(&mut self, ticket_id: i64) -> Result<bool, DatabaseError> {
        ticket_feedback::table
            .filter(ticket_feedback::ticket_id.eq(ticket_id))
            .count()
            .get_result::<i64>(self.conn)
            .map(|count| count > 0)
            .map_err(query_err)
    }

    fn insert_feedback(&mut self, feedback: &NewTicketFeedback) -> Result<(), DatabaseError> {
        diesel::insert_into(ticket_feedback::table)
            .values((
                ticket_feedback::ticket_id.eq(feedback.ticket_id),
                ticket_feedback::rating.eq(feedback.rating),
                ticket_feedback::comment.eq(feedback.comment.as_deref()),
                ticket_feedback::submitted_by_id.eq(&feedback.submitted_by_id),
                ticket_feedback::created_at.eq(feedback.created_at),
            ))
            .execute(self.conn)
            .map(|_| ())
            .map_err(query_err)
    }
}

pub struct PostgresGuildStore {
    pool: Pool,
}

impl PostgresGuildStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::GuildStore for PostgresGuildStore {
    async fn get_guild(&self, guild_id: &str) -> Result<Option<GuildSettings>, DatabaseError> {
        let pool = self.pool.clone();
        let guild_id = guild_id.to_string();
        with_connection(pool, move |conn| {
            guilds::table
                .filter(guilds::guild_id.eq(guild_id))
                .select(DbGuild::as_select())
                .first::<DbGuild>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_err)
        })
        .await
    }

    async fn ensure_guild(
        &self,
        guild_id: &str,
        owner_id: &str,
    ) -> Result<GuildSettings, DatabaseError> {
        let pool = self.pool.clone();
        let guild_id = guild_id.to_string();
        let owner_id = owner_id.to_string();
        with_connection(pool, move |conn| {
            let now = Utc::now();
            let defaults = DbGuild::from(&GuildSettings::new(&guild_id, &owner_id, now));
            diesel::insert_into(guilds::table)
                .values(&defaults)
                .on_conflict(guilds::guild_id)
                .do_update()
                .set((
                    guilds::owner_id.eq(&owner_id),
                    guilds::updated_at.eq(now),
                ))
                .execute(conn)
                .map_err(query_err)?;

            guilds::table
                .filter(guilds::guild_id.eq(&guild_id))
                .select(DbGuild::as_select())
                .first::<DbGuild>(conn)
                .map(Into::into)
                .map_err(query_err)
        })
        .await
    }

    async fn update_guild_settings(&self, settings: &GuildSettings) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let mut row = DbGuild::from(settings);
        row.updated_at = Utc::now();
        with_connection(pool, move |conn| {
            diesel::update(guilds::table.filter(guilds::guild_id.eq(row.guild_id.clone())))
                .set((
                    guilds::owner_id.eq(&row.owner_id),
                    guilds::allow_users_to_close.eq(row.allow_users_to_close),
                    guilds::archive_on_close.eq(row.archive_on_close),
                    guilds::auto_close_enabled.eq(row.auto_close_enabled),
                    guilds::auto_close_after_hours.eq(row.auto_close_after_hours),
                    guilds::ticket_category_id.eq(row.ticket_category_id.as_deref()),
                    guilds::updated_at.eq(row.updated_at),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
    }

    async fn list_guilds(&self) -> Result<Vec<GuildSettings>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            guilds::table
                .order(guilds::guild_id.asc())
                .select(DbGuild::as_select())
                .load::<DbGuild>(conn)
                .map(|rows| rows.into_iter().map(Into::into).collect())
                .map_err(query_err)
        })
        .await
    }
}

pub struct PostgresRoleStore {
    pool: Pool,
}

impl PostgresRoleStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::RoleStore for PostgresRoleStore {
    async fn list_roles(&self, guild_id: &str) -> Result<Vec<GuildRole>, DatabaseError> {
        let pool = self.pool.clone();
        let guild_id = guild_id.to_string();
        with_connection(pool, move |conn| {
            guild_roles::table
                .filter(guild_roles::guild_id.eq(guild_id))
                .order((guild_roles::position.asc(), guild_roles::id.asc()))
                .select(DbGuildRole::as_select())
                .load::<DbGuildRole>(conn)
                .map(|rows| rows.into_iter().map(Into::into).collect())
                .map_err(query_err)
        })
        .await
    }

    async fn get_role(&self, role_id: i64) -> Result<Option<GuildRole>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            guild_roles::table
                .filter(guild_roles::id.eq(role_id))
                .select(DbGuildRole::as_select())
                .first::<DbGuildRole>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_err)
        })
        .await
    }

    async fn find_default_role(
        &self,
        guild_id: &str,
        name: &str,
    ) -> Result<Option<GuildRole>, DatabaseError> {
        let pool = self.pool.clone();
        let guild_id = guild_id.to_string();
        let name = name.to_string();
        with_connection(pool, move |conn| {
            guild_roles::table
                .filter(guild_roles::guild_id.eq(guild_id))
                .filter(guild_roles::name.eq(name))
                .filter(guild_roles::is_default.eq(true))
                .select(DbGuildRole::as_select())
                .first::<DbGuildRole>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_err)
        })
        .await
    }

    async fn create_role(&self, role: &NewGuildRole) -> Result<GuildRole, DatabaseError> {
        let pool = self.pool.clone();
        let role = role.clone();
        with_connection(pool, move |conn| {
            let now = Utc::now();
            let row = NewGuildRoleRow {
                guild_id: &role.guild_id,
                name: &role.name,
                permissions: role.permissions as i64,
                is_default: role.is_default,
                discord_role_id: role.discord_role_id.as_deref(),
                position: role.position,
                created_at: &now,
                updated_at: &now,
            };
            diesel::insert_into(guild_roles::table)
                .values(&row)
                .returning(DbGuildRole::as_returning())
                .get_result::<DbGuildRole>(conn)
                .map(Into::into)
                .map_err(query_err)
        })
        .await
    }

    async fn ensure_default_role(&self, role: &NewGuildRole) -> Result<GuildRole, DatabaseError> {
        let pool = self.pool.clone();
        let role = role.clone();
        with_connection(pool, move |conn| {
            let now = Utc::now();
            let row = NewGuildRoleRow {
                guild_id: &role.guild_id,
                name: &role.name,
                permissions: role.permissions as i64,
                is_default: true,
                discord_role_id: role.discord_role_id.as_deref(),
                position: role.position,
                created_at: &now,
                updated_at: &now,
            };
            diesel::insert_into(guild_roles::table)
                .values(&row)
                .on_conflict_do_nothing()
                .execute(conn)
                .map_err(query_err)?;

            guild_roles::table
                .filter(guild_roles::guild_id.eq(&role.guild_id))
                .filter(guild_roles::name.eq(&role.name))
                .filter(guild_roles::is_default.eq(true))
                .select(DbGuildRole::as_select())
                .first::<DbGuildRole>(conn)
                .map(Into::into)
                .map_err(query_err)
        })
        .await
    }

    async fn update_role(&self, role: &GuildRole) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let role = role.clone();
        with_connection(pool, move |conn| {
            let now = Utc::now();
            let changes = GuildRoleChanges {
                name: &role.name,
                permissions: role.permissions as i64,
                discord_role_id: role.discord_role_id.as_deref(),
                position: role.position,
                updated_at: &now,
            };
            diesel::update(guild_roles::table.filter(guild_roles::id.eq(role.id)))
                .set(changes)
                .execute(conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
    }

    async fn delete_role(&self, role_id: i64) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            conn.transaction(|conn| {
                diesel::delete(role_members::table.filter(role_members::guild_role_id.eq(role_id)))
                    .execute(conn)?;
                diesel::delete(guild_roles::table.filter(guild_roles::id.eq(role_id)))
                    .execute(conn)?;
                Ok::<_, diesel::result::Error>(())
            })
            .map_err(query_err)
        })
        .await
    }

    async fn add_member(
        &self,
        role_id: i64,
        discord_id: &str,
        assigned_by_id: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let pool = self.pool.clone();
        let discord_id = discord_id.to_string();
        let assigned_by_id = assigned_by_id.map(str::to_string);
        with_connection(pool, move |conn| {
            diesel::insert_into(role_members::table)
                .values((
                    role_members::guild_role_id.eq(role_id),
                    role_members::discord_id.eq(&discord_id),
                    role_members::assigned_at.eq(Utc::now()),
                    role_members::assigned_by_id.eq(assigned_by_id.as_deref()),
                ))
                .on_conflict_do_nothing()
                .execute(conn)
                .map(|rows| rows > 0)
                .map_err(query_err)
        })
        .await
    }

    async fn remove_member(&self, role_id: i64, discord_id: &str) -> Result<bool, DatabaseError> {
        let pool = self.pool.clone();
        let discord_id = discord_id.to_string();
        with_connection(pool, move |conn| {
            diesel::delete(
                role_members::table
                    .filter(role_members::guild_role_id.eq(role_id))
                    .filter(role_members::discord_id.eq(discord_id)),
            )
            .execute(conn)
            .map(|rows| rows > 0)
            .map_err(query_err)
        })
        .await
    }

    async fn list_members(&self, role_id: i64) -> Result<Vec<RoleMember>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            role_members::table
                .filter(role_members::guild_role_id.eq(role_id))
                .order(role_members::id.asc())
                .select(DbRoleMember::as_select())
                .load::<DbRoleMember>(conn)
                .map(|rows| rows.into_iter().map(Into::into).collect())
                .map_err(query_err)
        })
        .await
    }

    async fn roles_for_member(
        &self,
        guild_id: &str,
        discord_id: &str,
    ) -> Result<Vec<GuildRole>, DatabaseError> {
        let pool = self.pool.clone();
        let guild_id = guild_id.to_string();
        let discord_id = discord_id.to_string();
        with_connection(pool, move |conn| {
            guild_roles::table
                .inner_join(role_members::table)
                .filter(guild_roles::guild_id.eq(guild_id))
                .filter(role_members::discord_id.eq(discord_id))
                .order(guild_roles::position.asc())
                .select(DbGuildRole::as_select())
                .load::<DbGuildRole>(conn)
                .map(|rows| rows.into_iter().map(Into::into).collect())
                .map_err(query_err)
        })
        .await
    }

    async fn roles_for_discord_roles(
        &self,
        guild_id: &str,
        discord_role_ids: &[String],
    ) -> Result<Vec<GuildRole>, DatabaseError> {
        if discord_role_ids.is_empty() {
            return Ok(Vec::new());
        }
        let pool = self.pool.clone();
        let guild_id = guild_id.to_string();
        let discord_role_ids = discord_role_ids.to_vec();
        with_connection(pool, move |conn| {
            guild_roles::table
                .filter(guild_roles::guild_id.eq(guild_id))
                .filter(guild_roles::discord_role_id.eq_any(discord_role_ids))
                .order(guild_roles::position.asc())
                .select(DbGuildRole::as_select())
                .load::<DbGuildRole>(conn)
                .map(|rows| rows.into_iter().map(Into::into).collect())
                .map_err(query_err)
        })
        .await
    }
}

pub struct PostgresTicketStore {
    pool: Pool,
}

impl PostgresTicketStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn load_tickets(rows: Vec<DbTicket>) -> Result<Vec<Ticket>, DatabaseError> {
    rows.into_iter().map(DbTicket::into_ticket).collect()
}

#[async_trait]
impl super::TicketStore for PostgresTicketStore {
    async fn get_ticket(&self, ticket_id: i64) -> Result<Option<Ticket>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            tickets::table
                .filter(tickets::id.eq(ticket_id))
                .select(DbTicket::as_select())
                .first::<DbTicket>(conn)
                .optional()
                .map_err(query_err)?
                .map(DbTicket::into_ticket)
                .transpose()
        })
        .await
    }

    async fn get_ticket_by_number(
        &self,
        guild_id: &str,
        number: i64,
    ) -> Result<Option<Ticket>, DatabaseError> {
        let pool = self.pool.clone();
        let guild_id = guild_id.to_string();
        with_connection(pool, move |conn| {
            tickets::table
                .filter(tickets::guild_id.eq(guild_id))
                .filter(tickets::number.eq(number))
                .select(DbTicket::as_select())
                .first::<DbTicket>(conn)
                .optional()
                .map_err(query_err)?
                .map(DbTicket::into_ticket)
                .transpose()
        })
        .await
    }

    async fn get_ticket_by_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<Ticket>, DatabaseError> {
        if channel_id.is_empty() {
            return Ok(None);
        }
        let pool = self.pool.clone();
        let channel_id = channel_id.to_string();
        with_connection(pool, move |conn| {
            tickets::table
                .filter(tickets::channel_id.eq(channel_id))
                .order(tickets::id.desc())
                .select(DbTicket::as_select())
                .first::<DbTicket>(conn)
                .optional()
                .map_err(query_err)?
                .map(DbTicket::into_ticket)
                .transpose()
        })
        .await
    }

    async fn count_tickets(&self, guild_id: &str) -> Result<i64, DatabaseError> {
        let pool = self.pool.clone();
        let guild_id = guild_id.to_string();
        with_connection(pool, move |conn| {
            tickets::table
                .filter(tickets::guild_id.eq(guild_id))
                .count()
                .get_result(conn)
                .map_err(query_err)
        })
        .await
    }

    async fn list_events(&self, ticket_id: i64) -> Result<Vec<LifecycleEvent>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            lifecycle_events::table
                .filter(lifecycle_events::ticket_id.eq(ticket_id))
                .order(lifecycle_events::id.asc())
                .select(DbLifecycleEvent::as_select())
                .load::<DbLifecycleEvent>(conn)
                .map_err(query_err)?
                .into_iter()
                .map(DbLifecycleEvent::into_event)
                .collect()
        })
        .await
    }

    async fn list_participants(
        &self,
        ticket_id: i64,
    ) -> Result<Vec<TicketParticipant>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            ticket_participants::table
                .filter(ticket_participants::ticket_id.eq(ticket_id))
                .order(ticket_participants::id.asc())
                .select(DbParticipant::as_select())
                .load::<DbParticipant>(conn)
                .map(|rows| rows.into_iter().map(Into::into).collect())
                .map_err(query_err)
        })
        .await
    }

    async fn get_feedback(&self, ticket_id: i64) -> Result<Option<TicketFeedback>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            ticket_feedback::table
                .filter(ticket_feedback::ticket_id.eq(ticket_id))
                .select(DbFeedback::as_select())
                .first::<DbFeedback>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_err)
        })
        .await
    }

    async fn list_active_tickets(
        &self,
        guild_id: Option<&str>,
    ) -> Result<Vec<Ticket>, DatabaseError> {
        let pool = self.pool.clone();
        let guild_id = guild_id.map(str::to_string);
        with_connection(pool, move |conn| {
            let mut query = tickets::table
                .filter(tickets::status.eq_any(TicketStatus::ACTIVE))
                .into_boxed();
            if let Some(guild_id) = guild_id {
                query = query.filter(tickets::guild_id.eq(guild_id));
            }
            let rows = query
                .order(tickets::id.asc())
                .select(DbTicket::as_select())
                .load::<DbTicket>(conn)
                .map_err(query_err)?;
            load_tickets(rows)
        })
        .await
    }

    async fn list_tickets_missing_channel(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Ticket>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            let rows = tickets::table
                .filter(tickets::status.eq_any(TicketStatus::ACTIVE))
                .filter(tickets::channel_id.eq(""))
                .filter(tickets::created_at.lt(created_before))
                .order(tickets::id.asc())
                .select(DbTicket::as_select())
                .load::<DbTicket>(conn)
                .map_err(query_err)?;
            load_tickets(rows)
        })
        .await
    }

    async fn list_inactive_tickets(
        &self,
        guild_id: &str,
        inactive_since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>, DatabaseError> {
        let pool = self.pool.clone();
        let guild_id = guild_id.to_string();
        with_connection(pool, move |conn| {
            let rows = tickets::table
                .filter(tickets::guild_id.eq(guild_id))
                .filter(tickets::status.eq_any(TicketStatus::ACTIVE))
                .filter(tickets::exclude_from_autoclose.eq(false))
                .filter(tickets::last_activity_at.lt(inactive_since))
                .order(tickets::id.asc())
                .select(DbTicket::as_select())
                .load::<DbTicket>(conn)
                .map_err(query_err)?;
            load_tickets(rows)
        })
        .await
    }

    async fn touch_activity(&self, ticket_id: i64, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            diesel::update(
                tickets::table
                    .filter(tickets::id.eq(ticket_id))
                    .filter(tickets::last_activity_at.lt(at)),
            )
            .set(tickets::last_activity_at.eq(at))
            .execute(conn)
            .map(|_| ())
            .map_err(query_err)
        })
        .await
    }
}

pub struct PostgresTranscriptStore {
    pool: Pool,
}

impl PostgresTranscriptStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::TranscriptStore for PostgresTranscriptStore {
    async fn ensure_transcript(&self, ticket_id: i64) -> Result<Transcript, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            diesel::insert_into(transcripts::table)
                .values((
                    transcripts::ticket_id.eq(ticket_id),
                    transcripts::created_at.eq(Utc::now()),
                ))
                .on_conflict_do_nothing()
                .execute(conn)
                .map_err(query_err)?;

            transcripts::table
                .filter(transcripts::ticket_id.eq(ticket_id))
                .select(DbTranscript::as_select())
                .first::<DbTranscript>(conn)
                .map(Into::into)
                .map_err(query_err)
        })
        .await
    }

    async fn append_message(&self, message: &NewTicketMessage) -> Result<bool, DatabaseError> {
        let pool = self.pool.clone();
        let message = message.clone();
        with_connection(pool, move |conn| {
            let row = NewTicketMessageRow {
                transcript_id: message.transcript_id,
                message_id: &message.message_id,
                author_id: &message.author_id,
                content: &message.content,
                embeds: encode_json(message.embeds.as_ref()),
                attachments: encode_json(message.attachments.as_ref()),
                message_type: message.message_type.as_str(),
                reference_id: message.reference_id.as_deref(),
                created_at: &message.created_at,
            };
            diesel::insert_into(ticket_messages::table)
                .values(&row)
                .on_conflict_do_nothing()
                .execute(conn)
                .map(|rows| rows > 0)
                .map_err(query_err)
        })
        .await
    }

    async fn mark_edited(
        &self,
        message_id: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let pool = self.pool.clone();
        let message_id = message_id.to_string();
        let content = content.to_string();
        with_connection(pool, move |conn| {
            diesel::update(ticket_messages::table.filter(ticket_messages::message_id.eq(message_id)))
                .set((
                    ticket_messages::content.eq(content),
                    ticket_messages::edited_at.eq(Some(at)),
                ))
                .execute(conn)
                .map(|rows| rows > 0)
                .map_err(query_err)
        })
        .await
    }

    async fn mark_deleted(
        &self,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let pool = self.pool.clone();
        let message_id = message_id.to_string();
        with_connection(pool, move |conn| {
            diesel::update(
                ticket_messages::table
                    .filter(ticket_messages::message_id.eq(message_id))
                    .filter(ticket_messages::deleted_at.is_null()),
            )
            .set(ticket_messages::deleted_at.eq(Some(at)))
            .execute(conn)
            .map(|rows| rows > 0)
            .map_err(query_err)
        })
        .await
    }

    async fn list_messages(&self, ticket_id: i64) -> Result<Vec<TicketMessage>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            ticket_messages::table
                .inner_join(transcripts::table)
                .filter(transcripts::ticket_id.eq(ticket_id))
                .order(ticket_messages::id.asc())
                .select(DbTicketMessage::as_select())
                .load::<DbTicketMessage>(conn)
                .map_err(query_err)?
                .into_iter()
                .map(DbTicketMessage::into_message)
                .collect()
        })
        .await
    }
}
