use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

use crate::db::manager::TxFailure;
use crate::db::schema_sqlite::{
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

const BUSY_TIMEOUT_MS: u32 = 5_000;

// Fixed-width UTC text so lexical comparison in SQL matches time order.
fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

fn optional_datetime(s: Option<&str>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.map(string_to_datetime).transpose()
}

#[derive(Debug, Clone, Queryable, Selectable)]
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
    created_at: String,
    updated_at: String,
}

impl DbGuild {
    fn to_settings(&self) -> Result<GuildSettings, DatabaseError> {
        Ok(GuildSettings {
            guild_id: self.guild_id.clone(),
            owner_id: self.owner_id.clone(),
            ticket_counter: self.ticket_counter,
            allow_users_to_close: self.allow_users_to_close,
            archive_on_close: self.archive_on_close,
            auto_close_enabled: self.auto_close_enabled,
            auto_close_after_hours: self.auto_close_after_hours,
            ticket_category_id: self.ticket_category_id.clone(),
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = guilds)]
struct NewGuildRow<'a> {
    guild_id: &'a str,
    owner_id: &'a str,
    ticket_counter: i64,
    allow_users_to_close: bool,
    archive_on_close: bool,
    auto_close_enabled: bool,
    auto_close_after_hours: i32,
    ticket_category_id: Option<&'a str>,
    created_at: String,
    updated_at: String,
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
    created_at: String,
    closed_at: Option<String>,
    last_activity_at: String,
}

impl DbTicket {
    fn to_ticket(&self) -> Result<Ticket, DatabaseError> {
        Ok(Ticket {
            id: self.id,
            guild_id: self.guild_id.clone(),
            number: self.number,
            channel_id: self.channel_id.clone(),
            opener_id: self.opener_id.clone(),
            claimed_by_id: self.claimed_by_id.clone(),
            subject: self.subject.clone(),
            panel_id: self.panel_id.clone(),
            status: self.status.parse()?,
            close_request_id: self.close_request_id.clone(),
            close_reason: self.close_reason.clone(),
            closed_by_id: self.closed_by_id.clone(),
            exclude_from_autoclose: self.exclude_from_autoclose,
            metadata: decode_json(self.metadata.clone())?,
            created_at: string_to_datetime(&self.created_at)?,
            closed_at: optional_datetime(self.closed_at.as_deref())?,
            last_activity_at: string_to_datetime(&self.last_activity_at)?,
        })
    }
}

fn to_tickets(rows: Vec<DbTicket>) -> Result<Vec<Ticket>, DatabaseError> {
    rows.iter().map(DbTicket::to_ticket).collect()
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
    created_at: String,
    last_activity_at: String,
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
    closed_at: Option<String>,
    last_activity_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = lifecycle_events)]
struct DbLifecycleEvent {
    id: i64,
    ticket_id: i64,
    action: String,
    performed_by_id: String,
    metadata: String,
    created_at: String,
}

impl DbLifecycleEvent {
    fn to_event(&self) -> Result<LifecycleEvent, DatabaseError> {
        Ok(LifecycleEvent {
            id: self.id,
            ticket_id: self.ticket_id,
            action: self.action.parse()?,
            performed_by_id: self.performed_by_id.clone(),
            metadata: decode_json(Some(self.metadata.clone()))?.unwrap_or_default(),
            created_at: string_to_datetime(&self.created_at)?,
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
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = ticket_participants)]
struct DbParticipant {
    id: i64,
    ticket_id: i64,
    user_id: String,
    added_by_id: String,
    added_at: String,
}

impl DbParticipant {
    fn to_participant(&self) -> Result<TicketParticipant, DatabaseError> {
        Ok(TicketParticipant {
            id: self.id,
            ticket_id: self.ticket_id,
            user_id: self.user_id.clone(),
            added_by_id: self.added_by_id.clone(),
            added_at: string_to_datetime(&self.added_at)?,
        })
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
    created_at: String,
}

impl DbFeedback {
    fn to_feedback(&self) -> Result<TicketFeedback, DatabaseError> {
        Ok(TicketFeedback {
            id: self.id,
            ticket_id: self.ticket_id,
            rating: self.rating,
            comment: self.comment.clone(),
            submitted_by_id: self.submitted_by_id.clone(),
            created_at: string_to_datetime(&self.created_at)?,
        })
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
    created_at: String,
    updated_at: String,
}

impl DbGuildRole {
    fn to_role(&self) -> Result<GuildRole, DatabaseError> {
        Ok(GuildRole {
            id: self.id,
            guild_id: self.guild_id.clone(),
            name: self.name.clone(),
            permissions: self.permissions as u64,
            is_default: self.is_default,
            discord_role_id: self.discord_role_id.clone(),
            position: self.position,
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

fn to_roles(rows: Vec<DbGuildRole>) -> Result<Vec<GuildRole>, DatabaseError> {
    rows.iter().map(DbGuildRole::to_role).collect()
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
    created_at: String,
    updated_at: String,
}

#[derive(AsChangeset)]
#[diesel(table_name = guild_roles)]
#[diesel(treat_none_as_null = true)]
struct GuildRoleChanges<'a> {
    name: &'a str,
    permissions: i64,
    discord_role_id: Option<&'a str>,
    position: i32,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = role_members)]
struct DbRoleMember {
    id: i64,
    guild_role_id: i64,
    discord_id: String,
    assigned_at: String,
    assigned_by_id: Option<String>,
}

impl DbRoleMember {
    fn to_member(&self) -> Result<RoleMember, DatabaseError> {
        Ok(RoleMember {
            id: self.id,
            guild_role_id: self.guild_role_id,
            discord_id: self.discord_id.clone(),
            assigned_at: string_to_datetime(&self.assigned_at)?,
            assigned_by_id: self.assigned_by_id.clone(),
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = transcripts)]
struct DbTranscript {
    id: i64,
    ticket_id: i64,
    created_at: String,
}

impl DbTranscript {
    fn to_transcript(&self) -> Result<Transcript, DatabaseError> {
        Ok(Transcript {
            id: self.id,
            ticket_id: self.ticket_id,
            created_at: string_to_datetime(&self.created_at)?,
        })
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
    created_at: String,
    edited_at: Option<String>,
    deleted_at: Option<String>,
}

impl DbTicketMessage {
    fn to_message(&self) -> Result<TicketMessage, DatabaseError> {
        Ok(TicketMessage {
            id: self.id,
            transcript_id: self.transcript_id,
            message_id: self.message_id.clone(),
            author_id: self.author_id.clone(),
            content: self.content.clone(),
            embeds: decode_json(self.embeds.clone())?,
            attachments: decode_json(self.attachments.clone())?,
            message_type: self.message_type.parse()?,
            reference_id: self.reference_id.clone(),
            created_at: string_to_datetime(&self.created_at)?,
            edited_at: optional_datetime(self.edited_at.as_deref())?,
            deleted_at: optional_datetime(self.deleted_at.as_deref())?,
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
    created_at: String,
}

fn query_err(e: diesel::result::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

pub(crate) fn establish_connection(path: &str) -> Result<SqliteConnection, DatabaseError> {
    let mut conn = SqliteConnection::establish(path)
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;
    conn.batch_execute(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"))
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;
    Ok(conn)
}

async fn with_connection<T, F>(db_path: Arc<String>, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = establish_connection(&db_path)?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

pub(crate) async fn run_transaction<T, E, F>(db_path: Arc<String>, work: F) -> Result<T, E>
where
    T: Send + 'static,
    E: From<DatabaseError> + Send + 'static,
    F: FnOnce(&mut dyn TicketTx) -> Result<T, E> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = establish_connection(&db_path).map_err(E::from)?;
        conn.immediate_transaction::<T, TxFailure<E>, _>(|conn| {
            let mut tx = SqliteTicketTx { conn };
            work(&mut tx).map_err(TxFailure::Work)
        })
        .map_err(TxFailure::into_inner)
    })
    .await
    .map_err(|e| E::from(DatabaseError::Query(format!("database task failed: {e}"))))?
}

fn select_ticket(conn: &mut SqliteConnection, ticket_id: i64) -> Result<Option<Ticket>, DatabaseError> {
    tickets::table
        .filter(tickets::id.eq(ticket_id))
        .select(DbTicket::as_select())
        .first::<DbTicket>(conn)
        .optional()
        .map_err(query_err)?
        .map(|row| row.to_ticket())
        .transpose()
}

struct SqliteTicketTx<'a> {
    conn: &'a mut SqliteConnection,
}

// The surrounding BEGIN IMMEDIATE already excludes other writers, so the
// `lock_*` reads need no row-level locking clause here.
impl TicketTx for SqliteTicketTx<'_> {
    fn lock_guild(&mut self, guild_id: &str) -> Result<Option<GuildSettings>, DatabaseError> {
        guilds::table
            .filter(guilds::guild_id.eq(guild_id))
            .select(DbGuild::as_select())
            .first::<DbGuild>(self.conn)
            .optional()
            .map_err(query_err)?
            .map(|row| row.to_settings())
            .transpose()
    }

    fn next_ticket_number(&mut self, guild_id: &str) -> Result<i64, DatabaseError> {
        diesel::update(guilds::table.filter(guilds::guild_id.eq(guild_id)))
            .set(guilds::ticket_counter.eq(guilds::ticket_counter + 1))
            .execute(self.conn)
            .map_err(query_err)?;
        guilds::table
            .filter(guilds::guild_id.eq(guild_id))
            .select(guilds::ticket_counter)
            .first::<i64>(self.conn)
            .map_err(query_err)
    }

    fn insert_ticket(&mut self, ticket: &NewTicket) -> Result<Ticket, DatabaseError> {
        let created_at = datetime_to_string(&ticket.created_at);
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
            created_at: created_at.clone(),
            last_activity_at: created_at,
        };
        diesel::insert_into(tickets::table)
            .values(&row)
            .execute(self.conn)
            .map_err(query_err)?;

        tickets::table
            .filter(tickets::guild_id.eq(&ticket.guild_id))
            .filter(tickets::number.eq(ticket.number))
            .select(DbTicket::as_select())
            .first::<DbTicket>(self.conn)
            .map_err(query_err)?
            .to_ticket()
    }

    fn lock_ticket(&mut self, ticket_id: i64) -> Result<Option<Ticket>, DatabaseError> {
        select_ticket(self.conn, ticket_id)
    }

    fn lock_claimed_tickets(
        &mut self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<Vec<Ticket>, DatabaseError> {
        let rows = tickets::table
            .filter(tickets::guild_id.eq(guild_id))
            .filter(tickets::claimed_by_id.eq(user_id))
            .filter(tickets::status.eq_any(TicketStatus::ACTIVE))
            .order(tickets::id.asc())
            .select(DbTicket::as_select())
            .load::<DbTicket>(self.conn)
            .map_err(query_err)?;
        to_tickets(rows)
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

        let rows = tickets::table
            .filter(tickets::id.eq_any(ticket_ids))
            .filter(tickets::guild_id.eq(guild_id))
            .filter(tickets::status.eq_any(TicketStatus::ACTIVE))
            .order(tickets::id.asc())
            .select(DbTicket::as_select())
            .load::<DbTicket>(self.conn)
            .map_err(query_err)?;
        to_tickets(rows)
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
            closed_at: ticket.closed_at.as_ref().map(datetime_to_string),
            last_activity_at: datetime_to_string(&ticket.last_activity_at),
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
            created_at: datetime_to_string(&event.created_at),
        };
        diesel::insert_into(lifecycle_events::table)
            .values(&row)
            .execute(self.conn)
            .map_err(query_err)?;

        lifecycle_events::table
            .filter(lifecycle_events::ticket_id.eq(event.ticket_id))
            .order(lifecycle_events::id.desc())
            .select(DbLifecycleEvent::as_select())
            .first::<DbLifecycleEvent>(self.conn)
            .map_err(query_err)?
            .to_event()
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
                ticket_participants::added_at.eq(datetime_to_string(&at)),
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
                ticket_feedback::created_at.eq(datetime_to_string(&feedback.created_at)),
            ))
            .execute(self.conn)
            .map(|_| ())
            .map_err(query_err)
    }
}

pub struct SqliteGuildStore {
    db_path: Arc<String>,
}

impl SqliteGuildStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

fn select_guild(
    conn: &mut SqliteConnection,
    guild_id: &str,
) -> Result<Option<GuildSettings>, DatabaseError> {
    guilds::table
        .filter(guilds::guild_id.eq(guild_id))
        .select(DbGuild::as_select())
        .first::<DbGuild>(conn)
        .optional()
        .map_err(query_err)?
        .map(|row| row.to_settings())
        .transpose()
}

#[async_trait]
impl super::GuildStore for SqliteGuildStore {
    async fn get_guild(&self, guild_id: &str) -> Result<Option<GuildSettings>, DatabaseError> {
        let guild_id = guild_id.to_string();
        with_connection(self.db_path.clone(), move |conn| select_guild(conn, &guild_id)).await
    }

    async fn ensure_guild(
        &self,
        guild_id: &str,
        owner_id: &str,
    ) -> Result<GuildSettings, DatabaseError> {
        let guild_id = guild_id.to_string();
        let owner_id = owner_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            let now = Utc::now();
            let defaults = GuildSettings::new(&guild_id, &owner_id, now);
            let row = NewGuildRow {
                guild_id: &defaults.guild_id,
                owner_id: &defaults.owner_id,
                ticket_counter: defaults.ticket_counter,
                allow_users_to_close: defaults.allow_users_to_close,
                archive_on_close: defaults.archive_on_close,
                auto_close_enabled: defaults.auto_close_enabled,
                auto_close_after_hours: defaults.auto_close_after_hours,
                ticket_category_id: None,
                created_at: datetime_to_string(&now),
                updated_at: datetime_to_string(&now),
            };
            diesel::insert_into(guilds::table)
                .values(&row)
                .on_conflict(guilds::guild_id)
                .do_update()
                .set((
                    guilds::owner_id.eq(&owner_id),
                    guilds::updated_at.eq(datetime_to_string(&now)),
                ))
                .execute(conn)
                .map_err(query_err)?;

            select_guild(conn, &guild_id)?
                .ok_or_else(|| DatabaseError::NotFound(format!("guild {guild_id}")))
        })
        .await
    }

    async fn update_guild_settings(&self, settings: &GuildSettings) -> Result<(), DatabaseError> {
        let settings = settings.clone();
        with_connection(self.db_path.clone(), move |conn| {
            diesel::update(guilds::table.filter(guilds::guild_id.eq(&settings.guild_id)))
                .set((
                    guilds::owner_id.eq(&settings.owner_id),
                    guilds::allow_users_to_close.eq(settings.allow_users_to_close),
                    guilds::archive_on_close.eq(settings.archive_on_close),
                    guilds::auto_close_enabled.eq(settings.auto_close_enabled),
                    guilds::auto_close_after_hours.eq(settings.auto_close_after_hours),
                    guilds::ticket_category_id.eq(settings.ticket_category_id.as_deref()),
                    guilds::updated_at.eq(datetime_to_string(&Utc::now())),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(query_err)
        })
        .await
    }

    async fn list_guilds(&self) -> Result<Vec<GuildSettings>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            guilds::table
                .order(guilds::guild_id.asc())
                .select(DbGuild::as_select())
                .load::<DbGuild>(conn)
                .map_err(query_err)?
                .iter()
                .map(DbGuild::to_settings)
                .collect()
        })
        .await
    }
}

pub struct SqliteRoleStore {
    db_path: Arc<String>,
}

impl SqliteRoleStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

fn select_default_role(
    conn: &mut SqliteConnection,
    guild_id: &str,
    name: &str,
) -> Result<Option<GuildRole>, DatabaseError> {
    guild_roles::table
        .filter(guild_roles::guild_id.eq(guild_id))
        .filter(guild_roles::name.eq(name))
        .filter(guild_roles::is_default.eq(true))
        .select(DbGuildRole::as_select())
        .first::<DbGuildRole>(conn)
        .optional()
        .map_err(query_err)?
        .map(|row| row.to_role())
        .transpose()
}

#[async_trait]
impl super::RoleStore for SqliteRoleStore {
    async fn list_roles(&self, guild_id: &str) -> Result<Vec<GuildRole>, DatabaseError> {
        let guild_id = guild_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            let rows = guild_roles::table
                .filter(guild_roles::guild_id.eq(guild_id))
                .order((guild_roles::position.asc(), guild_roles::id.asc()))
                .select(DbGuildRole::as_select())
                .load::<DbGuildRole>(conn)
                .map_err(query_err)?;
            to_roles(rows)
        })
        .await
    }

    async fn get_role(&self, role_id: i64) -> Result<Option<GuildRole>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            guild_roles::table
                .filter(guild_roles::id.eq(role_id))
                .select(DbGuildRole::as_select())
                .first::<DbGuildRole>(conn)
                .optional()
                .map_err(query_err)?
                .map(|row| row.to_role())
                .transpose()
        })
        .await
    }

    async fn find_default_role(
        &self,
        guild_id: &str,
        name: &str,
    ) -> Result<Option<GuildRole>, DatabaseError> {
        let guild_id = guild_id.to_string();
        let name = name.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            select_default_role(conn, &guild_id, &name)
        })
        .await
    }

    async fn create_role(&self, role: &NewGuildRole) -> Result<GuildRole, DatabaseError> {
        let role = role.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let now = datetime_to_string(&Utc::now());
            let row = NewGuildRoleRow {
                guild_id: &role.guild_id,
                name: &role.name,
                permissions: role.permissions as i64,
                is_default: role.is_default,
                discord_role_id: role.discord_role_id.as_deref(),
                position: role.position,
                created_at: now.clone(),
                updated_at: now,
            };
            conn.transaction(|conn| {
                diesel::insert_into(guild_roles::table)
                    .values(&row)
                    .execute(conn)?;
                guild_roles::table
                    .filter(guild_roles::guild_id.eq(&role.guild_id))
                    .order(guild_roles::id.desc())
                    .select(DbGuildRole::as_select())
                    .first::<DbGuildRole>(conn)
            })
            .map_err(query_err)?
            .to_role()
        })
        .await
    }

    async fn ensure_default_role(&self, role: &NewGuildRole) -> Result<GuildRole, DatabaseError> {
        let role = role.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let now = datetime_to_string(&Utc::now());
            let row = NewGuildRoleRow {
                guild_id: &role.guild_id,
                name: &role.name,
                permissions: role.permissions as i64,
                is_default: true,
                discord_role_id: role.discord_role_id.as_deref(),
                position: role.position,
                created_at: now.clone(),
                updated_at: now,
            };
            diesel::insert_into(guild_roles::table)
                .values(&row)
                .on_conflict_do_nothing()
                .execute(conn)
                .map_err(query_err)?;

            select_default_role(conn, &role.guild_id, &role.name)?
                .ok_or_else(|| DatabaseError::NotFound(format!("default role {}", role.name)))
        })
        .await
    }

    async fn update_role(&self, role: &GuildRole) -> Result<(), DatabaseError> {
        let role = role.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let changes = GuildRoleChanges {
                name: &role.name,
                permissions: role.permissions as i64,
                discord_role_id: role.discord_role_id.as_deref(),
                position: role.position,
                updated_at: datetime_to_string(&Utc::now()),
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
        with_connection(self.db_path.clone(), move |conn| {
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
        let discord_id = discord_id.to_string();
        let assigned_by_id = assigned_by_id.map(str::to_string);
        with_connection(self.db_path.clone(), move |conn| {
            diesel::insert_into(role_members::table)
                .values((
                    role_members::guild_role_id.eq(role_id),
                    role_members::discord_id.eq(&discord_id),
                    role_members::assigned_at.eq(datetime_to_string(&Utc::now())),
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
        let discord_id = discord_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
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
        with_connection(self.db_path.clone(), move |conn| {
            role_members::table
                .filter(role_members::guild_role_id.eq(role_id))
                .order(role_members::id.asc())
                .select(DbRoleMember::as_select())
                .load::<DbRoleMember>(conn)
                .map_err(query_err)?
                .iter()
                .map(DbRoleMember::to_member)
                .collect()
        })
        .await
    }

    async fn roles_for_member(
        &self,
        guild_id: &str,
        discord_id: &str,
    ) -> Result<Vec<GuildRole>, DatabaseError> {
        let guild_id = guild_id.to_string();
        let discord_id = discord_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            let rows = guild_roles::table
                .inner_join(role_members::table)
                .filter(guild_roles::guild_id.eq(guild_id))
                .filter(role_members::discord_id.eq(discord_id))
                .order(guild_roles::position.asc())
                .select(DbGuildRole::as_select())
                .load::<DbGuildRole>(conn)
                .map_err(query_err)?;
            to_roles(rows)
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
        let guild_id = guild_id.to_string();
        let discord_role_ids = discord_role_ids.to_vec();
        with_connection(self.db_path.clone(), move |conn| {
            let rows = guild_roles::table
                .filter(guild_roles::guild_id.eq(guild_id))
                .filter(guild_roles::discord_role_id.eq_any(discord_role_ids))
                .order(guild_roles::position.asc())
                .select(DbGuildRole::as_select())
                .load::<DbGuildRole>(conn)
                .map_err(query_err)?;
            to_roles(rows)
        })
        .await
    }
}

pub struct SqliteTicketStore {
    db_path: Arc<String>,
}

impl SqliteTicketStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::TicketStore for SqliteTicketStore {
    async fn get_ticket(&self, ticket_id: i64) -> Result<Option<Ticket>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| select_ticket(conn, ticket_id)).await
    }

    async fn get_ticket_by_number(
        &self,
        guild_id: &str,
        number: i64,
    ) -> Result<Option<Ticket>, DatabaseError> {
        let guild_id = guild_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            tickets::table
                .filter(tickets::guild_id.eq(guild_id))
                .filter(tickets::number.eq(number))
                .select(DbTicket::as_select())
                .first::<DbTicket>(conn)
                .optional()
                .map_err(query_err)?
                .map(|row| row.to_ticket())
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
        let channel_id = channel_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            tickets::table
                .filter(tickets::channel_id.eq(channel_id))
                .order(tickets::id.desc())
                .select(DbTicket::as_select())
                .first::<DbTicket>(conn)
                .optional()
                .map_err(query_err)?
                .map(|row| row.to_ticket())
                .transpose()
        })
        .await
    }

    async fn count_tickets(&self, guild_id: &str) -> Result<i64, DatabaseError> {
        let guild_id = guild_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            tickets::table
                .filter(tickets::guild_id.eq(guild_id))
                .count()
                .get_result(conn)
                .map_err(query_err)
        })
        .await
    }

    async fn list_events(&self, ticket_id: i64) -> Result<Vec<LifecycleEvent>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            lifecycle_events::table
                .filter(lifecycle_events::ticket_id.eq(ticket_id))
                .order(lifecycle_events::id.asc())
                .select(DbLifecycleEvent::as_select())
                .load::<DbLifecycleEvent>(conn)
                .map_err(query_err)?
                .iter()
                .map(DbLifecycleEvent::to_event)
                .collect()
        })
        .await
    }

    async fn list_participants(
        &self,
        ticket_id: i64,
    ) -> Result<Vec<TicketParticipant>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            ticket_participants::table
                .filter(ticket_participants::ticket_id.eq(ticket_id))
                .order(ticket_participants::id.asc())
                .select(DbParticipant::as_select())
                .load::<DbParticipant>(conn)
                .map_err(query_err)?
                .iter()
                .map(DbParticipant::to_participant)
                .collect()
        })
        .await
    }

    async fn get_feedback(&self, ticket_id: i64) -> Result<Option<TicketFeedback>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            ticket_feedback::table
                .filter(ticket_feedback::ticket_id.eq(ticket_id))
                .select(DbFeedback::as_select())
                .first::<DbFeedback>(conn)
                .optional()
                .map_err(query_err)?
                .map(|row| row.to_feedback())
                .transpose()
        })
        .await
    }

    async fn list_active_tickets(
        &self,
        guild_id: Option<&str>,
    ) -> Result<Vec<Ticket>, DatabaseError> {
        let guild_id = guild_id.map(str::to_string);
        with_connection(self.db_path.clone(), move |conn| {
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
            to_tickets(rows)
        })
        .await
    }

    async fn list_tickets_missing_channel(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<Ticket>, DatabaseError> {
        let cutoff = datetime_to_string(&created_before);
        with_connection(self.db_path.clone(), move |conn| {
            let rows = tickets::table
                .filter(tickets::status.eq_any(TicketStatus::ACTIVE))
                .filter(tickets::channel_id.eq(""))
                .filter(tickets::created_at.lt(cutoff))
                .order(tickets::id.asc())
                .select(DbTicket::as_select())
                .load::<DbTicket>(conn)
                .map_err(query_err)?;
            to_tickets(rows)
        })
        .await
    }

    async fn list_inactive_tickets(
        &self,
        guild_id: &str,
        inactive_since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>, DatabaseError> {
        let guild_id = guild_id.to_string();
        let cutoff = datetime_to_string(&inactive_since);
        with_connection(self.db_path.clone(), move |conn| {
            let rows = tickets::table
                .filter(tickets::guild_id.eq(guild_id))
                .filter(tickets::status.eq_any(TicketStatus::ACTIVE))
                .filter(tickets::exclude_from_autoclose.eq(false))
                .filter(tickets::last_activity_at.lt(cutoff))
                .order(tickets::id.asc())
                .select(DbTicket::as_select())
                .load::<DbTicket>(conn)
                .map_err(query_err)?;
            to_tickets(rows)
        })
        .await
    }

    async fn touch_activity(&self, ticket_id: i64, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let at = datetime_to_string(&at);
        with_connection(self.db_path.clone(), move |conn| {
            diesel::update(
                tickets::table
                    .filter(tickets::id.eq(ticket_id))
                    .filter(tickets::last_activity_at.lt(&at)),
            )
            .set(tickets::last_activity_at.eq(&at))
            .execute(conn)
            .map(|_| ())
            .map_err(query_err)
        })
        .await
    }
}

pub struct SqliteTranscriptStore {
    db_path: Arc<String>,
}

impl SqliteTranscriptStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::TranscriptStore for SqliteTranscriptStore {
    async fn ensure_transcript(&self, ticket_id: i64) -> Result<Transcript, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            diesel::insert_into(transcripts::table)
                .values((
                    transcripts::ticket_id.eq(ticket_id),
                    transcripts::created_at.eq(datetime_to_string(&Utc::now())),
                ))
                .on_conflict_do_nothing()
                .execute(conn)
                .map_err(query_err)?;

            transcripts::table
                .filter(transcripts::ticket_id.eq(ticket_id))
                .select(DbTranscript::as_select())
                .first::<DbTranscript>(conn)
                .map_err(query_err)?
                .to_transcript()
        })
        .await
    }

    async fn append_message(&self, message: &NewTicketMessage) -> Result<bool, DatabaseError> {
        let message = message.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let row = NewTicketMessageRow {
                transcript_id: message.transcript_id,
                message_id: &message.message_id,
                author_id: &message.author_id,
                content: &message.content,
                embeds: encode_json(message.embeds.as_ref()),
                attachments: encode_json(message.attachments.as_ref()),
                message_type: message.message_type.as_str(),
                reference_id: message.reference_id.as_deref(),
                created_at: datetime_to_string(&message.created_at),
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
        let message_id = message_id.to_string();
        let content = content.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            diesel::update(ticket_messages::table.filter(ticket_messages::message_id.eq(message_id)))
                .set((
                    ticket_messages::content.eq(content),
                    ticket_messages::edited_at.eq(Some(datetime_to_string(&at))),
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
        let message_id = message_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            diesel::update(
                ticket_messages::table
                    .filter(ticket_messages::message_id.eq(message_id))
                    .filter(ticket_messages::deleted_at.is_null()),
            )
            .set(ticket_messages::deleted_at.eq(Some(datetime_to_string(&at))))
            .execute(conn)
            .map(|rows| rows > 0)
            .map_err(query_err)
        })
        .await
    }

    async fn list_messages(&self, ticket_id: i64) -> Result<Vec<TicketMessage>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            ticket_messages::table
                .inner_join(transcripts::table)
                .filter(transcripts::ticket_id.eq(ticket_id))
                .order(ticket_messages::id.asc())
                .select(DbTicketMessage::as_select())
                .load::<DbTicketMessage>(conn)
                .map_err(query_err)?
                .iter()
                .map(DbTicketMessage::to_message)
                .collect()
        })
        .await
    }
}
