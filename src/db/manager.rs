use crate::config::{DatabaseConfig as ConfigDatabaseConfig, DbType as ConfigDbType};
use crate::db::{DatabaseError, GuildStore, RoleStore, TicketStore, TicketTx, TranscriptStore};
use std::sync::Arc;

#[cfg(feature = "postgres")]
use crate::db::postgres::{
    PostgresGuildStore, PostgresRoleStore, PostgresTicketStore, PostgresTranscriptStore,
};
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{
    SqliteGuildStore, SqliteRoleStore, SqliteTicketStore, SqliteTranscriptStore,
};

use diesel::RunQueryDsl;

/// Error carried out of a diesel transaction closure.
///
/// Diesel needs `From<diesel::result::Error>` on the closure error; the work
/// error is kept apart so callers get their own error type back untouched.
pub(crate) enum TxFailure<E> {
    Diesel(diesel::result::Error),
    Work(E),
}

impl<E> From<diesel::result::Error> for TxFailure<E> {
    fn from(value: diesel::result::Error) -> Self {
        TxFailure::Diesel(value)
    }
}

impl<E: From<DatabaseError>> TxFailure<E> {
    pub(crate) fn into_inner(self) -> E {
        match self {
            TxFailure::Diesel(e) => E::from(DatabaseError::from(e)),
            TxFailure::Work(e) => e,
        }
    }
}

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<Arc<String>>,
    guild_store: Arc<dyn GuildStore>,
    role_store: Arc<dyn RoleStore>,
    ticket_store: Arc<dyn TicketStore>,
    transcript_store: Arc<dyn TranscriptStore>,
    db_type: DbType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

impl From<ConfigDbType> for DbType {
    fn from(value: ConfigDbType) -> Self {
        match value {
            ConfigDbType::Postgres => DbType::Postgres,
            ConfigDbType::Sqlite => DbType::Sqlite,
        }
    }
}

impl DatabaseManager {
    pub async fn new(config: &ConfigDatabaseConfig) -> Result<Self, DatabaseError> {
        let db_type = DbType::from(config.db_type());

        match db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let manager = ConnectionManager::<PgConnection>::new(config.connection_string());

                let pool = r2d2::Pool::builder()
                    .max_size(config.max_connections().unwrap_or(10))
                    .min_idle(Some(config.min_connections().unwrap_or(1)))
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                Ok(Self {
                    guild_store: Arc::new(PostgresGuildStore::new(pool.clone())),
                    role_store: Arc::new(PostgresRoleStore::new(pool.clone())),
                    ticket_store: Arc::new(PostgresTicketStore::new(pool.clone())),
                    transcript_store: Arc::new(PostgresTranscriptStore::new(pool.clone())),
                    postgres_pool: Some(pool),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    db_type,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config.sqlite_path().ok_or_else(|| {
                    DatabaseError::Connection("sqlite path missing from configuration".to_string())
                })?;
                let path = Arc::new(path);

                Ok(Self {
                    guild_store: Arc::new(SqliteGuildStore::new(path.clone())),
                    role_store: Arc::new(SqliteRoleStore::new(path.clone())),
                    ticket_store: Arc::new(SqliteTicketStore::new(path.clone())),
                    transcript_store: Arc::new(SqliteTranscriptStore::new(path.clone())),
                    #[cfg(feature = "postgres")]
                    postgres_pool: None,
                    sqlite_path: Some(path),
                    db_type,
                })
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match self.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => Self::migrate_postgres(self.pool()?).await,
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => Self::migrate_sqlite(self.path()?).await,
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Migration(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Migration(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    /// Runs `work` inside one database transaction and commits when it
    /// returns `Ok`.
    ///
    /// The closure is synchronous and runs on the blocking pool, so no
    /// provider call can be made while the transaction is open.
    pub async fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<DatabaseError> + Send + 'static,
        F: FnOnce(&mut dyn TicketTx) -> Result<T, E> + Send + 'static,
    {
        match self.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let pool = self.pool().map_err(E::from)?;
                crate::db::postgres::run_transaction(pool, work).await
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = self.path().map_err(E::from)?;
                crate::db::sqlite::run_transaction(path, work).await
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(E::from(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            ))),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(E::from(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            ))),
        }
    }

    #[cfg(feature = "postgres")]
    fn pool(&self) -> Result<Pool, DatabaseError> {
        self.postgres_pool
            .clone()
            .ok_or_else(|| DatabaseError::Connection("postgres pool not initialized".to_string()))
    }

    #[cfg(feature = "sqlite")]
    fn path(&self) -> Result<Arc<String>, DatabaseError> {
        self.sqlite_path
            .clone()
            .ok_or_else(|| DatabaseError::Connection("sqlite path not initialized".to_string()))
    }

    #[cfg(feature = "postgres")]
    async fn migrate_postgres(pool: Pool) -> Result<(), DatabaseError> {
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS guilds (
                    guild_id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    ticket_counter BIGINT NOT NULL DEFAULT 0,
                    allow_users_to_close BOOLEAN NOT NULL DEFAULT TRUE,
                    archive_on_close BOOLEAN NOT NULL DEFAULT FALSE,
                    auto_close_enabled BOOLEAN NOT NULL DEFAULT FALSE,
                    auto_close_after_hours INTEGER NOT NULL DEFAULT 72,
                    ticket_category_id TEXT,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS tickets (
                    id BIGSERIAL PRIMARY KEY,
                    guild_id TEXT NOT NULL REFERENCES guilds(guild_id),
                    number BIGINT NOT NULL,
                    channel_id TEXT NOT NULL DEFAULT '',
                    opener_id TEXT NOT NULL,
                    claimed_by_id TEXT,
                    subject TEXT,
                    panel_id TEXT,
                    status TEXT NOT NULL,
                    close_request_id TEXT,
                    close_reason TEXT,
                    closed_by_id TEXT,
                    exclude_from_autoclose BOOLEAN NOT NULL DEFAULT FALSE,
                    metadata TEXT,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    closed_at TIMESTAMP WITH TIME ZONE,
                    last_activity_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    UNIQUE (guild_id, number)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS lifecycle_events (
                    id BIGSERIAL PRIMARY KEY,
                    ticket_id BIGINT NOT NULL REFERENCES tickets(id),
                    action TEXT NOT NULL,
                    performed_by_id TEXT NOT NULL,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS ticket_participants (
                    id BIGSERIAL PRIMARY KEY,
                    ticket_id BIGINT NOT NULL REFERENCES tickets(id),
                    user_id TEXT NOT NULL,
                    added_by_id TEXT NOT NULL,
                    added_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    UNIQUE (ticket_id, user_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS ticket_feedback (
                    id BIGSERIAL PRIMARY KEY,
                    ticket_id BIGINT NOT NULL UNIQUE REFERENCES tickets(id),
                    rating INTEGER NOT NULL,
                    comment TEXT,
                    submitted_by_id TEXT NOT NULL,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS guild_roles (
                    id BIGSERIAL PRIMARY KEY,
                    guild_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    permissions BIGINT NOT NULL DEFAULT 0,
                    is_default BOOLEAN NOT NULL DEFAULT FALSE,
                    discord_role_id TEXT,
                    position INTEGER NOT NULL DEFAULT 0,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS role_members (
                    id BIGSERIAL PRIMARY KEY,
                    guild_role_id BIGINT NOT NULL REFERENCES guild_roles(id) ON DELETE CASCADE,
                    discord_id TEXT NOT NULL,
                    assigned_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    assigned_by_id TEXT,
                    UNIQUE (guild_role_id, discord_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS transcripts (
                    id BIGSERIAL PRIMARY KEY,
                    ticket_id BIGINT NOT NULL UNIQUE REFERENCES tickets(id),
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS ticket_messages (
                    id BIGSERIAL PRIMARY KEY,
                    transcript_id BIGINT NOT NULL REFERENCES transcripts(id),
                    message_id TEXT NOT NULL UNIQUE,
                    author_id TEXT NOT NULL,
                    content TEXT NOT NULL,
                    embeds TEXT,
                    attachments TEXT,
                    message_type TEXT NOT NULL,
                    reference_id TEXT,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    edited_at TIMESTAMP WITH TIME ZONE,
                    deleted_at TIMESTAMP WITH TIME ZONE
                )
                "#,
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_guild_roles_default_name ON guild_roles(guild_id, name) WHERE is_default",
                "CREATE INDEX IF NOT EXISTS idx_guild_roles_discord_role ON guild_roles(guild_id, discord_role_id)",
                "CREATE INDEX IF NOT EXISTS idx_role_members_discord_id ON role_members(discord_id)",
                "CREATE INDEX IF NOT EXISTS idx_tickets_guild_status ON tickets(guild_id, status)",
                "CREATE INDEX IF NOT EXISTS idx_tickets_channel_id ON tickets(channel_id)",
                "CREATE INDEX IF NOT EXISTS idx_tickets_claimed_by ON tickets(claimed_by_id)",
                "CREATE INDEX IF NOT EXISTS idx_lifecycle_events_ticket ON lifecycle_events(ticket_id)",
                "CREATE INDEX IF NOT EXISTS idx_ticket_participants_user ON ticket_participants(user_id)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    #[cfg(feature = "sqlite")]
    async fn migrate_sqlite(path: Arc<String>) -> Result<(), DatabaseError> {
        tokio::task::spawn_blocking(move || {
            let mut conn = crate::db::sqlite::establish_connection(&path)?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS guilds (
                    guild_id TEXT PRIMARY KEY NOT NULL,
                    owner_id TEXT NOT NULL,
                    ticket_counter INTEGER NOT NULL DEFAULT 0,
                    allow_users_to_close INTEGER NOT NULL DEFAULT 1,
                    archive_on_close INTEGER NOT NULL DEFAULT 0,
                    auto_close_enabled INTEGER NOT NULL DEFAULT 0,
                    auto_close_after_hours INTEGER NOT NULL DEFAULT 72,
                    ticket_category_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS tickets (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    guild_id TEXT NOT NULL REFERENCES guilds(guild_id),
                    number INTEGER NOT NULL,
                    channel_id TEXT NOT NULL DEFAULT '',
                    opener_id TEXT NOT NULL,
                    claimed_by_id TEXT,
                    subject TEXT,
                    panel_id TEXT,
                    status TEXT NOT NULL,
                    close_request_id TEXT,
                    close_reason TEXT,
                    closed_by_id TEXT,
                    exclude_from_autoclose INTEGER NOT NULL DEFAULT 0,
                    metadata TEXT,
                    created_at TEXT NOT NULL,
                    closed_at TEXT,
                    last_activity_at TEXT NOT NULL,
                    UNIQUE (guild_id, number)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS lifecycle_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ticket_id INTEGER NOT NULL REFERENCES tickets(id),
                    action TEXT NOT NULL,
                    performed_by_id TEXT NOT NULL,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS ticket_participants (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ticket_id INTEGER NOT NULL REFERENCES tickets(id),
                    user_id TEXT NOT NULL,
                    added_by_id TEXT NOT NULL,
                    added_at TEXT NOT NULL,
                    UNIQUE (ticket_id, user_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS ticket_feedback (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ticket_id INTEGER NOT NULL UNIQUE REFERENCES tickets(id),
                    rating INTEGER NOT NULL,
                    comment TEXT,
                    submitted_by_id TEXT NOT NULL,
                    created_at TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS guild_roles (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    guild_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    permissions INTEGER NOT NULL DEFAULT 0,
                    is_default INTEGER NOT NULL DEFAULT 0,
                    discord_role_id TEXT,
                    position INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS role_members (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    guild_role_id INTEGER NOT NULL REFERENCES guild_roles(id) ON DELETE CASCADE,
                    discord_id TEXT NOT NULL,
                    assigned_at TEXT NOT NULL,
                    assigned_by_id TEXT,
                    UNIQUE (guild_role_id, discord_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS transcripts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ticket_id INTEGER NOT NULL UNIQUE REFERENCES tickets(id),
                    created_at TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS ticket_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    transcript_id INTEGER NOT NULL REFERENCES transcripts(id),
                    message_id TEXT NOT NULL UNIQUE,
                    author_id TEXT NOT NULL,
                    content TEXT NOT NULL,
                    embeds TEXT,
                    attachments TEXT,
                    message_type TEXT NOT NULL,
                    reference_id TEXT,
                    created_at TEXT NOT NULL,
                    edited_at TEXT,
                    deleted_at TEXT
                )
                "#,
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_guild_roles_default_name ON guild_roles(guild_id, name) WHERE is_default = 1",
                "CREATE INDEX IF NOT EXISTS idx_guild_roles_discord_role ON guild_roles(guild_id, discord_role_id)",
                "CREATE INDEX IF NOT EXISTS idx_role_members_discord_id ON role_members(discord_id)",
                "CREATE INDEX IF NOT EXISTS idx_tickets_guild_status ON tickets(guild_id, status)",
                "CREATE INDEX IF NOT EXISTS idx_tickets_channel_id ON tickets(channel_id)",
                "CREATE INDEX IF NOT EXISTS idx_tickets_claimed_by ON tickets(claimed_by_id)",
                "CREATE INDEX IF NOT EXISTS idx_lifecycle_events_ticket ON lifecycle_events(ticket_id)",
                "CREATE INDEX IF NOT EXISTS idx_ticket_participants_user ON ticket_participants(user_id)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    pub fn guild_store(&self) -> Arc<dyn GuildStore> {
        self.guild_store.clone()
    }

    pub fn role_store(&self) -> Arc<dyn RoleStore> {
        self.role_store.clone()
    }

    pub fn ticket_store(&self) -> Arc<dyn TicketStore> {
        self.ticket_store.clone()
    }

    pub fn transcript_store(&self) -> Arc<dyn TranscriptStore> {
        self.transcript_store.clone()
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }
}
