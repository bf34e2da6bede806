use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DatabaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    /// Reserved in storage; no transition produces or consumes it.
    Pending,
    Open,
    Claimed,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Pending => "PENDING",
            TicketStatus::Open => "OPEN",
            TicketStatus::Claimed => "CLAIMED",
            TicketStatus::Closed => "CLOSED",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TicketStatus::Open | TicketStatus::Claimed)
    }

    pub const ACTIVE: [&'static str; 2] = ["OPEN", "CLAIMED"];
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(TicketStatus::Pending),
            "OPEN" => Ok(TicketStatus::Open),
            "CLAIMED" => Ok(TicketStatus::Claimed),
            "CLOSED" => Ok(TicketStatus::Closed),
            other => Err(DatabaseError::Query(format!("unknown ticket status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Claimed,
    Unclaimed,
    Closed,
    Transferred,
    AutoCloseExcluded,
    AutoCloseIncluded,
    CloseRequested,
    CloseRequestDenied,
    ChannelLinked,
    UserAdded,
    UserRemoved,
    FeedbackReceived,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::Claimed => "claimed",
            AuditAction::Unclaimed => "unclaimed",
            AuditAction::Closed => "closed",
            AuditAction::Transferred => "transferred",
            AuditAction::AutoCloseExcluded => "auto_close_excluded",
            AuditAction::AutoCloseIncluded => "auto_close_included",
            AuditAction::CloseRequested => "close_requested",
            AuditAction::CloseRequestDenied => "close_request_denied",
            AuditAction::ChannelLinked => "channel_linked",
            AuditAction::UserAdded => "user_added",
            AuditAction::UserRemoved => "user_removed",
            AuditAction::FeedbackReceived => "feedback_received",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let action = match value {
            "created" => AuditAction::Created,
            "claimed" => AuditAction::Claimed,
            "unclaimed" => AuditAction::Unclaimed,
            "closed" => AuditAction::Closed,
            "transferred" => AuditAction::Transferred,
            "auto_close_excluded" => AuditAction::AutoCloseExcluded,
            "auto_close_included" => AuditAction::AutoCloseIncluded,
            "close_requested" => AuditAction::CloseRequested,
            "close_request_denied" => AuditAction::CloseRequestDenied,
            "channel_linked" => AuditAction::ChannelLinked,
            "user_added" => AuditAction::UserAdded,
            "user_removed" => AuditAction::UserRemoved,
            "feedback_received" => AuditAction::FeedbackReceived,
            other => {
                return Err(DatabaseError::Query(format!("unknown audit action: {other}")));
            }
        };
        Ok(action)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    User,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::User => "user",
            MessageType::System => "system",
        }
    }
}

impl FromStr for MessageType {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(MessageType::User),
            "system" => Ok(MessageType::System),
            other => Err(DatabaseError::Query(format!("unknown message type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildSettings {
    pub guild_id: String,
    pub owner_id: String,
    pub ticket_counter: i64,
    pub allow_users_to_close: bool,
    pub archive_on_close: bool,
    pub auto_close_enabled: bool,
    pub auto_close_after_hours: i32,
    pub ticket_category_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GuildSettings {
    pub fn new(guild_id: &str, owner_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            guild_id: guild_id.to_string(),
            owner_id: owner_id.to_string(),
            ticket_counter: 0,
            allow_users_to_close: true,
            archive_on_close: false,
            auto_close_enabled: false,
            auto_close_after_hours: 72,
            ticket_category_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub guild_id: String,
    pub number: i64,
    /// Empty until the ticket channel has been created and linked.
    pub channel_id: String,
    pub opener_id: String,
    pub claimed_by_id: Option<String>,
    pub subject: Option<String>,
    pub panel_id: Option<String>,
    pub status: TicketStatus,
    pub close_request_id: Option<String>,
    pub close_reason: Option<String>,
    pub closed_by_id: Option<String>,
    pub exclude_from_autoclose: bool,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
}

impl Ticket {
    pub fn channel(&self) -> Option<&str> {
        if self.channel_id.is_empty() {
            None
        } else {
            Some(self.channel_id.as_str())
        }
    }

    pub fn is_claimed_by(&self, user_id: &str) -> bool {
        self.claimed_by_id.as_deref() == Some(user_id)
    }
}

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub guild_id: String,
    pub number: i64,
    pub opener_id: String,
    pub subject: Option<String>,
    pub panel_id: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: i64,
    pub ticket_id: i64,
    pub action: AuditAction,
    pub performed_by_id: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLifecycleEvent {
    pub ticket_id: i64,
    pub action: AuditAction,
    pub performed_by_id: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildRole {
    pub id: i64,
    pub guild_id: String,
    pub name: String,
    pub permissions: u64,
    pub is_default: bool,
    pub discord_role_id: Option<String>,
    pub position: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewGuildRole {
    pub guild_id: String,
    pub name: String,
    pub permissions: u64,
    pub is_default: bool,
    pub discord_role_id: Option<String>,
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleMember {
    pub id: i64,
    pub guild_role_id: i64,
    pub discord_id: String,
    pub assigned_at: DateTime<Utc>,
    pub assigned_by_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketParticipant {
    pub id: i64,
    pub ticket_id: i64,
    pub user_id: String,
    pub added_by_id: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketFeedback {
    pub id: i64,
    pub ticket_id: i64,
    pub rating: i32,
    pub comment: Option<String>,
    pub submitted_by_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTicketFeedback {
    pub ticket_id: i64,
    pub rating: i32,
    pub comment: Option<String>,
    pub submitted_by_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub id: i64,
    pub ticket_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketMessage {
    pub id: i64,
    pub transcript_id: i64,
    pub message_id: String,
    pub author_id: String,
    pub content: String,
    pub embeds: Option<Value>,
    pub attachments: Option<Value>,
    pub message_type: MessageType,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewTicketMessage {
    pub transcript_id: i64,
    pub message_id: String,
    pub author_id: String,
    pub content: String,
    pub embeds: Option<Value>,
    pub attachments: Option<Value>,
    pub message_type: MessageType,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn encode_json(value: Option<&Value>) -> Option<String> {
    value.map(Value::to_string)
}

pub(crate) fn decode_json(raw: Option<String>) -> Result<Option<Value>, DatabaseError> {
    raw.map(|raw| {
        serde_json::from_str(&raw)
            .map_err(|e| DatabaseError::Query(format!("invalid json column: {e}")))
    })
    .transpose()
}
