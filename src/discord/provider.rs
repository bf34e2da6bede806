//! Channel and message operations the lifecycle core needs from the chat
//! platform. The orchestrator only talks to [`ChannelProvider`]; the serenity
//! implementation lives in [`crate::discord::DiscordClient`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::GuildSettings;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout {
        operation: &'static str,
        elapsed_ms: u64,
    },
    #[error("bot is missing the {0} permission")]
    MissingPermission(String),
    #[error("{0} not found on the platform")]
    NotFound(String),
    #[error("platform error: {0}")]
    Platform(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// Everything needed to create one ticket channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketChannelRequest {
    pub guild_id: String,
    pub ticket_id: i64,
    pub ticket_number: i64,
    pub opener_id: String,
    pub name: String,
    pub topic: Option<String>,
    pub category_id: Option<String>,
    /// Discord roles granted access alongside the opener.
    pub support_role_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedChannel {
    pub channel_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonStyle {
    Primary,
    Secondary,
    Success,
    Danger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageButton {
    pub custom_id: String,
    pub label: String,
    pub style: ButtonStyle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: String,
    pub buttons: Vec<MessageButton>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            buttons: Vec::new(),
        }
    }

    pub fn with_button(
        mut self,
        custom_id: impl Into<String>,
        label: impl Into<String>,
        style: ButtonStyle,
    ) -> Self {
        self.buttons.push(MessageButton {
            custom_id: custom_id.into(),
            label: label.into(),
            style,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveOutcome {
    pub deleted: bool,
}

/// What the bot may do in a channel, read before acting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelCapabilities {
    pub view_channel: bool,
    pub send_messages: bool,
    pub embed_links: bool,
    pub manage_channels: bool,
}

impl ChannelCapabilities {
    pub fn full() -> Self {
        Self {
            view_channel: true,
            send_messages: true,
            embed_links: true,
            manage_channels: true,
        }
    }

    pub fn can_post(&self) -> bool {
        self.view_channel && self.send_messages
    }

    pub fn can_manage(&self) -> bool {
        self.view_channel && self.manage_channels
    }
}

#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Must be safe to retry; a failed attempt leaves no channel behind.
    async fn create_ticket_channel(
        &self,
        request: &TicketChannelRequest,
    ) -> Result<CreatedChannel, ProviderError>;

    async fn send_message(
        &self,
        channel_id: &str,
        message: &OutgoingMessage,
    ) -> Result<SentMessage, ProviderError>;

    /// Deletes the channel, or renames and locks it when the guild archives
    /// closed tickets.
    async fn archive_or_delete(
        &self,
        channel_id: &str,
        guild_id: &str,
        settings: &GuildSettings,
        actor_id: &str,
    ) -> Result<ArchiveOutcome, ProviderError>;

    async fn fetch_permission_snapshot(
        &self,
        channel_id: &str,
    ) -> Result<ChannelCapabilities, ProviderError>;

    async fn channel_exists(&self, channel_id: &str) -> Result<bool, ProviderError>;

    /// False only when the platform confirms the user is not in the guild.
    async fn is_guild_member(&self, guild_id: &str, user_id: &str) -> Result<bool, ProviderError>;

    /// Direct message to a user. Users with closed DMs surface as `Platform`.
    async fn notify_user(&self, user_id: &str, content: &str) -> Result<(), ProviderError>;

    async fn set_member_access(
        &self,
        channel_id: &str,
        user_id: &str,
        allowed: bool,
    ) -> Result<(), ProviderError>;
}

/// Runs one provider call with an upper bound on its duration.
pub async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout {
            operation,
            elapsed_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}
