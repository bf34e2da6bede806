use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use secrecy::ExposeSecret;
use serenity::http::HttpError;
use serenity::all::{
    ButtonStyle as SerenityButtonStyle, ChannelId, ChannelType, Client as SerenityClient,
    CreateActionRow, CreateButton, CreateChannel, CreateMessage, EditChannel, GatewayIntents,
    GuildChannel, GuildId, Http, PermissionOverwrite, PermissionOverwriteType,
    Permissions, RoleId, UserId,
};
use tokio::sync::{Mutex as AsyncMutex, RwLock, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::app::TicketApp;
use crate::config::Config;
use crate::db::GuildSettings;

use self::handler::GatewayHandler;
use self::provider::{
    ArchiveOutcome, ButtonStyle, ChannelCapabilities, ChannelProvider, CreatedChannel,
    OutgoingMessage, ProviderError, SentMessage, TicketChannelRequest,
};

const INITIAL_LOGIN_RETRY_SECONDS: u64 = 2;
const MAX_LOGIN_RETRY_SECONDS: u64 = 300;
const READY_TIMEOUT_SECONDS: u64 = 30;

pub mod commands;
pub mod handler;
pub mod provider;

/// Permissions granted to everyone who may take part in a ticket.
fn participant_permissions() -> Permissions {
    Permissions::VIEW_CHANNEL
        | Permissions::SEND_MESSAGES
        | Permissions::READ_MESSAGE_HISTORY
        | Permissions::ATTACH_FILES
        | Permissions::EMBED_LINKS
}

fn bot_permissions() -> Permissions {
    participant_permissions() | Permissions::MANAGE_CHANNELS | Permissions::MANAGE_ROLES
}

fn parse_id(kind: &str, value: &str) -> Result<u64, ProviderError> {
    value
        .parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .ok_or_else(|| ProviderError::Platform(format!("invalid {kind} id: {value:?}")))
}

/// Maps a serenity failure onto the provider taxonomy by HTTP status.
fn provider_error(operation: &str, err: serenity::Error) -> ProviderError {
    if let serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) = &err {
        match response.status_code.as_u16() {
            404 => return ProviderError::NotFound(format!("{operation}: {}", response.error.message)),
            403 => {
                return ProviderError::MissingPermission(format!(
                    "{operation}: {}",
                    response.error.message
                ));
            }
            _ => {}
        }
    }
    ProviderError::Platform(format!("{operation}: {err}"))
}

fn capabilities_from(permissions: Permissions) -> ChannelCapabilities {
    if permissions.administrator() {
        return ChannelCapabilities::full();
    }
    ChannelCapabilities {
        view_channel: permissions.view_channel(),
        send_messages: permissions.send_messages(),
        embed_links: permissions.embed_links(),
        manage_channels: permissions.manage_channels(),
    }
}

fn button_style(style: ButtonStyle) -> SerenityButtonStyle {
    match style {
        ButtonStyle::Primary => SerenityButtonStyle::Primary,
        ButtonStyle::Secondary => SerenityButtonStyle::Secondary,
        ButtonStyle::Success => SerenityButtonStyle::Success,
        ButtonStyle::Danger => SerenityButtonStyle::Danger,
    }
}

fn build_message(message: &OutgoingMessage) -> CreateMessage {
    let builder = CreateMessage::new().content(&message.content);
    if message.buttons.is_empty() {
        return builder;
    }
    let buttons = message
        .buttons
        .iter()
        .map(|button| {
            CreateButton::new(&button.custom_id)
                .label(&button.label)
                .style(button_style(button.style))
        })
        .collect();
    builder.components(vec![CreateActionRow::Buttons(buttons)])
}

fn archived_name(prefix: &str, current: &str) -> String {
    if current.starts_with(prefix) {
        current.to_string()
    } else {
        format!("{prefix}{current}")
    }
}

#[derive(Default)]
struct DiscordLoginState {
    is_logged_in: bool,
    gateway_task: Option<tokio::task::JoinHandle<()>>,
}

/// Serenity-backed [`ChannelProvider`] plus the gateway connection.
///
/// Constructed once at startup; `connect` and `shutdown` bracket the gateway
/// lifetime. REST calls made before the first Ready event fail with a
/// platform error.
#[derive(Clone)]
pub struct DiscordClient {
    config: Arc<Config>,
    login_state: Arc<AsyncMutex<DiscordLoginState>>,
    app: Arc<RwLock<Option<Arc<TicketApp>>>>,
    http: Arc<RwLock<Option<Arc<Http>>>>,
    bot_user: Arc<RwLock<Option<UserId>>>,
    gateway_closed: Arc<watch::Sender<bool>>,
}

impl DiscordClient {
    pub fn new(config: Arc<Config>) -> Self {
        info!("initializing discord client");
        let (gateway_closed, _) = watch::channel(false);
        Self {
            config,
            login_state: Arc::new(AsyncMutex::new(DiscordLoginState::default())),
            app: Arc::new(RwLock::new(None)),
            http: Arc::new(RwLock::new(None)),
            bot_user: Arc::new(RwLock::new(None)),
            gateway_closed: Arc::new(gateway_closed),
        }
    }

    /// Binds the application that gateway events are dispatched to.
    pub async fn set_app(&self, app: Arc<TicketApp>) {
        *self.app.write().await = Some(app);
    }

    async fn login(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if state.is_logged_in {
            return Ok(());
        }

        let intents = if self.config.discord.use_privileged_intents {
            GatewayIntents::non_privileged()
                | GatewayIntents::GUILD_MEMBERS
                | GatewayIntents::MESSAGE_CONTENT
        } else {
            GatewayIntents::non_privileged()
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let handler = GatewayHandler {
            ready_sender: Arc::new(AsyncMutex::new(Some(ready_tx))),
            app: self.app.clone(),
            http: self.http.clone(),
            bot_user: self.bot_user.clone(),
            register_commands: self.config.discord.register_commands,
        };

        let mut gateway_client =
            SerenityClient::builder(self.config.discord.bot_token.expose_secret(), intents)
                .event_handler(handler)
                .await
                .map_err(|err| anyhow!("failed to build discord gateway client: {err}"))?;

        self.gateway_closed.send_replace(false);
        let closed = self.gateway_closed.clone();
        let gateway_task = tokio::spawn(async move {
            if let Err(err) = gateway_client.start_autosharded().await {
                error!("discord gateway stopped: {err}");
            }
            closed.send_replace(true);
        });

        match tokio::time::timeout(std::time::Duration::from_secs(READY_TIMEOUT_SECONDS), ready_rx)
            .await
        {
            Ok(Ok(())) => {
                state.is_logged_in = true;
                state.gateway_task = Some(gateway_task);
                info!("discord bot login succeeded and gateway is connected");
                Ok(())
            }
            Ok(Err(_)) => {
                gateway_task.abort();
                Err(anyhow!("discord gateway exited before receiving Ready event"))
            }
            Err(_) => {
                gateway_task.abort();
                Err(anyhow!("timed out waiting for discord Ready event"))
            }
        }
    }

    /// Logs in, retrying with exponential backoff until the gateway is ready.
    pub async fn connect(&self) -> Result<()> {
        let mut retry_seconds = INITIAL_LOGIN_RETRY_SECONDS;

        loop {
            match self.login().await {
                Ok(()) => {
                    info!("discord client is ready");
                    return Ok(());
                }
                Err(err) => {
                    error!(
                        "failed to start discord client: {err}. retrying in {} seconds",
                        retry_seconds
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(retry_seconds)).await;
                    retry_seconds = (retry_seconds * 2).min(MAX_LOGIN_RETRY_SECONDS);
                }
            }
        }
    }

    /// REST-only client for one-shot commands that never open the gateway.
    pub async fn connect_rest(&self) -> Result<()> {
        let http = Arc::new(Http::new(self.config.discord.bot_token.expose_secret()));
        let current = http
            .get_current_user()
            .await
            .map_err(|err| anyhow!("failed to authenticate discord bot: {err}"))?;
        info!("discord rest client ready as {} ({})", current.name, current.id);
        *self.bot_user.write().await = Some(current.id);
        *self.http.write().await = Some(http);
        Ok(())
    }

    /// Resolves once the gateway task has exited.
    pub async fn closed(&self) {
        let mut receiver = self.gateway_closed.subscribe();
        // The sender lives in `self`, so this only ends when the flag flips.
        let _ = receiver.wait_for(|closed| *closed).await;
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if !state.is_logged_in {
            return Ok(());
        }

        if let Some(gateway_task) = state.gateway_task.take() {
            gateway_task.abort();
            match gateway_task.await {
                Ok(()) => info!("discord gateway task exited"),
                Err(join_err) if join_err.is_cancelled() => {
                    info!("discord gateway task aborted")
                }
                Err(join_err) => {
                    error!("discord gateway task join error: {join_err}");
                }
            }
        }

        *self.http.write().await = None;
        state.is_logged_in = false;
        self.gateway_closed.send_replace(true);
        info!("discord client stopped");
        Ok(())
    }

    async fn http(&self) -> Result<Arc<Http>, ProviderError> {
        self.http
            .read()
            .await
            .clone()
            .ok_or_else(|| ProviderError::Platform("discord http client not available".to_string()))
    }

    async fn guild_channel(
        &self,
        http: &Http,
        channel_id: u64,
    ) -> Result<GuildChannel, ProviderError> {
        ChannelId::new(channel_id)
            .to_channel(http)
            .await
            .map_err(|e| provider_error("fetch channel", e))?
            .guild()
            .ok_or_else(|| ProviderError::NotFound(format!("guild channel {channel_id}")))
    }

    /// Rename with the archive prefix and revoke send access for members.
    async fn archive(&self, http: &Http, channel: &GuildChannel) -> Result<(), ProviderError> {
        let bot_user = *self.bot_user.read().await;
        for overwrite in &channel.permission_overwrites {
            let PermissionOverwriteType::Member(user_id) = overwrite.kind else {
                continue;
            };
            if Some(user_id) == bot_user {
                continue;
            }
            channel
                .id
                .create_permission(
                    http,
                    PermissionOverwrite {
                        allow: overwrite.allow - Permissions::SEND_MESSAGES,
                        deny: overwrite.deny | Permissions::SEND_MESSAGES,
                        kind: overwrite.kind,
                    },
                )
                .await
                .map_err(|e| provider_error("lock archived channel", e))?;
        }

        let name = archived_name(&self.config.tickets.archive_prefix, &channel.name);
        channel
            .id
            .edit(http, EditChannel::new().name(name))
            .await
            .map_err(|e| provider_error("rename archived channel", e))?;
        Ok(())
    }
}

#[async_trait]
impl ChannelProvider for DiscordClient {
    async fn create_ticket_channel(
        &self,
        request: &TicketChannelRequest,
    ) -> Result<CreatedChannel, ProviderError> {
        let client = self.http().await?;
        let http: &Http = &client;
        let guild_id = GuildId::new(parse_id("guild", &request.guild_id)?);
        let category = request
            .category_id
            .as_deref()
            .or(self.config.discord.ticket_category_id.as_deref())
            .map(|id| parse_id("category", id).map(ChannelId::new))
            .transpose()?;

        // A retried request finds the channel the failed attempt created.
        let existing = guild_id
            .channels(http)
            .await
            .map_err(|e| provider_error("list guild channels", e))?;
        if let Some(channel) = existing
            .values()
            .find(|channel| channel.name == request.name && channel.parent_id == category)
        {
            info!(
                "reusing existing ticket channel ticket_id={} channel_id={}",
                request.ticket_id, channel.id
            );
            return Ok(CreatedChannel {
                channel_id: channel.id.to_string(),
            });
        }

        let mut overwrites = vec![
            PermissionOverwrite {
                allow: Permissions::empty(),
                deny: Permissions::VIEW_CHANNEL,
                kind: PermissionOverwriteType::Role(RoleId::new(guild_id.get())),
            },
            PermissionOverwrite {
                allow: participant_permissions(),
                deny: Permissions::empty(),
                kind: PermissionOverwriteType::Member(UserId::new(parse_id(
                    "user",
                    &request.opener_id,
                )?)),
            },
        ];
        if let Some(bot_user) = *self.bot_user.read().await {
            overwrites.push(PermissionOverwrite {
                allow: bot_permissions(),
                deny: Permissions::empty(),
                kind: PermissionOverwriteType::Member(bot_user),
            });
        }
        for role_id in &request.support_role_ids {
            overwrites.push(PermissionOverwrite {
                allow: participant_permissions(),
                deny: Permissions::empty(),
                kind: PermissionOverwriteType::Role(RoleId::new(parse_id("role", role_id)?)),
            });
        }

        let topic = match &request.topic {
            Some(subject) => format!("Ticket #{}: {}", request.ticket_number, subject),
            None => format!("Ticket #{}", request.ticket_number),
        };
        let mut builder = CreateChannel::new(&request.name)
            .kind(ChannelType::Text)
            .topic(topic)
            .permissions(overwrites);
        if let Some(category) = category {
            builder = builder.category(category);
        }

        let channel = guild_id
            .create_channel(http, builder)
            .await
            .map_err(|e| provider_error("create ticket channel", e))?;
        info!(
            "created ticket channel ticket_id={} guild_id={} channel_id={}",
            request.ticket_id, request.guild_id, channel.id
        );
        Ok(CreatedChannel {
            channel_id: channel.id.to_string(),
        })
    }

    async fn send_message(
        &self,
        channel_id: &str,
        message: &OutgoingMessage,
    ) -> Result<SentMessage, ProviderError> {
        let client = self.http().await?;
        let http: &Http = &client;
        let sent = ChannelId::new(parse_id("channel", channel_id)?)
            .send_message(http, build_message(message))
            .await
            .map_err(|e| provider_error("send message", e))?;
        debug!("sent message channel_id={} message_id={}", channel_id, sent.id);
        Ok(SentMessage {
            message_id: sent.id.to_string(),
        })
    }

    async fn archive_or_delete(
        &self,
        channel_id: &str,
        guild_id: &str,
        settings: &GuildSettings,
        actor_id: &str,
    ) -> Result<ArchiveOutcome, ProviderError> {
        let client = self.http().await?;
        let http: &Http = &client;
        let id = parse_id("channel", channel_id)?;

        if settings.archive_on_close {
            let channel = self.guild_channel(http, id).await?;
            self.archive(http, &channel).await?;
            info!(
                "archived ticket channel guild_id={} channel_id={} actor={}",
                guild_id, channel_id, actor_id
            );
            return Ok(ArchiveOutcome { deleted: false });
        }

        ChannelId::new(id)
            .delete(http)
            .await
            .map_err(|e| provider_error("delete channel", e))?;
        info!(
            "deleted ticket channel guild_id={} channel_id={} actor={}",
            guild_id, channel_id, actor_id
        );
        Ok(ArchiveOutcome { deleted: true })
    }

    async fn fetch_permission_snapshot(
        &self,
        channel_id: &str,
    ) -> Result<ChannelCapabilities, ProviderError> {
        let client = self.http().await?;
        let http: &Http = &client;
        let channel = self.guild_channel(http, parse_id("channel", channel_id)?).await?;
        let Some(bot_user) = *self.bot_user.read().await else {
            return Err(ProviderError::Platform("bot user is not known yet".to_string()));
        };

        let guild = channel
            .guild_id
            .to_partial_guild(http)
            .await
            .map_err(|e| provider_error("fetch guild", e))?;
        let member = channel
            .guild_id
            .member(http, bot_user)
            .await
            .map_err(|e| provider_error("fetch bot member", e))?;
        let permissions = guild.user_permissions_in(&channel, &member);
        Ok(capabilities_from(permissions))
    }

    async fn channel_exists(&self, channel_id: &str) -> Result<bool, ProviderError> {
        let client = self.http().await?;
        let http: &Http = &client;
        match self.guild_channel(http, parse_id("channel", channel_id)?).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_guild_member(&self, guild_id: &str, user_id: &str) -> Result<bool, ProviderError> {
        let client = self.http().await?;
        let http: &Http = &client;
        let guild = GuildId::new(parse_id("guild", guild_id)?);
        let user = UserId::new(parse_id("user", user_id)?);
        match guild.member(http, user).await {
            Ok(_) => Ok(true),
            Err(e) => match provider_error("fetch member", e) {
                err if err.is_not_found() => Ok(false),
                err => Err(err),
            },
        }
    }

    async fn notify_user(&self, user_id: &str, content: &str) -> Result<(), ProviderError> {
        let client = self.http().await?;
        let http: &Http = &client;
        UserId::new(parse_id("user", user_id)?)
            .direct_message(http, CreateMessage::new().content(content))
            .await
            .map_err(|e| provider_error("direct message", e))?;
        Ok(())
    }

    async fn set_member_access(
        &self,
        channel_id: &str,
        user_id: &str,
        allowed: bool,
    ) -> Result<(), ProviderError> {
        let client = self.http().await?;
        let http: &Http = &client;
        let channel = ChannelId::new(parse_id("channel", channel_id)?);
        let user = UserId::new(parse_id("user", user_id)?);

        if allowed {
            channel
                .create_permission(
                    http,
                    PermissionOverwrite {
                        allow: participant_permissions(),
                        deny: Permissions::empty(),
                        kind: PermissionOverwriteType::Member(user),
                    },
                )
                .await
                .map_err(|e| provider_error("grant channel access", e))?;
        } else {
            match channel
                .delete_permission(http, PermissionOverwriteType::Member(user))
                .await
            {
                Ok(()) => {}
                Err(e) => {
                    let mapped = provider_error("revoke channel access", e);
                    // No overwrite to remove means the member had no access.
                    if !mapped.is_not_found() {
                        return Err(mapped);
                    }
                    warn!(
                        "no overwrite to revoke channel_id={} user_id={}",
                        channel_id, user_id
                    );
                }
            }
        }
        Ok(())
    }
}
