use std::sync::Arc;

use chrono::{DateTime, Utc};
use serenity::all::{
    ChannelId, Command, CommandInteraction, ComponentInteraction, Context as SerenityContext,
    EditInteractionResponse, EventHandler as SerenityEventHandler, Guild, GuildChannel, GuildId,
    Http, Interaction, Member, Message as SerenityMessage, MessageId, MessageUpdateEvent, Ready,
    Timestamp, User, UserId,
};
use tokio::sync::{Mutex as AsyncMutex, RwLock, oneshot};
use tracing::{debug, error, info, warn};

use crate::app::{Invocation, TicketApp};
use crate::discord::commands::{COMMAND_NAME, CloseRequestButton, CommandArgs, TicketCommand, ticket_command};
use crate::transcript::ObservedMessage;

pub(super) struct GatewayHandler {
    pub(super) ready_sender: Arc<AsyncMutex<Option<oneshot::Sender<()>>>>,
    pub(super) app: Arc<RwLock<Option<Arc<TicketApp>>>>,
    pub(super) http: Arc<RwLock<Option<Arc<Http>>>>,
    pub(super) bot_user: Arc<RwLock<Option<UserId>>>,
    pub(super) register_commands: bool,
}

fn to_utc(timestamp: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp.unix_timestamp(), 0).unwrap_or_else(Utc::now)
}

fn observed(msg: &SerenityMessage) -> ObservedMessage {
    let attachments: Vec<String> = msg.attachments.iter().map(|a| a.url.clone()).collect();
    ObservedMessage {
        channel_id: msg.channel_id.to_string(),
        message_id: msg.id.to_string(),
        author_id: msg.author.id.to_string(),
        content: msg.content.clone(),
        embeds: (!msg.embeds.is_empty())
            .then(|| serde_json::to_value(&msg.embeds).ok())
            .flatten(),
        attachments: (!attachments.is_empty()).then(|| serde_json::json!(attachments)),
        from_bot: msg.author.bot,
        reference_id: msg
            .message_reference
            .as_ref()
            .and_then(|reference| reference.message_id)
            .map(|id| id.to_string()),
        sent_at: to_utc(msg.timestamp),
    }
}

fn invocation(
    guild_id: GuildId,
    channel_id: ChannelId,
    user_id: UserId,
    member: Option<&Member>,
) -> Invocation {
    Invocation {
        guild_id: guild_id.to_string(),
        channel_id: channel_id.to_string(),
        user_id: user_id.to_string(),
        discord_role_ids: member
            .map(|member| member.roles.iter().map(ToString::to_string).collect())
            .unwrap_or_default(),
    }
}

impl GatewayHandler {
    async fn app(&self) -> Option<Arc<TicketApp>> {
        self.app.read().await.clone()
    }

    async fn on_command(&self, ctx: &SerenityContext, app: &TicketApp, command: &CommandInteraction) {
        if command.data.name != COMMAND_NAME {
            return;
        }
        let Some(guild_id) = command.guild_id else {
            return;
        };

        if let Err(err) = command.defer_ephemeral(&ctx.http).await {
            error!("failed to defer discord command: {err}");
            return;
        }

        let args = CommandArgs::from_resolved(&command.data.options());
        let reply = match TicketCommand::parse(&args) {
            Ok(parsed) => {
                let invocation = invocation(
                    guild_id,
                    command.channel_id,
                    command.user.id,
                    command.member.as_deref(),
                );
                app.handle_command(&invocation, parsed).await
            }
            Err(message) => message,
        };

        if let Err(err) = command
            .edit_response(&ctx.http, EditInteractionResponse::new().content(reply))
            .await
        {
            error!("failed to answer discord command: {err}");
        }
    }

    async fn on_component(
        &self,
        ctx: &SerenityContext,
        app: &TicketApp,
        component: &ComponentInteraction,
    ) {
        let Some(button) = CloseRequestButton::parse(&component.data.custom_id) else {
            debug!("ignoring unknown component custom_id={}", component.data.custom_id);
            return;
        };
        let Some(guild_id) = component.guild_id else {
            return;
        };

        if let Err(err) = component.defer_ephemeral(&ctx.http).await {
            error!("failed to defer discord component: {err}");
            return;
        }

        let invocation = invocation(
            guild_id,
            component.channel_id,
            component.user.id,
            component.member.as_ref(),
        );
        let reply = app.handle_button(&invocation, button).await;

        if let Err(err) = component
            .edit_response(&ctx.http, EditInteractionResponse::new().content(reply))
            .await
        {
            error!("failed to answer discord component: {err}");
        }
    }
}

#[serenity::async_trait]
impl SerenityEventHandler for GatewayHandler {
    async fn ready(&self, ctx: SerenityContext, ready: Ready) {
        info!(
            "discord gateway ready as {} ({})",
            ready.user.name, ready.user.id
        );
        *self.bot_user.write().await = Some(ready.user.id);
        *self.http.write().await = Some(ctx.http.clone());

        if self.register_commands {
            match Command::set_global_commands(&ctx.http, vec![ticket_command()]).await {
                Ok(_) => info!("registered /{} command", COMMAND_NAME),
                Err(err) => error!("failed to register discord commands: {err}"),
            }
        }

        if let Some(sender) = self.ready_sender.lock().await.take() {
            let _ = sender.send(());
        }
    }

    async fn guild_create(&self, _ctx: SerenityContext, guild: Guild, _is_new: Option<bool>) {
        let Some(app) = self.app().await else {
            return;
        };
        if let Err(err) = app
            .on_guild_available(&guild.id.to_string(), &guild.owner_id.to_string())
            .await
        {
            error!("failed to initialize discord guild {}: {err}", guild.id);
        }
    }

    async fn message(&self, _ctx: SerenityContext, msg: SerenityMessage) {
        if msg.guild_id.is_none() {
            return;
        }
        let Some(app) = self.app().await else {
            debug!("ignoring discord message before app binding");
            return;
        };
        if let Err(err) = app.transcripts().record(&observed(&msg)).await {
            error!("failed to handle discord message: {err}");
        }
    }

    async fn message_update(
        &self,
        _ctx: SerenityContext,
        _old_if_available: Option<SerenityMessage>,
        _new_if_available: Option<SerenityMessage>,
        update: MessageUpdateEvent,
    ) {
        let Some(content) = update.content.clone() else {
            return;
        };
        let Some(app) = self.app().await else {
            return;
        };
        if let Err(err) = app
            .transcripts()
            .record_edit(&update.id.to_string(), &content, Utc::now())
            .await
        {
            error!("failed to handle discord message update: {err}");
        }
    }

    async fn message_delete(
        &self,
        _ctx: SerenityContext,
        _channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        let Some(app) = self.app().await else {
            return;
        };
        if let Err(err) = app
            .transcripts()
            .record_delete(&deleted_message_id.to_string(), Utc::now())
            .await
        {
            error!("failed to handle discord message delete: {err}");
        }
    }

    async fn channel_delete(
        &self,
        _ctx: SerenityContext,
        channel: GuildChannel,
        _messages: Option<Vec<SerenityMessage>>,
    ) {
        let Some(app) = self.app().await else {
            return;
        };
        if let Err(err) = app.on_channel_deleted(&channel.id.to_string()).await {
            error!("failed to handle discord channel delete {}: {err}", channel.id);
        }
    }

    async fn guild_member_removal(
        &self,
        _ctx: SerenityContext,
        guild_id: GuildId,
        user: User,
        _member: Option<Member>,
    ) {
        let Some(app) = self.app().await else {
            return;
        };
        if let Err(err) = app
            .on_member_left(&guild_id.to_string(), &user.id.to_string())
            .await
        {
            error!("failed to handle discord member removal: {err}");
        }
    }

    async fn interaction_create(&self, ctx: SerenityContext, interaction: Interaction) {
        let Some(app) = self.app().await else {
            warn!("ignoring discord interaction before app binding");
            return;
        };
        match interaction {
            Interaction::Command(command) => self.on_command(&ctx, &app, &command).await,
            Interaction::Component(component) => self.on_component(&ctx, &app, &component).await,
            _ => {}
        }
    }
}
