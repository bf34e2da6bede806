//! Post-commit side effects.
//!
//! The orchestrator collects [`SideEffect`]s while planning a transition and
//! hands them to [`EffectExecutor::run`] only after the database transaction
//! has committed. Failures are recorded in the [`EffectReport`] and never
//! undo the committed state; reconciliation repairs drift later.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info_span, warn};
use tracing_futures::Instrument;

use crate::config::TicketsConfig;
use crate::db::GuildSettings;
use crate::discord::provider::{
    ChannelCapabilities, ChannelProvider, CreatedChannel, OutgoingMessage, ProviderError,
    TicketChannelRequest, bounded,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    SendMessage {
        channel_id: String,
        message: OutgoingMessage,
    },
    NotifyUser {
        user_id: String,
        content: String,
    },
    ArchiveOrDelete {
        channel_id: String,
        guild_id: String,
        settings: GuildSettings,
        actor_id: String,
    },
    SetMemberAccess {
        channel_id: String,
        user_id: String,
        allowed: bool,
    },
}

impl SideEffect {
    pub fn message(channel_id: &str, message: OutgoingMessage) -> Self {
        SideEffect::SendMessage {
            channel_id: channel_id.to_string(),
            message,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SideEffect::SendMessage { .. } => "send_message",
            SideEffect::NotifyUser { .. } => "notify_user",
            SideEffect::ArchiveOrDelete { .. } => "archive_or_delete",
            SideEffect::SetMemberAccess { .. } => "set_member_access",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectFailure {
    pub effect: &'static str,
    pub error: ProviderError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectReport {
    /// Set once an archive-or-delete effect ran successfully.
    pub channel_deleted: Option<bool>,
    pub failures: Vec<EffectFailure>,
}

impl EffectReport {
    pub fn record(&mut self, effect: &'static str, error: ProviderError) {
        warn!("side effect failed effect={} error={}", effect, error);
        #[cfg(feature = "metrics")]
        metrics::counter!("ticket_side_effect_failures_total", "effect" => effect).increment(1);
        self.failures.push(EffectFailure { effect, error });
    }

    pub fn merge(&mut self, other: EffectReport) {
        if other.channel_deleted.is_some() {
            self.channel_deleted = other.channel_deleted;
        }
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Short notices for the caller, one per failed effect.
    pub fn notices(&self) -> Vec<String> {
        self.failures
            .iter()
            .map(|failure| format!("{} failed: {}", failure.effect, failure.error))
            .collect()
    }
}

/// Runs provider calls with the configured timeout and pacing.
#[derive(Clone)]
pub struct EffectExecutor {
    provider: Arc<dyn ChannelProvider>,
    timeout: Duration,
    send_delay: Duration,
}

impl EffectExecutor {
    pub fn new(provider: Arc<dyn ChannelProvider>, config: &TicketsConfig) -> Self {
        Self {
            provider,
            timeout: config.provider_timeout(),
            send_delay: Duration::from_millis(config.send_delay_ms),
        }
    }

    pub async fn create_channel(
        &self,
        request: &TicketChannelRequest,
    ) -> Result<CreatedChannel, ProviderError> {
        bounded(
            "create_ticket_channel",
            self.timeout,
            self.provider.create_ticket_channel(request),
        )
        .await
    }

    pub async fn snapshot(&self, channel_id: &str) -> Result<ChannelCapabilities, ProviderError> {
        bounded(
            "fetch_permission_snapshot",
            self.timeout,
            self.provider.fetch_permission_snapshot(channel_id),
        )
        .await
    }

    pub async fn channel_exists(&self, channel_id: &str) -> Result<bool, ProviderError> {
        bounded(
            "channel_exists",
            self.timeout,
            self.provider.channel_exists(channel_id),
        )
        .await
    }

    pub async fn is_guild_member(&self, guild_id: &str, user_id: &str) -> Result<bool, ProviderError> {
        bounded(
            "is_guild_member",
            self.timeout,
            self.provider.is_guild_member(guild_id, user_id),
        )
        .await
    }

    pub async fn discard_channel(
        &self,
        channel_id: &str,
        settings: &GuildSettings,
        actor_id: &str,
    ) -> Result<(), ProviderError> {
        let mut settings = settings.clone();
        settings.archive_on_close = false;
        bounded(
            "archive_or_delete",
            self.timeout,
            self.provider
                .archive_or_delete(channel_id, &settings.guild_id, &settings, actor_id),
        )
        .await
        .map(|_| ())
    }

    /// Runs `effects` in order. A failed effect does not stop the rest.
    pub async fn run(
        &self,
        ticket_id: i64,
        action: &'static str,
        effects: Vec<SideEffect>,
    ) -> EffectReport {
        if effects.is_empty() {
            return EffectReport::default();
        }
        let span = info_span!("side_effects", ticket_id, action);
        async move {
            let mut report = EffectReport::default();
            for effect in effects {
                self.run_one(effect, &mut report).await;
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn run_one(&self, effect: SideEffect, report: &mut EffectReport) {
        let name = effect.name();
        let result = match effect {
            SideEffect::SendMessage {
                channel_id,
                message,
            } => {
                if !self.send_delay.is_zero() {
                    tokio::time::sleep(self.send_delay).await;
                }
                bounded(
                    name,
                    self.timeout,
                    self.provider.send_message(&channel_id, &message),
                )
                .await
                .map(|sent| debug!("message sent channel_id={} message_id={}", channel_id, sent.message_id))
            }
            SideEffect::NotifyUser { user_id, content } => {
                bounded(name, self.timeout, self.provider.notify_user(&user_id, &content)).await
            }
            SideEffect::ArchiveOrDelete {
                channel_id,
                guild_id,
                settings,
                actor_id,
            } => bounded(
                name,
                self.timeout,
                self.provider
                    .archive_or_delete(&channel_id, &guild_id, &settings, &actor_id),
            )
            .await
            .map(|outcome| report.channel_deleted = Some(outcome.deleted)),
            SideEffect::SetMemberAccess {
                channel_id,
                user_id,
                allowed,
            } => {
                bounded(
                    name,
                    self.timeout,
                    self.provider.set_member_access(&channel_id, &user_id, allowed),
                )
                .await
            }
        };

        if let Err(error) = result {
            report.record(name, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProvider, ProviderCall, ProviderOp};
    use chrono::Utc;

    fn executor(provider: Arc<FakeProvider>) -> EffectExecutor {
        EffectExecutor::new(provider, &TicketsConfig::default())
    }

    async fn channel(provider: &FakeProvider) -> String {
        provider
            .create_ticket_channel(&TicketChannelRequest {
                guild_id: "g1".to_string(),
                ticket_id: 1,
                ticket_number: 1,
                opener_id: "opener".to_string(),
                name: "ticket-0001".to_string(),
                topic: None,
                category_id: None,
                support_role_ids: Vec::new(),
            })
            .await
            .expect("channel")
            .channel_id
    }

    #[tokio::test]
    async fn failures_do_not_stop_later_effects() {
        let provider = Arc::new(FakeProvider::new());
        let channel_id = channel(&provider).await;
        provider.fail(ProviderOp::SendMessage);

        let report = executor(provider.clone())
            .run(
                1,
                "closed",
                vec![
                    SideEffect::message(&channel_id, OutgoingMessage::text("closing")),
                    SideEffect::ArchiveOrDelete {
                        channel_id: channel_id.clone(),
                        guild_id: "g1".to_string(),
                        settings: GuildSettings::new("g1", "owner", Utc::now()),
                        actor_id: "opener".to_string(),
                    },
                ],
            )
            .await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].effect, "send_message");
        assert_eq!(report.channel_deleted, Some(true));
        assert!(!provider.has_channel(&channel_id));
    }

    #[tokio::test]
    async fn discard_channel_always_deletes() {
        let provider = Arc::new(FakeProvider::new());
        let channel_id = channel(&provider).await;
        let mut settings = GuildSettings::new("g1", "owner", Utc::now());
        settings.archive_on_close = true;

        executor(provider.clone())
            .discard_channel(&channel_id, &settings, "system")
            .await
            .expect("discard");
        assert!(provider.calls().contains(&ProviderCall::ArchiveOrDelete {
            channel_id,
            deleted: true,
        }));
    }

    #[tokio::test]
    async fn empty_effect_list_is_clean() {
        let provider = Arc::new(FakeProvider::new());
        let report = executor(provider).run(1, "noop", Vec::new()).await;
        assert!(report.is_clean());
        assert!(report.notices().is_empty());
    }
}
