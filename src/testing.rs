//! In-memory [`ChannelProvider`] that records every call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Barrier;

use crate::db::GuildSettings;
use crate::discord::provider::{
    ArchiveOutcome, ChannelCapabilities, ChannelProvider, CreatedChannel, OutgoingMessage,
    ProviderError, SentMessage, TicketChannelRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    CreateChannel,
    SendMessage,
    ArchiveOrDelete,
    Snapshot,
    ChannelExists,
    MemberLookup,
    NotifyUser,
    SetMemberAccess,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    CreateChannel(TicketChannelRequest),
    SendMessage {
        channel_id: String,
        message: OutgoingMessage,
    },
    ArchiveOrDelete {
        channel_id: String,
        deleted: bool,
    },
    NotifyUser {
        user_id: String,
        content: String,
    },
    SetMemberAccess {
        channel_id: String,
        user_id: String,
        allowed: bool,
    },
}

#[derive(Default)]
pub struct FakeProvider {
    next_id: AtomicU64,
    calls: Mutex<Vec<ProviderCall>>,
    failing: Mutex<HashSet<ProviderOp>>,
    channels: Mutex<HashSet<String>>,
    channel_names: Mutex<HashMap<(String, String), String>>,
    departed: Mutex<HashSet<String>>,
    create_gate: Mutex<Option<Arc<Barrier>>>,
    capabilities: Mutex<Option<ChannelCapabilities>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1000),
            ..Self::default()
        }
    }

    /// Makes every later call of `op` fail with a platform error.
    pub fn fail(&self, op: ProviderOp) {
        self.failing.lock().insert(op);
    }

    pub fn recover(&self, op: ProviderOp) {
        self.failing.lock().remove(&op);
    }

    pub fn set_capabilities(&self, capabilities: ChannelCapabilities) {
        *self.capabilities.lock() = Some(capabilities);
    }

    /// Holds channel creation until `callers` creations are in flight.
    pub fn gate_creates(&self, callers: usize) {
        *self.create_gate.lock() = Some(Arc::new(Barrier::new(callers)));
    }

    /// Simulates a member leaving the guild.
    pub fn remove_member(&self, user_id: &str) {
        self.departed.lock().insert(user_id.to_string());
    }

    pub fn deleted_channels(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ProviderCall::ArchiveOrDelete {
                    channel_id,
                    deleted: true,
                } => Some(channel_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Simulates a moderator deleting the channel out of band.
    pub fn remove_channel(&self, channel_id: &str) {
        self.channels.lock().remove(channel_id);
    }

    pub fn has_channel(&self, channel_id: &str) -> bool {
        self.channels.lock().contains(channel_id)
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().clone()
    }

    pub fn created_channels(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, ProviderCall::CreateChannel(_)))
            .count()
    }

    pub fn messages_to(&self, channel_id: &str) -> Vec<OutgoingMessage> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ProviderCall::SendMessage {
                    channel_id: target,
                    message,
                } if target == channel_id => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn check(&self, op: ProviderOp) -> Result<(), ProviderError> {
        if self.failing.lock().contains(&op) {
            Err(ProviderError::Platform(format!("injected {op:?} failure")))
        } else {
            Ok(())
        }
    }

    fn require_channel(&self, channel_id: &str) -> Result<(), ProviderError> {
        if self.channels.lock().contains(channel_id) {
            Ok(())
        } else {
            Err(ProviderError::NotFound(format!("channel {channel_id}")))
        }
    }
}

#[async_trait]
impl ChannelProvider for FakeProvider {
    async fn create_ticket_channel(
        &self,
        request: &TicketChannelRequest,
    ) -> Result<CreatedChannel, ProviderError> {
        self.check(ProviderOp::CreateChannel)?;
        let gate = self.create_gate.lock().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        // Like the Discord client, a live channel with the same name is reused.
        let channel_id = {
            let mut names = self.channel_names.lock();
            let mut channels = self.channels.lock();
            let key = (request.guild_id.clone(), request.name.clone());
            match names.get(&key) {
                Some(existing) if channels.contains(existing) => existing.clone(),
                _ => {
                    let channel_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
                    channels.insert(channel_id.clone());
                    names.insert(key, channel_id.clone());
                    channel_id
                }
            }
        };
        self.calls
            .lock()
            .push(ProviderCall::CreateChannel(request.clone()));
        Ok(CreatedChannel { channel_id })
    }

    async fn send_message(
        &self,
        channel_id: &str,
        message: &OutgoingMessage,
    ) -> Result<SentMessage, ProviderError> {
        self.check(ProviderOp::SendMessage)?;
        self.require_channel(channel_id)?;
        self.calls.lock().push(ProviderCall::SendMessage {
            channel_id: channel_id.to_string(),
            message: message.clone(),
        });
        Ok(SentMessage {
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
        })
    }

    async fn archive_or_delete(
        &self,
        channel_id: &str,
        _guild_id: &str,
        settings: &GuildSettings,
        _actor_id: &str,
    ) -> Result<ArchiveOutcome, ProviderError> {
        self.check(ProviderOp::ArchiveOrDelete)?;
        self.require_channel(channel_id)?;
        let deleted = !settings.archive_on_close;
        if deleted {
            self.channels.lock().remove(channel_id);
        }
        self.calls.lock().push(ProviderCall::ArchiveOrDelete {
            channel_id: channel_id.to_string(),
            deleted,
        });
        Ok(ArchiveOutcome { deleted })
    }

    async fn fetch_permission_snapshot(
        &self,
        channel_id: &str,
    ) -> Result<ChannelCapabilities, ProviderError> {
        self.check(ProviderOp::Snapshot)?;
        self.require_channel(channel_id)?;
        let configured = *self.capabilities.lock();
        Ok(configured.unwrap_or_else(ChannelCapabilities::full))
    }

    async fn channel_exists(&self, channel_id: &str) -> Result<bool, ProviderError> {
        self.check(ProviderOp::ChannelExists)?;
        Ok(self.channels.lock().contains(channel_id))
    }

    async fn is_guild_member(&self, _guild_id: &str, user_id: &str) -> Result<bool, ProviderError> {
        self.check(ProviderOp::MemberLookup)?;
        Ok(!self.departed.lock().contains(user_id))
    }

    async fn notify_user(&self, user_id: &str, content: &str) -> Result<(), ProviderError> {
        self.check(ProviderOp::NotifyUser)?;
        self.calls.lock().push(ProviderCall::NotifyUser {
            user_id: user_id.to_string(),
            content: content.to_string(),
        });
        Ok(())
    }

    async fn set_member_access(
        &self,
        channel_id: &str,
        user_id: &str,
        allowed: bool,
    ) -> Result<(), ProviderError> {
        self.check(ProviderOp::SetMemberAccess)?;
        self.require_channel(channel_id)?;
        self.calls.lock().push(ProviderCall::SetMemberAccess {
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            allowed,
        });
        Ok(())
    }
}
