//! Periodic repair of drift between stored tickets and the chat platform.
//!
//! Every correction goes through [`TicketOrchestrator`] with the system actor,
//! so sweep-driven transitions are audited and announced exactly like user
//! driven ones.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ReconciliationConfig;
use crate::db::{GuildSettings, Ticket};
use crate::discord::provider::ProviderError;
use crate::lifecycle::{
    CloseOptions, LifecycleError, REASON_CHANNEL_DELETED, TicketOrchestrator, TicketOutcome,
};
use crate::permissions::Actor;

const MIN_INTERVAL_SECS: u64 = 5;
const CHANNEL_CHECK_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub closed_missing_channel: usize,
    pub backfilled: usize,
    pub auto_closed: usize,
    pub failures: usize,
}

impl SweepReport {
    pub fn total_changes(&self) -> usize {
        self.closed_missing_channel + self.backfilled + self.auto_closed
    }
}

#[derive(Clone)]
pub struct ReconciliationSweep {
    tickets: TicketOrchestrator,
    config: ReconciliationConfig,
}

impl ReconciliationSweep {
    pub fn new(tickets: TicketOrchestrator, config: ReconciliationConfig) -> Self {
        Self { tickets, config }
    }

    /// Closes the ticket bound to a channel that was deleted on the platform.
    pub async fn handle_channel_deleted(
        &self,
        channel_id: &str,
    ) -> Result<Option<TicketOutcome>, LifecycleError> {
        let Some(ticket) = self.tickets.find_by_channel(channel_id).await? else {
            return Ok(None);
        };
        if !ticket.status.is_active() {
            return Ok(None);
        }
        info!(
            "ticket channel deleted, closing ticket_id={} channel_id={}",
            ticket.id, channel_id
        );
        self.close_gone(&ticket).await.map(Some)
    }

    /// Releases claims and participations held by a member who left.
    pub async fn handle_member_left(
        &self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<Vec<TicketOutcome>, LifecycleError> {
        let outcomes = self.tickets.release_departed_member(guild_id, user_id).await?;
        if !outcomes.is_empty() {
            info!(
                "released departed member guild_id={} user_id={} tickets={}",
                guild_id,
                user_id,
                outcomes.len()
            );
        }
        Ok(outcomes)
    }

    async fn close_gone(&self, ticket: &Ticket) -> Result<TicketOutcome, LifecycleError> {
        self.tickets
            .close(
                &Actor::system(),
                ticket.id,
                Some(REASON_CHANNEL_DELETED.to_string()),
                CloseOptions::channel_deleted(),
            )
            .await
    }

    pub async fn run_once(&self) -> Result<SweepReport, LifecycleError> {
        self.sweep(Utc::now()).await
    }

    /// One full pass evaluated against `now`.
    ///
    /// Failures on individual tickets are logged and counted; only a failure
    /// to list candidates aborts the pass.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, LifecycleError> {
        let mut report = SweepReport::default();
        if self.config.verify_channels {
            self.verify_channels(&mut report).await?;
        }
        self.backfill_channels(now, &mut report).await?;
        self.auto_close(now, &mut report).await?;

        info!(
            "reconciliation sweep finished closed_missing_channel={} backfilled={} auto_closed={} failures={}",
            report.closed_missing_channel, report.backfilled, report.auto_closed, report.failures
        );
        #[cfg(feature = "metrics")]
        metrics::counter!("ticket_sweep_changes_total").increment(report.total_changes() as u64);
        Ok(report)
    }

    async fn verify_channels(&self, report: &mut SweepReport) -> Result<(), LifecycleError> {
        let active = self
            .tickets
            .database()
            .ticket_store()
            .list_active_tickets(None)
            .await?;
        let effects = self.tickets.effects();
        let checks: Vec<(Ticket, Result<bool, ProviderError>)> = stream::iter(active)
            .filter(|ticket| futures::future::ready(ticket.channel().is_some()))
            .map(|ticket| async move {
                let exists = match ticket.channel() {
                    Some(channel_id) => effects.channel_exists(channel_id).await,
                    None => Ok(true),
                };
                (ticket, exists)
            })
            .buffer_unordered(CHANNEL_CHECK_CONCURRENCY)
            .collect()
            .await;

        for (ticket, exists) in checks {
            match exists {
                Ok(true) => {}
                Ok(false) => match self.close_gone(&ticket).await {
                    Ok(outcome) if outcome.changed => report.closed_missing_channel += 1,
                    Ok(_) => {}
                    Err(e) => {
                        error!("failed to close orphaned ticket ticket_id={}: {}", ticket.id, e);
                        report.failures += 1;
                    }
                },
                Err(e) => {
                    // An unreachable platform is not proof the channel is gone.
                    warn!(
                        "channel check failed ticket_id={} channel_id={}: {}",
                        ticket.id, ticket.channel_id, e
                    );
                    report.failures += 1;
                }
            }
        }
        Ok(())
    }

    async fn backfill_channels(
        &self,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), LifecycleError> {
        let Some(created_before) = missing_channel_cutoff(self.config.missing_channel_grace_secs, now)
        else {
            warn!(
                "missing channel grace out of range, skipping backfill grace_secs={}",
                self.config.missing_channel_grace_secs
            );
            return Ok(());
        };
        let missing = self
            .tickets
            .database()
            .ticket_store()
            .list_tickets_missing_channel(created_before)
            .await?;
        for ticket in missing {
            match self.tickets.ensure_channel(&Actor::system(), ticket.id).await {
                Ok(outcome) if outcome.changed => report.backfilled += 1,
                Ok(outcome) => {
                    if outcome.is_partial() {
                        report.failures += 1;
                    }
                    debug!("channel backfill left ticket unchanged ticket_id={}", ticket.id);
                }
                Err(e) => {
                    error!("channel backfill failed ticket_id={}: {}", ticket.id, e);
                    report.failures += 1;
                }
            }
        }
        Ok(())
    }

    async fn auto_close(
        &self,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), LifecycleError> {
        let guilds = self.tickets.database().guild_store().list_guilds().await?;
        for settings in guilds.iter().filter(|settings| settings.auto_close_enabled) {
            let cutoff = inactivity_cutoff(settings, now);
            let inactive = self
                .tickets
                .database()
                .ticket_store()
                .list_inactive_tickets(&settings.guild_id, cutoff)
                .await?;
            for ticket in inactive {
                let closed = self.tickets.close_inactive(ticket.id, cutoff).await;
                match closed {
                    Ok(outcome) if outcome.changed => report.auto_closed += 1,
                    Ok(_) => {}
                    Err(e) => {
                        error!("auto-close failed ticket_id={}: {}", ticket.id, e);
                        report.failures += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Runs sweeps on the configured interval until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.interval_secs.max(MIN_INTERVAL_SECS));
        let mut ticker = tokio::time::interval(period);
        info!("reconciliation sweep started interval_secs={}", period.as_secs());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("reconciliation sweep failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("reconciliation sweep stopped");
    }
}

fn missing_channel_cutoff(grace_secs: u64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let grace = chrono::TimeDelta::try_seconds(i64::try_from(grace_secs).ok()?)?;
    now.checked_sub_signed(grace)
}

fn inactivity_cutoff(settings: &GuildSettings, now: DateTime<Utc>) -> DateTime<Utc> {
    now - chrono::Duration::hours(i64::from(settings.auto_close_after_hours.max(1)))
}
