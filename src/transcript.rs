use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::db::{DatabaseError, DatabaseManager, MessageType, NewTicketMessage, TicketMessage};

const PREVIEW_LEN: usize = 48;

/// A message seen in some channel, already stripped of gateway types.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedMessage {
    pub channel_id: String,
    pub message_id: String,
    pub author_id: String,
    pub content: String,
    pub embeds: Option<Value>,
    pub attachments: Option<Value>,
    pub from_bot: bool,
    pub reference_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Appends ticket channel traffic to the ticket's transcript.
///
/// Rows are only ever inserted or marked; edits and deletions keep the
/// original row so the transcript stays a full history.
#[derive(Clone)]
pub struct TranscriptRecorder {
    db: DatabaseManager,
}

impl TranscriptRecorder {
    pub fn new(db: DatabaseManager) -> Self {
        Self { db }
    }

    /// Records `message` when it was posted in a ticket channel.
    ///
    /// Returns false for channels that belong to no ticket and for messages
    /// already recorded.
    pub async fn record(&self, message: &ObservedMessage) -> Result<bool, DatabaseError> {
        let Some(ticket) = self
            .db
            .ticket_store()
            .get_ticket_by_channel(&message.channel_id)
            .await?
        else {
            return Ok(false);
        };

        let transcript = self.db.transcript_store().ensure_transcript(ticket.id).await?;
        let inserted = self
            .db
            .transcript_store()
            .append_message(&NewTicketMessage {
                transcript_id: transcript.id,
                message_id: message.message_id.clone(),
                author_id: message.author_id.clone(),
                content: message.content.clone(),
                embeds: message.embeds.clone(),
                attachments: message.attachments.clone(),
                message_type: if message.from_bot {
                    MessageType::System
                } else {
                    MessageType::User
                },
                reference_id: message.reference_id.clone(),
                created_at: message.sent_at,
            })
            .await?;

        if inserted && !message.from_bot {
            self.db
                .ticket_store()
                .touch_activity(ticket.id, message.sent_at)
                .await?;
        }

        debug!(
            "transcript message ticket_id={} message_id={} inserted={} preview={}",
            ticket.id,
            message.message_id,
            inserted,
            preview_text(&message.content)
        );
        Ok(inserted)
    }

    pub async fn record_edit(
        &self,
        message_id: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .db
            .transcript_store()
            .mark_edited(message_id, content, at)
            .await?;
        debug!("transcript edit message_id={} updated={}", message_id, updated);
        Ok(updated)
    }

    pub async fn record_delete(
        &self,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let updated = self.db.transcript_store().mark_deleted(message_id, at).await?;
        debug!("transcript delete message_id={} updated={}", message_id, updated);
        Ok(updated)
    }

    pub async fn messages(&self, ticket_id: i64) -> Result<Vec<TicketMessage>, DatabaseError> {
        self.db.transcript_store().list_messages(ticket_id).await
    }
}

fn preview_text(value: &str) -> String {
    let mut preview: String = value.chars().take(PREVIEW_LEN).collect();
    if value.chars().count() > PREVIEW_LEN {
        preview.push_str("...");
    }
    preview
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::db::test_helpers::sqlite_manager;
    use crate::db::{NewTicket, TicketTx};
    use chrono::Duration;

    async fn linked_ticket(db: &DatabaseManager, channel_id: &'static str) -> i64 {
        db.guild_store().ensure_guild("g1", "owner").await.expect("guild");
        db.transaction(move |tx: &mut dyn TicketTx| {
            let number = tx.next_ticket_number("g1")?;
            let mut ticket = tx.insert_ticket(&NewTicket {
                guild_id: "g1".to_string(),
                number,
                opener_id: "opener".to_string(),
                subject: None,
                panel_id: None,
                metadata: None,
                created_at: Utc::now() - Duration::hours(2),
            })?;
            ticket.channel_id = channel_id.to_string();
            ticket.last_activity_at = Utc::now() - Duration::hours(2);
            tx.update_ticket(&ticket)?;
            Ok::<_, DatabaseError>(ticket.id)
        })
        .await
        .expect("ticket")
    }

    fn message(channel_id: &str, message_id: &str) -> ObservedMessage {
        ObservedMessage {
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
            author_id: "opener".to_string(),
            content: "hello".to_string(),
            embeds: None,
            attachments: None,
            from_bot: false,
            reference_id: None,
            sent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_ticket_messages_once_and_bumps_activity() {
        let (_file, db) = sqlite_manager().await;
        let ticket_id = linked_ticket(&db, "c1").await;
        let recorder = TranscriptRecorder::new(db.clone());

        assert!(recorder.record(&message("c1", "m1")).await.expect("record"));
        assert!(!recorder.record(&message("c1", "m1")).await.expect("duplicate"));
        assert!(!recorder.record(&message("elsewhere", "m2")).await.expect("foreign"));

        let messages = recorder.messages(ticket_id).await.expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, MessageType::User);

        let ticket = db.ticket_store().get_ticket(ticket_id).await.expect("query").expect("ticket");
        assert!(ticket.last_activity_at > Utc::now() - Duration::minutes(5));
    }

    #[tokio::test]
    async fn edits_and_deletes_keep_the_row() {
        let (_file, db) = sqlite_manager().await;
        let ticket_id = linked_ticket(&db, "c1").await;
        let recorder = TranscriptRecorder::new(db);

        recorder.record(&message("c1", "m1")).await.expect("record");
        assert!(recorder.record_edit("m1", "hello again", Utc::now()).await.expect("edit"));
        assert!(recorder.record_delete("m1", Utc::now()).await.expect("delete"));
        assert!(!recorder.record_delete("m1", Utc::now()).await.expect("second delete"));

        let messages = recorder.messages(ticket_id).await.expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello again");
        assert!(messages[0].edited_at.is_some());
        assert!(messages[0].deleted_at.is_some());
    }

    #[test]
    fn preview_truncates_long_content() {
        let long = "x".repeat(100);
        assert_eq!(preview_text(&long).chars().count(), PREVIEW_LEN + 3);
        assert_eq!(preview_text("short"), "short");
    }
}
