//! Database row types matching `schema.rs` column order exactly.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared_types::{DealResponse, FourBasics, MessageResponse};
use uuid::Uuid;

/// A connected Gmail account. The history cursor lives here; it is mutated
/// only by the reconciler after a successful batch commit.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::accounts)]
pub struct Account {
    pub id: Uuid,
    pub email_address: String,
    pub display_name: Option<String>,
    pub refresh_token: String,
    pub history_cursor: Option<String>,
    pub whatsapp_number: Option<String>,
    pub auto_reply_enabled: bool,
    pub is_active: bool,
    pub last_synced: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One classified email. (account_id, gmail_id) is unique at the database
/// level; concurrent workers racing to insert the same message resolve the
/// race through that constraint, not application logic.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::messages)]
pub struct MessageRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub gmail_id: String,
    pub thread_id: String,
    pub sender: String,
    pub sender_address: String,
    pub subject: String,
    pub snippet: Option<String>,
    pub body_text: Option<String>,
    pub category: String,
    pub confidence: f32,
    pub tags: Vec<String>,
    pub reply_type: String,
    pub has_pdf_attachment: bool,
    pub received_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<MessageRecord> for MessageResponse {
    fn from(m: MessageRecord) -> Self {
        MessageResponse {
            id: m.id,
            account_id: m.account_id,
            gmail_id: m.gmail_id,
            thread_id: m.thread_id,
            sender: m.sender,
            sender_address: m.sender_address,
            subject: m.subject,
            snippet: m.snippet,
            category: m.category,
            confidence: m.confidence,
            tags: m.tags,
            reply_type: m.reply_type,
            has_pdf_attachment: m.has_pdf_attachment,
            received_at: m.received_at,
            processed: m.processed,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::messages)]
pub struct NewMessage {
    pub account_id: Uuid,
    pub gmail_id: String,
    pub thread_id: String,
    pub sender: String,
    pub sender_address: String,
    pub subject: String,
    pub snippet: Option<String>,
    pub body_text: Option<String>,
    pub category: String,
    pub confidence: f32,
    pub tags: Vec<String>,
    pub reply_type: String,
    pub has_pdf_attachment: bool,
    pub received_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub processed: bool,
}

/// One tracked fundraising opportunity, one per thread.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::deals)]
pub struct Deal {
    pub id: Uuid,
    pub account_id: Uuid,
    pub thread_id: String,
    pub founder_name: Option<String>,
    pub founder_address: String,
    pub subject: String,
    pub deck_url: Option<String>,
    pub has_deck: bool,
    pub has_team_info: bool,
    pub has_traction: bool,
    pub has_round_info: bool,
    pub stage: String,
    pub alert_sent: bool,
    pub alert_sent_at: Option<DateTime<Utc>>,
    pub followup_count: i32,
    pub last_followup_at: Option<DateTime<Utc>>,
    pub opted_out: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    pub fn basics(&self) -> FourBasics {
        FourBasics {
            has_deck: self.has_deck,
            has_team_info: self.has_team_info,
            has_traction: self.has_traction,
            has_round_info: self.has_round_info,
        }
    }
}

impl From<Deal> for DealResponse {
    fn from(d: Deal) -> Self {
        let basics = d.basics();
        DealResponse {
            id: d.id,
            account_id: d.account_id,
            thread_id: d.thread_id,
            founder_name: d.founder_name,
            founder_address: d.founder_address,
            subject: d.subject,
            deck_url: d.deck_url,
            basics,
            stage: d.stage,
            alert_sent: d.alert_sent,
            followup_count: d.followup_count,
            opted_out: d.opted_out,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::deals)]
pub struct NewDeal {
    pub account_id: Uuid,
    pub thread_id: String,
    pub founder_name: Option<String>,
    pub founder_address: String,
    pub subject: String,
    pub deck_url: Option<String>,
    pub has_deck: bool,
    pub has_team_info: bool,
    pub has_traction: bool,
    pub has_round_info: bool,
    pub stage: String,
}

/// A deferred outbound message tied to a deal and a thread.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::scheduled_notifications)]
pub struct ScheduledNotification {
    pub id: Uuid,
    pub account_id: Uuid,
    pub deal_id: Option<Uuid>,
    pub thread_id: String,
    pub kind: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub send_after: DateTime<Utc>,
    pub state: String,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::scheduled_notifications)]
pub struct NewNotification {
    pub account_id: Uuid,
    pub deal_id: Option<Uuid>,
    pub thread_id: String,
    pub kind: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub send_after: DateTime<Utc>,
    pub state: String,
}
