use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of triage categories.
///
/// Every consumption site (tag derivation, reply selection, deal extraction)
/// matches exhaustively on this enum so that adding a category is a
/// compile-time-checked change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    DealFlow,
    Hiring,
    Networking,
    Spam,
    General,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::DealFlow => "deal_flow",
            Category::Hiring => "hiring",
            Category::Networking => "networking",
            Category::Spam => "spam",
            Category::General => "general",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "deal_flow" => Some(Category::DealFlow),
            "hiring" => Some(Category::Hiring),
            "networking" => Some(Category::Networking),
            "spam" => Some(Category::Spam),
            "general" => Some(Category::General),
            _ => None,
        }
    }

    /// The single tag derived 1:1 from the category.
    pub fn tag(&self) -> &'static str {
        match self {
            Category::DealFlow => "deal-flow",
            Category::Hiring => "hiring",
            Category::Networking => "networking",
            Category::Spam => "spam",
            Category::General => "general",
        }
    }

    /// Which reply template family applies to a message of this category.
    pub fn reply_type(&self) -> ReplyType {
        match self {
            Category::DealFlow => ReplyType::DealAck,
            Category::Hiring => ReplyType::Forward,
            Category::Networking => ReplyType::Scheduling,
            Category::Spam => ReplyType::None,
            Category::General => ReplyType::None,
        }
    }
}

/// Reply template family derived from the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyType {
    DealAck,
    Forward,
    Scheduling,
    None,
}

impl ReplyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyType::DealAck => "deal_ack",
            ReplyType::Forward => "forward",
            ReplyType::Scheduling => "scheduling",
            ReplyType::None => "none",
        }
    }
}

/// Final classification for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    pub confidence: f32,
    pub tags: Vec<String>,
    pub links: Vec<String>,
}

impl Classification {
    pub fn new(category: Category, confidence: f32, links: Vec<String>) -> Self {
        Classification {
            category,
            confidence,
            tags: vec![category.tag().to_string()],
            links,
        }
    }
}

// ============================================================================
// Oracle contract
// ============================================================================

/// Request payload for the LLM classification oracle.
///
/// The body is truncated and header/link lists are capped by the caller
/// before this struct is built; the oracle never sees unbounded input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleRequest {
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub headers: Vec<(String, String)>,
    pub links: Vec<String>,
    pub has_pdf_attachment: bool,
    pub deterministic_category: Category,
}

/// Label vocabulary the oracle is allowed to answer with.
///
/// Anything outside this set fails deserialization and is treated as an
/// oracle failure by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleLabel {
    Dealflow,
    Hiring,
    Networking,
    Spam,
    General,
}

impl OracleLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleLabel::Dealflow => "dealflow",
            OracleLabel::Hiring => "hiring",
            OracleLabel::Networking => "networking",
            OracleLabel::Spam => "spam",
            OracleLabel::General => "general",
        }
    }

    pub fn to_category(self) -> Category {
        match self {
            OracleLabel::Dealflow => Category::DealFlow,
            OracleLabel::Hiring => Category::Hiring,
            OracleLabel::Networking => Category::Networking,
            OracleLabel::Spam => Category::Spam,
            OracleLabel::General => Category::General,
        }
    }
}

/// Strict response contract for the oracle. Missing or unknown fields are a
/// contract violation, not a partial success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleResponse {
    pub label: OracleLabel,
    pub confidence: f32,
    pub rationale: String,
    #[serde(default)]
    pub signals: Vec<String>,
}

// ============================================================================
// Deals
// ============================================================================

/// The four structured signals gating a deal's lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FourBasics {
    pub has_deck: bool,
    pub has_team_info: bool,
    pub has_traction: bool,
    pub has_round_info: bool,
}

impl FourBasics {
    pub fn all_present(&self) -> bool {
        self.has_deck && self.has_team_info && self.has_traction && self.has_round_info
    }

    /// Names of the basics still missing, for ask-more messaging.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if !self.has_deck {
            out.push("deck");
        }
        if !self.has_team_info {
            out.push("team");
        }
        if !self.has_traction {
            out.push("traction");
        }
        if !self.has_round_info {
            out.push("round info");
        }
        out
    }

    /// Merge newly observed signals into the accumulated set. Signals only
    /// ever accumulate; a later message cannot un-observe a basic.
    pub fn merge(&self, other: FourBasics) -> FourBasics {
        FourBasics {
            has_deck: self.has_deck || other.has_deck,
            has_team_info: self.has_team_info || other.has_team_info,
            has_traction: self.has_traction || other.has_traction,
            has_round_info: self.has_round_info || other.has_round_info,
        }
    }
}

/// Deal lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStage {
    New,
    AskMore,
    Routed,
}

impl DealStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStage::New => "new",
            DealStage::AskMore => "ask_more",
            DealStage::Routed => "routed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "new" => Some(DealStage::New),
            "ask_more" => Some(DealStage::AskMore),
            "routed" => Some(DealStage::Routed),
            _ => None,
        }
    }

    /// Follow-up messaging only runs while a deal is still being worked.
    pub fn is_active(&self) -> bool {
        matches!(self, DealStage::New | DealStage::AskMore)
    }
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    AutoReply,
    WhatsappAlert,
    WhatsappFollowUp,
    ScheduledEmail,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::AutoReply => "auto_reply",
            NotificationKind::WhatsappAlert => "whatsapp_alert",
            NotificationKind::WhatsappFollowUp => "whatsapp_follow_up",
            NotificationKind::ScheduledEmail => "scheduled_email",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "auto_reply" => Some(NotificationKind::AutoReply),
            "whatsapp_alert" => Some(NotificationKind::WhatsappAlert),
            "whatsapp_follow_up" => Some(NotificationKind::WhatsappFollowUp),
            "scheduled_email" => Some(NotificationKind::ScheduledEmail),
            _ => None,
        }
    }

    /// Whether this notification goes out over WhatsApp or email.
    pub fn is_whatsapp(&self) -> bool {
        matches!(
            self,
            NotificationKind::WhatsappAlert | NotificationKind::WhatsappFollowUp
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationState {
    Pending,
    Sent,
    Cancelled,
    Failed,
}

impl NotificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationState::Pending => "pending",
            NotificationState::Sent => "sent",
            NotificationState::Cancelled => "cancelled",
            NotificationState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NotificationState::Pending),
            "sent" => Some(NotificationState::Sent),
            "cancelled" => Some(NotificationState::Cancelled),
            "failed" => Some(NotificationState::Failed),
            _ => None,
        }
    }
}

// ============================================================================
// Ephemeral label/read-state deltas
// ============================================================================

/// One observed label change on a message, delivered at-most-once to the UI
/// and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelDelta {
    pub message_id: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

// ============================================================================
// API responses
// ============================================================================

/// API response for a classified message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub account_id: Uuid,
    pub gmail_id: String,
    pub thread_id: String,
    pub sender: String,
    pub sender_address: String,
    pub subject: String,
    pub snippet: Option<String>,
    pub category: String,
    pub confidence: f32,
    pub tags: Vec<String>,
    pub reply_type: String,
    pub has_pdf_attachment: bool,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
}

/// API response for a tracked deal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealResponse {
    pub id: Uuid,
    pub account_id: Uuid,
    pub thread_id: String,
    pub founder_name: Option<String>,
    pub founder_address: String,
    pub subject: String,
    pub deck_url: Option<String>,
    pub basics: FourBasics,
    pub stage: String,
    pub alert_sent: bool,
    pub followup_count: i32,
    pub opted_out: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome summary of one reconciliation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub fetched: usize,
    pub classified: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub full_sync: bool,
    pub cursor: Option<String>,
}

/// Query parameters for listing messages.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessageListQuery {
    pub account_id: Option<Uuid>,
    pub category: Option<String>,
    pub processed: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_strings() {
        for cat in [
            Category::DealFlow,
            Category::Hiring,
            Category::Networking,
            Category::Spam,
            Category::General,
        ] {
            assert_eq!(Category::from_str(cat.as_str()), Some(cat));
        }
        assert_eq!(Category::from_str("bogus"), None);
    }

    #[test]
    fn oracle_label_vocabulary_is_closed() {
        let ok: OracleResponse = serde_json::from_str(
            r#"{"label":"dealflow","confidence":0.9,"rationale":"deck link","signals":["docsend"]}"#,
        )
        .unwrap();
        assert_eq!(ok.label, OracleLabel::Dealflow);

        let bad = serde_json::from_str::<OracleResponse>(
            r#"{"label":"investment","confidence":0.9,"rationale":"x"}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn basics_merge_only_accumulates() {
        let first = FourBasics {
            has_deck: true,
            ..Default::default()
        };
        let second = FourBasics {
            has_round_info: true,
            ..Default::default()
        };
        let merged = first.merge(second);
        assert!(merged.has_deck && merged.has_round_info);
        assert_eq!(merged.missing(), vec!["team", "traction"]);
        assert!(!merged.all_present());
    }

    #[test]
    fn stage_activity_gates_followups() {
        assert!(DealStage::New.is_active());
        assert!(DealStage::AskMore.is_active());
        assert!(!DealStage::Routed.is_active());
    }
}
