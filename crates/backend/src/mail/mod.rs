//! Mail source adapter boundary.
//!
//! The reconciler only ever talks to the mailbox provider through the
//! [`MailSource`] trait, so tests can drive it with an in-memory source and
//! the Gmail implementation stays replaceable.

pub mod gmail;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared_types::LabelDelta;
use thiserror::Error;

/// Typed provider errors, matched structurally by the reconciler. No caller
/// ever inspects error message strings.
#[derive(Debug, Error)]
pub enum MailError {
    /// Provider rate limit (HTTP 429-equivalent); retryable with backoff.
    #[error("provider rate limited")]
    RateLimited,
    /// The history cursor is expired or unrecognized; caller must fall back
    /// to a full listing.
    #[error("history cursor no longer valid")]
    StaleCursor,
    /// Network or transport failure; retryable.
    #[error("transport error: {0}")]
    Transport(anyhow::Error),
    /// A single message payload could not be parsed. Skipped and logged,
    /// never fails a batch.
    #[error("malformed message payload: {0}")]
    Malformed(String),
}

/// Attachment metadata carried on a fetched message. Bodies are fetched
/// separately and only when the classifier wants them.
#[derive(Debug, Clone)]
pub struct AttachmentMeta {
    pub filename: String,
    pub mime_type: String,
    pub attachment_id: Option<String>,
    pub size: Option<i32>,
}

impl AttachmentMeta {
    pub fn is_pdf(&self) -> bool {
        self.mime_type == "application/pdf" || self.filename.to_lowercase().ends_with(".pdf")
    }
}

/// One message as fetched from the provider, before classification.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub from: String,
    pub snippet: String,
    pub body_text: Option<String>,
    pub headers: Vec<(String, String)>,
    pub attachments: Vec<AttachmentMeta>,
    pub label_ids: Vec<String>,
    pub received_at: Option<DateTime<Utc>>,
}

impl FetchedMessage {
    pub fn has_pdf_attachment(&self) -> bool {
        self.attachments.iter().any(|a| a.is_pdf())
    }
}

/// Result of a full mailbox listing.
#[derive(Debug)]
pub struct FullListing {
    pub messages: Vec<FetchedMessage>,
    /// Ids whose detail fetch failed transiently; the caller must recover
    /// them before treating the listing as complete.
    pub failed_ids: Vec<String>,
    /// The provider's cursor at listing time; everything up to here is
    /// covered by the listing.
    pub cursor: String,
}

/// Result of one incremental delta query.
#[derive(Debug, Default)]
pub struct Delta {
    pub added: Vec<FetchedMessage>,
    /// Ids whose detail fetch failed transiently; the caller must recover
    /// them before advancing the cursor past this delta.
    pub failed_ids: Vec<String>,
    pub deleted_ids: Vec<String>,
    pub label_changes: Vec<LabelDelta>,
    pub new_cursor: String,
}

/// Batched detail fetch outcome: partial failure is the normal case, never
/// all-or-nothing. Only malformed payloads are dropped outright; transient
/// per-id failures are reported in `failed_ids` so the caller can retry.
#[derive(Debug, Default)]
pub struct DetailBatch {
    pub messages: Vec<FetchedMessage>,
    pub failed_ids: Vec<String>,
}

#[async_trait]
pub trait MailSource: Send + Sync {
    /// Full listing capped at `limit`, paginated internally, plus the
    /// provider's current cursor.
    async fn list_full(&self, limit: u32) -> Result<FullListing, MailError>;

    /// Single delta query since `since_cursor`. Fails with
    /// [`MailError::StaleCursor`] when the provider no longer recognizes the
    /// cursor.
    async fn list_incremental(&self, since_cursor: &str) -> Result<Delta, MailError>;

    /// Batched fetch of full message details, tolerating per-id failure.
    async fn get_details(&self, ids: &[String]) -> Result<DetailBatch, MailError>;

    /// Fetch one attachment body for text extraction. Best-effort; the
    /// classifier works without it.
    async fn fetch_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, MailError>;

    /// Send a plain-text message from the account, used by the auto-reply
    /// sink.
    async fn send_message(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

/// Parse a "From" header like `"Jane Doe" <jane@fund.com>` into
/// (lowercased address, optional display name).
pub fn parse_from_header(from: &str) -> (String, Option<String>) {
    let from = from.trim();

    if let Some(bracket_start) = from.rfind('<') {
        if let Some(bracket_end) = from.rfind('>') {
            if bracket_end > bracket_start {
                let address = from[bracket_start + 1..bracket_end].trim().to_lowercase();
                let name = from[..bracket_start].trim().trim_matches('"').trim();
                let name = if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                };
                return (address, name);
            }
        }
    }

    (from.to_lowercase(), None)
}

/// Domain part of an address, or empty for malformed input.
pub fn address_domain(address: &str) -> &str {
    address.rsplit('@').next().filter(|d| *d != address).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_header_with_display_name() {
        let (addr, name) = parse_from_header("\"Jane Doe\" <Jane@Fund.COM>");
        assert_eq!(addr, "jane@fund.com");
        assert_eq!(name.as_deref(), Some("Jane Doe"));
    }

    #[test]
    fn from_header_bare_address() {
        let (addr, name) = parse_from_header("founder@startup.io");
        assert_eq!(addr, "founder@startup.io");
        assert_eq!(name, None);
    }

    #[test]
    fn from_header_unclosed_bracket_falls_back() {
        let (addr, name) = parse_from_header("Broken <nope");
        assert_eq!(addr, "broken <nope");
        assert_eq!(name, None);
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(address_domain("a@b.co"), "b.co");
        assert_eq!(address_domain("no-at-sign"), "");
    }

    #[test]
    fn pdf_detection_by_mime_and_extension() {
        let by_mime = AttachmentMeta {
            filename: "deck".into(),
            mime_type: "application/pdf".into(),
            attachment_id: None,
            size: None,
        };
        let by_name = AttachmentMeta {
            filename: "Deck.PDF".into(),
            mime_type: "application/octet-stream".into(),
            attachment_id: None,
            size: None,
        };
        assert!(by_mime.is_pdf());
        assert!(by_name.is_pdf());
    }
}
