//! Gmail implementation of the mail source boundary.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use google_gmail1::api::{ListHistoryResponse, Message, MessagePart};
use google_gmail1::hyper_rustls::HttpsConnector;
use google_gmail1::Gmail;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashSet;

use super::{
    AttachmentMeta, Delta, DetailBatch, FetchedMessage, FullListing, MailError, MailSource,
};
use crate::models::Account;
use shared_types::LabelDelta;

/// Gmail client bound to one connected account.
pub struct GmailSource {
    hub: Gmail<HttpsConnector<HttpConnector>>,
    pub email_address: String,
}

impl GmailSource {
    /// Build a client from an account's stored OAuth refresh token.
    pub async fn from_account(account: &Account) -> anyhow::Result<Self> {
        let client_id = std::env::var("GOOGLE_CLIENT_ID")
            .context("GOOGLE_CLIENT_ID environment variable must be set")?;
        let client_secret = std::env::var("GOOGLE_CLIENT_SECRET")
            .context("GOOGLE_CLIENT_SECRET environment variable must be set")?;

        // Use the yup_oauth2 re-exported by google_gmail1 to avoid version mismatch
        let secret = google_gmail1::yup_oauth2::authorized_user::AuthorizedUserSecret {
            client_id,
            client_secret,
            refresh_token: account.refresh_token.clone(),
            key_type: "authorized_user".to_string(),
        };

        let auth = google_gmail1::yup_oauth2::AuthorizedUserAuthenticator::builder(secret)
            .build()
            .await
            .context("Failed to build authenticator from refresh token")?;

        let connector = google_gmail1::hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .context("Failed to load native TLS roots")?
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(connector);
        let hub = Gmail::new(client, auth);

        Ok(Self {
            hub,
            email_address: account.email_address.clone(),
        })
    }

    async fn current_cursor(&self) -> Result<String, MailError> {
        let (_, profile) = self
            .hub
            .users()
            .get_profile("me")
            .doit()
            .await
            .map_err(map_gmail_error)?;

        profile
            .history_id
            .map(|h| h.to_string())
            .ok_or_else(|| MailError::Transport(anyhow!("no history id in profile")))
    }

    async fn get_message(&self, message_id: &str) -> Result<FetchedMessage, MailError> {
        let (_, message) = self
            .hub
            .users()
            .messages_get("me", message_id)
            .format("full")
            .doit()
            .await
            .map_err(map_gmail_error)?;

        parse_message(message)
    }
}

#[async_trait::async_trait]
impl MailSource for GmailSource {
    async fn list_full(&self, limit: u32) -> Result<FullListing, MailError> {
        // Capture the cursor before listing so nothing arriving mid-listing
        // is skipped by the next incremental fetch.
        let cursor = self.current_cursor().await?;

        let mut ids: Vec<String> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let remaining = (limit as usize).saturating_sub(ids.len());
            if remaining == 0 {
                break;
            }

            let mut call = self
                .hub
                .users()
                .messages_list("me")
                .add_label_ids("INBOX")
                .max_results(remaining.min(100) as u32);
            if let Some(token) = &page_token {
                call = call.page_token(token);
            }

            let (_, response) = call.doit().await.map_err(map_gmail_error)?;

            for msg in response.messages.unwrap_or_default() {
                if let Some(id) = msg.id {
                    ids.push(id);
                }
            }

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        let details = self.get_details(&ids).await?;

        Ok(FullListing {
            messages: details.messages,
            failed_ids: details.failed_ids,
            cursor,
        })
    }

    async fn list_incremental(&self, since_cursor: &str) -> Result<Delta, MailError> {
        // An unparseable stored cursor gets the same treatment as an expired
        // one: the caller falls back to a full listing.
        let start: u64 = since_cursor
            .parse()
            .map_err(|_| MailError::StaleCursor)?;

        let mut added_ids: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        let mut deleted_ids: Vec<String> = Vec::new();
        let mut label_changes: Vec<LabelDelta> = Vec::new();
        let mut latest_history_id: Option<u64> = None;
        let mut page_token: Option<String> = None;

        // Drain the entire delta; missed pages are unrecoverable once the
        // cursor advances.
        loop {
            let mut call = self
                .hub
                .users()
                .history_list("me")
                .start_history_id(start)
                .add_history_types("messageAdded")
                .add_history_types("messageDeleted")
                .add_history_types("labelAdded")
                .add_history_types("labelRemoved");
            if let Some(token) = &page_token {
                call = call.page_token(token);
            }

            let (_, response): (_, ListHistoryResponse) =
                call.doit().await.map_err(map_gmail_error)?;

            if let Some(h) = response.history_id {
                latest_history_id = Some(h);
            }

            for record in response.history.unwrap_or_default() {
                for added in record.messages_added.unwrap_or_default() {
                    if let Some(id) = added.message.and_then(|m| m.id) {
                        if seen.insert(id.clone()) {
                            added_ids.push(id);
                        }
                    }
                }
                for deleted in record.messages_deleted.unwrap_or_default() {
                    if let Some(id) = deleted.message.and_then(|m| m.id) {
                        deleted_ids.push(id);
                    }
                }
                for change in record.labels_added.unwrap_or_default() {
                    if let Some(id) = change.message.and_then(|m| m.id) {
                        label_changes.push(LabelDelta {
                            message_id: id,
                            added: change.label_ids.unwrap_or_default(),
                            removed: Vec::new(),
                        });
                    }
                }
                for change in record.labels_removed.unwrap_or_default() {
                    if let Some(id) = change.message.and_then(|m| m.id) {
                        label_changes.push(LabelDelta {
                            message_id: id,
                            added: Vec::new(),
                            removed: change.label_ids.unwrap_or_default(),
                        });
                    }
                }
            }

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        // Deleted messages never need details; drop them from the add set.
        let deleted_set: HashSet<&String> = deleted_ids.iter().collect();
        added_ids.retain(|id| !deleted_set.contains(id));

        let details = self.get_details(&added_ids).await?;

        let new_cursor = match latest_history_id {
            Some(h) => h.to_string(),
            None => self.current_cursor().await?,
        };

        Ok(Delta {
            added: details.messages,
            failed_ids: details.failed_ids,
            deleted_ids,
            label_changes,
            new_cursor,
        })
    }

    async fn get_details(&self, ids: &[String]) -> Result<DetailBatch, MailError> {
        let mut batch = DetailBatch::default();

        for id in ids {
            match self.get_message(id).await {
                Ok(message) => batch.messages.push(message),
                // Rate limits abort the batch so the caller can back off.
                Err(MailError::RateLimited) => return Err(MailError::RateLimited),
                // A payload that cannot be parsed never will be; skip it.
                Err(MailError::Malformed(reason)) => {
                    tracing::warn!("Skipping malformed message {}: {}", id, reason);
                }
                // Transient failures are reported so the caller can retry
                // before concluding the batch is complete.
                Err(e) => {
                    tracing::warn!("Failed to fetch message {}: {}", id, e);
                    batch.failed_ids.push(id.clone());
                }
            }
        }

        Ok(batch)
    }

    async fn fetch_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, MailError> {
        let (_, body) = self
            .hub
            .users()
            .messages_attachments_get("me", message_id, attachment_id)
            .doit()
            .await
            .map_err(map_gmail_error)?;

        Ok(body.data.unwrap_or_default())
    }

    async fn send_message(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let raw = format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
            self.email_address, to, subject, body
        );

        let mime_type: mime::Mime = "message/rfc822"
            .parse()
            .map_err(|_| MailError::Transport(anyhow!("invalid rfc822 mime type")))?;

        self.hub
            .users()
            .messages_send(Message::default(), "me")
            .upload(std::io::Cursor::new(raw.into_bytes()), mime_type)
            .await
            .map_err(map_gmail_error)?;

        tracing::info!("Sent message to {} from {}", to, self.email_address);
        Ok(())
    }
}

/// Map the Gmail API error surface onto the typed adapter errors. A 404 on
/// history.list means the start history id has expired.
fn map_gmail_error(e: google_gmail1::Error) -> MailError {
    use google_gmail1::Error as G;

    match e {
        G::Failure(response) => match response.status().as_u16() {
            404 => MailError::StaleCursor,
            429 => MailError::RateLimited,
            status => MailError::Transport(anyhow!("gmail http status {}", status)),
        },
        G::BadRequest(value) => {
            let code = value
                .pointer("/error/code")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            match code {
                404 => MailError::StaleCursor,
                429 => MailError::RateLimited,
                _ => MailError::Transport(anyhow!("gmail api error: {}", value)),
            }
        }
        other => MailError::Transport(anyhow!("gmail transport: {}", other)),
    }
}

fn parse_message(message: Message) -> Result<FetchedMessage, MailError> {
    let id = message
        .id
        .clone()
        .ok_or_else(|| MailError::Malformed("message without id".to_string()))?;
    let thread_id = message
        .thread_id
        .clone()
        .ok_or_else(|| MailError::Malformed(format!("message {} without thread id", id)))?;
    let snippet = message.snippet.clone().unwrap_or_default();
    let label_ids = message.label_ids.clone().unwrap_or_default();

    let mut subject = String::new();
    let mut from = String::new();
    let mut received_at = None;
    let mut headers = Vec::new();

    if let Some(payload) = &message.payload {
        for header in payload.headers.iter().flatten() {
            let name = header.name.clone().unwrap_or_default();
            let value = header.value.clone().unwrap_or_default();
            match name.as_str() {
                "Subject" => subject = value.clone(),
                "From" => from = value.clone(),
                "Date" => received_at = parse_date(&value),
                _ => {}
            }
            headers.push((name, value));
        }
    }

    let body_text = extract_body(&message);
    let attachments = collect_attachments(&message);

    Ok(FetchedMessage {
        id,
        thread_id,
        subject,
        from,
        snippet,
        body_text,
        headers,
        attachments,
        label_ids,
        received_at,
    })
}

fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_str)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn extract_body(message: &Message) -> Option<String> {
    let payload = message.payload.as_ref()?;

    if let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_ref()) {
        if let Ok(decoded) = String::from_utf8(data.clone()) {
            return Some(decoded);
        }
    }

    let mut text_body = None;
    if let Some(parts) = &payload.parts {
        extract_text_from_parts(parts, &mut text_body);
    }
    text_body
}

fn extract_text_from_parts(parts: &[MessagePart], text_body: &mut Option<String>) {
    for part in parts {
        match part.mime_type.as_deref() {
            Some("text/plain") if text_body.is_none() => {
                if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_ref()) {
                    if let Ok(decoded) = String::from_utf8(data.clone()) {
                        *text_body = Some(decoded);
                    }
                }
            }
            Some(mime) if mime.starts_with("multipart/") => {
                if let Some(nested) = &part.parts {
                    extract_text_from_parts(nested, text_body);
                }
            }
            _ => {}
        }
    }
}

fn collect_attachments(message: &Message) -> Vec<AttachmentMeta> {
    let mut out = Vec::new();
    if let Some(parts) = message.payload.as_ref().and_then(|p| p.parts.as_ref()) {
        collect_attachments_from_parts(parts, &mut out);
    }
    out
}

fn collect_attachments_from_parts(parts: &[MessagePart], out: &mut Vec<AttachmentMeta>) {
    for part in parts {
        if let Some(filename) = &part.filename {
            if !filename.is_empty() {
                out.push(AttachmentMeta {
                    filename: filename.clone(),
                    mime_type: part.mime_type.clone().unwrap_or_default(),
                    attachment_id: part.body.as_ref().and_then(|b| b.attachment_id.clone()),
                    size: part.body.as_ref().and_then(|b| b.size),
                });
            }
        }

        if let Some(nested) = &part.parts {
            collect_attachments_from_parts(nested, out);
        }
    }
}
