//! Outbound notification dispatch.
//!
//! Pending notifications are claimed under row locks and re-checked against
//! current state immediately before sending, so a founder's opt-out, a human
//! reply, or a racing dispatcher between scheduling and dispatch always wins
//! over the queue. Success is recorded only after the sink reports it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use shared_types::{DealStage, NotificationKind, NotificationState};

use crate::config::AppConfig;
use crate::db::{self, DbPool};
use crate::deals;
use crate::mail::{gmail::GmailSource, MailSource};
use crate::models::{Account, Deal, NewNotification, ScheduledNotification};
use crate::sync::SyncError;

const MAX_SEND_ATTEMPTS: i32 = 5;
const RETRY_DELAY_SECS: i64 = 120;

#[derive(Debug, Error)]
pub enum SinkError {
    /// Send failed but may succeed later; the notification goes back in the
    /// queue with its attempt counter bumped.
    #[error("transient delivery failure: {0}")]
    Transient(anyhow::Error),
    /// Send can never succeed (bad recipient, misconfigured channel).
    #[error("permanent delivery failure: {0}")]
    Permanent(anyhow::Error),
}

#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(
        &self,
        account: &Account,
        notification: &ScheduledNotification,
    ) -> Result<(), SinkError>;
}

/// Email sink sending replies from the account's own mailbox.
pub struct GmailReplySink;

#[async_trait::async_trait]
impl NotificationSink for GmailReplySink {
    async fn deliver(
        &self,
        account: &Account,
        notification: &ScheduledNotification,
    ) -> Result<(), SinkError> {
        let source = GmailSource::from_account(account)
            .await
            .map_err(|e| SinkError::Transient(anyhow::anyhow!("gmail auth: {e}")))?;

        source
            .send_message(
                &notification.recipient,
                &notification.subject,
                &notification.body,
            )
            .await
            .map_err(|e| SinkError::Transient(anyhow::anyhow!("gmail send: {e}")))
    }
}

/// WhatsApp sink posting to the configured gateway.
pub struct WhatsappSink {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl WhatsappSink {
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let endpoint = config.whatsapp_endpoint.clone()?;
        Some(Self {
            client: reqwest::Client::new(),
            endpoint,
            token: config.whatsapp_token.clone(),
        })
    }
}

#[async_trait::async_trait]
impl NotificationSink for WhatsappSink {
    async fn deliver(
        &self,
        _account: &Account,
        notification: &ScheduledNotification,
    ) -> Result<(), SinkError> {
        let mut req = self.client.post(&self.endpoint).json(&serde_json::json!({
            "to": notification.recipient,
            "body": notification.body,
        }));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let response = req
            .send()
            .await
            .map_err(|e| SinkError::Transient(anyhow::anyhow!("whatsapp gateway: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(SinkError::Permanent(anyhow::anyhow!(
                "whatsapp gateway rejected send: {status}"
            )))
        } else {
            Err(SinkError::Transient(anyhow::anyhow!(
                "whatsapp gateway status {status}"
            )))
        }
    }
}

/// What the pre-send re-check decided for one claimed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreSendDecision {
    Send,
    Cancel(&'static str),
}

/// Re-check a claimed notification against current state. Pure so the whole
/// decision table is testable without a database.
pub fn pre_send_decision(
    kind: NotificationKind,
    account_exists: bool,
    deal: Option<&Deal>,
    human_replied: bool,
    max_followups: i32,
) -> PreSendDecision {
    // An erased account orphans its queue; cancelling here keeps one dead
    // row from being re-claimed and rolled back on every dispatch tick.
    if !account_exists {
        return PreSendDecision::Cancel("account no longer exists");
    }

    if let Some(deal) = deal {
        if deal.opted_out {
            return PreSendDecision::Cancel("founder opted out");
        }
    }

    match kind {
        NotificationKind::AutoReply => {
            if human_replied {
                PreSendDecision::Cancel("human already replied")
            } else {
                PreSendDecision::Send
            }
        }
        NotificationKind::WhatsappAlert => match deal {
            None => PreSendDecision::Cancel("deal no longer exists"),
            Some(deal) if deal.alert_sent => {
                PreSendDecision::Cancel("alert already sent by a racing dispatcher")
            }
            Some(_) => PreSendDecision::Send,
        },
        NotificationKind::WhatsappFollowUp => match deal {
            None => PreSendDecision::Cancel("deal no longer exists"),
            Some(deal) => {
                let stage = DealStage::from_str(&deal.stage).unwrap_or(DealStage::Routed);
                if human_replied {
                    PreSendDecision::Cancel("human already replied")
                } else if !stage.is_active() {
                    PreSendDecision::Cancel("deal no longer active")
                } else if deal.followup_count >= max_followups {
                    PreSendDecision::Cancel("follow-up budget exhausted")
                } else {
                    PreSendDecision::Send
                }
            }
        },
        NotificationKind::ScheduledEmail => PreSendDecision::Send,
    }
}

pub struct Dispatcher {
    email: Arc<dyn NotificationSink>,
    whatsapp: Option<Arc<dyn NotificationSink>>,
}

impl Dispatcher {
    pub fn new(email: Arc<dyn NotificationSink>, whatsapp: Option<Arc<dyn NotificationSink>>) -> Self {
        Self { email, whatsapp }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            email: Arc::new(GmailReplySink),
            whatsapp: WhatsappSink::from_config(config)
                .map(|s| Arc::new(s) as Arc<dyn NotificationSink>),
        }
    }

    /// Drain every due notification once. Claims run under row locks inside
    /// one transaction; the locks are the mutual exclusion between racing
    /// dispatcher loops.
    pub async fn run_due(&self, pool: &DbPool, config: &AppConfig) -> Result<usize, SyncError> {
        let mut conn_obj = pool
            .get()
            .await
            .map_err(|e| SyncError::Transient(anyhow::anyhow!("connection pool: {e}")))?;
        let conn: &mut AsyncPgConnection = &mut conn_obj;
        let now = Utc::now();

        let sent = conn
            .transaction::<usize, SyncError, _>(|conn| {
                async move {
                    let due = db::notifications::claim_due(conn, now, 50).await?;
                    let mut sent = 0;

                    for notification in due {
                        if self.dispatch_one(conn, config, &notification, now).await? {
                            sent += 1;
                        }
                    }

                    Ok(sent)
                }
                .scope_boxed()
            })
            .await?;

        Ok(sent)
    }

    async fn dispatch_one(
        &self,
        conn: &mut AsyncPgConnection,
        config: &AppConfig,
        notification: &ScheduledNotification,
        now: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        let Some(kind) = NotificationKind::from_str(&notification.kind) else {
            warn!(id = %notification.id, kind = %notification.kind, "unknown notification kind");
            db::notifications::mark_failed(conn, notification.id).await?;
            return Ok(false);
        };

        let account = db::accounts::find_by_id(conn, notification.account_id).await?;
        let deal = match notification.deal_id {
            Some(deal_id) => db::deals::find_by_id(conn, deal_id).await?,
            None => None,
        };
        let human_replied = match &account {
            Some(account)
                if matches!(
                    kind,
                    NotificationKind::AutoReply | NotificationKind::WhatsappFollowUp
                ) =>
            {
                db::messages::exists_human_reply(
                    conn,
                    account.id,
                    &notification.thread_id,
                    &account.email_address,
                )
                .await?
            }
            _ => false,
        };

        match pre_send_decision(
            kind,
            account.is_some(),
            deal.as_ref(),
            human_replied,
            config.max_followups,
        ) {
            PreSendDecision::Cancel(reason) => {
                info!(id = %notification.id, kind = %notification.kind, reason, "notification cancelled");
                db::notifications::mark_cancelled(conn, notification.id).await?;
                return Ok(false);
            }
            PreSendDecision::Send => {}
        }
        let Some(account) = account else {
            return Ok(false);
        };

        let sink = if kind.is_whatsapp() {
            match &self.whatsapp {
                Some(sink) => sink.as_ref(),
                None => {
                    warn!(id = %notification.id, "whatsapp channel not configured");
                    db::notifications::mark_failed(conn, notification.id).await?;
                    return Ok(false);
                }
            }
        } else {
            self.email.as_ref()
        };

        match sink.deliver(&account, notification).await {
            Ok(()) => {
                db::notifications::mark_sent(conn, notification.id).await?;
                self.after_send(conn, config, &account, kind, deal, now).await?;
                Ok(true)
            }
            Err(SinkError::Permanent(err)) => {
                warn!(id = %notification.id, error = %err, "permanent delivery failure");
                db::notifications::mark_failed(conn, notification.id).await?;
                Ok(false)
            }
            Err(SinkError::Transient(err)) => {
                if notification.attempts + 1 >= MAX_SEND_ATTEMPTS {
                    warn!(id = %notification.id, error = %err, "delivery retries exhausted");
                    db::notifications::mark_failed(conn, notification.id).await?;
                } else {
                    warn!(
                        id = %notification.id,
                        attempt = notification.attempts + 1,
                        error = %err,
                        "delivery failed, retrying later"
                    );
                    db::notifications::retry_later(
                        conn,
                        notification.id,
                        now + ChronoDuration::seconds(RETRY_DELAY_SECS),
                    )
                    .await?;
                }
                Ok(false)
            }
        }
    }

    /// Post-send bookkeeping: flip the alert flag, count the follow-up, and
    /// queue the next one while the deal stays active.
    async fn after_send(
        &self,
        conn: &mut AsyncPgConnection,
        config: &AppConfig,
        account: &Account,
        kind: NotificationKind,
        deal: Option<Deal>,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let Some(deal) = deal else {
            return Ok(());
        };

        match kind {
            NotificationKind::WhatsappAlert => {
                db::deals::mark_alert_sent(conn, deal.id).await?;
                self.schedule_followup(conn, config, account, &deal, 0, now).await?;
            }
            NotificationKind::WhatsappFollowUp => {
                let updated = db::deals::record_followup(conn, deal.id).await?;
                self.schedule_followup(conn, config, account, &updated, updated.followup_count, now)
                    .await?;
            }
            NotificationKind::AutoReply | NotificationKind::ScheduledEmail => {}
        }

        Ok(())
    }

    async fn schedule_followup(
        &self,
        conn: &mut AsyncPgConnection,
        config: &AppConfig,
        account: &Account,
        deal: &Deal,
        followups_sent: i32,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let Some(number) = &account.whatsapp_number else {
            return Ok(());
        };
        let stage = DealStage::from_str(&deal.stage).unwrap_or(DealStage::Routed);
        if !stage.is_active() || deal.opted_out || followups_sent >= config.max_followups {
            return Ok(());
        }

        let interval = ChronoDuration::from_std(config.followup_interval)
            .unwrap_or_else(|_| ChronoDuration::hours(6));
        db::notifications::schedule(
            conn,
            NewNotification {
                account_id: account.id,
                deal_id: Some(deal.id),
                thread_id: deal.thread_id.clone(),
                kind: NotificationKind::WhatsappFollowUp.as_str().to_string(),
                recipient: number.clone(),
                subject: deal.subject.clone(),
                body: deals::followup_body(deal),
                send_after: now + interval,
                state: NotificationState::Pending.as_str().to_string(),
            },
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn deal(stage: DealStage, alert_sent: bool, followup_count: i32, opted_out: bool) -> Deal {
        Deal {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            thread_id: "t1".to_string(),
            founder_name: Some("Jane".to_string()),
            founder_address: "jane@startup.io".to_string(),
            subject: "Acme seed".to_string(),
            deck_url: None,
            has_deck: true,
            has_team_info: false,
            has_traction: false,
            has_round_info: false,
            stage: stage.as_str().to_string(),
            alert_sent,
            alert_sent_at: None,
            followup_count,
            last_followup_at: None,
            opted_out,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn auto_reply_cancels_after_human_reply() {
        let d = deal(DealStage::New, false, 0, false);
        assert_eq!(
            pre_send_decision(NotificationKind::AutoReply, true, Some(&d), true, 3),
            PreSendDecision::Cancel("human already replied")
        );
        assert_eq!(
            pre_send_decision(NotificationKind::AutoReply, true, Some(&d), false, 3),
            PreSendDecision::Send
        );
    }

    #[test]
    fn opt_out_cancels_everything() {
        let d = deal(DealStage::New, false, 0, true);
        for kind in [
            NotificationKind::AutoReply,
            NotificationKind::WhatsappAlert,
            NotificationKind::WhatsappFollowUp,
        ] {
            assert!(matches!(
                pre_send_decision(kind, true, Some(&d), false, 3),
                PreSendDecision::Cancel(_)
            ));
        }
    }

    #[test]
    fn racing_alert_send_is_a_no_op() {
        let d = deal(DealStage::New, true, 0, false);
        assert!(matches!(
            pre_send_decision(NotificationKind::WhatsappAlert, true, Some(&d), false, 3),
            PreSendDecision::Cancel(_)
        ));
    }

    #[test]
    fn alert_without_a_deal_row_cancels() {
        assert!(matches!(
            pre_send_decision(NotificationKind::WhatsappAlert, true, None, false, 3),
            PreSendDecision::Cancel(_)
        ));
    }

    #[test]
    fn erased_account_cancels_every_kind() {
        let d = deal(DealStage::New, false, 0, false);
        for kind in [
            NotificationKind::AutoReply,
            NotificationKind::WhatsappAlert,
            NotificationKind::WhatsappFollowUp,
            NotificationKind::ScheduledEmail,
        ] {
            assert_eq!(
                pre_send_decision(kind, false, Some(&d), false, 3),
                PreSendDecision::Cancel("account no longer exists")
            );
        }
    }

    #[test]
    fn followups_stop_on_routed_deals_and_at_the_cap() {
        let routed = deal(DealStage::Routed, true, 1, false);
        assert!(matches!(
            pre_send_decision(NotificationKind::WhatsappFollowUp, true, Some(&routed), false, 3),
            PreSendDecision::Cancel(_)
        ));

        let capped = deal(DealStage::AskMore, true, 3, false);
        assert!(matches!(
            pre_send_decision(NotificationKind::WhatsappFollowUp, true, Some(&capped), false, 3),
            PreSendDecision::Cancel(_)
        ));

        let live = deal(DealStage::AskMore, true, 2, false);
        assert_eq!(
            pre_send_decision(NotificationKind::WhatsappFollowUp, true, Some(&live), false, 3),
            PreSendDecision::Send
        );
    }

    #[test]
    fn followups_stop_once_a_human_replies() {
        let live = deal(DealStage::AskMore, true, 0, false);
        assert!(matches!(
            pre_send_decision(NotificationKind::WhatsappFollowUp, true, Some(&live), true, 3),
            PreSendDecision::Cancel(_)
        ));
    }
}
