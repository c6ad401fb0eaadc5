//! Deal lifecycle: one tracked opportunity per (account, thread).
//!
//! Created the first time a thread classifies as deal flow, then updated on
//! every later message in the thread. Structured signals only accumulate,
//! and a routed deal never moves backwards.

use chrono::{Duration as ChronoDuration, Utc};
use diesel_async::AsyncPgConnection;
use tracing::info;

use shared_types::{
    Category, Classification, DealStage, FourBasics, NotificationKind, NotificationState,
};

use crate::classify::MessageFeatures;
use crate::config::AppConfig;
use crate::db::{self, StoreError};
use crate::models::{Account, Deal, NewDeal, NewNotification};

/// Confidence assigned when a message lands on a thread that already has a
/// deal. The thread's history is stronger evidence than anything the
/// two-stage engine could say, so the oracle is skipped entirely.
pub const SHORT_CIRCUIT_CONFIDENCE: f32 = 0.95;

const DECK_HOST_DOMAINS: &[&str] = &[
    "docsend.com",
    "pitch.com",
    "papermark.io",
    "brieflink.com",
    "attach.io",
    "deckdeckgo.com",
];

const TEAM_SIGNALS: &[&str] = &[
    "our team",
    "the team",
    "founded by",
    "co-founder",
    "cofounder",
    "previously at",
    "second-time founder",
    "ex-google",
    "ex-stripe",
    "backgrounds",
];

const TRACTION_SIGNALS: &[&str] = &[
    "mrr",
    "arr",
    "revenue",
    "mom growth",
    "month-over-month",
    "active users",
    "paying customers",
    "retention",
    "waitlist",
    "pilots",
    "lois",
];

const ROUND_SIGNALS: &[&str] = &[
    "raising",
    "round size",
    "pre-seed",
    "seed round",
    "series a",
    "series b",
    "valuation",
    "pre-money",
    "post-money",
    "safe",
    "committed",
    "lead investor",
];

/// Classification for a message on an already-tracked thread.
pub fn short_circuit_classification(links: Vec<String>) -> Classification {
    Classification::new(Category::DealFlow, SHORT_CIRCUIT_CONFIDENCE, links)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// First link pointing at a known deck host, if any.
pub fn find_deck_url(links: &[String]) -> Option<String> {
    links
        .iter()
        .find(|link| {
            let lower = link.to_lowercase();
            DECK_HOST_DOMAINS.iter().any(|host| lower.contains(host))
        })
        .cloned()
}

/// Pure extraction of the four structured signals from one message.
pub fn extract_basics(features: &MessageFeatures) -> FourBasics {
    let mut text = format!("{} {}", features.subject, features.body).to_lowercase();
    if let Some(extra) = &features.attachment_text {
        text.push(' ');
        text.push_str(&extra.to_lowercase());
    }

    FourBasics {
        has_deck: features.has_pdf_attachment || find_deck_url(&features.links).is_some(),
        has_team_info: contains_any(&text, TEAM_SIGNALS),
        has_traction: contains_any(&text, TRACTION_SIGNALS),
        has_round_info: contains_any(&text, ROUND_SIGNALS),
    }
}

/// Stage transition after merging newly observed signals. Routed is
/// terminal; a deal routes once every basic is present or a deck exists;
/// an incomplete deal that has already been engaged once sits in AskMore.
pub fn next_stage(current: DealStage, merged: FourBasics) -> DealStage {
    if current == DealStage::Routed {
        return DealStage::Routed;
    }
    if merged.all_present() || merged.has_deck {
        return DealStage::Routed;
    }
    match current {
        DealStage::New => DealStage::AskMore,
        other => other,
    }
}

/// Body of the acknowledgement/ask-more auto-reply.
pub fn reply_body(founder_name: Option<&str>, basics: FourBasics) -> String {
    let greeting = match founder_name {
        Some(name) => format!("Hi {name},"),
        None => "Hi,".to_string(),
    };

    if basics.all_present() {
        format!(
            "{greeting}\n\nThanks for reaching out and for the detailed materials. \
             I'm routing this to the right partner and we'll follow up shortly.\n\n\
             Best,"
        )
    } else {
        let missing = basics.missing().join(", ");
        format!(
            "{greeting}\n\nThanks for reaching out. To evaluate quickly we'd need a \
             bit more: {missing}. Reply with those and I'll route it to the right \
             partner.\n\nBest,"
        )
    }
}

fn alert_body(account: &Account, deal: &Deal) -> String {
    let founder = deal
        .founder_name
        .clone()
        .unwrap_or_else(|| deal.founder_address.clone());
    format!(
        "New deal in {}: {} from {} ({})",
        account.email_address, deal.subject, founder, deal.stage
    )
}

/// Follow-up nudge text for an active deal.
pub fn followup_body(deal: &Deal) -> String {
    let founder = deal
        .founder_name
        .clone()
        .unwrap_or_else(|| deal.founder_address.clone());
    format!(
        "Still open: {} from {} (stage {}, follow-up {} of 3)",
        deal.subject,
        founder,
        deal.stage,
        deal.followup_count + 1
    )
}

/// Record a deal-flow message against its thread's deal, creating the deal
/// on first sight. Returns the up-to-date deal row.
///
/// Creation races between workers resolve through the unique
/// (account_id, thread_id) constraint: the loser re-reads the winner's row
/// and applies its signals as an update.
pub async fn observe_deal_flow_message(
    conn: &mut AsyncPgConnection,
    config: &AppConfig,
    account: &Account,
    thread_id: &str,
    subject: &str,
    founder_address: &str,
    founder_name: Option<&str>,
    features: &MessageFeatures,
) -> Result<Deal, StoreError> {
    let observed = extract_basics(features);
    let deck_url = find_deck_url(&features.links);

    if let Some(existing) = db::deals::get_by_thread(conn, account.id, thread_id).await? {
        return apply_signals(conn, existing, observed, deck_url).await;
    }

    let new = NewDeal {
        account_id: account.id,
        thread_id: thread_id.to_string(),
        founder_name: founder_name.map(|s| s.to_string()),
        founder_address: founder_address.to_string(),
        subject: subject.to_string(),
        deck_url: deck_url.clone(),
        has_deck: observed.has_deck,
        has_team_info: observed.has_team_info,
        has_traction: observed.has_traction,
        has_round_info: observed.has_round_info,
        stage: if observed.all_present() || observed.has_deck {
            DealStage::Routed.as_str().to_string()
        } else {
            DealStage::New.as_str().to_string()
        },
    };

    let deal = match db::deals::create(conn, new).await {
        Ok(deal) => deal,
        Err(StoreError::UniqueConflict) => {
            // A racing worker created it first; fold our signals into theirs.
            let winner = db::deals::get_by_thread(conn, account.id, thread_id)
                .await?
                .ok_or_else(|| {
                    StoreError::Fatal(anyhow::anyhow!("deal vanished after unique conflict"))
                })?;
            return apply_signals(conn, winner, observed, deck_url).await;
        }
        Err(e) => return Err(e),
    };

    info!(
        deal_id = %deal.id,
        thread_id,
        stage = %deal.stage,
        "tracking new deal"
    );

    schedule_intake_notifications(conn, config, account, &deal).await?;
    Ok(deal)
}

async fn apply_signals(
    conn: &mut AsyncPgConnection,
    deal: Deal,
    observed: FourBasics,
    deck_url: Option<String>,
) -> Result<Deal, StoreError> {
    let merged = deal.basics().merge(observed);
    let current = DealStage::from_str(&deal.stage).unwrap_or(DealStage::New);
    let stage = next_stage(current, merged);
    let deck = deck_url.or_else(|| deal.deck_url.clone());

    if merged == deal.basics() && stage == current && deck == deal.deck_url {
        return Ok(deal);
    }

    db::deals::update_basics_and_stage(conn, deal.id, merged, stage.as_str(), deck.as_deref())
        .await
}

/// Queue the immediate WhatsApp alert and the delayed auto-reply for a
/// freshly created deal. Either can be disabled per account.
async fn schedule_intake_notifications(
    conn: &mut AsyncPgConnection,
    config: &AppConfig,
    account: &Account,
    deal: &Deal,
) -> Result<(), StoreError> {
    let now = Utc::now();

    if let Some(number) = &account.whatsapp_number {
        db::notifications::schedule(
            conn,
            NewNotification {
                account_id: account.id,
                deal_id: Some(deal.id),
                thread_id: deal.thread_id.clone(),
                kind: NotificationKind::WhatsappAlert.as_str().to_string(),
                recipient: number.clone(),
                subject: deal.subject.clone(),
                body: alert_body(account, deal),
                send_after: now,
                state: NotificationState::Pending.as_str().to_string(),
            },
        )
        .await?;
    }

    if account.auto_reply_enabled {
        let delay = ChronoDuration::from_std(config.auto_reply_delay)
            .unwrap_or_else(|_| ChronoDuration::minutes(10));
        db::notifications::schedule(
            conn,
            NewNotification {
                account_id: account.id,
                deal_id: Some(deal.id),
                thread_id: deal.thread_id.clone(),
                kind: NotificationKind::AutoReply.as_str().to_string(),
                recipient: deal.founder_address.clone(),
                subject: format!("Re: {}", deal.subject),
                body: reply_body(deal.founder_name.as_deref(), deal.basics()),
                send_after: now + delay,
                state: NotificationState::Pending.as_str().to_string(),
            },
        )
        .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(subject: &str, body: &str) -> MessageFeatures {
        MessageFeatures {
            subject: subject.to_string(),
            body: body.to_string(),
            sender: "founder@startup.io".to_string(),
            sender_address: "founder@startup.io".to_string(),
            headers: Vec::new(),
            links: Vec::new(),
            attachment_filenames: Vec::new(),
            has_pdf_attachment: false,
            attachment_text: None,
        }
    }

    #[test]
    fn basics_extraction_from_a_complete_pitch() {
        let mut f = features(
            "Acme seed round",
            "Founded by two ex-Stripe engineers, we're at $40k MRR and raising a \
             $2M seed round.",
        );
        f.has_pdf_attachment = true;
        let basics = extract_basics(&f);
        assert!(basics.all_present());
    }

    #[test]
    fn deck_link_counts_as_deck() {
        let mut f = features("Acme", "deck here");
        f.links.push("https://docsend.com/view/abc".to_string());
        let basics = extract_basics(&f);
        assert!(basics.has_deck);
        assert_eq!(
            find_deck_url(&f.links).as_deref(),
            Some("https://docsend.com/view/abc")
        );
    }

    #[test]
    fn sparse_message_leaves_basics_missing() {
        let f = features("hello", "we are building something cool");
        let basics = extract_basics(&f);
        assert!(!basics.has_deck && !basics.has_team_info);
        assert_eq!(basics.missing().len(), 4);
    }

    #[test]
    fn stage_machine_routes_on_complete_basics() {
        let all = FourBasics {
            has_deck: true,
            has_team_info: true,
            has_traction: true,
            has_round_info: true,
        };
        assert_eq!(next_stage(DealStage::New, all), DealStage::Routed);
        assert_eq!(next_stage(DealStage::AskMore, all), DealStage::Routed);
    }

    #[test]
    fn stage_machine_never_leaves_routed() {
        let none = FourBasics::default();
        assert_eq!(next_stage(DealStage::Routed, none), DealStage::Routed);
    }

    #[test]
    fn deck_alone_routes_a_deal() {
        let deck_only = FourBasics {
            has_deck: true,
            ..Default::default()
        };
        assert_eq!(next_stage(DealStage::New, deck_only), DealStage::Routed);
    }

    #[test]
    fn incomplete_deal_moves_to_ask_more() {
        let partial = FourBasics {
            has_team_info: true,
            ..Default::default()
        };
        assert_eq!(next_stage(DealStage::New, partial), DealStage::AskMore);
        assert_eq!(next_stage(DealStage::AskMore, partial), DealStage::AskMore);
    }

    #[test]
    fn reply_asks_for_exactly_the_missing_basics() {
        let partial = FourBasics {
            has_deck: true,
            has_round_info: true,
            ..Default::default()
        };
        let body = reply_body(Some("Jane"), partial);
        assert!(body.starts_with("Hi Jane,"));
        assert!(body.contains("team, traction"));
        assert!(!body.contains("deck,"));
    }

    #[test]
    fn reply_acknowledges_complete_materials() {
        let all = FourBasics {
            has_deck: true,
            has_team_info: true,
            has_traction: true,
            has_round_info: true,
        };
        let body = reply_body(None, all);
        assert!(body.starts_with("Hi,"));
        assert!(body.contains("routing this"));
    }

    #[test]
    fn short_circuit_is_deal_flow_at_fixed_confidence() {
        let c = short_circuit_classification(vec!["https://x.com".to_string()]);
        assert_eq!(c.category, Category::DealFlow);
        assert_eq!(c.confidence, SHORT_CIRCUIT_CONFIDENCE);
        assert_eq!(c.tags, vec!["deal-flow".to_string()]);
    }
}
