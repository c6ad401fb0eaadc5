//! Mailbox reconciliation.
//!
//! One sync run per account: pick full or incremental fetch, pull messages
//! through the provider adapter, classify, and commit in small chunks so a
//! crash mid-run loses at most one chunk. The account's history cursor only
//! advances after everything it covers is committed; re-running a batch is
//! always safe because inserts are idempotent.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection};
use thiserror::Error;
use tracing::{info, warn};

use shared_types::{Category, SyncReport};

use crate::attachments::{AttachmentExtractor, PlainTextExtractor};
use crate::classify::{build_features, extract_links, Classifier, MessageFeatures};
use crate::config::AppConfig;
use crate::context::LabelDeltaCache;
use crate::db::{self, messages::ClaimDirection, messages::UpsertOutcome, DbPool, StoreError};
use crate::deals;
use crate::mail::{parse_from_header, FetchedMessage, MailError, MailSource};
use crate::models::{Account, MessageRecord, NewMessage};

const RATE_LIMIT_ATTEMPTS: u32 = 3;
const RATE_LIMIT_BASE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SyncError {
    /// Provider rate limit survived the retry budget; the scheduler backs
    /// off until the next cycle.
    #[error("provider rate limited")]
    RateLimited,
    #[error("transient sync failure: {0}")]
    Transient(anyhow::Error),
    #[error("sync failure: {0}")]
    Fatal(anyhow::Error),
}

impl From<MailError> for SyncError {
    fn from(e: MailError) -> Self {
        match e {
            MailError::RateLimited => SyncError::RateLimited,
            MailError::StaleCursor => {
                SyncError::Fatal(anyhow::anyhow!("history cursor stale after full fallback"))
            }
            MailError::Transport(inner) => SyncError::Transient(inner),
            MailError::Malformed(msg) => SyncError::Transient(anyhow::anyhow!(msg)),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            // Insert races are absorbed at the call sites; one escaping is a
            // logic bug but still retryable.
            StoreError::UniqueConflict => {
                SyncError::Transient(anyhow::anyhow!("unexpected unique conflict"))
            }
            StoreError::Transient(inner) => SyncError::Transient(anyhow::Error::new(inner)),
            StoreError::Fatal(inner) => SyncError::Fatal(inner),
        }
    }
}

impl From<diesel::result::Error> for SyncError {
    fn from(e: diesel::result::Error) -> Self {
        StoreError::from(e).into()
    }
}

/// Which listing strategy a sync run uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchPlan {
    Full,
    Incremental(String),
}

/// Pick the fetch strategy. A stored cursor is only trusted when the store
/// actually has messages behind it; a cursor over an empty store means the
/// store was reset and must be rebuilt from a full listing.
pub fn choose_fetch(
    stored_cursor: Option<&str>,
    store_has_messages: bool,
    force_full: bool,
) -> FetchPlan {
    if force_full {
        return FetchPlan::Full;
    }
    match stored_cursor {
        Some(cursor) if store_has_messages => FetchPlan::Incremental(cursor.to_string()),
        _ => FetchPlan::Full,
    }
}

/// Everything one fetch produced, regardless of strategy.
#[derive(Debug)]
pub struct FetchOutcome {
    pub added: Vec<FetchedMessage>,
    pub deleted_ids: Vec<String>,
    pub label_changes: Vec<shared_types::LabelDelta>,
    pub new_cursor: String,
    pub full_sync: bool,
}

async fn with_rate_limit_retry<T, F, Fut>(mut op: F) -> Result<T, MailError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MailError>>,
{
    let mut backoff = RATE_LIMIT_BASE_BACKOFF;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(MailError::RateLimited) if attempt < RATE_LIMIT_ATTEMPTS => {
                warn!(attempt, backoff_secs = backoff.as_secs(), "rate limited, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Re-fetch details the listing could not load. Ids that still fail abort
/// the run so the cursor never advances past a message that was never
/// stored; the next sync picks them up from the unchanged cursor.
async fn recover_failed_details(
    source: &dyn MailSource,
    failed: Vec<String>,
) -> Result<Vec<FetchedMessage>, SyncError> {
    if failed.is_empty() {
        return Ok(Vec::new());
    }

    warn!(count = failed.len(), "retrying failed message detail fetches");
    let batch = with_rate_limit_retry(|| source.get_details(&failed)).await?;
    if !batch.failed_ids.is_empty() {
        return Err(SyncError::Transient(anyhow::anyhow!(
            "{} message details still unavailable, holding the cursor",
            batch.failed_ids.len()
        )));
    }

    Ok(batch.messages)
}

async fn full_fetch(source: &dyn MailSource, cap: u32) -> Result<FetchOutcome, SyncError> {
    let listing = with_rate_limit_retry(|| source.list_full(cap)).await?;
    let mut added = listing.messages;
    added.extend(recover_failed_details(source, listing.failed_ids).await?);

    Ok(FetchOutcome {
        added,
        deleted_ids: Vec::new(),
        label_changes: Vec::new(),
        new_cursor: listing.cursor,
        full_sync: true,
    })
}

/// Execute the fetch plan. A stale cursor on the incremental path falls
/// back to a full listing exactly once; a second stale error is fatal.
pub async fn fetch_phase(
    source: &dyn MailSource,
    plan: FetchPlan,
    full_cap: u32,
) -> Result<FetchOutcome, SyncError> {
    match plan {
        FetchPlan::Full => full_fetch(source, full_cap).await,
        FetchPlan::Incremental(cursor) => {
            match with_rate_limit_retry(|| source.list_incremental(&cursor)).await {
                Ok(delta) => {
                    let mut added = delta.added;
                    added.extend(recover_failed_details(source, delta.failed_ids).await?);
                    Ok(FetchOutcome {
                        added,
                        deleted_ids: delta.deleted_ids,
                        label_changes: delta.label_changes,
                        new_cursor: delta.new_cursor,
                        full_sync: false,
                    })
                }
                Err(MailError::StaleCursor) => {
                    warn!("history cursor rejected, falling back to full listing");
                    full_fetch(source, full_cap).await
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// Drop messages already in the store and duplicates within the batch
/// itself. Returns the surviving messages and the skip count.
pub fn dedupe_batch(
    batch: Vec<FetchedMessage>,
    known: &HashSet<String>,
) -> (Vec<FetchedMessage>, usize) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    let mut skipped = 0;

    for msg in batch {
        if known.contains(&msg.id) || !seen.insert(msg.id.clone()) {
            skipped += 1;
        } else {
            out.push(msg);
        }
    }

    (out, skipped)
}

struct PreparedMessage {
    new: NewMessage,
    features: MessageFeatures,
    founder_name: Option<String>,
}

async fn fetch_attachment_text(source: &dyn MailSource, msg: &FetchedMessage) -> Option<String> {
    let extractor = PlainTextExtractor;
    for att in &msg.attachments {
        let Some(att_id) = &att.attachment_id else {
            continue;
        };
        if !att.is_pdf() && !att.mime_type.starts_with("text/") {
            continue;
        }
        match source.fetch_attachment(&msg.id, att_id).await {
            Ok(bytes) => {
                if let Some(text) = extractor.extract(&bytes, &att.mime_type) {
                    return Some(text);
                }
            }
            Err(err) => {
                warn!(message_id = %msg.id, error = %err, "attachment fetch failed, classifying without it");
            }
        }
    }
    None
}

/// Classify one fetched message and shape the row to insert. Runs before
/// any transaction is opened; only the resulting writes happen inside one.
async fn prepare_message(
    conn: &mut AsyncPgConnection,
    classifier: &Classifier,
    source: &dyn MailSource,
    account: &Account,
    msg: &FetchedMessage,
) -> Result<PreparedMessage, SyncError> {
    let attachment_text = fetch_attachment_text(source, msg).await;
    let features = build_features(msg, attachment_text);

    // A thread with a tracked deal skips the whole engine.
    let tracked = db::deals::get_by_thread(conn, account.id, &msg.thread_id)
        .await?
        .is_some();
    let (classification, processed) = if tracked {
        (deals::short_circuit_classification(features.links.clone()), true)
    } else {
        let verdict = classifier.classify(&features).await;
        (verdict.classification, verdict.oracle_answered)
    };

    let (sender_address, founder_name) = parse_from_header(&msg.from);
    let new = NewMessage {
        account_id: account.id,
        gmail_id: msg.id.clone(),
        thread_id: msg.thread_id.clone(),
        sender: msg.from.clone(),
        sender_address,
        subject: msg.subject.clone(),
        snippet: (!msg.snippet.is_empty()).then(|| msg.snippet.clone()),
        body_text: msg.body_text.clone(),
        category: classification.category.as_str().to_string(),
        confidence: classification.confidence,
        tags: classification.tags.clone(),
        reply_type: classification.category.reply_type().as_str().to_string(),
        has_pdf_attachment: msg.has_pdf_attachment(),
        received_at: msg.received_at.unwrap_or_else(Utc::now),
        fetched_at: Utc::now(),
        processed,
    };

    Ok(PreparedMessage {
        new,
        features,
        founder_name,
    })
}

/// Run one full reconciliation for an account.
pub async fn sync_account(
    pool: &DbPool,
    config: &AppConfig,
    classifier: &Classifier,
    label_deltas: &LabelDeltaCache,
    source: &dyn MailSource,
    account: &Account,
    force_full: bool,
) -> Result<SyncReport, SyncError> {
    let mut conn_obj = pool
        .get()
        .await
        .map_err(|e| SyncError::Transient(anyhow::anyhow!("connection pool: {e}")))?;
    let conn: &mut AsyncPgConnection = &mut conn_obj;

    let store_has_messages = !db::messages::list(conn, Some(account.id), None, None, 1, 0)
        .await?
        .is_empty();
    let plan = choose_fetch(account.history_cursor.as_deref(), store_has_messages, force_full);
    let outcome = fetch_phase(source, plan, config.full_sync_cap).await?;

    let ids: Vec<String> = outcome.added.iter().map(|m| m.id.clone()).collect();
    let known = db::messages::existing_gmail_ids(conn, account.id, &ids).await?;
    let (fresh, skipped_known) = dedupe_batch(outcome.added, &known);

    let mut report = SyncReport {
        fetched: ids.len(),
        skipped: skipped_known,
        full_sync: outcome.full_sync,
        ..Default::default()
    };

    let mut prepared = Vec::with_capacity(fresh.len());
    for msg in &fresh {
        prepared.push(prepare_message(conn, classifier, source, account, msg).await?);
    }

    for chunk in prepared.chunks(config.commit_chunk.max(1)) {
        let (inserted, raced) = conn
            .transaction::<(usize, usize), SyncError, _>(|conn| {
                async move {
                    let mut inserted = 0;
                    let mut raced = 0;
                    for item in chunk {
                        match db::messages::upsert(conn, item.new.clone()).await? {
                            UpsertOutcome::Inserted(record) => {
                                inserted += 1;
                                if record.category == Category::DealFlow.as_str() {
                                    deals::observe_deal_flow_message(
                                        conn,
                                        config,
                                        account,
                                        &record.thread_id,
                                        &record.subject,
                                        &record.sender_address,
                                        item.founder_name.as_deref(),
                                        &item.features,
                                    )
                                    .await?;
                                }
                            }
                            UpsertOutcome::AlreadyExists(_) => raced += 1,
                        }
                    }
                    Ok((inserted, raced))
                }
                .scope_boxed()
            })
            .await?;
        report.classified += inserted;
        report.skipped += raced;
    }

    if !outcome.deleted_ids.is_empty() {
        report.deleted =
            db::messages::delete_by_gmail_ids(conn, account.id, &outcome.deleted_ids).await?;
    }
    if !outcome.label_changes.is_empty() {
        label_deltas.push_all(account.id, outcome.label_changes);
    }

    db::accounts::advance_cursor(conn, account.id, &outcome.new_cursor).await?;
    report.cursor = Some(outcome.new_cursor);

    info!(
        account = %account.email_address,
        fetched = report.fetched,
        classified = report.classified,
        skipped = report.skipped,
        deleted = report.deleted,
        full_sync = report.full_sync,
        "sync complete"
    );

    Ok(report)
}

/// Rebuild classifier features from a stored row for backlog passes.
pub fn features_from_record(row: &MessageRecord) -> MessageFeatures {
    let body = row
        .body_text
        .clone()
        .or_else(|| row.snippet.clone())
        .unwrap_or_default();
    let links = extract_links(&format!("{} {}", row.subject, body));

    MessageFeatures {
        subject: row.subject.clone(),
        body,
        sender: row.sender.clone(),
        sender_address: row.sender_address.clone(),
        headers: Vec::new(),
        links,
        attachment_filenames: Vec::new(),
        has_pdf_attachment: row.has_pdf_attachment,
        attachment_text: None,
    }
}

/// One backlog pass: claim a chunk of unprocessed rows under row locks and
/// re-run classification on them. Rows the oracle still cannot answer for
/// are left pending for a later pass. Returns how many rows completed.
pub async fn drain_backlog_chunk(
    pool: &DbPool,
    config: &AppConfig,
    classifier: &Classifier,
    direction: ClaimDirection,
) -> Result<usize, SyncError> {
    let mut conn_obj = pool
        .get()
        .await
        .map_err(|e| SyncError::Transient(anyhow::anyhow!("connection pool: {e}")))?;
    let conn: &mut AsyncPgConnection = &mut conn_obj;
    let chunk = config.backlog_chunk;

    let done = conn
        .transaction::<usize, SyncError, _>(|conn| {
            async move {
                let rows = db::messages::claim_unprocessed(conn, direction, chunk).await?;
                let mut done = 0;

                for row in rows {
                    let features = features_from_record(&row);
                    let tracked = db::deals::get_by_thread(conn, row.account_id, &row.thread_id)
                        .await?
                        .is_some();

                    let (classification, complete) = if tracked {
                        (
                            deals::short_circuit_classification(features.links.clone()),
                            true,
                        )
                    } else {
                        let verdict = classifier.classify(&features).await;
                        (verdict.classification, verdict.oracle_answered)
                    };
                    if !complete {
                        continue;
                    }

                    let updated =
                        db::messages::update_classification(conn, row.id, &classification).await?;
                    if classification.category == Category::DealFlow {
                        // The account can disappear between insert and this
                        // pass; the row is still relabeled, only the deal
                        // tracking is skipped.
                        match db::accounts::find_by_id(conn, row.account_id).await? {
                            Some(account) => {
                                let (_, founder_name) = parse_from_header(&row.sender);
                                deals::observe_deal_flow_message(
                                    conn,
                                    config,
                                    &account,
                                    &updated.thread_id,
                                    &updated.subject,
                                    &updated.sender_address,
                                    founder_name.as_deref(),
                                    &features,
                                )
                                .await?;
                            }
                            None => {
                                warn!(message_id = %row.id, "account gone, skipping deal tracking");
                            }
                        }
                    }
                    done += 1;
                }

                Ok(done)
            }
            .scope_boxed()
        })
        .await?;

    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::mail::{Delta, FullListing};

    fn msg(id: &str) -> FetchedMessage {
        FetchedMessage {
            id: id.to_string(),
            thread_id: format!("t-{id}"),
            subject: "subject".to_string(),
            from: "founder@startup.io".to_string(),
            snippet: "snippet".to_string(),
            body_text: None,
            headers: Vec::new(),
            attachments: Vec::new(),
            label_ids: Vec::new(),
            received_at: None,
        }
    }

    #[derive(Default)]
    struct ScriptedSource {
        full_responses: Mutex<VecDeque<Result<FullListing, MailError>>>,
        incremental_responses: Mutex<VecDeque<Result<Delta, MailError>>>,
        detail_responses: Mutex<VecDeque<Result<crate::mail::DetailBatch, MailError>>>,
        full_calls: AtomicUsize,
        incremental_calls: AtomicUsize,
        detail_calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn pop<T>(queue: &Mutex<VecDeque<Result<T, MailError>>>) -> Result<T, MailError> {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(MailError::Malformed("script exhausted".to_string())))
        }
    }

    #[async_trait::async_trait]
    impl MailSource for ScriptedSource {
        async fn list_full(&self, _limit: u32) -> Result<FullListing, MailError> {
            self.full_calls.fetch_add(1, Ordering::SeqCst);
            Self::pop(&self.full_responses)
        }

        async fn list_incremental(&self, _since_cursor: &str) -> Result<Delta, MailError> {
            self.incremental_calls.fetch_add(1, Ordering::SeqCst);
            Self::pop(&self.incremental_responses)
        }

        async fn get_details(
            &self,
            _ids: &[String],
        ) -> Result<crate::mail::DetailBatch, MailError> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            self.detail_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(crate::mail::DetailBatch::default()))
        }

        async fn fetch_attachment(
            &self,
            _message_id: &str,
            _attachment_id: &str,
        ) -> Result<Vec<u8>, MailError> {
            Err(MailError::Malformed("no attachments in tests".to_string()))
        }

        async fn send_message(
            &self,
            _to: &str,
            _subject: &str,
            _body: &str,
        ) -> Result<(), MailError> {
            Ok(())
        }
    }

    #[test]
    fn fetch_plan_prefers_stored_cursor() {
        assert_eq!(
            choose_fetch(Some("123"), true, false),
            FetchPlan::Incremental("123".to_string())
        );
    }

    #[test]
    fn fetch_plan_ignores_cursor_over_empty_store() {
        assert_eq!(choose_fetch(Some("123"), false, false), FetchPlan::Full);
    }

    #[test]
    fn fetch_plan_honors_force_full_and_missing_cursor() {
        assert_eq!(choose_fetch(Some("123"), true, true), FetchPlan::Full);
        assert_eq!(choose_fetch(None, true, false), FetchPlan::Full);
    }

    #[test]
    fn dedupe_drops_known_and_intra_batch_duplicates() {
        let known: HashSet<String> = ["a".to_string()].into_iter().collect();
        let batch = vec![msg("a"), msg("b"), msg("b"), msg("c")];
        let (fresh, skipped) = dedupe_batch(batch, &known);
        let ids: Vec<&str> = fresh.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(skipped, 2);
    }

    #[tokio::test]
    async fn full_plan_runs_full_listing() {
        let source = ScriptedSource::default();
        source.full_responses.lock().unwrap().push_back(Ok(FullListing {
            messages: (0..150).map(|i| msg(&format!("m{i}"))).collect(),
            failed_ids: Vec::new(),
            cursor: "c-900".to_string(),
        }));

        let outcome = fetch_phase(&source, FetchPlan::Full, 200).await.unwrap();
        assert!(outcome.full_sync);
        assert_eq!(outcome.added.len(), 150);
        assert_eq!(outcome.new_cursor, "c-900");
        assert_eq!(source.incremental_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn incremental_delta_passes_through() {
        let source = ScriptedSource::default();
        source
            .incremental_responses
            .lock()
            .unwrap()
            .push_back(Ok(Delta {
                added: vec![msg("new")],
                deleted_ids: vec!["gone".to_string()],
                new_cursor: "c-901".to_string(),
                ..Default::default()
            }));

        let outcome = fetch_phase(&source, FetchPlan::Incremental("c-900".to_string()), 200)
            .await
            .unwrap();
        assert!(!outcome.full_sync);
        assert_eq!(outcome.added.len(), 1);
        assert_eq!(outcome.deleted_ids, vec!["gone".to_string()]);
        assert_eq!(source.full_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_detail_fetches_are_recovered_before_finishing() {
        let source = ScriptedSource::default();
        source
            .incremental_responses
            .lock()
            .unwrap()
            .push_back(Ok(Delta {
                added: vec![msg("a")],
                failed_ids: vec!["b".to_string()],
                new_cursor: "c-2".to_string(),
                ..Default::default()
            }));
        source
            .detail_responses
            .lock()
            .unwrap()
            .push_back(Ok(crate::mail::DetailBatch {
                messages: vec![msg("b")],
                failed_ids: Vec::new(),
            }));

        let outcome = fetch_phase(&source, FetchPlan::Incremental("c-1".to_string()), 200)
            .await
            .unwrap();
        let ids: Vec<&str> = outcome.added.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(source.detail_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unrecoverable_detail_failures_abort_the_run() {
        let source = ScriptedSource::default();
        source
            .incremental_responses
            .lock()
            .unwrap()
            .push_back(Ok(Delta {
                added: vec![msg("a")],
                failed_ids: vec!["b".to_string()],
                new_cursor: "c-2".to_string(),
                ..Default::default()
            }));
        source
            .detail_responses
            .lock()
            .unwrap()
            .push_back(Ok(crate::mail::DetailBatch {
                messages: Vec::new(),
                failed_ids: vec!["b".to_string()],
            }));

        // The cursor must not move past a message that was never stored, so
        // the whole run fails and the next sync retries from the old cursor.
        let result = fetch_phase(&source, FetchPlan::Incremental("c-1".to_string()), 200).await;
        assert!(matches!(result, Err(SyncError::Transient(_))));
    }

    #[tokio::test]
    async fn stale_cursor_falls_back_to_full_exactly_once() {
        let source = ScriptedSource::default();
        source
            .incremental_responses
            .lock()
            .unwrap()
            .push_back(Err(MailError::StaleCursor));
        source.full_responses.lock().unwrap().push_back(Ok(FullListing {
            messages: vec![msg("m1")],
            failed_ids: Vec::new(),
            cursor: "c-1".to_string(),
        }));

        let outcome = fetch_phase(&source, FetchPlan::Incremental("old".to_string()), 200)
            .await
            .unwrap();
        assert!(outcome.full_sync);
        assert_eq!(source.incremental_calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.full_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_fallback_does_not_loop() {
        let source = ScriptedSource::default();
        source
            .incremental_responses
            .lock()
            .unwrap()
            .push_back(Err(MailError::StaleCursor));
        source
            .full_responses
            .lock()
            .unwrap()
            .push_back(Err(MailError::StaleCursor));

        let result = fetch_phase(&source, FetchPlan::Incremental("old".to_string()), 200).await;
        assert!(matches!(result, Err(SyncError::Fatal(_))));
        assert_eq!(source.incremental_calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.full_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_then_succeeds() {
        let source = ScriptedSource::default();
        {
            let mut q = source.incremental_responses.lock().unwrap();
            q.push_back(Err(MailError::RateLimited));
            q.push_back(Err(MailError::RateLimited));
            q.push_back(Ok(Delta {
                new_cursor: "c-2".to_string(),
                ..Default::default()
            }));
        }

        let outcome = fetch_phase(&source, FetchPlan::Incremental("c-1".to_string()), 200)
            .await
            .unwrap();
        assert_eq!(outcome.new_cursor, "c-2");
        assert_eq!(source.incremental_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_budget_is_three_attempts() {
        let source = ScriptedSource::default();
        {
            let mut q = source.incremental_responses.lock().unwrap();
            for _ in 0..5 {
                q.push_back(Err(MailError::RateLimited));
            }
        }

        let result = fetch_phase(&source, FetchPlan::Incremental("c-1".to_string()), 200).await;
        assert!(matches!(result, Err(SyncError::RateLimited)));
        assert_eq!(source.incremental_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn record_features_recover_links_from_stored_body() {
        use uuid::Uuid;

        let row = MessageRecord {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            gmail_id: "g1".to_string(),
            thread_id: "t1".to_string(),
            sender: "Jane <jane@startup.io>".to_string(),
            sender_address: "jane@startup.io".to_string(),
            subject: "deck".to_string(),
            snippet: None,
            body_text: Some("see https://docsend.com/view/abc".to_string()),
            category: "networking".to_string(),
            confidence: 0.6,
            tags: vec!["networking".to_string()],
            reply_type: "scheduling".to_string(),
            has_pdf_attachment: false,
            received_at: Utc::now(),
            fetched_at: Utc::now(),
            processed: false,
            processed_at: None,
        };

        let features = features_from_record(&row);
        assert_eq!(features.links, vec!["https://docsend.com/view/abc".to_string()]);
        assert_eq!(features.body, "see https://docsend.com/view/abc");
    }
}
