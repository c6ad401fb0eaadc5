use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager, ManagerConfig},
    AsyncPgConnection, RunQueryDsl,
};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Account, Deal, MessageRecord, NewDeal, NewMessage, NewNotification, ScheduledNotification,
};

pub type DbPool = Pool<AsyncPgConnection>;

/// Typed persistence errors, matched structurally by callers. A unique
/// violation on concurrent insert is an expected race, not a failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint conflict")]
    UniqueConflict,
    #[error("transient database error: {0}")]
    Transient(diesel::result::Error),
    #[error("database error: {0}")]
    Fatal(anyhow::Error),
}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind as Kind, Error};
        if matches!(e, Error::DatabaseError(Kind::UniqueViolation, _)) {
            return StoreError::UniqueConflict;
        }
        if matches!(
            e,
            Error::DatabaseError(Kind::ClosedConnection, _)
                | Error::DatabaseError(Kind::SerializationFailure, _)
        ) {
            return StoreError::Transient(e);
        }
        StoreError::Fatal(anyhow::Error::new(e))
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for StoreError {
    fn from(e: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        StoreError::Fatal(anyhow::anyhow!("connection pool error: {e}"))
    }
}

async fn establish_tls_connection(config: String) -> diesel::ConnectionResult<AsyncPgConnection> {
    // Set up rustls TLS configuration
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

    let (client, connection) = tokio_postgres::connect(&config, tls)
        .await
        .map_err(|e| diesel::ConnectionError::BadConnection(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection error: {}", e);
        }
    });

    AsyncPgConnection::try_from(client).await
}

pub fn establish_connection_pool() -> anyhow::Result<DbPool> {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let mut manager_config = ManagerConfig::default();
    manager_config.custom_setup =
        Box::new(|url| Box::pin(establish_tls_connection(url.to_string())));

    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new_with_config(
        database_url,
        manager_config,
    );
    let pool = Pool::builder(config).build()?;

    Ok(pool)
}

// Account database operations
pub mod accounts {
    use super::*;

    pub async fn list_active(conn: &mut AsyncPgConnection) -> Result<Vec<Account>, StoreError> {
        use crate::schema::accounts::dsl::*;

        let rows = accounts
            .filter(is_active.eq(true))
            .order_by(created_at.asc())
            .load::<Account>(conn)
            .await?;

        Ok(rows)
    }

    /// Look up an account that may have been erased since the caller took a
    /// reference to it. Callers treat `None` as "skip this work", never as
    /// an error.
    pub async fn find_by_id(
        conn: &mut AsyncPgConnection,
        account_id: Uuid,
    ) -> Result<Option<Account>, StoreError> {
        use crate::schema::accounts::dsl::*;

        let row = accounts
            .filter(id.eq(account_id))
            .first::<Account>(conn)
            .await
            .optional()?;

        Ok(row)
    }

    pub async fn get_by_email(
        conn: &mut AsyncPgConnection,
        email: &str,
    ) -> Result<Option<Account>, StoreError> {
        use crate::schema::accounts::dsl::*;

        let row = accounts
            .filter(email_address.eq(email))
            .first::<Account>(conn)
            .await
            .optional()?;

        Ok(row)
    }

    /// SQL guard keeping numeric cursors monotonic: a slower concurrent run
    /// must not rewind what a faster one already advanced. Cursors that do
    /// not parse cannot be ordered and are written unconditionally.
    pub(super) fn cursor_advance_guard(cursor: &str) -> String {
        match cursor.parse::<u64>() {
            Ok(n) => format!("history_cursor IS NULL OR history_cursor::numeric <= {n}"),
            Err(_) => "TRUE".to_string(),
        }
    }

    /// Write the new cursor. Called only after the batch it represents has
    /// committed; calling it earlier risks silent message loss on crash.
    /// A no-op when the stored cursor is already further along.
    pub async fn advance_cursor(
        conn: &mut AsyncPgConnection,
        account_id: Uuid,
        cursor: &str,
    ) -> Result<(), StoreError> {
        use crate::schema::accounts::dsl::*;
        use diesel::dsl::sql;
        use diesel::sql_types::Bool;

        let guard = cursor_advance_guard(cursor);
        diesel::update(accounts.filter(id.eq(account_id)).filter(sql::<Bool>(&guard)))
            .set((
                history_cursor.eq(Some(cursor)),
                last_synced.eq(Some(Utc::now())),
                last_sync_error.eq(None::<String>),
            ))
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn record_sync_error(
        conn: &mut AsyncPgConnection,
        account_id: Uuid,
        error: &str,
    ) -> Result<(), StoreError> {
        use crate::schema::accounts::dsl::*;

        diesel::update(accounts.filter(id.eq(account_id)))
            .set(last_sync_error.eq(Some(error)))
            .execute(conn)
            .await?;

        Ok(())
    }
}

// Message database operations
pub mod messages {
    use super::*;

    /// Result of an idempotent upsert: either our insert won, or a concurrent
    /// writer beat us and we re-read the winning record.
    #[derive(Debug)]
    pub enum UpsertOutcome {
        Inserted(MessageRecord),
        AlreadyExists(MessageRecord),
    }

    /// Insert a classified message, treating a (account_id, gmail_id)
    /// conflict as success-with-existing-record.
    pub async fn upsert(
        conn: &mut AsyncPgConnection,
        new: NewMessage,
    ) -> Result<UpsertOutcome, StoreError> {
        use crate::schema::messages::dsl::*;

        let inserted = diesel::insert_into(messages)
            .values(&new)
            .on_conflict((account_id, gmail_id))
            .do_nothing()
            .get_result::<MessageRecord>(conn)
            .await
            .optional()?;

        match inserted {
            Some(row) => Ok(UpsertOutcome::Inserted(row)),
            None => {
                let winner = messages
                    .filter(account_id.eq(new.account_id))
                    .filter(gmail_id.eq(&new.gmail_id))
                    .first::<MessageRecord>(conn)
                    .await?;
                Ok(UpsertOutcome::AlreadyExists(winner))
            }
        }
    }

    /// Gmail ids from `ids` that already have a record, processed or not.
    /// An unprocessed record belongs to whichever worker inserted it.
    pub async fn existing_gmail_ids(
        conn: &mut AsyncPgConnection,
        acc_id: Uuid,
        ids: &[String],
    ) -> Result<std::collections::HashSet<String>, StoreError> {
        use crate::schema::messages::dsl::*;

        let rows: Vec<String> = messages
            .filter(account_id.eq(acc_id))
            .filter(gmail_id.eq_any(ids))
            .select(gmail_id)
            .load::<String>(conn)
            .await?;

        Ok(rows.into_iter().collect())
    }

    /// Re-label a row after the backlog worker's classification pass and
    /// mark it processed in the same write.
    pub async fn update_classification(
        conn: &mut AsyncPgConnection,
        message_id: Uuid,
        classification: &shared_types::Classification,
    ) -> Result<MessageRecord, StoreError> {
        use crate::schema::messages::dsl::*;

        let row = diesel::update(messages.filter(id.eq(message_id)))
            .set((
                category.eq(classification.category.as_str()),
                confidence.eq(classification.confidence),
                tags.eq(&classification.tags),
                reply_type.eq(classification.category.reply_type().as_str()),
                processed.eq(true),
                processed_at.eq(Some(Utc::now())),
            ))
            .get_result::<MessageRecord>(conn)
            .await?;

        Ok(row)
    }

    pub async fn delete_by_gmail_ids(
        conn: &mut AsyncPgConnection,
        acc_id: Uuid,
        ids: &[String],
    ) -> Result<usize, StoreError> {
        use crate::schema::messages::dsl::*;

        let deleted = diesel::delete(
            messages
                .filter(account_id.eq(acc_id))
                .filter(gmail_id.eq_any(ids)),
        )
        .execute(conn)
        .await?;

        Ok(deleted)
    }

    /// Which end of the unclassified backlog a worker drains from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ClaimDirection {
        OldestFirst,
        NewestFirst,
    }

    /// Claim a batch of unprocessed rows with row locks, skipping rows
    /// already locked by the worker draining from the other end. Must run
    /// inside a transaction for the locks to be held.
    pub async fn claim_unprocessed(
        conn: &mut AsyncPgConnection,
        direction: ClaimDirection,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        use crate::schema::messages::dsl::*;

        let rows = match direction {
            ClaimDirection::OldestFirst => {
                messages
                    .filter(processed.eq(false))
                    .order_by(received_at.asc())
                    .limit(limit)
                    .for_update()
                    .skip_locked()
                    .load::<MessageRecord>(conn)
                    .await?
            }
            ClaimDirection::NewestFirst => {
                messages
                    .filter(processed.eq(false))
                    .order_by(received_at.desc())
                    .limit(limit)
                    .for_update()
                    .skip_locked()
                    .load::<MessageRecord>(conn)
                    .await?
            }
        };

        Ok(rows)
    }

    pub async fn count_unprocessed(conn: &mut AsyncPgConnection) -> Result<i64, StoreError> {
        use crate::schema::messages::dsl::*;

        let count: i64 = messages
            .filter(processed.eq(false))
            .count()
            .get_result(conn)
            .await?;

        Ok(count)
    }

    /// True if the thread contains a message authored by the account owner,
    /// i.e. a human already replied.
    pub async fn exists_human_reply(
        conn: &mut AsyncPgConnection,
        acc_id: Uuid,
        thread: &str,
        owner_address: &str,
    ) -> Result<bool, StoreError> {
        use crate::schema::messages::dsl::*;

        let count: i64 = messages
            .filter(account_id.eq(acc_id))
            .filter(thread_id.eq(thread))
            .filter(sender_address.eq(owner_address))
            .count()
            .get_result(conn)
            .await?;

        Ok(count > 0)
    }

    pub async fn list(
        conn: &mut AsyncPgConnection,
        acc_id: Option<Uuid>,
        category_filter: Option<&str>,
        processed_filter: Option<bool>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        use crate::schema::messages::dsl::*;

        let mut query = messages.order_by(received_at.desc()).into_boxed();

        if let Some(acc) = acc_id {
            query = query.filter(account_id.eq(acc));
        }
        if let Some(cat) = category_filter {
            query = query.filter(category.eq(cat.to_string()));
        }
        if let Some(done) = processed_filter {
            query = query.filter(processed.eq(done));
        }

        let rows = query
            .limit(limit)
            .offset(offset)
            .load::<MessageRecord>(conn)
            .await?;

        Ok(rows)
    }
}

// Deal database operations
pub mod deals {
    use super::*;

    pub async fn get_by_thread(
        conn: &mut AsyncPgConnection,
        acc_id: Uuid,
        thread: &str,
    ) -> Result<Option<Deal>, StoreError> {
        use crate::schema::deals::dsl::*;

        let row = deals
            .filter(account_id.eq(acc_id))
            .filter(thread_id.eq(thread))
            .order_by(created_at.asc())
            .first::<Deal>(conn)
            .await
            .optional()?;

        Ok(row)
    }

    pub async fn find_by_id(
        conn: &mut AsyncPgConnection,
        deal_id: Uuid,
    ) -> Result<Option<Deal>, StoreError> {
        use crate::schema::deals::dsl::*;

        let row = deals
            .filter(id.eq(deal_id))
            .first::<Deal>(conn)
            .await
            .optional()?;

        Ok(row)
    }

    pub async fn create(conn: &mut AsyncPgConnection, new: NewDeal) -> Result<Deal, StoreError> {
        use crate::schema::deals::dsl::*;

        let row = diesel::insert_into(deals)
            .values(&new)
            .get_result::<Deal>(conn)
            .await?;

        Ok(row)
    }

    pub async fn update_basics_and_stage(
        conn: &mut AsyncPgConnection,
        deal_id: Uuid,
        basics: shared_types::FourBasics,
        new_stage: &str,
        deck: Option<&str>,
    ) -> Result<Deal, StoreError> {
        use crate::schema::deals::dsl::*;

        let row = diesel::update(deals.filter(id.eq(deal_id)))
            .set((
                has_deck.eq(basics.has_deck),
                has_team_info.eq(basics.has_team_info),
                has_traction.eq(basics.has_traction),
                has_round_info.eq(basics.has_round_info),
                stage.eq(new_stage),
                deck_url.eq(deck),
                updated_at.eq(Utc::now()),
            ))
            .get_result::<Deal>(conn)
            .await?;

        Ok(row)
    }

    /// Set the alert flag. Only called after the sink reported success, so a
    /// failed send leaves the flag clear for retry.
    pub async fn mark_alert_sent(
        conn: &mut AsyncPgConnection,
        deal_id: Uuid,
    ) -> Result<(), StoreError> {
        use crate::schema::deals::dsl::*;

        diesel::update(deals.filter(id.eq(deal_id)))
            .set((
                alert_sent.eq(true),
                alert_sent_at.eq(Some(Utc::now())),
                updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn record_followup(
        conn: &mut AsyncPgConnection,
        deal_id: Uuid,
    ) -> Result<Deal, StoreError> {
        use crate::schema::deals::dsl::*;

        let row = diesel::update(deals.filter(id.eq(deal_id)))
            .set((
                followup_count.eq(followup_count + 1),
                last_followup_at.eq(Some(Utc::now())),
                updated_at.eq(Utc::now()),
            ))
            .get_result::<Deal>(conn)
            .await?;

        Ok(row)
    }

    pub async fn set_opted_out(
        conn: &mut AsyncPgConnection,
        deal_id: Uuid,
        value: bool,
    ) -> Result<(), StoreError> {
        use crate::schema::deals::dsl::*;

        diesel::update(deals.filter(id.eq(deal_id)))
            .set((opted_out.eq(value), updated_at.eq(Utc::now())))
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn list(
        conn: &mut AsyncPgConnection,
        acc_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Deal>, StoreError> {
        use crate::schema::deals::dsl::*;

        let mut query = deals.order_by(updated_at.desc()).into_boxed();

        if let Some(acc) = acc_id {
            query = query.filter(account_id.eq(acc));
        }

        let rows = query.limit(limit).load::<Deal>(conn).await?;

        Ok(rows)
    }
}

// Scheduled notification database operations
pub mod notifications {
    use super::*;
    use shared_types::NotificationState;

    pub async fn schedule(
        conn: &mut AsyncPgConnection,
        new: NewNotification,
    ) -> Result<ScheduledNotification, StoreError> {
        use crate::schema::scheduled_notifications::dsl::*;

        let row = diesel::insert_into(scheduled_notifications)
            .values(&new)
            .get_result::<ScheduledNotification>(conn)
            .await?;

        Ok(row)
    }

    /// Claim due pending notifications with row locks so racing dispatcher
    /// loops never double-send. Must run inside a transaction.
    pub async fn claim_due(
        conn: &mut AsyncPgConnection,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledNotification>, StoreError> {
        use crate::schema::scheduled_notifications::dsl::*;

        let rows = scheduled_notifications
            .filter(state.eq(NotificationState::Pending.as_str()))
            .filter(send_after.le(now))
            .order_by(send_after.asc())
            .limit(limit)
            .for_update()
            .skip_locked()
            .load::<ScheduledNotification>(conn)
            .await?;

        Ok(rows)
    }

    pub async fn mark_sent(
        conn: &mut AsyncPgConnection,
        notification_id: Uuid,
    ) -> Result<(), StoreError> {
        use crate::schema::scheduled_notifications::dsl::*;

        diesel::update(scheduled_notifications.filter(id.eq(notification_id)))
            .set((
                state.eq(NotificationState::Sent.as_str()),
                sent_at.eq(Some(Utc::now())),
            ))
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn mark_cancelled(
        conn: &mut AsyncPgConnection,
        notification_id: Uuid,
    ) -> Result<(), StoreError> {
        use crate::schema::scheduled_notifications::dsl::*;

        diesel::update(scheduled_notifications.filter(id.eq(notification_id)))
            .set(state.eq(NotificationState::Cancelled.as_str()))
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn mark_failed(
        conn: &mut AsyncPgConnection,
        notification_id: Uuid,
    ) -> Result<(), StoreError> {
        use crate::schema::scheduled_notifications::dsl::*;

        diesel::update(scheduled_notifications.filter(id.eq(notification_id)))
            .set(state.eq(NotificationState::Failed.as_str()))
            .execute(conn)
            .await?;

        Ok(())
    }

    /// Push a failed attempt back into the pending queue with a delay.
    pub async fn retry_later(
        conn: &mut AsyncPgConnection,
        notification_id: Uuid,
        next_attempt: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        use crate::schema::scheduled_notifications::dsl::*;

        diesel::update(scheduled_notifications.filter(id.eq(notification_id)))
            .set((attempts.eq(attempts + 1), send_after.eq(next_attempt)))
            .execute(conn)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_guard_orders_numeric_cursors() {
        let guard = accounts::cursor_advance_guard("12345");
        assert_eq!(
            guard,
            "history_cursor IS NULL OR history_cursor::numeric <= 12345"
        );
    }

    #[test]
    fn cursor_guard_passes_unorderable_cursors_through() {
        assert_eq!(accounts::cursor_advance_guard("not-a-number"), "TRUE");
    }
}
