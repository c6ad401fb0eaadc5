//! Background loops: the sync scheduler, the backlog classifiers, and the
//! notification dispatcher. Each runs on its own tokio task and survives
//! individual cycle failures.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shared_types::SyncReport;

use crate::context::AppContext;
use crate::db::{self, messages::ClaimDirection};
use crate::mail::gmail::GmailSource;
use crate::models::Account;
use crate::notify::Dispatcher;
use crate::sync::{self, SyncError};

const BACKLOG_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Per-account minimum interval between sync runs, shared by the scheduler
/// and the push-notification path.
pub struct RateLimiter {
    min_interval: Duration,
    last_run: Mutex<HashMap<Uuid, Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_run: Mutex::new(HashMap::new()),
        }
    }

    /// True when the key is allowed to run now; records the run if so.
    pub fn try_acquire(&self, key: Uuid) -> bool {
        let mut last_run = match self.last_run.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        match last_run.get(&key) {
            Some(last) if now.duration_since(*last) < self.min_interval => false,
            _ => {
                last_run.insert(key, now);
                true
            }
        }
    }
}

/// One account sync with the provider adapter built from its stored token,
/// bounded by the configured task budget.
pub async fn sync_one(
    ctx: &AppContext,
    account: &Account,
    force_full: bool,
) -> Result<SyncReport, SyncError> {
    let source = GmailSource::from_account(account)
        .await
        .map_err(SyncError::Transient)?;

    let run = sync::sync_account(
        &ctx.pool,
        &ctx.config,
        &ctx.classifier,
        &ctx.label_deltas,
        &source,
        account,
        force_full,
    );

    match tokio::time::timeout(ctx.config.task_budget, run).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Transient(anyhow::anyhow!(
            "sync exceeded task budget of {:?}",
            ctx.config.task_budget
        ))),
    }
}

async fn run_sync_cycle(ctx: &AppContext) {
    let accounts = {
        let mut conn = match ctx.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "scheduler could not get a connection");
                return;
            }
        };
        match db::accounts::list_active(&mut conn).await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!(error = %e, "scheduler could not list accounts");
                return;
            }
        }
    };

    for account in accounts {
        if !ctx.sync_limiter.try_acquire(account.id) {
            debug!(account = %account.email_address, "rate limited, skipping this cycle");
            continue;
        }

        match sync_one(ctx, &account, false).await {
            Ok(report) => {
                debug!(
                    account = %account.email_address,
                    classified = report.classified,
                    "scheduled sync done"
                );
            }
            Err(e) => {
                warn!(account = %account.email_address, error = %e, "scheduled sync failed");
                if let Ok(mut conn) = ctx.pool.get().await {
                    if let Err(db_err) =
                        db::accounts::record_sync_error(&mut conn, account.id, &e.to_string()).await
                    {
                        error!(error = %db_err, "could not record sync error");
                    }
                }
            }
        }
    }
}

pub fn start_sync_scheduler(ctx: AppContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ctx.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?ctx.config.poll_interval, "sync scheduler started");

        loop {
            ticker.tick().await;
            run_sync_cycle(&ctx).await;
        }
    })
}

/// How much drain effort one backlog tick spends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BacklogMode {
    Idle,
    /// A single oldest-first chunk; any pending row drains eventually even
    /// when the backlog never grows large.
    Single,
    /// Two workers from opposite ends: newest-first for freshness,
    /// oldest-first for completeness. SKIP LOCKED claims keep them off each
    /// other's rows.
    Dual,
}

fn backlog_mode(backlog: i64, threshold: i64) -> BacklogMode {
    if backlog <= 0 {
        BacklogMode::Idle
    } else if backlog >= threshold {
        BacklogMode::Dual
    } else {
        BacklogMode::Single
    }
}

pub fn start_backlog_workers(ctx: AppContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(BACKLOG_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let backlog = {
                let mut conn = match ctx.pool.get().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "backlog worker could not get a connection");
                        continue;
                    }
                };
                match db::messages::count_unprocessed(&mut conn).await {
                    Ok(count) => count,
                    Err(e) => {
                        error!(error = %e, "backlog count failed");
                        continue;
                    }
                }
            };

            match backlog_mode(backlog, ctx.config.backlog_threshold) {
                BacklogMode::Idle => {}
                BacklogMode::Single => {
                    match sync::drain_backlog_chunk(
                        &ctx.pool,
                        &ctx.config,
                        &ctx.classifier,
                        ClaimDirection::OldestFirst,
                    )
                    .await
                    {
                        Ok(done) => debug!(done, "backlog chunk finished"),
                        Err(e) => warn!(error = %e, "backlog chunk failed"),
                    }
                }
                BacklogMode::Dual => {
                    info!(backlog, "draining classification backlog");

                    let newest = sync::drain_backlog_chunk(
                        &ctx.pool,
                        &ctx.config,
                        &ctx.classifier,
                        ClaimDirection::NewestFirst,
                    );
                    let oldest = sync::drain_backlog_chunk(
                        &ctx.pool,
                        &ctx.config,
                        &ctx.classifier,
                        ClaimDirection::OldestFirst,
                    );

                    let (newest, oldest) = tokio::join!(newest, oldest);
                    for (label, result) in [("newest", newest), ("oldest", oldest)] {
                        match result {
                            Ok(done) => debug!(worker = label, done, "backlog chunk finished"),
                            Err(e) => warn!(worker = label, error = %e, "backlog chunk failed"),
                        }
                    }
                }
            }
        }
    })
}

pub fn start_notification_loop(ctx: AppContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let dispatcher = Dispatcher::from_config(&ctx.config);
        let mut ticker = tokio::time::interval(ctx.config.dispatch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?ctx.config.dispatch_interval, "notification dispatcher started");

        loop {
            ticker.tick().await;
            match dispatcher.run_due(&ctx.pool, &ctx.config).await {
                Ok(0) => {}
                Ok(sent) => info!(sent, "notifications dispatched"),
                Err(e) => error!(error = %e, "notification dispatch failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_gates_per_key() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(limiter.try_acquire(a));
        assert!(!limiter.try_acquire(a));
        assert!(limiter.try_acquire(b));
    }

    #[test]
    fn rate_limiter_allows_after_interval() {
        let limiter = RateLimiter::new(Duration::from_millis(0));
        let key = Uuid::new_v4();
        assert!(limiter.try_acquire(key));
        assert!(limiter.try_acquire(key));
    }

    #[test]
    fn small_backlogs_still_drain() {
        assert_eq!(backlog_mode(0, 50), BacklogMode::Idle);
        assert_eq!(backlog_mode(1, 50), BacklogMode::Single);
        assert_eq!(backlog_mode(49, 50), BacklogMode::Single);
        assert_eq!(backlog_mode(50, 50), BacklogMode::Dual);
        assert_eq!(backlog_mode(500, 50), BacklogMode::Dual);
    }
}
