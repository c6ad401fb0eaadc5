//! Shared application state handed to handlers and background workers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use shared_types::LabelDelta;
use uuid::Uuid;

use crate::classify::Classifier;
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::workers::RateLimiter;

/// Upper bound on buffered label deltas per account; the oldest entries are
/// dropped first once a consumer stops draining.
const MAX_DELTAS_PER_ACCOUNT: usize = 256;

/// Cloneable handle over everything the service shares: the connection
/// pool, config, the classifier, the per-account sync rate limiter, and the
/// ephemeral label-delta cache.
#[derive(Clone)]
pub struct AppContext {
    pub pool: DbPool,
    pub config: AppConfig,
    pub classifier: Arc<Classifier>,
    /// One limiter for every sync trigger, so the scheduler and the push
    /// webhook cannot double-run the same account back to back.
    pub sync_limiter: Arc<RateLimiter>,
    pub label_deltas: Arc<LabelDeltaCache>,
}

impl AppContext {
    pub fn new(pool: DbPool, config: AppConfig, classifier: Classifier) -> Self {
        let ttl = config.label_delta_ttl;
        let min_interval = Duration::from_secs(config.rate_limit_secs);
        Self {
            pool,
            config,
            classifier: Arc::new(classifier),
            sync_limiter: Arc::new(RateLimiter::new(min_interval)),
            label_deltas: Arc::new(LabelDeltaCache::new(ttl)),
        }
    }
}

/// In-memory, per-account, at-most-once delivery buffer for observed label
/// changes.
///
/// Deltas are never persisted; a consumer drains an account's entries once
/// and expired entries are dropped on the next push or drain. Each account's
/// buffer is capped, oldest out first. Losing deltas on restart is
/// acceptable, the mailbox itself stays the source of truth.
pub struct LabelDeltaCache {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, VecDeque<(Instant, LabelDelta)>>>,
}

impl LabelDeltaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn push(&self, account_id: Uuid, delta: LabelDelta) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let queue = entries.entry(account_id).or_default();
        while let Some((at, _)) = queue.front() {
            if now.duration_since(*at) > self.ttl {
                queue.pop_front();
            } else {
                break;
            }
        }
        if queue.len() >= MAX_DELTAS_PER_ACCOUNT {
            queue.pop_front();
        }
        queue.push_back((now, delta));
    }

    pub fn push_all(&self, account_id: Uuid, deltas: Vec<LabelDelta>) {
        for delta in deltas {
            self.push(account_id, delta);
        }
    }

    /// Take every unexpired delta for the account, leaving its buffer empty.
    pub fn drain(&self, account_id: Uuid) -> Vec<LabelDelta> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        match entries.remove(&account_id) {
            Some(queue) => queue
                .into_iter()
                .filter(|(at, _)| now.duration_since(*at) <= self.ttl)
                .map(|(_, delta)| delta)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self, account_id: Uuid) -> usize {
        match self.entries.lock() {
            Ok(guard) => guard.get(&account_id).map_or(0, VecDeque::len),
            Err(poisoned) => poisoned
                .into_inner()
                .get(&account_id)
                .map_or(0, VecDeque::len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(id: &str) -> LabelDelta {
        LabelDelta {
            message_id: id.to_string(),
            added: vec!["STARRED".to_string()],
            removed: vec![],
        }
    }

    #[test]
    fn drain_is_at_most_once_per_account() {
        let cache = LabelDeltaCache::new(Duration::from_secs(60));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.push(a, delta("m1"));
        cache.push(a, delta("m2"));
        cache.push(b, delta("m3"));

        let first = cache.drain(a);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].message_id, "m1");

        assert!(cache.drain(a).is_empty());
        assert_eq!(cache.drain(b).len(), 1);
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = LabelDeltaCache::new(Duration::from_millis(0));
        let a = Uuid::new_v4();
        cache.push(a, delta("old"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.drain(a).is_empty());
    }

    #[test]
    fn push_evicts_expired_entries() {
        let cache = LabelDeltaCache::new(Duration::from_millis(0));
        let a = Uuid::new_v4();
        cache.push(a, delta("old"));
        std::thread::sleep(Duration::from_millis(5));
        cache.push(a, delta("new"));
        assert_eq!(cache.len(a), 1);
    }

    #[test]
    fn per_account_buffer_is_bounded() {
        let cache = LabelDeltaCache::new(Duration::from_secs(60));
        let a = Uuid::new_v4();
        for i in 0..MAX_DELTAS_PER_ACCOUNT + 10 {
            cache.push(a, delta(&format!("m{i}")));
        }
        assert_eq!(cache.len(a), MAX_DELTAS_PER_ACCOUNT);

        // The oldest entries made room for the newest.
        let drained = cache.drain(a);
        assert_eq!(drained.first().unwrap().message_id, "m10");
        assert_eq!(
            drained.last().unwrap().message_id,
            format!("m{}", MAX_DELTAS_PER_ACCOUNT + 9)
        );
    }
}
