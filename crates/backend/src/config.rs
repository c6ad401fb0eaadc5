//! Runtime configuration loaded from environment variables.

use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Configuration for the sync and classification pipeline.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// How often the scheduler runs a sync cycle over all accounts
    pub poll_interval: Duration,
    /// Minimum seconds between syncs per account (rate limiting)
    pub rate_limit_secs: u64,
    /// Full-sync batch ceiling; incremental fetches are never capped
    pub full_sync_cap: u32,
    /// Messages per commit chunk inside one reconciliation batch
    pub commit_chunk: usize,
    /// Wall-clock budget for one sync task before the scheduler kills it
    pub task_budget: Duration,
    /// Global cap on concurrent oracle calls, independent of worker count
    pub llm_concurrency: usize,
    /// Unprocessed-message count above which the backlog workers kick in
    pub backlog_threshold: i64,
    /// Rows claimed per backlog worker pass
    pub backlog_chunk: i64,
    /// Delay before the first auto-reply on a new deal
    pub auto_reply_delay: Duration,
    /// Interval between WhatsApp follow-ups on an active deal
    pub followup_interval: Duration,
    /// Follow-ups stop after this many sends even if the deal stays active
    pub max_followups: i32,
    /// How often the dispatcher drains due notifications
    pub dispatch_interval: Duration,
    /// TTL for entries in the ephemeral label-delta cache
    pub label_delta_ttl: Duration,

    /// OpenAI-compatible chat completions endpoint for the oracle
    pub oracle_endpoint: String,
    pub oracle_model: String,
    pub oracle_api_key: Option<String>,
    pub oracle_timeout: Duration,

    /// WhatsApp gateway endpoint and token
    pub whatsapp_endpoint: Option<String>,
    pub whatsapp_token: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            rate_limit_secs: 60,
            full_sync_cap: 200,
            commit_chunk: 25,
            task_budget: Duration::from_secs(120),
            llm_concurrency: 4,
            backlog_threshold: 50,
            backlog_chunk: 10,
            auto_reply_delay: Duration::from_secs(10 * 60),
            followup_interval: Duration::from_secs(6 * 60 * 60),
            max_followups: 3,
            dispatch_interval: Duration::from_secs(30),
            label_delta_ttl: Duration::from_secs(300),
            oracle_endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            oracle_model: "gpt-4o-mini".to_string(),
            oracle_api_key: None,
            oracle_timeout: Duration::from_secs(20),
            whatsapp_endpoint: None,
            whatsapp_token: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let d = Self::default();

        Self {
            poll_interval: Duration::from_secs(env_parse(
                "SYNC_POLL_INTERVAL_SECS",
                d.poll_interval.as_secs(),
            )),
            rate_limit_secs: env_parse("SYNC_RATE_LIMIT_SECS", d.rate_limit_secs),
            full_sync_cap: env_parse("SYNC_FULL_CAP", d.full_sync_cap),
            commit_chunk: env_parse("SYNC_COMMIT_CHUNK", d.commit_chunk),
            task_budget: Duration::from_secs(env_parse(
                "SYNC_TASK_BUDGET_SECS",
                d.task_budget.as_secs(),
            )),
            llm_concurrency: env_parse("LLM_MAX_CONCURRENCY", d.llm_concurrency),
            backlog_threshold: env_parse("BACKLOG_THRESHOLD", d.backlog_threshold),
            backlog_chunk: env_parse("BACKLOG_CHUNK", d.backlog_chunk),
            auto_reply_delay: Duration::from_secs(env_parse(
                "AUTO_REPLY_DELAY_SECS",
                d.auto_reply_delay.as_secs(),
            )),
            followup_interval: Duration::from_secs(env_parse(
                "FOLLOWUP_INTERVAL_SECS",
                d.followup_interval.as_secs(),
            )),
            max_followups: env_parse("MAX_FOLLOWUPS", d.max_followups),
            dispatch_interval: Duration::from_secs(env_parse(
                "DISPATCH_INTERVAL_SECS",
                d.dispatch_interval.as_secs(),
            )),
            label_delta_ttl: Duration::from_secs(env_parse(
                "LABEL_DELTA_TTL_SECS",
                d.label_delta_ttl.as_secs(),
            )),
            oracle_endpoint: std::env::var("ORACLE_ENDPOINT").unwrap_or(d.oracle_endpoint),
            oracle_model: std::env::var("ORACLE_MODEL").unwrap_or(d.oracle_model),
            oracle_api_key: std::env::var("ORACLE_API_KEY").ok(),
            oracle_timeout: Duration::from_secs(env_parse(
                "ORACLE_TIMEOUT_SECS",
                d.oracle_timeout.as_secs(),
            )),
            whatsapp_endpoint: std::env::var("WHATSAPP_ENDPOINT").ok(),
            whatsapp_token: std::env::var("WHATSAPP_TOKEN").ok(),
        }
    }
}
