//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

/// Retry policy applied by the durable queue to failed deliveries.
///
/// `delays[n]` is the wait before attempt `n + 2` (the first attempt runs
/// as soon as the job is due). A small random jitter is added on top so
/// synchronized failures do not retry in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before each retry, in order. Shorter than `max_attempts - 1`
    /// repeats the last entry.
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delays: vec![Duration::from_secs(60), Duration::from_secs(300)],
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given retry (1 = first retry). Returns `None`
    /// when attempts are exhausted.
    pub fn backoff(&self, retry: u32) -> Option<Duration> {
        if retry >= self.max_attempts {
            return None;
        }
        let idx = (retry as usize).saturating_sub(1);
        Some(
            self.delays
                .get(idx)
                .or_else(|| self.delays.last())
                .copied()
                .unwrap_or(Duration::ZERO),
        )
    }
}

/// Core automation configuration.
#[derive(Debug, Clone)]
pub struct AutomationConfig {
    /// Page size for bulk mailbox fetches.
    pub fetch_page_size: usize,
    /// Max concurrent bulk workers per account.
    pub worker_concurrency: usize,
    /// Max message ids per provider batch-fetch call.
    pub digest_batch_size: usize,
    /// Pause between provider batch-fetch chunks.
    pub digest_chunk_pause: Duration,
    /// How far ahead the recovery sweeper re-arms itself.
    pub sweeper_interval: Duration,
    /// Max overdue actions re-driven per sweep.
    pub sweeper_batch: usize,
    /// Wall-clock bound on a single job delivery.
    pub job_timeout: Duration,
    /// Queue retry policy.
    pub retry: RetryPolicy,
    /// The system's own outgoing address — digest items from this sender
    /// are dropped to prevent self-loops.
    pub outgoing_address: String,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            fetch_page_size: 25,
            worker_concurrency: 3,
            digest_batch_size: 100,
            digest_chunk_pause: Duration::from_secs(1),
            sweeper_interval: Duration::from_secs(600), // 10 minutes
            sweeper_batch: 100,
            job_timeout: Duration::from_secs(300), // 5 minutes
            retry: RetryPolicy::default(),
            outgoing_address: "assistant@mailflow.local".to_string(),
        }
    }
}

impl AutomationConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("MAILFLOW_FETCH_PAGE_SIZE") {
            config.fetch_page_size = v;
        }
        if let Some(v) = env_parse("MAILFLOW_WORKER_CONCURRENCY") {
            config.worker_concurrency = v;
        }
        if let Some(v) = env_parse("MAILFLOW_SWEEPER_INTERVAL_SECS") {
            config.sweeper_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("MAILFLOW_JOB_TIMEOUT_SECS") {
            config.job_timeout = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("MAILFLOW_OUTGOING_ADDRESS") {
            if !v.trim().is_empty() {
                config.outgoing_address = v.trim().to_string();
            }
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// SMTP provider configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `MAILFLOW_SMTP_HOST` is not set (provider disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("MAILFLOW_SMTP_HOST").ok()?;

        let port: u16 = std::env::var("MAILFLOW_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("MAILFLOW_SMTP_USERNAME").unwrap_or_default();
        let password =
            SecretString::from(std::env::var("MAILFLOW_SMTP_PASSWORD").unwrap_or_default());
        let from_address =
            std::env::var("MAILFLOW_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

/// HTTP summarizer configuration.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    /// Endpoint that accepts a message and returns a structured summary.
    pub endpoint: String,
    /// Bearer token, if the endpoint requires one.
    pub api_key: Option<SecretString>,
    /// Request timeout.
    pub timeout: Duration,
}

impl SummarizerConfig {
    /// Build config from environment variables.
    /// Returns `None` if `MAILFLOW_SUMMARIZER_URL` is not set.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("MAILFLOW_SUMMARIZER_URL").ok()?;
        let api_key = std::env::var("MAILFLOW_SUMMARIZER_KEY")
            .ok()
            .map(SecretString::from);
        Some(Self {
            endpoint,
            api_key,
            timeout: Duration::from_secs(30),
        })
    }
}
