use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    domain::{services, UserId},
    errors::Error,
    ingest::IngestConfig,
    ratelimit::{RateLimit, RateLimiter},
    Result,
};

/// Typed configuration loaded from the environment (and an optional `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub telegram_bot_token: String,
    /// Empty means everyone may use the bot.
    pub telegram_allowed_users: Vec<i64>,

    // Storage / reporting
    pub state_db_path: PathBuf,
    pub failure_log_path: PathBuf,

    // Ingestion
    pub poll_timeout: Duration,
    pub poll_limit: u8,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub processor_max_attempts: u32,
    pub processor_retry_delay: Duration,

    // Rate budgets per service
    pub ingest_rate: RateLimit,
    pub outbound_rate: RateLimit,
    pub market_rate: RateLimit,

    // Market data
    pub market_data_url: String,
    pub market_cache_ttl: Duration,
    pub market_request_timeout: Duration,

    // Telegram limits
    pub telegram_safe_limit: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `load` uses the process env.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_u64 = |key: &str| parse_u64(key, get(key));

        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN").and_then(non_empty).ok_or_else(|| {
            Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
        })?;
        let telegram_allowed_users = parse_csv_i64(get("TELEGRAM_ALLOWED_USERS"));

        let state_db_path = get("STATE_DB_PATH")
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp/relay-bot/state.db"));
        let failure_log_path = get("FAILURE_LOG_PATH")
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp/relay-bot/failures.jsonl"));

        // Telegram caps getUpdates at 100 per call.
        let poll_limit = env_u64("POLL_LIMIT")?.unwrap_or(100).clamp(1, 100) as u8;
        let poll_timeout = Duration::from_secs(env_u64("POLL_TIMEOUT_SECS")?.unwrap_or(30));
        let backoff_base = Duration::from_millis(env_u64("BACKOFF_BASE_MS")?.unwrap_or(5_000));
        let backoff_max = Duration::from_millis(env_u64("BACKOFF_MAX_MS")?.unwrap_or(60_000));
        if backoff_base.is_zero() {
            return Err(Error::Config("BACKOFF_BASE_MS must be positive".to_string()));
        }
        let processor_max_attempts = env_u64("PROCESSOR_MAX_ATTEMPTS")?
            .unwrap_or(1)
            .clamp(1, u64::from(u32::MAX)) as u32;
        let processor_retry_delay =
            Duration::from_millis(env_u64("PROCESSOR_RETRY_DELAY_MS")?.unwrap_or(500));

        let rate = |prefix: &str, requests: u64, window_ms: u64| -> Result<RateLimit> {
            let req_key = format!("{prefix}_RATE_REQUESTS");
            let win_key = format!("{prefix}_RATE_WINDOW_MS");
            let max_requests = env_u64(&req_key)?.unwrap_or(requests);
            let window_ms = env_u64(&win_key)?.unwrap_or(window_ms);
            if max_requests == 0 || window_ms == 0 {
                return Err(Error::Config(format!(
                    "{req_key} and {win_key} must both be positive"
                )));
            }
            let max_requests = u32::try_from(max_requests)
                .map_err(|_| Error::Config(format!("{req_key} is too large")))?;
            Ok(RateLimit::new(max_requests, Duration::from_millis(window_ms)))
        };
        let ingest_rate = rate("INGEST", 30, 1_000)?;
        let outbound_rate = rate("OUTBOUND", 30, 1_000)?;
        let market_rate = rate("MARKET", 10, 60_000)?;

        let market_data_url = get("MARKET_DATA_URL")
            .and_then(non_empty)
            .unwrap_or_else(|| "https://api.coingecko.com/api/v3".to_string())
            .trim_end_matches('/')
            .to_string();
        let market_cache_ttl =
            Duration::from_secs(env_u64("MARKET_CACHE_TTL_SECS")?.unwrap_or(120));
        let market_request_timeout =
            Duration::from_secs(env_u64("MARKET_TIMEOUT_SECS")?.unwrap_or(10));

        let telegram_safe_limit = env_u64("TELEGRAM_SAFE_LIMIT")?
            .map(|v| v as usize)
            .unwrap_or(4000);

        Ok(Self {
            telegram_bot_token,
            telegram_allowed_users,
            state_db_path,
            failure_log_path,
            poll_timeout,
            poll_limit,
            backoff_base,
            backoff_max,
            processor_max_attempts,
            processor_retry_delay,
            ingest_rate,
            outbound_rate,
            market_rate,
            market_data_url,
            market_cache_ttl,
            market_request_timeout,
            telegram_safe_limit,
        })
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            poll_timeout: self.poll_timeout,
            poll_limit: self.poll_limit,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
            processor_max_attempts: self.processor_max_attempts,
            processor_retry_delay: self.processor_retry_delay,
        }
    }

    /// One limiter entry per known service.
    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new()
            .with_service(services::PLATFORM_INGEST, self.ingest_rate)
            .with_service(services::PLATFORM_OUTBOUND, self.outbound_rate)
            .with_service(services::MARKET_DATA, self.market_rate)
    }

    pub fn is_allowed(&self, user: Option<UserId>) -> bool {
        if self.telegram_allowed_users.is_empty() {
            return true;
        }
        user.is_some_and(|u| self.telegram_allowed_users.contains(&u.0))
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

/// Absent or blank is `None`; anything else must parse.
fn parse_u64(key: &str, v: Option<String>) -> Result<Option<u64>> {
    let Some(v) = v.and_then(non_empty) else {
        return Ok(None);
    };
    v.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got {v:?}")))
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
