//! Engine configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use common::Tokens;

use crate::retry::RetryPolicy;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Engine configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `TICKET_PRICE`: tokens per tombola ticket (default: `5`)
/// - `EXCLUDE_PREVIOUS_WINNERS`: one lot per account and kermesse (default: `false`)
/// - `MAX_CONFLICT_RETRIES`: retries after a transient conflict (default: `3`)
/// - `RETRY_INITIAL_DELAY_MS`: first backoff delay (default: `10`)
/// - `LOCK_TIMEOUT_MS`: bound on entity lock waits (default: `2000`)
/// - `DRAW_SEED`: fixed seed for reproducible draws (default: unset, OS entropy)
/// - `TOKENS_PER_EURO`: exchange rate for external payments (default: `1`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `pretty` or `json` (default: `pretty`)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ticket_price: Tokens,
    pub exclude_previous_winners: bool,
    pub max_conflict_retries: usize,
    pub retry_initial_delay: Duration,
    pub lock_timeout: Duration,
    pub draw_seed: Option<u64>,
    pub tokens_per_euro: u64,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    ///
    /// Values that fail to parse fall back to their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            ticket_price: parse_var(&lookup, "TICKET_PRICE")
                .map(Tokens::new)
                .unwrap_or(defaults.ticket_price),
            exclude_previous_winners: parse_var(&lookup, "EXCLUDE_PREVIOUS_WINNERS")
                .unwrap_or(defaults.exclude_previous_winners),
            max_conflict_retries: parse_var(&lookup, "MAX_CONFLICT_RETRIES")
                .unwrap_or(defaults.max_conflict_retries),
            retry_initial_delay: parse_var(&lookup, "RETRY_INITIAL_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_initial_delay),
            lock_timeout: parse_var(&lookup, "LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            draw_seed: parse_var(&lookup, "DRAW_SEED"),
            tokens_per_euro: parse_var(&lookup, "TOKENS_PER_EURO")
                .filter(|rate: &u64| *rate > 0)
                .unwrap_or(defaults.tokens_per_euro),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse_var(&lookup, "LOG_FORMAT").unwrap_or(defaults.log_format),
        }
    }

    /// Returns the conflict retry policy described by this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_conflict_retries, self.retry_initial_delay)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse().ok())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ticket_price: Tokens::new(5),
            exclude_previous_winners: false,
            max_conflict_retries: 3,
            retry_initial_delay: Duration::from_millis(10),
            lock_timeout: Duration::from_millis(2000),
            draw_seed: None,
            tokens_per_euro: 1,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}
