use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::job::{JobId, JobType};

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// base * 2^(attempt-1), capped
    Exponential,
    /// base * attempt, capped
    Linear,
    /// base every time
    Fixed,
}

/// Per-job-type retry rules. Immutable configuration, looked up by type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay randomized in either direction, 0.0..=1.0.
    pub jitter: f64,
    /// Allow-list. Empty means any error not denied is retryable.
    pub retryable_errors: &'static [&'static str],
    /// Deny-list, checked before the allow-list. A match here always wins.
    pub non_retryable_errors: &'static [&'static str],
}

/// Whether a failed attempt should be retried, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryDecision {
    pub retry: bool,
    pub reason: String,
}

/// Retry bookkeeping for one job between its first failure and a terminal
/// state. Discarded once the job completes or fails permanently.
#[derive(Debug, Clone, Serialize)]
pub struct RetryContext {
    pub job_id: JobId,
    pub job_type: JobType,
    pub attempt: u32,
    pub last_error: String,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub policy: RetryPolicy,
}

/// Errors no stage can recover from by waiting.
const NON_RETRYABLE_COMMON: &[&str] = &["INVALID_PAYLOAD", "INVALID_INPUT", "AUTH_FAILED"];

const DISCOVER_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    backoff: Backoff::Exponential,
    base_delay_ms: 60_000,
    max_delay_ms: 900_000,
    jitter: 0.2,
    retryable_errors: &[],
    non_retryable_errors: &["INVALID_PAYLOAD", "INVALID_INPUT", "AUTH_FAILED", "QUOTA_EXCEEDED"],
};

const CAPTURE_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 4,
    backoff: Backoff::Exponential,
    base_delay_ms: 30_000,
    max_delay_ms: 600_000,
    jitter: 0.15,
    retryable_errors: &[],
    non_retryable_errors: &[
        "INVALID_PAYLOAD",
        "INVALID_INPUT",
        "AUTH_FAILED",
        "INVALID_URL",
        "DOMAIN_UNAVAILABLE",
    ],
};

const SCORE_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 2,
    backoff: Backoff::Fixed,
    base_delay_ms: 60_000,
    max_delay_ms: 60_000,
    jitter: 0.0,
    retryable_errors: &[],
    non_retryable_errors: NON_RETRYABLE_COMMON,
};

const GENERATE_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    backoff: Backoff::Exponential,
    base_delay_ms: 60_000,
    max_delay_ms: 1_800_000,
    jitter: 0.1,
    retryable_errors: &[],
    non_retryable_errors: NON_RETRYABLE_COMMON,
};

const DEPLOY_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 5,
    backoff: Backoff::Exponential,
    base_delay_ms: 30_000,
    max_delay_ms: 1_800_000,
    jitter: 0.2,
    retryable_errors: &[],
    non_retryable_errors: &["INVALID_PAYLOAD", "INVALID_INPUT", "AUTH_FAILED", "QUOTA_EXCEEDED"],
};

const EMAIL_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 5,
    backoff: Backoff::Exponential,
    base_delay_ms: 60_000,
    max_delay_ms: 3_600_000,
    jitter: 0.25,
    retryable_errors: &["RATE_LIMIT", "TIMEOUT", "NETWORK", "SERVICE_UNAVAILABLE", "CONNECTION"],
    non_retryable_errors: &[
        "INVALID_PAYLOAD",
        "INVALID_INPUT",
        "AUTH_FAILED",
        "INVALID_RECIPIENT",
        "UNSUBSCRIBED",
        "HARD_BOUNCE",
        "SPAM_BLOCK",
        "CONTENT_POLICY",
    ],
};

const FOLLOWUP_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    backoff: Backoff::Linear,
    base_delay_ms: 300_000,
    max_delay_ms: 1_800_000,
    jitter: 0.1,
    retryable_errors: &[],
    non_retryable_errors: &[
        "INVALID_PAYLOAD",
        "INVALID_INPUT",
        "AUTH_FAILED",
        "UNSUBSCRIBED",
        "SEQUENCE_CANCELLED",
    ],
};

/// Conservative fallback for anything without its own entry.
pub const DEFAULT_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    backoff: Backoff::Exponential,
    base_delay_ms: 60_000,
    max_delay_ms: 3_600_000,
    jitter: 0.1,
    retryable_errors: &[],
    non_retryable_errors: NON_RETRYABLE_COMMON,
};

/// Look up the retry policy for a job type. Total: always returns a policy.
pub fn policy_for(job_type: JobType) -> &'static RetryPolicy {
    match job_type {
        JobType::Discover => &DISCOVER_POLICY,
        JobType::Capture => &CAPTURE_POLICY,
        JobType::Score => &SCORE_POLICY,
        JobType::Generate => &GENERATE_POLICY,
        JobType::Deploy => &DEPLOY_POLICY,
        JobType::Email => &EMAIL_POLICY,
        JobType::Followup => &FOLLOWUP_POLICY,
    }
}

/// Jitter-free backoff delay for a given attempt number (1-indexed).
pub fn backoff_delay_ms(policy: &RetryPolicy, attempt: u32) -> u64 {
    let attempt = attempt.max(1);
    match policy.backoff {
        Backoff::Exponential => {
            let factor = 2u64.saturating_pow(attempt - 1);
            policy
                .base_delay_ms
                .saturating_mul(factor)
                .min(policy.max_delay_ms)
        }
        Backoff::Linear => policy
            .base_delay_ms
            .saturating_mul(attempt as u64)
            .min(policy.max_delay_ms),
        Backoff::Fixed => policy.base_delay_ms,
    }
}

/// Backoff delay with jitter applied: delay +- delay * jitter.
pub fn calculate_retry_delay(policy: &RetryPolicy, attempt: u32) -> u64 {
    let base = backoff_delay_ms(policy, attempt);
    if policy.jitter <= 0.0 {
        return base;
    }
    let unit: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
    let jittered = base as f64 + base as f64 * policy.jitter * unit;
    jittered.max(0.0).round() as u64
}

/// Extract the leading `UPPER_SNAKE_CASE:` token of an error message, if any.
pub fn error_code(message: &str) -> Option<&str> {
    let (head, _) = message.split_once(':')?;
    let head = head.trim();
    if head.is_empty() {
        return None;
    }
    let shaped = head.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if shaped && head.chars().any(|c| c.is_ascii_uppercase()) {
        Some(head)
    } else {
        None
    }
}

fn matches_entry(code: Option<&str>, message: &str, entry: &str) -> bool {
    code == Some(entry) || message.contains(entry)
}

/// Decide whether a failed attempt should be retried.
///
/// Order matters: attempt cap first, then the deny-list (always wins), then
/// the allow-list, then default-retry.
pub fn should_retry(policy: &RetryPolicy, error: &str, attempt: u32) -> RetryDecision {
    if attempt >= policy.max_attempts {
        return RetryDecision {
            retry: false,
            reason: format!("max attempts exceeded ({}/{})", attempt, policy.max_attempts),
        };
    }

    let code = error_code(error);

    if let Some(entry) = policy
        .non_retryable_errors
        .iter()
        .find(|e| matches_entry(code, error, e))
    {
        return RetryDecision {
            retry: false,
            reason: format!("non-retryable error: {}", entry),
        };
    }

    if !policy.retryable_errors.is_empty() {
        return match policy
            .retryable_errors
            .iter()
            .find(|e| matches_entry(code, error, e))
        {
            Some(entry) => RetryDecision {
                retry: true,
                reason: format!("retryable error: {}", entry),
            },
            None => RetryDecision {
                retry: false,
                reason: "did not match any retryable pattern".to_string(),
            },
        };
    }

    RetryDecision {
        retry: true,
        reason: format!("attempt {}/{}", attempt, policy.max_attempts),
    }
}
