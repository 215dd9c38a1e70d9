//! Timeboxed retry with jittered exponential backoff, used for every
//! cluster-internal call that is allowed to ride out transient failures.

use std::future::Future;
use std::time::Duration;

use rand::random_range;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// transient errors, 5xx, network errors
    Retryable,
    /// 4xx, logic errors
    NonRetryable,
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub total_budget: Duration,
    pub per_attempt_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub jitter_frac: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            total_budget: Duration::from_secs(10),
            per_attempt_timeout: Duration::from_secs(2),
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(2),
            jitter_frac: 0.5,
        }
    }
}

pub fn jitter(d: Duration, frac: f32) -> Duration {
    let ms = d.as_millis() as i64;
    let delta = (ms as f32 * frac) as i64;
    let j = if delta > 0 {
        random_range(-delta..=delta)
    } else {
        0
    };
    Duration::from_millis((ms + j).max(0) as u64)
}

pub async fn retry_timeboxed<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    mut op: F,
    classify: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryClass,
{
    let deadline = Instant::now() + policy.total_budget;
    let mut backoff = policy.backoff_base;

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if classify(&e) == RetryClass::NonRetryable {
                    return Err(e);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(e);
                }
                let sleep_dur = jitter(backoff.min(policy.backoff_max), policy.jitter_frac);
                if sleep_dur > deadline.saturating_duration_since(now) {
                    return Err(e);
                }
                sleep(sleep_dur).await;
                backoff = (backoff * 2).min(policy.backoff_max);
            }
        }
    }
}

pub fn classify_reqwest(err: &reqwest::Error) -> RetryClass {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        return RetryClass::Retryable;
    }
    if let Some(st) = err.status() {
        if st.is_server_error() || st == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return RetryClass::Retryable;
        }
        return RetryClass::NonRetryable;
    }
    RetryClass::Retryable
}
