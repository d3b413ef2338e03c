use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Exponential backoff settings for operations that may be refused for a while,
/// such as a mailbox insert waiting on its rate limiter.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff<'a> {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<usize>,
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a> Backoff<'a> {
    pub(crate) fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: None,
            cancellation: None,
        }
    }

    pub(crate) fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub(crate) fn with_cancellation(mut self, token: Option<&'a CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }
}

pub(crate) enum Retry {
    Again,
    GiveUp,
}

/// Runs `operation` until it succeeds, `classify` gives up on an error, the
/// attempt budget runs out, or the token is cancelled.
pub(crate) async fn retry_with_backoff<T, F, Fut, C>(
    config: Backoff<'_>,
    mut operation: F,
    mut classify: C,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
    C: FnMut(&anyhow::Error) -> Retry,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        if config.cancellation.is_some_and(CancellationToken::is_cancelled) {
            return Err(anyhow!("retry cancelled"));
        }

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if let Retry::GiveUp = classify(&err) {
            return Err(err);
        }

        if config.max_attempts.is_some_and(|max| attempt >= max) {
            tracing::warn!(attempt, error = %err, "retry budget exhausted");
            return Err(err);
        }

        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "operation refused; backing off"
        );
        sleep_with_cancellation(delay, config.cancellation).await?;
        delay = next_delay(delay, config.max_delay);
    }
}

async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> Result<()> {
    if delay.is_zero() {
        yield_now().await;
        return Ok(());
    }

    match cancellation {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(anyhow!("retry cancelled")),
            _ = sleep(delay) => Ok(()),
        },
        None => {
            sleep(delay).await;
            Ok(())
        }
    }
}

fn next_delay(current: Duration, max_delay: Duration) -> Duration {
    if current.is_zero() {
        return max_delay.min(Duration::from_millis(1));
    }
    current.saturating_mul(2).min(max_delay)
}
