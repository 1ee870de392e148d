use anyhow::Error as AnyError;
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub(crate) struct RetryBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: usize,
    pub cancellation: Option<CancellationToken>,
}

impl RetryBackoff {
    pub(crate) fn new(initial_delay: Duration, max_delay: Duration, max_attempts: usize) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: max_attempts.max(1),
            cancellation: None,
        }
    }

    pub(crate) fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

pub(crate) enum RetryDisposition {
    Retry,
    Abort,
}

/// Why [`retry_with_backoff`] gave up.
#[derive(Debug)]
pub(crate) enum RetryFailure {
    /// Every attempt failed with a retryable error; holds the last one.
    Exhausted { attempts: usize, last: AnyError },
    /// The classifier refused to retry this error.
    Aborted(AnyError),
    /// The cancellation token fired before another attempt could run.
    Cancelled { attempts: usize },
}

pub(crate) async fn retry_with_backoff<T, F, Fut, L, C>(
    config: RetryBackoff,
    mut operation: F,
    mut on_retry: L,
    mut classify_error: C,
) -> Result<T, RetryFailure>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    L: FnMut(usize, Duration, &AnyError, bool),
    C: FnMut(&AnyError) -> RetryDisposition,
{
    let mut attempt = 0;
    let mut backoff = config.initial_delay;

    loop {
        if is_cancelled(config.cancellation.as_ref()) {
            return Err(RetryFailure::Cancelled { attempts: attempt });
        }
        attempt += 1;

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if let RetryDisposition::Abort = classify_error(&err) {
            return Err(RetryFailure::Aborted(err));
        }

        let exhausted = attempt >= config.max_attempts;
        on_retry(attempt, backoff, &err, !exhausted);
        if exhausted {
            return Err(RetryFailure::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        if !sleep_with_cancellation(backoff, config.cancellation.as_ref()).await {
            return Err(RetryFailure::Cancelled { attempts: attempt });
        }
        backoff = next_backoff(backoff, config.max_delay);
    }
}

fn is_cancelled(cancellation: Option<&CancellationToken>) -> bool {
    cancellation.is_some_and(CancellationToken::is_cancelled)
}

/// Returns `false` when the token fired before the delay elapsed.
async fn sleep_with_cancellation(delay: Duration, cancellation: Option<&CancellationToken>) -> bool {
    if delay.is_zero() {
        yield_now().await;
        return true;
    }

    if let Some(token) = cancellation {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = sleep(delay) => true,
        }
    } else {
        sleep(delay).await;
        true
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    current.saturating_mul(2).min(max_backoff)
}
