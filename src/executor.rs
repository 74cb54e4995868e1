//! Retry loop around a single prepared request.

use std::time::Duration;

use backoff::backoff::Backoff;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::{
    BackoffPolicy, GiveUpReporter, MinerError, PreparedRequest, Response, Result, SendOptions,
    Session,
};

/// One failed attempt.
#[derive(Clone, Debug)]
pub struct AttemptRecord {
    /// Attempt number (1-indexed).
    pub attempt: u32,
    /// Request sent on this attempt.
    pub request: PreparedRequest,
    /// Display form of the failure.
    pub error: String,
    /// Time since the first attempt started, measured when the failure was seen.
    pub elapsed: Duration,
}

/// Failed attempts of one operation, oldest first.
#[derive(Clone, Debug, Default)]
pub struct CallHistory {
    attempts: Vec<AttemptRecord>,
}

impl CallHistory {
    pub fn record(
        &mut self,
        attempt: u32,
        request: &PreparedRequest,
        error: &MinerError,
        elapsed: Duration,
    ) {
        self.attempts.push(AttemptRecord {
            attempt,
            request: request.clone(),
            error: error.to_string(),
            elapsed,
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttemptRecord> {
        self.attempts.iter()
    }

    pub fn last(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

/// Sends a request under a [`BackoffPolicy`].
pub struct RetryExecutor<'a> {
    policy: &'a BackoffPolicy,
    reporter: &'a dyn GiveUpReporter,
}

impl<'a> RetryExecutor<'a> {
    pub fn new(policy: &'a BackoffPolicy, reporter: &'a dyn GiveUpReporter) -> Self {
        Self { policy, reporter }
    }

    /// Sends `request` until it succeeds, fails with a non-retryable error,
    /// or exhausts `max_tries`/`max_time`.
    ///
    /// Returns `Ok(Some(response))` on success. After giving up, the reporter
    /// receives the call history and the result is the last failure when
    /// `raise_on_giveup` is set, `Ok(None)` otherwise.
    pub async fn run<S>(
        &self,
        session: &S,
        request: &PreparedRequest,
        options: &SendOptions,
    ) -> Result<Option<Response>>
    where
        S: Session + ?Sized,
    {
        let started = Instant::now();
        let mut schedule = self.policy.schedule();
        let mut history = CallHistory::default();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(
                attempt,
                max_tries = self.policy.max_tries(),
                method = %request.method(),
                url = %request.url(),
                "sending request"
            );

            let error = match send_once(session, request, options).await {
                Ok(response) => return Ok(Some(response)),
                Err(error) => error,
            };

            if !self.policy.retry_on().matches(&error) {
                debug!(attempt, error = %error, "request failed with non-retryable error");
                return Err(error);
            }

            let elapsed = started.elapsed();
            history.record(attempt, request, &error, elapsed);

            let remaining = self.policy.max_time().saturating_sub(elapsed);
            let delay = if attempt >= self.policy.max_tries() || remaining.is_zero() {
                None
            } else {
                schedule.next_backoff()
            };

            let delay = match delay {
                Some(delay) => delay.min(remaining),
                None => {
                    self.reporter.report(&history);
                    if self.policy.raise_on_giveup() {
                        return Err(error);
                    }
                    return Ok(None);
                }
            };

            info!(
                target: "request_miner::backoff",
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "backing off {} {} for {:.1}s",
                request.method(),
                request.url(),
                delay.as_secs_f64()
            );
            sleep(delay).await;
        }
    }
}

async fn send_once<S>(
    session: &S,
    request: &PreparedRequest,
    options: &SendOptions,
) -> Result<Response>
where
    S: Session + ?Sized,
{
    session.send(request, options).await?.error_for_status()
}
