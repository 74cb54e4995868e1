use std::{collections::BTreeMap, time::Duration};

use tracing::{error, warn};

use crate::CallHistory;

/// Receives the call history once retries are exhausted.
pub trait GiveUpReporter: Send + Sync {
    fn report(&self, history: &CallHistory);
}

impl<F> GiveUpReporter for F
where
    F: Fn(&CallHistory) + Send + Sync,
{
    fn report(&self, history: &CallHistory) {
        self(history)
    }
}

/// Default reporter: one `error` event per give-up through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl GiveUpReporter for LogReporter {
    fn report(&self, history: &CallHistory) {
        match GiveUpReport::from_history(history) {
            Some(report) => report.log(),
            None => warn!("gave up on request but no attempt was recorded"),
        }
    }
}

/// Diagnostic summary of a request that exhausted its retries.
#[derive(Clone, Debug, PartialEq)]
pub struct GiveUpReport {
    pub method: String,
    pub url: String,
    /// Headers of every attempt, oldest first; later values win.
    pub headers: BTreeMap<String, String>,
    /// Body of the most recent attempt.
    pub body: Option<String>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl GiveUpReport {
    /// Returns `None` for an empty history.
    pub fn from_history(history: &CallHistory) -> Option<Self> {
        let last = history.last()?;

        let mut headers = BTreeMap::new();
        for record in history.iter() {
            for (name, value) in record.request.headers() {
                let rendered = if value.is_sensitive() {
                    "<redacted>".to_owned()
                } else {
                    String::from_utf8_lossy(value.as_bytes()).into_owned()
                };
                headers.insert(name.as_str().to_owned(), rendered);
            }
        }

        Some(Self {
            method: last.request.method().to_string(),
            url: last.request.url().to_string(),
            headers,
            body: last
                .request
                .body()
                .map(|body| String::from_utf8_lossy(body).into_owned()),
            attempts: last.attempt,
            elapsed: last.elapsed,
        })
    }

    pub fn log(&self) {
        error!(
            method = %self.method,
            url = %self.url,
            headers = ?self.headers,
            body = self.body.as_deref().unwrap_or("<none>"),
            attempts = self.attempts,
            elapsed_ms = u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX),
            "request {} {} failed after {} attempts",
            self.method,
            self.url,
            self.attempts
        );
    }
}
