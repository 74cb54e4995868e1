use std::{fmt, sync::Arc};

use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    BackoffOptions, BackoffPolicy, GiveUpReporter, LogReporter, MineOptions, PreparedRequest,
    Request, Response, Result, RetryExecutor, SendOptions, Session,
};

/// Sends single requests through a reusable [`Session`] with retries.
///
/// The default session is a [`reqwest::Client`]; give-up reports go to
/// [`LogReporter`] unless replaced with [`Miner::with_reporter`].
#[derive(Clone)]
pub struct Miner<S = reqwest::Client> {
    session: S,
    reporter: Arc<dyn GiveUpReporter>,
}

impl<S: fmt::Debug> fmt::Debug for Miner<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Miner")
            .field("session", &self.session)
            .field("reporter", &"<dyn GiveUpReporter>")
            .finish()
    }
}

impl Default for Miner {
    fn default() -> Self {
        Self::new()
    }
}

impl Miner {
    /// Creates a miner with a fresh `reqwest` session.
    pub fn new() -> Self {
        Self::with_session(reqwest::Client::new())
    }
}

impl<S: Session> Miner<S> {
    /// Creates a miner that sends through `session`.
    pub fn with_session(session: S) -> Self {
        Self {
            session,
            reporter: Arc::new(LogReporter),
        }
    }

    /// Replaces the give-up reporter.
    pub fn with_reporter(mut self, reporter: impl GiveUpReporter + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Builds a request from `method`, `url` and `options`, then sends it with
    /// retries.
    ///
    /// The outcome is only observable through logging and errors: this returns
    /// `Ok(())` both on success and on a quiet give-up. Retry configuration is
    /// validated before the request is built, so a configuration error never
    /// reaches the network.
    pub async fn mine(&self, method: &str, url: &str, options: MineOptions) -> Result<()> {
        let MineOptions {
            request,
            send,
            backoff,
        } = options;
        let policy = BackoffPolicy::resolve(backoff)?;
        let prepared = Request::new(method, url).with_options(request).prepare()?;

        if let Some(response) = self.process_with_policy(&prepared, &send, &policy).await? {
            debug!(
                status = response.status().as_u16(),
                method = %prepared.method(),
                url = %prepared.url(),
                "request succeeded"
            );
        }
        Ok(())
    }

    /// Same as [`Miner::mine`] with options given as a flat JSON object, e.g.
    /// `{"headers": {...}, "max_tries": 3, "backoff_type": "backoff.expo", ...}`.
    pub async fn mine_map(
        &self,
        method: &str,
        url: &str,
        options: Map<String, Value>,
    ) -> Result<()> {
        self.mine(method, url, MineOptions::from_map(options)?).await
    }

    /// Sends an already prepared request with retries.
    ///
    /// Returns `Ok(None)` when retries were exhausted and `raise_on_giveup`
    /// is not set.
    pub async fn process_request(
        &self,
        request: &PreparedRequest,
        send: &SendOptions,
        backoff: BackoffOptions,
    ) -> Result<Option<Response>> {
        let policy = BackoffPolicy::resolve(backoff)?;
        self.process_with_policy(request, send, &policy).await
    }

    /// Sends an already prepared request under a resolved policy.
    pub async fn process_with_policy(
        &self,
        request: &PreparedRequest,
        send: &SendOptions,
        policy: &BackoffPolicy,
    ) -> Result<Option<Response>> {
        RetryExecutor::new(policy, self.reporter.as_ref())
            .run(&self.session, request, send)
            .await
    }
}

/// Mines a single request with a session created for this call.
pub async fn mine(method: &str, url: &str, options: MineOptions) -> Result<()> {
    Miner::new().mine(method, url, options).await
}

/// Sends a prepared request with a session created for this call.
pub async fn process_request(
    request: &PreparedRequest,
    backoff: BackoffOptions,
) -> Result<Option<Response>> {
    Miner::new()
        .process_request(request, &SendOptions::default(), backoff)
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use serde_json::json;

    use super::Miner;
    use crate::{
        testing::{ScriptedSession, Step},
        BackoffOptions, CallHistory, MineOptions, MinerError, RequestOptions,
    };

    fn counting_reporter(count: &Arc<AtomicUsize>) -> impl Fn(&CallHistory) + Send + Sync {
        let count = Arc::clone(count);
        move |_: &CallHistory| {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_give_up_completes_without_error() {
        let session = Arc::new(ScriptedSession::always(Step::Status(503)));
        let reports = Arc::new(AtomicUsize::new(0));
        let miner = Miner::with_session(Arc::clone(&session))
            .with_reporter(counting_reporter(&reports));

        let options =
            MineOptions::new().with_backoff(BackoffOptions::new().max_tries(3).max_time(10.0));
        miner
            .mine("GET", "https://example.test", options)
            .await
            .expect("quiet give-up must not raise");

        assert_eq!(session.calls(), 3);
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn raise_on_giveup_surfaces_the_retryable_error() {
        let session = Arc::new(ScriptedSession::always(Step::Connection));
        let reports = Arc::new(AtomicUsize::new(0));
        let miner = Miner::with_session(Arc::clone(&session))
            .with_reporter(counting_reporter(&reports));

        let options = MineOptions::new().with_backoff(
            BackoffOptions::new()
                .max_tries(3)
                .max_time(10.0)
                .raise_on_giveup(true),
        );
        let err = miner
            .mine("GET", "https://example.test", options)
            .await
            .expect_err("give-up must raise");

        assert!(matches!(err, MinerError::Connection(_)));
        assert_eq!(session.calls(), 3);
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn configuration_error_happens_before_any_send() {
        let session = Arc::new(ScriptedSession::new([Step::Status(200)]));
        let miner = Miner::with_session(Arc::clone(&session));

        let options =
            MineOptions::new().with_backoff(BackoffOptions::new().backoff_type("exponential"));
        let err = miner
            .mine("GET", "https://example.test", options)
            .await
            .expect_err("exponential without base must fail");

        assert!(matches!(err, MinerError::Config(_)));
        assert_eq!(session.calls(), 0);
    }

    #[tokio::test]
    async fn invalid_request_is_not_sent() {
        let session = Arc::new(ScriptedSession::new([Step::Status(200)]));
        let miner = Miner::with_session(Arc::clone(&session));

        let err = miner
            .mine("GET", "", MineOptions::new())
            .await
            .expect_err("empty url must fail");

        assert!(matches!(err, MinerError::InvalidRequest(_)));
        assert_eq!(session.calls(), 0);
    }

    #[tokio::test]
    async fn mine_map_accepts_flat_options() {
        let session = Arc::new(ScriptedSession::new([Step::Status(200)]));
        let miner = Miner::with_session(Arc::clone(&session));

        let options = json!({
            "headers": {"accept": "application/json"},
            "params": {"q": "1"},
            "backoff_type": "backoff.constant",
            "max_tries": 2
        });
        let serde_json::Value::Object(options) = options else {
            panic!("expected object");
        };
        miner
            .mine_map("get", "https://example.test", options)
            .await
            .expect("request must succeed");

        assert_eq!(session.calls(), 1);
    }

    #[tokio::test]
    async fn process_request_returns_the_response() {
        let session = Arc::new(ScriptedSession::new([Step::Status(200)]));
        let miner = Miner::with_session(Arc::clone(&session));
        let request = crate::Request::new("POST", "https://example.test")
            .with_options(RequestOptions::default().body("hello"))
            .prepare()
            .expect("request must prepare");

        let response = miner
            .process_request(&request, &Default::default(), BackoffOptions::new())
            .await
            .expect("request must succeed")
            .expect("response must be returned");

        assert!(response.is_success());
        assert_eq!(response.text(), "status 200");
    }

    #[test]
    fn debug_hides_reporter() {
        let miner = Miner::new();
        let debug = format!("{miner:?}");
        assert!(debug.contains("Miner"));
        assert!(debug.contains("<dyn GiveUpReporter>"));
    }
}
