//! Scripted [`Session`] for unit tests.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::time::Instant;

use crate::{MinerError, PreparedRequest, Response, Result, SendOptions, Session};

#[derive(Clone, Copy, Debug)]
pub(crate) enum Step {
    /// Respond with this status code.
    Status(u16),
    /// Fail as a dropped connection.
    Connection,
    /// Fail as a malformed request.
    Invalid,
}

impl Step {
    fn outcome(self) -> Result<Response> {
        match self {
            Self::Status(code) => {
                let status = StatusCode::from_u16(code).expect("test status must be valid");
                Ok(Response::new(status, format!("status {code}")))
            }
            Self::Connection => Err(MinerError::Connection("connection reset".to_owned())),
            Self::Invalid => Err(MinerError::InvalidRequest("malformed".to_owned())),
        }
    }
}

/// Plays back `steps` in order, then repeats `fallback` forever.
pub(crate) struct ScriptedSession {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    sent_at: Mutex<Vec<Instant>>,
}

impl ScriptedSession {
    pub(crate) fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            fallback: Step::Status(500),
            sent_at: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn always(step: Step) -> Self {
        Self {
            fallback: step,
            ..Self::new([])
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.sent_at.lock().expect("sent_at mutex must not be poisoned").len()
    }

    /// Time between consecutive sends.
    pub(crate) fn gaps(&self) -> Vec<Duration> {
        let sent_at = self.sent_at.lock().expect("sent_at mutex must not be poisoned");
        sent_at
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect()
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn send(&self, _request: &PreparedRequest, _options: &SendOptions) -> Result<Response> {
        self.sent_at
            .lock()
            .expect("sent_at mutex must not be poisoned")
            .push(Instant::now());
        let step = self
            .steps
            .lock()
            .expect("steps mutex must not be poisoned")
            .pop_front()
            .unwrap_or(self.fallback);
        step.outcome()
    }
}
