/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum MinerError {
    /// Invalid or missing retry configuration. Raised before any request is sent.
    #[error("configuration error: {0}")]
    Config(String),
    /// The request could not be assembled (bad method, URL, header or body).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Network or request execution error from `reqwest`.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// Transport failure reported by a custom [`Session`](crate::Session).
    #[error("connection error: {0}")]
    Connection(String),
    /// Non-success HTTP status code with raw response body.
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },
    /// Response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl MinerError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Returns the HTTP status code for [`MinerError::Http`] failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }

    /// Whether the failure happened in the transport layer, as opposed to a
    /// response that arrived with a failing status.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Transport(err) => !err.is_builder(),
            Self::Connection(_) => true,
            _ => false,
        }
    }

    /// Whether the failure is a connection-level failure.
    pub fn is_connect(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_connect(),
            Self::Connection(_) => true,
            _ => false,
        }
    }

    /// Whether the failure is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_timeout())
    }
}
