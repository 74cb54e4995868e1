use bytes::Bytes;
use reqwest::{header::HeaderMap, StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::{MinerError, Result};

/// Fully buffered HTTP response.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    url: Option<Url>,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Builds a response from its parts, e.g. inside a custom [`Session`](crate::Session).
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            url: None,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Final URL after redirects, when the session reports one.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|err| {
            MinerError::Decode(format!("invalid response JSON: {err}; body: {}", self.text()))
        })
    }

    /// Turns a non-success status into [`MinerError::Http`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(MinerError::Http {
                status: self.status.as_u16(),
                body: self.text(),
            })
        }
    }
}
