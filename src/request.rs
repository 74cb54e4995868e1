use bytes::Bytes;
use reqwest::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Method, Url,
};

use crate::{MinerError, RequestOptions, Result};

/// Immutable, fully assembled HTTP request.
///
/// Query parameters are already encoded into [`PreparedRequest::url`].
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl PreparedRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }
}

/// Unvalidated request description. Call [`Request::prepare`] to validate it.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    method: String,
    url: String,
    options: RequestOptions,
}

impl Default for Request {
    fn default() -> Self {
        Self::new("GET", "")
    }
}

impl Request {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            options: RequestOptions::default(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options = self.options.header(name, value);
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options = self.options.param(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.options = self.options.body(body);
        self
    }

    pub fn json(mut self, json: serde_json::Value) -> Self {
        self.options = self.options.json(json);
        self
    }

    /// Validates and assembles the request.
    ///
    /// Fails with [`MinerError::InvalidRequest`] for a non-standard method, a
    /// URL that is not absolute `http`/`https`, an invalid header, or more
    /// than one body kind.
    pub fn prepare(self) -> Result<PreparedRequest> {
        let method = parse_method(&self.method)?;

        let mut url = Url::parse(self.url.trim()).map_err(|err| {
            MinerError::invalid_request(format!("invalid url '{}': {err}", self.url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MinerError::invalid_request(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }

        let RequestOptions {
            headers: header_pairs,
            params,
            body,
            json,
            form,
        } = self.options;

        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(&params);
        }

        let mut headers = HeaderMap::with_capacity(header_pairs.len());
        for (name, value) in &header_pairs {
            let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|err| {
                MinerError::invalid_request(format!("invalid header name '{name}': {err}"))
            })?;
            let mut value = HeaderValue::from_str(value).map_err(|err| {
                MinerError::invalid_request(format!("invalid value for header '{name}': {err}"))
            })?;
            if is_sensitive(&name) {
                value.set_sensitive(true);
            }
            headers.insert(name, value);
        }

        let body = match (body, json, form) {
            (None, None, None) => None,
            (Some(body), None, None) => Some(body),
            (None, Some(json), None) => {
                let encoded = serde_json::to_vec(&json).map_err(|err| {
                    MinerError::invalid_request(format!("json body could not be encoded: {err}"))
                })?;
                default_content_type(&mut headers, "application/json");
                Some(Bytes::from(encoded))
            }
            (None, None, Some(form)) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(&form)
                    .finish();
                default_content_type(&mut headers, "application/x-www-form-urlencoded");
                Some(Bytes::from(encoded))
            }
            _ => {
                return Err(MinerError::invalid_request(
                    "only one of body, json or form may be set",
                ))
            }
        };

        Ok(PreparedRequest {
            method,
            url,
            headers,
            body,
        })
    }
}

fn parse_method(method: &str) -> Result<Method> {
    let upper = method.trim().to_ascii_uppercase();
    match upper.as_str() {
        "GET" | "HEAD" | "POST" | "PUT" | "DELETE" | "CONNECT" | "OPTIONS" | "TRACE" | "PATCH" => {
            Method::from_bytes(upper.as_bytes())
                .map_err(|err| MinerError::invalid_request(format!("invalid method: {err}")))
        }
        _ => Err(MinerError::invalid_request(format!(
            "unsupported http method '{method}'"
        ))),
    }
}

fn is_sensitive(name: &HeaderName) -> bool {
    name == header::AUTHORIZATION || name == header::PROXY_AUTHORIZATION || name == header::COOKIE
}

fn default_content_type(headers: &mut HeaderMap, content_type: &'static str) {
    headers
        .entry(header::CONTENT_TYPE)
        .or_insert(HeaderValue::from_static(content_type));
}
