use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::{Jitter, MinerError, Result, RetryOn};

/// Caller-supplied delay generator. Receives the retry number, starting at 0
/// for the delay that precedes the second attempt.
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Strategy selection: a named built-in or a custom delay function.
#[derive(Clone)]
pub enum BackoffType {
    /// Name of a built-in strategy, e.g. `"constant"` or `"backoff.expo"`.
    Named(String),
    /// Fully custom backoff curve.
    Custom(DelayFn),
}

impl Default for BackoffType {
    fn default() -> Self {
        Self::Named("constant".to_owned())
    }
}

impl fmt::Debug for BackoffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Self::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

impl<'de> Deserialize<'de> for BackoffType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::Named)
    }
}

/// Which failures are retried: names resolved later, or a ready classifier.
#[derive(Clone, Debug)]
pub enum ExceptionSpec {
    /// Classification names such as `"RequestException"` or `"timeout"`.
    Names(Vec<String>),
    /// Pre-built classifier.
    Classifier(RetryOn),
}

impl<'de> Deserialize<'de> for ExceptionSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(name) => Self::Names(vec![name]),
            OneOrMany::Many(names) => Self::Names(names),
        })
    }
}

/// Loosely-typed retry options. Every field is optional; defaults and
/// validation are applied by [`BackoffPolicy::resolve`](crate::BackoffPolicy::resolve).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffOptions {
    /// Strategy name or custom function. Defaults to `constant`.
    pub backoff_type: Option<BackoffType>,
    /// Upper bound on send attempts. Defaults to 5.
    pub max_tries: Option<u32>,
    /// Upper bound on total elapsed seconds. Defaults to 10.
    pub max_time: Option<f64>,
    /// Retryable failure classification. Defaults to any request failure.
    pub exception: Option<ExceptionSpec>,
    /// Return the last failure after giving up. Defaults to `false`.
    pub raise_on_giveup: Option<bool>,
    /// First exponential delay in seconds. Required for `exponential`;
    /// `expo` defaults to 1.
    pub base: Option<f64>,
    /// Exponential growth factor. Required for `exponential`; `expo`
    /// defaults to 2.
    pub factor: Option<f64>,
    /// Constant delay in seconds. Defaults to 1.
    pub interval: Option<f64>,
    /// Cap in seconds applied to every delay.
    pub max_delay: Option<f64>,
    /// Randomization applied to every delay. Defaults to none.
    pub jitter: Option<Jitter>,
}

impl BackoffOptions {
    /// Option keys consumed by the retry layer.
    pub const KEYS: [&'static str; 10] = [
        "backoff_type",
        "max_tries",
        "max_time",
        "exception",
        "raise_on_giveup",
        "base",
        "factor",
        "interval",
        "max_delay",
        "jitter",
    ];

    pub fn new() -> Self {
        Self::default()
    }

    /// Exponential strategy with its two required parameters.
    pub fn exponential(base: f64, factor: f64) -> Self {
        Self::new().backoff_type("exponential").base(base).factor(factor)
    }

    pub fn backoff_type(mut self, name: impl Into<String>) -> Self {
        self.backoff_type = Some(BackoffType::Named(name.into()));
        self
    }

    /// Uses `delay` to compute every wait between attempts.
    pub fn custom_backoff<F>(mut self, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.backoff_type = Some(BackoffType::Custom(Arc::new(delay)));
        self
    }

    pub fn max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    pub fn max_time(mut self, seconds: f64) -> Self {
        self.max_time = Some(seconds);
        self
    }

    pub fn exception(mut self, retry_on: RetryOn) -> Self {
        self.exception = Some(ExceptionSpec::Classifier(retry_on));
        self
    }

    pub fn exception_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exception = Some(ExceptionSpec::Names(
            names.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn raise_on_giveup(mut self, raise: bool) -> Self {
        self.raise_on_giveup = Some(raise);
        self
    }

    pub fn base(mut self, base: f64) -> Self {
        self.base = Some(base);
        self
    }

    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = Some(factor);
        self
    }

    pub fn interval(mut self, seconds: f64) -> Self {
        self.interval = Some(seconds);
        self
    }

    pub fn max_delay(mut self, seconds: f64) -> Self {
        self.max_delay = Some(seconds);
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Removes every retry key from `map` and parses them.
    ///
    /// Whatever stays in `map` belongs to the transport layer. `null` values
    /// are treated as absent.
    pub fn take_from(map: &mut Map<String, Value>) -> Result<Self> {
        let mut extracted = Map::new();
        for key in Self::KEYS {
            if let Some(value) = map.remove(key) {
                if !value.is_null() {
                    extracted.insert(key.to_owned(), value);
                }
            }
        }
        serde_json::from_value(Value::Object(extracted))
            .map_err(|err| MinerError::config(format!("invalid backoff options: {err}")))
    }

    /// Reads retry options from `REQUEST_MINER_*` environment variables.
    ///
    /// Recognized variables: `REQUEST_MINER_BACKOFF_TYPE`, `_MAX_TRIES`,
    /// `_MAX_TIME`, `_EXCEPTION` (comma separated), `_RAISE_ON_GIVEUP`,
    /// `_BASE`, `_FACTOR`, `_INTERVAL`, `_MAX_DELAY`, `_JITTER`.
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |suffix: &str| -> Result<Option<String>> {
            let key = format!("REQUEST_MINER_{suffix}");
            match lookup(&key) {
                None => Ok(None),
                Some(value) if value.trim().is_empty() => {
                    Err(MinerError::config(format!("{key} is set but empty")))
                }
                Some(value) => Ok(Some(value.trim().to_owned())),
            }
        };

        Ok(Self {
            backoff_type: read("BACKOFF_TYPE")?.map(BackoffType::Named),
            max_tries: parse_env(read("MAX_TRIES")?, "MAX_TRIES")?,
            max_time: parse_env(read("MAX_TIME")?, "MAX_TIME")?,
            exception: read("EXCEPTION")?.map(|names| {
                ExceptionSpec::Names(
                    names
                        .split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(str::to_owned)
                        .collect(),
                )
            }),
            raise_on_giveup: parse_env(read("RAISE_ON_GIVEUP")?, "RAISE_ON_GIVEUP")?,
            base: parse_env(read("BASE")?, "BASE")?,
            factor: parse_env(read("FACTOR")?, "FACTOR")?,
            interval: parse_env(read("INTERVAL")?, "INTERVAL")?,
            max_delay: parse_env(read("MAX_DELAY")?, "MAX_DELAY")?,
            jitter: read("JITTER")?.map(|name| name.parse()).transpose()?,
        })
    }
}

fn parse_env<T>(value: Option<String>, suffix: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .map(|raw| {
            raw.to_ascii_lowercase().parse::<T>().map_err(|err| {
                MinerError::config(format!("REQUEST_MINER_{suffix}='{raw}' is invalid: {err}"))
            })
        })
        .transpose()
}

/// Options forwarded to every [`Session::send`](crate::Session::send) call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Per-attempt timeout.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Removes the send keys (`timeout`, in seconds) from `map`.
    pub fn take_from(map: &mut Map<String, Value>) -> Result<Self> {
        let timeout = match map.remove("timeout") {
            None | Some(Value::Null) => None,
            Some(value) => {
                let timeout = value
                    .as_f64()
                    .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
                    .filter(|timeout| !timeout.is_zero())
                    .ok_or_else(|| {
                        MinerError::invalid_request(format!(
                            "timeout must be a positive number of seconds, got {value}"
                        ))
                    })?;
                Some(timeout)
            }
        };
        Ok(Self { timeout })
    }
}

/// Parts of the request itself: headers, query parameters and one body kind.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestOptions {
    /// Header pairs; a repeated name keeps the last value.
    #[serde(deserialize_with = "pairs")]
    pub headers: Vec<(String, String)>,
    /// Query parameters appended to the URL.
    #[serde(deserialize_with = "pairs")]
    pub params: Vec<(String, String)>,
    /// Raw body bytes.
    #[serde(deserialize_with = "raw_body")]
    pub body: Option<Bytes>,
    /// JSON body.
    pub json: Option<Value>,
    /// Form-urlencoded body.
    #[serde(deserialize_with = "optional_pairs")]
    pub form: Option<Vec<(String, String)>>,
}

impl RequestOptions {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json(mut self, json: Value) -> Self {
        self.json = Some(json);
        self
    }

    pub fn form<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.form = Some(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        );
        self
    }
}

/// Everything a mining call accepts besides method and URL.
#[derive(Clone, Debug, Default)]
pub struct MineOptions {
    pub request: RequestOptions,
    pub send: SendOptions,
    pub backoff: BackoffOptions,
}

impl MineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request(mut self, request: RequestOptions) -> Self {
        self.request = request;
        self
    }

    pub fn with_send(mut self, send: SendOptions) -> Self {
        self.send = send;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = backoff;
        self
    }

    /// Splits a flat option map into retry, send and request options.
    ///
    /// Retry keys are taken first, then `timeout`; the remainder must be
    /// request keys (`headers`, `params`, `body`, `json`, `form`).
    pub fn from_map(mut map: Map<String, Value>) -> Result<Self> {
        let backoff = BackoffOptions::take_from(&mut map)?;
        let send = SendOptions::take_from(&mut map)?;
        let request = serde_json::from_value(Value::Object(map))
            .map_err(|err| MinerError::invalid_request(format!("invalid request options: {err}")))?;
        Ok(Self {
            request,
            send,
            backoff,
        })
    }
}

fn pairs<'de, D>(deserializer: D) -> std::result::Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_to_pairs(value).map_err(serde::de::Error::custom)
}

fn optional_pairs<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Vec<(String, String)>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        value => value_to_pairs(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn value_to_pairs(value: Value) -> std::result::Result<Vec<(String, String)>, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => map
            .into_iter()
            .map(|(name, value)| scalar_to_string(value).map(|value| (name, value)))
            .collect(),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Array(mut pair) if pair.len() == 2 => {
                    let value = pair.pop().map(scalar_to_string).transpose()?;
                    let name = pair.pop().map(scalar_to_string).transpose()?;
                    match (name, value) {
                        (Some(name), Some(value)) => Ok((name, value)),
                        _ => Err("expected [name, value] pairs".to_owned()),
                    }
                }
                other => Err(format!("expected [name, value] pair, got {other}")),
            })
            .collect(),
        other => Err(format!("expected an object or a list of pairs, got {other}")),
    }
}

fn scalar_to_string(value: Value) -> std::result::Result<String, String> {
    match value {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        other => Err(format!("expected a scalar value, got {other}")),
    }
}

fn raw_body<'de, D>(deserializer: D) -> std::result::Result<Option<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(Bytes::from(text))),
        Value::Array(items) => items
            .into_iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|byte| u8::try_from(byte).ok())
                    .ok_or_else(|| serde::de::Error::custom("body bytes must be 0..=255"))
            })
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map(|bytes| Some(Bytes::from(bytes))),
        other => Err(serde::de::Error::custom(format!(
            "body must be a string or a byte array, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::{BackoffOptions, BackoffType, ExceptionSpec, MineOptions, SendOptions};
    use crate::{BackoffPolicy, Jitter, MinerError};

    fn object(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn take_from_removes_backoff_keys_and_keeps_the_rest() {
        let mut map = object(json!({
            "backoff_type": "backoff.expo",
            "max_tries": 3,
            "base": 1,
            "factor": 2.5,
            "raise_on_giveup": true,
            "headers": {"x-trace": "1"},
            "timeout": 2
        }));

        let options = BackoffOptions::take_from(&mut map).expect("options must parse");

        assert!(matches!(options.backoff_type, Some(BackoffType::Named(ref name)) if name == "backoff.expo"));
        assert_eq!(options.max_tries, Some(3));
        assert_eq!(options.base, Some(1.0));
        assert_eq!(options.factor, Some(2.5));
        assert_eq!(options.raise_on_giveup, Some(true));
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("headers"));
        assert!(map.contains_key("timeout"));
    }

    #[test]
    fn take_from_treats_null_as_absent() {
        let mut map = object(json!({ "max_tries": null, "exception": ["Timeout", "HTTPError"] }));
        let options = BackoffOptions::take_from(&mut map).expect("options must parse");
        assert_eq!(options.max_tries, None);
        match options.exception {
            Some(ExceptionSpec::Names(names)) => assert_eq!(names, ["Timeout", "HTTPError"]),
            _ => panic!("expected exception names"),
        }
        assert!(map.is_empty());
    }

    #[test]
    fn take_from_rejects_wrong_types() {
        let mut map = object(json!({ "max_tries": "three" }));
        let err = BackoffOptions::take_from(&mut map).expect_err("must fail");
        assert!(matches!(err, MinerError::Config(_)));
    }

    #[test]
    fn from_map_splits_request_send_and_backoff_options() {
        let options = MineOptions::from_map(object(json!({
            "headers": {"accept": "text/plain"},
            "params": [["q", "rust"], ["page", 2]],
            "json": {"hello": "world"},
            "timeout": 0.5,
            "max_time": 4
        })))
        .expect("options must split");

        assert_eq!(options.request.headers, [("accept".to_owned(), "text/plain".to_owned())]);
        assert_eq!(
            options.request.params,
            [
                ("q".to_owned(), "rust".to_owned()),
                ("page".to_owned(), "2".to_owned())
            ]
        );
        assert_eq!(options.request.json, Some(json!({"hello": "world"})));
        assert_eq!(
            options.send,
            SendOptions::default().timeout(std::time::Duration::from_millis(500))
        );
        assert_eq!(options.backoff.max_time, Some(4.0));
    }

    #[test]
    fn from_map_rejects_unknown_transport_keys() {
        let err = MineOptions::from_map(object(json!({ "verify": false }))).expect_err("must fail");
        assert!(matches!(err, MinerError::InvalidRequest(_)));
    }

    #[test]
    fn from_map_rejects_non_positive_timeout() {
        let err = MineOptions::from_map(object(json!({ "timeout": 0 }))).expect_err("must fail");
        assert!(matches!(err, MinerError::InvalidRequest(_)));
    }

    #[test]
    fn from_map_rejects_timeout_too_large_for_a_duration() {
        let err =
            MineOptions::from_map(object(json!({ "timeout": 1e300 }))).expect_err("must fail");
        assert!(matches!(err, MinerError::InvalidRequest(message) if message.contains("timeout")));

        let mut map = object(json!({ "timeout": 1e20 }));
        let err = SendOptions::take_from(&mut map).expect_err("must fail");
        assert!(matches!(err, MinerError::InvalidRequest(_)));
    }

    #[test]
    fn from_map_rejects_backoff_seconds_too_large_for_a_duration() {
        let options = MineOptions::from_map(object(json!({ "max_time": 1e20 })))
            .expect("numbers are validated at resolution");
        let err = BackoffPolicy::resolve(options.backoff).expect_err("must fail");
        assert!(matches!(err, MinerError::Config(_)));
    }

    #[test]
    fn from_lookup_reads_prefixed_variables() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("REQUEST_MINER_BACKOFF_TYPE", "expo"),
            ("REQUEST_MINER_MAX_TRIES", "4"),
            ("REQUEST_MINER_BASE", "0.5"),
            ("REQUEST_MINER_FACTOR", "3"),
            ("REQUEST_MINER_RAISE_ON_GIVEUP", "TRUE"),
            ("REQUEST_MINER_EXCEPTION", "timeout, connection"),
            ("REQUEST_MINER_JITTER", "full"),
        ]);

        let options = BackoffOptions::from_lookup(|key| vars.get(key).map(|v| (*v).to_owned()))
            .expect("env options must parse");

        assert_eq!(options.max_tries, Some(4));
        assert_eq!(options.base, Some(0.5));
        assert_eq!(options.factor, Some(3.0));
        assert_eq!(options.raise_on_giveup, Some(true));
        assert_eq!(options.jitter, Some(Jitter::Full));
        assert_eq!(options.max_time, None);
        match options.exception {
            Some(ExceptionSpec::Names(names)) => assert_eq!(names, ["timeout", "connection"]),
            _ => panic!("expected exception names"),
        }
    }

    #[test]
    fn from_lookup_rejects_empty_and_malformed_values() {
        let empty = BackoffOptions::from_lookup(|key| {
            (key == "REQUEST_MINER_MAX_TIME").then(|| "  ".to_owned())
        })
        .expect_err("empty value must fail");
        assert!(matches!(empty, MinerError::Config(_)));

        let malformed = BackoffOptions::from_lookup(|key| {
            (key == "REQUEST_MINER_MAX_TRIES").then(|| "many".to_owned())
        })
        .expect_err("malformed value must fail");
        assert!(matches!(malformed, MinerError::Config(_)));
    }
}
