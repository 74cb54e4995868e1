//! Resolution of [`BackoffOptions`] into an immutable [`BackoffPolicy`].
//!
//! Strategy names go through a lookup table after an optional namespace
//! prefix (`backoff.` or `backoff::`) is stripped:
//!
//! | name                       | strategy      | parameters                  |
//! |----------------------------|---------------|-----------------------------|
//! | `constant`                 | fixed delay   | `interval` (default 1s)     |
//! | `exponential`              | `base × factor^n` | `base`, `factor` (required) |
//! | `expo`                     | `base × factor^n` | `base` (default 1), `factor` (default 2) |
//! | `fibonacci`, `fibo`        | 1, 1, 2, 3, 5 … seconds | none              |
//!
//! Delays are produced through the [`backoff::backoff::Backoff`] trait so the
//! executor only ever asks "how long until the next attempt".

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use rand::Rng;
use serde::Deserialize;

use crate::{
    options::{BackoffType, DelayFn, ExceptionSpec},
    BackoffOptions, MinerError, Result,
};

const DEFAULT_MAX_TRIES: u32 = 5;
const DEFAULT_MAX_TIME_SECS: f64 = 10.0;
const DEFAULT_INTERVAL_SECS: f64 = 1.0;
const DEFAULT_EXPO_BASE_SECS: f64 = 1.0;
const DEFAULT_EXPO_FACTOR: f64 = 2.0;

const STRATEGY_PREFIXES: [&str; 2] = ["backoff.", "backoff::"];
const EXCEPTION_PREFIXES: [&str; 2] = ["requests.exceptions.", "requests."];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StrategyKind {
    Constant,
    Exponential,
    Expo,
    Fibonacci,
}

const STRATEGIES: [(&str, StrategyKind); 5] = [
    ("constant", StrategyKind::Constant),
    ("exponential", StrategyKind::Exponential),
    ("expo", StrategyKind::Expo),
    ("fibonacci", StrategyKind::Fibonacci),
    ("fibo", StrategyKind::Fibonacci),
];

/// Delay curve between attempts.
#[derive(Clone)]
pub enum Strategy {
    /// Same delay before every retry.
    Constant { interval: Duration },
    /// `base × factor^n` seconds before retry `n` (0-based).
    Exponential { base: f64, factor: f64 },
    /// Fibonacci sequence in seconds.
    Fibonacci,
    /// Caller-supplied curve.
    Custom(DelayFn),
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant { interval } => f
                .debug_struct("Constant")
                .field("interval", interval)
                .finish(),
            Self::Exponential { base, factor } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("factor", factor)
                .finish(),
            Self::Fibonacci => f.write_str("Fibonacci"),
            Self::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

/// Randomization applied on top of the strategy's delay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jitter {
    /// Delays are used as computed.
    #[default]
    None,
    /// Uniformly random delay between zero and the computed delay.
    Full,
}

impl FromStr for Jitter {
    type Err = MinerError;

    fn from_str(value: &str) -> Result<Self> {
        if value.eq_ignore_ascii_case("none") {
            Ok(Self::None)
        } else if value.eq_ignore_ascii_case("full") {
            Ok(Self::Full)
        } else {
            Err(MinerError::config(format!(
                "unknown jitter '{value}', expected 'none' or 'full'"
            )))
        }
    }
}

/// Classification of failures that trigger another attempt.
///
/// Anything that does not match propagates to the caller immediately.
#[derive(Clone)]
pub enum RetryOn {
    /// Any transport failure or non-success status. Request construction and
    /// decoding failures never match.
    RequestFailure,
    /// Connection failures only.
    Connection,
    /// Timeouts only.
    Timeout,
    /// Non-success HTTP statuses only.
    HttpStatus,
    /// Matches when any of the inner classifications does.
    AnyOf(Vec<RetryOn>),
    /// Caller-supplied predicate.
    Predicate(Arc<dyn Fn(&MinerError) -> bool + Send + Sync>),
}

impl RetryOn {
    /// Wraps a predicate.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&MinerError) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }

    /// Whether `error` is retryable under this classification.
    pub fn matches(&self, error: &MinerError) -> bool {
        match self {
            Self::RequestFailure => {
                error.is_transport() || matches!(error, MinerError::Http { .. })
            }
            Self::Connection => error.is_connect(),
            Self::Timeout => error.is_timeout(),
            Self::HttpStatus => matches!(error, MinerError::Http { .. }),
            Self::AnyOf(classes) => classes.iter().any(|class| class.matches(error)),
            Self::Predicate(predicate) => predicate(error),
        }
    }

    fn from_name(raw: &str) -> Result<Self> {
        let name = strip_namespace(raw.trim(), &EXCEPTION_PREFIXES);
        let class = match name.to_ascii_lowercase().as_str() {
            "request" | "requestexception" => Self::RequestFailure,
            "connection" | "connectionerror" => Self::Connection,
            "timeout" => Self::Timeout,
            "http" | "httperror" => Self::HttpStatus,
            _ => {
                return Err(MinerError::config(format!(
                    "unknown exception classification '{raw}'"
                )))
            }
        };
        Ok(class)
    }
}

impl Default for RetryOn {
    fn default() -> Self {
        Self::RequestFailure
    }
}

impl fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestFailure => f.write_str("RequestFailure"),
            Self::Connection => f.write_str("Connection"),
            Self::Timeout => f.write_str("Timeout"),
            Self::HttpStatus => f.write_str("HttpStatus"),
            Self::AnyOf(classes) => f.debug_tuple("AnyOf").field(classes).finish(),
            Self::Predicate(_) => f.write_str("Predicate(<fn>)"),
        }
    }
}

/// Fully resolved retry policy for one mining operation.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    strategy: Strategy,
    max_tries: u32,
    max_time: Duration,
    retry_on: RetryOn,
    raise_on_giveup: bool,
    max_delay: Option<Duration>,
    jitter: Jitter,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: Strategy::Constant {
                interval: Duration::from_secs_f64(DEFAULT_INTERVAL_SECS),
            },
            max_tries: DEFAULT_MAX_TRIES,
            max_time: Duration::from_secs_f64(DEFAULT_MAX_TIME_SECS),
            retry_on: RetryOn::RequestFailure,
            raise_on_giveup: false,
            max_delay: None,
            jitter: Jitter::None,
        }
    }
}

impl BackoffPolicy {
    /// Applies defaults and validates `options`.
    ///
    /// Fails with [`MinerError::Config`] when the `exponential` strategy is
    /// missing `base` or `factor`, when those are given to a strategy that
    /// does not use them, or when a numeric parameter is out of range.
    /// `expo` falls back to a 1s first delay doubling on each retry.
    pub fn resolve(options: BackoffOptions) -> Result<Self> {
        let strategy = match options.backoff_type.unwrap_or_default() {
            BackoffType::Custom(delay) => {
                reject_unused("base", "custom", options.base)?;
                reject_unused("factor", "custom", options.factor)?;
                reject_unused("interval", "custom", options.interval)?;
                Strategy::Custom(delay)
            }
            BackoffType::Named(name) => match lookup_strategy(&name)? {
                StrategyKind::Constant => {
                    reject_unused("base", "constant", options.base)?;
                    reject_unused("factor", "constant", options.factor)?;
                    let interval = options.interval.unwrap_or(DEFAULT_INTERVAL_SECS);
                    Strategy::Constant {
                        interval: positive_seconds("interval", interval)?,
                    }
                }
                StrategyKind::Exponential => {
                    reject_unused("interval", "exponential", options.interval)?;
                    let base = options.base.ok_or_else(|| {
                        MinerError::config("exponential backoff requires `base`")
                    })?;
                    let factor = options.factor.ok_or_else(|| {
                        MinerError::config("exponential backoff requires `factor`")
                    })?;
                    exponential_strategy(base, factor)?
                }
                StrategyKind::Expo => {
                    reject_unused("interval", "expo", options.interval)?;
                    exponential_strategy(
                        options.base.unwrap_or(DEFAULT_EXPO_BASE_SECS),
                        options.factor.unwrap_or(DEFAULT_EXPO_FACTOR),
                    )?
                }
                StrategyKind::Fibonacci => {
                    reject_unused("base", "fibonacci", options.base)?;
                    reject_unused("factor", "fibonacci", options.factor)?;
                    reject_unused("interval", "fibonacci", options.interval)?;
                    Strategy::Fibonacci
                }
            },
        };

        let max_tries = options.max_tries.unwrap_or(DEFAULT_MAX_TRIES);
        if max_tries == 0 {
            return Err(MinerError::config("`max_tries` must be at least 1"));
        }
        let max_time = positive_seconds(
            "max_time",
            options.max_time.unwrap_or(DEFAULT_MAX_TIME_SECS),
        )?;
        let max_delay = options
            .max_delay
            .map(|seconds| {
                Duration::try_from_secs_f64(seconds).map_err(|_| {
                    MinerError::config(format!(
                        "`max_delay` must be a non-negative number of seconds, got {seconds}"
                    ))
                })
            })
            .transpose()?;

        let retry_on = match options.exception {
            None => RetryOn::RequestFailure,
            Some(ExceptionSpec::Classifier(retry_on)) => retry_on,
            Some(ExceptionSpec::Names(names)) => {
                let mut classes = names
                    .iter()
                    .map(|name| RetryOn::from_name(name))
                    .collect::<Result<Vec<_>>>()?;
                match classes.len() {
                    0 => {
                        return Err(MinerError::config(
                            "`exception` must name at least one classification",
                        ))
                    }
                    1 => classes.remove(0),
                    _ => RetryOn::AnyOf(classes),
                }
            }
        };

        Ok(Self {
            strategy,
            max_tries,
            max_time,
            retry_on,
            raise_on_giveup: options.raise_on_giveup.unwrap_or(false),
            max_delay,
            jitter: options.jitter.unwrap_or_default(),
        })
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    pub fn max_time(&self) -> Duration {
        self.max_time
    }

    pub fn retry_on(&self) -> &RetryOn {
        &self.retry_on
    }

    pub fn raise_on_giveup(&self) -> bool {
        self.raise_on_giveup
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// Creates a fresh delay schedule for one operation.
    pub fn schedule(&self) -> Schedule {
        let curve: Box<dyn Backoff + Send> = match &self.strategy {
            Strategy::Constant { interval } => {
                Box::new(backoff::backoff::Constant::new(*interval))
            }
            Strategy::Exponential { base, factor } => {
                Box::new(exponential(*base, *factor, self.max_time))
            }
            Strategy::Fibonacci => Box::new(Fibonacci::default()),
            Strategy::Custom(delay) => Box::new(CustomCurve {
                delay: Arc::clone(delay),
                retry: 0,
            }),
        };
        Schedule {
            curve,
            max_delay: self.max_delay,
            jitter: self.jitter,
        }
    }
}

/// Delay generator handed to the executor, one per operation.
pub struct Schedule {
    curve: Box<dyn Backoff + Send>,
    max_delay: Option<Duration>,
    jitter: Jitter,
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Backoff for Schedule {
    fn reset(&mut self) {
        self.curve.reset();
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self.curve.next_backoff()?;
        let delay = match self.max_delay {
            Some(max_delay) => delay.min(max_delay),
            None => delay,
        };
        Some(match self.jitter {
            Jitter::None => delay,
            Jitter::Full => delay.mul_f64(rand::thread_rng().gen::<f64>()),
        })
    }
}

fn exponential(base: f64, factor: f64, ceiling: Duration) -> ExponentialBackoff {
    let initial = Duration::from_secs_f64(base);
    // Delays past the time budget are clamped by the executor anyway.
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_multiplier(factor)
        .with_randomization_factor(0.0)
        .with_max_interval(ceiling.max(initial))
        .with_max_elapsed_time(None)
        .build()
}

#[derive(Debug)]
struct Fibonacci {
    current: u64,
    next: u64,
}

impl Default for Fibonacci {
    fn default() -> Self {
        Self {
            current: 1,
            next: 1,
        }
    }
}

impl Backoff for Fibonacci {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = Duration::from_secs(self.current);
        let following = self.current.saturating_add(self.next);
        self.current = self.next;
        self.next = following;
        Some(delay)
    }
}

struct CustomCurve {
    delay: DelayFn,
    retry: u32,
}

impl Backoff for CustomCurve {
    fn reset(&mut self) {
        self.retry = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = (self.delay)(self.retry);
        self.retry = self.retry.saturating_add(1);
        Some(delay)
    }
}

fn lookup_strategy(raw: &str) -> Result<StrategyKind> {
    let name = strip_namespace(raw.trim(), &STRATEGY_PREFIXES);
    STRATEGIES
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
        .map(|(_, kind)| *kind)
        .ok_or_else(|| MinerError::config(format!("unknown backoff strategy '{raw}'")))
}

fn strip_namespace<'a>(name: &'a str, prefixes: &[&str]) -> &'a str {
    prefixes
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .unwrap_or(name)
}

fn reject_unused(key: &str, strategy: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(_) => Err(MinerError::config(format!(
            "`{key}` is not used by the {strategy} strategy"
        ))),
        None => Ok(()),
    }
}

fn exponential_strategy(base: f64, factor: f64) -> Result<Strategy> {
    positive_seconds("base", base)?;
    if !(factor.is_finite() && factor > 0.0) {
        return Err(MinerError::config(format!(
            "`factor` must be a positive number, got {factor}"
        )));
    }
    Ok(Strategy::Exponential { base, factor })
}

fn positive_seconds(key: &str, seconds: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(MinerError::config(format!(
            "`{key}` must be a positive number of seconds, got {seconds}"
        ))),
    }
}
