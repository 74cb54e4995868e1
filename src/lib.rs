//! `request-miner` sends a single HTTP request and retries it under a
//! configurable backoff policy.
//!
//! - [`Miner::mine`] builds a request from method, URL and options and sends it
//! - [`Miner::process_request`] sends an already [`PreparedRequest`]
//! - [`BackoffPolicy::resolve`] turns loose [`BackoffOptions`] into a policy
//!
//! When retries are exhausted the [`CallHistory`] goes to a
//! [`GiveUpReporter`] ([`LogReporter`] by default, which logs through
//! `tracing`). The library never installs a subscriber; that is left to the
//! host application.

mod error;
mod executor;
mod giveup;
mod miner;
mod options;
mod policy;
mod request;
mod response;
mod session;

#[cfg(test)]
mod testing;

pub use backoff::backoff::Backoff;
pub use error::MinerError;
pub use executor::{AttemptRecord, CallHistory, RetryExecutor};
pub use giveup::{GiveUpReport, GiveUpReporter, LogReporter};
pub use miner::{mine, process_request, Miner};
pub use options::{
    BackoffOptions, BackoffType, DelayFn, ExceptionSpec, MineOptions, RequestOptions, SendOptions,
};
pub use policy::{BackoffPolicy, Jitter, RetryOn, Schedule, Strategy};
pub use request::{PreparedRequest, Request};
pub use response::Response;
pub use session::Session;

pub type Result<T> = std::result::Result<T, MinerError>;
