//! `reqrun` is an HTTP request runtime for typed API clients.
//!
//! Requests are immutable descriptions built by chaining; every builder call
//! returns a new value, so a configured [`Request`] works as a template. A
//! [`Sender`] executes them. The stock [`Client`] retries with exponential
//! backoff, follows redirects, undoes content encodings, decodes JSON, and
//! reports every phase to layered [`TraceHooks`]. [`WaitGroup`] and
//! [`RunGroup`] fan out many sends under a concurrency limit.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqrun::prelude::{Client, Request, RetryPolicy, Sender};
//! use serde::Deserialize;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com/v1/")
//!         .client_name("my-sdk")
//!         .retry_policy(
//!             RetryPolicy::standard()
//!                 .count(3)
//!                 .start_interval(Duration::from_millis(100))
//!                 .total_budget(Duration::from_secs(10)),
//!         )
//!         .try_build()?;
//!
//!     let item = Request::get("items/{id}")
//!         .path_param("id", 7)
//!         .into_json::<Item>()
//!         .send(&client, &CancellationToken::new())
//!         .await
//!         .into_result()?;
//!
//!     println!("item={item:?}");
//!     Ok(())
//! }
//! ```

mod backoff;
mod body;
mod client;
mod config;
mod content_encoding;
mod error;
mod group;
mod limiters;
mod request;
mod response;
mod retry;
mod trace;
mod transport;
mod util;

pub use crate::backoff::Backoff;
pub use crate::body::{BodySource, RequestBody, ResponseBody, SeekableReader, full_body};
pub use crate::client::{Client, ClientBuilder, Sender};
pub use crate::config::{
    ClientProfile, DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_RESPONSE_BODY_BYTES, ProfileDefaults,
    ProtocolPolicy, ProtocolVersion, TransportConfig,
};
pub use crate::error::{
    BoxError, Error, ErrorCode, MultiError, TransportError, TransportErrorKind,
};
pub use crate::group::{
    DEFAULT_RUN_GROUP_LIMIT, DEFAULT_WAIT_GROUP_LIMIT, FnUnit, RunGroup, Sendable, WaitGroup,
    unit_fn,
};
pub use crate::request::{CompletionListener, Request};
pub use crate::response::{ApiError, FinalRequest, RawResponse, Response};
pub use crate::retry::{
    DefaultRetryCondition, RetryAttempt, RetryCondition, RetryDecision, RetryPolicy,
};
pub use crate::transport::{HyperTransport, Transport, TransportFuture};

/// Trace hook events and composition helpers.
pub mod trace_hooks {
    pub use crate::trace::{
        AttemptDone, AttemptStart, CallDone, CallStart, ConnectDone, ConnectStart,
        ConnectionTrace, DecodeDone, DecodeStart, DnsDone, DnsStart, Hook, RetryWait,
        TlsDone, TlsStart, TraceFactory, TraceHooks, factory, logging_factory,
    };
}

pub use crate::trace::{ConnectionTrace, TraceFactory, TraceHooks};

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod prelude {
    pub use crate::{
        ApiError, Client, ClientBuilder, ClientProfile, ConnectionTrace, Error, ErrorCode,
        RawResponse, Request, Response, RetryAttempt, RetryPolicy, RunGroup, Sender,
        TraceFactory, TraceHooks, TransportConfig, TransportErrorKind, WaitGroup, unit_fn,
    };
}

#[cfg(test)]
mod tests;
