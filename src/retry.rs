use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use http::{Extensions, HeaderMap, Method, StatusCode};

use crate::backoff::Backoff;
use crate::error::{Error, ErrorCode, TransportErrorKind};

/// Which try of a logical send produced an outbound request: 0 is the first
/// try, 1 the first retry, and so on. Stored in the request extensions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RetryAttempt(pub usize);

impl RetryAttempt {
    pub fn of(extensions: &Extensions) -> usize {
        extensions
            .get::<RetryAttempt>()
            .map(|attempt| attempt.0)
            .unwrap_or(0)
    }
}

/// Outcome of one try as seen by a [`RetryCondition`].
///
/// A response carries its status and headers. A failed try carries the
/// error's stable code and rendered message instead.
#[derive(Clone, Debug)]
pub struct RetryDecision {
    pub attempt: usize,
    pub method: Method,
    pub uri: String,
    pub status: Option<StatusCode>,
    pub headers: Option<HeaderMap>,
    pub transport_error_kind: Option<TransportErrorKind>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
}

impl RetryDecision {
    pub(crate) fn from_outcome<R>(
        attempt: usize,
        method: &Method,
        uri: &str,
        outcome: &Result<R, Error>,
        response_of: impl FnOnce(&R) -> (StatusCode, &HeaderMap),
    ) -> Self {
        let mut decision = Self {
            attempt,
            method: method.clone(),
            uri: uri.to_owned(),
            status: None,
            headers: None,
            transport_error_kind: None,
            error_code: None,
            error_message: None,
        };
        match outcome {
            Ok(response) => {
                let (status, headers) = response_of(response);
                decision.status = Some(status);
                decision.headers = Some(headers.clone());
            }
            Err(error) => {
                decision.transport_error_kind = match error {
                    Error::Transport { kind, .. } => Some(*kind),
                    Error::ReadBody { .. } => Some(TransportErrorKind::Read),
                    _ => None,
                };
                decision.error_code = Some(error.code());
                decision.error_message = Some(error.to_string());
            }
        }
        decision
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|headers| headers.get(name))
            .and_then(|value| value.to_str().ok())
    }
}

pub trait RetryCondition: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

/// Retries every transport failure except DNS resolution, and a fixed set of
/// transient statuses.
#[derive(Clone, Debug)]
pub struct DefaultRetryCondition {
    statuses: BTreeSet<u16>,
}

impl DefaultRetryCondition {
    pub fn with_statuses(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
        }
    }
}

impl Default for DefaultRetryCondition {
    fn default() -> Self {
        Self::with_statuses([408, 409, 423, 429, 500, 502, 503, 504])
    }
}

impl RetryCondition for DefaultRetryCondition {
    fn should_retry(&self, decision: &RetryDecision) -> bool {
        if let Some(kind) = decision.transport_error_kind {
            return kind != TransportErrorKind::Dns;
        }
        decision
            .status
            .is_some_and(|status| self.statuses.contains(&status.as_u16()))
    }
}

struct FnRetryCondition<F>(F);

impl<F> RetryCondition for FnRetryCondition<F>
where
    F: Fn(&RetryDecision) -> bool + Send + Sync,
{
    fn should_retry(&self, decision: &RetryDecision) -> bool {
        (self.0)(decision)
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    condition: Arc<dyn RetryCondition>,
    count: usize,
    start_interval: Duration,
    max_interval: Duration,
    total_budget: Duration,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("count", &self.count)
            .field("start_interval", &self.start_interval)
            .field("max_interval", &self.max_interval)
            .field("total_budget", &self.total_budget)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            condition: Arc::new(DefaultRetryCondition::default()),
            count: 4,
            start_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            total_budget: Duration::from_secs(60),
        }
    }

    pub fn disabled() -> Self {
        Self::standard().count(0)
    }

    /// Number of retries after the first try.
    pub fn count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn start_interval(mut self, start_interval: Duration) -> Self {
        self.start_interval = start_interval.max(Duration::from_millis(1));
        if self.max_interval < self.start_interval {
            self.max_interval = self.start_interval;
        }
        self
    }

    pub fn max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval.max(self.start_interval);
        self
    }

    /// Wall-clock budget for the whole send, final successful try included.
    pub fn total_budget(mut self, total_budget: Duration) -> Self {
        self.total_budget = total_budget.max(Duration::from_millis(1));
        self
    }

    pub fn condition(mut self, condition: Arc<dyn RetryCondition>) -> Self {
        self.condition = condition;
        self
    }

    pub fn condition_fn<F>(self, condition: F) -> Self
    where
        F: Fn(&RetryDecision) -> bool + Send + Sync + 'static,
    {
        self.condition(Arc::new(FnRetryCondition(condition)))
    }

    pub fn max_retries(&self) -> usize {
        self.count
    }

    pub fn budget(&self) -> Duration {
        self.total_budget
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.start_interval, self.max_interval).with_budget(self.total_budget)
    }

    pub(crate) fn should_retry(&self, decision: &RetryDecision) -> bool {
        decision.attempt < self.count && self.condition.should_retry(decision)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
