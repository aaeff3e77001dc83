use std::fmt;
use std::time::Duration;

use http::{Method, StatusCode};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Timeout,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Failure of a single physical attempt, as reported by a [`crate::Transport`].
#[derive(Debug, Error)]
#[error("{source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub(crate) fn into_source(self) -> BoxError {
        self.source
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    Serialize,
    UnsupportedBody,
    RequestBuild,
    ReadRequestBody,
    Transport,
    Timeout,
    Canceled,
    ReadBody,
    ResponseBodyTooLarge,
    DecodeContentEncoding,
    Deserialize,
    WriteResult,
    RedirectLimitExceeded,
    InvalidRedirectLocation,
    HttpStatus,
    Api,
    Multiple,
    ContextCanceled,
    ConcurrencyLimitClosed,
    UnitPanicked,
    TlsBackendInit,
    Other,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Serialize => "serialize",
            Self::UnsupportedBody => "unsupported_body",
            Self::RequestBuild => "request_build",
            Self::ReadRequestBody => "read_request_body",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::Deserialize => "deserialize",
            Self::WriteResult => "write_result",
            Self::RedirectLimitExceeded => "redirect_limit_exceeded",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::HttpStatus => "http_status",
            Self::Api => "api",
            Self::Multiple => "multiple",
            Self::ContextCanceled => "context_canceled",
            Self::ConcurrencyLimitClosed => "concurrency_limit_closed",
            Self::UnitPanicked => "unit_panicked",
            Self::TlsBackendInit => "tls_backend_init",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request body as json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot encode request body object for content type {content_type:?}")]
    UnsupportedBody { content_type: Option<String> },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("failed to rewind request body: {source}")]
    ReadRequestBody {
        #[source]
        source: std::io::Error,
    },
    #[error("request {method} \"{uri}\" failed: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("request {method} \"{uri}\" failed: timeout after {after:?}")]
    Timeout {
        method: Method,
        uri: String,
        after: Duration,
    },
    #[error("request {method} \"{uri}\" failed: canceled after {after:?}")]
    Canceled {
        method: Method,
        uri: String,
        after: Duration,
    },
    #[error("request {method} \"{uri}\" failed: reading response body: {source}")]
    ReadBody {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error(
        "response body too large ({actual_bytes} bytes > {limit_bytes} bytes) for {method} {uri}"
    )]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("failed to decode response content-encoding {encoding} for {method} {uri}: {message}")]
    DecodeContentEncoding {
        encoding: String,
        method: Method,
        uri: String,
        message: String,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("failed to write response body into result sink: {source}")]
    WriteResult {
        #[source]
        source: std::io::Error,
    },
    #[error("redirect limit exceeded ({max_redirects}) for {method} {uri}")]
    RedirectLimitExceeded {
        max_redirects: usize,
        method: Method,
        uri: String,
    },
    #[error("invalid redirect location {location} for {method} {uri}")]
    InvalidRedirectLocation {
        location: String,
        method: Method,
        uri: String,
    },
    #[error("{method} \"{uri}\" failed: {status}")]
    HttpStatus {
        status: StatusCode,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("{source}")]
    Api {
        status: StatusCode,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("{0}")]
    Multiple(MultiError),
    #[error("context canceled")]
    ContextCanceled,
    #[error("concurrency limiter is closed")]
    ConcurrencyLimitClosed,
    #[error("unit panicked: {message}")]
    UnitPanicked { message: String },
    #[error("failed to initialize tls backend: {message}")]
    TlsBackendInit { message: String },
    #[error("{source}")]
    Other {
        #[source]
        source: BoxError,
    },
}

impl Error {
    /// Wraps an arbitrary error, typically from a completion listener replacing the outcome.
    pub fn other(source: impl Into<BoxError>) -> Self {
        Self::Other {
            source: source.into(),
        }
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Serialize { .. } => ErrorCode::Serialize,
            Self::UnsupportedBody { .. } => ErrorCode::UnsupportedBody,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::ReadRequestBody { .. } => ErrorCode::ReadRequestBody,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Canceled { .. } => ErrorCode::Canceled,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::WriteResult { .. } => ErrorCode::WriteResult,
            Self::RedirectLimitExceeded { .. } => ErrorCode::RedirectLimitExceeded,
            Self::InvalidRedirectLocation { .. } => ErrorCode::InvalidRedirectLocation,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Api { .. } => ErrorCode::Api,
            Self::Multiple(_) => ErrorCode::Multiple,
            Self::ContextCanceled => ErrorCode::ContextCanceled,
            Self::ConcurrencyLimitClosed => ErrorCode::ConcurrencyLimitClosed,
            Self::UnitPanicked { .. } => ErrorCode::UnitPanicked,
            Self::TlsBackendInit { .. } => ErrorCode::TlsBackendInit,
            Self::Other { .. } => ErrorCode::Other,
        }
    }

    /// HTTP status for generic and structured API errors.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } | Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the decoded structured API error if this is one of type `E`.
    pub fn api<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Api { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport { kind, .. } => *kind == TransportErrorKind::Timeout,
            _ => false,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. } | Self::ContextCanceled)
    }
}

/// Aggregate of every error collected by a [`crate::WaitGroup`].
#[derive(Debug)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    pub(crate) fn new(errors: Vec<Error>) -> Self {
        Self { errors }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.errors.iter()
    }

    pub fn into_inner(self) -> Vec<Error> {
        self.errors
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} errors occurred:", self.errors.len())?;
        for error in &self.errors {
            write!(formatter, "\n\t* {error}")?;
        }
        Ok(())
    }
}

/// Collapses collected errors: none is success, one is returned bare.
pub(crate) fn combine_errors(mut errors: Vec<Error>) -> Result<(), Error> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(Error::Multiple(MultiError::new(errors))),
    }
}
