use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::body::{PreparedBody, ReadBodyError, build_http_request, read_body_limited};
use crate::config::{
    ClientProfile, DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_RESPONSE_BODY_BYTES, TransportConfig,
};
use crate::content_encoding::{ContentDecodeError, decode_body, should_decode};
use crate::error::Error;
use crate::request::Request;
use crate::response::{FinalRequest, RawResponse, Response};
use crate::retry::{RetryAttempt, RetryDecision, RetryPolicy};
use crate::trace::{
    AttemptDone, AttemptStart, CallDone, CallStart, DecodeDone, DecodeStart, RetryWait,
    TraceFactory, TraceHooks, compose_factories, fire,
};
use crate::transport::{HyperTransport, Transport};
use crate::util::{
    content_type, ensure_accept_encoding, is_json_content_type, is_redirect_status,
    merge_headers, parse_header_name, parse_header_value, redact_uri, redirect_location,
    redirect_method, resolve_redirect_uri, same_origin, sanitize_headers_for_redirect,
    truncate_body, uri_for_errors, validate_base_url,
};

/// Executes a request description and produces its response view.
///
/// A sender never runs completion listeners; [`Request::send`] does that
/// after the sender returns.
pub trait Sender: Send + Sync {
    fn send<T: Send + 'static>(
        &self,
        cancel: &CancellationToken,
        request: &Request<T>,
    ) -> impl Future<Output = Response<T>> + Send;
}

impl<S: Sender> Sender for Arc<S> {
    fn send<T: Send + 'static>(
        &self,
        cancel: &CancellationToken,
        request: &Request<T>,
    ) -> impl Future<Output = Response<T>> + Send {
        S::send(self, cancel, request)
    }
}

pub struct ClientBuilder {
    base_url: Option<String>,
    default_headers: HeaderMap,
    retry_policy: RetryPolicy,
    transport: Option<Arc<dyn Transport>>,
    transport_config: TransportConfig,
    traces: Vec<TraceFactory>,
    max_redirects: usize,
    max_response_body_bytes: usize,
    client_name: String,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            retry_policy: RetryPolicy::standard(),
            transport: None,
            transport_config: TransportConfig::default(),
            traces: Vec::new(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            client_name: "reqrun".to_owned(),
        }
    }

    /// Applies a preset; later builder calls still override individual values.
    pub fn profile(mut self, profile: ClientProfile) -> Self {
        let defaults = profile.defaults();
        self.retry_policy = defaults.retry_policy;
        self.max_response_body_bytes = defaults.max_response_body_bytes;
        self.max_redirects = defaults.max_redirects;
        self.transport_config = defaults.transport;
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Replaces the stock hyper transport. `transport_config` is then ignored.
    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn transport_config(mut self, transport_config: TransportConfig) -> Self {
        self.transport_config = transport_config;
        self
    }

    /// Registers a trace factory. Hooks of later factories run before those of
    /// earlier ones.
    pub fn trace(mut self, factory: TraceFactory) -> Self {
        self.traces.push(factory);
        self
    }

    /// Maximum redirects followed per attempt; 0 returns redirects as-is.
    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn try_build(self) -> Result<Client, Error> {
        if let Some(base_url) = &self.base_url {
            validate_base_url(base_url)?;
        }
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new(self.transport_config)?),
        };
        Ok(Client {
            inner: Arc::new(ClientInner {
                base_url: self.base_url,
                default_headers: self.default_headers,
                retry_policy: self.retry_policy,
                transport,
                traces: self.traces,
                max_redirects: self.max_redirects,
                max_response_body_bytes: self.max_response_body_bytes,
                client_name: self.client_name,
            }),
        })
    }

    pub fn build(self) -> Client {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build reqrun client: {error}; use try_build() to handle configuration errors")
        })
    }
}

struct ClientInner {
    base_url: Option<String>,
    default_headers: HeaderMap,
    retry_policy: RetryPolicy,
    transport: Arc<dyn Transport>,
    traces: Vec<TraceFactory>,
    max_redirects: usize,
    max_response_body_bytes: usize,
    client_name: String,
}

/// The default [`Sender`]: retries, redirects, content decoding and trace
/// hooks over a pluggable [`Transport`]. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("client_name", &self.inner.client_name)
            .field("base_url", &self.inner.base_url)
            .field("retry_policy", &self.inner.retry_policy)
            .field("max_redirects", &self.inner.max_redirects)
            .finish_non_exhaustive()
    }
}

/// Everything resolved once per send.
struct Prepared {
    method: Method,
    uri: Uri,
    redacted_uri: String,
    error_uri: String,
    headers: HeaderMap,
    body: PreparedBody,
}

/// A response whose body has been read, before content decoding.
struct Exchange {
    final_request: FinalRequest,
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

type Decoded<T> = (
    Option<FinalRequest>,
    Option<RawResponse>,
    Result<Option<T>, Error>,
);

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn base_url(&self) -> Option<&str> {
        self.inner.base_url.as_deref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry_policy
    }

    fn prepare<T>(&self, method: Method, request: &Request<T>) -> Result<Prepared, Error> {
        let uri = request.resolve_uri(self.inner.base_url.as_deref())?;
        let mut headers = merge_headers(&self.inner.default_headers, &request.headers);
        ensure_accept_encoding(&mut headers);
        let body = request.body.prepare(content_type(&headers))?;
        Ok(Prepared {
            method,
            redacted_uri: redact_uri(&uri),
            error_uri: uri_for_errors(&uri),
            uri,
            headers,
            body,
        })
    }

    async fn execute_with_retry(
        &self,
        prepared: &Prepared,
        policy: &RetryPolicy,
        hooks: &TraceHooks,
        started: Instant,
    ) -> Result<Exchange, Error> {
        let backoff = policy.backoff();
        let mut retry_attempt = 0_usize;
        loop {
            let outcome = self.execute_attempt(prepared, hooks, retry_attempt).await;
            let decision = RetryDecision::from_outcome(
                retry_attempt,
                &prepared.method,
                &prepared.redacted_uri,
                &outcome,
                |exchange| (exchange.status, &exchange.headers),
            );
            if !policy.should_retry(&decision) {
                return outcome;
            }
            let Some(delay) = backoff.next_delay(retry_attempt + 1, started.elapsed()) else {
                debug!(retry_attempt, "retry budget exhausted");
                return outcome;
            };

            retry_attempt += 1;
            fire(&hooks.retry_wait, || RetryWait {
                method: prepared.method.clone(),
                uri: prepared.redacted_uri.clone(),
                retry_attempt,
                delay,
            });
            match &outcome {
                Ok(exchange) => warn!(
                    retry_attempt,
                    status = exchange.status.as_u16(),
                    delay_ms = delay.as_millis() as u64,
                    "retrying request after retryable status"
                ),
                Err(error) => warn!(
                    retry_attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "retrying request after transport error"
                ),
            }
            drop(outcome);
            sleep(delay).await;
        }
    }

    /// One try: the initial exchange plus any redirect hops, with the final
    /// body read into memory.
    async fn execute_attempt(
        &self,
        prepared: &Prepared,
        hooks: &TraceHooks,
        retry_attempt: usize,
    ) -> Result<Exchange, Error> {
        let mut method = prepared.method.clone();
        let mut uri = prepared.uri.clone();
        let mut headers = prepared.headers.clone();
        let mut body = prepared.body.clone();
        let mut redirects = 0_usize;

        loop {
            let redacted_uri = redact_uri(&uri);
            let error_uri = uri_for_errors(&uri);
            let request_body = body.rebuild().await?;
            let mut request =
                build_http_request(method.clone(), uri.clone(), &headers, request_body)?;
            request.extensions_mut().insert(RetryAttempt(retry_attempt));
            if !hooks.connection.is_empty() {
                request.extensions_mut().insert(hooks.connection.clone());
            }

            fire(&hooks.attempt_start, || AttemptStart {
                method: method.clone(),
                uri: redacted_uri.clone(),
                retry_attempt,
                redirect: redirects,
            });
            debug!(retry_attempt, redirect = redirects, uri = %redacted_uri, "sending request");
            let attempt_started = Instant::now();
            let attempt_done = |status: Option<StatusCode>, error: Option<&Error>| {
                fire(&hooks.attempt_done, || AttemptDone {
                    method: method.clone(),
                    uri: redacted_uri.clone(),
                    retry_attempt,
                    redirect: redirects,
                    status,
                    error: error.map(ToString::to_string),
                    elapsed: attempt_started.elapsed(),
                });
            };

            let response = match self.inner.transport.execute(request).await {
                Ok(response) => response,
                Err(source) => {
                    let error = Error::Transport {
                        kind: source.kind(),
                        method: method.clone(),
                        uri: error_uri.clone(),
                        source: source.into_source(),
                    };
                    attempt_done(None, Some(&error));
                    return Err(error);
                }
            };

            let status = response.status();
            if self.inner.max_redirects > 0
                && is_redirect_status(status)
                && let Some(location) = redirect_location(response.headers())
            {
                attempt_done(Some(status), None);
                drop(response);
                if redirects >= self.inner.max_redirects {
                    return Err(Error::RedirectLimitExceeded {
                        max_redirects: self.inner.max_redirects,
                        method,
                        uri: error_uri,
                    });
                }
                let Some(next_uri) = resolve_redirect_uri(&uri, &location) else {
                    return Err(Error::InvalidRedirectLocation {
                        location,
                        method,
                        uri: error_uri,
                    });
                };
                let next_method = redirect_method(&method, status);
                let method_changed_to_get = next_method == Method::GET && method != Method::GET;
                sanitize_headers_for_redirect(
                    &mut headers,
                    method_changed_to_get,
                    same_origin(&uri, &next_uri),
                );
                if method_changed_to_get {
                    body = PreparedBody::Empty;
                }
                debug!(
                    status = status.as_u16(),
                    location = %redact_uri(&next_uri),
                    "following redirect"
                );
                method = next_method;
                uri = next_uri;
                redirects += 1;
                continue;
            }

            let (parts, response_body) = response.into_parts();
            let limit = self.inner.max_response_body_bytes;
            let body_bytes = match read_body_limited(response_body, limit).await {
                Ok(bytes) => bytes,
                Err(ReadBodyError::Read(source)) => {
                    let error = Error::ReadBody {
                        method: method.clone(),
                        uri: error_uri.clone(),
                        source,
                    };
                    attempt_done(Some(status), Some(&error));
                    return Err(error);
                }
                Err(ReadBodyError::TooLarge { actual_bytes }) => {
                    let error = Error::ResponseBodyTooLarge {
                        limit_bytes: limit,
                        actual_bytes,
                        method: method.clone(),
                        uri: error_uri.clone(),
                    };
                    attempt_done(Some(status), Some(&error));
                    return Err(error);
                }
            };
            attempt_done(Some(status), None);
            debug!(
                status = status.as_u16(),
                elapsed_ms = attempt_started.elapsed().as_millis() as u64,
                "attempt completed"
            );

            return Ok(Exchange {
                final_request: FinalRequest::new(method, uri, headers, retry_attempt, redirects),
                status,
                version: parts.version,
                headers: parts.headers,
                body: body_bytes,
            });
        }
    }

    async fn decode<T>(
        &self,
        request: &Request<T>,
        hooks: &TraceHooks,
        exchange: Exchange,
    ) -> Decoded<T> {
        let Exchange {
            final_request,
            status,
            version,
            mut headers,
            body,
        } = exchange;
        fire(&hooks.decode_start, || DecodeStart {
            status,
            content_type: content_type(&headers)
                .and_then(|value| value.to_str().ok())
                .map(ToOwned::to_owned),
            body_len: body.len(),
        });

        let method = final_request.method().clone();
        let error_uri = uri_for_errors(final_request.uri());
        let body = if should_decode(&method, status, body.len()) {
            match decode_body(body, &headers, self.inner.max_response_body_bytes) {
                Ok(decoded) => {
                    // The body now matches neither header.
                    if headers.remove(CONTENT_ENCODING).is_some() {
                        headers.remove(CONTENT_LENGTH);
                    }
                    decoded
                }
                Err(error) => {
                    let error = match error {
                        ContentDecodeError::Decode { encoding, message } => {
                            Error::DecodeContentEncoding {
                                encoding,
                                method,
                                uri: error_uri,
                                message,
                            }
                        }
                        ContentDecodeError::TooLarge { actual_bytes } => {
                            Error::ResponseBodyTooLarge {
                                limit_bytes: self.inner.max_response_body_bytes,
                                actual_bytes,
                                method,
                                uri: error_uri,
                            }
                        }
                    };
                    fire(&hooks.decode_done, || DecodeDone {
                        status,
                        error: Some(error.to_string()),
                    });
                    return (Some(final_request), None, Err(error));
                }
            }
        } else {
            body
        };

        let raw = RawResponse::new(status, version, headers, body);
        let outcome = if status == StatusCode::NO_CONTENT {
            Ok(None)
        } else if status.as_u16() >= 400 {
            Err(self.status_error(request, &final_request, &raw, method, error_uri))
        } else if status.is_success() {
            request
                .sink
                .deliver(raw.body(), content_type(raw.headers()))
                .await
        } else {
            Ok(None)
        };

        fire(&hooks.decode_done, || DecodeDone {
            status,
            error: outcome.as_ref().err().map(ToString::to_string),
        });
        (Some(final_request), Some(raw), outcome)
    }

    fn status_error<T>(
        &self,
        request: &Request<T>,
        final_request: &FinalRequest,
        raw: &RawResponse,
        method: Method,
        error_uri: String,
    ) -> Error {
        let status = raw.status();
        let body = raw.body();
        if let Some(decoder) = request.error_decoder
            && !body.is_empty()
            && is_json_content_type(content_type(raw.headers()))
        {
            return match decoder(body, final_request, raw) {
                Ok(source) => Error::Api {
                    status,
                    method,
                    uri: error_uri,
                    source,
                },
                Err(source) => Error::Deserialize {
                    source,
                    body: truncate_body(body),
                },
            };
        }
        Error::HttpStatus {
            status,
            method,
            uri: error_uri,
            body: truncate_body(body),
        }
    }

    async fn send_prepared<T: Send + 'static>(
        &self,
        cancel: &CancellationToken,
        request: &Request<T>,
        prepared: Prepared,
        hooks: &TraceHooks,
        started: Instant,
    ) -> Decoded<T> {
        let policy = request
            .retry_policy
            .as_ref()
            .unwrap_or(&self.inner.retry_policy);
        let budget = policy.budget();

        let exchange = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Canceled {
                method: prepared.method.clone(),
                uri: prepared.error_uri.clone(),
                after: started.elapsed(),
            }),
            result = timeout(budget, self.execute_with_retry(&prepared, policy, hooks, started)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout {
                        method: prepared.method.clone(),
                        uri: prepared.error_uri.clone(),
                        after: budget,
                    }),
                }
            }
        };

        match exchange {
            Ok(exchange) => self.decode(request, hooks, exchange).await,
            Err(error) => (None, None, Err(error)),
        }
    }
}

impl Sender for Client {
    /// # Panics
    ///
    /// Panics when the request has no method or no URL.
    fn send<T: Send + 'static>(
        &self,
        cancel: &CancellationToken,
        request: &Request<T>,
    ) -> impl Future<Output = Response<T>> + Send {
        let Some(method) = request.method.clone() else {
            panic!("reqrun request has no method; set one before sending");
        };
        if request.url.is_none() {
            panic!("reqrun request has no url; set one before sending");
        }

        async move {
            let hooks = compose_factories(&self.inner.traces);
            let started = Instant::now();
            let prepared = self.prepare(method.clone(), request);
            let display_uri = match &prepared {
                Ok(prepared) => prepared.redacted_uri.clone(),
                Err(_) => request.url.clone().unwrap_or_default(),
            };
            let span = info_span!(
                "reqrun.send",
                client = %self.inner.client_name,
                method = %method,
                uri = %display_uri
            );

            async move {
                fire(&hooks.call_start, || CallStart {
                    method: method.clone(),
                    uri: display_uri.clone(),
                });
                let (final_request, raw, outcome) = match prepared {
                    Ok(prepared) => {
                        self.send_prepared(cancel, request, prepared, &hooks, started)
                            .await
                    }
                    Err(error) => (None, None, Err(error)),
                };

                let elapsed = started.elapsed();
                let status = raw.as_ref().map(RawResponse::status);
                fire(&hooks.call_done, || CallDone {
                    method: method.clone(),
                    uri: display_uri.clone(),
                    status,
                    error: outcome.as_ref().err().map(ToString::to_string),
                    elapsed,
                });
                match &outcome {
                    Ok(_) => debug!(
                        status = status.map(|status| status.as_u16()),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "request completed"
                    ),
                    Err(error) => debug!(
                        status = status.map(|status| status.as_u16()),
                        error = %error,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "request failed"
                    ),
                }

                Response::new(request.clone()).complete(final_request, raw, outcome)
            }
            .instrument(span)
            .await
        }
    }
}
