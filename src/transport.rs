//! The wire layer: one HTTP exchange per call, no retries or redirects.

use std::error::Error as StdError;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use http::Uri;
use http_body_util::BodyExt;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::connect::dns::{GaiResolver, Name};
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tower_service::Service;

use crate::body::{RequestBody, ResponseBody};
use crate::config::{ProtocolPolicy, ProtocolVersion, TransportConfig};
use crate::error::{BoxError, Error, TransportError, TransportErrorKind};
use crate::limiters::HostLimiters;
use crate::trace::{
    ConnectDone, ConnectStart, ConnectionTrace, DnsDone, DnsStart, TlsDone, TlsStart, fire,
};
use crate::util::host_key;

pub type TransportFuture =
    BoxFuture<'static, Result<http::Response<ResponseBody>, TransportError>>;

/// Performs a single HTTP exchange.
///
/// Implementations fire the [`ConnectionTrace`] found in the request
/// extensions, if any, while they dial.
pub trait Transport: Send + Sync + 'static {
    fn execute(&self, request: http::Request<RequestBody>) -> TransportFuture;
}

impl<F> Transport for F
where
    F: Fn(http::Request<RequestBody>) -> TransportFuture + Send + Sync + 'static,
{
    fn execute(&self, request: http::Request<RequestBody>) -> TransportFuture {
        self(request)
    }
}

tokio::task_local! {
    static CONNECTION_TRACE: ConnectionTrace;
}

fn current_trace() -> Option<ConnectionTrace> {
    CONNECTION_TRACE
        .try_with(|trace| trace.clone())
        .ok()
        .filter(|trace| !trace.is_empty())
}

fn error_text(error: Option<&BoxError>) -> Option<String> {
    error.map(ToString::to_string)
}

#[derive(Clone)]
struct TracedResolver {
    inner: GaiResolver,
}

impl Service<Name> for TracedResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let trace = current_trace();
        let host = name.as_str().to_owned();
        let lookup = self.inner.call(name);
        Box::pin(async move {
            if let Some(trace) = &trace {
                fire(&trace.dns_start, || DnsStart { host: host.clone() });
            }
            let result: Result<Vec<SocketAddr>, BoxError> = match lookup.await {
                Ok(addrs) => Ok(addrs.collect()),
                Err(error) => Err(error.into()),
            };
            if let Some(trace) = &trace {
                fire(&trace.dns_done, || DnsDone {
                    host: host.clone(),
                    addrs: result.as_ref().map(Vec::len).unwrap_or(0),
                    error: error_text(result.as_ref().err()),
                });
            }
            result.map(Vec::into_iter)
        })
    }
}

type TcpConnector = HttpConnector<TracedResolver>;
type TcpStream = <TcpConnector as Service<Uri>>::Response;

/// Fires connect events around the TCP dial, and `tls_start` once an https
/// dial succeeds.
#[derive(Clone)]
struct TracedConnector {
    inner: TcpConnector,
}

impl Service<Uri> for TracedConnector {
    type Response = TcpStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let trace = current_trace();
        let target = uri.to_string();
        let is_https = uri.scheme_str() == Some("https");
        let host = uri.host().unwrap_or_default().to_owned();
        let dial = self.inner.call(uri);
        Box::pin(async move {
            if let Some(trace) = &trace {
                fire(&trace.connect_start, || ConnectStart {
                    uri: target.clone(),
                });
            }
            let result = dial.await.map_err(BoxError::from);
            if let Some(trace) = &trace {
                fire(&trace.connect_done, || ConnectDone {
                    uri: target.clone(),
                    error: error_text(result.as_ref().err()),
                });
                if is_https && result.is_ok() {
                    fire(&trace.tls_start, || TlsStart { host });
                }
            }
            result
        })
    }
}

type TlsConnector = HttpsConnector<TracedConnector>;
type TlsStream = <TlsConnector as Service<Uri>>::Response;

/// Outermost connector: re-enters the caller's trace scope for the whole dial
/// and bounds it by the dial plus handshake timeouts.
#[derive(Clone)]
struct DialConnector {
    inner: TlsConnector,
    dial_timeout: Duration,
    tls_handshake_timeout: Duration,
}

impl Service<Uri> for DialConnector {
    type Response = TlsStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let trace = current_trace().unwrap_or_default();
        let is_https = uri.scheme_str() == Some("https");
        let host = uri.host().unwrap_or_default().to_owned();
        let limit = if is_https {
            self.dial_timeout + self.tls_handshake_timeout
        } else {
            self.dial_timeout
        };
        let connect = self.inner.call(uri);
        Box::pin(async move {
            let scoped_trace = trace.clone();
            let result = match timeout(limit, CONNECTION_TRACE.scope(scoped_trace, connect)).await
            {
                Ok(result) => result,
                Err(_) => Err(BoxError::from(format!("dial timed out after {limit:?}"))),
            };
            if is_https {
                fire(&trace.tls_done, || TlsDone {
                    host,
                    error: error_text(result.as_ref().err()),
                });
            }
            result
        })
    }
}

fn build_tls_config() -> Result<rustls::ClientConfig, Error> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .map_err(|source| Error::TlsBackendInit {
        message: source.to_string(),
    })?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(config)
}

/// Stock transport over hyper's pooled client with rustls and webpki roots.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<DialConnector, RequestBody>,
    limiters: HostLimiters,
    config: Arc<TransportConfig>,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HyperTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn new(config: TransportConfig) -> Result<Self, Error> {
        let mut tcp = HttpConnector::new_with_resolver(TracedResolver {
            inner: GaiResolver::new(),
        });
        tcp.enforce_http(false);
        tcp.set_nodelay(true);
        tcp.set_connect_timeout(Some(config.dial_timeout));

        let tls_config = build_tls_config()?;
        let builder = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http();
        let traced = TracedConnector { inner: tcp };
        let (https, http2_only) = match config.protocol {
            ProtocolPolicy::Negotiate => (
                builder.enable_http1().enable_http2().wrap_connector(traced),
                false,
            ),
            ProtocolPolicy::Forced(ProtocolVersion::Http1) => {
                (builder.enable_http1().wrap_connector(traced), false)
            }
            ProtocolPolicy::Forced(ProtocolVersion::Http2) => {
                (builder.enable_http2().wrap_connector(traced), true)
            }
        };
        let connector = DialConnector {
            inner: https,
            dial_timeout: config.dial_timeout,
            tls_handshake_timeout: config.tls_handshake_timeout,
        };

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .http2_only(http2_only)
            .build(connector);

        Ok(Self {
            client,
            limiters: HostLimiters::new(config.max_connections_per_host),
            config: Arc::new(config),
        })
    }

    /// HTTP/1.1 with ALPN upgrade to HTTP/2 and the default timeouts.
    pub fn negotiated() -> Result<Self, Error> {
        Self::new(TransportConfig::default())
    }

    pub fn forced(version: ProtocolVersion) -> Result<Self, Error> {
        Self::new(TransportConfig::default().with_protocol(ProtocolPolicy::Forced(version)))
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl Transport for HyperTransport {
    fn execute(&self, request: http::Request<RequestBody>) -> TransportFuture {
        let client = self.client.clone();
        let limiters = self.limiters.clone();
        let header_timeout = self.config.response_header_timeout;
        let trace = request
            .extensions()
            .get::<ConnectionTrace>()
            .cloned()
            .unwrap_or_default();

        Box::pin(async move {
            let permit = match host_key(request.uri()) {
                Some(host) => Some(
                    limiters
                        .acquire(&host)
                        .await
                        .map_err(|error| TransportError::new(TransportErrorKind::Other, error))?,
                ),
                None => None,
            };

            let exchange = CONNECTION_TRACE.scope(trace, client.request(request));
            let response = match timeout(header_timeout, exchange).await {
                Ok(Ok(response)) => response,
                Ok(Err(error)) => {
                    let kind = classify_transport_error(&error);
                    return Err(TransportError::new(kind, error));
                }
                Err(_) => {
                    return Err(TransportError::new(
                        TransportErrorKind::Timeout,
                        format!("response header timeout after {header_timeout:?}"),
                    ));
                }
            };

            Ok(response.map(|body| {
                body.map_frame(move |frame| {
                    let _held = &permit;
                    frame
                })
                .map_err(|error| Box::new(error) as BoxError)
                .boxed_unsync()
            }))
        })
    }
}

fn error_chain_text(error: &(dyn StdError + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text.to_ascii_lowercase()
}

pub(crate) fn classify_transport_error(
    error: &hyper_util::client::legacy::Error,
) -> TransportErrorKind {
    let text = error_chain_text(error);
    if error.is_connect() {
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("timed out") {
            return TransportErrorKind::Timeout;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    if text.contains("timed out") {
        return TransportErrorKind::Timeout;
    }
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
        || text.contains("connection closed")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}
