//! Immutable request descriptions.
//!
//! Every builder method consumes the request and returns the modified copy.
//! Keep a partially built request as a template and `clone()` it before
//! specializing; the template itself never changes.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::body::BodySource;
use crate::client::Sender;
use crate::error::Error;
use crate::response::{ApiError, ErrorDecoder, Response, decode_api_error};
use crate::retry::RetryPolicy;
use crate::util::{
    is_absolute_http_url, is_json_content_type, join_base_path, parse_header_name,
    parse_header_value,
};

const PATH_PARAM: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub type CompletionListener<T> = Arc<dyn Fn(&mut Response<T>) + Send + Sync>;

pub(crate) trait ResultWriter: Send + Sync {
    fn write_body<'a>(&'a self, body: &'a [u8], close: bool) -> BoxFuture<'a, io::Result<()>>;
}

impl<W> ResultWriter for Mutex<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn write_body<'a>(&'a self, body: &'a [u8], close: bool) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let mut writer = self.lock().await;
            writer.write_all(body).await?;
            writer.flush().await?;
            if close {
                writer.shutdown().await?;
            }
            Ok(())
        })
    }
}

/// Where a successful response body goes.
pub(crate) enum ResultSink<T> {
    Discard(fn() -> T),
    Bytes(fn(Bytes) -> T),
    Text(fn(String) -> T),
    Writer {
        writer: Arc<dyn ResultWriter>,
        close: bool,
        wrap: fn(u64) -> T,
    },
    Json(fn(&[u8]) -> serde_json::Result<T>),
}

impl<T> Clone for ResultSink<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Discard(make) => Self::Discard(*make),
            Self::Bytes(wrap) => Self::Bytes(*wrap),
            Self::Text(wrap) => Self::Text(*wrap),
            Self::Writer {
                writer,
                close,
                wrap,
            } => Self::Writer {
                writer: Arc::clone(writer),
                close: *close,
                wrap: *wrap,
            },
            Self::Json(decode) => Self::Json(*decode),
        }
    }
}

impl<T> ResultSink<T> {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Discard(_) => "discard",
            Self::Bytes(_) => "bytes",
            Self::Text(_) => "text",
            Self::Writer { close: true, .. } => "writer_closing",
            Self::Writer { close: false, .. } => "writer",
            Self::Json(_) => "json",
        }
    }

    /// Feeds a decoded body into the sink. JSON targets only accept a
    /// non-empty body with a JSON-like content type; anything else yields no
    /// result.
    pub(crate) async fn deliver(
        &self,
        body: &Bytes,
        content_type: Option<&HeaderValue>,
    ) -> Result<Option<T>, Error> {
        match self {
            Self::Discard(make) => Ok(Some(make())),
            Self::Bytes(wrap) => Ok(Some(wrap(body.clone()))),
            Self::Text(wrap) => Ok(Some(wrap(String::from_utf8_lossy(body).into_owned()))),
            Self::Writer {
                writer,
                close,
                wrap,
            } => {
                writer
                    .write_body(body, *close)
                    .await
                    .map_err(|source| Error::WriteResult { source })?;
                Ok(Some(wrap(body.len() as u64)))
            }
            Self::Json(decode) => {
                if body.is_empty() || !is_json_content_type(content_type) {
                    return Ok(None);
                }
                decode(body).map(Some).map_err(|source| Error::Deserialize {
                    source,
                    body: crate::util::truncate_body(body),
                })
            }
        }
    }
}

fn decode_json<T: DeserializeOwned>(body: &[u8]) -> serde_json::Result<T> {
    serde_json::from_slice(body)
}

fn unit() {}

fn identity<V>(value: V) -> V {
    value
}

pub struct Request<T = ()> {
    pub(crate) method: Option<Method>,
    pub(crate) url: Option<String>,
    pub(crate) base_url: Option<String>,
    pub(crate) headers: HeaderMap,
    pub(crate) query: BTreeMap<String, Vec<String>>,
    pub(crate) path_params: BTreeMap<String, String>,
    pub(crate) body: BodySource,
    pub(crate) sink: ResultSink<T>,
    pub(crate) error_decoder: Option<ErrorDecoder>,
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) listeners: Vec<CompletionListener<T>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            method: self.method.clone(),
            url: self.url.clone(),
            base_url: self.base_url.clone(),
            headers: self.headers.clone(),
            query: self.query.clone(),
            path_params: self.path_params.clone(),
            body: self.body.clone(),
            sink: self.sink.clone(),
            error_decoder: self.error_decoder,
            retry_policy: self.retry_policy.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("base_url", &self.base_url)
            .field("headers", &self.headers)
            .field("query", &self.query)
            .field("path_params", &self.path_params)
            .field("body", &self.body)
            .field("result", &self.sink.name())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Default for Request<()> {
    fn default() -> Self {
        Self::template()
    }
}

impl Request<()> {
    /// A request with neither method nor URL, meant to be cloned and completed.
    pub fn template() -> Self {
        Self {
            method: None,
            url: None,
            base_url: None,
            headers: HeaderMap::new(),
            query: BTreeMap::new(),
            path_params: BTreeMap::new(),
            body: BodySource::Empty,
            sink: ResultSink::Discard(unit),
            error_decoder: None,
            retry_policy: None,
            listeners: Vec::new(),
        }
    }

    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self::template().method(method).url(url)
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }
}

impl<T> Request<T> {
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Absolute URL, or a path joined onto the base URL. `{name}` segments are
    /// replaced by path parameters.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Overrides the client's base URL for this request.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Sets a header, replacing any previous values of the same name.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn append_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets every header in `headers`, replacing same-named ones.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        let mut current_name = None;
        for (name, value) in headers {
            match name {
                Some(name) => {
                    self.headers.insert(name.clone(), value);
                    current_name = Some(name);
                }
                None => {
                    if let Some(name) = &current_name {
                        self.headers.append(name.clone(), value);
                    }
                }
            }
        }
        self
    }

    pub fn content_type(self, value: HeaderValue) -> Self {
        self.header(CONTENT_TYPE, value)
    }

    /// Adds a query value; repeated keys keep every value in insertion order.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.entry(key.into()).or_default().push(value.into());
        self
    }

    pub fn queries<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in pairs {
            self = self.query(key, value);
        }
        self
    }

    pub fn path_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.path_params.insert(key.into(), value.to_string());
        self
    }

    pub fn body_text(mut self, text: impl Into<String>) -> Self {
        self.body = BodySource::Text(text.into());
        self
    }

    pub fn body_bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        self.body = BodySource::Bytes(bytes.into());
        self
    }

    /// Rewound to the start before every attempt.
    pub fn body_seekable<R>(mut self, reader: R) -> Self
    where
        R: AsyncRead + AsyncSeek + Send + Unpin + 'static,
    {
        self.body = BodySource::seekable(reader);
        self
    }

    /// Streamed as-is. A retry resends only what the reader still has, so
    /// prefer [`Request::body_seekable`] for requests that may be retried.
    pub fn body_reader<R>(mut self, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.body = BodySource::reader(reader);
        self
    }

    /// Serialized at send time according to the content type, which must be
    /// JSON-like.
    pub fn body_object<B>(mut self, value: B) -> Self
    where
        B: Serialize + Send + Sync + 'static,
    {
        self.body = BodySource::object(value);
        self
    }

    /// JSON body; sets `Content-Type: application/json` unless already set.
    pub fn json<B>(mut self, value: B) -> Self
    where
        B: Serialize + Send + Sync + 'static,
    {
        if !self.headers.contains_key(CONTENT_TYPE) {
            self.headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        self.body_object(value)
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Decodes JSON error bodies of failing responses into `E`.
    pub fn error_json<E: ApiError>(mut self) -> Self {
        self.error_decoder = Some(decode_api_error::<E>);
        self
    }

    /// Runs after every [`Request::send`], in registration order. A listener may
    /// replace the outcome or enqueue follow-up work.
    pub fn on_complete<F>(mut self, listener: F) -> Self
    where
        F: Fn(&mut Response<T>) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
        self
    }

    // The result type changes, so listeners written against the old one are dropped.
    fn rebind<U>(self, sink: ResultSink<U>) -> Request<U> {
        Request {
            method: self.method,
            url: self.url,
            base_url: self.base_url,
            headers: self.headers,
            query: self.query,
            path_params: self.path_params,
            body: self.body,
            sink,
            error_decoder: self.error_decoder,
            retry_policy: self.retry_policy,
            listeners: Vec::new(),
        }
    }

    /// Decodes a JSON success body into `U`. Drops listeners registered so far.
    pub fn into_json<U: DeserializeOwned>(self) -> Request<U> {
        self.rebind(ResultSink::Json(decode_json::<U>))
    }

    /// Keeps the raw body. Drops listeners registered so far.
    pub fn into_bytes(self) -> Request<Bytes> {
        self.rebind(ResultSink::Bytes(identity::<Bytes>))
    }

    /// Keeps the body as lossy UTF-8 text. Drops listeners registered so far.
    pub fn into_text(self) -> Request<String> {
        self.rebind(ResultSink::Text(identity::<String>))
    }

    /// Copies the body into `writer`; the result is the byte count. Drops
    /// listeners registered so far.
    pub fn into_writer<W>(self, writer: Arc<Mutex<W>>) -> Request<u64>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.rebind(ResultSink::Writer {
            writer,
            close: false,
            wrap: identity::<u64>,
        })
    }

    /// Like [`Request::into_writer`], then shuts the writer down.
    pub fn into_writer_closing<W>(self, writer: Arc<Mutex<W>>) -> Request<u64>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.rebind(ResultSink::Writer {
            writer,
            close: true,
            wrap: identity::<u64>,
        })
    }

    pub fn discard_result(self) -> Request<()> {
        self.rebind(ResultSink::Discard(unit))
    }

    pub fn http_method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn raw_url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn header_map(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_source(&self) -> &BodySource {
        &self.body
    }

    /// Resolves the URL using only the request's own base URL.
    pub fn resolved_uri(&self) -> Result<Uri, Error> {
        self.resolve_uri(None)
    }

    /// Substitutes path parameters, applies a base URL when the stored URL is
    /// relative, then merges query parameters in sorted key order.
    pub(crate) fn resolve_uri(&self, fallback_base: Option<&str>) -> Result<Uri, Error> {
        let mut path = self.url.clone().unwrap_or_default();
        for (key, value) in &self.path_params {
            let encoded = utf8_percent_encode(value, PATH_PARAM).to_string();
            path = path.replace(&format!("{{{key}}}"), &encoded);
        }

        let absolute = if is_absolute_http_url(&path) {
            path
        } else {
            match self.base_url.as_deref().or(fallback_base) {
                Some(base) => join_base_path(base, &path),
                None => return Err(Error::InvalidUri { uri: path }),
            }
        };

        let mut parsed = url::Url::parse(&absolute).map_err(|_| Error::InvalidUri {
            uri: absolute.clone(),
        })?;
        if !self.query.is_empty() {
            let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for (key, value) in parsed.query_pairs() {
                merged
                    .entry(key.into_owned())
                    .or_default()
                    .push(value.into_owned());
            }
            for (key, values) in &self.query {
                merged
                    .entry(key.clone())
                    .or_default()
                    .extend(values.iter().cloned());
            }
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (key, values) in &merged {
                for value in values {
                    serializer.append_pair(key, value);
                }
            }
            let encoded = serializer.finish();
            parsed.set_query(Some(&encoded));
        }

        parsed.as_str().parse::<Uri>().map_err(|_| Error::InvalidUri {
            uri: parsed.to_string(),
        })
    }
}

impl<T: Send + 'static> Request<T> {
    /// Sends through `sender`, then runs the completion listeners in order.
    pub async fn send<S: Sender>(&self, sender: &S, cancel: &CancellationToken) -> Response<T> {
        let mut response = sender.send(cancel, self).await;
        for listener in &self.listeners {
            listener(&mut response);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use http::HeaderValue;
    use http::header::{AUTHORIZATION, CONTENT_TYPE};
    use tokio::sync::Mutex;

    use super::{Request, ResultSink};
    use crate::body::BodySource;
    use crate::error::Error;

    #[test]
    fn builder_methods_leave_the_template_untouched() {
        let template = Request::template()
            .base_url("https://example.com/")
            .header(AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        let derived = template.clone().url("items").query("page", "2");

        assert!(template.raw_url().is_none());
        assert!(template.query.is_empty());
        assert_eq!(derived.raw_url(), Some("items"));
        assert_eq!(derived.header_map().get(AUTHORIZATION), template.header_map().get(AUTHORIZATION));
    }

    #[test]
    fn resolves_path_params_base_url_and_query() {
        let request = Request::get("item/{id}")
            .base_url("https://example.com/")
            .path_param("id", 7)
            .query("a", "1");
        assert_eq!(
            request.resolved_uri().expect("uri").to_string(),
            "https://example.com/item/7?a=1"
        );
    }

    #[test]
    fn path_params_are_escaped() {
        let request = Request::get("https://example.com/files/{name}").path_param("name", "a b/c");
        assert_eq!(
            request.resolved_uri().expect("uri").to_string(),
            "https://example.com/files/a%20b%2Fc"
        );
    }

    #[test]
    fn query_keys_are_sorted_and_merged_with_existing_query() {
        let request = Request::get("https://example.com/search?z=last&b=0")
            .query("b", "1")
            .query("a", "x y")
            .query("b", "2");
        assert_eq!(
            request.resolved_uri().expect("uri").to_string(),
            "https://example.com/search?a=x+y&b=0&b=1&b=2&z=last"
        );
    }

    #[test]
    fn absolute_url_ignores_base() {
        let request = Request::get("https://other.example.org/v1").base_url("https://example.com");
        assert_eq!(
            request.resolve_uri(Some("https://fallback.example.net")).expect("uri").to_string(),
            "https://other.example.org/v1"
        );
    }

    #[test]
    fn relative_url_without_base_is_invalid() {
        let error = Request::get("items").resolved_uri().expect_err("no base");
        assert!(matches!(error, Error::InvalidUri { .. }));
    }

    #[test]
    fn json_sets_content_type_only_when_absent() {
        let request = Request::post("https://example.com").json(serde_json::json!({"a": 1}));
        assert_eq!(
            request.header_map().get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json"))
        );
        assert!(matches!(request.body_source(), BodySource::Object(_)));

        let vendor = Request::post("https://example.com")
            .content_type(HeaderValue::from_static("application/vnd.acme+json"))
            .json(serde_json::json!({"a": 1}));
        assert_eq!(
            vendor.header_map().get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/vnd.acme+json"))
        );
    }

    #[test]
    fn rebinding_the_result_drops_listeners() {
        let request = Request::get("https://example.com")
            .on_complete(|_| {})
            .into_bytes();
        assert!(request.listeners.is_empty());
        assert!(matches!(request.sink, ResultSink::Bytes(_)));
    }

    #[tokio::test]
    async fn json_sink_ignores_non_json_bodies() {
        let request = Request::get("https://example.com").into_json::<serde_json::Value>();
        let json = HeaderValue::from_static("application/json");
        let text = HeaderValue::from_static("text/plain");
        let body = Bytes::from_static(br#"{"ok":true}"#);

        let decoded = request.sink.deliver(&body, Some(&json)).await.expect("json");
        assert_eq!(decoded, Some(serde_json::json!({"ok": true})));
        assert_eq!(request.sink.deliver(&body, Some(&text)).await.expect("text"), None);
        assert_eq!(request.sink.deliver(&Bytes::new(), Some(&json)).await.expect("empty"), None);
    }

    #[tokio::test]
    async fn writer_sink_copies_body() {
        let target = Arc::new(Mutex::new(Vec::new()));
        let request = Request::get("https://example.com").into_writer_closing(Arc::clone(&target));
        let written = request
            .sink
            .deliver(&Bytes::from_static(b"chunk"), None)
            .await
            .expect("write");
        assert_eq!(written, Some(5));
        assert_eq!(target.lock().await.as_slice(), b"chunk");
    }
}
