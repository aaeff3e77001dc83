//! Request body sources and their per-attempt materialization.
//!
//! A [`BodySource`] describes where request bytes come from. Before the first
//! attempt it is prepared once into a [`PreparedBody`], which can produce a
//! fresh byte stream for every retry and redirect hop.

use std::convert::Infallible;
use std::fmt;
use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::{HeaderMap, HeaderValue, Method, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, ReadBuf};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tokio_util::io::ReaderStream;

use crate::error::{BoxError, Error};
use crate::util::is_json_content_type;

pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

/// Wraps an in-memory buffer as a boxed body, handy for custom transports.
pub fn full_body(bytes: impl Into<Bytes>) -> UnsyncBoxBody<Bytes, BoxError> {
    Full::new(bytes.into())
        .map_err(map_infallible)
        .boxed_unsync()
}

pub(crate) fn empty_body() -> UnsyncBoxBody<Bytes, BoxError> {
    Empty::new().map_err(map_infallible).boxed_unsync()
}

fn map_infallible(never: Infallible) -> BoxError {
    match never {}
}

pub trait SeekableReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T> SeekableReader for T where T: AsyncRead + AsyncSeek + Send + Unpin {}

type SharedSeekable = Arc<Mutex<Box<dyn SeekableReader>>>;
type SharedReader = Arc<Mutex<Box<dyn AsyncRead + Send + Unpin>>>;
type ObjectEncoder = Arc<dyn Fn() -> serde_json::Result<Vec<u8>> + Send + Sync>;

#[derive(Clone, Default)]
pub enum BodySource {
    #[default]
    Empty,
    Text(String),
    Bytes(Bytes),
    Seekable(SharedSeekable),
    /// Streams from wherever the reader currently is. A retry after a
    /// partially consumed attempt sends only the remainder.
    Reader(SharedReader),
    Object(ObjectEncoder),
}

impl fmt::Debug for BodySource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Empty"),
            Self::Text(text) => formatter.debug_tuple("Text").field(&text.len()).finish(),
            Self::Bytes(bytes) => formatter.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Seekable(_) => formatter.write_str("Seekable"),
            Self::Reader(_) => formatter.write_str("Reader"),
            Self::Object(_) => formatter.write_str("Object"),
        }
    }
}

impl BodySource {
    pub fn seekable<R>(reader: R) -> Self
    where
        R: AsyncRead + AsyncSeek + Send + Unpin + 'static,
    {
        Self::Seekable(Arc::new(Mutex::new(Box::new(reader))))
    }

    pub fn reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::Reader(Arc::new(Mutex::new(Box::new(reader))))
    }

    pub fn object<B>(value: B) -> Self
    where
        B: serde::Serialize + Send + Sync + 'static,
    {
        Self::Object(Arc::new(move || serde_json::to_vec(&value)))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Resolves the source into a form that can be replayed per attempt.
    /// Objects are encoded here, once, so every attempt sends identical bytes.
    pub(crate) fn prepare(&self, content_type: Option<&HeaderValue>) -> Result<PreparedBody, Error> {
        Ok(match self {
            Self::Empty => PreparedBody::Empty,
            Self::Text(text) => PreparedBody::Buffered(Bytes::from(text.clone())),
            Self::Bytes(bytes) => PreparedBody::Buffered(bytes.clone()),
            Self::Seekable(reader) => PreparedBody::Seekable(Arc::clone(reader)),
            Self::Reader(reader) => PreparedBody::Reader(Arc::clone(reader)),
            Self::Object(encode) => {
                if !is_json_content_type(content_type) {
                    return Err(Error::UnsupportedBody {
                        content_type: content_type
                            .and_then(|value| value.to_str().ok())
                            .map(ToOwned::to_owned),
                    });
                }
                let encoded = encode().map_err(|source| Error::Serialize { source })?;
                PreparedBody::Buffered(Bytes::from(encoded))
            }
        })
    }
}

#[derive(Clone)]
pub(crate) enum PreparedBody {
    Empty,
    Buffered(Bytes),
    Seekable(SharedSeekable),
    Reader(SharedReader),
}

/// How long a new attempt waits for the previous attempt's body stream to be
/// released by the transport.
const READER_LOCK_WAIT: Duration = Duration::from_secs(5);

impl PreparedBody {
    pub(crate) async fn rebuild(&self) -> Result<RequestBody, Error> {
        self.rebuild_within(READER_LOCK_WAIT).await
    }

    /// Reader-backed bodies stay locked while a transport still holds the
    /// stream of an earlier attempt, for example when a server answered before
    /// reading the upload. The wait for that lock is bounded by `wait`.
    async fn rebuild_within(&self, wait: Duration) -> Result<RequestBody, Error> {
        match self {
            Self::Empty => Ok(empty_body()),
            Self::Buffered(bytes) => Ok(full_body(bytes.clone())),
            Self::Seekable(reader) => {
                let mut guard = lock_reader(reader, wait).await?;
                guard
                    .seek(SeekFrom::Start(0))
                    .await
                    .map_err(|source| Error::ReadRequestBody { source })?;
                Ok(stream_reader(GuardedReader(guard)))
            }
            Self::Reader(reader) => {
                let guard = lock_reader(reader, wait).await?;
                Ok(stream_reader(GuardedReader(guard)))
            }
        }
    }
}

async fn lock_reader<R: ?Sized>(
    reader: &Arc<Mutex<Box<R>>>,
    wait: Duration,
) -> Result<OwnedMutexGuard<Box<R>>, Error> {
    timeout(wait, Arc::clone(reader).lock_owned())
        .await
        .map_err(|_| Error::ReadRequestBody {
            source: std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "request body is still held by a previous attempt",
            ),
        })
}

/// Keeps the shared reader locked for as long as its attempt streams from it.
struct GuardedReader<R: ?Sized>(OwnedMutexGuard<Box<R>>);

impl<R> AsyncRead for GuardedReader<R>
where
    R: AsyncRead + Unpin + ?Sized,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let reader: &mut Box<R> = &mut self.get_mut().0;
        Pin::new(reader).poll_read(cx, buf)
    }
}

fn stream_reader<R>(reader: R) -> RequestBody
where
    R: AsyncRead + Send + 'static,
{
    let frames = ReaderStream::new(reader)
        .map_ok(Frame::data)
        .map_err(|error| Box::new(error) as BoxError);
    StreamBody::new(frames).boxed_unsync()
}

pub(crate) fn build_http_request(
    method: Method,
    uri: Uri,
    headers: &HeaderMap,
    body: RequestBody,
) -> Result<http::Request<RequestBody>, Error> {
    let mut builder = http::Request::builder().method(method).uri(uri);
    if let Some(target) = builder.headers_mut() {
        target.extend(headers.iter().map(|(name, value)| (name.clone(), value.clone())));
    }
    builder
        .body(body)
        .map_err(|source| Error::RequestBuild { source })
}

pub(crate) enum ReadBodyError {
    Read(BoxError),
    TooLarge { actual_bytes: usize },
}

pub(crate) async fn read_body_limited(
    mut body: ResponseBody,
    max_bytes: usize,
) -> Result<Bytes, ReadBodyError> {
    let mut collected = Vec::new();
    let mut total_len = 0_usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ReadBodyError::Read)?;
        if let Some(data) = frame.data_ref() {
            total_len = total_len.saturating_add(data.len());
            if total_len > max_bytes {
                return Err(ReadBodyError::TooLarge {
                    actual_bytes: total_len,
                });
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}
