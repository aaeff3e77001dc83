use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use serde::de::DeserializeOwned;

use crate::error::{BoxError, Error};
use crate::request::Request;
use crate::util::truncate_body;

/// The outbound request as it was last put on the wire, after retries and
/// redirects.
#[derive(Clone, Debug)]
pub struct FinalRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    retry_attempt: usize,
    redirects: usize,
}

impl FinalRequest {
    pub(crate) fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        retry_attempt: usize,
        redirects: usize,
    ) -> Self {
        Self {
            method,
            uri,
            headers,
            retry_attempt,
            redirects,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// 0 for the first try, `n` for the n-th retry.
    pub fn retry_attempt(&self) -> usize {
        self.retry_attempt
    }

    pub fn redirects(&self) -> usize {
        self.redirects
    }
}

/// Status, headers and the fully read, content-decoded body.
#[derive(Clone, Debug)]
pub struct RawResponse {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl RawResponse {
    pub(crate) fn new(status: StatusCode, version: Version, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            version,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&self.body),
        })
    }
}

/// Structured error payload an API returns with a failing status.
///
/// The attach hooks run after decoding so an implementation can keep the
/// request id, rate-limit headers and similar context.
pub trait ApiError: std::error::Error + DeserializeOwned + Send + Sync + 'static {
    fn attach_request(&mut self, _request: &FinalRequest) {}

    fn attach_response(&mut self, _response: &RawResponse) {}
}

pub(crate) type ErrorDecoder =
    fn(&[u8], &FinalRequest, &RawResponse) -> Result<BoxError, serde_json::Error>;

pub(crate) fn decode_api_error<E: ApiError>(
    body: &[u8],
    request: &FinalRequest,
    response: &RawResponse,
) -> Result<BoxError, serde_json::Error> {
    let mut error: E = serde_json::from_slice(body)?;
    error.attach_request(request);
    error.attach_response(response);
    Ok(Box::new(error))
}

/// Outcome of one logical send.
///
/// `result` and `error` are never both set. Both are empty for `204 No
/// Content` and for non-error statuses whose body the bound result target
/// does not accept.
pub struct Response<T> {
    request: Request<T>,
    final_request: Option<FinalRequest>,
    raw: Option<RawResponse>,
    result: Option<T>,
    error: Option<Error>,
}

impl<T> Response<T> {
    pub(crate) fn new(request: Request<T>) -> Self {
        Self {
            request,
            final_request: None,
            raw: None,
            result: None,
            error: None,
        }
    }

    pub(crate) fn complete(
        mut self,
        final_request: Option<FinalRequest>,
        raw: Option<RawResponse>,
        outcome: Result<Option<T>, Error>,
    ) -> Self {
        self.final_request = final_request;
        self.raw = raw;
        match outcome {
            Ok(result) => self.result = result,
            Err(error) => self.error = Some(error),
        }
        self
    }

    pub fn request(&self) -> &Request<T> {
        &self.request
    }

    pub fn final_request(&self) -> Option<&FinalRequest> {
        self.final_request.as_ref()
    }

    pub fn raw(&self) -> Option<&RawResponse> {
        self.raw.as_ref()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.raw.as_ref().map(RawResponse::status)
    }

    pub fn result(&self) -> Option<&T> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn take_result(&mut self) -> Option<T> {
        self.result.take()
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Replaces the outcome with an error, clearing any result.
    pub fn set_error(&mut self, error: Error) {
        self.result = None;
        self.error = Some(error);
    }

    /// Replaces the outcome with a result, clearing any error.
    pub fn set_result(&mut self, result: T) {
        self.error = None;
        self.result = Some(result);
    }

    pub fn is_success(&self) -> bool {
        self.status().is_some_and(|status| status.is_success())
    }

    pub fn is_error(&self) -> bool {
        self.status().is_some_and(|status| status.as_u16() >= 400)
    }

    pub fn into_result(self) -> Result<Option<T>, Error> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }

    pub fn into_parts(self) -> (Option<RawResponse>, Option<T>, Option<Error>) {
        (self.raw, self.result, self.error)
    }
}

impl<T> std::fmt::Debug for Response<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Response")
            .field("final_request", &self.final_request)
            .field("status", &self.status())
            .field("has_result", &self.result.is_some())
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
