use std::io::Read;

use bytes::Bytes;
use http::header::CONTENT_ENCODING;
use http::{HeaderMap, Method, StatusCode};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ContentDecodeError {
    Decode { encoding: String, message: String },
    TooLarge { actual_bytes: usize },
}

impl ContentDecodeError {
    fn decode(encoding: &str, message: impl ToString) -> Self {
        Self::Decode {
            encoding: encoding.to_owned(),
            message: message.to_string(),
        }
    }
}

/// Codings listed in `Content-Encoding`, in the order they were applied.
pub(crate) fn content_codings(headers: &HeaderMap) -> Result<Vec<String>, ContentDecodeError> {
    let mut codings = Vec::new();
    for value in headers.get_all(CONTENT_ENCODING) {
        let value = value
            .to_str()
            .map_err(|error| ContentDecodeError::decode("content-encoding", error))?;
        codings.extend(
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_ascii_lowercase),
        );
    }
    Ok(codings)
}

/// HEAD, informational, 204 and 304 responses carry no decodable payload.
pub(crate) fn should_decode(method: &Method, status: StatusCode, body_len: usize) -> bool {
    body_len > 0
        && *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

fn read_limited<R: Read>(
    mut reader: R,
    encoding: &str,
    max_bytes: usize,
) -> Result<Vec<u8>, ContentDecodeError> {
    let mut decoded = Vec::new();
    let mut chunk = [0_u8; READ_CHUNK];
    loop {
        let read = reader
            .read(&mut chunk)
            .map_err(|error| ContentDecodeError::decode(encoding, error))?;
        if read == 0 {
            return Ok(decoded);
        }
        let next_len = decoded.len().saturating_add(read);
        if next_len > max_bytes {
            return Err(ContentDecodeError::TooLarge {
                actual_bytes: next_len,
            });
        }
        decoded.extend_from_slice(&chunk[..read]);
    }
}

fn decode_one(body: &[u8], encoding: &str, max_bytes: usize) -> Result<Vec<u8>, ContentDecodeError> {
    match encoding {
        "identity" => {
            if body.len() > max_bytes {
                return Err(ContentDecodeError::TooLarge {
                    actual_bytes: body.len(),
                });
            }
            Ok(body.to_vec())
        }
        "gzip" | "x-gzip" => read_limited(flate2::read::GzDecoder::new(body), encoding, max_bytes),
        "deflate" => read_limited(flate2::read::ZlibDecoder::new(body), encoding, max_bytes),
        "br" => read_limited(brotli::Decompressor::new(body, 4096), encoding, max_bytes),
        "zstd" => {
            let decoder = zstd::stream::read::Decoder::new(body)
                .map_err(|error| ContentDecodeError::decode(encoding, error))?;
            read_limited(decoder, encoding, max_bytes)
        }
        other => Err(ContentDecodeError::decode(other, "unsupported content-encoding")),
    }
}

/// Undoes every coding in `Content-Encoding`, last applied first. The decoded
/// size of each stage is bounded by `max_bytes`.
pub(crate) fn decode_body(
    body: Bytes,
    headers: &HeaderMap,
    max_bytes: usize,
) -> Result<Bytes, ContentDecodeError> {
    let max_bytes = max_bytes.max(1);
    let mut codings = content_codings(headers)?;
    let mut body = body;
    while let Some(encoding) = codings.pop() {
        body = Bytes::from(decode_one(&body, &encoding, max_bytes)?);
    }
    Ok(body)
}
