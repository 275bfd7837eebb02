//! Response body type and the canned responses the gateway produces itself.

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::{Response, StatusCode};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body of every response the gateway writes. Proxied bodies stream through
/// it; generated bodies are a single chunk.
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

/// Cap on request bodies the gateway reads itself (1 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

const SURROGATE_CONTROL: HeaderName = HeaderName::from_static("surrogate-control");

pub fn full(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ResponseBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// A generated response with a JSON body and no-cache headers.
pub fn json(status: StatusCode, value: &serde_json::Value) -> Response<ResponseBody> {
    let mut response = Response::new(full(value.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    no_cache(response.headers_mut());
    response
}

/// `{"error":true}` with the given status.
pub fn error(status: StatusCode) -> Response<ResponseBody> {
    json(status, &serde_json::json!({ "error": true }))
}

pub fn not_found() -> Response<ResponseBody> {
    error(StatusCode::NOT_FOUND)
}

pub fn internal_error() -> Response<ResponseBody> {
    error(StatusCode::INTERNAL_SERVER_ERROR)
}

/// A generated plain-text response.
pub fn text(status: StatusCode, body: &'static str) -> Response<ResponseBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    no_cache(response.headers_mut());
    response
}

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    Read(BoxError),
}

impl BodyError {
    /// `413` for oversized bodies, `400` otherwise.
    pub fn response(&self) -> Response<ResponseBody> {
        match self {
            BodyError::TooLarge { .. } => error(StatusCode::PAYLOAD_TOO_LARGE),
            BodyError::Read(_) => error(StatusCode::BAD_REQUEST),
        }
    }
}

/// Buffer a request body of at most `limit` bytes.
pub async fn read_limited<B>(body: B, limit: usize) -> Result<Bytes, BodyError>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    // A declared Content-Length over the limit fails before any read.
    if body.size_hint().lower() > limit as u64 {
        return Err(BodyError::TooLarge { limit });
    }
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(BodyError::TooLarge { limit }),
        Err(e) => Err(BodyError::Read(e)),
    }
}

/// `302 Found` to `location`. `None` when the location is not a valid header.
pub fn redirect(location: &str) -> Option<Response<ResponseBody>> {
    let value = HeaderValue::from_str(location).ok()?;
    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::FOUND;
    response.headers_mut().insert(header::LOCATION, value);
    no_cache(response.headers_mut());
    Some(response)
}

/// Forbid every cache between the gateway and the browser.
pub fn no_cache(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, proxy-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert(SURROGATE_CONTROL, HeaderValue::from_static("no-store"));
}

/// Add `Access-Control-Allow-Origin: *` unless something upstream set one.
pub fn allow_any_origin(headers: &mut HeaderMap) {
    if !headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN) {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
    }
}
