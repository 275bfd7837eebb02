//! Permissive CORS preflight answers.

use http::header::{self, HeaderMap, HeaderValue};
use hyper::{Response, StatusCode};

use crate::response::{self, ResponseBody};

const ALLOW_METHODS: &str = "GET, HEAD, PUT, PATCH, POST, DELETE, OPTIONS";

/// Preflight cache lifetime in seconds.
pub const MAX_AGE_SECS: u32 = 3600;

/// Answer an `OPTIONS` request: every origin, method and requested header is
/// allowed.
pub fn preflight(request_headers: &HeaderMap) -> Response<ResponseBody> {
    let mut resp = Response::new(response::empty());
    *resp.status_mut() = StatusCode::OK;
    let headers = resp.headers_mut();

    let origin = request_headers
        .get(header::ORIGIN)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    if let Some(requested) = request_headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(MAX_AGE_SECS));
    headers.insert(
        header::VARY,
        HeaderValue::from_static("Origin, Access-Control-Request-Headers"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    response::no_cache(headers);
    resp
}
