//! `/cors-anywhere/<url>`: fetch an arbitrary http(s) URL on behalf of a
//! browser and hand the answer back with permissive CORS headers.

use std::net::IpAddr;

use http::header::{self, HeaderValue};
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use pwalauncher_telemetry::log_upstream_error;
use reqwest::{Client, Url};

use crate::proxy::{end_to_end_headers, stream_response, upstream_client, UpstreamError};
use crate::response::{self, BoxError, ResponseBody};

pub const PREFIX: &str = "/cors-anywhere/";

pub struct CorsAnywhere {
    client: Client,
    /// Relayed request bodies are buffered up to this size.
    max_body_size: usize,
}

impl CorsAnywhere {
    pub fn new(max_body_size: usize) -> Result<Self, UpstreamError> {
        Ok(Self {
            client: upstream_client()?,
            max_body_size,
        })
    }

    pub fn matches(path: &str) -> bool {
        path.starts_with(PREFIX)
    }

    /// The target of a relayed request, or `None` when the remainder is not
    /// an absolute http(s) URL.
    pub fn target_url(path: &str, query: Option<&str>) -> Option<Url> {
        let raw = path.strip_prefix(PREFIX)?;

        // Some clients collapse `https://` to `https:/` inside paths.
        let mut target = match raw.split_once(":/") {
            Some((scheme, rest)) if !rest.starts_with('/') => format!("{}://{}", scheme, rest),
            _ => raw.to_string(),
        };
        if let Some(q) = query {
            target.push('?');
            target.push_str(q);
        }

        let url = Url::parse(&target).ok()?;
        match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Some(url),
            _ => None,
        }
    }

    pub async fn serve<B>(&self, req: Request<B>, client_ip: IpAddr) -> Response<ResponseBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let Some(url) = Self::target_url(req.uri().path(), req.uri().query()) else {
            return response::error(StatusCode::BAD_REQUEST);
        };

        let (parts, body) = req.into_parts();
        let mut headers = end_to_end_headers(&parts.headers, false);
        for name in [header::HOST, header::COOKIE, header::ORIGIN, header::REFERER] {
            headers.remove(name);
        }

        let body = match response::read_limited(body, self.max_body_size).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read relayed request body");
                return e.response();
            }
        };

        let mut builder = self.client.request(parts.method, url.clone()).headers(headers);
        if !body.is_empty() {
            builder = builder.body(body);
        }

        match builder.send().await {
            Ok(upstream) => {
                let mut resp = stream_response(upstream, true);
                let headers = resp.headers_mut();
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_ORIGIN,
                    HeaderValue::from_static("*"),
                );
                headers.insert(
                    header::ACCESS_CONTROL_EXPOSE_HEADERS,
                    HeaderValue::from_static("*"),
                );
                resp
            }
            Err(e) => {
                log_upstream_error!(
                    mount = PREFIX,
                    target = %url,
                    client_ip = %client_ip,
                    error = %e,
                    "cors-anywhere request failed"
                );
                response::internal_error()
            }
        }
    }
}
