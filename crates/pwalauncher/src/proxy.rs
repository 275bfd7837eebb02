//! Forwarding to mounted targets.
//!
//! One [`ProxyDispatcher`] per mount, each with its own connection pool.
//! Plain requests are replayed with `reqwest`; upgrade requests get their
//! handshake replayed and, on `101`, both upgraded streams are spliced
//! together in a background task.

use std::net::IpAddr;
use std::time::Duration;

use bytes::Buf;
use futures_util::TryStreamExt;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http_body_util::{BodyExt, StreamBody};
use percent_encoding::percent_decode_str;
use hyper::body::{Body, Frame};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pwalauncher_router::Mount;
use pwalauncher_telemetry::events;
use pwalauncher_telemetry::log_upstream_error;
use reqwest::{Client, Url};
use thiserror::Error;

use crate::response::{self, BoxError, ResponseBody};

/// Connect timeout for every upstream. There is no overall request timeout:
/// long polls and streams are legitimate.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle keep-alive connections kept per upstream host.
pub const POOL_MAX_IDLE_PER_HOST: usize = 10_000;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Headers that only concern a single hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream URL '{url}': {reason}")]
    InvalidUri { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("forwarded path '{0}' contains a dot segment")]
    DotSegment(String),

    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {target} timed out")]
    Timeout { target: String },

    #[error("request to {target} failed: {source}")]
    Request {
        target: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("upgrade failed: {0}")]
    Upgrade(String),
}

impl UpstreamError {
    fn from_reqwest(target: &str, source: reqwest::Error) -> Self {
        let target = target.to_string();
        if source.is_timeout() {
            UpstreamError::Timeout { target }
        } else if source.is_connect() {
            UpstreamError::Connect { target, source }
        } else {
            UpstreamError::Request { target, source }
        }
    }
}

/// Per-request facts the dispatcher needs beyond the request itself.
#[derive(Debug, Clone, Copy)]
pub struct ForwardContext {
    pub client_ip: IpAddr,
    pub tls: bool,
    /// Whether the listener registered an upgrade hook for this mount.
    pub upgrades: bool,
}

/// Forwards requests for one mount.
pub struct ProxyDispatcher {
    prefix: String,
    /// Target base without a trailing slash.
    base: String,
    client: Client,
}

impl ProxyDispatcher {
    pub fn new(mount: &Mount) -> Result<Self, UpstreamError> {
        let url = Url::parse(&mount.target).map_err(|e| UpstreamError::InvalidUri {
            url: mount.target.clone(),
            reason: e.to_string(),
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(UpstreamError::InvalidUri {
                url: mount.target.clone(),
                reason: "scheme must be http or https".into(),
            });
        }

        Ok(Self {
            prefix: mount.prefix.clone(),
            base: url.as_str().trim_end_matches('/').to_string(),
            client: upstream_client()?,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn target(&self) -> &str {
        &self.base
    }

    /// The upstream URL for a forwarded path and the original query.
    ///
    /// URL parsing resolves `.` and `..` segments, which would move the
    /// request outside the target's base path, so such paths are refused.
    pub fn upstream_url(&self, forwarded_path: &str, query: Option<&str>) -> Result<Url, UpstreamError> {
        if has_dot_segment(forwarded_path) {
            return Err(UpstreamError::DotSegment(forwarded_path.to_string()));
        }

        let mut raw = String::with_capacity(self.base.len() + forwarded_path.len() + 1);
        raw.push_str(&self.base);
        if !forwarded_path.starts_with('/') {
            raw.push('/');
        }
        raw.push_str(forwarded_path);
        if let Some(q) = query {
            raw.push('?');
            raw.push_str(q);
        }
        Url::parse(&raw).map_err(|e| UpstreamError::InvalidUri {
            url: raw,
            reason: e.to_string(),
        })
    }

    /// Forward and turn any failure into a logged `500`.
    pub async fn serve<B>(
        &self,
        req: Request<B>,
        forwarded_path: &str,
        ctx: ForwardContext,
    ) -> Response<ResponseBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let path = req.uri().path().to_string();
        match self.forward(req, forwarded_path, ctx).await {
            Ok(response) => response,
            Err(e @ UpstreamError::DotSegment(_)) => {
                tracing::warn!(
                    mount = %self.prefix,
                    client_ip = %ctx.client_ip,
                    path = %path,
                    error = %e,
                    "refused forwarded path"
                );
                response::not_found()
            }
            Err(e) => {
                log_upstream_error!(
                    mount = %self.prefix,
                    target = %self.base,
                    client_ip = %ctx.client_ip,
                    path = %path,
                    error = %e,
                    "upstream request failed"
                );
                response::internal_error()
            }
        }
    }

    pub async fn forward<B>(
        &self,
        mut req: Request<B>,
        forwarded_path: &str,
        ctx: ForwardContext,
    ) -> Result<Response<ResponseBody>, UpstreamError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let upgrade = ctx.upgrades && is_upgrade_request(req.headers());
        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));

        let url = self.upstream_url(forwarded_path, req.uri().query())?;
        let (parts, body) = req.into_parts();

        let mut headers = end_to_end_headers(&parts.headers, upgrade);
        // The client sets Host from the upstream URL.
        headers.remove(header::HOST);
        append_forwarded(&mut headers, &parts, ctx);

        let mut builder = self
            .client
            .request(parts.method.clone(), url)
            .headers(headers);
        // Streamed as it arrives; Content-Length, when sent, is forwarded.
        if !body.is_end_stream() {
            let stream = body
                .into_data_stream()
                .map_ok(|mut data| data.copy_to_bytes(data.remaining()))
                .map_err(|e| -> BoxError { e.into() });
            builder = builder.body(reqwest::Body::wrap_stream(stream));
        }

        let upstream = builder
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(&self.base, e))?;

        match client_upgrade {
            Some(on_client) if upstream.status() == StatusCode::SWITCHING_PROTOCOLS => {
                Ok(self.splice(upstream, on_client, ctx.client_ip))
            }
            _ => Ok(stream_response(upstream, false)),
        }
    }

    /// Answer `101` with the upstream headers and splice both sides once the
    /// client connection is handed over.
    fn splice(
        &self,
        upstream: reqwest::Response,
        on_client: hyper::upgrade::OnUpgrade,
        client_ip: IpAddr,
    ) -> Response<ResponseBody> {
        let mut response = Response::new(response::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = upstream.headers().clone();

        let prefix = self.prefix.clone();
        let target = self.base.clone();

        tokio::spawn(async move {
            let (client, upstream) = tokio::join!(on_client, upstream.upgrade());
            let result = match (client, upstream) {
                (Ok(client), Ok(mut upstream)) => {
                    tracing::info!(
                        event = events::UPGRADE_OPENED,
                        mount = %prefix,
                        target = %target,
                        client_ip = %client_ip,
                        "upgraded stream opened"
                    );
                    tokio::io::copy_bidirectional(&mut TokioIo::new(client), &mut upstream)
                        .await
                        .map_err(|e| UpstreamError::Upgrade(e.to_string()))
                }
                (Err(e), _) => Err(UpstreamError::Upgrade(format!("client side: {}", e))),
                (_, Err(e)) => Err(UpstreamError::Upgrade(format!("upstream side: {}", e))),
            };

            match result {
                Ok((from_client, from_upstream)) => tracing::info!(
                    event = events::UPGRADE_CLOSED,
                    mount = %prefix,
                    client_ip = %client_ip,
                    bytes_in = from_client,
                    bytes_out = from_upstream,
                    "upgraded stream closed"
                ),
                Err(e) => tracing::warn!(
                    event = events::UPGRADE_CLOSED,
                    mount = %prefix,
                    client_ip = %client_ip,
                    error = %e,
                    "upgraded stream ended with an error"
                ),
            }
        });

        response
    }
}

/// A pooled HTTP/1 client that leaves responses untouched: no redirects
/// followed, no transparent decompression, no environment proxies.
pub(crate) fn upstream_client() -> Result<Client, UpstreamError> {
    Client::builder()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .connect_timeout(CONNECT_TIMEOUT)
        .http1_only()
        .redirect(reqwest::redirect::Policy::none())
        .no_gzip()
        .no_proxy()
        .build()
        .map_err(UpstreamError::Client)
}

/// Whether any segment of `path` is `.` or `..`, literally or
/// percent-encoded.
pub fn has_dot_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| {
        let decoded: Vec<u8> = percent_decode_str(segment).collect();
        decoded == b"." || decoded == b".."
    })
}

/// `Connection: upgrade` plus an `Upgrade` header.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE) && connection_has(headers, "upgrade")
}

fn connection_has(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Copy `headers` without hop-by-hop headers, including any named in
/// `Connection`. With `keep_upgrade`, the upgrade handshake headers stay.
pub fn end_to_end_headers(headers: &HeaderMap, keep_upgrade: bool) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || listed.iter().any(|l| l == lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if keep_upgrade {
        if let Some(upgrade) = headers.get(header::UPGRADE) {
            out.insert(header::UPGRADE, upgrade.clone());
            out.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        }
    }
    out
}

fn append_forwarded(headers: &mut HeaderMap, parts: &http::request::Parts, ctx: ForwardContext) {
    append_list(headers, X_FORWARDED_FOR, &ctx.client_ip.to_canonical().to_string());
    append_list(
        headers,
        X_FORWARDED_PROTO,
        if ctx.tls { "https" } else { "http" },
    );

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()));
    if let Some(host) = host {
        append_list(headers, X_FORWARDED_HOST, &host);
    }
}

/// Extend a comma-separated header, creating it when absent.
fn append_list(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    let combined = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, value),
        _ => value.to_string(),
    };
    if let Ok(v) = HeaderValue::from_str(&combined) {
        headers.insert(name, v);
    }
}

/// Turn an upstream response into a streamed gateway response.
pub(crate) fn stream_response(upstream: reqwest::Response, drop_cookies: bool) -> Response<ResponseBody> {
    let status = upstream.status();
    let mut headers = end_to_end_headers(upstream.headers(), false);
    if drop_cookies {
        headers.remove(header::SET_COOKIE);
    }

    let stream = upstream
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(|e| -> BoxError { Box::new(e) });
    let body: ResponseBody = StreamBody::new(stream).boxed_unsync();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
