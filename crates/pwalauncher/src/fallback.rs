//! Static single-page-application fallback.
//!
//! Requests no mount claims are answered from the `wwwroot` directory. Paths
//! that do not name a file get `index.html` so client-side routing works.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

use http::header::{self, HeaderValue};
use hyper::{Method, Response, StatusCode};
use percent_encoding::percent_decode_str;
use pwalauncher_telemetry::log_static_served;

use crate::config::SessionSecret;
use crate::response::{self, ResponseBody};

/// Session cookie lifetime: 60 days.
pub const COOKIE_MAX_AGE_SECS: u64 = 60 * 24 * 60 * 60;

const INDEX: &str = "index.html";

pub struct StaticFallback {
    root: PathBuf,
    session: Option<SessionSecret>,
    cookie_paths: HashSet<String>,
}

impl StaticFallback {
    pub fn new(
        root: impl Into<PathBuf>,
        session: Option<SessionSecret>,
        cookie_paths: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            root: root.into(),
            session,
            cookie_paths: cookie_paths.into_iter().collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn serve(
        &self,
        method: &Method,
        path: &str,
        tls: bool,
        client_ip: IpAddr,
    ) -> Response<ResponseBody> {
        if method != Method::GET && method != Method::HEAD {
            return response::not_found();
        }

        let index = self.root.join(INDEX);
        let file = match self.resolve(path) {
            Some(candidate) => match existing_file(&candidate).await {
                Some(file) => file,
                None => index,
            },
            None => index,
        };

        let bytes = match tokio::fs::read(&file).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    path = path,
                    file = %file.display(),
                    error = %e,
                    "no file to serve"
                );
                return response::not_found();
            }
        };

        let mime = mime_guess::from_path(&file).first_or_octet_stream();
        let length = bytes.len();
        let body = if method == Method::HEAD {
            response::empty()
        } else {
            response::full(bytes)
        };

        let mut resp = Response::new(body);
        *resp.status_mut() = StatusCode::OK;
        let headers = resp.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&content_type(&mime)) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        response::no_cache(headers);

        if let Some(cookie) = self.cookie_for(path, tls) {
            headers.insert(header::SET_COOKIE, cookie);
        }

        log_static_served!(
            client_ip = %client_ip,
            path = path,
            file = %file.display(),
            "served static file"
        );
        resp
    }

    /// Map a request path to a location under the root. `None` when the path
    /// tries to leave the root or does not decode.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let decoded = percent_decode_str(path).decode_utf8().ok()?;
        if decoded.contains('\0') {
            return None;
        }

        let mut resolved = self.root.clone();
        for component in Path::new(decoded.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(resolved)
    }

    fn cookie_for(&self, path: &str, tls: bool) -> Option<HeaderValue> {
        let secret = self.session.as_ref()?;
        if !self.cookie_paths.contains(path) {
            return None;
        }
        let mut cookie = format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
            secret.key, secret.value, COOKIE_MAX_AGE_SECS
        );
        if tls {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie).ok()
    }
}

/// The file to serve for `candidate`: itself, or its `index.html` when it is
/// a directory.
async fn existing_file(candidate: &Path) -> Option<PathBuf> {
    let meta = tokio::fs::metadata(candidate).await.ok()?;
    if meta.is_file() {
        return Some(candidate.to_path_buf());
    }
    if meta.is_dir() {
        let index = candidate.join(INDEX);
        if tokio::fs::metadata(&index).await.ok()?.is_file() {
            return Some(index);
        }
    }
    None
}

fn content_type(mime: &mime_guess::mime::Mime) -> String {
    if mime.type_() == mime_guess::mime::TEXT || mime.subtype() == mime_guess::mime::JAVASCRIPT {
        format!("{}; charset=utf-8", mime)
    } else {
        mime.to_string()
    }
}
