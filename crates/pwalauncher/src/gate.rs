//! Access gates.
//!
//! Each gate is an independent check over a [`GateRequest`]. The
//! [`AccessGate`] chain runs them in a fixed order and stops at the first
//! gate that does not let the request through.

use std::collections::HashSet;
use std::net::IpAddr;

use http::header::{AUTHORIZATION, COOKIE, HOST};
use http::{HeaderMap, Method};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use pwalauncher_router::Mount;
use pwalauncher_telemetry::log_gate_rejected;
use thiserror::Error;

use crate::config::{ConfigError, GatewayConfig, SessionSecret};

/// The parts of a request the gates look at.
#[derive(Debug, Clone, Copy)]
pub struct GateRequest<'a> {
    pub client_ip: IpAddr,
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    /// Whether the connection is TLS.
    pub tls: bool,
    /// The matched mount, once routing has happened.
    pub route: Option<&'a Mount>,
}

impl GateRequest<'_> {
    pub fn is_preflight(&self) -> bool {
        self.method == Method::OPTIONS
    }
}

/// Why a gate refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("client address is blacklisted")]
    Blacklisted,

    #[error("session cookie missing")]
    MissingCookie,

    #[error("session cookie does not match")]
    CookieMismatch,

    #[error("authorization header missing")]
    MissingToken,

    #[error("authorization scheme is not bearer")]
    InvalidScheme,

    #[error("bearer token rejected: {0}")]
    InvalidToken(String),
}

impl Rejection {
    /// Stable reason code for logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::Blacklisted => "blacklisted",
            Rejection::MissingCookie => "missing_cookie",
            Rejection::CookieMismatch => "cookie_mismatch",
            Rejection::MissingToken => "missing_token",
            Rejection::InvalidScheme => "invalid_scheme",
            Rejection::InvalidToken(_) => "invalid_token",
        }
    }

    /// Body of the `404` sent back.
    pub fn body(&self) -> serde_json::Value {
        match self {
            Rejection::MissingToken | Rejection::InvalidScheme | Rejection::InvalidToken(_) => {
                serde_json::json!({ "error": "jwt" })
            }
            _ => serde_json::json!({ "error": true }),
        }
    }
}

/// What a single gate decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Continue,
    Reject(Rejection),
    /// Answer with a redirect to this location.
    Redirect(String),
}

/// What the whole chain decided, with the gate that fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    Rejected {
        gate: &'static str,
        rejection: Rejection,
    },
    Redirect {
        gate: &'static str,
        location: String,
    },
}

pub trait Gate: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this gate also screens CORS preflight requests.
    fn screens_preflight(&self) -> bool {
        false
    }

    /// Whether this gate needs the routing decision.
    fn needs_route(&self) -> bool {
        false
    }

    fn check(&self, req: &GateRequest<'_>) -> GateOutcome;
}

/// Rejects a fixed set of client addresses.
#[derive(Debug, Clone)]
pub struct IpBlacklist {
    blocked: HashSet<IpAddr>,
}

impl IpBlacklist {
    pub fn new(blocked: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            blocked: blocked.into_iter().map(|ip| ip.to_canonical()).collect(),
        }
    }
}

impl Gate for IpBlacklist {
    fn name(&self) -> &'static str {
        "ip_blacklist"
    }

    fn screens_preflight(&self) -> bool {
        true
    }

    fn check(&self, req: &GateRequest<'_>) -> GateOutcome {
        if self.blocked.contains(&req.client_ip.to_canonical()) {
            GateOutcome::Reject(Rejection::Blacklisted)
        } else {
            GateOutcome::Continue
        }
    }
}

/// Requires the shared session cookie outside the allow-listed paths.
#[derive(Debug, Clone)]
pub struct SessionCookie {
    secret: SessionSecret,
    allowed: HashSet<String>,
}

impl SessionCookie {
    pub fn new(secret: SessionSecret, allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            secret,
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl Gate for SessionCookie {
    fn name(&self) -> &'static str {
        "session_cookie"
    }

    fn check(&self, req: &GateRequest<'_>) -> GateOutcome {
        if self.allowed.contains(req.path) {
            return GateOutcome::Continue;
        }
        match cookie_value(req.headers, &self.secret.key) {
            None => GateOutcome::Reject(Rejection::MissingCookie),
            Some(value) if value == self.secret.value => GateOutcome::Continue,
            Some(_) => GateOutcome::Reject(Rejection::CookieMismatch),
        }
    }
}

/// First value of cookie `name` across every `Cookie` header.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| {
            let v = v.trim();
            v.strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(v)
        })
}

/// Sends plaintext requests to the HTTPS listener.
#[derive(Debug, Clone)]
pub struct HttpsRedirect {
    port: u16,
}

impl HttpsRedirect {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    fn location(&self, host: &str, path: &str, query: Option<&str>) -> String {
        let mut location = format!("https://{}", strip_port(host));
        if self.port != 443 {
            location.push_str(&format!(":{}", self.port));
        }
        location.push_str(path);
        if let Some(q) = query {
            location.push('?');
            location.push_str(q);
        }
        location
    }
}

impl Gate for HttpsRedirect {
    fn name(&self) -> &'static str {
        "https_redirect"
    }

    fn check(&self, req: &GateRequest<'_>) -> GateOutcome {
        if req.tls {
            return GateOutcome::Continue;
        }
        match req.headers.get(HOST).and_then(|h| h.to_str().ok()) {
            Some(host) if !host.is_empty() => {
                GateOutcome::Redirect(self.location(host, req.path, req.query))
            }
            // HTTP/1.0 without Host: nowhere to send the client.
            _ => GateOutcome::Continue,
        }
    }
}

/// Drop the `:port` suffix of a Host header, keeping IPv6 brackets.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Requires a valid HMAC-signed JWT on numbered mounts.
pub struct BearerToken {
    key: DecodingKey,
    validation: Validation,
}

impl BearerToken {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.leeway = 0;
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    fn verify(&self, headers: &HeaderMap) -> Result<(), Rejection> {
        let header = headers
            .get(AUTHORIZATION)
            .ok_or(Rejection::MissingToken)?
            .to_str()
            .map_err(|_| Rejection::InvalidScheme)?;

        let (scheme, token) = header.trim().split_once(' ').ok_or(Rejection::InvalidScheme)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(Rejection::InvalidScheme);
        }

        let token = token.trim();
        if token.is_empty() {
            return Err(Rejection::InvalidToken("empty token".into()));
        }

        decode::<serde_json::Value>(token, &self.key, &self.validation)
            .map(|_| ())
            .map_err(|e| Rejection::InvalidToken(e.to_string()))
    }
}

impl Gate for BearerToken {
    fn name(&self) -> &'static str {
        "bearer_token"
    }

    fn needs_route(&self) -> bool {
        true
    }

    fn check(&self, req: &GateRequest<'_>) -> GateOutcome {
        match req.route {
            Some(mount) if mount.kind.is_numbered() => match self.verify(req.headers) {
                Ok(()) => GateOutcome::Continue,
                Err(rejection) => GateOutcome::Reject(rejection),
            },
            _ => GateOutcome::Continue,
        }
    }
}

/// Which part of the chain to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Gates that run before routing.
    PreRoute,
    /// Gates that need the matched mount.
    Routed,
}

/// The ordered gate chain.
#[derive(Default)]
pub struct AccessGate {
    gates: Vec<Box<dyn Gate>>,
}

impl AccessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a gate. Gates run in the order they are added.
    pub fn with(mut self, gate: impl Gate + 'static) -> Self {
        self.gates.push(Box::new(gate));
        self
    }

    /// The standard chain: blacklist, session cookie, HTTPS redirect, bearer.
    /// Gates that are not configured are left out.
    pub fn from_config(
        config: &GatewayConfig,
        session: Option<&SessionSecret>,
    ) -> Result<Self, ConfigError> {
        let mut chain = Self::new();

        let blocked = config.blacklist()?;
        if !blocked.is_empty() {
            chain = chain.with(IpBlacklist::new(blocked));
        }

        if let Some(secret) = session {
            chain = chain.with(SessionCookie::new(
                secret.clone(),
                config.cookie_secret_allowed.iter().cloned(),
            ));
        }

        if config.redirect_https {
            let port = config.redirect_port().ok_or_else(|| {
                ConfigError::Invalid("redirectHttps requires a redirect port".into())
            })?;
            chain = chain.with(HttpsRedirect::new(port));
        }

        if let Some(secret) = &config.jwt_secret {
            chain = chain.with(BearerToken::new(secret));
        }

        Ok(chain)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    /// Run one stage of the chain. Preflight requests only see the gates
    /// that screen them.
    pub fn evaluate(&self, stage: Stage, req: &GateRequest<'_>) -> GateVerdict {
        let preflight = req.is_preflight();

        for gate in &self.gates {
            if gate.needs_route() != (stage == Stage::Routed) {
                continue;
            }
            if preflight && !gate.screens_preflight() {
                continue;
            }

            match gate.check(req) {
                GateOutcome::Continue => {}
                GateOutcome::Reject(rejection) => {
                    log_gate_rejected!(
                        gate = gate.name(),
                        reason = rejection.reason(),
                        detail = %rejection,
                        client_ip = %req.client_ip,
                        method = %req.method,
                        path = req.path,
                        "request rejected"
                    );
                    return GateVerdict::Rejected {
                        gate: gate.name(),
                        rejection,
                    };
                }
                GateOutcome::Redirect(location) => {
                    tracing::debug!(
                        gate = gate.name(),
                        client_ip = %req.client_ip,
                        path = req.path,
                        location = %location,
                        "redirecting to https"
                    );
                    return GateVerdict::Redirect {
                        gate: gate.name(),
                        location,
                    };
                }
            }
        }

        GateVerdict::Pass
    }
}
