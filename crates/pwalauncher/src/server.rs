//! Request pipeline and listeners.
//!
//! [`Gateway`] owns everything built from the configuration and answers one
//! request at a time. [`GatewayServer`] binds the configured listeners and
//! feeds connections into it.

use std::any::Any;
use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use hyper::body::{Body, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use pwalauncher_router::RouteTable;
use pwalauncher_telemetry::{log_internal_error, log_listening, log_pin_rejected};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::anywhere::CorsAnywhere;
use crate::config::{ConfigError, GatewayConfig, SessionSecret};
use crate::cors;
use crate::error::GatewayError;
use crate::fallback::StaticFallback;
use crate::gate::{AccessGate, GateRequest, GateVerdict, Stage};
use crate::pin::{CertificatePin, PinError};
use crate::proxy::{is_upgrade_request, ForwardContext, ProxyDispatcher};
use crate::relay::{self, EventRelay};
use crate::response::{self, BoxError, ResponseBody};
use crate::tls::{Alpn, TlsError, TlsMaterial};

/// Errors raised while bringing listeners up.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {kind} listener on port {port}: {source}")]
    Bind {
        kind: &'static str,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} listener configured without TLS material")]
    MissingTls(&'static str),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// Plain HTTP/1.1.
    Plain,
    /// HTTP/1.1 over TLS.
    Tls,
    /// HTTP/2 over TLS, with HTTP/1.1 fallback.
    Http2,
}

impl ListenerKind {
    pub fn name(self) -> &'static str {
        match self {
            ListenerKind::Plain => "http",
            ListenerKind::Tls => "https",
            ListenerKind::Http2 => "h2",
        }
    }
}

/// Mounts allowed to take over upgraded connections on one listener.
#[derive(Debug, Clone, Default)]
pub struct UpgradeHooks {
    mounts: HashSet<usize>,
}

impl UpgradeHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mount: usize) {
        self.mounts.insert(mount);
    }

    pub fn is_registered(&self, mount: usize) -> bool {
        self.mounts.contains(&mount)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

/// Per-connection facts shared by every request on it.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub peer: SocketAddr,
    pub tls: bool,
    /// Set when the connection failed the client certificate pin.
    pub pin_failure: Option<PinError>,
}

impl ConnInfo {
    pub fn plain(peer: SocketAddr) -> Self {
        Self {
            peer,
            tls: false,
            pin_failure: None,
        }
    }
}

/// Everything built from the configuration.
pub struct Gateway {
    config: GatewayConfig,
    routes: RouteTable,
    /// Indexed by mount index.
    dispatchers: Vec<ProxyDispatcher>,
    gates: AccessGate,
    session: Option<SessionSecret>,
    fallback: StaticFallback,
    relay: Option<Arc<EventRelay>>,
    anywhere: Option<CorsAnywhere>,
    tls: Option<TlsMaterial>,
    pin: Option<CertificatePin>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let routes = config.route_table()?;
        let dispatchers = routes
            .mounts()
            .iter()
            .map(|mount| {
                ProxyDispatcher::new(mount)
                    .map_err(|e| ConfigError::Invalid(format!("mount {}: {}", mount.prefix, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Resolved once: a random secret must stay stable for the process.
        let session = config.session_secret();
        let gates = AccessGate::from_config(&config, session.as_ref())?;
        let fallback = StaticFallback::new(
            config.wwwroot.clone(),
            session.clone(),
            config.cookie_secret_allowed.iter().cloned(),
        );

        let relay = config
            .socket_restream
            .then(|| Arc::new(EventRelay::new().with_body_limit(config.max_body_size)));
        let anywhere = if config.cors_anywhere {
            Some(
                CorsAnywhere::new(config.max_body_size)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            )
        } else {
            None
        };

        let tls = config.ssl.as_ref().map(TlsMaterial::load).transpose()?;
        let pin = match (&tls, config.ssl_verify) {
            (Some(material), true) => Some(material.pin()?),
            _ => None,
        };

        tracing::debug!(
            mounts = routes.len(),
            gates = ?gates.names(),
            relay = relay.is_some(),
            pinned = pin.is_some(),
            "gateway assembled"
        );

        Ok(Self {
            config,
            routes,
            dispatchers,
            gates,
            session,
            fallback,
            relay,
            anywhere,
            tls,
            pin,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn session(&self) -> Option<&SessionSecret> {
        self.session.as_ref()
    }

    pub fn relay(&self) -> Option<&Arc<EventRelay>> {
        self.relay.as_ref()
    }

    pub fn pin(&self) -> Option<&CertificatePin> {
        self.pin.as_ref()
    }

    /// The upgrade registrations for a new listener: every mounted
    /// dispatcher registers, unless upgrades are disabled.
    pub fn upgrade_hooks(&self) -> UpgradeHooks {
        let mut hooks = UpgradeHooks::new();
        if !self.config.disable_ws {
            for mount in self.routes.mounts() {
                hooks.register(mount.index);
            }
        }
        hooks
    }

    /// Answer a request. Never fails: errors and panics become `500`.
    pub async fn respond<B>(
        &self,
        req: Request<B>,
        conn: &ConnInfo,
        hooks: &UpgradeHooks,
    ) -> Response<ResponseBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let outcome = AssertUnwindSafe(self.handle(req, conn, hooks))
            .catch_unwind()
            .await;

        let mut resp = match outcome {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                log_internal_error!(
                    kind = e.kind(),
                    error = %e,
                    client_ip = %conn.peer.ip(),
                    method = %method,
                    path = %path,
                    "request failed"
                );
                response::internal_error()
            }
            Err(panic) => {
                log_internal_error!(
                    kind = "panic",
                    error = %panic_message(panic.as_ref()),
                    client_ip = %conn.peer.ip(),
                    method = %method,
                    path = %path,
                    "request handler panicked"
                );
                response::internal_error()
            }
        };

        response::allow_any_origin(resp.headers_mut());
        resp
    }

    /// The request pipeline: pin, pre-route gates, preflight, routing,
    /// routed gates, relay endpoints, cors-anywhere, then proxy or fallback.
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        conn: &ConnInfo,
        hooks: &UpgradeHooks,
    ) -> Result<Response<ResponseBody>, GatewayError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        // Logged once when the connection was accepted.
        if conn.pin_failure.is_some() {
            return Ok(response::not_found());
        }

        let client_ip = conn.peer.ip().to_canonical();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        let mut gate_req = GateRequest {
            client_ip,
            method: req.method(),
            path: &path,
            query: query.as_deref(),
            headers: req.headers(),
            tls: conn.tls,
            route: None,
        };

        if let Some(resp) = gate_response(self.gates.evaluate(Stage::PreRoute, &gate_req))? {
            return Ok(resp);
        }
        if gate_req.is_preflight() {
            return Ok(cors::preflight(req.headers()));
        }

        let matched = self.routes.lookup(&path);
        gate_req.route = matched.map(|m| m.mount);
        if let Some(resp) = gate_response(self.gates.evaluate(Stage::Routed, &gate_req))? {
            return Ok(resp);
        }
        let target = matched.map(|m| (m.mount.index, m.forwarded_path.to_string()));

        if let Some(relay) = &self.relay {
            if path == relay::EMIT_PATH {
                return Ok(relay.handle_emit(req).await);
            }
            if path == relay::SUBSCRIBE_PATH && is_upgrade_request(req.headers()) {
                return Ok(relay.handle_subscribe(req));
            }
        }

        if let Some(anywhere) = &self.anywhere {
            if CorsAnywhere::matches(&path) {
                return Ok(anywhere.serve(req, client_ip).await);
            }
        }

        if let Some((index, forwarded)) = target {
            let dispatcher = self
                .dispatchers
                .get(index)
                .ok_or(GatewayError::MissingDispatcher(index))?;
            let ctx = ForwardContext {
                client_ip,
                tls: conn.tls,
                upgrades: hooks.is_registered(index),
            };
            return Ok(dispatcher.serve(req, &forwarded, ctx).await);
        }

        Ok(self
            .fallback
            .serve(req.method(), &path, conn.tls, client_ip)
            .await)
    }
}

fn gate_response(verdict: GateVerdict) -> Result<Option<Response<ResponseBody>>, GatewayError> {
    match verdict {
        GateVerdict::Pass => Ok(None),
        GateVerdict::Rejected { rejection, .. } => Ok(Some(response::json(
            StatusCode::NOT_FOUND,
            &rejection.body(),
        ))),
        GateVerdict::Redirect { location, .. } => response::redirect(&location)
            .map(Some)
            .ok_or(GatewayError::InvalidRedirect(location)),
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct BoundListener {
    kind: ListenerKind,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    hooks: Arc<UpgradeHooks>,
}

/// The bound listeners of one gateway.
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    listeners: Vec<BoundListener>,
    shutdown: watch::Receiver<bool>,
}

impl GatewayServer {
    /// Bind every configured listener on all interfaces. Nothing is served
    /// until [`GatewayServer::run`].
    pub async fn bind(
        gateway: Arc<Gateway>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ServerError> {
        let config = gateway.config();
        let wanted = [
            (ListenerKind::Plain, config.port),
            (ListenerKind::Tls, config.ssl_port),
            (ListenerKind::Http2, config.http2_port),
        ];

        let mut listeners = Vec::new();
        for (kind, port) in wanted {
            let Some(port) = port else { continue };

            let acceptor = match kind {
                ListenerKind::Plain => None,
                ListenerKind::Tls | ListenerKind::Http2 => {
                    let material = gateway
                        .tls
                        .as_ref()
                        .ok_or(ServerError::MissingTls(kind.name()))?;
                    let alpn = if kind == ListenerKind::Http2 {
                        Alpn::Http2
                    } else {
                        Alpn::Http1
                    };
                    let server_config = material.server_config(alpn, gateway.pin.is_some())?;
                    Some(TlsAcceptor::from(server_config))
                }
            };

            let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
                .await
                .map_err(|source| ServerError::Bind {
                    kind: kind.name(),
                    port,
                    source,
                })?;

            if let Ok(addr) = listener.local_addr() {
                log_listening!(
                    listener = kind.name(),
                    addr = %addr,
                    pinned = acceptor.is_some() && gateway.pin.is_some(),
                    "listening"
                );
            }

            listeners.push(BoundListener {
                kind,
                listener,
                acceptor,
                hooks: Arc::new(gateway.upgrade_hooks()),
            });
        }

        Ok(Self {
            gateway,
            listeners,
            shutdown,
        })
    }

    pub fn local_addrs(&self) -> Vec<(ListenerKind, SocketAddr)> {
        self.listeners
            .iter()
            .filter_map(|l| l.listener.local_addr().ok().map(|addr| (l.kind, addr)))
            .collect()
    }

    /// Serve until the shutdown signal flips to `true` or its sender drops.
    pub async fn run(self) {
        let mut tasks = JoinSet::new();
        for bound in self.listeners {
            tasks.spawn(accept_loop(
                Arc::clone(&self.gateway),
                bound,
                self.shutdown.clone(),
            ));
        }
        while tasks.join_next().await.is_some() {}
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn accept_loop(
    gateway: Arc<Gateway>,
    bound: BoundListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn_shutdown = shutdown.clone();
    loop {
        tokio::select! {
            accepted = bound.listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_stream(
                        Arc::clone(&gateway),
                        stream,
                        peer,
                        bound.kind,
                        bound.acceptor.clone(),
                        Arc::clone(&bound.hooks),
                        conn_shutdown.clone(),
                    ));
                }
                Err(e) => tracing::warn!(listener = bound.kind.name(), error = %e, "accept failed"),
            },
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
}

async fn handle_stream(
    gateway: Arc<Gateway>,
    stream: TcpStream,
    peer: SocketAddr,
    kind: ListenerKind,
    acceptor: Option<TlsAcceptor>,
    hooks: Arc<UpgradeHooks>,
    shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);

    let Some(acceptor) = acceptor else {
        let conn = ConnInfo::plain(peer);
        serve_connection(gateway, stream, conn, kind, hooks, shutdown).await;
        return;
    };

    let tls_stream = match acceptor.accept(stream).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(client_ip = %peer.ip(), error = %e, "TLS handshake failed");
            return;
        }
    };

    // The pin verdict is taken once per connection and applies to every
    // request on it.
    let pin_failure = gateway.pin.as_ref().and_then(|pin| {
        let (_, session) = tls_stream.get_ref();
        pin.verify(session.peer_certificates()).err()
    });
    if let Some(e) = &pin_failure {
        log_pin_rejected!(
            client_ip = %peer.ip(),
            reason = e.reason(),
            error = %e,
            "client certificate pin rejected"
        );
    }

    let conn = ConnInfo {
        peer,
        tls: true,
        pin_failure,
    };
    serve_connection(gateway, tls_stream, conn, kind, hooks, shutdown).await;
}

async fn serve_connection<IO>(
    gateway: Arc<Gateway>,
    io: IO,
    conn: ConnInfo,
    kind: ListenerKind,
    hooks: Arc<UpgradeHooks>,
    mut shutdown: watch::Receiver<bool>,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer = conn.peer;
    let conn = Arc::new(conn);
    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        let conn = Arc::clone(&conn);
        let hooks = Arc::clone(&hooks);
        async move { Ok::<_, Infallible>(gateway.respond(req, &conn, &hooks).await) }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    if kind != ListenerKind::Http2 {
        builder = builder.http1_only();
    }

    let connection = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                tracing::debug!(client_ip = %peer.ip(), error = %e, "connection closed with error");
            }
        }
        _ = wait_for_shutdown(&mut shutdown) => {
            connection.as_mut().graceful_shutdown();
            let _ = connection.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use http_body_util::{BodyExt, Full};
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Running {
        addr: SocketAddr,
        gateway: Arc<Gateway>,
        _stop: watch::Sender<bool>,
        _site: tempfile::TempDir,
    }

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>spa</html>").unwrap();
        std::fs::write(dir.path().join("app.js"), "boot()").unwrap();
        dir
    }

    async fn start(mut config: GatewayConfig) -> Running {
        let site = site();
        config.wwwroot = site.path().to_path_buf();
        if config.ssl_port.is_none() && config.http2_port.is_none() {
            config.port = Some(0);
        }

        let gateway = Arc::new(Gateway::new(config).unwrap());
        let (stop, rx) = watch::channel(false);
        let server = GatewayServer::bind(Arc::clone(&gateway), rx).await.unwrap();
        let port = server.local_addrs()[0].1.port();
        tokio::spawn(server.run());

        Running {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            gateway,
            _stop: stop,
            _site: site,
        }
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    fn config(yaml: &str) -> GatewayConfig {
        GatewayConfig::from_yaml(yaml).unwrap()
    }

    fn mock_port(server: &MockServer) -> u16 {
        server.address().port()
    }

    #[tokio::test]
    async fn numbered_backend_round_trip() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&backend)
            .await;

        let port = mock_port(&backend);
        let gw = start(config(&format!("port: 0\nports: [{}]\n", port))).await;

        let resp = client()
            .get(format!("http://{}/{}/health", gw.addr, port))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");
        assert_eq!(resp.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn missing_bearer_never_reaches_backend() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&backend)
            .await;

        let port = mock_port(&backend);
        let gw = start(config(&format!(
            "port: 0\nports: [{}]\njwtSecret: S\n",
            port
        )))
        .await;

        let resp = client()
            .get(format!("http://{}/{}/x", gw.addr, port))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.text().await.unwrap(), r#"{"error":"jwt"}"#);
    }

    #[tokio::test]
    async fn blacklisted_client_gets_404_even_for_preflight() {
        let gw = start(config("port: 0\nipBlacklist: ['127.0.0.1']\n")).await;

        let resp = client().get(format!("http://{}/", gw.addr)).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.text().await.unwrap(), r#"{"error":true}"#);

        let resp = client()
            .request(reqwest::Method::OPTIONS, format!("http://{}/x", gw.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn session_cookie_flow() {
        let gw = start(config(
            "port: 0\ncookieSecret: {key: sid, value: abc}\n",
        ))
        .await;

        let resp = client()
            .get(format!("http://{}/app.js", gw.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client().get(format!("http://{}/", gw.addr)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let cookie = resp.headers()["set-cookie"].to_str().unwrap().to_string();
        assert!(cookie.starts_with("sid=abc;"));
        assert_eq!(resp.text().await.unwrap(), "<html>spa</html>");

        let resp = client()
            .get(format!("http://{}/app.js", gw.addr))
            .header("cookie", "sid=abc")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "boot()");

        // Preflight bypasses the cookie gate.
        let resp = client()
            .request(reqwest::Method::OPTIONS, format!("http://{}/app.js", gw.addr))
            .header("origin", "https://app.example")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers()["access-control-allow-origin"],
            "https://app.example"
        );
    }

    #[tokio::test]
    async fn random_session_secret_is_stable() {
        let gw = start(config("port: 0\ncookieSecret: random\n")).await;
        let secret = gw.gateway.session().unwrap().clone();

        for _ in 0..2 {
            let resp = client().get(format!("http://{}/", gw.addr)).send().await.unwrap();
            let cookie = resp.headers()["set-cookie"].to_str().unwrap().to_string();
            assert!(cookie.starts_with(&format!("{}={};", secret.key, secret.value)));
        }
    }

    #[tokio::test]
    async fn unreachable_backend_is_500() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let gw = start(config(&format!("port: 0\nports: [{}]\n", port))).await;
        let resp = client()
            .get(format!("http://{}/{}/x", gw.addr, port))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        assert_eq!(resp.text().await.unwrap(), r#"{"error":true}"#);
    }

    /// A backend that echoes bytes after a `101`, or answers `200 plain`
    /// when the request did not ask for an upgrade.
    async fn echo_backend() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let head = read_head(&mut sock).await.to_ascii_lowercase();
                    if head.contains("upgrade: echo") {
                        sock.write_all(
                            b"HTTP/1.1 101 Switching Protocols\r\nconnection: upgrade\r\nupgrade: echo\r\n\r\n",
                        )
                        .await
                        .unwrap();
                        let mut buf = [0u8; 1024];
                        loop {
                            let n = sock.read(&mut buf).await.unwrap_or(0);
                            if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    } else {
                        let _ = sock
                            .write_all(
                                b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nplain",
                            )
                            .await;
                    }
                });
            }
        });
        port
    }

    async fn read_head(sock: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if sock.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8_lossy(&head).into_owned()
    }

    async fn upgrade_request(addr: SocketAddr, port: u16) -> (TcpStream, String) {
        let mut sock = TcpStream::connect(addr).await.unwrap();
        sock.write_all(
            format!(
                "GET /{}/stream HTTP/1.1\r\nhost: gw\r\nconnection: Upgrade\r\nupgrade: echo\r\n\r\n",
                port
            )
            .as_bytes(),
        )
        .await
        .unwrap();
        let head = read_head(&mut sock).await;
        (sock, head)
    }

    #[tokio::test]
    async fn upgrade_is_spliced() {
        let port = echo_backend().await;
        let gw = start(config(&format!("port: 0\nports: [{}]\n", port))).await;

        let (mut sock, head) = upgrade_request(gw.addr, port).await;
        assert!(head.starts_with("HTTP/1.1 101"), "{}", head);

        sock.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), sock.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn disabled_upgrades_are_forwarded_plain() {
        let port = echo_backend().await;
        let gw = start(config(&format!("port: 0\nports: [{}]\ndisableWs: true\n", port))).await;
        assert!(gw.gateway.upgrade_hooks().is_empty());

        let (_sock, head) = upgrade_request(gw.addr, port).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    }

    #[tokio::test]
    async fn relay_delivers_to_websocket_subscribers() {
        let gw = start(config("port: 0\nsocketRestream: true\n")).await;
        let relay = Arc::clone(gw.gateway.relay().unwrap());

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/restream", gw.addr))
            .await
            .unwrap();
        // Registered by the time the handshake completes.
        assert_eq!(relay.subscriber_count(), 1);

        let resp = client()
            .post(format!("http://{}/restream_emit", gw.addr))
            .header("x-user-id", "u1")
            .header("x-project-id", "p1")
            .header("x-events", "deploy")
            .body(r#"{"status":"done"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "ok");

        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_str(message.to_text().unwrap()).unwrap();
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["events"], "deploy");
        assert_eq!(value["payload"]["status"], "done");

        ws.close(None).await.unwrap();
        for _ in 0..100 {
            if relay.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(relay.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn relay_endpoints_absent_when_disabled() {
        let gw = start(config("port: 0\n")).await;
        assert!(gw.gateway.relay().is_none());

        let resp = client()
            .post(format!("http://{}/restream_emit", gw.addr))
            .body("{}")
            .send()
            .await
            .unwrap();
        // Falls through to the static fallback, which only serves GET/HEAD.
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn handle_in_process() {
        let dir = site();
        let mut cfg = config("port: 0\nredirectHttps: true\nsslRedirectPort: 8443\n");
        cfg.wwwroot = dir.path().to_path_buf();
        let gateway = Gateway::new(cfg).unwrap();
        let conn = ConnInfo::plain("10.1.2.3:5555".parse().unwrap());
        let hooks = gateway.upgrade_hooks();

        let req = Request::get("/a?b=1")
            .header("host", "example.com")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = gateway.respond(req, &conn, &hooks).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers()["location"], "https://example.com:8443/a?b=1");

        let conn = ConnInfo {
            tls: true,
            ..conn
        };
        let req = Request::get("/a").body(Full::new(Bytes::new())).unwrap();
        let resp = gateway.respond(req, &conn, &hooks).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"<html>spa</html>");
    }

    #[tokio::test]
    async fn pin_failure_blocks_every_request() {
        let dir = site();
        let mut cfg = config("port: 0\n");
        cfg.wwwroot = dir.path().to_path_buf();
        let gateway = Gateway::new(cfg).unwrap();
        let conn = ConnInfo {
            peer: "127.0.0.1:1".parse().unwrap(),
            tls: true,
            pin_failure: Some(PinError::NoCertificate),
        };

        let req = Request::get("/").body(Full::new(Bytes::new())).unwrap();
        let resp = gateway.respond(req, &conn, &gateway.upgrade_hooks()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn panic_messages() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn upgrade_hooks_register_every_mount() {
        let dir = site();
        let mut cfg = config(
            "port: 0\nports: [3001, 3002]\nproxy:\n  - {path: v1, link: 'http://127.0.0.1:9000'}\n",
        );
        cfg.wwwroot = dir.path().to_path_buf();
        let gateway = Gateway::new(cfg).unwrap();
        let hooks = gateway.upgrade_hooks();
        assert_eq!(hooks.len(), 3);
        assert!(hooks.is_registered(2));
        assert!(!hooks.is_registered(3));
    }

    fn write_tls(dir: &Path, name: &str) -> (String, String) {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_pem = generated.cert.pem();
        let key_pem = generated.key_pair.serialize_pem();
        std::fs::write(dir.join(format!("{}.crt", name)), &cert_pem).unwrap();
        std::fs::write(dir.join(format!("{}.key", name)), &key_pem).unwrap();
        (cert_pem, key_pem)
    }

    fn tls_client(identity: Option<(String, String)>) -> reqwest::Client {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(true)
            .no_proxy();
        if let Some((cert, key)) = identity {
            let pem = format!("{}{}", cert, key);
            builder = builder.identity(reqwest::Identity::from_pem(pem.as_bytes()).unwrap());
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn pinned_tls_listener() {
        let tls_dir = tempfile::tempdir().unwrap();
        let server_pair = write_tls(tls_dir.path(), "server");
        let other_pair = write_tls(tls_dir.path(), "other");

        let yaml = format!(
            "sslPort: 0\nsslVerify: true\nssl:\n  key: {}\n  cert: {}\n",
            tls_dir.path().join("server.key").display(),
            tls_dir.path().join("server.crt").display(),
        );
        let gw = start(config(&yaml)).await;
        assert!(gw.gateway.pin().is_some());
        let url = format!("https://{}/", gw.addr);

        let resp = tls_client(Some(server_pair)).get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "<html>spa</html>");

        let resp = tls_client(Some(other_pair)).get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let resp = tls_client(None).get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn http2_listener_negotiates_h2_and_proxies() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(2)
            .mount(&backend)
            .await;
        let port = mock_port(&backend);

        let tls_dir = tempfile::tempdir().unwrap();
        write_tls(tls_dir.path(), "server");
        let yaml = format!(
            "http2Port: 0\nports: [{}]\nssl:\n  key: {}\n  cert: {}\n",
            port,
            tls_dir.path().join("server.key").display(),
            tls_dir.path().join("server.crt").display(),
        );
        let gw = start(config(&yaml)).await;
        let url = format!("https://{}/{}/health", gw.addr, port);

        let h2 = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(true)
            .http2_prior_knowledge()
            .no_proxy()
            .build()
            .unwrap();
        let resp = h2.get(&url).send().await.unwrap();
        assert_eq!(resp.version(), reqwest::Version::HTTP_2);
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");
        assert_eq!(resp.text().await.unwrap(), "ok");

        // Clients without h2 fall back to HTTP/1.1 on the same listener.
        let h1 = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(true)
            .http1_only()
            .no_proxy()
            .build()
            .unwrap();
        let resp = h1.get(&url).send().await.unwrap();
        assert_eq!(resp.version(), reqwest::Version::HTTP_11);
        assert_eq!(resp.text().await.unwrap(), "ok");

        let received = backend.received_requests().await.unwrap();
        let forwarded_proto = received[0].headers.get("x-forwarded-proto").unwrap();
        assert_eq!(forwarded_proto, "https");
    }

    #[tokio::test]
    async fn graceful_shutdown_stops_accepting() {
        let mut cfg = config("port: 0\n");
        let dir = site();
        cfg.wwwroot = dir.path().to_path_buf();
        let gateway = Arc::new(Gateway::new(cfg).unwrap());
        let (stop, rx) = watch::channel(false);
        let server = GatewayServer::bind(gateway, rx).await.unwrap();
        let handle = tokio::spawn(server.run());

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let dir = site();
        let mut cfg = config(&format!("port: {}\n", port));
        cfg.wwwroot = dir.path().to_path_buf();
        let gateway = Arc::new(Gateway::new(cfg).unwrap());
        let (_stop, rx) = watch::channel(false);

        let err = GatewayServer::bind(gateway, rx).await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }), "{}", err);
    }
}
