//! Webhook event relay.
//!
//! Events posted to `/restream_emit` are stamped, serialized once and pushed
//! to every WebSocket subscriber of `/restream`. Delivery is best effort: a
//! subscriber whose buffer is full misses the event, a closed one is dropped.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use http::header::{self, HeaderMap, HeaderValue};
use hyper::body::Body;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pwalauncher_telemetry::events;
use pwalauncher_telemetry::log_relay_broadcast;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::response::{self, BoxError, ResponseBody};

/// Intake endpoint.
pub const EMIT_PATH: &str = "/restream_emit";
/// Subscription endpoint.
pub const SUBSCRIBE_PATH: &str = "/restream";

/// Events buffered per subscriber before new ones are dropped.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

const USER_ID: &str = "x-user-id";
const PROJECT_ID: &str = "x-project-id";
const EVENTS: &str = "x-events";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("event body is not JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("not a WebSocket handshake: {0}")]
    Handshake(&'static str),
}

/// One accepted event as subscribers receive it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEvent {
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub events: Option<String>,
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch, assigned on intake.
    pub timestamp: u64,
}

impl RelayEvent {
    /// Build an event from the webhook headers and raw body. An empty body
    /// is a `null` payload.
    pub fn from_parts(headers: &HeaderMap, body: &[u8]) -> Result<Self, RelayError> {
        let payload = if body.iter().all(u8::is_ascii_whitespace) {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(body)?
        };

        Ok(Self {
            user_id: header_string(headers, USER_ID),
            project_id: header_string(headers, PROJECT_ID),
            events: header_string(headers, EVENTS),
            payload,
            timestamp: now_millis(),
        })
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A live subscription. Dropping the receiver ends delivery; the entry is
/// removed on the next broadcast or by [`EventRelay::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<Arc<str>>,
}

/// The subscriber registry and fan-out.
#[derive(Debug)]
pub struct EventRelay {
    subscribers: DashMap<Uuid, mpsc::Sender<Arc<str>>>,
    buffer: usize,
    max_body_size: usize,
}

impl Default for EventRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRelay {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            buffer: buffer.max(1),
            max_body_size: response::DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Cap on `/restream_emit` bodies; larger ones are answered `413`.
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, receiver) = mpsc::channel(self.buffer);
        self.subscribers.insert(id, tx);
        tracing::info!(
            event = events::RELAY_SUBSCRIBER,
            subscriber_id = %id,
            subscribers = self.subscribers.len(),
            "relay subscriber added"
        );
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            tracing::info!(
                event = events::RELAY_SUBSCRIBER,
                subscriber_id = %id,
                subscribers = self.subscribers.len(),
                "relay subscriber removed"
            );
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver `event` to every current subscriber without waiting on any of
    /// them. Returns how many subscribers accepted it.
    pub fn broadcast(&self, event: &RelayEvent) -> usize {
        let serialized: Arc<str> = match serde_json::to_string(event) {
            Ok(s) => s.into(),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize relay event");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut dropped = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            match entry.value().try_send(Arc::clone(&serialized)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => dropped += 1,
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        // Removal happens after iteration: the map's shards are still
        // read-locked inside the loop.
        for id in closed {
            self.unsubscribe(id);
        }

        log_relay_broadcast!(
            delivered = delivered,
            dropped = dropped,
            user_id = event.user_id.as_deref().unwrap_or(""),
            project_id = event.project_id.as_deref().unwrap_or(""),
            "relay event broadcast"
        );
        delivered
    }

    /// `POST /restream_emit`.
    pub async fn handle_emit<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        if req.method() != Method::POST {
            return response::not_found();
        }

        let (parts, body) = req.into_parts();
        let bytes = match response::read_limited(body, self.max_body_size).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read relay event body");
                return e.response();
            }
        };

        match RelayEvent::from_parts(&parts.headers, &bytes) {
            Ok(event) => {
                self.broadcast(&event);
                response::text(StatusCode::OK, "ok")
            }
            Err(e) => {
                tracing::warn!(error = %e, "rejected relay event");
                response::error(StatusCode::BAD_REQUEST)
            }
        }
    }

    /// `GET /restream`: accept the WebSocket handshake and stream events to
    /// the socket until it closes.
    pub fn handle_subscribe<B>(self: &Arc<Self>, mut req: Request<B>) -> Response<ResponseBody> {
        let accept = match websocket_accept(req.method(), req.headers()) {
            Ok(accept) => accept,
            Err(e) => {
                tracing::debug!(error = %e, "relay subscription refused");
                return response::error(StatusCode::BAD_REQUEST);
            }
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        // Registered before the 101 goes out: events emitted once the client
        // sees the handshake complete are buffered for it.
        let subscription = self.subscribe();
        let relay = Arc::clone(self);

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let ws =
                        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                            .await;
                    relay.pump(ws, subscription).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "relay upgrade failed");
                    relay.unsubscribe(subscription.id);
                }
            }
        });

        let mut resp = Response::new(response::empty());
        *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = resp.headers_mut();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        resp
    }

    async fn pump<S>(&self, ws: WebSocketStream<S>, subscription: Subscription)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let Subscription { id, mut receiver } = subscription;
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                outgoing = receiver.recv() => {
                    let Some(text) = outgoing else { break };
                    if let Err(e) = sink.send(Message::text(text.to_string())).await {
                        tracing::debug!(subscriber_id = %id, error = %e, "relay write failed");
                        break;
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(subscriber_id = %id, error = %e, "relay read failed");
                        break;
                    }
                },
            }
        }

        self.unsubscribe(id);
        let _ = sink.close().await;
    }
}

/// Validate a WebSocket handshake and compute `Sec-WebSocket-Accept`.
fn websocket_accept(method: &Method, headers: &HeaderMap) -> Result<HeaderValue, RelayError> {
    if method != Method::GET {
        return Err(RelayError::Handshake("method must be GET"));
    }
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(RelayError::Handshake("missing Upgrade: websocket"));
    }
    if headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .is_some_and(|v| v.as_bytes() != b"13")
    {
        return Err(RelayError::Handshake("unsupported WebSocket version"));
    }
    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(RelayError::Handshake("missing Sec-WebSocket-Key"))?;

    HeaderValue::from_str(&derive_accept_key(key.as_bytes()))
        .map_err(|_| RelayError::Handshake("invalid Sec-WebSocket-Key"))
}
