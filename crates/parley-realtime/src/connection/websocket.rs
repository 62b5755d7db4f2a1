//! WebSocket transport.
//!
//! Upgrades `GET {hub.url}` with `Authorization: Bearer <token>`. A 401/403
//! on the upgrade, or close code 4401/4403 later, is an auth rejection.
//!
//! Heartbeat: any inbound frame proves liveness. After `keepalive_interval`
//! of silence the link sends a ping; if nothing arrives within
//! `pong_timeout` after that, `recv` fails with
//! [`TransportError::PongTimeout`].

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parley_api::AuthToken;
use parley_settings::{HubSettings, TransportKind};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use super::transport::{AUTH_CLOSE_CODES, Link, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket links to the hub.
#[derive(Clone, Debug)]
pub struct WebSocketTransport {
    url: String,
    keepalive_interval: Duration,
    pong_timeout: Duration,
}

impl WebSocketTransport {
    /// Transport for the configured hub URL and heartbeat.
    #[must_use]
    pub fn new(settings: &HubSettings) -> Self {
        Self {
            url: settings.url.clone(),
            keepalive_interval: settings.keepalive_interval(),
            pong_timeout: settings.pong_timeout(),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open(&self, token: &AuthToken) -> Result<Box<dyn Link>, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("invalid hub URL: {e}")))?;
        let header = HeaderValue::from_str(&token.bearer())
            .map_err(|_| TransportError::Connect("token is not a valid header value".into()))?;
        let _ = request.headers_mut().insert(AUTHORIZATION, header);

        let connected = tokio::time::timeout(self.pong_timeout, connect_async(request)).await;
        let ws = match connected {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(tungstenite::Error::Http(response))) => {
                let status = response.status().as_u16();
                return Err(if matches!(status, 401 | 403) {
                    TransportError::AuthRejected { status }
                } else {
                    TransportError::Http { status }
                });
            }
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            Err(_) => {
                return Err(TransportError::Connect(format!(
                    "handshake timed out after {:?}",
                    self.pong_timeout
                )));
            }
        };

        debug!(url = %self.url, "websocket link open");
        Ok(Box::new(WebSocketLink::new(
            ws,
            self.keepalive_interval,
            self.pong_timeout,
        )))
    }
}

/// One open WebSocket.
struct WebSocketLink {
    ws: WsStream,
    keepalive_interval: Duration,
    pong_timeout: Duration,
    idle_deadline: Instant,
    pong_deadline: Option<Instant>,
}

impl WebSocketLink {
    fn new(ws: WsStream, keepalive_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ws,
            keepalive_interval,
            pong_timeout,
            idle_deadline: Instant::now() + keepalive_interval,
            pong_deadline: None,
        }
    }

    fn saw_traffic(&mut self) {
        self.idle_deadline = Instant::now() + self.keepalive_interval;
        self.pong_deadline = None;
    }
}

#[async_trait]
impl Link for WebSocketLink {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let pong_deadline = self.pong_deadline;
            tokio::select! {
                biased;

                () = sleep_until(pong_deadline.unwrap_or(self.idle_deadline)), if pong_deadline.is_some() => {
                    warn!(timeout = ?self.pong_timeout, "hub did not answer keepalive ping");
                    return Err(TransportError::PongTimeout(self.pong_timeout));
                }

                () = sleep_until(self.idle_deadline), if pong_deadline.is_none() => {
                    self.ws
                        .send(Message::Ping(Vec::new().into()))
                        .await
                        .map_err(|e| TransportError::Io(e.to_string()))?;
                    self.pong_deadline = Some(Instant::now() + self.pong_timeout);
                }

                msg = self.ws.next() => {
                    self.saw_traffic();
                    match msg {
                        Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => return Ok(Some(text)),
                            Err(_) => debug!(len = data.len(), "ignoring non-UTF-8 binary frame"),
                        },
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = self.ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            let Some(frame) = frame else {
                                return Ok(None);
                            };
                            let code = u16::from(frame.code);
                            if AUTH_CLOSE_CODES.contains(&code) {
                                return Err(TransportError::AuthRejected { status: code });
                            }
                            return Err(TransportError::Closed {
                                code: Some(code),
                                reason: frame.reason.to_string(),
                            });
                        }
                        Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.ws
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
