//! HTTP long-polling fallback transport.
//!
//! - `POST {base}/negotiate` returns `{"connectionId": "..."}`
//! - `GET {base}/poll?id=<connectionId>` blocks until frames are available and
//!   returns a JSON array of frames; `204` means none arrived in time
//! - `POST {base}/send?id=<connectionId>` carries one outbound frame
//!
//! 401/403 anywhere is an auth rejection; 404 on poll means the hub forgot
//! the connection id.
//!
//! Polling runs on its own task feeding a channel, so `Link::recv` stays
//! cancel-safe.

use std::time::Duration;

use async_trait::async_trait;
use parley_api::AuthToken;
use parley_settings::{HubSettings, TransportKind};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::transport::{Link, Transport, TransportError};

/// Frames buffered between the poll task and the connection loop.
const POLL_BUFFER: usize = 256;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    connection_id: String,
}

/// Opens long-polling links to the hub.
#[derive(Clone, Debug)]
pub struct LongPollingTransport {
    client: reqwest::Client,
    base_url: String,
    poll_timeout: Duration,
}

impl LongPollingTransport {
    /// Transport for the configured long-polling base URL.
    ///
    /// A poll request may be held open by the hub for up to one keepalive
    /// interval, so requests time out after keepalive plus pong timeout.
    #[must_use]
    pub fn new(settings: &HubSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: settings.long_polling_url.trim_end_matches('/').to_string(),
            poll_timeout: settings.keepalive_interval() + settings.pong_timeout(),
        }
    }

    fn endpoint(&self, name: &str, id: Option<&str>) -> Result<Url, TransportError> {
        let mut url = Url::parse(&format!("{}/{name}", self.base_url))
            .map_err(|e| TransportError::Connect(format!("invalid long-polling URL: {e}")))?;
        if let Some(id) = id {
            let _ = url.query_pairs_mut().append_pair("id", id);
        }
        Ok(url)
    }
}

fn classify_status(status: StatusCode) -> Option<TransportError> {
    match status {
        s if s.is_success() => None,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(TransportError::AuthRejected {
            status: status.as_u16(),
        }),
        StatusCode::NOT_FOUND => Some(TransportError::SessionGone),
        _ => Some(TransportError::Http {
            status: status.as_u16(),
        }),
    }
}

fn request_error(err: &reqwest::Error) -> TransportError {
    if err.is_connect() || err.is_timeout() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Io(err.to_string())
    }
}

#[async_trait]
impl Transport for LongPollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPolling
    }

    async fn open(&self, token: &AuthToken) -> Result<Box<dyn Link>, TransportError> {
        let response = self
            .client
            .post(self.endpoint("negotiate", None)?)
            .bearer_auth(token.expose())
            .timeout(self.poll_timeout)
            .send()
            .await
            .map_err(|e| request_error(&e))?;
        if let Some(err) = classify_status(response.status()) {
            // A stale id cannot happen during negotiation.
            return Err(match err {
                TransportError::SessionGone => TransportError::Http { status: 404 },
                other => other,
            });
        }
        let negotiated: NegotiateResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Io(format!("bad negotiate response: {e}")))?;

        let id = negotiated.connection_id;
        debug!(connection_id = %id, "long-polling link negotiated");

        let (tx, rx) = mpsc::channel(POLL_BUFFER);
        let poller = tokio::spawn(poll_loop(
            self.client.clone(),
            self.endpoint("poll", Some(&id))?,
            token.clone(),
            self.poll_timeout,
            tx,
        ));

        Ok(Box::new(LongPollingLink {
            client: self.client.clone(),
            send_url: self.endpoint("send", Some(&id))?,
            token: token.clone(),
            timeout: self.poll_timeout,
            inbound: rx,
            poller,
        }))
    }
}

async fn poll_loop(
    client: reqwest::Client,
    url: Url,
    token: AuthToken,
    timeout: Duration,
    tx: mpsc::Sender<Result<String, TransportError>>,
) {
    loop {
        let result = client
            .get(url.clone())
            .bearer_auth(token.expose())
            .timeout(timeout)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let _ = tx.send(Err(request_error(&e))).await;
                return;
            }
        };

        if response.status() == StatusCode::NO_CONTENT {
            trace!("poll returned no frames");
            continue;
        }
        if let Some(err) = classify_status(response.status()) {
            let _ = tx.send(Err(err)).await;
            return;
        }

        let frames: Vec<Value> = match response.json().await {
            Ok(frames) => frames,
            Err(e) => {
                let _ = tx.send(Err(TransportError::Io(format!("bad poll body: {e}")))).await;
                return;
            }
        };

        for frame in frames {
            let text = match frame {
                Value::String(s) => s,
                other => other.to_string(),
            };
            if tx.send(Ok(text)).await.is_err() {
                return;
            }
        }
    }
}

/// One negotiated long-polling connection.
struct LongPollingLink {
    client: reqwest::Client,
    send_url: Url,
    token: AuthToken,
    timeout: Duration,
    inbound: mpsc::Receiver<Result<String, TransportError>>,
    poller: JoinHandle<()>,
}

#[async_trait]
impl Link for LongPollingLink {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        match self.inbound.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.send_url.clone())
            .bearer_auth(self.token.expose())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(frame)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| request_error(&e))?;
        classify_status(response.status()).map_or(Ok(()), Err)
    }

    async fn close(&mut self) {
        self.poller.abort();
    }
}

impl Drop for LongPollingLink {
    fn drop(&mut self) {
        self.poller.abort();
    }
}
