//! `reqwest`-backed implementation of the collaborator traits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parley_core::calls::{CallStart, CallSummary, MediaParams};
use parley_core::ids::{CallId, ConversationId, DeviceId, NotificationId, UserId};
use parley_core::notifications::{NotificationPage, PageCursor};
use parley_core::presence::PresenceStatus;
use parley_core::retry::parse_retry_after_header;
use parley_settings::ApiSettings;
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::{AuthToken, TokenProvider};
use crate::errors::{ApiError, ApiResult};
use crate::traits::{DeviceRegistration, PushRegistrar, RealtimeApi};

/// Longest error body kept in [`ApiError::Status`].
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceBatchRequest<'a> {
    user_ids: &'a [UserId],
}

#[derive(Deserialize)]
struct PresenceBatchResponse {
    #[serde(default)]
    statuses: HashMap<UserId, PresenceStatus>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartCallRequest<'a> {
    conversation_id: &'a ConversationId,
}

#[derive(Deserialize)]
struct ActiveCallsResponse {
    #[serde(default)]
    calls: Vec<CallSummary>,
}

/// HTTP client for the Parley REST API.
///
/// Every request carries `Authorization: Bearer <token>` from the
/// [`TokenProvider`]. A 401 triggers one forced refresh and a single replay;
/// if the refreshed token is identical or is rejected too, the call fails
/// with [`ApiError::Unauthorized`].
#[derive(Clone)]
pub struct HttpApiClient {
    client: reqwest::Client,
    base_url: Url,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for HttpApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpApiClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpApiClient {
    /// Build a client from API settings.
    pub fn new(settings: &ApiSettings, tokens: Arc<dyn TokenProvider>) -> ApiResult<Self> {
        let invalid = |message: String| ApiError::InvalidUrl {
            url: settings.base_url.clone(),
            message,
        };
        let base_url = Url::parse(&settings.base_url).map_err(|e| invalid(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("URL cannot carry a path".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| ApiError::from_reqwest(&e))?;

        Ok(Self {
            client,
            base_url,
            tokens,
        })
    }

    fn url(&self, segments: &[&str]) -> ApiResult<Url> {
        let mut url = self.base_url.clone();
        let _ = url
            .path_segments_mut()
            .map_err(|()| ApiError::InvalidUrl {
                url: self.base_url.to_string(),
                message: "URL cannot carry a path".into(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> ApiResult<Response> {
        let token = self.tokens.token(false).await?;
        let response = self.send_once(&method, &url, body, &token).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        let refreshed = self.tokens.token(true).await?;
        if refreshed == token {
            warn!(%url, "token provider returned the rejected token again");
            return Err(ApiError::Unauthorized { status: 401 });
        }
        debug!(%url, "replaying request with refreshed token");
        let response = self.send_once(&method, &url, body, &refreshed).await?;
        check_status(response).await
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&Value>,
        token: &AuthToken,
    ) -> ApiResult<Response> {
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .bearer_auth(token.expose());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(&e))?;
        debug!(%method, path = url.path(), status = response.status().as_u16(), "api response");
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> ApiResult<T> {
        let response = self.execute(Method::GET, url, None).await?;
        decode(response).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, url: Url, body: &B) -> ApiResult<T> {
        let body = encode(body)?;
        let response = self.execute(Method::POST, url, Some(&body)).await?;
        decode(response).await
    }

    async fn send_no_content(&self, method: Method, url: Url, body: Option<&Value>) -> ApiResult<()> {
        let _ = self.execute(method, url, body).await?;
        Ok(())
    }
}

fn encode<B: Serialize>(body: &B) -> ApiResult<Value> {
    serde_json::to_value(body).map_err(|e| ApiError::Decode {
        message: e.to_string(),
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> ApiResult<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| ApiError::from_reqwest(&e))
}

async fn check_status(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Unauthorized {
            status: status.as_u16(),
        }),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after_ms = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after_header);
            Err(ApiError::RateLimited { retry_after_ms })
        }
        _ => {
            let mut message = response.text().await.unwrap_or_default();
            if message.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !message.is_char_boundary(end) {
                    end -= 1;
                }
                message.truncate(end);
            }
            Err(ApiError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl RealtimeApi for HttpApiClient {
    async fn notifications_page(
        &self,
        cursor: Option<&PageCursor>,
        limit: u32,
    ) -> ApiResult<NotificationPage> {
        let mut url = self.url(&["notifications"])?;
        {
            let mut query = url.query_pairs_mut();
            let _ = query.append_pair("limit", &limit.to_string());
            if let Some(cursor) = cursor {
                let _ = query.append_pair("cursor", cursor.as_str());
            }
        }
        self.get_json(url).await
    }

    async fn mark_notification_read(&self, id: NotificationId) -> ApiResult<()> {
        let url = self.url(&["notifications", &id.to_string(), "read"])?;
        self.send_no_content(Method::POST, url, None).await
    }

    async fn mark_all_notifications_read(&self) -> ApiResult<()> {
        let url = self.url(&["notifications", "read-all"])?;
        self.send_no_content(Method::POST, url, None).await
    }

    async fn presence_batch(
        &self,
        users: &[UserId],
    ) -> ApiResult<HashMap<UserId, PresenceStatus>> {
        let url = self.url(&["presence", "batch"])?;
        let response: PresenceBatchResponse = self
            .post_json(url, &PresenceBatchRequest { user_ids: users })
            .await?;
        Ok(response.statuses)
    }

    async fn start_call(&self, conversation: &ConversationId) -> ApiResult<CallStart> {
        let url = self.url(&["calls"])?;
        self.post_json(
            url,
            &StartCallRequest {
                conversation_id: conversation,
            },
        )
        .await
    }

    async fn join_call(&self, call: &CallId) -> ApiResult<MediaParams> {
        let url = self.url(&["calls", call.as_str(), "join"])?;
        let response = self.execute(Method::POST, url, None).await?;
        decode(response).await
    }

    async fn active_calls(&self) -> ApiResult<Vec<CallSummary>> {
        let url = self.url(&["calls", "active"])?;
        let response: ActiveCallsResponse = self.get_json(url).await?;
        Ok(response.calls)
    }
}

#[async_trait]
impl PushRegistrar for HttpApiClient {
    async fn register(&self, registration: &DeviceRegistration) -> ApiResult<()> {
        let url = self.url(&["push", "subscriptions"])?;
        let body = encode(registration)?;
        self.send_no_content(Method::POST, url, Some(&body)).await
    }

    async fn unregister(&self, device: &DeviceId) -> ApiResult<()> {
        let url = self.url(&["push", "subscriptions", device.as_str()])?;
        self.send_no_content(Method::DELETE, url, None).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
