//! Authenticated request transport.
//!
//! Every call resolves the current credential, attaches it as a bearer token
//! and retries exactly once when the gateway reports a transient upstream
//! failure or rejects the credential. A credential rejected twice ends the
//! session.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::{ClientError, format_http_error};
use crate::identity::IdentityStore;

pub const API_PREFIX: &str = "/api";
const SESSION_EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: HttpMethod,
    pub body: Option<serde_json::Value>,
    /// Extra headers; a `content-type` entry replaces the JSON default.
    pub headers: Vec<(String, String)>,
    pub cancel: Option<CancellationToken>,
    /// Skips the per-request timeout so a streamed body can stay open.
    pub long_lived: bool,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn delete() -> Self {
        Self {
            method: HttpMethod::Delete,
            ..Self::default()
        }
    }

    pub fn method(method: HttpMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn json<T>(method: HttpMethod, body: &T) -> Result<Self, ClientError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_value(body).map_err(|error| ClientError::Decode {
            message: error.to_string(),
        })?;
        Ok(Self {
            method,
            body: Some(body),
            ..Self::default()
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn long_lived(mut self) -> Self {
        self.long_lived = true;
        self
    }
}

/// Published when the gateway rejects the stored credential for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Expired,
}

/// Statuses answered with a single delayed retry.
pub fn should_retry(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

#[derive(Debug, Clone)]
pub struct AuthenticatedTransport {
    base_url: String,
    http: reqwest::Client,
    identity: Arc<IdentityStore>,
    retry_backoff: Duration,
    request_timeout: Duration,
    events: broadcast::Sender<SessionEvent>,
}

impl AuthenticatedTransport {
    pub fn new(config: &GatewayConfig, identity: Arc<IdentityStore>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|error| ClientError::Transport {
                message: error.to_string(),
            })?;
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Ok(Self {
            base_url: crate::config::normalize_base_url(&config.base_url)?,
            http,
            identity,
            retry_backoff: config.retry_backoff,
            request_timeout: config.request_timeout,
            events,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn identity(&self) -> &Arc<IdentityStore> {
        &self.identity
    }

    /// Receives [`SessionEvent::Expired`] whenever a session is torn down.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Absolute URL for an API path such as `/auth/me`.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}{}", self.base_url, API_PREFIX, trimmed))
        } else {
            Some(format!("{}{}/{}", self.base_url, API_PREFIX, trimmed))
        }
    }

    /// Sends an authenticated request and returns the response as-is,
    /// including non-success statuses.
    pub async fn request(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<reqwest::Response, ClientError> {
        let url = self.endpoint(path).ok_or(ClientError::InvalidPath)?;
        let headers = self.build_headers(&options, self.identity.get_token().as_deref())?;

        let response = self.send_attempt(&url, &headers, &options).await?;
        let status = response.status();
        if !should_retry(status) {
            return Ok(response);
        }

        tracing::warn!(
            path,
            status = status.as_u16(),
            backoff_ms = u64::try_from(self.retry_backoff.as_millis()).unwrap_or(u64::MAX),
            "gateway request failed, retrying once"
        );
        drop(response);
        cancellable(options.cancel.as_ref(), tokio::time::sleep(self.retry_backoff)).await?;

        let retried = self.send_attempt(&url, &headers, &options).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            self.expire_session(path);
            return Err(ClientError::Unauthorized);
        }
        Ok(retried)
    }

    /// Single attempt without credential or retry, for sign-in endpoints.
    pub async fn request_anonymous(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<reqwest::Response, ClientError> {
        let url = self.endpoint(path).ok_or(ClientError::InvalidPath)?;
        let headers = self.build_headers(&options, None)?;
        self.send_attempt(&url, &headers, &options).await
    }

    pub async fn get_json<T>(&self, path: &str) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
    {
        let response = self.request(path, RequestOptions::get()).await?;
        decode_json_response(response).await
    }

    pub async fn send_json<Req, Res>(
        &self,
        method: HttpMethod,
        path: &str,
        payload: &Req,
    ) -> Result<Res, ClientError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let response = self
            .request(path, RequestOptions::json(method, payload)?)
            .await?;
        decode_json_response(response).await
    }

    /// Sends a request whose success carries no body worth decoding.
    pub async fn send_expecting_success(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<(), ClientError> {
        let response = self.request(path, options).await?;
        ensure_success(response).await.map(drop)
    }

    fn build_headers(
        &self,
        options: &RequestOptions,
        token: Option<&str>,
    ) -> Result<HeaderMap, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| ClientError::InvalidInput("header name"))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| ClientError::InvalidInput("header value"))?;
            headers.insert(name, value);
        }
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ClientError::InvalidInput("credential"))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn send_attempt(
        &self,
        url: &str,
        headers: &HeaderMap,
        options: &RequestOptions,
    ) -> Result<reqwest::Response, ClientError> {
        let request_id = format!("req_{}", Uuid::new_v4().simple());
        let mut request = self
            .http
            .request(options.method.as_reqwest(), url)
            .headers(headers.clone())
            .header("x-request-id", request_id.as_str());
        if !options.long_lived {
            request = request.timeout(self.request_timeout);
        }
        if let Some(body) = &options.body {
            let encoded = serde_json::to_vec(body).map_err(|error| ClientError::Decode {
                message: error.to_string(),
            })?;
            request = request.body(encoded);
        }

        tracing::debug!(method = ?options.method, url, request_id = %request_id, "gateway request");
        cancellable(options.cancel.as_ref(), request.send())
            .await?
            .map_err(|error| ClientError::Transport {
                message: error.to_string(),
            })
    }

    fn expire_session(&self, path: &str) {
        tracing::warn!(path, "credential rejected after retry, clearing session");
        self.identity.clear_session();
        // No subscribers is fine; the session is already cleared.
        let _ = self.events.send(SessionEvent::Expired);
    }
}

/// Runs `future` unless `cancel` fires first.
pub(crate) async fn cancellable<F>(
    cancel: Option<&CancellationToken>,
    future: F,
) -> Result<F::Output, ClientError>
where
    F: Future,
{
    match cancel {
        Some(token) => tokio::select! {
            biased;
            () = token.cancelled() => Err(ClientError::Cancelled),
            output = future => Ok(output),
        },
        None => Ok(future.await),
    }
}

/// Passes 2xx responses through and turns anything else into
/// [`ClientError::Rejected`].
pub async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let bytes = response.bytes().await.map_err(|error| ClientError::Read {
        message: error.to_string(),
    })?;
    Err(format_http_error(status, &bytes))
}

pub async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, ClientError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    let bytes = response.bytes().await.map_err(|error| ClientError::Read {
        message: error.to_string(),
    })?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| ClientError::Decode {
        message: error.to_string(),
    })
}
