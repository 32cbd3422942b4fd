use std::sync::Arc;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::storage::StorageError;

/// Text shown to a user in place of a failed chat reply.
pub const STREAM_FAILURE_MESSAGE: &str =
    "Error: could not reach the model server. Please try again shortly.";

/// Errors surfaced by the gateway client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No base URL was configured.
    #[error("gateway_base_url_missing")]
    BaseUrlMissing,

    /// The base URL is not an http(s) URL with a host.
    #[error("gateway_base_url_invalid")]
    InvalidBaseUrl,

    #[error("gateway_invalid_path")]
    InvalidPath,

    /// Input rejected before any request was sent.
    #[error("gateway_invalid_input:{0}")]
    InvalidInput(&'static str),

    /// The credential was rejected twice in a row. The session has been cleared.
    #[error("Unauthorized")]
    Unauthorized,

    /// The server answered with a non-success status.
    #[error("gateway_http_{status}:{detail}")]
    Rejected { status: StatusCode, detail: String },

    /// The request never produced a response.
    #[error("gateway_request_failed:{message}")]
    Transport { message: String },

    /// The response body could not be read.
    #[error("gateway_read_failed:{message}")]
    Read { message: String },

    #[error("gateway_json_decode_failed:{message}")]
    Decode { message: String },

    /// The caller cancelled the operation.
    #[error("gateway_request_cancelled")]
    Cancelled,

    #[error("gateway_storage_failed:{0}")]
    Storage(#[from] StorageError),
}

/// Cloneable form handed to every waiter of a shared operation.
pub type SharedClientError = Arc<ClientError>;

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// HTTP status carried by a rejection, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            Self::Unauthorized => Some(StatusCode::UNAUTHORIZED),
            _ => None,
        }
    }

    /// Message suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Rejected { detail, .. } => detail.clone(),
            Self::Unauthorized => "Your session has expired. Please sign in again.".to_string(),
            Self::Transport { .. } | Self::Read { .. } | Self::Decode { .. } => {
                STREAM_FAILURE_MESSAGE.to_string()
            }
            Self::Cancelled => "Request cancelled.".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct DetailBody {
    detail: serde_json::Value,
}

/// Maps a non-success response body to [`ClientError::Rejected`], preferring
/// the server's `detail` field over the raw body text.
pub fn format_http_error(status: StatusCode, body: &[u8]) -> ClientError {
    let detail = detail_from_body(body)
        .or_else(|| non_empty_string(String::from_utf8_lossy(body).to_string()))
        .unwrap_or_else(|| "<empty>".to_string());
    ClientError::Rejected { status, detail }
}

/// Same as [`format_http_error`] but with a caller-chosen message when the
/// body carries no `detail`.
pub(crate) fn format_http_error_or(
    status: StatusCode,
    body: &[u8],
    fallback: &str,
) -> ClientError {
    let detail = detail_from_body(body).unwrap_or_else(|| fallback.to_string());
    ClientError::Rejected { status, detail }
}

fn detail_from_body(body: &[u8]) -> Option<String> {
    let parsed = serde_json::from_slice::<DetailBody>(body).ok()?;
    match parsed.detail {
        serde_json::Value::Null => None,
        serde_json::Value::String(text) => non_empty_string(text),
        other => Some(other.to_string()),
    }
}

pub(crate) fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_mapping_preserves_shape() {
        let error = format_http_error(StatusCode::BAD_GATEWAY, b" gateway failed ");
        assert_eq!(
            error.to_string(),
            "gateway_http_502 Bad Gateway:gateway failed"
        );

        let empty_body = format_http_error(StatusCode::SERVICE_UNAVAILABLE, b" ");
        assert_eq!(
            empty_body.to_string(),
            "gateway_http_503 Service Unavailable:<empty>"
        );
    }

    #[test]
    fn http_error_prefers_detail_field() {
        let error = format_http_error(
            StatusCode::BAD_REQUEST,
            br#"{"detail":"Email already registered"}"#,
        );
        assert_eq!(error.status(), Some(StatusCode::BAD_REQUEST));
        assert_eq!(error.user_message(), "Email already registered");
    }

    #[test]
    fn structured_detail_is_rendered_as_json() {
        let error = format_http_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            br#"{"detail":[{"loc":["body","email"],"msg":"field required"}]}"#,
        );
        let ClientError::Rejected { detail, .. } = error else {
            unreachable!("format_http_error always rejects");
        };
        assert!(detail.contains("field required"));
    }

    #[test]
    fn fallback_message_is_used_without_detail() {
        let error = format_http_error_or(StatusCode::UNAUTHORIZED, b"nope", "Login failed");
        assert_eq!(error.user_message(), "Login failed");

        let error = format_http_error_or(
            StatusCode::UNAUTHORIZED,
            br#"{"detail":"Invalid credentials"}"#,
            "Login failed",
        );
        assert_eq!(error.user_message(), "Invalid credentials");
    }

    #[test]
    fn transport_failures_map_to_friendly_message() {
        let error = ClientError::Transport {
            message: "connection refused".to_string(),
        };
        assert_eq!(error.user_message(), STREAM_FAILURE_MESSAGE);
        assert!(ClientError::Unauthorized.is_unauthorized());
        assert!(ClientError::Cancelled.is_cancelled());
    }
}
