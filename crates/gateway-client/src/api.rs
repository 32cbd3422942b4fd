//! Typed gateway resources reached through the authenticated transport.

use serde::Deserialize;

use crate::client::GatewayClient;
use crate::error::ClientError;
use crate::stream::{CHAT_PATH, EMPTY_REPLY_TEXT, whole_message_content};
use crate::transport::{HttpMethod, RequestOptions, decode_json_response};
use crate::types::{
    ApiApplication, ApiKeyEntry, ApplicationRequest, ChatRequest, CreatedApiKey, DashboardData,
    ModelInfo, NewApiKey, QuotaData, RefreshedApiKey, RegeneratedApiKey, RevealedApiKey,
    SettingsData, SettingsPatch,
};

pub const DASHBOARD_PATH: &str = "/user/dashboard";
pub const QUOTA_PATH: &str = "/user/quota";
pub const KEYS_PATH: &str = "/keys";
pub const MODELS_PATH: &str = "/v1/models";
pub const MODEL_SHOW_PATH: &str = "/v1/models/show";
pub const HEALTH_PATH: &str = "/v1/health";
pub const APPLICATIONS_PATH: &str = "/applications";
pub const SETTINGS_PATH: &str = "/settings";
pub const API_KEY_REFRESH_PATH: &str = "/settings/api-key/refresh";
pub const WHITELIST_PATH: &str = "/settings/whitelist";

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    status: String,
}

impl GatewayClient {
    pub fn key_path(key_id: &str) -> String {
        format!("{KEYS_PATH}/{}", key_id.trim())
    }

    pub fn key_regenerate_path(key_id: &str) -> String {
        format!("{}/regenerate", Self::key_path(key_id))
    }

    pub fn key_reveal_path(key_id: &str) -> String {
        format!("{}/reveal", Self::key_path(key_id))
    }

    pub async fn dashboard(&self) -> Result<DashboardData, ClientError> {
        self.transport().get_json(DASHBOARD_PATH).await
    }

    pub async fn quota(&self) -> Result<QuotaData, ClientError> {
        self.transport().get_json(QUOTA_PATH).await
    }

    pub async fn list_keys(&self) -> Result<Vec<ApiKeyEntry>, ClientError> {
        self.transport().get_json(KEYS_PATH).await
    }

    pub async fn create_key(&self, request: &NewApiKey) -> Result<CreatedApiKey, ClientError> {
        if request.name.trim().is_empty() {
            return Err(ClientError::InvalidInput("key name must not be empty"));
        }
        self.transport()
            .send_json(HttpMethod::Post, KEYS_PATH, request)
            .await
    }

    pub async fn delete_key(&self, key_id: &str) -> Result<(), ClientError> {
        let path = checked_key_path(key_id, Self::key_path)?;
        self.transport()
            .send_expecting_success(&path, RequestOptions::delete())
            .await
    }

    pub async fn regenerate_key(&self, key_id: &str) -> Result<RegeneratedApiKey, ClientError> {
        let path = checked_key_path(key_id, Self::key_regenerate_path)?;
        let response = self
            .transport()
            .request(&path, RequestOptions::method(HttpMethod::Post))
            .await?;
        decode_json_response(response).await
    }

    pub async fn reveal_key(&self, key_id: &str) -> Result<RevealedApiKey, ClientError> {
        let path = checked_key_path(key_id, Self::key_reveal_path)?;
        self.transport().get_json(&path).await
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ClientError> {
        self.transport().get_json(MODELS_PATH).await
    }

    /// Raw model details as reported by the model server.
    pub async fn show_model(&self, name: &str) -> Result<serde_json::Value, ClientError> {
        self.transport()
            .send_json(
                HttpMethod::Post,
                MODEL_SHOW_PATH,
                &serde_json::json!({ "name": name }),
            )
            .await
    }

    /// `true` only when the gateway reports `{"status": "ok"}`. Every failure,
    /// including a dead network, reads as unhealthy.
    pub async fn health(&self) -> bool {
        match self.transport().get_json::<HealthResponse>(HEALTH_PATH).await {
            Ok(health) => health.status == "ok",
            Err(error) => {
                tracing::debug!(error = %error, "health check failed");
                false
            }
        }
    }

    pub async fn create_application(
        &self,
        request: &ApplicationRequest,
    ) -> Result<ApiApplication, ClientError> {
        self.transport()
            .send_json(HttpMethod::Post, APPLICATIONS_PATH, request)
            .await
    }

    pub async fn list_applications(&self) -> Result<Vec<ApiApplication>, ClientError> {
        self.transport().get_json(APPLICATIONS_PATH).await
    }

    pub async fn settings(&self) -> Result<SettingsData, ClientError> {
        self.transport().get_json(SETTINGS_PATH).await
    }

    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<(), ClientError> {
        let options = RequestOptions::json(HttpMethod::Patch, patch)?;
        self.transport()
            .send_expecting_success(SETTINGS_PATH, options)
            .await
    }

    /// Replaces the account-level API key.
    pub async fn refresh_api_key(&self) -> Result<RefreshedApiKey, ClientError> {
        let response = self
            .transport()
            .request(API_KEY_REFRESH_PATH, RequestOptions::method(HttpMethod::Post))
            .await?;
        decode_json_response(response).await
    }

    pub async fn update_whitelist(&self, ip_whitelist: &str) -> Result<(), ClientError> {
        let options = RequestOptions::json(
            HttpMethod::Patch,
            &serde_json::json!({ "ipWhitelist": ip_whitelist.trim() }),
        )?;
        self.transport()
            .send_expecting_success(WHITELIST_PATH, options)
            .await
    }

    /// Non-streaming chat: one request, one complete reply.
    pub async fn chat(&self, request: &ChatRequest) -> Result<String, ClientError> {
        let mut body = request.clone();
        body.stream = None;
        let reply: serde_json::Value = self
            .transport()
            .send_json(HttpMethod::Post, CHAT_PATH, &body)
            .await?;
        let text = whole_message_content(&reply)
            .filter(|text| !text.is_empty())
            .unwrap_or(EMPTY_REPLY_TEXT)
            .to_string();
        self.identity().invalidate();
        Ok(text)
    }
}

/// Rejects ids that would escape their path segment.
pub(crate) fn path_segment(id: &str) -> Result<&str, ClientError> {
    let id = id.trim();
    if id.is_empty() || id.contains('/') {
        return Err(ClientError::InvalidInput("id must be a single path segment"));
    }
    Ok(id)
}

fn checked_key_path(key_id: &str, build: fn(&str) -> String) -> Result<String, ClientError> {
    path_segment(key_id).map(build)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_path_helpers_are_deterministic() {
        assert_eq!(GatewayClient::key_path("k1"), "/keys/k1");
        assert_eq!(GatewayClient::key_regenerate_path("k1"), "/keys/k1/regenerate");
        assert_eq!(GatewayClient::key_reveal_path(" k1 "), "/keys/k1/reveal");
    }

    #[test]
    fn key_ids_must_be_single_segments() {
        assert!(checked_key_path("k1", GatewayClient::key_path).is_ok());
        assert!(matches!(
            checked_key_path("../admin", GatewayClient::key_path),
            Err(ClientError::InvalidInput(_))
        ));
        assert!(matches!(
            checked_key_path("  ", GatewayClient::key_path),
            Err(ClientError::InvalidInput(_))
        ));
    }
}
