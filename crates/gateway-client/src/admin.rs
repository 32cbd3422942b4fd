//! Administrator endpoints. The gateway enforces the role; the client sends
//! these calls with whatever credential is stored.

use serde::{Deserialize, Serialize};

use crate::api::path_segment;
use crate::client::GatewayClient;
use crate::error::ClientError;
use crate::transport::{HttpMethod, RequestOptions, decode_json_response};
use crate::types::{
    ApiApplication, ApplicationReview, ModelPerformance, ModelServerSettings, SecurityEvent,
    SystemMetrics, UserProfile, UserUpdate,
};

pub const ADMIN_USERS_PATH: &str = "/admin/users";
pub const ADMIN_SECURITY_EVENTS_PATH: &str = "/admin/security-events";
pub const ADMIN_METRICS_PATH: &str = "/admin/metrics";
pub const ADMIN_MODEL_PERFORMANCE_PATH: &str = "/admin/models/performance";
pub const ADMIN_INSIGHTS_PATH: &str = "/admin/insights";
pub const ADMIN_APPLICATIONS_PATH: &str = "/admin/applications";
pub const ADMIN_MODEL_SERVER_PATH: &str = "/admin/ollama-settings";

pub const INSIGHTS_UNAVAILABLE_TEXT: &str = "Unable to generate insights.";

#[derive(Serialize)]
struct InsightsRequest<'a, S: ?Sized> {
    stats: &'a S,
}

#[derive(Debug, Deserialize)]
struct InsightsResponse {
    #[serde(default)]
    insights: String,
}

impl GatewayClient {
    pub async fn admin_users(&self) -> Result<Vec<UserProfile>, ClientError> {
        self.transport().get_json(ADMIN_USERS_PATH).await
    }

    pub async fn admin_update_user(
        &self,
        user_id: &str,
        update: &UserUpdate,
    ) -> Result<UserProfile, ClientError> {
        let path = format!("{ADMIN_USERS_PATH}/{}", path_segment(user_id)?);
        self.transport()
            .send_json(HttpMethod::Patch, &path, update)
            .await
    }

    pub async fn admin_security_events(&self) -> Result<Vec<SecurityEvent>, ClientError> {
        self.transport().get_json(ADMIN_SECURITY_EVENTS_PATH).await
    }

    pub async fn admin_metrics(&self) -> Result<SystemMetrics, ClientError> {
        self.transport().get_json(ADMIN_METRICS_PATH).await
    }

    pub async fn admin_model_performance(&self) -> Result<Vec<ModelPerformance>, ClientError> {
        self.transport().get_json(ADMIN_MODEL_PERFORMANCE_PATH).await
    }

    /// Generated commentary on `stats`. A rejected request yields
    /// [`INSIGHTS_UNAVAILABLE_TEXT`]; transport and auth failures still error.
    pub async fn admin_insights<S>(&self, stats: &S) -> Result<String, ClientError>
    where
        S: Serialize + ?Sized,
    {
        let options = RequestOptions::json(HttpMethod::Post, &InsightsRequest { stats })?;
        let response = self.transport().request(ADMIN_INSIGHTS_PATH, options).await?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), "insights unavailable");
            return Ok(INSIGHTS_UNAVAILABLE_TEXT.to_string());
        }
        let reply: InsightsResponse = decode_json_response(response).await?;
        Ok(reply.insights)
    }

    pub async fn admin_applications(&self) -> Result<Vec<ApiApplication>, ClientError> {
        self.transport().get_json(ADMIN_APPLICATIONS_PATH).await
    }

    pub async fn admin_review_application(
        &self,
        application_id: &str,
        review: &ApplicationReview,
    ) -> Result<ApiApplication, ClientError> {
        let path = format!(
            "{ADMIN_APPLICATIONS_PATH}/{}",
            path_segment(application_id)?
        );
        self.transport()
            .send_json(HttpMethod::Patch, &path, review)
            .await
    }

    pub async fn admin_model_server_settings(&self) -> Result<ModelServerSettings, ClientError> {
        self.transport().get_json(ADMIN_MODEL_SERVER_PATH).await
    }

    pub async fn admin_update_model_server(
        &self,
        base_url: &str,
    ) -> Result<ModelServerSettings, ClientError> {
        let base_url = base_url.trim();
        if base_url.is_empty() {
            return Err(ClientError::InvalidInput("model server URL must not be empty"));
        }
        self.transport()
            .send_json(
                HttpMethod::Patch,
                ADMIN_MODEL_SERVER_PATH,
                &ModelServerSettings {
                    ollama_base_url: base_url.to_string(),
                },
            )
            .await
    }
}
