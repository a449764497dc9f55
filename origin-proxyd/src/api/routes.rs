use std::sync::Arc;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use shared::protocol::{API_REGISTER, API_VERSIONS};
use shared::types::OriginServer;
use crate::lb::{LbError, LoadBalancer};

#[derive(Clone)]
pub struct AppState {
    pub lb: Arc<dyn LoadBalancer>,
    pub cancel: CancellationToken,
}

/// Heartbeat body posted by origins.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default, rename = "server")]
    pub server_id: String,
    #[serde(default, rename = "service")]
    pub service_id: String,
    #[serde(default)]
    pub pid: String,
    #[serde(default)]
    pub rtmp: Vec<String>,
    #[serde(default)]
    pub http: Vec<String>,
    #[serde(default)]
    pub api: Vec<String>,
    #[serde(default)]
    pub srt: Vec<String>,
    #[serde(default)]
    pub rtc: Vec<String>,
}

impl RegisterRequest {
    fn missing_field(&self) -> Option<&'static str> {
        [
            ("ip", &self.ip),
            ("server", &self.server_id),
            ("service", &self.service_id),
            ("pid", &self.pid),
        ]
        .into_iter()
        .find(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
    }

    fn into_origin(self) -> OriginServer {
        OriginServer {
            ip: self.ip,
            device_id: self.device_id,
            server_id: self.server_id,
            service_id: self.service_id,
            pid: self.pid,
            rtmp: self.rtmp,
            http: self.http,
            api: self.api,
            srt: self.srt,
            rtc: self.rtc,
            updated_at: Default::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CodeResponse {
    pub code: i32,
}

#[derive(Serialize)]
pub struct VersionResponse {
    pub name: &'static str,
    pub version: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(API_REGISTER, post(register))
        .route(API_VERSIONS, get(versions))
        .with_state(state)
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<CodeResponse>, StatusCode> {
    if let Some(field) = request.missing_field() {
        tracing::warn!("Rejected origin heartbeat without {}", field);
        return Err(StatusCode::BAD_REQUEST);
    }

    state
        .lb
        .update(&state.cancel, request.into_origin())
        .await
        .map(|()| Json(CodeResponse { code: 0 }))
        .map_err(|e| {
            tracing::error!("Failed to register origin: {}", e);
            if e.is_unavailable() || matches!(e, LbError::Cancelled) {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })
}

async fn versions() -> Json<VersionResponse> {
    Json(VersionResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}
