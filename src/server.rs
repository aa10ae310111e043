use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, FromRequestParts, State, rejection::JsonRejection},
    http::request::Parts,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::AppError;
use crate::handler::GenerateService;

pub type AppState = Arc<GenerateService>;

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub prompt: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub result: String,
}

/// Quota key for the caller: first `X-Forwarded-For` hop, else the peer address.
/// The header is client-controlled and therefore spoofable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey(pub String);

impl<S> FromRequestParts<S> for ClientKey
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(forwarded) = parts.headers.get("x-forwarded-for")
            && let Ok(value) = forwarded.to_str()
            && let Some(first) = value.split(',').next()
            && !first.trim().is_empty()
        {
            return Ok(Self(first.trim().to_string()));
        }

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Self(peer))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/generate", post(generate))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn generate(
    State(service): State<AppState>,
    ClientKey(client_key): ClientKey,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Json<GenerateResponse>, AppError> {
    let Json(body) = body.map_err(|rejection| AppError::InvalidBody(rejection.body_text()))?;
    let result = service.handle(body.prompt.as_deref(), &client_key).await?;
    Ok(Json(GenerateResponse {
        result: result.result_url,
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
