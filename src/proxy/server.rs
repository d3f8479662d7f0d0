// Router assembly and server lifecycle.

use std::sync::Arc;

use axum::{
    extract::State,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::auth::{CredentialStore, TokenPool};
use crate::proxy::common::errors::{error_response, ErrorKind};
use crate::proxy::common::model_mapping::model_catalog;
use crate::proxy::handlers::{admin, completions, messages};
use crate::proxy::middleware::{client_auth, request_id};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<CredentialStore>,
    pub pool: Arc<TokenPool>,
    pub client: reqwest::Client,
    pub client_token: Arc<String>,
}

async fn handle_models(State(_state): State<AppState>) -> Response {
    Json(json!({
        "object": "list",
        "data": model_catalog(),
    }))
    .into_response()
}

async fn handle_not_found() -> Response {
    error_response(ErrorKind::NotFound, "unknown endpoint")
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Bearer auth applies to the /v1 surface only; the admin API is local.
    let v1 = Router::new()
        .route("/v1/models", get(handle_models))
        .route("/v1/messages", post(messages::handle_messages))
        .route("/v1/messages/count_tokens", post(messages::handle_count_tokens))
        .route("/v1/chat/completions", post(completions::handle_chat_completions))
        .route_layer(axum_middleware::from_fn_with_state(state.clone(), client_auth));

    let api = Router::new()
        .route("/api/tokens", get(admin::handle_tokens))
        .route("/api/config", get(admin::list_config).post(admin::add_config))
        .route(
            "/api/config/:index",
            put(admin::update_config).delete(admin::delete_config),
        )
        .route("/api/config/import", post(admin::import_config));

    Router::new()
        .merge(v1)
        .merge(api)
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn(request_id))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until ctrl-c. In-flight requests finish; the listener
/// stops accepting immediately.
pub async fn run(port: u16, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    info!("endpoints:");
    info!("  GET  /v1/models                 - model catalog");
    info!("  POST /v1/messages               - Anthropic Messages API");
    info!("  POST /v1/messages/count_tokens  - token counting");
    info!("  POST /v1/chat/completions       - OpenAI compatible API");
    info!("  GET  /api/tokens                - credential pool snapshot");
    info!("  *    /api/config                - credential management");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("failed to install ctrl-c handler");
            }
        })
        .await
}
