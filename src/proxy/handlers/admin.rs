// Admin surface: pool snapshot and credential CRUD.
//
// These endpoints are unauthenticated JSON APIs intended for a local
// operator UI; everything sensitive is masked before it leaves the process.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::auth::store::StoreError;
use crate::auth::types::{AccountStatus, AuthType, CredentialConfig};
use crate::auth::usage::UsageChecker;
use crate::auth::TokenRefresher;
use crate::proxy::common::errors::{error_response, ErrorKind};
use crate::proxy::common::masking::{mask_client_id, mask_email, token_preview};
use crate::proxy::server::AppState;

fn status_text(status: AccountStatus) -> &'static str {
    match status {
        AccountStatus::Active => "available",
        AccountStatus::Exhausted => "exhausted",
        AccountStatus::Banned => "banned",
        AccountStatus::Expired => "expired",
        AccountStatus::Disabled => "disabled",
        AccountStatus::Error => "error",
    }
}

/// GET /api/tokens: masked snapshot of every stored credential.
pub async fn handle_tokens(State(state): State<AppState>) -> Response {
    let views = state.pool.inspect().await;

    let mut active_count = 0usize;
    let tokens: Vec<serde_json::Value> = views
        .iter()
        .map(|view| {
            if view.status == AccountStatus::Active {
                active_count += 1;
            }
            let preview = view
                .access_token
                .as_deref()
                .map(token_preview)
                .unwrap_or_else(|| token_preview(&view.refresh_token));

            let mut entry = json!({
                "index": view.index,
                "user_email": view.email.as_deref().map(mask_email).unwrap_or_else(|| "unknown".into()),
                "token_preview": preview,
                "auth_type": view.auth_type.to_string().to_lowercase(),
                "remaining_usage": view.available,
                "status": view.status,
                "status_text": status_text(view.status),
            });
            if let Some(expires_at) = view.expires_at {
                entry["expires_at"] = json!(expires_at.to_rfc3339());
            }
            if let Some(probed) = view.last_probe_at {
                entry["last_checked"] = json!(probed.to_rfc3339());
            }
            if let Some(reason) = &view.ban_reason {
                entry["ban_reason"] = json!(reason);
                entry["error"] = json!(reason);
            }
            if let Some(error) = &view.error {
                entry["error"] = json!(error);
            }
            if view.status == AccountStatus::Active || view.status == AccountStatus::Exhausted {
                entry["usage_limits"] = json!({
                    "total_limit": view.total_limit,
                    "current_usage": view.total_used,
                    "available": view.available,
                    "is_exceeded": view.available <= 0.0,
                });
            }
            if view.auth_type == AuthType::IdC {
                if let Some(client_id) = &view.client_id {
                    entry["client_id"] = json!(mask_client_id(client_id));
                }
            }
            entry
        })
        .collect();

    Json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "total_tokens": tokens.len(),
        "active_tokens": active_count,
        "tokens": tokens,
        "pool_stats": {
            "total_tokens": tokens.len(),
            "active_tokens": active_count,
        }
    }))
    .into_response()
}

fn validate(config: &CredentialConfig) -> Result<(), Response> {
    if config.refresh_token.is_empty() {
        return Err(error_response(ErrorKind::BadRequest, "refreshToken must not be empty"));
    }
    if config.auth_type == AuthType::IdC
        && (config.client_id.as_deref().unwrap_or("").is_empty()
            || config.client_secret.as_deref().unwrap_or("").is_empty())
    {
        return Err(error_response(
            ErrorKind::BadRequest,
            "IdC credentials require clientId and clientSecret",
        ));
    }
    Ok(())
}

fn store_error_response(e: StoreError) -> Response {
    match e {
        StoreError::NotFound(index) => {
            error_response(ErrorKind::NotFound, format!("credential {} does not exist", index))
        }
        other => {
            warn!("credential store operation failed: {}", other);
            error_response(ErrorKind::Internal, "failed to persist credentials")
        }
    }
}

/// GET /api/config. Re-reads the backing file first so edits made outside
/// this process show up.
pub async fn list_config(State(state): State<AppState>) -> Response {
    state.store.reload();
    let configs = state.store.list();
    Json(json!({ "configs": configs, "count": configs.len() })).into_response()
}

/// POST /api/config
pub async fn add_config(
    State(state): State<AppState>,
    Json(config): Json<CredentialConfig>,
) -> Response {
    if let Err(response) = validate(&config) {
        return response;
    }
    if let Err(e) = state.store.add(config) {
        return store_error_response(e);
    }
    info!("credential added");
    Json(json!({ "message": "credential added" })).into_response()
}

/// PUT /api/config/:index
pub async fn update_config(
    State(state): State<AppState>,
    Path(index): Path<usize>,
    Json(config): Json<CredentialConfig>,
) -> Response {
    if let Err(response) = validate(&config) {
        return response;
    }
    if let Err(e) = state.store.update(index, config) {
        return store_error_response(e);
    }
    info!(index, "credential updated");
    Json(json!({ "message": "credential updated" })).into_response()
}

/// DELETE /api/config/:index
pub async fn delete_config(State(state): State<AppState>, Path(index): Path<usize>) -> Response {
    if let Err(e) = state.store.delete(index) {
        return store_error_response(e);
    }
    info!(index, "credential deleted");
    Json(json!({ "message": "credential deleted" })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ImportAccountInput {
    #[serde(rename = "refreshToken", default)]
    pub refresh_token: String,
    #[serde(rename = "clientId", default)]
    pub client_id: String,
    #[serde(rename = "clientSecret", default)]
    pub client_secret: String,
}

#[derive(Debug, Serialize)]
pub struct ImportResult {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub status: &'static str,
    pub message: String,
}

/// POST /api/config/import: refresh and probe each account before saving,
/// so the operator learns immediately which entries are dead on arrival.
pub async fn import_config(
    State(state): State<AppState>,
    Json(inputs): Json<Vec<ImportAccountInput>>,
) -> Response {
    if inputs.is_empty() {
        return error_response(ErrorKind::BadRequest, "import payload is empty");
    }

    let refresher = TokenRefresher::new(state.client.clone());
    let checker = UsageChecker::new(state.client.clone());
    let total = inputs.len();
    let mut results: Vec<ImportResult> = Vec::with_capacity(total);
    let mut success = 0usize;

    for (index, input) in inputs.into_iter().enumerate() {
        if input.refresh_token.is_empty() {
            results.push(ImportResult {
                index,
                email: None,
                status: "error",
                message: "refreshToken is empty".into(),
            });
            continue;
        }

        let is_idc = !input.client_id.is_empty() && !input.client_secret.is_empty();
        let mut config = CredentialConfig {
            auth_type: if is_idc { AuthType::IdC } else { AuthType::Social },
            refresh_token: input.refresh_token,
            client_id: is_idc.then(|| input.client_id.clone()),
            client_secret: is_idc.then(|| input.client_secret.clone()),
            disabled: false,
        };

        let token = match refresher.refresh(&config).await {
            Ok(token) => token,
            Err(e) => {
                warn!(index, "import refresh failed: {}", e);
                results.push(ImportResult {
                    index,
                    email: None,
                    status: "error",
                    message: format!("token refresh failed: {}", e),
                });
                continue;
            }
        };

        let usage = checker.check(&token.access_token).await;
        let email = usage
            .usage_limits
            .as_ref()
            .map(|l| l.user_info.email.clone())
            .filter(|e| !e.is_empty());

        if usage.status == AccountStatus::Banned {
            let reason = usage.ban_reason.unwrap_or_default();
            warn!(index, reason = %reason, "imported account is banned");
            results.push(ImportResult {
                index,
                email,
                status: "banned",
                message: format!("account is banned: {}", reason),
            });
            continue;
        }
        if let Some(error) = usage.error {
            results.push(ImportResult {
                index,
                email,
                status: "error",
                message: format!("usage probe failed: {}", error),
            });
            continue;
        }

        // Keep the rotated refresh token if the provider issued one.
        config.refresh_token = token.refresh_token;

        if let Err(e) = state.store.add(config) {
            results.push(ImportResult {
                index,
                email,
                status: "error",
                message: format!("failed to save credential: {}", e),
            });
            continue;
        }

        info!(
            index,
            email = email.as_deref().unwrap_or("unknown"),
            available = usage.available,
            "account imported"
        );
        results.push(ImportResult {
            index,
            email,
            status: "success",
            message: "imported".into(),
        });
        success += 1;

        if index + 1 < total {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    (
        StatusCode::OK,
        Json(json!({
            "total": total,
            "success": success,
            "failed": total - success,
            "results": results,
        })),
    )
        .into_response()
}
