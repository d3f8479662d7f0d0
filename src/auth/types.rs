use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Authentication mechanism of an upstream credential.
///
/// - `Social`: consumer login, refreshed against the desktop auth endpoint
/// - `IdC`: AWS Identity Center, refreshed against the SSO OIDC endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
    Social,
    IdC,
}

impl Default for AuthType {
    fn default() -> Self {
        AuthType::Social
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthType::Social => write!(f, "Social"),
            AuthType::IdC => write!(f, "IdC"),
        }
    }
}

/// One stored upstream credential (camelCase on disk and over the admin API).
///
/// `IdC` records additionally require `client_id` and `client_secret`;
/// records failing that rule are kept by CRUD but excluded from runtime use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(rename = "auth", default)]
    pub auth_type: AuthType,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "clientSecret", default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

impl CredentialConfig {
    /// Whether this record can be used to serve traffic.
    pub fn is_runtime_usable(&self) -> bool {
        if self.disabled || self.refresh_token.is_empty() {
            return false;
        }
        match self.auth_type {
            AuthType::Social => true,
            AuthType::IdC => {
                self.client_id.as_deref().is_some_and(|s| !s.is_empty())
                    && self.client_secret.as_deref().is_some_and(|s| !s.is_empty())
            }
        }
    }
}

/// How long before the hard expiry a token is considered due for refresh.
pub const TOKEN_REFRESH_THRESHOLD_SECS: i64 = 300;

/// A live access token derived from a credential.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenInfo {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn is_expiring_soon(&self) -> bool {
        Utc::now() >= self.expires_at - Duration::seconds(TOKEN_REFRESH_THRESHOLD_SECS)
    }
}

/// Derived account status, ordered by classification priority:
/// disabled > expired > banned > error > exhausted > active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Exhausted,
    Banned,
    Expired,
    Disabled,
    Error,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Exhausted => "exhausted",
            AccountStatus::Banned => "banned",
            AccountStatus::Expired => "expired",
            AccountStatus::Disabled => "disabled",
            AccountStatus::Error => "error",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while refreshing or probing credentials.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("refresh token is not set")]
    MissingRefreshToken,

    #[error("IdC credential is missing clientId or clientSecret")]
    MissingClientCredentials,

    #[error("refresh response does not contain accessToken")]
    MissingAccessToken,

    #[error("refresh rejected: {status} - {body}")]
    RefreshRejected { status: u16, body: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
