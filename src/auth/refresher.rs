// Token refresh against the provider endpoints.
//
// Social credentials refresh through the desktop auth service, IdC
// credentials through AWS SSO OIDC. No internal retry: the pool decides
// retry policy.

use chrono::{Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::info;

use super::types::{AuthError, AuthType, CredentialConfig, TokenInfo};

pub const SOCIAL_REFRESH_URL: &str = "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken";
pub const IDC_REFRESH_URL: &str = "https://oidc.us-east-1.amazonaws.com/token";

/// Seconds shaved off the advertised lifetime so we never present a token
/// that dies mid-flight.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
struct RefreshResponse {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    #[serde(rename = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(rename = "expiresIn")]
    expires_in: Option<i64>,
}

#[derive(Clone)]
pub struct TokenRefresher {
    client: Client,
    social_url: String,
    idc_url: String,
}

impl TokenRefresher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            social_url: SOCIAL_REFRESH_URL.to_string(),
            idc_url: IDC_REFRESH_URL.to_string(),
        }
    }

    /// Point both refresh endpoints somewhere else (regional override, local fixture).
    pub fn with_endpoints(client: Client, social_url: String, idc_url: String) -> Self {
        Self {
            client,
            social_url,
            idc_url,
        }
    }

    /// Exchange the credential's refresh token for a live access token.
    /// A rotated refresh token, when present in the response, replaces the
    /// old one in the returned `TokenInfo`; persisting it is the caller's job.
    pub async fn refresh(&self, cred: &CredentialConfig) -> Result<TokenInfo, AuthError> {
        if cred.refresh_token.is_empty() {
            return Err(AuthError::MissingRefreshToken);
        }

        let (url, payload) = match cred.auth_type {
            AuthType::Social => (
                &self.social_url,
                serde_json::json!({ "refreshToken": cred.refresh_token }),
            ),
            AuthType::IdC => {
                let (Some(client_id), Some(client_secret)) =
                    (cred.client_id.as_deref(), cred.client_secret.as_deref())
                else {
                    return Err(AuthError::MissingClientCredentials);
                };
                (
                    &self.idc_url,
                    serde_json::json!({
                        "grantType": "refresh_token",
                        "refreshToken": cred.refresh_token,
                        "clientId": client_id,
                        "clientSecret": client_secret,
                    }),
                )
            }
        };

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::RefreshRejected {
                status: status.as_u16(),
                body,
            });
        }

        let data: RefreshResponse = response.json().await?;
        let access_token = data.access_token.ok_or(AuthError::MissingAccessToken)?;
        let expires_in = data.expires_in.unwrap_or(3600);
        let expires_at = Utc::now() + Duration::seconds(expires_in - EXPIRY_SKEW_SECS);

        info!(
            auth_type = %cred.auth_type,
            rotated = data.refresh_token.is_some(),
            expires_at = %expires_at.to_rfc3339(),
            "access token refreshed"
        );

        Ok(TokenInfo {
            access_token,
            refresh_token: data.refresh_token.unwrap_or_else(|| cred.refresh_token.clone()),
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn social(rt: &str) -> CredentialConfig {
        CredentialConfig {
            auth_type: AuthType::Social,
            refresh_token: rt.into(),
            client_id: None,
            client_secret: None,
            disabled: false,
        }
    }

    #[tokio::test]
    async fn test_refresh_empty_token_rejected() {
        let refresher = TokenRefresher::new(Client::new());
        let err = refresher.refresh(&social("")).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingRefreshToken));
    }

    #[tokio::test]
    async fn test_refresh_idc_without_client_credentials() {
        let refresher = TokenRefresher::new(Client::new());
        let cred = CredentialConfig {
            auth_type: AuthType::IdC,
            refresh_token: "rt".into(),
            client_id: Some("cid".into()),
            client_secret: None,
            disabled: false,
        };
        let err = refresher.refresh(&cred).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingClientCredentials));
    }

    #[test]
    fn test_refresh_response_deserialize() {
        let json = r#"{"accessToken":"at","refreshToken":"rt2","expiresIn":7200}"#;
        let resp: RefreshResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.access_token.as_deref(), Some("at"));
        assert_eq!(resp.refresh_token.as_deref(), Some("rt2"));
        assert_eq!(resp.expires_in, Some(7200));
    }

    #[test]
    fn test_refresh_response_partial() {
        let resp: RefreshResponse = serde_json::from_str(r#"{"accessToken":"at"}"#).unwrap();
        assert!(resp.refresh_token.is_none());
        assert!(resp.expires_in.is_none());
    }
}
