// Usage-limit probing against the upstream getUsageLimits endpoint.
//
// The prober reports, never mutates: it classifies the account into
// active / exhausted / banned / error and computes remaining quota over
// the CREDIT resource with decimal precision.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::AccountStatus;

pub const USAGE_LIMITS_URL: &str =
    "https://codewhisperer.us-east-1.amazonaws.com/getUsageLimits";

const USAGE_USER_AGENT: &str =
    "aws-sdk-js/1.0.0 ua/2.1 os/linux lang/js md/nodejs#20.16.0 api/codewhispererruntime#1.0.0 m/E";

/// Usage-limit response, trimmed to the fields the relay consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageLimits {
    #[serde(rename = "usageBreakdownList")]
    pub usage_breakdown_list: Vec<UsageBreakdown>,
    #[serde(rename = "userInfo")]
    pub user_info: UserInfo,
    #[serde(rename = "daysUntilReset")]
    pub days_until_reset: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageBreakdown {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    #[serde(rename = "usageLimitWithPrecision")]
    pub usage_limit: f64,
    #[serde(rename = "currentUsageWithPrecision")]
    pub current_usage: f64,
    #[serde(rename = "freeTrialInfo")]
    pub free_trial_info: Option<FreeTrialInfo>,
    pub bonuses: Vec<BonusInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FreeTrialInfo {
    #[serde(rename = "freeTrialStatus")]
    pub status: String,
    #[serde(rename = "usageLimitWithPrecision")]
    pub usage_limit: f64,
    #[serde(rename = "currentUsageWithPrecision")]
    pub current_usage: f64,
    #[serde(rename = "freeTrialExpiry")]
    pub expiry: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BonusInfo {
    #[serde(rename = "usageLimit")]
    pub usage_limit: f64,
    #[serde(rename = "currentUsage")]
    pub current_usage: f64,
    #[serde(rename = "expiresAt")]
    pub expires_at: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInfo {
    pub email: String,
    #[serde(rename = "userId")]
    pub user_id: String,
}

/// Outcome of one probe.
#[derive(Debug, Clone)]
pub struct UsageCheckResult {
    pub status: AccountStatus,
    pub usage_limits: Option<UsageLimits>,
    pub available: f64,
    pub total_limit: f64,
    pub total_used: f64,
    pub ban_reason: Option<String>,
    pub error: Option<String>,
}

impl UsageCheckResult {
    fn error(message: String) -> Self {
        Self {
            status: AccountStatus::Error,
            usage_limits: None,
            available: 0.0,
            total_limit: 0.0,
            total_used: 0.0,
            ban_reason: None,
            error: Some(message),
        }
    }
}

/// Sum limit and usage over the CREDIT resource: base quota, the free trial
/// while ACTIVE, and every bonus. Available is clamped at zero.
pub fn credit_totals(limits: &UsageLimits) -> (f64, f64, f64) {
    for breakdown in &limits.usage_breakdown_list {
        if breakdown.resource_type != "CREDIT" {
            continue;
        }
        let mut total_limit = breakdown.usage_limit;
        let mut total_used = breakdown.current_usage;

        if let Some(trial) = &breakdown.free_trial_info {
            if trial.status == "ACTIVE" {
                total_limit += trial.usage_limit;
                total_used += trial.current_usage;
            }
        }
        for bonus in &breakdown.bonuses {
            total_limit += bonus.usage_limit;
            total_used += bonus.current_usage;
        }

        let available = (total_limit - total_used).max(0.0);
        return (total_limit, total_used, available);
    }
    (0.0, 0.0, 0.0)
}

#[derive(Clone)]
pub struct UsageChecker {
    client: Client,
    url: String,
}

impl UsageChecker {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            url: USAGE_LIMITS_URL.to_string(),
        }
    }

    pub fn with_url(client: Client, url: String) -> Self {
        Self { client, url }
    }

    pub async fn check(&self, access_token: &str) -> UsageCheckResult {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("isEmailRequired", "true"),
                ("origin", "AI_EDITOR"),
                ("resourceType", "AGENTIC_REQUEST"),
            ])
            .header("Authorization", format!("Bearer {}", access_token))
            .header("User-Agent", USAGE_USER_AGENT)
            .header("amz-sdk-invocation-id", uuid::Uuid::new_v4().to_string())
            .header("amz-sdk-request", "attempt=1; max=1")
            .header("Connection", "close")
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return UsageCheckResult::error(format!("usage request failed: {}", e)),
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => return UsageCheckResult::error(format!("usage body read failed: {}", e)),
        };

        if !status.is_success() {
            // A structured rejection carrying `reason` means the account is banned.
            if let Ok(err_body) = serde_json::from_slice::<serde_json::Value>(&body) {
                if let Some(reason) = err_body.get("reason").and_then(|v| v.as_str()) {
                    warn!(status = status.as_u16(), reason, "account banned by upstream");
                    return UsageCheckResult {
                        status: AccountStatus::Banned,
                        usage_limits: None,
                        available: 0.0,
                        total_limit: 0.0,
                        total_used: 0.0,
                        ban_reason: Some(reason.to_string()),
                        error: None,
                    };
                }
            }
            return UsageCheckResult::error(format!(
                "usage probe returned {}: {}",
                status.as_u16(),
                String::from_utf8_lossy(&body)
            ));
        }

        let limits: UsageLimits = match serde_json::from_slice(&body) {
            Ok(l) => l,
            Err(e) => return UsageCheckResult::error(format!("usage body parse failed: {}", e)),
        };

        let (total_limit, total_used, available) = credit_totals(&limits);
        let status = if available > 0.0 {
            AccountStatus::Active
        } else {
            AccountStatus::Exhausted
        };

        debug!(
            %status,
            available,
            total_limit,
            total_used,
            email = %limits.user_info.email,
            "usage probe complete"
        );

        UsageCheckResult {
            status,
            usage_limits: Some(limits),
            available,
            total_limit,
            total_used,
            ban_reason: None,
            error: None,
        }
    }
}
