use async_trait::async_trait;

use super::{as_f64, send_json, ProviderError, Verification};
use crate::models::{round1, UsageSnapshot};

const OAUTH_BETA: &str = "oauth-2025-04-20";
const USAGE_PATH: &str = "/api/oauth/usage";
const PROFILE_PATH: &str = "/api/oauth/profile";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageWindow {
    pub utilization: f64,
    pub resets_at: Option<String>,
}

impl UsageWindow {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        Some(Self {
            utilization: as_f64(&value["utilization"]).unwrap_or(0.0),
            resets_at: value["resets_at"].as_str().map(String::from),
        })
    }
}

/// Pay-as-you-go overage, in dollars.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraUsage {
    pub limit: f64,
    pub spent: f64,
}

impl ExtraUsage {
    pub fn balance(&self) -> f64 {
        self.limit - self.spent
    }
}

/// Rolling-window utilization of a Claude Pro/Max subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionUsage {
    pub five_hour: Option<UsageWindow>,
    pub seven_day: Option<UsageWindow>,
    pub seven_day_opus: Option<UsageWindow>,
    pub extra: Option<ExtraUsage>,
}

impl SubscriptionUsage {
    pub fn from_json(body: &serde_json::Value) -> Self {
        let extra = &body["extra_usage"];
        let extra = (extra["is_enabled"].as_bool() == Some(true)).then(|| ExtraUsage {
            limit: as_f64(&extra["monthly_limit"]).unwrap_or(0.0) / 100.0,
            spent: as_f64(&extra["used_credits"]).unwrap_or(0.0) / 100.0,
        });
        Self {
            five_hour: UsageWindow::from_json(&body["five_hour"]),
            seven_day: UsageWindow::from_json(&body["seven_day"]),
            seven_day_opus: UsageWindow::from_json(&body["seven_day_opus"]),
            extra,
        }
    }

    /// The headline percentage is the weekly window.
    pub fn to_usage(&self) -> UsageSnapshot {
        let pct = |w: &Option<UsageWindow>| w.as_ref().map(|w| round1(w.utilization));
        UsageSnapshot {
            percentage: pct(&self.seven_day).unwrap_or(0.0),
            session_percent: pct(&self.five_hour),
            weekly_percent: pct(&self.seven_day),
            opus_percent: pct(&self.seven_day_opus),
            session_resets_at: self.five_hour.as_ref().and_then(|w| w.resets_at.clone()),
            weekly_resets_at: self.seven_day.as_ref().and_then(|w| w.resets_at.clone()),
            extra_usage_limit: self.extra.as_ref().map(|e| e.limit),
            extra_usage_spent: self.extra.as_ref().map(|e| e.spent),
            extra_usage_balance: self.extra.as_ref().map(ExtraUsage::balance),
            cost_usd: self.extra.as_ref().map(|e| e.spent).unwrap_or(0.0),
            source: Some("oauth_usage".to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OAuthProfile {
    pub email: Option<String>,
    pub display_name: Option<String>,
    /// `max`, `pro` or `None` for free accounts.
    pub plan: Option<String>,
}

impl OAuthProfile {
    pub fn from_json(body: &serde_json::Value) -> Self {
        let account = &body["account"];
        let plan = if account["has_claude_max"].as_bool() == Some(true) {
            Some("max".to_string())
        } else if account["has_claude_pro"].as_bool() == Some(true) {
            Some("pro".to_string())
        } else {
            None
        };
        Self {
            email: account["email"]
                .as_str()
                .or_else(|| account["email_address"].as_str())
                .map(String::from),
            display_name: account["display_name"]
                .as_str()
                .or_else(|| account["full_name"].as_str())
                .map(String::from),
            plan,
        }
    }
}

#[async_trait]
pub trait ClaudeWebApi: Send + Sync {
    async fn usage(&self, access_token: &str) -> Result<SubscriptionUsage, ProviderError>;

    async fn profile(&self, access_token: &str) -> Result<OAuthProfile, ProviderError>;
}

pub struct AnthropicOAuthClient {
    client: reqwest::Client,
    base: String,
}

impl AnthropicOAuthClient {
    pub fn new(client: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    fn get(&self, token: &str, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{path}", self.base))
            .bearer_auth(token)
            .header("anthropic-beta", OAUTH_BETA)
    }
}

#[async_trait]
impl ClaudeWebApi for AnthropicOAuthClient {
    async fn usage(&self, access_token: &str) -> Result<SubscriptionUsage, ProviderError> {
        let body = send_json(self.get(access_token, USAGE_PATH), USAGE_PATH).await?;
        Ok(SubscriptionUsage::from_json(&body))
    }

    async fn profile(&self, access_token: &str) -> Result<OAuthProfile, ProviderError> {
        let body = send_json(self.get(access_token, PROFILE_PATH), PROFILE_PATH).await?;
        Ok(OAuthProfile::from_json(&body))
    }
}

/// Check the token works and, when `identity` is given, that it belongs to it.
pub async fn verify(api: &dyn ClaudeWebApi, access_token: &str, identity: &str) -> Verification {
    let profile = match api.profile(access_token).await {
        Ok(p) => p,
        Err(e) if e.is_unauthorized() => {
            return Verification::invalid("Anthropic rejected the OAuth token")
        }
        Err(e) => return Verification::invalid(e.to_string()),
    };
    let identity = identity.trim();
    if let Some(email) = profile.email.as_deref() {
        if !identity.is_empty() && !email.eq_ignore_ascii_case(identity) {
            return Verification::invalid(format!("token belongs to {email}, not {identity}"));
        }
    }
    Verification::ok("oauth_profile").with_profile(profile.plan, profile.display_name)
}
