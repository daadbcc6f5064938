use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::device_flow::DeviceFlowError;
use crate::models::{Account, AccountKind, AccountType, Period, Profile, UsageDetail, UsageHistory};
use crate::reconcile::RefreshError;

/// Account as shown to API clients. Credentials never leave the server;
/// only whether one is stored.
#[derive(Serialize, Debug)]
pub struct AccountView {
    pub id: i64,
    pub username: String,
    pub display_name: Option<String>,
    pub account_type: AccountType,
    pub plan: Option<String>,
    pub billing_org: Option<String>,
    pub is_paused: bool,
    pub is_favorite: bool,
    pub has_credential: bool,
    pub token_expires_at: Option<String>,
    pub profile: Profile,
    pub last_error: Option<String>,
    pub created_at: String,
    pub usage: Option<UsageView>,
}

#[derive(Serialize, Debug)]
pub struct UsageView {
    #[serde(flatten)]
    pub history: UsageHistory,
    pub details: Vec<UsageDetail>,
}

impl AccountView {
    pub fn new(account: Account, usage: Option<UsageView>) -> Self {
        let (has_credential, billing_org, token_expires_at) = match &account.kind {
            AccountKind::Copilot {
                pat_token,
                billing_org,
                ..
            } => (!pat_token.is_empty(), billing_org.clone(), None),
            AccountKind::ClaudeCode { admin_key, .. } => (!admin_key.is_empty(), None, None),
            AccountKind::ClaudeWeb {
                oauth_token,
                refresh_token,
                expires_at,
                ..
            } => (
                !oauth_token.is_empty() || !refresh_token.is_empty(),
                None,
                expires_at.map(|t| t.to_rfc3339()),
            ),
        };
        Self {
            id: account.id,
            account_type: account.account_type(),
            plan: account.kind.plan_label(),
            username: account.username,
            display_name: account.display_name,
            billing_org,
            is_paused: account.is_paused,
            is_favorite: account.is_favorite,
            has_credential,
            token_expires_at,
            profile: account.profile,
            last_error: account.last_error,
            created_at: account.created_at,
            usage,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug)]
pub struct CreateAccountRequest {
    pub account_type: AccountType,
    pub username: String,
    pub display_name: Option<String>,
    pub token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub plan: Option<String>,
    pub billing_org: Option<String>,
    /// Check the credential against the provider before saving.
    #[serde(default = "default_true")]
    pub verify: bool,
}

/// Partial update; absent fields are left alone. An empty string clears
/// `display_name`, `plan` and `billing_org`.
#[derive(Deserialize, Debug, Default)]
pub struct UpdateAccountRequest {
    pub display_name: Option<String>,
    pub is_paused: Option<bool>,
    pub is_favorite: Option<bool>,
    pub plan: Option<String>,
    pub billing_org: Option<String>,
    pub token: Option<String>,
    /// Claude web accounts only; replaces the stored refresh token.
    pub refresh_token: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct VerifyRequest {
    pub account_type: AccountType,
    pub token: String,
    #[serde(default)]
    pub identity: String,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct RefreshIntervalBody {
    pub minutes: u32,
}

#[derive(Deserialize, Debug)]
pub struct DevicePollRequest {
    pub session_id: String,
    /// Attach the token to this account instead of matching by login.
    pub account_id: Option<i64>,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct DevicePollResponse {
    pub status: &'static str,
    pub interval: Option<u64>,
    pub account_id: Option<i64>,
}

#[derive(Serialize, Debug)]
pub struct RefreshResponse {
    pub account_id: i64,
    pub period: Period,
    pub history_id: i64,
    pub usage: crate::models::UsageSnapshot,
}

/// JSON error body `{"error": "..."}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(id: i64) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("account {id} not found"))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        tracing::error!(error = %e, "api storage failure");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl From<RefreshError> for ApiError {
    fn from(e: RefreshError) -> Self {
        let status = match &e {
            RefreshError::NotFound(_) => StatusCode::NOT_FOUND,
            RefreshError::Storage(_) => return anyhow::Error::msg(e.to_string()).into(),
            RefreshError::Unavailable(_) => StatusCode::BAD_GATEWAY,
            RefreshError::NoCredential
            | RefreshError::CredentialInvalid(_)
            | RefreshError::BillingInaccessible(_)
            | RefreshError::ReauthRequired(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, e.to_string())
    }
}

impl From<DeviceFlowError> for ApiError {
    fn from(e: DeviceFlowError) -> Self {
        let status = match &e {
            DeviceFlowError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            DeviceFlowError::Rejected(_) => StatusCode::BAD_REQUEST,
            DeviceFlowError::Provider(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}
