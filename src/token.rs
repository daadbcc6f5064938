//! OAuth access-token lifecycle for Claude subscription accounts.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::providers::{send_json, ProviderError};

/// Tokens are renewed this many minutes before they expire.
pub const REFRESH_BUFFER_MINUTES: i64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("refresh token rejected (invalid_grant); sign in again")]
    InvalidGrant,
    #[error("access token expired and no refresh token is stored")]
    MissingRefreshToken,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Response of a `grant_type=refresh_token` exchange.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// The pair was rotated and must be persisted before use.
    pub refreshed: bool,
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenError>;
}

pub struct AnthropicTokenRefresher {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
}

impl AnthropicTokenRefresher {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for AnthropicTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenError> {
        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": self.client_id,
        });
        let request = self.client.post(&self.token_url).json(&body);
        let value = send_json(request, "oauth/token")
            .await
            .map_err(classify_refresh_failure)?;
        serde_json::from_value(value).map_err(|e| {
            TokenError::Provider(ProviderError::Decode {
                endpoint: "oauth/token".to_string(),
                message: e.to_string(),
            })
        })
    }
}

fn classify_refresh_failure(err: ProviderError) -> TokenError {
    match &err {
        ProviderError::Http { status, body, .. }
            if (400..500).contains(status) && body.contains("invalid_grant") =>
        {
            TokenError::InvalidGrant
        }
        _ => TokenError::Provider(err),
    }
}

/// True when the expiry is unknown or within [`REFRESH_BUFFER_MINUTES`] of `now`.
pub fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires_at {
        Some(at) => now >= at - Duration::minutes(REFRESH_BUFFER_MINUTES),
        None => true,
    }
}

/// Return a usable access token, exchanging the refresh token if needed.
///
/// Accounts imported without a refresh token keep using their access token
/// until the provider rejects it.
pub async fn get_valid_token(
    refresher: &dyn TokenRefresher,
    access_token: &str,
    refresh_token: &str,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<ValidToken, TokenError> {
    let unchanged = || ValidToken {
        access_token: access_token.to_string(),
        refresh_token: refresh_token.to_string(),
        expires_at,
        refreshed: false,
    };
    if !access_token.is_empty() && !needs_refresh(expires_at, now) {
        return Ok(unchanged());
    }
    if refresh_token.is_empty() {
        if access_token.is_empty() || expires_at.is_some_and(|at| now >= at) {
            return Err(TokenError::MissingRefreshToken);
        }
        return Ok(unchanged());
    }

    let grant = refresher.refresh(refresh_token).await?;
    tracing::debug!(expires_in = ?grant.expires_in, "oauth token refreshed");
    Ok(ValidToken {
        access_token: grant.access_token,
        refresh_token: grant
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| refresh_token.to_string()),
        expires_at: grant.expires_in.map(|secs| now + Duration::seconds(secs)),
        refreshed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRefresher;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn refresh_buffer_is_five_minutes() {
        let now = now();
        assert!(needs_refresh(Some(now + Duration::minutes(4)), now));
        assert!(!needs_refresh(Some(now + Duration::minutes(10)), now));
        assert!(needs_refresh(Some(now + Duration::minutes(5)), now));
        assert!(needs_refresh(Some(now - Duration::minutes(1)), now));
        assert!(needs_refresh(None, now));
    }

    #[tokio::test]
    async fn fresh_token_is_returned_unchanged() {
        let refresher = MockRefresher::granting("new", Some("r2"), Some(3600));
        let expires = now() + Duration::hours(1);
        let t = get_valid_token(&refresher, "a", "r", Some(expires), now())
            .await
            .unwrap();
        assert!(!t.refreshed);
        assert_eq!(t.access_token, "a");
        assert_eq!(t.expires_at, Some(expires));
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn expiring_token_is_exchanged() {
        let refresher = MockRefresher::granting("new", Some("r2"), Some(3600));
        let t = get_valid_token(&refresher, "a", "r", Some(now() + Duration::minutes(2)), now())
            .await
            .unwrap();
        assert!(t.refreshed);
        assert_eq!(t.access_token, "new");
        assert_eq!(t.refresh_token, "r2");
        assert_eq!(t.expires_at, Some(now() + Duration::hours(1)));
        assert_eq!(refresher.last_refresh_token().as_deref(), Some("r"));
    }

    #[tokio::test]
    async fn missing_rotated_refresh_token_keeps_old_one() {
        let refresher = MockRefresher::granting("new", None, Some(60));
        let t = get_valid_token(&refresher, "a", "r", None, now()).await.unwrap();
        assert_eq!(t.refresh_token, "r");
    }

    #[tokio::test]
    async fn invalid_grant_is_terminal() {
        let refresher = MockRefresher::invalid_grant();
        let err = get_valid_token(&refresher, "a", "r", None, now())
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::InvalidGrant));
    }

    #[tokio::test]
    async fn no_refresh_token_uses_access_token_until_expiry() {
        let refresher = MockRefresher::granting("new", None, None);
        let t = get_valid_token(&refresher, "a", "", None, now()).await.unwrap();
        assert_eq!(t.access_token, "a");
        assert!(!t.refreshed);

        let err = get_valid_token(&refresher, "a", "", Some(now() - Duration::hours(1)), now())
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::MissingRefreshToken));
        assert_eq!(refresher.calls(), 0);
    }

    #[test]
    fn invalid_grant_detected_from_error_body() {
        let err = classify_refresh_failure(ProviderError::Http {
            endpoint: "oauth/token".into(),
            status: 400,
            body: r#"{"error":"invalid_grant","error_description":"revoked"}"#.into(),
        });
        assert!(matches!(err, TokenError::InvalidGrant));

        let err = classify_refresh_failure(ProviderError::Http {
            endpoint: "oauth/token".into(),
            status: 500,
            body: "invalid_grant".into(),
        });
        assert!(matches!(err, TokenError::Provider(_)));
    }
}
