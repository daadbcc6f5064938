//! GitHub OAuth device flow for obtaining Copilot tokens without pasting a PAT.

use serde::Serialize;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

use crate::providers::{send_json, ProviderError};
use crate::ttl_store::{MemoryTtlStore, TtlStore};

const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const SCOPES: &str = "read:user read:org manage_billing:copilot";
const MAX_SESSIONS: usize = 1_000;
/// Seconds added to the poll interval on `slow_down`.
const SLOW_DOWN_STEP: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DeviceFlowError {
    #[error("GitHub OAuth client id is not configured")]
    NotConfigured,
    #[error("GitHub rejected the device flow request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// What the user needs to complete sign-in in a browser.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DeviceStart {
    pub session_id: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    pub interval: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Pending,
    SlowDown { interval: u64 },
    Complete(Zeroizing<String>),
    Expired,
    Denied,
}

#[derive(Clone)]
struct Session {
    device_code: Zeroizing<String>,
    interval: u64,
    expires_at: Instant,
}

pub struct DeviceFlow {
    client: reqwest::Client,
    web_base: String,
    client_id: Option<String>,
    sessions: MemoryTtlStore<String, Session>,
}

impl DeviceFlow {
    pub fn new(
        client: reqwest::Client,
        web_base: impl Into<String>,
        client_id: Option<String>,
    ) -> Self {
        Self {
            client,
            web_base: web_base.into().trim_end_matches('/').to_string(),
            client_id: client_id.filter(|c| !c.trim().is_empty()),
            sessions: MemoryTtlStore::new(MAX_SESSIONS),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client_id.is_some()
    }

    fn client_id(&self) -> Result<&str, DeviceFlowError> {
        self.client_id
            .as_deref()
            .ok_or(DeviceFlowError::NotConfigured)
    }

    pub async fn start(&self) -> Result<DeviceStart, DeviceFlowError> {
        let client_id = self.client_id()?;
        let path = "/login/device/code";
        let request = self
            .client
            .post(format!("{}{path}", self.web_base))
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[("client_id", client_id), ("scope", SCOPES)]);
        let body = send_json(request, path).await?;
        if let Some(error) = body["error"].as_str() {
            return Err(DeviceFlowError::Rejected(error.to_string()));
        }

        let field = |name: &str| {
            body[name]
                .as_str()
                .map(String::from)
                .ok_or_else(|| ProviderError::Decode {
                    endpoint: path.to_string(),
                    message: format!("missing {name}"),
                })
        };
        let device_code = field("device_code")?;
        let user_code = field("user_code")?;
        let verification_uri = field("verification_uri")?;
        let expires_in = body["expires_in"].as_u64().unwrap_or(900);
        let interval = body["interval"].as_u64().unwrap_or(5);

        let session_id = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();
        let ttl = Duration::from_secs(expires_in);
        self.sessions.set(
            session_id.clone(),
            Session {
                device_code: Zeroizing::new(device_code),
                interval,
                expires_at: now + ttl,
            },
            ttl,
            now,
        );
        tracing::info!(session = %session_id, "github device flow started");
        Ok(DeviceStart {
            session_id,
            user_code,
            verification_uri,
            expires_in,
            interval,
        })
    }

    /// Exchange the session's device code. Finished sessions are removed.
    pub async fn poll(&self, session_id: &str) -> Result<PollStatus, DeviceFlowError> {
        let client_id = self.client_id()?;
        let key = session_id.to_string();
        let Some(session) = self.sessions.get(&key, Instant::now()) else {
            return Ok(PollStatus::Expired);
        };

        let path = "/login/oauth/access_token";
        let request = self
            .client
            .post(format!("{}{path}", self.web_base))
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", client_id),
                ("device_code", session.device_code.as_str()),
                ("grant_type", DEVICE_GRANT),
            ]);
        let body = send_json(request, path).await?;
        let status = classify_poll(&body, session.interval);

        match &status {
            PollStatus::Pending => {}
            PollStatus::SlowDown { interval } => {
                let now = Instant::now();
                let remaining = session.expires_at.saturating_duration_since(now);
                let updated = Session {
                    interval: *interval,
                    ..session
                };
                self.sessions.set(key, updated, remaining, now);
            }
            PollStatus::Complete(_) | PollStatus::Expired | PollStatus::Denied => {
                self.sessions.delete(&key);
                tracing::info!(
                    session = %session_id,
                    outcome = status_name(&status),
                    "github device flow finished"
                );
            }
        }
        Ok(status)
    }

    pub fn sweep(&self) -> usize {
        self.sessions.sweep(Instant::now())
    }
}

fn status_name(status: &PollStatus) -> &'static str {
    match status {
        PollStatus::Pending => "pending",
        PollStatus::SlowDown { .. } => "slow_down",
        PollStatus::Complete(_) => "complete",
        PollStatus::Expired => "expired",
        PollStatus::Denied => "denied",
    }
}

fn classify_poll(body: &serde_json::Value, interval: u64) -> PollStatus {
    if let Some(token) = body["access_token"].as_str().filter(|t| !t.is_empty()) {
        return PollStatus::Complete(Zeroizing::new(token.to_string()));
    }
    match body["error"].as_str() {
        Some("authorization_pending") | None => PollStatus::Pending,
        Some("slow_down") => PollStatus::SlowDown {
            interval: body["interval"]
                .as_u64()
                .unwrap_or(interval + SLOW_DOWN_STEP),
        },
        Some("access_denied") => PollStatus::Denied,
        Some(_) => PollStatus::Expired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_poll_responses() {
        assert_eq!(
            classify_poll(&json!({ "error": "authorization_pending" }), 5),
            PollStatus::Pending
        );
        assert_eq!(
            classify_poll(&json!({ "error": "slow_down" }), 5),
            PollStatus::SlowDown { interval: 10 }
        );
        assert_eq!(
            classify_poll(&json!({ "error": "slow_down", "interval": 15 }), 5),
            PollStatus::SlowDown { interval: 15 }
        );
        assert_eq!(
            classify_poll(&json!({ "error": "expired_token" }), 5),
            PollStatus::Expired
        );
        assert_eq!(
            classify_poll(&json!({ "error": "access_denied" }), 5),
            PollStatus::Denied
        );
        assert_eq!(
            classify_poll(&json!({ "access_token": "gho_x", "token_type": "bearer" }), 5),
            PollStatus::Complete(Zeroizing::new("gho_x".to_string()))
        );
    }

    #[tokio::test]
    async fn unconfigured_flow_refuses_to_start() {
        let flow = DeviceFlow::new(reqwest::Client::new(), "http://127.0.0.1:9", None);
        assert!(!flow.is_configured());
        assert!(matches!(
            flow.start().await,
            Err(DeviceFlowError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn unknown_session_is_expired() {
        let flow = DeviceFlow::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            Some("Iv1.test".to_string()),
        );
        assert_eq!(flow.poll("missing").await.unwrap(), PollStatus::Expired);
    }
}
