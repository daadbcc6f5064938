//! HTTP adapters for the billing and usage APIs of each account type.
//!
//! Every adapter normalizes its provider's response into the shared usage
//! shape and reports failures as [`ProviderError`] carrying the HTTP status
//! and a truncated response body.

pub mod claude_admin;
pub mod claude_web;
pub mod copilot;

use serde::Serialize;
use std::time::Duration;

const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{endpoint} returned {status}: {body}")]
    Http {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("request to {endpoint} failed: {source}")]
    Network {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The credential itself was rejected.
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// The credential is valid but cannot see this resource.
    pub fn is_no_access(&self) -> bool {
        matches!(self.status(), Some(403 | 404))
    }
}

/// Result of checking a credential before it is saved.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Verification {
    pub valid: bool,
    /// Which endpoint confirmed access, if any.
    pub source: Option<String>,
    pub error: Option<String>,
    /// Plan reported by the provider alongside the credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Verification {
    pub fn ok(source: impl Into<String>) -> Self {
        Self {
            valid: true,
            source: Some(source.into()),
            error: None,
            plan: None,
            display_name: None,
        }
    }

    pub fn with_profile(mut self, plan: Option<String>, display_name: Option<String>) -> Self {
        self.plan = plan;
        self.display_name = display_name;
        self
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            source: None,
            error: Some(error.into()),
            plan: None,
            display_name: None,
        }
    }
}

pub fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Send a request and decode a JSON body, mapping non-2xx to [`ProviderError::Http`].
pub(crate) async fn send_json(
    request: reqwest::RequestBuilder,
    endpoint: &str,
) -> Result<serde_json::Value, ProviderError> {
    let resp = request
        .send()
        .await
        .map_err(|source| ProviderError::Network {
            endpoint: endpoint.to_string(),
            source,
        })?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ProviderError::Http {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body: truncate_chars(&body, MAX_ERROR_BODY),
        });
    }
    resp.json().await.map_err(|e| ProviderError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

/// Read a JSON number that some endpoints encode as a string.
pub(crate) fn as_f64(value: &serde_json::Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

pub(crate) fn as_u64(value: &serde_json::Value) -> u64 {
    value
        .as_u64()
        .or_else(|| as_f64(value).filter(|v| *v >= 0.0).map(|v| v as u64))
        .unwrap_or(0)
}
