//! In-process stand-ins for the provider APIs, shared by unit tests.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::models::Period;
use crate::providers::claude_admin::{ClaudeAdminApi, DayRecord};
use crate::providers::claude_web::{ClaudeWebApi, OAuthProfile, SubscriptionUsage};
use crate::providers::copilot::{
    BillingSource, CopilotApi, CopilotUsage, GithubUser, SeatInfo, SourceOutcome,
};
use crate::providers::ProviderError;
use crate::token::{TokenError, TokenGrant, TokenRefresher};

pub fn http_error(status: u16) -> ProviderError {
    ProviderError::Http {
        endpoint: "mock".to_string(),
        status,
        body: format!("mock status {status}"),
    }
}

pub fn copilot_usage(gross: f64) -> CopilotUsage {
    CopilotUsage {
        gross_quantity: gross,
        included_quantity: gross,
        ..Default::default()
    }
}

/// Counts calls that are suspended at the same time.
#[derive(Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    /// Register a call and yield once so sibling futures get polled.
    pub async fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Unlisted sources answer 404.
pub struct MockCopilot {
    login: String,
    user_status: Option<u16>,
    orgs: Vec<String>,
    outcomes: HashMap<BillingSource, SourceOutcome>,
    seats: HashMap<String, SeatInfo>,
    usage_calls: Mutex<Vec<String>>,
    tokens: Mutex<Vec<String>>,
    user_calls: InFlight,
}

impl MockCopilot {
    pub fn new(login: &str) -> Self {
        Self {
            login: login.to_string(),
            user_status: None,
            orgs: Vec::new(),
            outcomes: HashMap::new(),
            seats: HashMap::new(),
            usage_calls: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            user_calls: InFlight::default(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new("").failing_user(401)
    }

    pub fn failing_user(mut self, status: u16) -> Self {
        self.user_status = Some(status);
        self
    }

    pub fn with(mut self, source: BillingSource, outcome: SourceOutcome) -> Self {
        self.outcomes.insert(source, outcome);
        self
    }

    pub fn with_orgs(mut self, orgs: &[&str]) -> Self {
        self.orgs = orgs.iter().map(|o| o.to_string()).collect();
        self
    }

    pub fn with_seat(mut self, org: &str, plan_type: &str) -> Self {
        self.seats.insert(
            org.to_string(),
            SeatInfo {
                plan_type: Some(plan_type.to_string()),
                last_activity_at: Some("2026-03-09T08:00:00Z".to_string()),
            },
        );
        self
    }

    /// Labels of the billing sources probed, in order.
    pub fn usage_calls(&self) -> Vec<String> {
        self.usage_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Most `/user` calls seen in flight at once.
    pub fn peak_user_calls(&self) -> usize {
        self.user_calls.peak()
    }

    /// Tokens presented to `/user`, in order.
    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CopilotApi for MockCopilot {
    async fn user(&self, token: &str) -> Result<GithubUser, ProviderError> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(token.to_string());
        self.user_calls.enter().await;
        if let Some(status) = self.user_status {
            return Err(http_error(status));
        }
        Ok(GithubUser {
            login: self.login.clone(),
            name: None,
            avatar_url: Some(format!("https://avatars.example/{}", self.login)),
        })
    }

    async fn orgs(&self, _token: &str) -> Result<Vec<String>, ProviderError> {
        Ok(self.orgs.clone())
    }

    async fn seat(
        &self,
        _token: &str,
        org: &str,
        _login: &str,
    ) -> Result<Option<SeatInfo>, ProviderError> {
        Ok(self.seats.get(org).cloned())
    }

    async fn usage(
        &self,
        _token: &str,
        _login: &str,
        source: &BillingSource,
        _period: Period,
    ) -> SourceOutcome {
        self.usage_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(source.label());
        self.outcomes
            .get(source)
            .cloned()
            .unwrap_or_else(|| SourceOutcome::NoAccess(http_error(404).to_string()))
    }
}

/// Unlisted days answer with no records.
#[derive(Default)]
pub struct MockClaudeAdmin {
    days: HashMap<NaiveDate, Result<Vec<DayRecord>, u16>>,
    requested: AtomicUsize,
    in_flight: InFlight,
}

impl MockClaudeAdmin {
    pub fn with_day(mut self, day: NaiveDate, records: Vec<DayRecord>) -> Self {
        self.days.insert(day, Ok(records));
        self
    }

    pub fn failing_day(mut self, day: NaiveDate, status: u16) -> Self {
        self.days.insert(day, Err(status));
        self
    }

    pub fn days_requested(&self) -> usize {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn peak_concurrent_days(&self) -> usize {
        self.in_flight.peak()
    }
}

#[async_trait]
impl ClaudeAdminApi for MockClaudeAdmin {
    async fn day_report(
        &self,
        _admin_key: &str,
        day: NaiveDate,
    ) -> Result<Vec<DayRecord>, ProviderError> {
        self.requested.fetch_add(1, Ordering::SeqCst);
        self.in_flight.enter().await;
        match self.days.get(&day) {
            Some(Ok(records)) => Ok(records.clone()),
            Some(Err(status)) => Err(http_error(*status)),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Default)]
pub struct MockClaudeWeb {
    usage: SubscriptionUsage,
    profile: OAuthProfile,
    fail_status: Option<u16>,
    tokens: Mutex<Vec<String>>,
}

impl MockClaudeWeb {
    pub fn with_usage(mut self, usage: SubscriptionUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_profile(mut self, profile: OAuthProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn failing(mut self, status: u16) -> Self {
        self.fail_status = Some(status);
        self
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ClaudeWebApi for MockClaudeWeb {
    async fn usage(&self, access_token: &str) -> Result<SubscriptionUsage, ProviderError> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(access_token.to_string());
        match self.fail_status {
            Some(status) => Err(http_error(status)),
            None => Ok(self.usage.clone()),
        }
    }

    async fn profile(&self, _access_token: &str) -> Result<OAuthProfile, ProviderError> {
        match self.fail_status {
            Some(status) => Err(http_error(status)),
            None => Ok(self.profile.clone()),
        }
    }
}

pub struct MockRefresher {
    grant: Option<TokenGrant>,
    calls: AtomicUsize,
    last: Mutex<Option<String>>,
}

impl MockRefresher {
    pub fn granting(access: &str, refresh: Option<&str>, expires_in: Option<i64>) -> Self {
        Self {
            grant: Some(TokenGrant {
                access_token: access.to_string(),
                refresh_token: refresh.map(String::from),
                expires_in,
            }),
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn invalid_grant() -> Self {
        Self {
            grant: None,
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_refresh_token(&self) -> Option<String> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl TokenRefresher for MockRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(refresh_token.to_string());
        self.grant.clone().ok_or(TokenError::InvalidGrant)
    }
}
